//! Reading the kcov summary and judging it against the per-vendor target.

use anyhow::Context;
use regex::Regex;

pub const COVERAGE_FILE: &str = "index.js";
pub const MAX_DELTA: f64 = 0.05;

const COVERED_LINES_PATTERN: &str = r#""covered_lines":"(\d+)""#;
const TOTAL_LINES_PATTERN: &str = r#""total_lines" : "(\d+)""#;

/// Coverage differs per CPU vendor (e.g. the brand string only carries a
/// frequency on Intel), so each has its own target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Intel,
    Amd,
    Arm,
}

impl Vendor {
    const ALL: [Vendor; 3] = [Vendor::Intel, Vendor::Amd, Vendor::Arm];

    pub fn name(self) -> &'static str {
        match self {
            Vendor::Intel => "Intel",
            Vendor::Amd => "AMD",
            Vendor::Arm => "ARM",
        }
    }

    pub fn target_pct(self) -> f64 {
        match self {
            Vendor::Intel => 84.80,
            Vendor::Amd => 84.12,
            Vendor::Arm => 83.12,
        }
    }

    /// The single vendor named in `model`; ambiguous or unknown models fail.
    pub fn from_model(model: &str) -> anyhow::Result<Self> {
        let found: Vec<Vendor> = Self::ALL
            .into_iter()
            .filter(|v| model.contains(v.name()))
            .collect();
        match found.as_slice() {
            [v] => Ok(*v),
            _ => anyhow::bail!("could not get processor vendor from model {model:?}"),
        }
    }
}

/// Processor model from `/proc/cpuinfo` contents. Arm hosts have no
/// `model name` line.
pub fn processor_model(cpuinfo: &str, arch: &str) -> Option<String> {
    let model = cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "model name").then(|| value.trim().to_string())
    });
    match model {
        Some(m) => Some(m),
        None if arch == "aarch64" => Some("ARM".to_string()),
        None => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCoverage {
    pub covered: u64,
    pub total: u64,
}

impl LineCoverage {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.covered as f64 / self.total as f64 * 100.0
    }
}

/// Group 1 of the first match of `pattern` in `contents`.
fn first_count(contents: &str, pattern: &str) -> anyhow::Result<Option<u64>> {
    let re = Regex::new(pattern).with_context(|| format!("compile {pattern:?}"))?;
    let Some(caps) = re.captures(contents) else {
        return Ok(None);
    };
    caps[1]
        .parse()
        .map(Some)
        .with_context(|| format!("count out of range in {:?}", &caps[0]))
}

pub fn parse_index_js(contents: &str) -> anyhow::Result<LineCoverage> {
    let covered = first_count(contents, COVERED_LINES_PATTERN)?
        .context("no covered_lines in kcov report")?;
    let total = first_count(contents, TOTAL_LINES_PATTERN)?
        .context("no total_lines in kcov report")?;
    Ok(LineCoverage { covered, total })
}

/// Coverage must stay within `MAX_DELTA` of the target on both sides; going
/// above means the target should be raised.
pub fn check(coverage_pct: f64, vendor: Vendor) -> anyhow::Result<()> {
    let target = vendor.target_pct();
    if coverage_pct < target - MAX_DELTA {
        anyhow::bail!(
            "Current code coverage ({coverage_pct:.2}%) is >{MAX_DELTA:.2}% below the target ({target}%)."
        );
    }
    if coverage_pct > target + MAX_DELTA {
        anyhow::bail!(
            "Current code coverage ({coverage_pct:.2}%) is >{MAX_DELTA:.2}% above the target ({target}%).\n\
             Please update the {} coverage target.",
            vendor.name()
        );
    }
    Ok(())
}
