//! Coverage gate: run the hypervisor's unit tests under kcov and fail unless
//! line coverage sits within a small delta of the per-vendor target.

use std::path::PathBuf;

use anyhow::Context;

mod kcov;
mod report;

const KCOV_TARGET_RELPATH: &str = "build/cargo_target/kcov";
const KCOV_OUTPUT_RELPATH: &str = "build/kcov_output";
/// Left behind by the vmm build script; stale copies break the kcov link.
const SECCOMPILER_BUILD_RELPATH: &str = "build/seccompiler";

/// `root` is the hypervisor's repository root, where `cargo kcov` runs. The
/// seccompiler build dir sits under `root/build`, i.e. `../build` as seen
/// from the integration tests directory.
#[derive(Debug)]
struct GateConfig {
    root: PathBuf,
    output: PathBuf,
    rustflags: String,
}

impl GateConfig {
    fn from_env() -> anyhow::Result<Self> {
        let root = match std::env::var_os("MICROVM_COVERAGE_ROOT").filter(|v| !v.is_empty()) {
            Some(v) => PathBuf::from(v),
            None => std::env::current_dir().context("resolve current directory")?,
        };
        let output = std::env::var_os("MICROVM_COVERAGE_OUT")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join(KCOV_OUTPUT_RELPATH));
        let rustflags = std::env::var("MICROVM_COVERAGE_RUSTFLAGS").unwrap_or_default();
        Ok(Self {
            root,
            output,
            rustflags,
        })
    }

    fn seccompiler_dir(&self) -> PathBuf {
        self.root.join(SECCOMPILER_BUILD_RELPATH)
    }

    fn kcov_target_dir(&self) -> PathBuf {
        self.root.join(KCOV_TARGET_RELPATH)
    }
}

async fn detect_vendor() -> anyhow::Result<report::Vendor> {
    let cpuinfo = tokio::fs::read_to_string("/proc/cpuinfo")
        .await
        .context("read /proc/cpuinfo")?;
    let model = report::processor_model(&cpuinfo, std::env::consts::ARCH)
        .context("could not get processor model")?;
    report::Vendor::from_model(&model)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log = microvm_harness::logging::init();

    let cfg = GateConfig::from_env()?;
    let vendor = detect_vendor().await?;
    tracing::info!(vendor = vendor.name(), target = vendor.target_pct(), "coverage target");

    let run = kcov::KcovRun {
        rustflags: cfg.rustflags.clone(),
        target_dir: cfg.kcov_target_dir(),
        target: kcov::musl_target(),
        output: cfg.output.clone(),
        cargo_home: kcov::cargo_home(),
    };

    let seccompiler = cfg.seccompiler_dir();
    kcov::remove_dir_if_present(&seccompiler).await?;
    let ran = run.run(&cfg.root).await;
    kcov::remove_dir_if_present(&seccompiler).await?;
    ran?;

    let coverage_file = cfg.output.join(report::COVERAGE_FILE);
    let contents = tokio::fs::read_to_string(&coverage_file)
        .await
        .with_context(|| format!("read {}", coverage_file.display()))?;
    let lines = report::parse_index_js(&contents)?;
    let pct = lines.percent();

    tracing::info!(
        total_lines = lines.total,
        covered_lines = lines.covered,
        coverage = %format_args!("{pct:.2}%"),
        "kcov coverage"
    );

    report::check(pct, vendor).map_err(|e| {
        tracing::error!(error = %microvm_harness::support::format_error_chain(&e), "coverage gate failed");
        e
    })?;

    println!(
        "{pct}% (target {}% +/- {}%)",
        vendor.target_pct(),
        report::MAX_DELTA * 100.0
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_dirs_sit_under_the_repository_root() {
        let repo = tempfile::tempdir().unwrap();
        let tests_dir = repo.path().join("tests");
        std::fs::create_dir_all(repo.path().join("build/seccompiler")).unwrap();
        std::fs::create_dir_all(&tests_dir).unwrap();

        let cfg = GateConfig {
            root: repo.path().to_path_buf(),
            output: repo.path().join(KCOV_OUTPUT_RELPATH),
            rustflags: String::new(),
        };
        // Same directory the integration tests reach as ../build/seccompiler.
        assert_eq!(
            cfg.seccompiler_dir().canonicalize().unwrap(),
            tests_dir.join("../build/seccompiler").canonicalize().unwrap()
        );
        assert_eq!(cfg.kcov_target_dir(), repo.path().join("build/cargo_target/kcov"));
    }
}
