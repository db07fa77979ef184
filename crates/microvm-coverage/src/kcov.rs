use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::process::Command;

/// Sources kcov should not count. Several of these are generated bindings.
const EXCLUDE_PATTERNS: &[&str] = &[
    "build/",
    "tests/",
    "usr/lib/gcc",
    "lib/x86_64-linux-gnu/",
    "test_utils.rs",
    "bootparam.rs",
    "elf.rs",
    "mpspec.rs",
    "msr_index.rs",
    "bindings.rs",
    "_gen",
];

const EXCLUDE_REGION: &str = "mod tests {";

#[derive(Debug, Clone)]
pub struct KcovRun {
    pub rustflags: String,
    pub target_dir: PathBuf,
    pub target: String,
    pub output: PathBuf,
    pub cargo_home: PathBuf,
}

pub fn musl_target() -> String {
    format!("{}-unknown-linux-musl", std::env::consts::ARCH)
}

/// `$CARGO_HOME`, or `$HOME/.cargo/`.
pub fn cargo_home() -> PathBuf {
    if let Some(v) = std::env::var_os("CARGO_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(v);
    }
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
    home.join(".cargo/")
}

impl KcovRun {
    /// `cargo kcov` adds `--exclude-pattern=$CARGO_HOME --verify` only when
    /// no kcov arguments are given, so both are repeated here.
    pub fn args(&self) -> Vec<String> {
        let mut patterns = vec![self.cargo_home.display().to_string()];
        patterns.extend(EXCLUDE_PATTERNS.iter().map(|p| p.to_string()));

        vec![
            "kcov".to_string(),
            "--all".to_string(),
            "--target".to_string(),
            self.target.clone(),
            "--output".to_string(),
            self.output.display().to_string(),
            "--".to_string(),
            format!("--exclude-pattern={}", patterns.join(",")),
            format!("--exclude-region={EXCLUDE_REGION}"),
            "--verify".to_string(),
        ]
    }

    pub fn command(&self, workdir: &Path) -> Command {
        let mut cmd = Command::new("cargo");
        cmd.current_dir(workdir)
            .env("CARGO_WRAPPER", "kcov")
            .env("RUSTFLAGS", &self.rustflags)
            .env("CARGO_TARGET_DIR", &self.target_dir)
            .args(self.args());
        cmd
    }

    pub async fn run(&self, workdir: &Path) -> anyhow::Result<()> {
        tracing::info!(
            target = %self.target,
            output = %self.output.display(),
            "running cargo kcov"
        );
        let status = self
            .command(workdir)
            .status()
            .await
            .context("run cargo kcov")?;
        if !status.success() {
            anyhow::bail!("cargo kcov exited with {status}");
        }
        Ok(())
    }
}

/// Remove a directory tree, treating "already gone" as success.
pub async fn remove_dir_if_present(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}
