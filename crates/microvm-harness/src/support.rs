use std::{path::PathBuf, str::FromStr, time::Duration};

const DEFAULT_CHROOT_BASE: &str = "/srv/jailer";
const DEFAULT_SCREEN_LOG_DIR: &str = "/tmp";

/// A numeric tunable: unset or unparsable gives `default`, anything else is
/// pulled into `min..=max`.
fn env_clamped<T>(name: &str, min: T, max: T, default: T) -> T
where
    T: FromStr + Ord,
{
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .map_or(default, |v| v.clamp(min, max))
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

pub(crate) fn chroot_base() -> PathBuf {
    env_path("MICROVM_CHROOT_BASE").unwrap_or_else(|| PathBuf::from(DEFAULT_CHROOT_BASE))
}

pub(crate) fn screen_log_dir() -> PathBuf {
    env_path("MICROVM_SCREEN_LOG_DIR").unwrap_or_else(|| PathBuf::from(DEFAULT_SCREEN_LOG_DIR))
}

pub(crate) fn api_timeout() -> Duration {
    Duration::from_millis(env_clamped("MICROVM_API_TIMEOUT_MS", 100, 10 * 60 * 1000, 10_000))
}

pub(crate) fn monitor_sample_interval() -> Duration {
    Duration::from_millis(env_clamped("MICROVM_MONITOR_SAMPLE_MS", 50, 60_000, 500))
}

pub(crate) fn memory_overhead_threshold_mib() -> u64 {
    env_clamped("MICROVM_MEMORY_OVERHEAD_MIB", 1, 64 * 1024, 5)
}

/// The context chain of `err` on one line, with repeated messages folded.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts: Vec<String> = Vec::new();
    for msg in err.chain().map(|c| c.to_string()).filter(|m| !m.is_empty()) {
        if parts.last() != Some(&msg) {
            parts.push(msg);
        }
    }
    if parts.is_empty() {
        return "unknown error".to_string();
    }
    parts.join(": ")
}

/// Poll `check` up to `tries` times, sleeping `delay` between attempts.
pub(crate) async fn poll_until<F>(tries: u32, delay: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for attempt in 1..=tries {
        if check() {
            return true;
        }
        if attempt < tries {
            tokio::time::sleep(delay).await;
        }
    }
    false
}

/// Send SIGKILL to `pid`. Returns false if the process did not exist.
pub(crate) fn kill_pid(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    rc == 0
}

pub(crate) fn pid_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM still means the pid is taken.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
