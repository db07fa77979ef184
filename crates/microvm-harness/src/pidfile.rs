use std::path::Path;

pub const PID_FILE_NAME: &str = "firecracker.pid";

/// PID of the hypervisor inside its own PID namespace, as written by the
/// jailer under `jail_root`.
///
/// `None` when the instance was not cloned into a new PID namespace, or the
/// file has not been written yet. Callers decide how long to keep asking.
pub fn resolve_namespaced_pid(jail_root: &Path) -> Option<i32> {
    read_pid_file(&jail_root.join(PID_FILE_NAME))
}

pub(crate) fn read_pid_file(path: &Path) -> Option<i32> {
    let contents = match std::fs::read_to_string(path) {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read pid file");
            return None;
        }
    };

    let first = contents.lines().next().unwrap_or_default().trim();
    match first.parse::<i32>() {
        Ok(pid) if pid > 0 => Some(pid),
        _ => {
            // The jailer may still be writing it.
            tracing::debug!(path = %path.display(), contents = %first, "pid file not parseable yet");
            None
        }
    }
}
