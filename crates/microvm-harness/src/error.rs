use std::path::PathBuf;

/// Failures a test driving a microVM can observe.
///
/// These travel inside `anyhow::Error`; use `err.downcast_ref::<HarnessError>()`
/// to branch on the kind.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("failed to launch {binary}: {reason}")]
    LaunchFailure { binary: PathBuf, reason: String },

    #[error("timed out waiting for {what}")]
    ReadinessTimeout { what: String },

    #[error("{method} {path} returned {status}: {body}")]
    CallFailure {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    #[error("the console vanished before the test completed")]
    ConsoleHangup,

    #[error("no {terminator:?} on the serial console within {timeout_ms}ms (read so far: {received:?})")]
    ConsoleTimeout {
        terminator: String,
        timeout_ms: u128,
        received: String,
    },

    #[error("console monitor i/o error: {0}")]
    MonitorIo(String),

    #[error("microvm {0} has not been spawned")]
    NotSpawned(String),

    #[error("unexpected instance state: {0}")]
    InvalidState(String),

    #[error("{monitor} sample check failed: {reason}")]
    SampleCheck { monitor: &'static str, reason: String },
}

impl HarnessError {
    pub fn is_call_failure(&self) -> bool {
        matches!(self, HarnessError::CallFailure { .. })
    }
}
