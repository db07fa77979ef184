//! Logging initialisation for harness users (test binaries, the coverage gate).
//!
//! Output goes to stderr, filtered by `RUST_LOG` (default `info`). When
//! `MICROVM_LOG_DIR` is set, logs are also written to `<dir>/microvm-harness.log`.
//!
//! Safe to call from every test: only the first call installs a subscriber.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init() -> LogGuard {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_guard = match std::env::var_os("MICROVM_LOG_DIR").filter(|v| !v.is_empty()) {
        Some(dir) => {
            let dir = std::path::PathBuf::from(dir);
            let _ = std::fs::create_dir_all(&dir);
            let file_appender = tracing_appender::rolling::never(dir, "microvm-harness.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

            let installed = tracing_subscriber::registry()
                .with(filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(file_layer)
                .try_init()
                .is_ok();
            installed.then_some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init();
            None
        }
    };

    LogGuard {
        _file_guard: file_guard,
    }
}
