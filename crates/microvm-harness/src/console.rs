//! Background tailing of a microVM's log FIFO into an in-memory buffer.

use std::{
    io::{BufRead, BufReader as StdBufReader},
    os::unix::fs::{FileTypeExt, OpenOptionsExt},
    path::{Path, PathBuf},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use regex::Regex;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::Mutex,
    task::JoinHandle,
};

use crate::HarnessError;

const EOF_BACKOFF: Duration = Duration::from_millis(50);

/// Everything the guest and the VMM logged, in arrival order. Nothing is ever
/// evicted, so a check can always see output from early boot.
#[derive(Debug, Default)]
pub struct LogBuffer {
    data: String,
}

impl LogBuffer {
    pub fn push_line(&mut self, line: &str) {
        self.data.push_str(line);
        self.data.push('\n');
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.data.contains(needle)
    }

    /// Every match of `pattern` in the log. With a capture group, group 1 is
    /// returned instead of the whole match (an unmatched group yields "").
    pub fn find_all(&self, pattern: &Regex) -> Vec<String> {
        let grouped = pattern.captures_len() > 1;
        pattern
            .captures_iter(&self.data)
            .map(|caps| {
                let m = if grouped { caps.get(1) } else { caps.get(0) };
                m.map(|m| m.as_str().to_string()).unwrap_or_default()
            })
            .collect()
    }

    pub fn text(&self) -> &str {
        &self.data
    }
}

/// The log state a microVM shares with its console monitor.
///
/// The microVM holds the only strong reference; the monitor only ever sees a
/// `Weak`, so dropping the microVM is observable from the monitor task.
#[derive(Debug)]
pub struct LogSink {
    microvm_id: String,
    buffer: Mutex<LogBuffer>,
}

impl LogSink {
    pub fn new(microvm_id: impl Into<String>) -> Self {
        Self {
            microvm_id: microvm_id.into(),
            buffer: Mutex::new(LogBuffer::default()),
        }
    }

    pub fn microvm_id(&self) -> &str {
        &self.microvm_id
    }

    pub async fn append(&self, line: impl AsRef<str>) {
        self.buffer.lock().await.push_line(line.as_ref());
    }

    pub async fn contains(&self, needle: &str) -> bool {
        self.buffer.lock().await.contains(needle)
    }

    pub async fn find_all(&self, pattern: &Regex) -> Vec<String> {
        self.buffer.lock().await.find_all(pattern)
    }

    pub async fn text(&self) -> String {
        self.buffer.lock().await.text().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl MonitorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => MonitorState::Created,
            1 => MonitorState::Running,
            2 => MonitorState::Stopping,
            _ => MonitorState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            MonitorState::Created => 0,
            MonitorState::Running => 1,
            MonitorState::Stopping => 2,
            MonitorState::Stopped => 3,
        }
    }
}

#[derive(Debug, Default)]
struct MonitorShared {
    state: AtomicU8,
    stop: AtomicBool,
}

impl MonitorShared {
    fn set(&self, state: MonitorState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn get(&self) -> MonitorState {
        MonitorState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Tails a line-oriented stream into a [`LogSink`] from a tokio task.
///
/// Stopping is advisory: a read already in flight is not interrupted, so one
/// more line may land in the buffer after [`ConsoleMonitor::stop`].
#[derive(Debug, Default)]
pub struct ConsoleMonitor {
    shared: Arc<MonitorShared>,
    path: Option<PathBuf>,
    task: Option<JoinHandle<()>>,
}

impl ConsoleMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MonitorState {
        self.shared.get()
    }

    pub fn is_running(&self) -> bool {
        self.state() == MonitorState::Running
    }

    /// Start tailing `path` (which must already exist) into `owner`.
    pub fn start(&mut self, path: &Path, owner: &Arc<LogSink>) -> anyhow::Result<()> {
        if self.state() != MonitorState::Created {
            anyhow::bail!("console monitor already started");
        }
        std::fs::metadata(path)
            .with_context(|| format!("console stream {} does not exist", path.display()))?;

        self.shared.set(MonitorState::Running);
        self.path = Some(path.to_path_buf());
        let task = tokio::spawn(monitor_stream(
            path.to_path_buf(),
            Arc::downgrade(owner),
            self.shared.clone(),
        ));
        self.task = Some(task);
        Ok(())
    }

    pub fn stop(&self) {
        if matches!(self.state(), MonitorState::Created | MonitorState::Stopped) {
            return;
        }
        self.shared.stop.store(true, Ordering::SeqCst);
        if self.state() == MonitorState::Running {
            self.shared.set(MonitorState::Stopping);
        }
        if let Some(path) = &self.path {
            unblock_fifo_reader(path);
        }
    }

    /// Wait for the task to finish, up to `timeout`. Returns true if it did.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let Some(task) = self.task.as_mut() else {
            return true;
        };
        match tokio::time::timeout(timeout, task).await {
            Ok(_) => {
                self.task = None;
                true
            }
            Err(_) => false,
        }
    }
}

/// A reader blocked opening a FIFO wakes up once a writer appears; opening
/// and closing a non-blocking write end delivers that plus an EOF.
fn unblock_fifo_reader(path: &Path) {
    let is_fifo = std::fs::metadata(path)
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false);
    if !is_fifo {
        return;
    }
    let _ = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path);
}

async fn monitor_stream(path: PathBuf, owner: Weak<LogSink>, shared: Arc<MonitorShared>) {
    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            record_io_error(&owner, &path, &e).await;
            shared.set(MonitorState::Stopped);
            return;
        }
    };

    let mut lines = BufReader::new(file).lines();
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                let Some(sink) = owner.upgrade() else {
                    // Owner is gone; nothing to report to.
                    break;
                };
                sink.append(line).await;
            }
            Ok(None) => {
                if owner.strong_count() == 0 {
                    break;
                }
                tokio::time::sleep(EOF_BACKOFF).await;
            }
            Err(e) => {
                record_io_error(&owner, &path, &e).await;
                break;
            }
        }
    }

    shared.set(MonitorState::Stopped);
}

async fn record_io_error(owner: &Weak<LogSink>, path: &Path, err: &std::io::Error) {
    let Some(sink) = owner.upgrade() else {
        return;
    };
    let err = HarnessError::MonitorIo(err.to_string());
    tracing::error!(
        microvm_id = %sink.microvm_id(),
        path = %path.display(),
        error = %err,
        "error while monitoring console stream"
    );
    sink.append(err.to_string()).await;
}

/// A named pipe used for the hypervisor's log or metrics output.
#[derive(Debug)]
pub struct Fifo {
    path: PathBuf,
}

impl Fifo {
    /// Create the pipe, replacing a stale one left at `path`.
    pub fn create(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        use std::os::unix::ffi::OsStrExt;

        let path = path.into();
        if std::fs::symlink_metadata(&path).is_ok() {
            std::fs::remove_file(&path)
                .with_context(|| format!("remove stale {}", path.display()))?;
        }
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .with_context(|| format!("fifo path contains NUL: {}", path.display()))?;
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("mkfifo {}", path.display()));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drain up to `max_lines` lines that are already buffered in the pipe.
    pub fn sequential_reader(&self, max_lines: usize) -> anyhow::Result<Vec<String>> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        let mut reader = StdBufReader::new(file);
        let mut out = Vec::new();
        while out.len() < max_lines {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches('\n');
                    if !trimmed.is_empty() {
                        out.push(trimmed.to_string());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    return Err(e).with_context(|| format!("read {}", self.path.display()));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn open_writer(path: PathBuf) -> tokio::task::JoinHandle<std::fs::File> {
        // Opening a FIFO for writing blocks until the monitor opens the read end.
        tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new().write(true).open(path).unwrap()
        })
    }

    async fn wait_for(sink: &LogSink, needle: &str) -> bool {
        for _ in 0..100 {
            if sink.contains(needle).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn wait_state(monitor: &ConsoleMonitor, state: MonitorState) -> bool {
        for _ in 0..100 {
            if monitor.state() == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn log_buffer_keeps_every_line() {
        let mut b = LogBuffer::default();
        for i in 0..200_000 {
            b.push_line(&format!("line {i}"));
        }
        assert!(b.contains("line 0\n"));
        assert!(b.text().ends_with("line 199999\n"));
        assert_eq!(b.text().lines().count(), 200_000);
    }

    #[test]
    fn find_all_returns_first_group_or_whole_match() {
        let mut b = LogBuffer::default();
        b.push_line("Guest-boot-time =  12345 us 12 ms");
        b.push_line("noise");
        b.push_line("Guest-boot-time = 777 us 0 ms");

        let grouped = Regex::new(r"Guest-boot-time\s+=\s+(\d+)").unwrap();
        assert_eq!(b.find_all(&grouped), vec!["12345", "777"]);

        let whole = Regex::new(r"\d+ ms").unwrap();
        assert_eq!(b.find_all(&whole), vec!["12 ms", "0 ms"]);

        let optional = Regex::new(r"noise(-extra)?").unwrap();
        assert_eq!(b.find_all(&optional), vec![""]);

        assert!(b.find_all(&Regex::new("absent").unwrap()).is_empty());
    }

    #[tokio::test]
    async fn start_requires_existing_stream() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(LogSink::new("vm"));
        let mut monitor = ConsoleMonitor::new();
        assert!(monitor.start(&dir.path().join("missing"), &sink).is_err());
        assert_eq!(monitor.state(), MonitorState::Created);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tails_fifo_lines_into_sink() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = Fifo::create(dir.path().join("log_fifo")).unwrap();
        let sink = Arc::new(LogSink::new("vm"));
        let mut monitor = ConsoleMonitor::new();
        monitor.start(fifo.path(), &sink).unwrap();
        assert_eq!(monitor.state(), MonitorState::Running);

        let mut w = open_writer(fifo.path().to_path_buf()).await.unwrap();
        writeln!(w, "Running Firecracker v1.4.0").unwrap();
        writeln!(w).unwrap();
        writeln!(w, "second line").unwrap();
        w.flush().unwrap();

        assert!(wait_for(&sink, "second line").await);
        assert!(sink.contains("Running Firecracker").await);
        // Empty lines are not recorded.
        assert_eq!(sink.text().await, "Running Firecracker v1.4.0\nsecond line\n");

        monitor.stop();
        drop(w);
        assert!(monitor.join(Duration::from_secs(5)).await);
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_unblocks_reader_waiting_for_a_writer() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = Fifo::create(dir.path().join("log_fifo")).unwrap();
        let sink = Arc::new(LogSink::new("vm"));
        let mut monitor = ConsoleMonitor::new();
        monitor.start(fifo.path(), &sink).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop();
        assert!(monitor.join(Duration::from_secs(5)).await);
        assert_eq!(monitor.state(), MonitorState::Stopped);

        // Stopping again is a no-op.
        monitor.stop();
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exits_quietly_when_owner_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = Fifo::create(dir.path().join("log_fifo")).unwrap();
        let sink = Arc::new(LogSink::new("vm"));
        let weak = Arc::downgrade(&sink);
        let mut monitor = ConsoleMonitor::new();
        monitor.start(fifo.path(), &sink).unwrap();

        let mut w = open_writer(fifo.path().to_path_buf()).await.unwrap();
        writeln!(w, "before").unwrap();
        w.flush().unwrap();
        assert!(wait_for(&sink, "before").await);

        drop(sink);
        writeln!(w, "after owner is gone").unwrap();
        w.flush().unwrap();

        assert!(wait_state(&monitor, MonitorState::Stopped).await);
        assert!(monitor.join(Duration::from_secs(5)).await);
        // The monitor never revived the owner.
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reads_during_monitoring_never_see_torn_lines() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = Fifo::create(dir.path().join("log_fifo")).unwrap();
        let sink = Arc::new(LogSink::new("vm"));
        let mut monitor = ConsoleMonitor::new();
        monitor.start(fifo.path(), &sink).unwrap();

        let payload = "x".repeat(512);
        let writer = {
            let path = fifo.path().to_path_buf();
            let payload = payload.clone();
            tokio::task::spawn_blocking(move || {
                let mut w = std::fs::OpenOptions::new().write(true).open(path).unwrap();
                for i in 0..500 {
                    writeln!(w, "<{i}:{payload}>").unwrap();
                }
                w.flush().unwrap();
                w
            })
        };

        let mut reads = 0;
        loop {
            let text = sink.text().await;
            assert!(text.is_empty() || text.ends_with('\n'), "partial line at end of log");
            for line in text.lines() {
                assert!(line.starts_with('<') && line.ends_with('>'), "torn line: {line}");
                assert!(line.contains(&payload));
            }
            reads += 1;
            if text.lines().count() == 500 {
                break;
            }
            assert!(reads < 10_000, "monitor stalled");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let w = writer.await.unwrap();
        monitor.stop();
        drop(w);
        assert!(monitor.join(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn fifo_sequential_reader_drains_buffered_lines() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = Fifo::create(dir.path().join("metrics_fifo")).unwrap();

        // Keep a read end open so the non-blocking writer can attach.
        let keep_open = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(fifo.path())
            .unwrap();
        let mut w = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(fifo.path())
            .unwrap();
        writeln!(w, "{{\"a\":1}}").unwrap();
        writeln!(w, "{{\"b\":2}}").unwrap();
        writeln!(w, "{{\"c\":3}}").unwrap();

        let lines = fifo.sequential_reader(2).unwrap();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        drop(keep_open);
        drop(w);
    }
}
