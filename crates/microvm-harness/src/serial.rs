//! Character-level access to the serial console of a screen-launched microVM.
//!
//! Output is read from the screen log file, input is typed through
//! `screen ... stuff`.

use std::{
    os::{
        fd::{AsRawFd, OwnedFd},
        unix::fs::OpenOptionsExt,
    },
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;

use crate::{HarnessError, microvm::Microvm};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const RX_TIMEOUT: Duration = Duration::from_secs(20);

pub struct SerialConsole<'a> {
    vm: &'a mut Microvm,
    fd: Option<Arc<OwnedFd>>,
    rx_timeout: Duration,
}

impl<'a> SerialConsole<'a> {
    pub fn new(vm: &'a mut Microvm) -> Self {
        Self {
            vm,
            fd: None,
            rx_timeout: RX_TIMEOUT,
        }
    }

    pub fn with_rx_timeout(mut self, timeout: Duration) -> Self {
        self.rx_timeout = timeout;
        self
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Open the screen log for polling. Does nothing if already open.
    pub fn open(&mut self) -> anyhow::Result<()> {
        if self.fd.is_some() {
            return Ok(());
        }
        let path = self
            .vm
            .screen_log()
            .ok_or_else(|| anyhow::anyhow!("microvm {} has no screen log", self.vm.id()))?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .with_context(|| format!("open serial log {}", path.display()))?;
        self.fd = Some(Arc::new(OwnedFd::from(file)));
        Ok(())
    }

    pub async fn tx(&self, input: &str, end: &str) -> anyhow::Result<()> {
        self.vm.serial_input(&format!("{input}{end}")).await
    }

    /// One character, or an empty string if nothing arrived within 100ms.
    pub async fn rx_char(&self) -> anyhow::Result<String> {
        let fd = self
            .fd
            .clone()
            .ok_or_else(|| anyhow::anyhow!("serial console is not open"))?;
        let polled = tokio::task::spawn_blocking(move || poll_char(&fd))
            .await
            .context("serial poll task")??;
        match polled {
            Polled::Char(c) => Ok(c),
            Polled::Idle => Ok(String::new()),
            // A regular file at EOF is always readable; wait out the interval
            // here instead of spinning.
            Polled::Eof => {
                tokio::time::sleep(POLL_INTERVAL).await;
                Ok(String::new())
            }
        }
    }

    /// Read until the accumulated output ends with `terminator`.
    ///
    /// On timeout the microVM is killed before the error is returned, so a
    /// stuck guest never outlives the test.
    pub async fn rx(&mut self, terminator: &str) -> anyhow::Result<String> {
        let start = Instant::now();
        let mut received = String::new();
        loop {
            received.push_str(&self.rx_char().await?);
            if received.ends_with(terminator) {
                return Ok(received);
            }
            if start.elapsed() >= self.rx_timeout {
                if let Err(e) = self.vm.kill().await {
                    tracing::warn!(microvm_id = %self.vm.id(), error = %e, "kill after serial timeout");
                }
                return Err(HarnessError::ConsoleTimeout {
                    terminator: terminator.to_string(),
                    timeout_ms: self.rx_timeout.as_millis(),
                    received,
                }
                .into());
            }
        }
    }
}

enum Polled {
    Char(String),
    /// Nothing became readable within the poll interval.
    Idle,
    /// Readable, but nothing to read.
    Eof,
}

fn poll_char(fd: &OwnedFd) -> anyhow::Result<Polled> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN | libc::POLLHUP,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, POLL_INTERVAL.as_millis() as libc::c_int) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(Polled::Idle);
        }
        return Err(err).context("poll serial console");
    }
    if rc == 0 {
        return Ok(Polled::Idle);
    }
    if pfd.revents & libc::POLLHUP != 0 {
        return Err(HarnessError::ConsoleHangup.into());
    }
    if pfd.revents & libc::POLLIN == 0 {
        return Ok(Polled::Idle);
    }

    let mut byte = [0u8; 1];
    let n = unsafe { libc::read(fd.as_raw_fd(), byte.as_mut_ptr().cast(), 1) };
    if n <= 0 {
        // EOF on the log file, or EAGAIN.
        return Ok(Polled::Eof);
    }
    Ok(Polled::Char(
        std::str::from_utf8(&byte).unwrap_or("").to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{launcher, microvm::MicrovmConfig};
    use microvm_process::MicrovmId;
    use std::{io::Write, path::Path};

    fn screen_vm(dir: &Path) -> Microvm {
        let mut cfg = MicrovmConfig::new(dir.join("root"), "/bin/sh", "/bin/sh");
        cfg.id = MicrovmId("serial".to_string());
        cfg.monitor_memory = false;
        let mut vm = Microvm::new(cfg).unwrap();
        vm.jailer_mut().daemonize = false;
        let log = dir.join("screen.log");
        std::fs::write(&log, "").unwrap();
        vm.screen_log = Some(log);
        vm
    }

    #[tokio::test]
    async fn open_is_idempotent_and_needs_a_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = MicrovmConfig::new(dir.path(), "/bin/sh", "/bin/sh");
        cfg.monitor_memory = false;
        let mut no_log = Microvm::new(cfg).unwrap();
        assert!(SerialConsole::new(&mut no_log).open().is_err());

        let mut vm = screen_vm(dir.path());
        let mut serial = SerialConsole::new(&mut vm);
        assert!(!serial.is_open());
        serial.open().unwrap();
        serial.open().unwrap();
        assert!(serial.is_open());
        assert_eq!(serial.rx_char().await.unwrap(), "");
    }

    #[tokio::test]
    async fn rx_char_waits_out_the_interval_at_end_of_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = screen_vm(dir.path());
        std::fs::write(vm.screen_log().unwrap(), "x").unwrap();
        let mut serial = SerialConsole::new(&mut vm);
        serial.open().unwrap();
        assert_eq!(serial.rx_char().await.unwrap(), "x");

        let start = Instant::now();
        for _ in 0..3 {
            assert_eq!(serial.rx_char().await.unwrap(), "");
        }
        assert!(start.elapsed() >= Duration::from_millis(300), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn rx_char_requires_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = screen_vm(dir.path());
        let serial = SerialConsole::new(&mut vm);
        assert!(serial.rx_char().await.is_err());
    }

    #[tokio::test]
    async fn rx_char_drops_undecodable_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = screen_vm(dir.path());
        std::fs::write(vm.screen_log().unwrap(), [0xffu8, b'a']).unwrap();
        let mut serial = SerialConsole::new(&mut vm);
        serial.open().unwrap();
        assert_eq!(serial.rx_char().await.unwrap(), "");
        assert_eq!(serial.rx_char().await.unwrap(), "a");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rx_collects_characters_until_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = screen_vm(dir.path());
        let log = vm.screen_log().unwrap().to_path_buf();

        let writer = tokio::spawn(async move {
            let mut f = std::fs::OpenOptions::new().append(true).open(log).unwrap();
            for c in "login: ".chars() {
                tokio::time::sleep(Duration::from_millis(50)).await;
                write!(f, "{c}").unwrap();
                f.flush().unwrap();
            }
        });

        let mut serial = SerialConsole::new(&mut vm);
        serial.open().unwrap();
        let got = serial.rx(": ").await.unwrap();
        assert_eq!(got, "login: ");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn rx_timeout_kills_the_microvm() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = screen_vm(dir.path());
        let mut launched =
            launcher::launch_forked(Path::new("/bin/sleep"), &["30".to_string()]).unwrap();
        vm.jailer_clone_pid = Some(launched.pid);
        vm.screen_pid = Some(launched.pid);
        vm.child = launched.take_child();
        std::fs::write(vm.screen_log().unwrap(), "no prompt here").unwrap();

        {
            let mut serial =
                SerialConsole::new(&mut vm).with_rx_timeout(Duration::from_millis(300));
            serial.open().unwrap();
            let err = serial.rx("login: ").await.unwrap_err();
            match err.downcast_ref::<HarnessError>() {
                Some(HarnessError::ConsoleTimeout { received, .. }) => {
                    assert_eq!(received, "no prompt here");
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
        assert!(!vm.process_alive());
    }
}
