//! Starting the jailer: through the clone helper, a plain fork+exec, or a
//! detached `screen` session a developer can attach to.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::Context;
use tokio::process::{Child, Command};

use crate::{HarnessError, support};

const SCREEN_DISCOVERY_TRIES: u32 = 30;
const SCREEN_DISCOVERY_DELAY: Duration = Duration::from_secs(1);

/// A launched jailer and whatever is needed to take it down again.
#[derive(Debug)]
pub struct LaunchedProcess {
    /// The pid the harness signals on teardown.
    pub pid: i32,
    /// Set for screen launches; the session leader whose death HUPs the child.
    pub screen_pid: Option<i32>,
    child: Option<Child>,
}

impl LaunchedProcess {
    pub(crate) fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }
}

/// How the jailer should be started.
#[derive(Debug, Clone)]
pub enum LaunchMode {
    /// Use the clone helper when given, otherwise fork+exec directly.
    Daemonized { cloner: Option<PathBuf> },
    /// Run inside `screen -dmS <session>`, logging to `log_path`.
    Screen { session: String, log_path: PathBuf },
}

pub async fn launch(
    binary: &Path,
    args: &[String],
    mode: &LaunchMode,
) -> anyhow::Result<LaunchedProcess> {
    match mode {
        LaunchMode::Daemonized { cloner: Some(cloner) } => {
            launch_with_cloner(cloner, binary, args).await
        }
        LaunchMode::Daemonized { cloner: None } => launch_forked(binary, args),
        LaunchMode::Screen { session, log_path } => {
            launch_in_screen(session, log_path, binary, args).await
        }
    }
}

/// Run `cloner <binary> <args..>`; it prints the pid of the cloned process.
///
/// The helper exits 0 even when the cloned process fails right away, so any
/// stderr output counts as a launch failure.
pub async fn launch_with_cloner(
    cloner: &Path,
    binary: &Path,
    args: &[String],
) -> anyhow::Result<LaunchedProcess> {
    let out = Command::new(cloner)
        .arg(binary)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("run clone helper {}", cloner.display()))?;

    let stderr = String::from_utf8_lossy(&out.stderr);
    if !stderr.trim().is_empty() {
        return Err(HarnessError::LaunchFailure {
            binary: binary.to_path_buf(),
            reason: stderr.trim().to_string(),
        }
        .into());
    }
    if !out.status.success() {
        return Err(HarnessError::LaunchFailure {
            binary: binary.to_path_buf(),
            reason: format!("clone helper exited with {}", out.status),
        }
        .into());
    }

    let stdout = String::from_utf8_lossy(&out.stdout);
    let pid = parse_cloner_pid(&stdout).ok_or_else(|| HarnessError::LaunchFailure {
        binary: binary.to_path_buf(),
        reason: format!("clone helper printed no pid: {:?}", stdout.trim()),
    })?;
    tracing::debug!(pid, cloner = %cloner.display(), "jailer cloned");

    Ok(LaunchedProcess {
        pid,
        screen_pid: None,
        child: None,
    })
}

fn parse_cloner_pid(stdout: &str) -> Option<i32> {
    stdout
        .trim_end()
        .lines()
        .last()?
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
}

/// Fork+exec the binary directly. No PID namespace is set up here; the
/// jailer does that itself when asked to.
pub fn launch_forked(binary: &Path, args: &[String]) -> anyhow::Result<LaunchedProcess> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let child = cmd.spawn().map_err(|e| HarnessError::LaunchFailure {
        binary: binary.to_path_buf(),
        reason: e.to_string(),
    })?;
    let pid = child
        .id()
        .and_then(|p| i32::try_from(p).ok())
        .ok_or_else(|| HarnessError::LaunchFailure {
            binary: binary.to_path_buf(),
            reason: "process exited before its pid was known".to_string(),
        })?;
    tracing::debug!(pid, binary = %binary.display(), "jailer forked");

    Ok(LaunchedProcess {
        pid,
        screen_pid: None,
        child: Some(child),
    })
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the test runner dies, take the jailer down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

pub fn screen_log_path(session: &str) -> PathBuf {
    support::screen_log_dir().join(format!("screen-{session}.log"))
}

/// Start `binary` in a detached screen session and find both the session
/// pid and the pid of the binary running under it.
pub async fn launch_in_screen(
    session: &str,
    log_path: &Path,
    binary: &Path,
    args: &[String],
) -> anyhow::Result<LaunchedProcess> {
    let status = Command::new("screen")
        .arg("-L")
        .arg("-Logfile")
        .arg(log_path)
        .args(["-dmS", session])
        .arg(binary)
        .args(args)
        .stdin(Stdio::null())
        .status()
        .await
        .context("run screen")?;
    if !status.success() {
        return Err(HarnessError::LaunchFailure {
            binary: binary.to_path_buf(),
            reason: format!("screen exited with {status}"),
        }
        .into());
    }

    let mut screen_pid = None;
    for attempt in 1..=SCREEN_DISCOVERY_TRIES {
        let out = Command::new("screen")
            .arg("-ls")
            .output()
            .await
            .context("run screen -ls")?;
        // `screen -ls` exits non-zero whenever it lists anything; only the
        // output matters.
        screen_pid = parse_screen_pid(&String::from_utf8_lossy(&out.stdout), session);
        if screen_pid.is_some() {
            break;
        }
        if attempt < SCREEN_DISCOVERY_TRIES {
            tokio::time::sleep(SCREEN_DISCOVERY_DELAY).await;
        }
    }
    let screen_pid = screen_pid.ok_or_else(|| HarnessError::ReadinessTimeout {
        what: format!("screen session {session}"),
    })?;

    let children_path = format!("/proc/{screen_pid}/task/{screen_pid}/children");
    let children = tokio::fs::read_to_string(&children_path)
        .await
        .with_context(|| format!("read {children_path}"))?;
    let pid = children
        .split_whitespace()
        .next()
        .and_then(|p| p.parse::<i32>().ok())
        .ok_or_else(|| HarnessError::LaunchFailure {
            binary: binary.to_path_buf(),
            reason: format!("screen session {session} has no child process"),
        })?;

    // Make screen write its log file unbuffered.
    let flush = Command::new("screen")
        .args(["-S", session, "-X", "colon", "logfile flush 0^M"])
        .status()
        .await;
    if let Err(e) = flush {
        tracing::warn!(session, error = %e, "failed to disable screen log buffering");
    }

    tracing::debug!(session, screen_pid, pid, "jailer started in screen");
    Ok(LaunchedProcess {
        pid,
        screen_pid: Some(screen_pid),
        child: None,
    })
}

/// Find `<pid>.<session>` in `screen -ls` output.
pub fn parse_screen_pid(output: &str, session: &str) -> Option<i32> {
    output.split_whitespace().find_map(|token| {
        let (pid, name) = token.split_once('.')?;
        if name != session || pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        pid.parse().ok()
    })
}

/// Arguments for typing `input` into window 0 of a screen session.
pub fn screen_stuff_args(session: &str, input: &str) -> Vec<String> {
    vec![
        "-S".to_string(),
        session.to_string(),
        "-p".to_string(),
        "0".to_string(),
        "-X".to_string(),
        "stuff".to_string(),
        input.to_string(),
    ]
}

pub async fn screen_stuff(session: &str, input: &str) -> anyhow::Result<()> {
    let status = Command::new("screen")
        .args(screen_stuff_args(session, input))
        .status()
        .await
        .context("run screen stuff")?;
    if !status.success() {
        anyhow::bail!("screen stuff into {session} exited with {status}");
    }
    Ok(())
}
