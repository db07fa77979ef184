//! Thread lookup by name under `/proc/<pid>/task` and CPU pinning.

use anyhow::Context;

pub const VMM_THREAD: &str = "firecracker";
pub const API_THREAD: &str = "fc_api";

pub fn vcpu_thread(index: usize) -> String {
    format!("fc_vcpu {index}")
}

/// `(tid, comm)` for every thread of `pid`.
pub async fn list_threads(pid: i32) -> anyhow::Result<Vec<(i32, String)>> {
    let dir = format!("/proc/{pid}/task");
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .with_context(|| format!("list {dir}"))?;

    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await.with_context(|| format!("list {dir}"))? {
        let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        // Threads can exit between listing and reading.
        let Ok(comm) = tokio::fs::read_to_string(entry.path().join("comm")).await else {
            continue;
        };
        out.push((tid, comm.trim_end().to_string()));
    }
    out.sort_by_key(|(tid, _)| *tid);
    Ok(out)
}

pub async fn find_thread(pid: i32, name: &str) -> anyhow::Result<Option<i32>> {
    Ok(list_threads(pid)
        .await?
        .into_iter()
        .find(|(_, comm)| comm == name)
        .map(|(tid, _)| tid))
}

#[cfg(target_os = "linux")]
pub fn pin_thread(tid: i32, cpu: usize) -> anyhow::Result<()> {
    if cpu >= libc::CPU_SETSIZE as usize {
        anyhow::bail!("cpu {cpu} out of range");
    }
    let rc = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if rc == -1 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("pin thread {tid} to cpu {cpu}"));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_thread(_tid: i32, _cpu: usize) -> anyhow::Result<()> {
    anyhow::bail!("thread pinning is only supported on linux")
}

/// Pin the thread of `pid` named `name` to `cpu`. Returns false when no such
/// thread exists.
pub async fn pin_named_thread(pid: i32, name: &str, cpu: usize) -> anyhow::Result<bool> {
    let Some(tid) = find_thread(pid, name).await? else {
        return Ok(false);
    };
    pin_thread(tid, cpu)?;
    Ok(true)
}
