//! Background samplers that watch a running VMM from `/proc` and complain
//! afterwards if it used more than it should have.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::task::JoinHandle;

use crate::{
    HarnessError,
    procfs::{self, CpuReading},
    support,
};

const MIB: u64 = 1024 * 1024;

/// Stop flag plus task handle; the part both samplers share.
#[derive(Debug, Default)]
struct Sampler {
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Sampler {
    fn is_alive(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn signal_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    async fn join(&mut self, timeout: Duration) -> bool {
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

/// Sleep `interval` in small steps so a stop request is noticed quickly.
async fn sleep_unless_stopped(stop: &AtomicBool, interval: Duration) {
    let step = Duration::from_millis(20).min(interval);
    let deadline = tokio::time::Instant::now() + interval;
    while tokio::time::Instant::now() < deadline {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(step).await;
    }
}

/// Tracks how much memory the VMM uses beyond the guest's own RAM.
#[derive(Debug)]
pub struct MemoryMonitor {
    guest_mem_mib: u64,
    threshold_mib: u64,
    max_overhead_bytes: Arc<Mutex<Option<u64>>>,
    sampler: Sampler,
}

impl MemoryMonitor {
    pub fn new(guest_mem_mib: u64) -> Self {
        Self::with_threshold(guest_mem_mib, support::memory_overhead_threshold_mib())
    }

    pub fn with_threshold(guest_mem_mib: u64, threshold_mib: u64) -> Self {
        Self {
            guest_mem_mib,
            threshold_mib,
            max_overhead_bytes: Arc::new(Mutex::new(None)),
            sampler: Sampler::default(),
        }
    }

    pub fn guest_mem_mib(&self) -> u64 {
        self.guest_mem_mib
    }

    pub fn start(&mut self, pid: i32) {
        if self.sampler.task.is_some() {
            return;
        }
        let stop = self.sampler.stop.clone();
        let max = self.max_overhead_bytes.clone();
        let guest_bytes = self.guest_mem_mib.saturating_mul(MIB);
        let interval = support::monitor_sample_interval();

        self.sampler.task = Some(tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                let Some(stat) = procfs::task_stat(pid, pid).await else {
                    break;
                };
                record_max(&max, stat.rss_bytes().saturating_sub(guest_bytes));
                sleep_unless_stopped(&stop, interval).await;
            }
        }));
    }

    pub fn is_alive(&self) -> bool {
        self.sampler.is_alive()
    }

    pub fn signal_stop(&self) {
        self.sampler.signal_stop();
    }

    pub async fn join(&mut self, timeout: Duration) -> bool {
        self.sampler.join(timeout).await
    }

    /// Highest RSS beyond guest memory seen so far, in bytes.
    pub fn max_overhead_bytes(&self) -> Option<u64> {
        self.max_overhead_bytes.lock().ok().and_then(|g| *g)
    }

    pub fn check_samples(&self) -> anyhow::Result<()> {
        let limit = self.threshold_mib.saturating_mul(MIB);
        if let Some(max) = self.max_overhead_bytes()
            && max > limit
        {
            return Err(HarnessError::SampleCheck {
                monitor: "memory",
                reason: format!(
                    "VMM overhead reached {max} bytes, above the {} MiB threshold",
                    self.threshold_mib
                ),
            }
            .into());
        }
        Ok(())
    }

    #[cfg(test)]
    fn record(&self, overhead_bytes: u64) {
        record_max(&self.max_overhead_bytes, overhead_bytes);
    }
}

fn record_max(slot: &Mutex<Option<u64>>, value: u64) {
    if let Ok(mut g) = slot.lock() {
        *g = Some(g.map_or(value, |m| m.max(value)));
    }
}

/// CPU load of one VMM thread. The microVM watches its emulation thread,
/// whose tid is the process id; vCPU threads are expected to run hot.
#[derive(Debug)]
pub struct CpuLoadMonitor {
    threshold_percent: u32,
    tid: Option<i32>,
    samples: Arc<Mutex<Vec<u32>>>,
    sampler: Sampler,
}

impl CpuLoadMonitor {
    pub fn new(threshold_percent: u32) -> Self {
        Self {
            threshold_percent,
            tid: None,
            samples: Arc::new(Mutex::new(Vec::new())),
            sampler: Sampler::default(),
        }
    }

    /// Sample thread `tid` of process `pid` until stopped or the thread exits.
    pub fn start(&mut self, pid: i32, tid: i32) {
        if self.sampler.task.is_some() {
            return;
        }
        self.tid = Some(tid);
        let stop = self.sampler.stop.clone();
        let samples = self.samples.clone();
        let interval = support::monitor_sample_interval();

        self.sampler.task = Some(tokio::spawn(async move {
            let mut last: Option<CpuReading> = None;
            while !stop.load(Ordering::SeqCst) {
                let Some(stat) = procfs::task_stat(pid, tid).await else {
                    break;
                };
                let reading = CpuReading {
                    ticks: stat.cpu_ticks,
                    at: tokio::time::Instant::now(),
                };
                if let Some(prev) = last.replace(reading)
                    && let Ok(mut v) = samples.lock()
                {
                    v.push(reading.load_x100_since(&prev));
                }
                sleep_unless_stopped(&stop, interval).await;
            }
        }));
    }

    pub fn is_alive(&self) -> bool {
        self.sampler.is_alive()
    }

    pub fn signal_stop(&self) {
        self.sampler.signal_stop();
    }

    pub async fn join(&mut self, timeout: Duration) -> bool {
        self.sampler.join(timeout).await
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().map(|v| v.len()).unwrap_or(0)
    }

    /// Average load, in hundredths of a percent. `None` before two readings.
    pub fn average_x100(&self) -> Option<u32> {
        let v = self.samples.lock().ok()?;
        if v.is_empty() {
            return None;
        }
        let sum: u64 = v.iter().map(|x| u64::from(*x)).sum();
        Some((sum / v.len() as u64) as u32)
    }

    pub fn check_samples(&self) -> anyhow::Result<()> {
        let limit = self.threshold_percent.saturating_mul(100);
        match self.average_x100() {
            Some(avg) if avg > limit => Err(HarnessError::SampleCheck {
                monitor: "cpu load",
                reason: format!(
                    "thread {} averaged {}.{:02}%, above {}%",
                    self.tid.unwrap_or_default(),
                    avg / 100,
                    avg % 100,
                    self.threshold_percent
                ),
            }
            .into()),
            _ => Ok(()),
        }
    }

    #[cfg(test)]
    fn record(&self, pct_x100: u32) {
        self.samples.lock().unwrap().push(pct_x100);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_check_passes_without_samples() {
        let m = MemoryMonitor::with_threshold(128, 5);
        assert!(m.check_samples().is_ok());
        assert!(!m.is_alive());
    }

    #[test]
    fn memory_check_fails_over_threshold() {
        let m = MemoryMonitor::with_threshold(128, 5);
        m.record(4 * MIB);
        assert!(m.check_samples().is_ok());
        m.record(6 * MIB);
        m.record(MIB);
        assert_eq!(m.max_overhead_bytes(), Some(6 * MIB));
        let err = m.check_samples().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::SampleCheck { monitor: "memory", .. })
        ));
    }

    #[test]
    fn cpu_check_uses_the_average() {
        let m = CpuLoadMonitor::new(10);
        assert!(m.check_samples().is_ok());
        m.record(500);
        m.record(1300);
        assert_eq!(m.average_x100(), Some(900));
        assert!(m.check_samples().is_ok());

        m.record(2000);
        let err = m.check_samples().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::SampleCheck { monitor: "cpu load", .. })
        ));
    }

    /// A thread spinning until `stop` is set, and its tid.
    fn spin_thread(stop: Arc<AtomicBool>) -> (std::thread::JoinHandle<()>, i32) {
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            tx.send(unsafe { libc::gettid() }).unwrap();
            while !stop.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        });
        (handle, rx.recv().unwrap())
    }

    async fn wait_for_samples(m: &CpuLoadMonitor, n: usize) {
        for _ in 0..500 {
            if m.sample_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("only {} cpu samples taken", m.sample_count());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cpu_monitor_watches_only_the_chosen_thread() {
        let pid = std::process::id() as i32;
        let stop = Arc::new(AtomicBool::new(false));
        let (spinner, busy_tid) = spin_thread(stop.clone());

        // The main thread of the test binary only waits on test threads.
        let mut idle = CpuLoadMonitor::new(50);
        idle.start(pid, pid);
        let mut busy = CpuLoadMonitor::new(20);
        busy.start(pid, busy_tid);

        wait_for_samples(&idle, 2).await;
        wait_for_samples(&busy, 2).await;
        stop.store(true, Ordering::Relaxed);
        spinner.join().unwrap();

        for m in [&idle, &busy] {
            m.signal_stop();
        }
        assert!(idle.join(Duration::from_secs(5)).await);
        assert!(busy.join(Duration::from_secs(5)).await);

        assert!(idle.check_samples().is_ok(), "{:?}", idle.average_x100());
        assert!(busy.check_samples().is_err(), "{:?}", busy.average_x100());
    }

    #[tokio::test]
    async fn samplers_observe_a_live_process_and_stop() {
        let pid = std::process::id() as i32;
        let mut mem = MemoryMonitor::with_threshold(0, 64 * 1024);
        let mut cpu = CpuLoadMonitor::new(100_000);
        mem.start(pid);
        cpu.start(pid, pid);

        for _ in 0..100 {
            if mem.max_overhead_bytes().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(mem.max_overhead_bytes().unwrap_or(0) > 0);

        mem.signal_stop();
        cpu.signal_stop();
        assert!(mem.join(Duration::from_secs(5)).await);
        assert!(cpu.join(Duration::from_secs(5)).await);
        assert!(!mem.is_alive());
        assert!(mem.check_samples().is_ok());
        assert!(cpu.check_samples().is_ok());
    }

    #[tokio::test]
    async fn sampler_ends_when_process_is_gone() {
        let mut mem = MemoryMonitor::with_threshold(0, 5);
        // Pids wrap well below this.
        mem.start(i32::MAX - 1);
        assert!(mem.join(Duration::from_secs(5)).await);
        assert_eq!(mem.max_overhead_bytes(), None);
    }
}
