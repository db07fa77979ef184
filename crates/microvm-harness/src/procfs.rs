//! The bits of `/proc/<pid>/task/<tid>/stat` the resource monitors sample.

use std::sync::OnceLock;

use tokio::time::Instant;

/// One read of a task's stat line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskStat {
    pub state: char,
    /// utime + stime, in clock ticks.
    pub cpu_ticks: u64,
    /// Resident set of the whole process, in pages.
    pub rss_pages: u64,
}

impl TaskStat {
    /// The comm field may contain spaces and parentheses, so fields are
    /// counted from the last `)`.
    pub fn parse(stat: &str) -> Option<Self> {
        let end = stat.rfind(')')?;
        let fields: Vec<&str> = stat.get(end + 1..)?.split_whitespace().collect();
        let state = fields.first()?.chars().next()?;
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        let rss_pages: u64 = fields.get(21)?.parse().ok()?;
        Some(Self {
            state,
            cpu_ticks: utime.saturating_add(stime),
            rss_pages,
        })
    }

    pub fn rss_bytes(&self) -> u64 {
        self.rss_pages.saturating_mul(page_size())
    }
}

pub(crate) async fn task_stat(pid: i32, tid: i32) -> Option<TaskStat> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/task/{tid}/stat"))
        .await
        .ok()?;
    TaskStat::parse(&s)
}

fn sysconf_cached(cell: &OnceLock<u64>, name: libc::c_int, fallback: u64) -> u64 {
    *cell.get_or_init(|| match unsafe { libc::sysconf(name) } {
        v if v > 0 => v as u64,
        _ => fallback,
    })
}

fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    sysconf_cached(&PAGE, libc::_SC_PAGESIZE, 4096)
}

fn clock_ticks() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    sysconf_cached(&TICKS, libc::_SC_CLK_TCK, 100)
}

/// CPU ticks of one task at one instant; two of them give a load figure.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CpuReading {
    pub ticks: u64,
    pub at: Instant,
}

impl CpuReading {
    /// Load between `earlier` and `self`, in hundredths of a percent of one CPU.
    pub fn load_x100_since(&self, earlier: &CpuReading) -> u32 {
        let secs = self.at.duration_since(earlier.at).as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        let busy = self.ticks.saturating_sub(earlier.ticks) as f64 / clock_ticks() as f64;
        let x100 = (busy / secs * 10_000.0).round();
        if x100.is_finite() {
            x100.clamp(0.0, u32::MAX as f64) as u32
        } else {
            0
        }
    }
}
