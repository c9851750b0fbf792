//! Resource monitor for long-running engine processes
//!
//! Samples `/proc/<pid>` on a timer and classifies each sample, so a stalled
//! or memory-starved install can be spotted from the log.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::logging::{log_debug, log_warning};

/// Used when `getconf CLK_TCK` is unavailable; the Linux default on every
/// mainstream architecture
const DEFAULT_CLK_TCK: f64 = 100.0;

/// Samples kept for [`ProcessMonitor::history`]; one hour at the default interval
pub const HISTORY_LIMIT: usize = 720;

/// Kernel clock ticks per second for /proc/<pid>/stat times
static CLK_TCK: LazyLock<f64> = LazyLock::new(|| {
    Command::new("getconf")
        .arg("CLK_TCK")
        .stderr(Stdio::null())
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| parse_clock_ticks(&String::from_utf8_lossy(&out.stdout)))
        .unwrap_or(DEFAULT_CLK_TCK)
});

fn parse_clock_ticks(output: &str) -> Option<f64> {
    output.trim().parse::<f64>().ok().filter(|ticks| *ticks > 0.0)
}

pub fn clock_ticks() -> f64 {
    *CLK_TCK
}

/// Granularity of the stop check while sleeping between samples
const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    Normal,
    /// CPU below threshold for at least the stall duration
    Stalled,
    HighMemory,
    Zombie,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorThresholds {
    pub stall_cpu_percent: f64,
    pub stall_duration: Duration,
    /// Percent of system memory
    pub memory_percent: f64,
    pub interval: Duration,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            stall_cpu_percent: 5.0,
            stall_duration: Duration::from_secs(120),
            memory_percent: 85.0,
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSample {
    /// Time since monitoring started
    pub elapsed: Duration,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub memory_percent: f64,
    pub threads: u32,
    pub open_fds: u32,
    pub status: MonitorStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSummary {
    pub samples: usize,
    pub duration: Duration,
    pub avg_cpu_percent: f64,
    pub max_cpu_percent: f64,
    pub min_cpu_percent: f64,
    pub avg_memory_mb: f64,
    pub max_memory_mb: f64,
    pub stalled_samples: usize,
    pub stall_percentage: f64,
}

// ============================================================================
// /proc parsing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub state: char,
    /// utime + stime in clock ticks
    pub cpu_ticks: u64,
    pub threads: u32,
}

/// Parse `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
pub fn parse_stat(content: &str) -> Option<ProcStat> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // fields[0] is field 3 (state); utime/stime are 14/15, num_threads is 20
    let state = fields.first()?.chars().next()?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let threads: u32 = fields.get(17)?.parse().ok()?;

    Some(ProcStat {
        state,
        cpu_ticks: utime + stime,
        threads,
    })
}

fn parse_kb_field(content: &str, key: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with(key))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// `VmRSS` from `/proc/<pid>/status`, in kB
pub fn parse_status_rss_kb(content: &str) -> Option<u64> {
    parse_kb_field(content, "VmRSS:")
}

/// `MemTotal` from `/proc/meminfo`, in kB
pub fn parse_meminfo_total_kb(content: &str) -> Option<u64> {
    parse_kb_field(content, "MemTotal:")
}

// ============================================================================
// Classification
// ============================================================================

/// Remembers how long CPU has been low
#[derive(Debug, Default)]
pub struct StallTracker {
    low_since: Option<Duration>,
}

impl StallTracker {
    pub fn classify(
        &mut self,
        elapsed: Duration,
        cpu_percent: f64,
        memory_percent: f64,
        zombie: bool,
        thresholds: &MonitorThresholds,
    ) -> MonitorStatus {
        if zombie {
            return MonitorStatus::Zombie;
        }
        if memory_percent > thresholds.memory_percent {
            return MonitorStatus::HighMemory;
        }

        if cpu_percent < thresholds.stall_cpu_percent {
            match self.low_since {
                None => self.low_since = Some(elapsed),
                Some(start) if elapsed.saturating_sub(start) >= thresholds.stall_duration => {
                    return MonitorStatus::Stalled;
                }
                Some(_) => {}
            }
        } else {
            self.low_since = None;
        }

        MonitorStatus::Normal
    }
}

/// Running totals over every sample seen, independent of how many are kept
#[derive(Debug, Clone, Default)]
struct Totals {
    samples: usize,
    first_elapsed: Duration,
    last_elapsed: Duration,
    cpu_sum: f64,
    cpu_max: f64,
    cpu_min: f64,
    mem_sum: f64,
    mem_max: f64,
    stalled: usize,
}

impl Totals {
    fn add(&mut self, sample: &ResourceSample) {
        if self.samples == 0 {
            self.first_elapsed = sample.elapsed;
            self.cpu_max = f64::MIN;
            self.cpu_min = f64::MAX;
            self.mem_max = f64::MIN;
        }
        self.samples += 1;
        self.last_elapsed = sample.elapsed;
        self.cpu_sum += sample.cpu_percent;
        self.cpu_max = self.cpu_max.max(sample.cpu_percent);
        self.cpu_min = self.cpu_min.min(sample.cpu_percent);
        self.mem_sum += sample.memory_mb;
        self.mem_max = self.mem_max.max(sample.memory_mb);
        if sample.status == MonitorStatus::Stalled {
            self.stalled += 1;
        }
    }

    fn summary(&self) -> Option<MonitorSummary> {
        if self.samples == 0 {
            return None;
        }
        let count = self.samples as f64;
        Some(MonitorSummary {
            samples: self.samples,
            duration: self.last_elapsed.saturating_sub(self.first_elapsed),
            avg_cpu_percent: self.cpu_sum / count,
            max_cpu_percent: self.cpu_max,
            min_cpu_percent: self.cpu_min,
            avg_memory_mb: self.mem_sum / count,
            max_memory_mb: self.mem_max,
            stalled_samples: self.stalled,
            stall_percentage: self.stalled as f64 / count * 100.0,
        })
    }
}

/// Reduce a sample history to averages and extremes
pub fn summarize(history: &[ResourceSample]) -> Option<MonitorSummary> {
    let mut totals = Totals::default();
    for sample in history {
        totals.add(sample);
    }
    totals.summary()
}

/// The most recent samples plus whole-run totals
#[derive(Debug, Clone)]
pub struct SampleLog {
    recent: VecDeque<ResourceSample>,
    limit: usize,
    totals: Totals,
}

impl SampleLog {
    pub fn new(limit: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(limit.min(HISTORY_LIMIT)),
            limit: limit.max(1),
            totals: Totals::default(),
        }
    }

    pub fn push(&mut self, sample: ResourceSample) {
        self.totals.add(&sample);
        if self.recent.len() == self.limit {
            self.recent.pop_front();
        }
        self.recent.push_back(sample);
    }

    /// Kept samples, oldest first
    pub fn recent(&self) -> Vec<ResourceSample> {
        self.recent.iter().cloned().collect()
    }

    /// Summary over the whole run, including samples already dropped
    pub fn summary(&self) -> Option<MonitorSummary> {
        self.totals.summary()
    }
}

// ============================================================================
// Sampler
// ============================================================================

/// Takes successive samples of one process
pub struct Sampler {
    proc_dir: PathBuf,
    thresholds: MonitorThresholds,
    started: Instant,
    last: Option<(Instant, u64)>,
    mem_total_kb: Option<u64>,
    tracker: StallTracker,
}

impl Sampler {
    pub fn new(pid: u32, thresholds: MonitorThresholds) -> Self {
        let mem_total_kb = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|c| parse_meminfo_total_kb(&c));

        Self {
            proc_dir: PathBuf::from(format!("/proc/{}", pid)),
            thresholds,
            started: Instant::now(),
            last: None,
            mem_total_kb,
            tracker: StallTracker::default(),
        }
    }

    /// One sample, or `None` once the process is gone
    pub fn sample(&mut self) -> Option<ResourceSample> {
        let stat = parse_stat(&fs::read_to_string(self.proc_dir.join("stat")).ok()?)?;
        let now = Instant::now();

        // First sample has no previous reading to diff against
        let cpu_percent = match self.last {
            Some((at, ticks)) => {
                let wall = now.duration_since(at).as_secs_f64();
                if wall > 0.0 {
                    stat.cpu_ticks.saturating_sub(ticks) as f64 / clock_ticks() / wall * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some((now, stat.cpu_ticks));

        let rss_kb = fs::read_to_string(self.proc_dir.join("status"))
            .ok()
            .and_then(|c| parse_status_rss_kb(&c))
            .unwrap_or(0);
        let memory_percent = match self.mem_total_kb {
            Some(total) if total > 0 => rss_kb as f64 / total as f64 * 100.0,
            _ => 0.0,
        };

        let open_fds = fs::read_dir(self.proc_dir.join("fd"))
            .map(|entries| entries.count() as u32)
            .unwrap_or(0);

        let elapsed = now.duration_since(self.started);
        let status = self.tracker.classify(
            elapsed,
            cpu_percent,
            memory_percent,
            stat.state == 'Z',
            &self.thresholds,
        );

        Some(ResourceSample {
            elapsed,
            cpu_percent,
            memory_mb: rss_kb as f64 / 1024.0,
            memory_percent,
            threads: stat.threads,
            open_fds,
            status,
        })
    }
}

// ============================================================================
// Background monitor
// ============================================================================

pub struct ProcessMonitor {
    pid: u32,
    thresholds: MonitorThresholds,
    history: Arc<Mutex<SampleLog>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ProcessMonitor {
    pub fn new(pid: u32, thresholds: MonitorThresholds) -> Self {
        Self {
            pid,
            thresholds,
            history: Arc::new(Mutex::new(SampleLog::new(HISTORY_LIMIT))),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Start sampling on a background thread; `callback` sees every sample
    pub fn start<F>(&mut self, callback: F) -> std::io::Result<()>
    where
        F: Fn(&ResourceSample) + Send + 'static,
    {
        if self.worker.is_some() {
            return Ok(());
        }

        let pid = self.pid;
        let thresholds = self.thresholds;
        let history = Arc::clone(&self.history);
        let stop = Arc::clone(&self.stop);
        stop.store(false, Ordering::SeqCst);

        log_debug(&format!(
            "Monitoring pid {} (stall threshold: {}% CPU for {}s)",
            pid,
            thresholds.stall_cpu_percent,
            thresholds.stall_duration.as_secs()
        ));

        let worker = thread::Builder::new()
            .name("process-monitor".to_string())
            .spawn(move || {
                let mut sampler = Sampler::new(pid, thresholds);
                let mut last_status = MonitorStatus::Normal;

                while !stop.load(Ordering::SeqCst) {
                    let Some(sample) = sampler.sample() else {
                        break;
                    };

                    if sample.status != last_status && sample.status != MonitorStatus::Normal {
                        log_warning(&format!(
                            "Process {} is {:?} (cpu {:.1}%, mem {:.0} MB)",
                            pid, sample.status, sample.cpu_percent, sample.memory_mb
                        ));
                    }
                    last_status = sample.status;

                    callback(&sample);
                    history.lock().push(sample);

                    let mut slept = Duration::ZERO;
                    while slept < thresholds.interval && !stop.load(Ordering::SeqCst) {
                        let step = STOP_POLL.min(thresholds.interval - slept);
                        thread::sleep(step);
                        slept += step;
                    }
                }
            })?;

        self.worker = Some(worker);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// The last [`HISTORY_LIMIT`] samples
    pub fn history(&self) -> Vec<ResourceSample> {
        self.history.lock().recent()
    }

    pub fn summary(&self) -> Option<MonitorSummary> {
        self.history.lock().summary()
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
