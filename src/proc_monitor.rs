// src/proc_monitor.rs
//
// Per-process resource sampling for the monitoring loop
// Reads /proc/<pid>/{stat,status,io} (Linux) and derives CPU% from tick deltas

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::time::Instant;

/// One row of the monitoring table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSample {
    pub unix_second: i64,
    pub pid: u32,
    pub state: String,
    pub threads: u64,
    pub cpu_percent: f64,
    pub utime_ticks: u64,
    pub stime_ticks: u64,
    pub vm_rss_kb: u64,
    pub vm_size_kb: u64,
    /// None when /proc/<pid>/io is not readable (other user, hardened kernel)
    pub read_bytes: Option<u64>,
    pub write_bytes: Option<u64>,
}

/// Fields of /proc/<pid>/stat the monitor cares about
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct StatFields {
    pub state: char,
    pub utime: u64,
    pub stime: u64,
    pub threads: u64,
}

impl StatFields {
    /// Parse "pid (comm) S ppid ... utime stime ... num_threads ..."
    /// comm may contain spaces and parentheses, so split at the last ')'
    pub(crate) fn parse(content: &str) -> Result<Self> {
        let close = content.rfind(')').context("Invalid stat format: no ')'")?;
        let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
        // rest[0] is field 3 (state); field N lives at rest[N - 3]
        if rest.len() < 18 {
            bail!("Insufficient fields in stat line");
        }
        Ok(StatFields {
            state: rest[0].chars().next().unwrap_or('?'),
            utime: rest[11].parse().context("Invalid utime")?,
            stime: rest[12].parse().context("Invalid stime")?,
            threads: rest[17].parse().context("Invalid num_threads")?,
        })
    }

    fn cpu_ticks(&self) -> u64 {
        self.utime + self.stime
    }
}

/// (VmRSS, VmSize) in kB from /proc/<pid>/status; kernel threads have neither
pub(crate) fn parse_status_memory(content: &str) -> (u64, u64) {
    let mut rss = 0;
    let mut size = 0;
    for line in content.lines() {
        if let Some(v) = line.strip_prefix("VmRSS:") {
            rss = first_number(v);
        } else if let Some(v) = line.strip_prefix("VmSize:") {
            size = first_number(v);
        }
    }
    (rss, size)
}

/// (read_bytes, write_bytes) from /proc/<pid>/io
pub(crate) fn parse_io(content: &str) -> (Option<u64>, Option<u64>) {
    let mut read = None;
    let mut write = None;
    for line in content.lines() {
        if let Some(v) = line.strip_prefix("read_bytes:") {
            read = v.trim().parse().ok();
        } else if let Some(v) = line.strip_prefix("write_bytes:") {
            write = v.trim().parse().ok();
        }
    }
    (read, write)
}

fn first_number(s: &str) -> u64 {
    s.split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn clock_ticks_per_second() -> f64 {
    use nix::unistd::{sysconf, SysconfVar};
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(t)) if t > 0 => t as f64,
        _ => 100.0,
    }
}

/// Sampler bound to one pid
pub struct ProcessSampler {
    pid: u32,
    ticks_per_sec: f64,
    last: Option<(u64, Instant)>,
}

impl ProcessSampler {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            ticks_per_sec: clock_ticks_per_second(),
            last: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take one sample. Fails once the pid is gone.
    ///
    /// The first sample reports 0% CPU; later ones report usage since the
    /// previous sample.
    pub fn sample(&mut self) -> Result<ProcessSample> {
        let base = format!("/proc/{}", self.pid);
        let stat_raw = fs::read_to_string(format!("{}/stat", base))
            .with_context(|| format!("Failed to read {}/stat", base))?;
        let stat = StatFields::parse(&stat_raw)?;
        let status_raw = fs::read_to_string(format!("{}/status", base))
            .with_context(|| format!("Failed to read {}/status", base))?;
        let (vm_rss_kb, vm_size_kb) = parse_status_memory(&status_raw);
        let (read_bytes, write_bytes) = fs::read_to_string(format!("{}/io", base))
            .map(|s| parse_io(&s))
            .unwrap_or((None, None));

        let now = Instant::now();
        let ticks = stat.cpu_ticks();
        let cpu_percent = match self.last {
            Some((last_ticks, last_time)) => {
                let elapsed = now.duration_since(last_time).as_secs_f64();
                if elapsed > 0.0 {
                    let used = ticks.saturating_sub(last_ticks) as f64 / self.ticks_per_sec;
                    used / elapsed * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some((ticks, now));

        Ok(ProcessSample {
            unix_second: chrono::Utc::now().timestamp(),
            pid: self.pid,
            state: stat.state.to_string(),
            threads: stat.threads,
            cpu_percent,
            utime_ticks: stat.utime,
            stime_ticks: stat.stime,
            vm_rss_kb,
            vm_size_kb,
            read_bytes,
            write_bytes,
        })
    }
}
