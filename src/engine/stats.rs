//! Per-container CPU and memory sampling from `/proc`.
//!
//! The kernel only exposes cumulative CPU time, so a percentage needs two
//! samples. [`CpuTracker`] keeps the previous sample per container and turns
//! each new one into a rate.

use nix::unistd::{sysconf, SysconfVar};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;

/// Assumed when `sysconf` cannot report the tick rate.
const DEFAULT_CLOCK_TICKS: f64 = 100.0;

/// Kernel clock ticks per second, the unit of `/proc/<pid>/stat` CPU times.
pub fn clock_ticks() -> f64 {
    static TICKS: OnceLock<f64> = OnceLock::new();
    *TICKS.get_or_init(|| match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as f64,
        other => {
            tracing::debug!("sysconf(CLK_TCK) gave {:?}; assuming 100", other);
            DEFAULT_CLOCK_TICKS
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcSample {
    /// utime + stime, in clock ticks.
    pub cpu_ticks: u64,
    pub rss_bytes: Option<u64>,
}

impl ProcSample {
    /// Sample the container's init process. `None` if it is gone.
    pub async fn read(pid: u32) -> Option<Self> {
        let stat = tokio::fs::read_to_string(format!("/proc/{}/stat", pid))
            .await
            .ok()?;
        let cpu_ticks = parse_cpu_ticks(&stat)?;
        let rss_bytes = tokio::fs::read_to_string(format!("/proc/{}/status", pid))
            .await
            .ok()
            .and_then(|status| parse_vmrss(&status));
        Some(Self {
            cpu_ticks,
            rss_bytes,
        })
    }
}

/// utime (field 14) + stime (field 15) of a `/proc/<pid>/stat` line.
///
/// The comm field may contain spaces and parentheses, so fields are counted
/// from the last `)`.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // after_comm starts at field 3 (state)
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn parse_vmrss(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

#[derive(Default)]
pub struct CpuTracker {
    last: Mutex<HashMap<String, (u64, Instant)>>,
}

impl CpuTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample and return the CPU percent since the previous one.
    pub fn percent(&self, container_id: &str, cpu_ticks: u64, at: Instant) -> f64 {
        let previous = self
            .last
            .lock()
            .insert(container_id.to_string(), (cpu_ticks, at));
        let Some((prev_ticks, prev_at)) = previous else {
            return 0.0;
        };
        let elapsed = at.saturating_duration_since(prev_at).as_secs_f64();
        if elapsed <= 0.0 || cpu_ticks < prev_ticks {
            return 0.0;
        }
        let cpu_secs = (cpu_ticks - prev_ticks) as f64 / clock_ticks();
        100.0 * cpu_secs / elapsed
    }

    pub fn forget(&self, container_id: &str) {
        self.last.lock().remove(container_id);
    }
}
