//! System activity sampling.
//!
//! [`ProcSampler`] reads cumulative counters from the proc filesystem and
//! turns the difference between two reads into rates:
//! - `stat` for CPU time
//! - `meminfo` for memory pressure
//! - `diskstats` for sectors read and written
//! - `net/dev` for bytes received and sent
//!
//! An open pseudo-terminal counts as an interactive session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use prism_core::ActivityMetrics;
use tokio::fs;

use crate::error::{AgentError, Result};

const SECTOR_BYTES: u64 = 512;

/// Source of activity samples.
#[async_trait]
pub trait ActivitySampler: Send {
    /// Take one sample.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Sampling` when a source cannot be read.
    async fn sample(&mut self) -> Result<ActivityMetrics>;

    /// Forget the baseline kept between samples, e.g. after the machine was
    /// suspended and counter deltas no longer describe recent activity.
    fn reset(&mut self) {}
}

/// Cumulative counters at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    /// Total CPU jiffies.
    pub cpu_total: u64,
    /// Idle plus iowait jiffies.
    pub cpu_idle: u64,
    /// Bytes read and written across whole disks.
    pub disk_bytes: u64,
    /// Bytes received and sent across non-loopback interfaces.
    pub net_bytes: u64,
}

/// Sampler backed by the proc filesystem.
pub struct ProcSampler {
    proc_root: PathBuf,
    pts_dir: PathBuf,
    previous: Option<(Counters, Instant)>,
}

impl ProcSampler {
    /// Create a sampler reading from `proc_root` and `pts_dir`.
    pub fn new(proc_root: impl Into<PathBuf>, pts_dir: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            pts_dir: pts_dir.into(),
            previous: None,
        }
    }

    async fn read(&self, relative: &str) -> Result<String> {
        let path = self.proc_root.join(relative);
        fs::read_to_string(&path)
            .await
            .map_err(|e| AgentError::Sampling(format!("{}: {e}", path.display())))
    }

    async fn counters(&self) -> Result<Counters> {
        let (cpu_total, cpu_idle) = parse_cpu(&self.read("stat").await?)?;
        Ok(Counters {
            cpu_total,
            cpu_idle,
            disk_bytes: parse_diskstats(&self.read("diskstats").await?),
            net_bytes: parse_net_dev(&self.read("net/dev").await?),
        })
    }

    async fn interactive_session(&self) -> bool {
        let Ok(mut entries) = fs::read_dir(&self.pts_dir).await else {
            return false;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.parse::<u32>().is_ok())
            {
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl ActivitySampler for ProcSampler {
    async fn sample(&mut self) -> Result<ActivityMetrics> {
        let now = Instant::now();
        let counters = self.counters().await?;
        let memory_pressure_percent = parse_meminfo(&self.read("meminfo").await?)?;
        let interactive_session = self.interactive_session().await;

        let mut metrics = match self.previous {
            Some((previous, at)) => rates(&previous, &counters, now.duration_since(at).as_secs_f64()),
            None => ActivityMetrics::quiet(),
        };
        metrics.memory_pressure_percent = memory_pressure_percent;
        metrics.interactive_session = interactive_session;

        self.previous = Some((counters, now));
        tracing::trace!(
            cpu = metrics.cpu_percent,
            disk_kbps = metrics.disk_io_kbps,
            net_kbps = metrics.network_io_kbps,
            interactive = metrics.interactive_session,
            "Activity sampled"
        );
        Ok(metrics)
    }

    fn reset(&mut self) {
        self.previous = None;
    }
}

/// Rates between two counter reads `elapsed_secs` apart.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rates(previous: &Counters, current: &Counters, elapsed_secs: f64) -> ActivityMetrics {
    let mut metrics = ActivityMetrics::quiet();
    let total = current.cpu_total.saturating_sub(previous.cpu_total);
    let idle = current.cpu_idle.saturating_sub(previous.cpu_idle);
    if total > 0 {
        metrics.cpu_percent = 100.0 * total.saturating_sub(idle) as f64 / total as f64;
    }
    if elapsed_secs > 0.0 {
        let kb = |bytes: u64| bytes as f64 / 1024.0 / elapsed_secs;
        metrics.disk_io_kbps = kb(current.disk_bytes.saturating_sub(previous.disk_bytes));
        metrics.network_io_kbps = kb(current.net_bytes.saturating_sub(previous.net_bytes));
    }
    metrics
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
/// Returns (total, idle) jiffies.
///
/// # Errors
///
/// Returns `AgentError::Sampling` when the line is missing.
pub fn parse_cpu(content: &str) -> Result<(u64, u64)> {
    let line = content
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| AgentError::Sampling("no aggregate cpu line in stat".into()))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse().unwrap_or(0))
        .collect();
    // user nice system idle iowait irq softirq steal; guest time is already in user.
    let total = fields.iter().take(8).sum();
    let idle = fields.get(3).copied().unwrap_or(0) + fields.get(4).copied().unwrap_or(0);
    Ok((total, idle))
}

/// Parse `/proc/meminfo` into memory pressure, 0-100.
///
/// # Errors
///
/// Returns `AgentError::Sampling` when `MemTotal` is missing or zero.
#[allow(clippy::cast_precision_loss)]
pub fn parse_meminfo(content: &str) -> Result<f64> {
    let values: HashMap<&str, u64> = content
        .lines()
        .filter_map(|line| {
            let (name, rest) = line.split_once(':')?;
            let value = rest.split_whitespace().next()?.parse().ok()?;
            Some((name, value))
        })
        .collect();
    let total = values
        .get("MemTotal")
        .copied()
        .filter(|t| *t > 0)
        .ok_or_else(|| AgentError::Sampling("MemTotal missing from meminfo".into()))?;
    let available = values
        .get("MemAvailable")
        .or_else(|| values.get("MemFree"))
        .copied()
        .unwrap_or(0)
        .min(total);
    Ok(100.0 * (total - available) as f64 / total as f64)
}

/// Sum bytes read and written in `/proc/diskstats` across whole disks.
///
/// Partitions are skipped when their parent device is listed, and loop and
/// ram devices are ignored.
#[must_use]
pub fn parse_diskstats(content: &str) -> u64 {
    let rows: Vec<(&str, u64)> = content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let name = *fields.get(2)?;
            let read: u64 = fields.get(5)?.parse().ok()?;
            let written: u64 = fields.get(9)?.parse().ok()?;
            Some((name, read + written))
        })
        .filter(|(name, _)| !name.starts_with("loop") && !name.starts_with("ram"))
        .collect();

    rows.iter()
        .filter(|(name, _)| {
            !rows
                .iter()
                .any(|(other, _)| other.len() < name.len() && name.starts_with(other))
        })
        .map(|(_, sectors)| sectors * SECTOR_BYTES)
        .sum()
}

/// Sum bytes received and sent in `/proc/net/dev`, loopback excluded.
#[must_use]
pub fn parse_net_dev(content: &str) -> u64 {
    content
        .lines()
        .filter_map(|line| {
            let (name, rest) = line.split_once(':')?;
            if name.trim() == "lo" {
                return None;
            }
            let fields: Vec<u64> = rest
                .split_whitespace()
                .map(|v| v.parse().unwrap_or(0))
                .collect();
            Some(fields.first().copied().unwrap_or(0) + fields.get(8).copied().unwrap_or(0))
        })
        .sum()
}

/// Identifier of the current boot, derived from the kernel's boot id.
///
/// # Errors
///
/// Returns `AgentError::Sampling` if the boot id cannot be read.
pub async fn read_boot_id(proc_root: &Path) -> Result<u64> {
    let path = proc_root.join("sys/kernel/random/boot_id");
    let raw = fs::read_to_string(&path)
        .await
        .map_err(|e| AgentError::Sampling(format!("{}: {e}", path.display())))?;
    Ok(boot_id_from(raw.trim()))
}

fn boot_id_from(raw: &str) -> u64 {
    let hash = blake3::hash(raw.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}
