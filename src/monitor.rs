//! Host resource sampling backed by `/proc`.
//!
//! Memory comes from `/proc/meminfo` (`MemTotal` / `MemAvailable`), CPU from
//! the aggregate `cpu` line of `/proc/stat`. CPU utilisation is a delta
//! between two snapshots, so the very first sample reports it as unknown
//! rather than a misleading zero.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::ProbeError;

pub const KB_PER_GB: u64 = 1024 * 1024;

/// CPU utilisation over the last sampling interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CpuUtilization {
    Unknown,
    Percent(f64),
}

impl CpuUtilization {
    pub fn percent(&self) -> Option<f64> {
        match self {
            CpuUtilization::Unknown => None,
            CpuUtilization::Percent(p) => Some(*p),
        }
    }
}

impl fmt::Display for CpuUtilization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuUtilization::Unknown => write!(f, "unknown"),
            CpuUtilization::Percent(p) => write!(f, "{:.1}%", p),
        }
    }
}

/// One fresh observation of the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub used_memory_kb: u64,
    pub total_memory_kb: u64,
    pub cpu: CpuUtilization,
}

impl ResourceSample {
    pub fn used_memory_gb(&self) -> f64 {
        self.used_memory_kb as f64 / KB_PER_GB as f64
    }

    pub fn total_memory_gb(&self) -> f64 {
        self.total_memory_kb as f64 / KB_PER_GB as f64
    }
}

/// Source of resource samples for the governor.
///
/// Each call returns a fresh sample; implementations may keep private state
/// (such as the previous CPU snapshot) between calls.
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> Result<ResourceSample, ProbeError>;
}

/// Raw aggregate CPU counters from `/proc/stat`, in clock ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSnapshot {
    pub busy: u64,
    pub total: u64,
}

/// Reads `/proc/meminfo` and `/proc/stat` on every call.
#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    meminfo_path: PathBuf,
    stat_path: PathBuf,
    previous_cpu: Option<CpuSnapshot>,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::with_paths("/proc/meminfo", "/proc/stat")
    }
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monitor reading from alternative counter files (used by tests).
    pub fn with_paths(meminfo: impl Into<PathBuf>, stat: impl Into<PathBuf>) -> Self {
        Self {
            meminfo_path: meminfo.into(),
            stat_path: stat.into(),
            previous_cpu: None,
        }
    }

    fn cpu_since_previous(&self, current: CpuSnapshot) -> CpuUtilization {
        let Some(previous) = self.previous_cpu else {
            return CpuUtilization::Unknown;
        };
        let delta_total = current.total.saturating_sub(previous.total);
        if delta_total == 0 {
            return CpuUtilization::Unknown;
        }
        let delta_busy = current.busy.saturating_sub(previous.busy);
        let pct = (delta_busy as f64 / delta_total as f64) * 100.0;
        CpuUtilization::Percent(pct.clamp(0.0, 100.0))
    }
}

impl ResourceProbe for ResourceMonitor {
    fn sample(&mut self) -> Result<ResourceSample, ProbeError> {
        let (total_memory_kb, available_kb) = read_meminfo(&self.meminfo_path)?;
        let snapshot = read_cpu_snapshot(&self.stat_path)?;
        let cpu = self.cpu_since_previous(snapshot);
        self.previous_cpu = Some(snapshot);

        Ok(ResourceSample {
            used_memory_kb: total_memory_kb.saturating_sub(available_kb),
            total_memory_kb,
            cpu,
        })
    }
}

fn read_file(path: &Path) -> Result<String, ProbeError> {
    fs::read_to_string(path).map_err(|source| ProbeError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn read_meminfo(path: &Path) -> Result<(u64, u64), ProbeError> {
    let contents = read_file(path)?;
    parse_meminfo(path, &contents)
}

/// Returns `(MemTotal, MemAvailable)` in KB.
pub fn parse_meminfo(path: &Path, contents: &str) -> Result<(u64, u64), ProbeError> {
    let mut total = None;
    let mut available = None;

    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let key = fields.next().unwrap_or_default();
        let value = fields.next().unwrap_or_default();
        match key {
            "MemTotal:" => total = Some(parse_u64("MemTotal", value)?),
            "MemAvailable:" => available = Some(parse_u64("MemAvailable", value)?),
            _ => {}
        }
    }

    let total = total.ok_or_else(|| ProbeError::MissingField {
        path: path.to_path_buf(),
        field: "MemTotal",
    })?;
    let available = available.ok_or_else(|| ProbeError::MissingField {
        path: path.to_path_buf(),
        field: "MemAvailable",
    })?;
    Ok((total, available))
}

fn read_cpu_snapshot(path: &Path) -> Result<CpuSnapshot, ProbeError> {
    let contents = read_file(path)?;
    parse_cpu_snapshot(path, &contents)
}

/// Parse the aggregate `cpu` line. Idle time is `idle + iowait`; `guest`
/// columns are already folded into `user`/`nice` and are not summed again.
pub fn parse_cpu_snapshot(path: &Path, contents: &str) -> Result<CpuSnapshot, ProbeError> {
    let line = contents
        .lines()
        .find(|l| l.split_whitespace().next() == Some("cpu"))
        .ok_or_else(|| ProbeError::MissingField {
            path: path.to_path_buf(),
            field: "cpu",
        })?;

    let values = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| parse_u64("cpu", v))
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() < 4 {
        return Err(ProbeError::Parse {
            field: "cpu",
            value: line.to_string(),
        });
    }

    let total: u64 = values.iter().sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Ok(CpuSnapshot {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, ProbeError> {
    value.parse::<u64>().map_err(|_| ProbeError::Parse {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MEMINFO: &str = "MemTotal:       67108864 kB\n\
                           MemFree:         1000000 kB\n\
                           MemAvailable:   25165824 kB\n\
                           Buffers:          200000 kB\n";

    fn stat_line(user: u64, idle: u64) -> String {
        format!("cpu  {} 0 0 {} 0 0 0 0 0 0\ncpu0 1 2 3 4 5 6 7 8 0 0\n", user, idle)
    }

    #[test]
    fn test_parse_meminfo() {
        let (total, available) = parse_meminfo(Path::new("/proc/meminfo"), MEMINFO).unwrap();
        assert_eq!(total, 67_108_864);
        assert_eq!(available, 25_165_824);
    }

    #[test]
    fn test_parse_meminfo_missing_available() {
        let err = parse_meminfo(Path::new("m"), "MemTotal: 10 kB\n").unwrap_err();
        assert!(matches!(
            err,
            ProbeError::MissingField {
                field: "MemAvailable",
                ..
            }
        ));
    }

    #[test]
    fn test_parse_cpu_snapshot_excludes_iowait_from_busy() {
        let snap =
            parse_cpu_snapshot(Path::new("s"), "cpu  100 10 50 800 40 0 0 0 0 0\n").unwrap();
        assert_eq!(snap.total, 1000);
        assert_eq!(snap.busy, 160);
    }

    #[test]
    fn test_parse_cpu_snapshot_garbage() {
        assert!(parse_cpu_snapshot(Path::new("s"), "cpu  a b c d\n").is_err());
        assert!(parse_cpu_snapshot(Path::new("s"), "intr 1 2 3\n").is_err());
    }

    #[test]
    fn test_first_sample_reports_unknown_cpu() {
        let dir = tempdir().unwrap();
        let meminfo = dir.path().join("meminfo");
        let stat = dir.path().join("stat");
        fs::write(&meminfo, MEMINFO).unwrap();
        fs::write(&stat, stat_line(100, 900)).unwrap();

        let mut monitor = ResourceMonitor::with_paths(&meminfo, &stat);
        let sample = monitor.sample().unwrap();
        assert_eq!(sample.cpu, CpuUtilization::Unknown);
        assert_eq!(sample.total_memory_kb, 67_108_864);
        assert_eq!(sample.used_memory_kb, 67_108_864 - 25_165_824);
        assert!((sample.used_memory_gb() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_second_sample_uses_delta() {
        let dir = tempdir().unwrap();
        let meminfo = dir.path().join("meminfo");
        let stat = dir.path().join("stat");
        fs::write(&meminfo, MEMINFO).unwrap();
        fs::write(&stat, stat_line(100, 900)).unwrap();

        let mut monitor = ResourceMonitor::with_paths(&meminfo, &stat);
        monitor.sample().unwrap();

        // +25 busy, +75 idle => 25%
        fs::write(&stat, stat_line(125, 975)).unwrap();
        let sample = monitor.sample().unwrap();
        let pct = sample.cpu.percent().unwrap();
        assert!((pct - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_unchanged_counters_report_unknown() {
        let dir = tempdir().unwrap();
        let meminfo = dir.path().join("meminfo");
        let stat = dir.path().join("stat");
        fs::write(&meminfo, MEMINFO).unwrap();
        fs::write(&stat, stat_line(100, 900)).unwrap();

        let mut monitor = ResourceMonitor::with_paths(&meminfo, &stat);
        monitor.sample().unwrap();
        assert_eq!(monitor.sample().unwrap().cpu, CpuUtilization::Unknown);
    }

    #[test]
    fn test_unreadable_counters_are_errors() {
        let dir = tempdir().unwrap();
        let mut monitor =
            ResourceMonitor::with_paths(dir.path().join("nope"), dir.path().join("stat"));
        assert!(matches!(monitor.sample(), Err(ProbeError::Read { .. })));
    }

    #[test]
    fn test_cpu_display() {
        assert_eq!(CpuUtilization::Unknown.to_string(), "unknown");
        assert_eq!(CpuUtilization::Percent(2.5).to_string(), "2.5%");
    }
}
