use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use hearth_process::ServerStatus;
use serde::Serialize;

/// Host resource snapshot shown in status reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostMetrics {
    pub arch: String,
    /// Busy share of all CPUs since the previous sample, 0.0..=1.0.
    pub cpu_load: Option<f64>,
    /// `None` where the platform has no load average.
    pub load_avg_1m: Option<f64>,
    pub processors: usize,
    pub total_memory_bytes: u64,
    pub free_memory_bytes: u64,
    pub agent_uptime_secs: u64,
}

impl HostMetrics {
    pub fn used_memory_bytes(&self) -> u64 {
        self.total_memory_bytes.saturating_sub(self.free_memory_bytes)
    }
}

pub trait MetricsProvider: Send + Sync {
    fn sample(&self) -> HostMetrics;
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub server: ServerStatus,
    pub port: u16,
    /// Time left before the idle stop, when the timer is armed.
    pub idle_shutdown_in_secs: Option<u64>,
    pub host: HostMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// First `cpu` line of `/proc/stat`.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3].saturating_add(fields.get(4).copied().unwrap_or(0));
    let total = fields.iter().fold(0u64, |acc, v| acc.saturating_add(*v));
    Some(CpuTimes { idle, total })
}

fn parse_loadavg(loadavg: &str) -> Option<f64> {
    loadavg.split_whitespace().next()?.parse().ok()
}

/// `(total, free)` in bytes. Prefers `MemAvailable` over `MemFree`.
fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    let mut free = None;
    for line in meminfo.lines() {
        let mut it = line.split_whitespace();
        let key = it.next();
        let kib = it.next().and_then(|v| v.parse::<u64>().ok());
        match key {
            Some("MemTotal:") => total = kib,
            Some("MemAvailable:") => available = kib,
            Some("MemFree:") => free = kib,
            _ => {}
        }
    }
    let free = available.or(free)?;
    Some((total?.saturating_mul(1024), free.saturating_mul(1024)))
}

fn load_ratio(prev: Option<CpuTimes>, now: CpuTimes) -> Option<f64> {
    let (idle, total) = match prev {
        Some(p) if now.total > p.total => (now.idle.saturating_sub(p.idle), now.total - p.total),
        _ => (now.idle, now.total),
    };
    if total == 0 {
        return None;
    }
    Some((1.0 - idle as f64 / total as f64).clamp(0.0, 1.0))
}

/// Reads `/proc` on every sample; fields fall back to empty values elsewhere.
#[derive(Debug)]
pub struct ProcMetrics {
    started: Instant,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl ProcMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last_cpu: Mutex::new(None),
        }
    }

    fn cpu_load(&self) -> Option<f64> {
        let now = parse_cpu_times(&std::fs::read_to_string("/proc/stat").ok()?)?;
        let mut last = self.last_cpu.lock().unwrap_or_else(|e| e.into_inner());
        let ratio = load_ratio(*last, now);
        *last = Some(now);
        ratio
    }
}

impl Default for ProcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsProvider for ProcMetrics {
    fn sample(&self) -> HostMetrics {
        let (total, free) = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_meminfo(&s))
            .unwrap_or((0, 0));
        HostMetrics {
            arch: std::env::consts::ARCH.to_string(),
            cpu_load: self.cpu_load(),
            load_avg_1m: std::fs::read_to_string("/proc/loadavg")
                .ok()
                .and_then(|s| parse_loadavg(&s)),
            processors: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            total_memory_bytes: total,
            free_memory_bytes: free,
            agent_uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// One connection attempt to the game port on loopback.
pub async fn port_open(port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(("127.0.0.1", port))).await
    {
        Ok(Ok(s)) => {
            drop(s);
            true
        }
        _ => false,
    }
}
