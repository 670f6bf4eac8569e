//! Host resource sampling and admission checks.
//!
//! Each metric keeps its own sampling interval: a fresh reading is taken only
//! once the interval has elapsed, otherwise the previous value is reused.
//! Readings land in a bounded history that feeds adaptive limits.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, info};

use crate::config::ResourceConfig;

const SECTOR_BYTES: u64 = 512;
const ADAPTIVE_FLOOR: f64 = 50.0;
const ADAPTIVE_CEILING: f64 = 90.0;
const ADAPTIVE_HEADROOM: f64 = 1.5;

/// Raw host readings. Implemented by [`HostSampler`] and by test doubles.
pub trait ResourceSampler: Send {
    /// 1-minute load average over core count, as a percentage.
    fn cpu_percent(&mut self) -> f64;
    /// `(total - free - cached - buffers) / total`, as a percentage.
    fn memory_percent(&mut self) -> f64;
    /// Cumulative bytes read and written by block devices, if known.
    fn io_bytes(&mut self) -> Option<u64>;
    fn core_count(&self) -> usize;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu: f64,
    pub memory: f64,
    pub io: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu: f64,
    pub memory: f64,
    pub io: f64,
}

impl ResourceLimits {
    #[must_use]
    pub const fn from_config(config: &ResourceConfig) -> Self {
        Self {
            cpu: config.max_cpu_percent,
            memory: config.max_memory_percent,
            io: config.max_io_percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Availability {
    pub available: bool,
    /// One entry per exceeded dimension.
    pub reasons: Vec<String>,
    pub metrics: ResourceMetrics,
    pub limits: ResourceLimits,
}

/// Copy of the sample history handed to readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHistory {
    pub cpu: Vec<f64>,
    pub memory: Vec<f64>,
    pub io: Vec<f64>,
}

#[derive(Debug, Clone)]
struct MetricTrack {
    interval: Duration,
    sampled_at: Option<Instant>,
    last: f64,
    history: VecDeque<f64>,
    capacity: usize,
}

impl MetricTrack {
    fn new(interval_ms: u64, capacity: usize) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            sampled_at: None,
            last: 0.0,
            history: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.sampled_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.interval)
    }

    fn record(&mut self, now: Instant, value: f64) {
        let value = clamp_percent(value);
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(value);
        self.sampled_at = Some(now);
        self.last = value;
    }

    #[allow(clippy::cast_precision_loss)]
    fn average(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        Some(self.history.iter().sum::<f64>() / self.history.len() as f64)
    }
}

pub struct ResourceMonitor {
    sampler: Box<dyn ResourceSampler>,
    cpu: MetricTrack,
    memory: MetricTrack,
    io: MetricTrack,
    io_baseline: Option<(Instant, u64)>,
    io_reference_bytes_per_sec: f64,
    limits: ResourceLimits,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("limits", &self.limits)
            .field("last", &self.last_metrics())
            .finish_non_exhaustive()
    }
}

impl ResourceMonitor {
    #[must_use]
    pub fn new(config: &ResourceConfig, sampler: Box<dyn ResourceSampler>) -> Self {
        Self {
            sampler,
            cpu: MetricTrack::new(config.cpu_interval_ms, config.history_size),
            memory: MetricTrack::new(config.memory_interval_ms, config.history_size),
            io: MetricTrack::new(config.io_interval_ms, config.history_size),
            io_baseline: None,
            io_reference_bytes_per_sec: config.io_reference_mb_s * 1024.0 * 1024.0,
            limits: ResourceLimits::from_config(config),
        }
    }

    #[must_use]
    pub fn with_host_sampler(config: &ResourceConfig) -> Self {
        Self::new(config, Box::new(HostSampler::new()))
    }

    #[must_use]
    pub const fn limits(&self) -> ResourceLimits {
        self.limits
    }

    #[must_use]
    pub fn core_count(&self) -> usize {
        self.sampler.core_count().max(1)
    }

    #[must_use]
    pub const fn last_metrics(&self) -> ResourceMetrics {
        ResourceMetrics {
            cpu: self.cpu.last,
            memory: self.memory.last,
            io: self.io.last,
        }
    }

    #[must_use]
    pub fn history(&self) -> ResourceHistory {
        ResourceHistory {
            cpu: self.cpu.history.iter().copied().collect(),
            memory: self.memory.history.iter().copied().collect(),
            io: self.io.history.iter().copied().collect(),
        }
    }

    /// Sample whatever is due and return current readings.
    pub fn sample(&mut self) -> ResourceMetrics {
        let now = Instant::now();
        if self.cpu.due(now) {
            let value = self.sampler.cpu_percent();
            self.cpu.record(now, value);
        }
        if self.memory.due(now) {
            let value = self.sampler.memory_percent();
            self.memory.record(now, value);
        }
        if self.io.due(now) {
            let value = self.sample_io(now);
            self.io.record(now, value);
        }
        self.last_metrics()
    }

    fn sample_io(&mut self, now: Instant) -> f64 {
        let Some(bytes) = self.sampler.io_bytes() else {
            return 0.0;
        };
        let previous = self.io_baseline.replace((now, bytes));
        let Some((then, previous_bytes)) = previous else {
            return 0.0;
        };
        io_percent(
            bytes.saturating_sub(previous_bytes),
            now.saturating_duration_since(then),
            self.io_reference_bytes_per_sec,
        )
    }

    /// Whether a new operation may start under the current limits.
    pub fn check_availability(&mut self) -> Availability {
        let metrics = self.sample();
        let limits = self.limits;
        let reasons: Vec<String> = [
            ("CPU", metrics.cpu, limits.cpu),
            ("Memory", metrics.memory, limits.memory),
            ("I/O", metrics.io, limits.io),
        ]
        .into_iter()
        .filter(|(_, value, limit)| value > limit)
        .map(|(name, value, limit)| format!("{name} usage {value:.1}% exceeds limit {limit:.1}%"))
        .collect();

        if !reasons.is_empty() {
            debug!(
                target: "parvault.monitor",
                op = "monitor.check",
                cpu = metrics.cpu,
                memory = metrics.memory,
                io = metrics.io,
                reasons = ?reasons,
                "resources unavailable"
            );
        }
        Availability {
            available: reasons.is_empty(),
            reasons,
            metrics,
            limits,
        }
    }

    /// Recompute each limit as `min(90, max(50, average * 1.5))`.
    ///
    /// A metric with no history keeps its current limit.
    pub fn calculate_adaptive_limits(&mut self) -> ResourceLimits {
        let adapt = |track: &MetricTrack, current: f64| {
            track.average().map_or(current, |average| {
                (average * ADAPTIVE_HEADROOM).clamp(ADAPTIVE_FLOOR, ADAPTIVE_CEILING)
            })
        };
        let next = ResourceLimits {
            cpu: adapt(&self.cpu, self.limits.cpu),
            memory: adapt(&self.memory, self.limits.memory),
            io: adapt(&self.io, self.limits.io),
        };
        if next != self.limits {
            info!(
                target: "parvault.monitor",
                op = "monitor.adapt",
                cpu = next.cpu,
                memory = next.memory,
                io = next.io,
                "adaptive limits recalculated"
            );
        }
        self.limits = next;
        next
    }
}

/// Throughput over `elapsed` as a share of `reference_bytes_per_sec`.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn io_percent(delta_bytes: u64, elapsed: Duration, reference_bytes_per_sec: f64) -> f64 {
    let seconds = elapsed.as_secs_f64();
    if seconds <= 0.0 || reference_bytes_per_sec <= 0.0 {
        return 0.0;
    }
    clamp_percent(delta_bytes as f64 / seconds / reference_bytes_per_sec * 100.0)
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

// ─── Host Sampler ───────────────────────────────────────────────────────────

/// Reads the live host through `sysinfo`, plus `/proc` on Linux.
pub struct HostSampler {
    system: System,
}

impl std::fmt::Debug for HostSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSampler").finish_non_exhaustive()
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler {
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.refresh_memory();
        Self { system }
    }
}

impl ResourceSampler for HostSampler {
    #[allow(clippy::cast_precision_loss)]
    fn cpu_percent(&mut self) -> f64 {
        let load = System::load_average().one;
        if load < 0.0 {
            return 0.0;
        }
        load / self.core_count().max(1) as f64 * 100.0
    }

    #[allow(clippy::cast_precision_loss)]
    fn memory_percent(&mut self) -> f64 {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return 0.0;
        }
        let used = match read_cached_and_buffers() {
            Some(reclaimable) => total
                .saturating_sub(self.system.free_memory())
                .saturating_sub(reclaimable),
            None => total.saturating_sub(self.system.available_memory()),
        };
        used as f64 / total as f64 * 100.0
    }

    fn io_bytes(&mut self) -> Option<u64> {
        read_disk_sectors().map(|sectors| sectors.saturating_mul(SECTOR_BYTES))
    }

    fn core_count(&self) -> usize {
        match self.system.cpus().len() {
            0 => std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            cores => cores,
        }
    }
}

/// `Cached + Buffers` from `/proc/meminfo`, in bytes.
fn read_cached_and_buffers() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
        Some(parse_meminfo_reclaimable(&contents))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Sum of sectors read and written across whole block devices.
fn read_disk_sectors() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let contents = std::fs::read_to_string("/proc/diskstats").ok()?;
        Some(parse_diskstats(&contents, |name| {
            std::path::Path::new("/sys/block").join(name).exists()
        }))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo_reclaimable(contents: &str) -> u64 {
    contents
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key = parts.next()?;
            let kib = parts.next()?.parse::<u64>().ok()?;
            matches!(key, "Cached:" | "Buffers:").then_some(kib * 1024)
        })
        .sum()
}

/// Fields 6 and 10 of each line (sectors read, sectors written) for devices
/// accepted by `is_whole_disk`; partitions would double count.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_diskstats(contents: &str, is_whole_disk: impl Fn(&str) -> bool) -> u64 {
    contents
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let name = *fields.get(2)?;
            if name.starts_with("loop") || name.starts_with("ram") || !is_whole_disk(name) {
                return None;
            }
            let read = fields.get(5)?.parse::<u64>().ok()?;
            let written = fields.get(9)?.parse::<u64>().ok()?;
            Some(read + written)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Scripted {
        cpu: Arc<Mutex<Vec<f64>>>,
        memory: f64,
        io: Arc<Mutex<Vec<u64>>>,
        calls: Arc<Mutex<usize>>,
    }

    impl ResourceSampler for Scripted {
        fn cpu_percent(&mut self) -> f64 {
            *self.calls.lock().unwrap() += 1;
            let mut cpu = self.cpu.lock().unwrap();
            if cpu.len() > 1 { cpu.remove(0) } else { cpu.first().copied().unwrap_or(0.0) }
        }

        fn memory_percent(&mut self) -> f64 {
            self.memory
        }

        fn io_bytes(&mut self) -> Option<u64> {
            let mut io = self.io.lock().unwrap();
            if io.is_empty() { None } else { Some(io.remove(0)) }
        }

        fn core_count(&self) -> usize {
            4
        }
    }

    fn config(interval_ms: u64) -> ResourceConfig {
        ResourceConfig {
            cpu_interval_ms: interval_ms,
            memory_interval_ms: interval_ms,
            io_interval_ms: interval_ms,
            ..ResourceConfig::default()
        }
    }

    #[test]
    fn reports_every_exceeded_dimension() {
        let sampler = Scripted {
            cpu: Arc::new(Mutex::new(vec![95.0])),
            memory: 90.0,
            ..Scripted::default()
        };
        let mut monitor = ResourceMonitor::new(&config(0), Box::new(sampler));
        let availability = monitor.check_availability();
        assert!(!availability.available);
        assert_eq!(availability.reasons.len(), 2);
        assert!(availability.reasons[0].starts_with("CPU usage 95.0%"));
        assert!(availability.reasons[1].starts_with("Memory usage 90.0%"));
    }

    #[test]
    fn samples_are_reused_inside_the_interval() {
        let sampler = Scripted {
            cpu: Arc::new(Mutex::new(vec![10.0, 99.0])),
            ..Scripted::default()
        };
        let calls = Arc::clone(&sampler.calls);
        let mut monitor = ResourceMonitor::new(&config(60_000), Box::new(sampler));
        assert!(monitor.check_availability().available);
        let second = monitor.check_availability();
        assert!(second.available, "cached 10% reading is reused");
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(monitor.history().cpu, vec![10.0]);
    }

    #[test]
    fn history_is_bounded() {
        let sampler = Scripted {
            cpu: Arc::new(Mutex::new(vec![1.0, 2.0, 3.0, 4.0, 5.0])),
            ..Scripted::default()
        };
        let mut monitor = ResourceMonitor::new(
            &ResourceConfig {
                history_size: 3,
                ..config(0)
            },
            Box::new(sampler),
        );
        for _ in 0..5 {
            monitor.sample();
        }
        assert_eq!(monitor.history().cpu, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn adaptive_limit_is_one_and_a_half_times_the_average() {
        let sampler = Scripted {
            cpu: Arc::new(Mutex::new(vec![30.0, 50.0])),
            memory: 10.0,
            ..Scripted::default()
        };
        let mut monitor = ResourceMonitor::new(&config(0), Box::new(sampler));
        monitor.sample();
        monitor.sample();
        let limits = monitor.calculate_adaptive_limits();
        assert!((limits.cpu - 60.0).abs() < f64::EPSILON);
        assert!((limits.memory - 50.0).abs() < f64::EPSILON, "floor applies");
    }

    #[test]
    fn adaptive_limits_keep_current_values_without_history() {
        let mut monitor = ResourceMonitor::new(&config(0), Box::new(Scripted::default()));
        let before = monitor.limits();
        assert_eq!(monitor.calculate_adaptive_limits(), before);
    }

    #[test]
    fn io_rate_is_normalized_and_clamped() {
        let mib = 1024.0 * 1024.0;
        let half = io_percent(50 * 1024 * 1024, Duration::from_secs(1), 100.0 * mib);
        assert!((half - 50.0).abs() < 1e-9);
        assert!((io_percent(u64::MAX, Duration::from_secs(1), mib) - 100.0).abs() < f64::EPSILON);
        assert!(io_percent(10, Duration::ZERO, mib).abs() < f64::EPSILON);
    }

    #[test]
    fn first_io_sample_only_sets_the_baseline() {
        let sampler = Scripted {
            io: Arc::new(Mutex::new(vec![1_000, u64::MAX / 2])),
            ..Scripted::default()
        };
        let mut monitor = ResourceMonitor::new(&config(0), Box::new(sampler));
        assert!(monitor.sample().io.abs() < f64::EPSILON);
        std::thread::sleep(Duration::from_millis(5));
        assert!((monitor.sample().io - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_proc_files() {
        let meminfo = "MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 10 kB\nCached: 200 kB\nSwapCached: 5 kB\n";
        assert_eq!(parse_meminfo_reclaimable(meminfo), 210 * 1024);

        let diskstats = "   8       0 sda 100 0 2000 0 50 0 3000 0 0 0 0\n\
                         8       1 sda1 90 0 1900 0 40 0 2900 0 0 0 0\n\
                         7       0 loop0 1 0 8 0 0 0 0 0 0 0 0\n";
        assert_eq!(parse_diskstats(diskstats, |name| name == "sda" || name == "loop0"), 5_000);
    }

    #[test]
    fn host_sampler_reports_sane_values() {
        let mut sampler = HostSampler::new();
        assert!(sampler.core_count() >= 1);
        let memory = sampler.memory_percent();
        assert!((0.0..=100.0).contains(&memory));
        assert!(sampler.cpu_percent() >= 0.0);
    }
}
