//! Metrics collector: turns monotonic counters into rates.
//!
//! Holds one previous [`HostSample`] per counter kind and diffs against it on
//! every collection, overwriting the baseline afterwards.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::probe::{self, CpuCounters, DiskCounters, NetCounters};
use wardend_protocol::{DiskRate, MetricsSnapshot, NetworkRate};

struct Baseline {
    cpu: Option<CpuCounters>,
    networks: HashMap<String, NetCounters>,
    net_at: Instant,
    disks: HashMap<String, DiskCounters>,
    disk_at: Instant,
}

pub struct MetricsCollector {
    baseline: Mutex<Baseline>,
}

impl MetricsCollector {
    /// Create a collector and seed the baselines so the first collection
    /// already produces rates.
    pub fn new() -> Self {
        let sample = probe::sample();
        Self {
            baseline: Mutex::new(Baseline {
                cpu: sample.cpu,
                networks: sample.networks,
                net_at: sample.taken_at,
                disks: sample.disks,
                disk_at: sample.taken_at,
            }),
        }
    }

    /// Collect one reading: diff the current sample against the previous one
    /// and overwrite the baseline.
    pub async fn collect(&self) -> MetricsSnapshot {
        let sample = probe::sample();
        let mut baseline = self.baseline.lock().await;

        let cpu_usage = match (baseline.cpu, sample.cpu) {
            (Some(prev), Some(curr)) => cpu_usage_between(&prev, &curr),
            // No baseline yet: take a short interval reading instead.
            (None, Some(first)) => {
                tokio::time::sleep(Duration::from_millis(250)).await;
                match probe::proc::read_cpu() {
                    Some(second) => cpu_usage_between(&first, &second),
                    None => 0.0,
                }
            }
            _ => 0.0,
        };
        baseline.cpu = sample.cpu;

        let net_elapsed = sample.taken_at.duration_since(baseline.net_at).as_secs_f64();
        let mut networks = Vec::new();
        if net_elapsed > 0.0 {
            for (name, curr) in &sample.networks {
                let rate = match baseline.networks.get(name) {
                    Some(prev) => NetworkRate {
                        interface: name.clone(),
                        bytes_sent_per_sec: per_sec(prev.bytes_sent, curr.bytes_sent, net_elapsed),
                        bytes_recv_per_sec: per_sec(prev.bytes_recv, curr.bytes_recv, net_elapsed),
                        packets_sent_per_sec: per_sec(
                            prev.packets_sent,
                            curr.packets_sent,
                            net_elapsed,
                        ),
                        packets_recv_per_sec: per_sec(
                            prev.packets_recv,
                            curr.packets_recv,
                            net_elapsed,
                        ),
                    },
                    None => NetworkRate {
                        interface: name.clone(),
                        bytes_sent_per_sec: 0,
                        bytes_recv_per_sec: 0,
                        packets_sent_per_sec: 0,
                        packets_recv_per_sec: 0,
                    },
                };
                networks.push(rate);
            }
            baseline.networks = sample.networks.clone();
            baseline.net_at = sample.taken_at;
        }
        networks.sort_by(|a, b| a.interface.cmp(&b.interface));

        let disk_elapsed = sample.taken_at.duration_since(baseline.disk_at).as_secs_f64();
        let mut disks = Vec::new();
        if disk_elapsed > 0.0 {
            for (name, curr) in &sample.disks {
                let rate = match baseline.disks.get(name) {
                    Some(prev) => DiskRate {
                        device: name.clone(),
                        read_bytes_per_sec: per_sec(prev.read_bytes, curr.read_bytes, disk_elapsed),
                        write_bytes_per_sec: per_sec(
                            prev.write_bytes,
                            curr.write_bytes,
                            disk_elapsed,
                        ),
                        read_ops_per_sec: per_sec(prev.read_ops, curr.read_ops, disk_elapsed),
                        write_ops_per_sec: per_sec(prev.write_ops, curr.write_ops, disk_elapsed),
                    },
                    None => DiskRate {
                        device: name.clone(),
                        read_bytes_per_sec: 0,
                        write_bytes_per_sec: 0,
                        read_ops_per_sec: 0,
                        write_ops_per_sec: 0,
                    },
                };
                disks.push(rate);
            }
            baseline.disks = sample.disks.clone();
            baseline.disk_at = sample.taken_at;
        }
        disks.sort_by(|a, b| a.device.cmp(&b.device));

        MetricsSnapshot {
            timestamp: chrono::Utc::now().timestamp(),
            cpu_usage,
            memory_usage: sample.memory_used_percent,
            load1: sample.load.0,
            load5: sample.load.1,
            load15: sample.load.2,
            disks,
            networks,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// CPU usage percent between two counter snapshots.
///
/// Usage is `(Δtotal − Δidle) / Δtotal` with idle including iowait. A zero
/// Δtotal yields 0, not NaN.
pub fn cpu_usage_between(prev: &CpuCounters, curr: &CpuCounters) -> f64 {
    let total_diff = curr.total().saturating_sub(prev.total());
    if total_diff == 0 {
        return 0.0;
    }
    let idle_diff = curr.idle_total().saturating_sub(prev.idle_total());
    (total_diff.saturating_sub(idle_diff)) as f64 / total_diff as f64 * 100.0
}

fn per_sec(prev: u64, curr: u64, elapsed: f64) -> u64 {
    (curr.saturating_sub(prev) as f64 / elapsed) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(user: u64, system: u64, idle: u64, iowait: u64) -> CpuCounters {
        CpuCounters {
            user,
            nice: 0,
            system,
            idle,
            iowait,
            irq: 0,
            softirq: 0,
            steal: 0,
        }
    }

    #[test]
    fn cpu_usage_from_deltas() {
        // Δuser = 100, Δsystem = 50, Δidle = 50, Δtotal = 200 → 75.0
        let prev = counters(1000, 500, 2000, 0);
        let curr = counters(1100, 550, 2050, 0);
        let usage = cpu_usage_between(&prev, &curr);
        assert!((usage - 75.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_usage_counts_iowait_as_idle() {
        // Δuser = 50, Δiowait = 50: half the interval was io-idle.
        let prev = counters(100, 0, 100, 100);
        let curr = counters(150, 0, 100, 150);
        let usage = cpu_usage_between(&prev, &curr);
        assert!((usage - 50.0).abs() < 1e-9);
    }

    #[test]
    fn zero_total_delta_is_zero_not_nan() {
        let prev = counters(10, 10, 10, 0);
        let usage = cpu_usage_between(&prev, &prev);
        assert_eq!(usage, 0.0);
    }

    #[test]
    fn cpu_usage_stays_in_range() {
        let prev = counters(0, 0, 0, 0);
        let curr = counters(500, 300, 200, 100);
        let usage = cpu_usage_between(&prev, &curr);
        assert!((0.0..=100.0).contains(&usage));
    }

    #[test]
    fn counter_reset_does_not_underflow() {
        // A rebooted counter source goes backwards; rate must clamp to >= 0.
        let prev = counters(1000, 1000, 1000, 0);
        let curr = counters(10, 10, 10, 0);
        let usage = cpu_usage_between(&prev, &curr);
        assert!((0.0..=100.0).contains(&usage));
    }

    #[test]
    fn per_sec_divides_by_elapsed() {
        assert_eq!(per_sec(1000, 3000, 2.0), 1000);
        assert_eq!(per_sec(3000, 1000, 2.0), 0);
    }

    #[tokio::test]
    async fn collect_produces_bounded_cpu() {
        let collector = MetricsCollector::new();
        let reading = collector.collect().await;
        assert!((0.0..=100.0).contains(&reading.cpu_usage));
        assert!((0.0..=100.0).contains(&reading.memory_usage));
    }
}
