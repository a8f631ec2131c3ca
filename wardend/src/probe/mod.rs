//! Host probe: best-effort readings of kernel and process state.
//!
//! Counter sources (CPU jiffies, interface and disk counters) come straight
//! from /proc so the collector can derive rates; process and static host
//! info go through sysinfo. Partial read failures never fail a whole call.

pub mod proc;

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use sysinfo::{Disks, Networks, System, Users};
use tokio::sync::Mutex;

pub use proc::{CpuCounters, DiskCounters, NetCounters};

use wardend_protocol::{
    CpuInfo, DiskInfo, MemoryInfo, NetworkInfo, ProcessInfo, SystemInfo,
};

/// One snapshot of the host counters, immutable once captured.
#[derive(Debug, Clone)]
pub struct HostSample {
    pub taken_at: Instant,
    pub cpu: Option<CpuCounters>,
    pub memory_total: u64,
    pub memory_used_percent: f64,
    pub load: (f64, f64, f64),
    pub networks: HashMap<String, NetCounters>,
    pub disks: HashMap<String, DiskCounters>,
}

/// Capture a [`HostSample`] right now. Sections that cannot be read are
/// left empty rather than failing the snapshot.
pub fn sample() -> HostSample {
    let memory = proc::read_meminfo();
    let memory_total = memory.map(|(total, _)| total).unwrap_or(0);
    let memory_used_percent = match memory {
        Some((total, available)) if total > 0 => {
            (total.saturating_sub(available)) as f64 / total as f64 * 100.0
        }
        _ => 0.0,
    };

    HostSample {
        taken_at: Instant::now(),
        cpu: proc::read_cpu(),
        memory_total,
        memory_used_percent,
        load: proc::read_loadavg().unwrap_or((0.0, 0.0, 0.0)),
        networks: proc::read_net_dev(),
        disks: proc::read_diskstats(),
    }
}

/// Reads process and static host state. Holds a sysinfo `System` so CPU
/// usage readings have a previous refresh to diff against.
pub struct HostProbe {
    sys: Mutex<System>,
}

impl HostProbe {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }

    /// Static host info plus a short-interval CPU usage reading.
    pub async fn static_info(&self) -> SystemInfo {
        let mut sys = self.sys.lock().await;
        sys.refresh_cpu();
        sys.refresh_memory();
        tokio::time::sleep(Duration::from_millis(250)).await;
        sys.refresh_cpu();

        let cpu = CpuInfo {
            model: sys
                .cpus()
                .first()
                .map(|c| c.brand().to_string())
                .unwrap_or_default(),
            cores: sys.cpus().len() as u32,
            frequency_mhz: sys.cpus().first().map(|c| c.frequency() as f64).unwrap_or(0.0),
            usage_percent: sys.global_cpu_info().cpu_usage() as f64,
        };

        let total = sys.total_memory();
        let available = sys.available_memory();
        let used = sys.used_memory();
        let memory = MemoryInfo {
            total,
            available,
            used,
            used_percent: if total > 0 {
                used as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            swap_total: sys.total_swap(),
            swap_used: sys.used_swap(),
        };
        drop(sys);

        let disks = Disks::new_with_refreshed_list()
            .list()
            .iter()
            .map(|d| {
                let total = d.total_space();
                let free = d.available_space();
                let used = total.saturating_sub(free);
                DiskInfo {
                    device: d.name().to_string_lossy().to_string(),
                    mount_point: d.mount_point().to_string_lossy().to_string(),
                    fs_type: d.file_system().to_string_lossy().to_string(),
                    total,
                    used,
                    free,
                    used_percent: if total > 0 {
                        used as f64 / total as f64 * 100.0
                    } else {
                        0.0
                    },
                }
            })
            .collect();

        SystemInfo {
            hostname: System::host_name().unwrap_or_default(),
            os: System::long_os_version()
                .or_else(System::name)
                .unwrap_or_default(),
            kernel_version: System::kernel_version().unwrap_or_default(),
            arch: std::env::consts::ARCH.to_string(),
            uptime_secs: System::uptime(),
            boot_time: System::boot_time() as i64,
            cpu,
            memory,
            disks,
            networks: interface_info(),
        }
    }

    /// List all processes with CPU and memory readings.
    pub async fn list_processes(&self) -> Vec<ProcessInfo> {
        let mut sys = self.sys.lock().await;
        sys.refresh_processes();
        sys.refresh_memory();
        // A second refresh after a short pause gives cpu_usage a baseline.
        tokio::time::sleep(Duration::from_millis(250)).await;
        sys.refresh_processes();

        let users = Users::new_with_refreshed_list();
        let memory_total = sys.total_memory();

        let mut processes: Vec<ProcessInfo> = sys
            .processes()
            .iter()
            .map(|(pid, p)| {
                let rss = p.memory();
                ProcessInfo {
                    pid: pid.as_u32() as i32,
                    ppid: p.parent().map(|pp| pp.as_u32() as i32).unwrap_or(0),
                    name: p.name().to_string(),
                    user: p
                        .user_id()
                        .and_then(|uid| users.get_user_by_id(uid))
                        .map(|u| u.name().to_string())
                        .unwrap_or_default(),
                    status: p.status().to_string(),
                    cpu_percent: p.cpu_usage() as f64,
                    memory_percent: if memory_total > 0 {
                        rss as f64 / memory_total as f64 * 100.0
                    } else {
                        0.0
                    },
                    memory_rss: rss,
                    start_time: p.start_time() as i64,
                    cmdline: p.cmd().join(" "),
                }
            })
            .collect();
        processes.sort_by_key(|p| p.pid);
        processes
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Interface names, addresses and counters for the static info view.
fn interface_info() -> Vec<NetworkInfo> {
    let mut addrs_by_iface: HashMap<String, Vec<String>> = HashMap::new();
    if let Ok(ifaces) = if_addrs::get_if_addrs() {
        for iface in ifaces {
            addrs_by_iface
                .entry(iface.name.clone())
                .or_default()
                .push(iface.addr.ip().to_string());
        }
    }

    let networks = Networks::new_with_refreshed_list();
    let mut out: Vec<NetworkInfo> = networks
        .iter()
        .map(|(name, data)| NetworkInfo {
            name: name.clone(),
            addresses: addrs_by_iface.remove(name).unwrap_or_default(),
            mac: data.mac_address().to_string(),
            bytes_sent: data.total_transmitted(),
            bytes_recv: data.total_received(),
        })
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

/// Non-loopback IPs of all interfaces, used for TLS certificate SANs.
pub fn non_loopback_ips() -> Vec<IpAddr> {
    let mut ips = Vec::new();
    if let Ok(ifaces) = if_addrs::get_if_addrs() {
        for iface in ifaces {
            let ip = iface.addr.ip();
            if !ip.is_loopback() {
                ips.push(ip);
            }
        }
    }
    ips
}

/// RFC1918 + loopback + link-local + 0.0.0.0/8 classification, used by the
/// threat detector to skip internal addresses. Unparseable strings are
/// treated as private (skipped).
pub fn is_private_ip(ip: &str) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.octets()[0] == 0
        }
        Ok(IpAddr::V6(v6)) => {
            v6.is_loopback()
                // fe80::/10 link-local and fc00::/7 unique-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || v6.is_unspecified()
        }
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges_are_private() {
        assert!(is_private_ip("10.0.0.1"));
        assert!(is_private_ip("172.16.5.5"));
        assert!(is_private_ip("172.31.255.255"));
        assert!(is_private_ip("192.168.1.1"));
        assert!(is_private_ip("127.0.0.1"));
        assert!(is_private_ip("169.254.10.10"));
        assert!(is_private_ip("0.1.2.3"));
    }

    #[test]
    fn public_addresses_are_not_private() {
        assert!(!is_private_ip("8.8.8.8"));
        assert!(!is_private_ip("203.0.113.5"));
        assert!(!is_private_ip("172.32.0.1"));
        assert!(!is_private_ip("2001:db8::1"));
    }

    #[test]
    fn garbage_is_treated_as_private() {
        assert!(is_private_ip("not-an-ip"));
        assert!(is_private_ip(""));
    }

    #[test]
    fn ipv6_local_ranges_are_private() {
        assert!(is_private_ip("::1"));
        assert!(is_private_ip("fe80::1"));
        assert!(is_private_ip("fd00::1"));
    }

    #[test]
    fn sample_does_not_panic() {
        // Contents depend on the host; the call itself must always succeed.
        let s = sample();
        assert!(s.memory_used_percent >= 0.0);
    }
}
