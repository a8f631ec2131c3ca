//! Emergency overload guard.
//!
//! Samples host CPU and memory every 20 seconds; after nine consecutive
//! overloaded samples (about three minutes) it kills the largest
//! non-protected offender, handling containerized processes through the
//! container runtime so restart policies cannot bring them right back.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sysinfo::System;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::probe::{self, proc::CpuCounters};

pub const DEFAULT_CPU_THRESHOLD: f64 = 95.0;
pub const DEFAULT_MEM_THRESHOLD: f64 = 95.0;
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(20);
/// Consecutive overloaded samples before action (about 3 minutes).
pub const SAMPLES_REQUIRED: u32 = 9;
/// Kill records surfaced through the status command.
const STATUS_HISTORY: usize = 20;

/// Never kill these, or anything with PID <= 2.
const PROTECTED_NAMES: &[&str] = &[
    "init",
    "systemd",
    "sshd",
    "dockerd",
    "containerd",
    "kthreadd",
    "ksoftirqd",
    "kernel",
    "wardend",
];

#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    pub cpu_threshold: f64,
    pub mem_threshold: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: DEFAULT_CPU_THRESHOLD,
            mem_threshold: DEFAULT_MEM_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KillRecord {
    pub pid: i32,
    pub name: String,
    pub reason: String,
    pub cpu: f64,
    pub memory: f64,
    pub is_container: bool,
    pub timestamp: i64,
}

struct GuardState {
    enabled: bool,
    config: GuardConfig,
    consecutive_high: u32,
    history: Vec<KillRecord>,
    prev_cpu: Option<CpuCounters>,
    generation: u64,
}

pub struct EmergencyGuard {
    state: Mutex<GuardState>,
    sys: Mutex<System>,
}

impl EmergencyGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GuardState {
                enabled: false,
                config: GuardConfig::default(),
                consecutive_high: 0,
                history: Vec::new(),
                prev_cpu: None,
                generation: 0,
            }),
            sys: Mutex::new(System::new()),
        })
    }

    pub async fn set_config(&self, config: GuardConfig) {
        let mut state = self.state.lock().await;
        if config.cpu_threshold > 0.0 {
            state.config.cpu_threshold = config.cpu_threshold;
        }
        if config.mem_threshold > 0.0 {
            state.config.mem_threshold = config.mem_threshold;
        }
    }

    pub async fn enable(self: &Arc<Self>) {
        let generation = {
            let mut state = self.state.lock().await;
            if state.enabled {
                return;
            }
            state.enabled = true;
            state.consecutive_high = 0;
            state.prev_cpu = probe::proc::read_cpu();
            state.generation += 1;
            state.generation
        };
        info!("emergency guard enabled");

        let guard = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MONITOR_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                {
                    let state = guard.state.lock().await;
                    if !state.enabled || state.generation != generation {
                        return;
                    }
                }
                guard.tick().await;
            }
        });
    }

    pub async fn disable(&self) {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return;
        }
        state.enabled = false;
        state.consecutive_high = 0;
        info!("emergency guard disabled");
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    pub async fn status_json(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let start = state.history.len().saturating_sub(STATUS_HISTORY);
        serde_json::json!({
            "enabled": state.enabled,
            "consecutive_high": state.consecutive_high,
            "samples_required": SAMPLES_REQUIRED,
            "cpu_threshold": state.config.cpu_threshold,
            "mem_threshold": state.config.mem_threshold,
            "kill_history": state.history[start..],
        })
    }

    /// One monitoring sample: update the overload streak and act when it
    /// reaches the trigger.
    async fn tick(&self) {
        let sample = probe::sample();
        let Some(curr_cpu) = sample.cpu else { return };

        let (should_act, cpu_usage, mem_usage) = {
            let mut state = self.state.lock().await;
            let cpu_usage = match state.prev_cpu {
                Some(prev) => crate::collector::cpu_usage_between(&prev, &curr_cpu),
                None => 0.0,
            };
            state.prev_cpu = Some(curr_cpu);
            let mem_usage = sample.memory_used_percent;

            let overloaded =
                cpu_usage >= state.config.cpu_threshold || mem_usage >= state.config.mem_threshold;
            if overloaded {
                state.consecutive_high += 1;
                warn!(
                    cpu = cpu_usage,
                    mem = mem_usage,
                    consecutive = state.consecutive_high,
                    required = SAMPLES_REQUIRED,
                    "system overloaded"
                );
            } else {
                state.consecutive_high = 0;
            }

            let act = state.consecutive_high >= SAMPLES_REQUIRED;
            if act {
                state.consecutive_high = 0;
            }
            (act, cpu_usage, mem_usage)
        };

        if should_act {
            self.kill_top_offender(cpu_usage, mem_usage).await;
        }
    }

    /// Enumerate processes, score them, and kill the worst offender.
    async fn kill_top_offender(&self, cpu_usage: f64, mem_usage: f64) {
        let candidates = self.scored_candidates().await;
        let Some(target) = candidates.into_iter().next() else {
            info!("no candidate process above the score floor, skipping");
            return;
        };

        let container_id = probe::proc::read_container_id(target.pid as u32);
        let is_container = container_id.is_some();
        let reason = match &container_id {
            Some(id) => format!("container {} consuming excessive resources", id),
            None => format!(
                "process {} (PID {}) consuming excessive resources (cpu {:.1}%, mem {:.1}%)",
                target.name, target.pid, target.cpu, target.mem
            ),
        };

        warn!(
            pid = target.pid,
            name = %target.name,
            cpu = target.cpu,
            mem = target.mem,
            host_cpu = cpu_usage,
            host_mem = mem_usage,
            container = container_id.as_deref().unwrap_or(""),
            "emergency guard killing top offender"
        );

        match container_id {
            Some(id) => stop_container(&id).await,
            None => kill_process_with_escalation(target.pid, &target.name).await,
        }

        let mut state = self.state.lock().await;
        state.history.push(KillRecord {
            pid: target.pid,
            name: target.name,
            reason,
            cpu: target.cpu,
            memory: target.mem,
            is_container,
            timestamp: chrono::Utc::now().timestamp(),
        });
    }

    /// Processes scored by resource usage, best candidate first. Protected
    /// processes and negligible scores are excluded.
    async fn scored_candidates(&self) -> Vec<Candidate> {
        let mut sys = self.sys.lock().await;
        sys.refresh_processes();
        sys.refresh_memory();
        tokio::time::sleep(Duration::from_millis(250)).await;
        sys.refresh_processes();

        let total_memory = sys.total_memory();
        let mut candidates: Vec<Candidate> = sys
            .processes()
            .iter()
            .filter_map(|(pid, p)| {
                let pid = pid.as_u32() as i32;
                if pid <= 2 {
                    return None;
                }
                let name = p.name().to_string();
                if is_protected(&name) {
                    return None;
                }
                let cpu = p.cpu_usage() as f64;
                let mem = if total_memory > 0 {
                    p.memory() as f64 / total_memory as f64 * 100.0
                } else {
                    0.0
                };
                let score = score(cpu, mem);
                if score < 1.0 {
                    return None;
                }
                Some(Candidate {
                    pid,
                    name,
                    cpu,
                    mem,
                    score,
                })
            })
            .collect();
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates
    }
}

struct Candidate {
    pid: i32,
    name: String,
    cpu: f64,
    mem: f64,
    score: f64,
}

/// Resource score: CPU weighted 0.6, memory 0.4.
pub fn score(cpu_percent: f64, mem_percent: f64) -> f64 {
    cpu_percent * 0.6 + mem_percent * 0.4
}

pub fn is_protected(name: &str) -> bool {
    PROTECTED_NAMES.contains(&name)
}

/// Disable the restart policy, then stop with a 5-second grace period,
/// escalating to kill.
async fn stop_container(container_id: &str) {
    let update = tokio::process::Command::new("docker")
        .args(["update", "--restart=no", container_id])
        .output()
        .await;
    if let Ok(output) = &update {
        if !output.status.success() {
            error!(
                container = container_id,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "failed to disable container restart policy"
            );
        }
    }

    let stop = tokio::process::Command::new("docker")
        .args(["stop", "-t", "5", container_id])
        .output()
        .await;
    match stop {
        Ok(output) if output.status.success() => {}
        _ => {
            warn!(container = container_id, "docker stop failed, killing");
            let _ = tokio::process::Command::new("docker")
                .args(["kill", container_id])
                .output()
                .await;
        }
    }
}

/// TERM, wait 3 seconds, KILL if still alive; then ask the service manager
/// to stop a matching unit so auto-restart does not defeat the kill.
async fn kill_process_with_escalation(pid: i32, name: &str) {
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    tokio::time::sleep(Duration::from_secs(3)).await;
    let still_alive = unsafe { libc::kill(pid, 0) } == 0;
    if still_alive {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }

    if crate::executor::is_valid_service_name(name) {
        let _ = tokio::process::Command::new("systemctl")
            .args(["stop", &format!("{}.service", name)])
            .output()
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_weights_cpu_over_memory() {
        assert!((score(100.0, 0.0) - 60.0).abs() < f64::EPSILON);
        assert!((score(0.0, 100.0) - 40.0).abs() < f64::EPSILON);
        assert!((score(50.0, 50.0) - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn protected_set_includes_agent_and_system_processes() {
        for name in ["init", "systemd", "sshd", "dockerd", "containerd", "wardend"] {
            assert!(is_protected(name), "{} must be protected", name);
        }
        assert!(!is_protected("stress-ng"));
        assert!(!is_protected("java"));
    }

    #[tokio::test]
    async fn guard_toggles_enabled_state() {
        let guard = EmergencyGuard::new();
        assert!(!guard.is_enabled().await);
        guard.enable().await;
        assert!(guard.is_enabled().await);
        // Enabling twice is a no-op.
        guard.enable().await;
        guard.disable().await;
        assert!(!guard.is_enabled().await);
    }

    #[tokio::test]
    async fn status_reports_counters_and_thresholds() {
        let guard = EmergencyGuard::new();
        guard
            .set_config(GuardConfig {
                cpu_threshold: 80.0,
                mem_threshold: 90.0,
            })
            .await;
        let status = guard.status_json().await;
        assert_eq!(status["enabled"], false);
        assert_eq!(status["consecutive_high"], 0);
        assert_eq!(status["samples_required"], SAMPLES_REQUIRED);
        assert_eq!(status["cpu_threshold"], 80.0);
        assert_eq!(status["mem_threshold"], 90.0);
        assert!(status["kill_history"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_config_ignores_non_positive_values() {
        let guard = EmergencyGuard::new();
        guard
            .set_config(GuardConfig {
                cpu_threshold: 0.0,
                mem_threshold: -5.0,
            })
            .await;
        let status = guard.status_json().await;
        assert_eq!(status["cpu_threshold"], DEFAULT_CPU_THRESHOLD);
        assert_eq!(status["mem_threshold"], DEFAULT_MEM_THRESHOLD);
    }

    #[tokio::test]
    async fn candidates_exclude_low_scores_and_self() {
        let guard = EmergencyGuard::new();
        let candidates = guard.scored_candidates().await;
        for c in &candidates {
            assert!(c.pid > 2);
            assert!(c.score >= 1.0);
            assert!(!is_protected(&c.name));
        }
    }
}
