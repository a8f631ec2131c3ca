//! Threat detector: regex-scored per-IP accumulator over a sliding window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::probe::is_private_ip;

/// Lines kept per IP for operator inspection.
const MAX_RECENT_LINES: usize = 100;

/// Cleanup loop period.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    BruteForce,
    Scanning,
    SqlInjection,
    Xss,
    PathTraversal,
    BotAbuse,
    Ddos,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threat {
    pub id: String,
    pub ip: String,
    pub threat_type: ThreatType,
    /// Accumulated score of the IP at detection time.
    pub score: u32,
    pub description: String,
    pub source: String,
    pub line: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Occurrences of this threat type from this IP inside the window.
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct IpActivity {
    pub ip: String,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub total_score: u32,
    pub threat_counts: HashMap<ThreatType, u32>,
    pub recent_lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub block_threshold: u32,
    pub window_secs: u64,
    pub enable_brute_force: bool,
    pub enable_scanning: bool,
    pub enable_injection: bool,
    pub enable_bots: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            block_threshold: 100,
            window_secs: 300,
            enable_brute_force: true,
            enable_scanning: true,
            enable_injection: true,
            enable_bots: true,
        }
    }
}

struct DetectionPattern {
    name: &'static str,
    threat_type: ThreatType,
    pattern: Regex,
    score: u32,
    description: &'static str,
}

fn ipv4_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+\.\d+\.\d+\.\d+)").unwrap())
}

fn extract_ip(line: &str) -> Option<String> {
    ipv4_pattern()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn builtin_patterns() -> Vec<DetectionPattern> {
    let re = |p: &str| Regex::new(p).unwrap();
    vec![
        DetectionPattern {
            name: "ssh-failed-password",
            threat_type: ThreatType::BruteForce,
            pattern: re(r"Failed password for .* from (\d+\.\d+\.\d+\.\d+)"),
            score: 20,
            description: "SSH password failure",
        },
        DetectionPattern {
            name: "ssh-invalid-user",
            threat_type: ThreatType::BruteForce,
            pattern: re(r"Invalid user .* from (\d+\.\d+\.\d+\.\d+)"),
            score: 25,
            description: "SSH invalid user attempt",
        },
        DetectionPattern {
            name: "ssh-too-many-failures",
            threat_type: ThreatType::BruteForce,
            pattern: re(r"Disconnecting.*: Too many authentication failures.*from (\d+\.\d+\.\d+\.\d+)"),
            score: 50,
            description: "SSH repeated auth failures",
        },
        DetectionPattern {
            name: "web-404-scanner",
            threat_type: ThreatType::Scanning,
            pattern: re(r#"(\d+\.\d+\.\d+\.\d+).*"(GET|POST|HEAD).*(\.php|\.asp|\.aspx|\.jsp|wp-admin|wp-login|phpmyadmin|admin|\.env|\.git|\.svn).*" 404"#),
            score: 15,
            description: "sensitive path scan",
        },
        DetectionPattern {
            name: "web-403-scanner",
            threat_type: ThreatType::Scanning,
            pattern: re(r#"(\d+\.\d+\.\d+\.\d+).*"(GET|POST).*(\.php|\.asp|admin|config).*" 403"#),
            score: 10,
            description: "forbidden path probe",
        },
        DetectionPattern {
            name: "sql-injection",
            threat_type: ThreatType::SqlInjection,
            pattern: re(r#"(\d+\.\d+\.\d+\.\d+).*"(GET|POST).*(union.*select|\bor\b.*=.*\bor\b|'.*--|\bexec\b|\bdrop\b.*\btable\b|1=1|1'='1)"#),
            score: 40,
            description: "SQL injection attempt",
        },
        DetectionPattern {
            name: "xss-attempt",
            threat_type: ThreatType::Xss,
            pattern: re(r#"(\d+\.\d+\.\d+\.\d+).*"(GET|POST).*(<script|javascript:|onerror=|onload=|onclick=|%3Cscript)"#),
            score: 35,
            description: "XSS attempt",
        },
        DetectionPattern {
            name: "path-traversal",
            threat_type: ThreatType::PathTraversal,
            pattern: re(r#"(\d+\.\d+\.\d+\.\d+).*"(GET|POST).*(\.\./|\.\.\\|%2e%2e%2f|%2e%2e/|\.\.%2f|%252e%252e)"#),
            score: 30,
            description: "path traversal attempt",
        },
        DetectionPattern {
            name: "known-attack-tool",
            threat_type: ThreatType::BotAbuse,
            pattern: re(r#"(\d+\.\d+\.\d+\.\d+).*"(GET|POST).*".*(sqlmap|nikto|nmap|masscan|zgrab|nuclei|dirbuster|gobuster|wfuzz|hydra)"#),
            score: 50,
            description: "known scanning tool",
        },
        DetectionPattern {
            // Low score on ordinary responses so only sustained request
            // floods accumulate to the threshold.
            name: "high-frequency",
            threat_type: ThreatType::Ddos,
            pattern: re(r#"(\d+\.\d+\.\d+\.\d+).*"(GET|POST|HEAD).*" [2345]\d\d"#),
            score: 1,
            description: "request flood accumulation",
        },
    ]
}

pub struct ThreatDetector {
    config: DetectorConfig,
    patterns: Vec<DetectionPattern>,
    tracker: Mutex<HashMap<String, IpActivity>>,
    threat_tx: mpsc::Sender<Threat>,
}

impl ThreatDetector {
    /// Returns the detector and the receiver carrying over-threshold threats.
    pub fn new(config: DetectorConfig) -> (Self, mpsc::Receiver<Threat>) {
        let (threat_tx, threat_rx) = mpsc::channel(100);
        (
            Self {
                config,
                patterns: builtin_patterns(),
                tracker: Mutex::new(HashMap::new()),
                threat_tx,
            },
            threat_rx,
        )
    }

    pub fn block_threshold(&self) -> u32 {
        self.config.block_threshold
    }

    fn type_enabled(&self, threat_type: ThreatType) -> bool {
        match threat_type {
            ThreatType::BruteForce => self.config.enable_brute_force,
            ThreatType::Scanning => self.config.enable_scanning,
            ThreatType::SqlInjection | ThreatType::Xss | ThreatType::PathTraversal => {
                self.config.enable_injection
            }
            ThreatType::BotAbuse => self.config.enable_bots,
            _ => true,
        }
    }

    /// Score one log line. Updates per-IP state for every matching pattern,
    /// emits a threat on the channel when the IP crosses the threshold, and
    /// returns the highest-scoring threat matched on this line.
    pub fn analyze(&self, line: &str, source: &str) -> Option<Threat> {
        let mut best: Option<Threat> = None;
        let mut tracker = self.tracker.lock().unwrap();

        for pattern in &self.patterns {
            if !self.type_enabled(pattern.threat_type) {
                continue;
            }
            if !pattern.pattern.is_match(line) {
                continue;
            }
            let Some(ip) = extract_ip(line) else { continue };
            if is_private_ip(&ip) {
                continue;
            }

            let now = Instant::now();
            let activity = tracker.entry(ip.clone()).or_insert_with(|| IpActivity {
                ip: ip.clone(),
                first_seen: now,
                last_seen: now,
                total_score: 0,
                threat_counts: HashMap::new(),
                recent_lines: Vec::new(),
            });
            activity.last_seen = now;
            activity.total_score += pattern.score;
            *activity.threat_counts.entry(pattern.threat_type).or_insert(0) += 1;
            activity.recent_lines.push(line.to_string());
            if activity.recent_lines.len() > MAX_RECENT_LINES {
                let excess = activity.recent_lines.len() - MAX_RECENT_LINES;
                activity.recent_lines.drain(..excess);
            }

            let threat = Threat {
                id: uuid::Uuid::new_v4().to_string(),
                ip: ip.clone(),
                threat_type: pattern.threat_type,
                score: activity.total_score,
                description: pattern.description.to_string(),
                source: source.to_string(),
                line: line.to_string(),
                timestamp: chrono::Utc::now(),
                count: activity.threat_counts[&pattern.threat_type],
            };

            if activity.total_score >= self.config.block_threshold {
                if self.threat_tx.try_send(threat.clone()).is_err() {
                    debug!(ip = %threat.ip, "threat channel full, event dropped");
                }
            }

            debug!(
                pattern = pattern.name,
                ip = %threat.ip,
                score = threat.score,
                "threat pattern matched"
            );

            // The returned threat is the highest-scoring one matched on this
            // line, where score is the IP's cumulative total at match time.
            // Since the total only grows, the last matching pattern's
            // snapshot carries the line-end total, which is what the
            // blocking pump gates on.
            match best {
                Some(ref current) if current.score >= threat.score => {}
                _ => best = Some(threat),
            }
        }

        best
    }

    pub fn activity(&self, ip: &str) -> Option<IpActivity> {
        self.tracker.lock().unwrap().get(ip).cloned()
    }

    pub fn all_activities(&self) -> Vec<IpActivity> {
        self.tracker.lock().unwrap().values().cloned().collect()
    }

    pub fn high_risk_ips(&self, min_score: u32) -> Vec<IpActivity> {
        self.tracker
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.total_score >= min_score)
            .cloned()
            .collect()
    }

    pub fn reset_ip(&self, ip: &str) {
        self.tracker.lock().unwrap().remove(ip);
    }

    /// Evict activities whose last match fell out of the sliding window.
    pub fn cleanup(&self) {
        let window = Duration::from_secs(self.config.window_secs);
        let mut tracker = self.tracker.lock().unwrap();
        let before = tracker.len();
        tracker.retain(|_, activity| activity.last_seen.elapsed() < window);
        let evicted = before - tracker.len();
        if evicted > 0 {
            debug!(evicted, "expired threat activity entries");
        }
    }

    /// Spawn the minute cleanup loop.
    pub fn spawn_cleanup_loop(self: &std::sync::Arc<Self>) {
        let detector = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                detector.cleanup();
            }
        });
    }
}
