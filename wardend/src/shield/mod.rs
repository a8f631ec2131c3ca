//! The shield: log-driven threat detection and IP blocking.
//!
//! Wiring is one-directional with no back-edges: watcher publishes lines,
//! the detector scores them, the rule set decides the action, the blocker
//! applies it at the edge. Every hop crosses a bounded queue.

pub mod blocker;
pub mod detector;
pub mod edge;
pub mod rules;
pub mod watcher;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{AgentError, AgentResult};
use blocker::{BlockerConfig, IpBlocker};
use detector::{DetectorConfig, ThreatDetector};
use edge::{CloudflareClient, EdgeProvider};
use rules::RuleManager;
use watcher::LogWatcher;

fn default_log_paths() -> Vec<PathBuf> {
    [
        "/var/log/auth.log",
        "/var/log/secure",
        "/var/log/nginx/access.log",
        "/var/log/nginx/error.log",
        "/var/log/apache2/access.log",
        "/var/log/apache2/error.log",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    /// Edge provider API token; empty means the shield cannot start.
    pub api_token: String,
    #[serde(default = "default_log_paths")]
    pub log_paths: Vec<PathBuf>,
    pub detector: DetectorConfig,
    pub blocker: BlockerConfig,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            log_paths: default_log_paths(),
            detector: DetectorConfig::default(),
            blocker: BlockerConfig::default(),
        }
    }
}

struct Running {
    watcher: Arc<LogWatcher>,
    detector: Arc<ThreatDetector>,
    blocker: Arc<IpBlocker>,
    rules: Arc<RuleManager>,
}

/// Integrates the security pipeline and owns its lifecycle.
pub struct ShieldManager {
    data_dir: PathBuf,
    config: Mutex<ShieldConfig>,
    running: Mutex<Option<Running>>,
}

impl ShieldManager {
    /// Load persisted shield configuration from the data dir.
    pub fn new(data_dir: PathBuf) -> Self {
        let config_path = data_dir.join("security_config.json");
        let config = std::fs::read(&config_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            data_dir,
            config: Mutex::new(config),
            running: Mutex::new(None),
        }
    }

    async fn save_config(&self) {
        let config = self.config.lock().await;
        let _ = tokio::fs::create_dir_all(&self.data_dir).await;
        let path = self.data_dir.join("security_config.json");
        match serde_json::to_vec_pretty(&*config) {
            Ok(bytes) => {
                let tmp = path.with_extension("json.tmp");
                if tokio::fs::write(&tmp, &bytes).await.is_ok() {
                    let _ = tokio::fs::rename(&tmp, &path).await;
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize shield config"),
        }
    }

    /// Store and verify edge credentials.
    pub async fn configure(&self, api_token: &str) -> AgentResult<()> {
        let client = CloudflareClient::new(api_token);
        if !client.verify_credentials().await? {
            return Err(AgentError::InvalidArgument("edge API token invalid".into()));
        }
        self.config.lock().await.api_token = api_token.to_string();
        self.save_config().await;
        info!("edge credentials configured");
        Ok(())
    }

    pub async fn set_config(&self, config: ShieldConfig) {
        *self.config.lock().await = config;
        self.save_config().await;
    }

    pub async fn config(&self) -> ShieldConfig {
        self.config.lock().await.clone()
    }

    /// Start the pipeline against the configured edge provider.
    pub async fn start(&self) -> AgentResult<()> {
        let token = self.config.lock().await.api_token.clone();
        if token.is_empty() {
            return Err(AgentError::FailedPrecondition(
                "edge provider not configured".into(),
            ));
        }
        let provider: Arc<dyn EdgeProvider> = Arc::new(CloudflareClient::new(&token));
        self.start_with_provider(provider).await
    }

    /// Start with an explicit provider (used by tests and plugins).
    pub async fn start_with_provider(
        &self,
        provider: Arc<dyn EdgeProvider>,
    ) -> AgentResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let config = self.config.lock().await.clone();

        let (detector, mut threat_rx) = ThreatDetector::new(config.detector.clone());
        let detector = Arc::new(detector);
        detector.spawn_cleanup_loop();

        let (ip_blocker, mut block_rx) =
            IpBlocker::new(provider, config.blocker.clone(), &self.data_dir);
        let ip_blocker = Arc::new(ip_blocker);
        ip_blocker.spawn_expiry_loop();

        let rules = Arc::new(RuleManager::new(&self.data_dir));

        let (watcher, mut line_rx) = LogWatcher::new(config.log_paths.clone());
        watcher.start().await;

        // Over-threshold threats are logged; blocking happens on the line
        // pump below so rule actions can adjust the duration.
        tokio::spawn(async move {
            while let Some(threat) = threat_rx.recv().await {
                warn!(
                    ip = %threat.ip,
                    threat_type = ?threat.threat_type,
                    score = threat.score,
                    "threat crossed the block threshold"
                );
            }
        });

        // Block events are informational at this level.
        tokio::spawn(async move {
            while let Some(event) = block_rx.recv().await {
                info!(event = event.event, ip = %event.ip, zone = %event.zone_id, "block event");
            }
        });

        // The pump: line -> detector -> rules -> blocker.
        {
            let detector = Arc::clone(&detector);
            let blocker = Arc::clone(&ip_blocker);
            let rules = Arc::clone(&rules);
            tokio::spawn(async move {
                while let Some(event) = line_rx.recv().await {
                    let Some(threat) = detector.analyze(&event.line, &event.source) else {
                        continue;
                    };
                    if threat.score < detector.block_threshold() {
                        continue;
                    }

                    let duration = match rules.match_threat(&threat) {
                        Some(rule) => {
                            if rule.action.action_type == "allow" || rule.action.action_type == "log"
                            {
                                info!(
                                    ip = %threat.ip,
                                    rule = %rule.name,
                                    action = %rule.action.action_type,
                                    "matched rule suppresses block"
                                );
                                continue;
                            }
                            (rule.action.duration_secs > 0)
                                .then(|| Duration::from_secs(rule.action.duration_secs))
                        }
                        None => None,
                    };

                    if let Err(e) = blocker.block_threat_for(&threat, duration).await {
                        warn!(ip = %threat.ip, error = %e.to_rpc().message, "block failed");
                    }
                }
            });
        }

        *running = Some(Running {
            watcher,
            detector,
            blocker: ip_blocker,
            rules,
        });
        info!("shield started");
        Ok(())
    }

    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(r) = running.take() {
            r.watcher.stop();
            info!("shield stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn status(&self) -> serde_json::Value {
        let running = self.running.lock().await;
        match running.as_ref() {
            None => serde_json::json!({ "running": false }),
            Some(r) => {
                let activities = r.detector.all_activities();
                serde_json::json!({
                    "running": true,
                    "watcher_running": r.watcher.is_running(),
                    "monitored_paths": r.watcher.paths(),
                    "total_blocked": r.blocker.blocked_ips().await.len(),
                    "tracked_ips": activities.len(),
                    "high_risk_ips": r.detector.high_risk_ips(50).len(),
                    "enabled_rules": r.rules.enabled_count(),
                    "blocker": r.blocker.stats().await,
                })
            }
        }
    }

    pub async fn blocker(&self) -> Option<Arc<IpBlocker>> {
        self.running.lock().await.as_ref().map(|r| Arc::clone(&r.blocker))
    }

    pub async fn rules(&self) -> Option<Arc<RuleManager>> {
        self.running.lock().await.as_ref().map(|r| Arc::clone(&r.rules))
    }

    pub async fn add_log_path(&self, path: PathBuf) {
        {
            let mut config = self.config.lock().await;
            if !config.log_paths.contains(&path) {
                config.log_paths.push(path.clone());
            }
        }
        self.save_config().await;
        if let Some(r) = self.running.lock().await.as_ref() {
            r.watcher.add_path(path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge::testing::FakeEdge;
    use std::io::Write;

    const SSH_FAIL: &str =
        "Jan 10 01:02:03 host sshd[123]: Failed password for root from 203.0.113.5 port 22 ssh2";

    #[tokio::test]
    async fn pipeline_blocks_after_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("auth.log");
        std::fs::write(&log, "").unwrap();

        let manager = ShieldManager::new(dir.path().join("shield"));
        manager
            .set_config(ShieldConfig {
                api_token: "test".into(),
                log_paths: vec![log.clone()],
                detector: DetectorConfig::default(),
                blocker: BlockerConfig::default(),
            })
            .await;

        let edge = Arc::new(FakeEdge::with_zones(&["example.com"]));
        manager.start_with_provider(edge.clone()).await.unwrap();
        assert!(manager.is_running().await);

        // Five failures at 20 points cross the threshold of 100.
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
            for _ in 0..5 {
                writeln!(file, "{}", SSH_FAIL).unwrap();
            }
            file.flush().unwrap();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if edge.rule_count() > 0 {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("no block applied after threshold crossing");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let blocker = manager.blocker().await.unwrap();
        assert!(blocker.is_blocked("203.0.113.5").await);

        manager.stop().await;
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn pipeline_blocks_when_later_match_tips_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("access.log");
        std::fs::write(&log, "").unwrap();

        // Threshold of 41: the injection match alone reaches 40, the flood
        // match on the same line tips the total to 41. The block decision
        // must see the line-end total, not the injection snapshot.
        let manager = ShieldManager::new(dir.path().join("shield"));
        manager
            .set_config(ShieldConfig {
                api_token: "test".into(),
                log_paths: vec![log.clone()],
                detector: DetectorConfig {
                    block_threshold: 41,
                    ..Default::default()
                },
                blocker: BlockerConfig::default(),
            })
            .await;

        let edge = Arc::new(FakeEdge::with_zones(&["example.com"]));
        manager.start_with_provider(edge.clone()).await.unwrap();

        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
            writeln!(
                file,
                r#"203.0.113.9 - - [x] "GET /item?id=1 union select password from users HTTP/1.1" 200 512"#
            )
            .unwrap();
            file.flush().unwrap();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if edge.rule_count() > 0 {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("threshold crossing on a multi-pattern line did not block");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let blocker = manager.blocker().await.unwrap();
        assert!(blocker.is_blocked("203.0.113.9").await);
        manager.stop().await;
    }

    #[tokio::test]
    async fn start_requires_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ShieldManager::new(dir.path().to_path_buf());
        let err = manager.start().await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn config_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = ShieldManager::new(dir.path().to_path_buf());
            let mut config = manager.config().await;
            config.api_token = "persisted-token".into();
            manager.set_config(config).await;
        }
        let manager2 = ShieldManager::new(dir.path().to_path_buf());
        assert_eq!(manager2.config().await.api_token, "persisted-token");
    }

    #[tokio::test]
    async fn status_reports_running_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ShieldManager::new(dir.path().to_path_buf());
        assert_eq!(manager.status().await["running"], false);

        let edge = Arc::new(FakeEdge::with_zones(&["example.com"]));
        manager.start_with_provider(edge).await.unwrap();
        let status = manager.status().await;
        assert_eq!(status["running"], true);
        assert!(status["enabled_rules"].as_u64().unwrap() >= 6);
        manager.stop().await;
    }
}
