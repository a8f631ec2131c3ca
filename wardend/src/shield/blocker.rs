//! IP blocker: applies edge-provider access rules and keeps the persistent
//! ledger of blocked addresses.
//!
//! The ledger is the only on-disk state with concurrent writers; it is
//! serialized by the blocker's mutex and rewritten atomically (temp file +
//! rename) on every mutation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::detector::{Threat, ThreatType};
use super::edge::{EdgeProvider, Zone};
use crate::error::{AgentError, AgentResult};

/// Expiry sweep period.
pub const EXPIRY_INTERVAL: Duration = Duration::from_secs(60);

/// Ledger key: an IP may be blocked on multiple zones independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub ip: String,
    pub zone_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedIp {
    pub ip: String,
    pub rule_id: String,
    pub zone_id: String,
    pub zone_name: String,
    pub reason: String,
    pub threat_type: ThreatType,
    pub score: u32,
    pub blocked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub auto_blocked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockEvent {
    /// blocked, unblocked, expired.
    pub event: &'static str,
    pub ip: String,
    pub zone_id: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockerConfig {
    pub auto_block_enabled: bool,
    /// Default block duration in seconds; 0 means permanent.
    pub default_block_duration_secs: u64,
    /// block or challenge.
    pub block_mode: String,
    /// Zone ids to protect; empty means all zones.
    pub protected_zones: Vec<String>,
    pub whitelist_ips: Vec<String>,
}

impl Default for BlockerConfig {
    fn default() -> Self {
        Self {
            auto_block_enabled: true,
            default_block_duration_secs: 3600,
            block_mode: "block".into(),
            protected_zones: Vec::new(),
            whitelist_ips: Vec::new(),
        }
    }
}

struct BlockerState {
    blocked: HashMap<BlockKey, BlockedIp>,
    config: BlockerConfig,
}

pub struct IpBlocker {
    provider: Arc<dyn EdgeProvider>,
    state: Mutex<BlockerState>,
    ledger_path: PathBuf,
    event_tx: mpsc::Sender<BlockEvent>,
}

impl IpBlocker {
    /// Create the blocker, loading any persisted ledger. Returns the blocker
    /// and the receiver carrying block events.
    pub fn new(
        provider: Arc<dyn EdgeProvider>,
        config: BlockerConfig,
        data_dir: &std::path::Path,
    ) -> (Self, mpsc::Receiver<BlockEvent>) {
        let ledger_path = data_dir.join("blocked_ips.json");
        let blocked = match std::fs::read(&ledger_path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<BlockedIp>>(&bytes) {
                Ok(entries) => {
                    info!(count = entries.len(), "loaded blocked IP ledger");
                    entries
                        .into_iter()
                        .map(|b| {
                            (
                                BlockKey {
                                    ip: b.ip.clone(),
                                    zone_id: b.zone_id.clone(),
                                },
                                b,
                            )
                        })
                        .collect()
                }
                Err(e) => {
                    warn!(error = %e, "blocked IP ledger unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        let (event_tx, event_rx) = mpsc::channel(100);
        (
            Self {
                provider,
                state: Mutex::new(BlockerState { blocked, config }),
                ledger_path,
                event_tx,
            },
            event_rx,
        )
    }

    /// Rewrite the ledger atomically. Called with the state lock held so
    /// writes are totally ordered and the file is always a consistent
    /// snapshot.
    async fn persist(&self, state: &BlockerState) {
        if let Some(dir) = self.ledger_path.parent() {
            let _ = tokio::fs::create_dir_all(dir).await;
        }
        let entries: Vec<&BlockedIp> = state.blocked.values().collect();
        let Ok(bytes) = serde_json::to_vec_pretty(&entries) else {
            error!("failed to serialize blocked IP ledger");
            return;
        };
        let tmp = self.ledger_path.with_extension("json.tmp");
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            error!(error = %e, "failed to write ledger temp file");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.ledger_path).await {
            error!(error = %e, "failed to swap ledger into place");
        }
    }

    fn send_event(&self, event: BlockEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("block event channel full, event dropped");
        }
    }

    /// Block a detected threat on every protected zone. No-op when auto
    /// blocking is disabled, the IP is whitelisted, or it is already
    /// blocked.
    pub async fn block_threat(&self, threat: &Threat) -> AgentResult<()> {
        self.block_threat_for(threat, None).await
    }

    /// As [`block_threat`], with an optional per-rule duration override.
    pub async fn block_threat_for(
        &self,
        threat: &Threat,
        duration_override: Option<Duration>,
    ) -> AgentResult<()> {
        {
            let state = self.state.lock().await;
            if !state.config.auto_block_enabled {
                return Ok(());
            }
            if state.config.whitelist_ips.iter().any(|w| w == &threat.ip) {
                debug!(ip = %threat.ip, "whitelisted, skipping block");
                return Ok(());
            }
            if state.blocked.keys().any(|k| k.ip == threat.ip) {
                debug!(ip = %threat.ip, "already blocked");
                return Ok(());
            }
        }

        let reason = if threat.description.is_empty() {
            format!("auto-blocked: {:?}", threat.threat_type)
        } else {
            threat.description.clone()
        };

        let zones = self.protected_zones().await?;
        for zone in zones {
            if let Err(e) = self
                .block_on_zone(&threat.ip, &zone, &reason, threat, true, duration_override)
                .await
            {
                error!(ip = %threat.ip, zone = %zone.name, error = %e, "block failed");
            }
        }
        Ok(())
    }

    async fn block_on_zone(
        &self,
        ip: &str,
        zone: &Zone,
        reason: &str,
        threat: &Threat,
        auto: bool,
        duration_override: Option<Duration>,
    ) -> AgentResult<()> {
        let mode = { self.state.lock().await.config.block_mode.clone() };
        let rule = self
            .provider
            .create_access_rule(&zone.id, &mode, ip, reason)
            .await?;

        let mut state = self.state.lock().await;
        let duration_secs = duration_override
            .map(|d| d.as_secs())
            .unwrap_or(state.config.default_block_duration_secs);
        let expires_at =
            (duration_secs > 0).then(|| Utc::now() + chrono::Duration::seconds(duration_secs as i64));

        let blocked = BlockedIp {
            ip: ip.to_string(),
            rule_id: rule.id,
            zone_id: zone.id.clone(),
            zone_name: zone.name.clone(),
            reason: reason.to_string(),
            threat_type: threat.threat_type,
            score: threat.score,
            blocked_at: Utc::now(),
            expires_at,
            auto_blocked: auto,
        };
        state.blocked.insert(
            BlockKey {
                ip: ip.to_string(),
                zone_id: zone.id.clone(),
            },
            blocked,
        );
        self.persist(&state).await;
        drop(state);

        info!(ip, zone = %zone.name, reason, auto, "IP blocked");
        self.send_event(BlockEvent {
            event: "blocked",
            ip: ip.to_string(),
            zone_id: zone.id.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Operator-initiated block: skips the whitelist and score checks.
    pub async fn manual_block(
        &self,
        ip: &str,
        zone_id: &str,
        reason: &str,
        duration: Option<Duration>,
    ) -> AgentResult<BlockedIp> {
        let zone = self.provider.get_zone(zone_id).await?;
        let synthetic = Threat {
            id: String::new(),
            ip: ip.to_string(),
            threat_type: ThreatType::Unknown,
            score: 0,
            description: reason.to_string(),
            source: "manual".into(),
            line: String::new(),
            timestamp: Utc::now(),
            count: 0,
        };
        self.block_on_zone(ip, &zone, reason, &synthetic, false, duration)
            .await?;

        let state = self.state.lock().await;
        state
            .blocked
            .get(&BlockKey {
                ip: ip.to_string(),
                zone_id: zone_id.to_string(),
            })
            .cloned()
            .ok_or_else(|| AgentError::Internal("block record missing after insert".into()))
    }

    /// Remove a block: delete the edge rule, drop the ledger entry, persist,
    /// and emit an unblocked event.
    pub async fn unblock(&self, ip: &str, zone_id: &str) -> AgentResult<()> {
        let key = BlockKey {
            ip: ip.to_string(),
            zone_id: zone_id.to_string(),
        };
        let entry = {
            let state = self.state.lock().await;
            state.blocked.get(&key).cloned()
        };
        let Some(entry) = entry else {
            return Ok(());
        };

        self.provider
            .delete_access_rule(zone_id, &entry.rule_id)
            .await?;

        let mut state = self.state.lock().await;
        state.blocked.remove(&key);
        self.persist(&state).await;
        drop(state);

        info!(ip, zone_id, "IP unblocked");
        self.send_event(BlockEvent {
            event: "unblocked",
            ip: ip.to_string(),
            zone_id: zone_id.to_string(),
            reason: "manual unblock".into(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Whether the IP is blocked on any zone. Keyed on the parsed
    /// `(ip, zone)` pair, never on string prefixes.
    pub async fn is_blocked(&self, ip: &str) -> bool {
        self.state
            .lock()
            .await
            .blocked
            .keys()
            .any(|k| k.ip == ip)
    }

    pub async fn blocked_ips(&self) -> Vec<BlockedIp> {
        self.state.lock().await.blocked.values().cloned().collect()
    }

    pub async fn set_config(&self, config: BlockerConfig) {
        self.state.lock().await.config = config;
    }

    pub async fn config(&self) -> BlockerConfig {
        self.state.lock().await.config.clone()
    }

    /// Remove every entry whose expiry has passed. Individual delete-rule
    /// failures are logged and skipped; the loop continues.
    pub async fn check_expirations(&self) {
        let now = Utc::now();
        let expired: Vec<(BlockKey, BlockedIp)> = {
            let state = self.state.lock().await;
            state
                .blocked
                .iter()
                .filter(|(_, b)| b.expires_at.map(|e| e < now).unwrap_or(false))
                .map(|(k, b)| (k.clone(), b.clone()))
                .collect()
        };

        let mut removed = Vec::new();
        for (key, entry) in expired {
            if let Err(e) = self
                .provider
                .delete_access_rule(&entry.zone_id, &entry.rule_id)
                .await
            {
                error!(ip = %entry.ip, zone = %entry.zone_name, error = %e, "expiry delete failed");
                continue;
            }
            removed.push((key, entry));
        }

        if removed.is_empty() {
            return;
        }

        let mut state = self.state.lock().await;
        for (key, _) in &removed {
            state.blocked.remove(key);
        }
        self.persist(&state).await;
        drop(state);

        for (_, entry) in removed {
            info!(ip = %entry.ip, zone = %entry.zone_name, "block expired");
            self.send_event(BlockEvent {
                event: "expired",
                ip: entry.ip,
                zone_id: entry.zone_id,
                reason: "block expired".into(),
                timestamp: now,
            });
        }
    }

    /// Spawn the minute expiry loop.
    pub fn spawn_expiry_loop(self: &Arc<Self>) {
        let blocker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EXPIRY_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                blocker.check_expirations().await;
            }
        });
    }

    /// Resolve the zones to protect: the configured list, else all zones.
    async fn protected_zones(&self) -> AgentResult<Vec<Zone>> {
        let protected = { self.state.lock().await.config.protected_zones.clone() };
        let all = self.provider.list_zones().await?;
        if protected.is_empty() {
            return Ok(all);
        }
        Ok(all
            .into_iter()
            .filter(|z| protected.iter().any(|p| p == &z.id))
            .collect())
    }

    pub async fn stats(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let mut by_type: HashMap<String, u32> = HashMap::new();
        let mut by_zone: HashMap<String, u32> = HashMap::new();
        let mut auto = 0u32;
        for entry in state.blocked.values() {
            let type_name = serde_json::to_value(entry.threat_type)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *by_type.entry(type_name).or_insert(0) += 1;
            *by_zone.entry(entry.zone_name.clone()).or_insert(0) += 1;
            if entry.auto_blocked {
                auto += 1;
            }
        }
        serde_json::json!({
            "total_blocked": state.blocked.len(),
            "auto_blocked": auto,
            "manual_blocked": state.blocked.len() as u32 - auto,
            "by_threat_type": by_type,
            "by_zone": by_zone,
            "auto_block_enabled": state.config.auto_block_enabled,
        })
    }
}
