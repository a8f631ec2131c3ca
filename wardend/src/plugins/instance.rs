//! In-process plugin instances.
//!
//! Plugins are trusted first-party extensions loaded by id from a built-in
//! registry; third-party plugin payloads are data, never code.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{AgentError, AgentResult};
use crate::shield::{ShieldConfig, ShieldManager};

#[async_trait]
pub trait PluginInstance: Send + Sync {
    async fn start(&self, config: &serde_json::Value) -> AgentResult<()>;
    async fn stop(&self) -> AgentResult<()>;
    async fn status(&self) -> HashMap<String, String>;
}

/// Built-in registry: plugin id to instance factory.
pub fn create_instance(id: &str, data_dir: &Path) -> Arc<dyn PluginInstance> {
    match id {
        "cloudflare-security" => Arc::new(EdgeSecurityPlugin::new(data_dir)),
        _ => Arc::new(GenericPlugin::new(id)),
    }
}

/// Wires the shield pipeline (watcher, detector, blocker, rules) against the
/// configured edge provider.
pub struct EdgeSecurityPlugin {
    shield: ShieldManager,
}

impl EdgeSecurityPlugin {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            shield: ShieldManager::new(data_dir.join("shield")),
        }
    }
}

#[async_trait]
impl PluginInstance for EdgeSecurityPlugin {
    async fn start(&self, config: &serde_json::Value) -> AgentResult<()> {
        let mut shield_config = self.shield.config().await;
        if let Some(token) = config.get("api_token").and_then(|v| v.as_str()) {
            if !token.is_empty() {
                shield_config.api_token = token.to_string();
            }
        }
        if let Some(paths) = config.get("log_paths").and_then(|v| v.as_array()) {
            let parsed: Vec<std::path::PathBuf> = paths
                .iter()
                .filter_map(|p| p.as_str().map(std::path::PathBuf::from))
                .collect();
            if !parsed.is_empty() {
                shield_config.log_paths = parsed;
            }
        }
        if let Some(zones) = config.get("protected_zones").and_then(|v| v.as_array()) {
            shield_config.blocker.protected_zones = zones
                .iter()
                .filter_map(|z| z.as_str().map(str::to_string))
                .collect();
        }
        if shield_config.api_token.is_empty() {
            return Err(AgentError::FailedPrecondition(
                "edge-security plugin requires an api_token in its config".into(),
            ));
        }
        self.shield.set_config(shield_config).await;
        self.shield.start().await
    }

    async fn stop(&self) -> AgentResult<()> {
        self.shield.stop().await;
        Ok(())
    }

    async fn status(&self) -> HashMap<String, String> {
        let status = self.shield.status().await;
        let mut out = HashMap::new();
        out.insert(
            "running".into(),
            status["running"].as_bool().unwrap_or(false).to_string(),
        );
        if let Some(blocked) = status.get("total_blocked").and_then(|v| v.as_u64()) {
            out.insert("total_blocked".into(), blocked.to_string());
        }
        if let Some(tracked) = status.get("tracked_ips").and_then(|v| v.as_u64()) {
            out.insert("tracked_ips".into(), tracked.to_string());
        }
        out
    }
}

/// Fallback instance for plugin ids without native behavior. Tracks its own
/// lifecycle and exposes the active config for inspection.
pub struct GenericPlugin {
    id: String,
    running: AtomicBool,
    config: Mutex<serde_json::Value>,
}

impl GenericPlugin {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            running: AtomicBool::new(false),
            config: Mutex::new(serde_json::Value::Null),
        }
    }
}

#[async_trait]
impl PluginInstance for GenericPlugin {
    async fn start(&self, config: &serde_json::Value) -> AgentResult<()> {
        *self.config.lock().await = config.clone();
        self.running.store(true, Ordering::SeqCst);
        info!(plugin = %self.id, "generic plugin started");
        Ok(())
    }

    async fn stop(&self) -> AgentResult<()> {
        self.running.store(false, Ordering::SeqCst);
        info!(plugin = %self.id, "generic plugin stopped");
        Ok(())
    }

    async fn status(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        out.insert(
            "running".into(),
            self.running.load(Ordering::SeqCst).to_string(),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generic_plugin_tracks_lifecycle() {
        let plugin = GenericPlugin::new("demo");
        assert_eq!(plugin.status().await["running"], "false");

        plugin.start(&serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(plugin.status().await["running"], "true");
        assert_eq!(plugin.config.lock().await["x"], 1);

        plugin.stop().await.unwrap();
        assert_eq!(plugin.status().await["running"], "false");
    }

    #[tokio::test]
    async fn registry_maps_unknown_ids_to_generic() {
        let dir = tempfile::tempdir().unwrap();
        let instance = create_instance("some-random-plugin", dir.path());
        instance.start(&serde_json::Value::Null).await.unwrap();
        assert_eq!(instance.status().await["running"], "true");
    }

    #[tokio::test]
    async fn edge_security_requires_token() {
        let dir = tempfile::tempdir().unwrap();
        let instance = create_instance("cloudflare-security", dir.path());
        let err = instance.start(&serde_json::json!({})).await;
        assert!(err.is_err());
    }
}
