//! Plugin lifecycle manager.
//!
//! One directory per plugin under the plugins root plus an `installed.json`
//! ledger. Install sources: the official repository, an arbitrary URL, or
//! inline bytes; every tarball goes through the same path-traversal guard as
//! file uploads.

pub mod instance;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::transfer::extract_tar_gz;
use instance::{create_instance, PluginInstance};
use wardend_protocol::PluginStatusInfo;

const DEFAULT_REPO_URL: &str = "https://plugins.wardend.dev";

/// Cap on fetched plugin tarballs.
const MAX_PLUGIN_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Installed,
    Enabled,
    Disabled,
    Error,
    Updating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Client,
    Agent,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub entry_point: String,
    /// Default configuration shipped with the plugin.
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledPlugin {
    pub manifest: PluginManifest,
    pub state: PluginState,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub config: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Runtime {
    instance: Arc<dyn PluginInstance>,
    started_at: Instant,
}

pub struct PluginManager {
    plugins_dir: PathBuf,
    data_dir: PathBuf,
    repo_url: String,
    http: reqwest::Client,
    plugins: Mutex<HashMap<String, InstalledPlugin>>,
    runtimes: Mutex<HashMap<String, Runtime>>,
}

impl PluginManager {
    pub fn new(plugins_dir: PathBuf, data_dir: PathBuf) -> AgentResult<Self> {
        std::fs::create_dir_all(&plugins_dir)
            .map_err(|e| AgentError::Internal(format!("creating plugins dir: {}", e)))?;

        let ledger_path = plugins_dir.join("installed.json");
        let plugins = match std::fs::read(&ledger_path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<InstalledPlugin>>(&bytes) {
                Ok(list) => {
                    info!(count = list.len(), "loaded installed plugins");
                    list.into_iter()
                        .map(|p| (p.manifest.id.clone(), p))
                        .collect()
                }
                Err(e) => {
                    warn!(error = %e, "plugin ledger unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            plugins_dir,
            data_dir,
            repo_url: DEFAULT_REPO_URL.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| AgentError::Internal(format!("building http client: {}", e)))?,
            plugins: Mutex::new(plugins),
            runtimes: Mutex::new(HashMap::new()),
        })
    }

    async fn persist(&self, plugins: &HashMap<String, InstalledPlugin>) {
        let list: Vec<&InstalledPlugin> = plugins.values().collect();
        let Ok(bytes) = serde_json::to_vec_pretty(&list) else {
            error!("failed to serialize plugin ledger");
            return;
        };
        let path = self.plugins_dir.join("installed.json");
        let tmp = path.with_extension("json.tmp");
        if tokio::fs::write(&tmp, &bytes).await.is_ok() {
            let _ = tokio::fs::rename(&tmp, &path).await;
        }
    }

    fn plugin_dir(&self, id: &str) -> PathBuf {
        self.plugins_dir.join(id)
    }

    /// Install a plugin from the official repo, an arbitrary URL, or inline
    /// tarball bytes.
    pub async fn install(
        &self,
        id: &str,
        source: &str,
        url: Option<&str>,
        data: Option<Vec<u8>>,
    ) -> AgentResult<InstalledPlugin> {
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(AgentError::InvalidArgument("invalid plugin id".into()));
        }
        {
            let plugins = self.plugins.lock().await;
            if plugins.contains_key(id) {
                return Err(AgentError::FailedPrecondition(format!(
                    "plugin {} is already installed",
                    id
                )));
            }
        }

        let tarball = match source {
            "official" => {
                let url = format!("{}/plugins/{}/latest.tar.gz", self.repo_url, id);
                self.fetch(&url).await?
            }
            "url" => {
                let url = url.ok_or_else(|| {
                    AgentError::InvalidArgument("url source requires a url".into())
                })?;
                self.fetch(url).await?
            }
            "inline" => data.ok_or_else(|| {
                AgentError::InvalidArgument("inline source requires data".into())
            })?,
            other => {
                return Err(AgentError::InvalidArgument(format!(
                    "unknown install source: {}",
                    other
                )))
            }
        };

        let plugin_dir = self.plugin_dir(id);
        let result = self.extract_and_register(id, &plugin_dir, tarball).await;
        if result.is_err() {
            let _ = tokio::fs::remove_dir_all(&plugin_dir).await;
        }
        result
    }

    async fn extract_and_register(
        &self,
        id: &str,
        plugin_dir: &Path,
        tarball: Vec<u8>,
    ) -> AgentResult<InstalledPlugin> {
        let tmp = tempfile_path(&self.plugins_dir, id);
        tokio::fs::write(&tmp, &tarball)
            .await
            .map_err(|e| AgentError::from_io(e, "staging plugin tarball"))?;

        tokio::fs::create_dir_all(plugin_dir)
            .await
            .map_err(|e| AgentError::from_io(e, "creating plugin dir"))?;

        let extract_result = {
            let tmp = tmp.clone();
            let dir = plugin_dir.to_path_buf();
            tokio::task::spawn_blocking(move || extract_tar_gz(&tmp, &dir))
                .await
                .map_err(|e| AgentError::Internal(format!("extraction task failed: {}", e)))?
        };
        let _ = tokio::fs::remove_file(&tmp).await;
        extract_result?;

        let manifest_bytes = tokio::fs::read(plugin_dir.join("plugin.json"))
            .await
            .map_err(|e| AgentError::from_io(e, "reading plugin manifest"))?;
        let manifest: PluginManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| AgentError::InvalidArgument(format!("invalid plugin manifest: {}", e)))?;
        if manifest.id != id {
            return Err(AgentError::InvalidArgument(format!(
                "manifest id '{}' does not match requested id '{}'",
                manifest.id, id
            )));
        }

        let plugin = InstalledPlugin {
            config: manifest.config.clone(),
            manifest,
            state: PluginState::Installed,
            installed_at: Utc::now(),
            updated_at: Utc::now(),
            error: None,
        };

        let mut plugins = self.plugins.lock().await;
        plugins.insert(id.to_string(), plugin.clone());
        self.persist(&plugins).await;
        info!(id, version = %plugin.manifest.version, "plugin installed");
        Ok(plugin)
    }

    async fn fetch(&self, url: &str) -> AgentResult<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AgentError::Internal(format!("downloading plugin: {}", e)))?;
        if !response.status().is_success() {
            return Err(AgentError::NotFound(format!(
                "plugin download failed: {}",
                response.status()
            )));
        }
        if let Some(len) = response.content_length() {
            if len > MAX_PLUGIN_SIZE {
                return Err(AgentError::InvalidArgument(
                    "plugin tarball exceeds the size limit".into(),
                ));
            }
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AgentError::Internal(format!("reading plugin body: {}", e)))?;
        if bytes.len() as u64 > MAX_PLUGIN_SIZE {
            return Err(AgentError::InvalidArgument(
                "plugin tarball exceeds the size limit".into(),
            ));
        }
        Ok(bytes.to_vec())
    }

    pub async fn uninstall(&self, id: &str) -> AgentResult<()> {
        {
            let plugins = self.plugins.lock().await;
            if !plugins.contains_key(id) {
                return Err(AgentError::NotFound(format!("plugin {} is not installed", id)));
            }
        }

        self.stop_runtime(id).await;

        let _ = tokio::fs::remove_dir_all(self.plugin_dir(id)).await;

        let mut plugins = self.plugins.lock().await;
        plugins.remove(id);
        self.persist(&plugins).await;
        info!(id, "plugin uninstalled");
        Ok(())
    }

    pub async fn enable(&self, id: &str) -> AgentResult<()> {
        let (plugin_type, config) = {
            let plugins = self.plugins.lock().await;
            let plugin = plugins
                .get(id)
                .ok_or_else(|| AgentError::NotFound(format!("plugin {} is not installed", id)))?;
            if plugin.state == PluginState::Enabled {
                return Ok(());
            }
            (plugin.manifest.plugin_type, plugin.config.clone())
        };

        let start_result = if plugin_type == PluginType::Client {
            // Client-only plugins carry no agent-side runtime.
            Ok(())
        } else {
            self.start_runtime(id, &config).await
        };

        let mut plugins = self.plugins.lock().await;
        let plugin = plugins
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(format!("plugin {} vanished", id)))?;
        match start_result {
            Ok(()) => {
                plugin.state = PluginState::Enabled;
                plugin.error = None;
                plugin.updated_at = Utc::now();
                self.persist(&plugins).await;
                info!(id, "plugin enabled");
                Ok(())
            }
            Err(e) => {
                plugin.state = PluginState::Error;
                plugin.error = Some(e.to_rpc().message.clone());
                plugin.updated_at = Utc::now();
                self.persist(&plugins).await;
                Err(e)
            }
        }
    }

    pub async fn disable(&self, id: &str) -> AgentResult<()> {
        {
            let plugins = self.plugins.lock().await;
            if !plugins.contains_key(id) {
                return Err(AgentError::NotFound(format!("plugin {} is not installed", id)));
            }
        }

        self.stop_runtime(id).await;

        let mut plugins = self.plugins.lock().await;
        if let Some(plugin) = plugins.get_mut(id) {
            plugin.state = PluginState::Disabled;
            plugin.updated_at = Utc::now();
        }
        self.persist(&plugins).await;
        info!(id, "plugin disabled");
        Ok(())
    }

    async fn start_runtime(&self, id: &str, config: &serde_json::Value) -> AgentResult<()> {
        let instance = create_instance(id, &self.data_dir);
        instance.start(config).await?;
        self.runtimes.lock().await.insert(
            id.to_string(),
            Runtime {
                instance,
                started_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn stop_runtime(&self, id: &str) {
        let runtime = self.runtimes.lock().await.remove(id);
        if let Some(runtime) = runtime {
            if let Err(e) = runtime.instance.stop().await {
                warn!(id, error = %e.to_rpc().message, "plugin stop failed");
            }
        }
    }

    pub async fn get_config(&self, id: &str) -> AgentResult<serde_json::Value> {
        let plugins = self.plugins.lock().await;
        plugins
            .get(id)
            .map(|p| p.config.clone())
            .ok_or_else(|| AgentError::NotFound(format!("plugin {} is not installed", id)))
    }

    /// Write the new config to the plugin dir; a running plugin restarts to
    /// apply it.
    pub async fn set_config(&self, id: &str, config: serde_json::Value) -> AgentResult<()> {
        {
            let mut plugins = self.plugins.lock().await;
            let plugin = plugins
                .get_mut(id)
                .ok_or_else(|| AgentError::NotFound(format!("plugin {} is not installed", id)))?;
            plugin.config = config.clone();
            plugin.updated_at = Utc::now();

            let config_path = self.plugin_dir(id).join("config.json");
            let bytes = serde_json::to_vec_pretty(&config)
                .map_err(|e| AgentError::Internal(format!("encoding config: {}", e)))?;
            tokio::fs::write(&config_path, bytes)
                .await
                .map_err(|e| AgentError::from_io(e, "writing plugin config"))?;
            self.persist(&plugins).await;
        }

        let was_running = self.runtimes.lock().await.contains_key(id);
        if was_running {
            self.stop_runtime(id).await;
            self.start_runtime(id, &config).await?;
        }
        Ok(())
    }

    pub async fn status(&self, id: &str) -> AgentResult<PluginStatusInfo> {
        let (state, error) = {
            let plugins = self.plugins.lock().await;
            let plugin = plugins
                .get(id)
                .ok_or_else(|| AgentError::NotFound(format!("plugin {} is not installed", id)))?;
            (plugin.state, plugin.error.clone())
        };

        let runtimes = self.runtimes.lock().await;
        let (running, uptime_secs, stats) = match runtimes.get(id) {
            Some(runtime) => (
                true,
                runtime.started_at.elapsed().as_secs(),
                runtime.instance.status().await,
            ),
            None => (false, 0, HashMap::new()),
        };

        Ok(PluginStatusInfo {
            id: id.to_string(),
            state: state_name(state),
            running,
            uptime_secs,
            error,
            stats,
        })
    }

    pub async fn list(&self) -> Vec<InstalledPlugin> {
        let mut list: Vec<_> = self.plugins.lock().await.values().cloned().collect();
        list.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        list
    }

    /// Start every plugin persisted as enabled. Per-plugin failures move the
    /// plugin to the error state and booting continues.
    pub async fn start_enabled(&self) {
        let enabled: Vec<(String, serde_json::Value, PluginType)> = {
            let plugins = self.plugins.lock().await;
            plugins
                .values()
                .filter(|p| p.state == PluginState::Enabled)
                .map(|p| (p.manifest.id.clone(), p.config.clone(), p.manifest.plugin_type))
                .collect()
        };

        for (id, config, plugin_type) in enabled {
            if plugin_type == PluginType::Client {
                continue;
            }
            if let Err(e) = self.start_runtime(&id, &config).await {
                error!(id = %id, error = %e.to_rpc().message, "plugin failed to start at boot");
                let mut plugins = self.plugins.lock().await;
                if let Some(plugin) = plugins.get_mut(&id) {
                    plugin.state = PluginState::Error;
                    plugin.error = Some(e.to_rpc().message.clone());
                }
                self.persist(&plugins).await;
            }
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.runtimes.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop_runtime(&id).await;
        }
    }
}

pub fn state_name(state: PluginState) -> String {
    match state {
        PluginState::Installed => "installed",
        PluginState::Enabled => "enabled",
        PluginState::Disabled => "disabled",
        PluginState::Error => "error",
        PluginState::Updating => "updating",
    }
    .to_string()
}

fn tempfile_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!(".{}-{}.tar.gz", id, uuid::Uuid::new_v4()))
}
