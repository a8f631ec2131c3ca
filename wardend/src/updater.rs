//! Auto-updater: poll releases, download and verify, swap the binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{AgentError, AgentResult};
use wardend_protocol::{UpdateConfigMsg, UpdateInfoMsg, UpdateRecordMsg};

const DEFAULT_RELEASES_API: &str = "https://api.github.com/repos/wardend/wardend/releases/tags";

/// Update history entries kept on disk.
const HISTORY_RETENTION: usize = 50;

/// The binary name expected inside release tarballs.
const BINARY_NAME: &str = "wardend";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub auto_update: bool,
    pub check_interval_secs: u64,
    pub channel: String,
    pub notify_only: bool,
    pub last_check: Option<String>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            auto_update: false,
            check_interval_secs: 3600,
            channel: "stable".into(),
            notify_only: true,
            last_check: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    size: u64,
    browser_download_url: String,
}

struct UpdaterState {
    config: UpdaterConfig,
    history: Vec<UpdateRecordMsg>,
}

pub struct Updater {
    current_version: String,
    data_dir: PathBuf,
    releases_api: String,
    http: reqwest::Client,
    state: Mutex<UpdaterState>,
}

impl Updater {
    pub fn new(current_version: &str, data_dir: PathBuf) -> AgentResult<Self> {
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| AgentError::Internal(format!("creating data dir: {}", e)))?;

        let config = std::fs::read(data_dir.join("update_config.json"))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        let history = std::fs::read(data_dir.join("update_history.json"))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();

        Ok(Self {
            current_version: current_version.to_string(),
            data_dir,
            releases_api: DEFAULT_RELEASES_API.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent(format!("wardend/{}", current_version))
                .build()
                .map_err(|e| AgentError::Internal(format!("building http client: {}", e)))?,
            state: Mutex::new(UpdaterState { config, history }),
        })
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    async fn save_config(&self, state: &UpdaterState) {
        if let Ok(bytes) = serde_json::to_vec_pretty(&state.config) {
            let _ = tokio::fs::write(self.data_dir.join("update_config.json"), bytes).await;
        }
    }

    async fn save_history(&self, state: &UpdaterState) {
        if let Ok(bytes) = serde_json::to_vec_pretty(&state.history) {
            let _ = tokio::fs::write(self.data_dir.join("update_history.json"), bytes).await;
        }
    }

    pub async fn config(&self) -> UpdateConfigMsg {
        let state = self.state.lock().await;
        UpdateConfigMsg {
            auto_update: state.config.auto_update,
            check_interval_secs: state.config.check_interval_secs,
            channel: state.config.channel.clone(),
            notify_only: state.config.notify_only,
        }
    }

    pub async fn set_config(&self, msg: UpdateConfigMsg) {
        let mut state = self.state.lock().await;
        state.config.auto_update = msg.auto_update;
        state.config.check_interval_secs = msg.check_interval_secs.max(60);
        state.config.channel = msg.channel;
        state.config.notify_only = msg.notify_only;
        self.save_config(&state).await;
    }

    pub async fn history(&self) -> Vec<UpdateRecordMsg> {
        self.state.lock().await.history.clone()
    }

    /// Query the releases endpoint for the configured channel and compare
    /// the matching asset's version against the running version.
    pub async fn check(&self) -> AgentResult<UpdateInfoMsg> {
        let channel = {
            let mut state = self.state.lock().await;
            state.config.last_check = Some(chrono::Utc::now().to_rfc3339());
            self.save_config(&state).await;
            state.config.channel.clone()
        };

        let tag = match channel.as_str() {
            "stable" => "latest".to_string(),
            other => other.to_string(),
        };
        let url = format!("{}/{}", self.releases_api, tag);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::Internal(format!("release check failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(AgentError::Internal(format!(
                "release endpoint returned {}",
                response.status()
            )));
        }
        let release: Release = response
            .json()
            .await
            .map_err(|e| AgentError::Internal(format!("decoding release: {}", e)))?;

        Ok(build_update_info(&release, &self.current_version))
    }

    /// Download, verify, extract, and swap the running binary, then schedule
    /// a restart. `restart` is disabled in tests.
    pub async fn download_and_apply(
        &self,
        info: &UpdateInfoMsg,
        restart: bool,
    ) -> AgentResult<()> {
        if !info.available {
            return Err(AgentError::FailedPrecondition("no update available".into()));
        }
        let current_exe = std::env::current_exe()
            .map_err(|e| AgentError::Internal(format!("resolving current executable: {}", e)))?;

        let result = self.download_and_install(info, &current_exe).await;
        self.record(&info.latest_version, result.as_ref().err()).await;
        result?;

        info!(version = %info.latest_version, "update applied");
        if restart {
            tokio::spawn(restart_service());
        }
        Ok(())
    }

    async fn download_and_install(
        &self,
        info: &UpdateInfoMsg,
        target: &Path,
    ) -> AgentResult<()> {
        let binary_path = self.download_to_cache(info).await?;
        install_binary(&binary_path, target).await?;
        let _ = tokio::fs::remove_file(&binary_path).await;
        Ok(())
    }

    /// Download and verify the release, leaving the extracted binary in the
    /// downloads directory.
    pub async fn download_to_cache(&self, info: &UpdateInfoMsg) -> AgentResult<PathBuf> {
        let downloads = self.data_dir.join("downloads");
        tokio::fs::create_dir_all(&downloads)
            .await
            .map_err(|e| AgentError::from_io(e, "creating downloads dir"))?;

        // Download the release tarball.
        let tar_path = downloads.join(format!("wardend-{}.tar.gz", info.latest_version));
        let response = self
            .http
            .get(&info.download_url)
            .send()
            .await
            .map_err(|e| AgentError::Internal(format!("downloading update: {}", e)))?;
        if !response.status().is_success() {
            return Err(AgentError::Internal(format!(
                "update download returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AgentError::Internal(format!("reading update body: {}", e)))?;
        tokio::fs::write(&tar_path, &bytes)
            .await
            .map_err(|e| AgentError::from_io(e, "writing update tarball"))?;

        // Optional integrity check.
        if let Some(expected) = info.checksum.as_deref() {
            let actual = sha256_hex(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&tar_path).await;
                return Err(AgentError::InvalidArgument(format!(
                    "checksum mismatch: expected {}, got {}",
                    expected, actual
                )));
            }
        }

        // Extract the binary.
        let binary_path = downloads.join(BINARY_NAME);
        let extract_result = {
            let tar_path = tar_path.clone();
            let downloads = downloads.clone();
            tokio::task::spawn_blocking(move || extract_binary(&tar_path, &downloads))
                .await
                .map_err(|e| AgentError::Internal(format!("extraction task failed: {}", e)))?
        };
        let _ = tokio::fs::remove_file(&tar_path).await;
        extract_result?;

        Ok(binary_path)
    }

    async fn record(&self, version: &str, error: Option<&AgentError>) {
        let mut state = self.state.lock().await;
        state.history.push(UpdateRecordMsg {
            version: version.to_string(),
            from_version: self.current_version.clone(),
            timestamp: chrono::Utc::now().timestamp(),
            success: error.is_none(),
            error: error.map(|e| e.to_rpc().message),
        });
        if state.history.len() > HISTORY_RETENTION {
            let excess = state.history.len() - HISTORY_RETENTION;
            state.history.drain(..excess);
        }
        self.save_history(&state).await;
    }

    /// Check immediately, then on every interval tick while auto-update is
    /// on.
    pub fn spawn_auto_loop(self: &Arc<Self>) {
        let updater = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (enabled, interval) = {
                    let state = updater.state.lock().await;
                    (state.config.auto_update, state.config.check_interval_secs)
                };
                if enabled {
                    updater.auto_check_once().await;
                }
                tokio::time::sleep(Duration::from_secs(interval.max(60))).await;
            }
        });
    }

    async fn auto_check_once(&self) {
        let info = match self.check().await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e.to_rpc().message, "update check failed");
                return;
            }
        };
        if !info.available {
            return;
        }
        info!(
            current = %info.current_version,
            latest = %info.latest_version,
            critical = info.is_critical,
            "update available"
        );
        let notify_only = self.state.lock().await.config.notify_only;
        if notify_only && !info.is_critical {
            return;
        }
        if let Err(e) = self.download_and_apply(&info, true).await {
            error!(error = %e.to_rpc().message, "auto-update failed");
        }
    }
}

fn build_update_info(release: &Release, current_version: &str) -> UpdateInfoMsg {
    let asset_name = format!(
        "{}-{}-{}",
        BINARY_NAME,
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    let asset = release.assets.iter().find(|a| a.name == asset_name);
    let latest = release.tag_name.trim_start_matches('v').to_string();
    let current = current_version.trim_start_matches('v');

    UpdateInfoMsg {
        available: asset.is_some() && latest != current,
        current_version: current_version.to_string(),
        latest_version: latest,
        download_url: asset.map(|a| a.browser_download_url.clone()).unwrap_or_default(),
        size: asset.map(|a| a.size).unwrap_or(0),
        checksum: None,
        release_notes: release.body.clone(),
        is_critical: release.body.to_lowercase().contains("[critical]"),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Pull the expected binary out of the release tarball.
fn extract_binary(tar_path: &Path, dest_dir: &Path) -> AgentResult<()> {
    let file = std::fs::File::open(tar_path)
        .map_err(|e| AgentError::from_io(e, "opening update tarball"))?;
    let gz = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(gz);

    let entries = archive
        .entries()
        .map_err(|e| AgentError::InvalidArgument(format!("reading update tarball: {}", e)))?;
    for entry in entries {
        let mut entry = entry
            .map_err(|e| AgentError::InvalidArgument(format!("reading tarball entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| AgentError::InvalidArgument(format!("tarball entry path: {}", e)))?;
        let is_binary = path
            .file_name()
            .map(|n| n == BINARY_NAME)
            .unwrap_or(false);
        if is_binary {
            entry
                .unpack(dest_dir.join(BINARY_NAME))
                .map_err(|e| AgentError::Internal(format!("unpacking binary: {}", e)))?;
            return Ok(());
        }
    }
    Err(AgentError::NotFound(format!(
        "tarball does not contain the {} binary",
        BINARY_NAME
    )))
}

/// Backup the running executable, install the new one with mode 0755, and
/// roll back on failure.
async fn install_binary(new_binary: &Path, target: &Path) -> AgentResult<()> {
    if tokio::fs::metadata(new_binary).await.is_err() {
        return Err(AgentError::NotFound(format!(
            "update binary missing: {}",
            new_binary.display()
        )));
    }

    let backup = PathBuf::from(format!("{}.backup", target.display()));
    tokio::fs::rename(target, &backup)
        .await
        .map_err(|e| AgentError::from_io(e, "backing up current binary"))?;

    if let Err(e) = tokio::fs::copy(new_binary, target).await {
        // Restore the previous binary before surfacing the failure.
        let _ = tokio::fs::rename(&backup, target).await;
        return Err(AgentError::from_io(e, "installing new binary"));
    }

    use std::os::unix::fs::PermissionsExt;
    let _ = tokio::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755)).await;
    Ok(())
}

/// Restart through the service manager; fall back to exiting and letting a
/// supervisor bring the agent back.
async fn restart_service() {
    tokio::time::sleep(Duration::from_secs(2)).await;
    match tokio::process::Command::new("systemctl")
        .args(["restart", "wardend"])
        .status()
        .await
    {
        Ok(status) if status.success() => {}
        _ => {
            info!("restarting via process exit");
            std::process::exit(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release_json(tag: &str, asset_name: &str) -> Release {
        serde_json::from_value(serde_json::json!({
            "tag_name": tag,
            "body": "release notes",
            "assets": [
                { "name": asset_name, "size": 1234, "browser_download_url": "https://example.com/dl" },
                { "name": "wardend-windows-x86_64", "size": 99, "browser_download_url": "https://example.com/win" },
            ],
        }))
        .unwrap()
    }

    fn host_asset_name() -> String {
        format!("wardend-{}-{}", std::env::consts::OS, std::env::consts::ARCH)
    }

    #[test]
    fn update_available_when_versions_differ() {
        let release = release_json("v0.2.0", &host_asset_name());
        let info = build_update_info(&release, "0.1.0");
        assert!(info.available);
        assert_eq!(info.latest_version, "0.2.0");
        assert_eq!(info.download_url, "https://example.com/dl");
        assert_eq!(info.size, 1234);
    }

    #[test]
    fn no_update_when_on_latest() {
        let release = release_json("v0.1.0", &host_asset_name());
        let info = build_update_info(&release, "0.1.0");
        assert!(!info.available);
    }

    #[test]
    fn no_update_without_matching_asset() {
        let release = release_json("v9.9.9", "wardend-plan9-mips");
        let info = build_update_info(&release, "0.1.0");
        assert!(!info.available);
        assert!(info.download_url.is_empty());
    }

    #[test]
    fn critical_marker_in_notes_detected() {
        let mut release = release_json("v0.2.0", &host_asset_name());
        release.body = "Fixes CVE-2026-1234 [CRITICAL]".into();
        let info = build_update_info(&release, "0.1.0");
        assert!(info.is_critical);
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn config_roundtrip_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let updater = Updater::new("0.1.0", dir.path().to_path_buf()).unwrap();
            updater
                .set_config(UpdateConfigMsg {
                    auto_update: true,
                    check_interval_secs: 600,
                    channel: "beta".into(),
                    notify_only: false,
                })
                .await;
        }
        let updater2 = Updater::new("0.1.0", dir.path().to_path_buf()).unwrap();
        let config = updater2.config().await;
        assert!(config.auto_update);
        assert_eq!(config.check_interval_secs, 600);
        assert_eq!(config.channel, "beta");
    }

    #[tokio::test]
    async fn interval_is_clamped_to_a_minute() {
        let dir = tempfile::tempdir().unwrap();
        let updater = Updater::new("0.1.0", dir.path().to_path_buf()).unwrap();
        updater
            .set_config(UpdateConfigMsg {
                auto_update: false,
                check_interval_secs: 1,
                channel: "stable".into(),
                notify_only: true,
            })
            .await;
        assert_eq!(updater.config().await.check_interval_secs, 60);
    }

    #[tokio::test]
    async fn history_keeps_a_bounded_ring() {
        let dir = tempfile::tempdir().unwrap();
        let updater = Updater::new("0.1.0", dir.path().to_path_buf()).unwrap();
        for i in 0..60 {
            updater.record(&format!("0.2.{}", i), None).await;
        }
        let history = updater.history().await;
        assert_eq!(history.len(), HISTORY_RETENTION);
        assert_eq!(history.first().unwrap().version, "0.2.10");
        assert_eq!(history.last().unwrap().version, "0.2.59");

        // Persisted ring reloads.
        let updater2 = Updater::new("0.1.0", dir.path().to_path_buf()).unwrap();
        assert_eq!(updater2.history().await.len(), HISTORY_RETENTION);
    }

    #[test]
    fn extract_binary_finds_nested_entry() {
        let dir = tempfile::tempdir().unwrap();
        let gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "release/wardend", &b"elf!\n"[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();
        let tar_path = dir.path().join("rel.tar.gz");
        std::fs::write(&tar_path, bytes).unwrap();

        extract_binary(&tar_path, dir.path()).unwrap();
        assert_eq!(std::fs::read(dir.path().join("wardend")).unwrap(), b"elf!\n");
    }

    #[test]
    fn extract_binary_errors_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        let mut header = tar::Header::new_gnu();
        header.set_size(1);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "README", &b"x"[..]).unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();
        let tar_path = dir.path().join("rel.tar.gz");
        std::fs::write(&tar_path, bytes).unwrap();

        assert!(extract_binary(&tar_path, dir.path()).is_err());
    }

    #[tokio::test]
    async fn install_swaps_binary_and_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("wardend");
        let new = dir.path().join("wardend.new");
        std::fs::write(&target, b"old").unwrap();
        std::fs::write(&new, b"new").unwrap();

        install_binary(&new, &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
        assert_eq!(
            std::fs::read(format!("{}.backup", target.display())).unwrap(),
            b"old"
        );
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn failed_install_restores_backup() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("wardend");
        std::fs::write(&target, b"old").unwrap();

        let err = install_binary(Path::new("/nonexistent/binary"), &target).await;
        assert!(err.is_err());
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
    }
}
