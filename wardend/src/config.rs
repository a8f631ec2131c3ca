use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the wardend daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub metrics: MetricsConfig,
    pub log: LogConfig,
    pub data: DataConfig,
    pub plugins: PluginsConfig,
    pub update: UpdateSettings,
    pub ratelimit: RateLimitConfig,
    pub audit: AuditConfig,
    pub security: SecurityPolicyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
            log: LogConfig::default(),
            data: DataConfig::default(),
            plugins: PluginsConfig::default(),
            update: UpdateSettings::default(),
            ratelimit: RateLimitConfig::default(),
            audit: AuditConfig::default(),
            security: SecurityPolicyConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// A missing file is not fatal: defaults are used, matching the behavior
    /// of a freshly provisioned host.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str::<Config>(&content)
                .with_context(|| format!("parsing config: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                Config::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading config: {}", path.display()))
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables named after the dotted config keys (uppercased,
    /// dots replaced by underscores) override file values.
    pub fn apply_env_overrides(&mut self) {
        fn env(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }

        if let Some(v) = env("SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = env("SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = v;
        }
        if let Some(v) = env("SERVER_API_PORT").and_then(|v| v.parse().ok()) {
            self.server.api_port = v;
        }
        if let Some(v) = env("SERVER_TLS_ENABLED").and_then(|v| v.parse().ok()) {
            self.server.tls.enabled = v;
        }
        if let Some(v) = env("SERVER_TLS_CERT") {
            self.server.tls.cert = Some(PathBuf::from(v));
        }
        if let Some(v) = env("SERVER_TLS_KEY") {
            self.server.tls.key = Some(PathBuf::from(v));
        }
        if let Some(v) = env("AUTH_TOKEN") {
            self.auth.token = v;
        }
        if let Some(v) = env("METRICS_INTERVAL").and_then(|v| v.parse().ok()) {
            self.metrics.interval_secs = v;
        }
        if let Some(v) = env("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = env("DATA_DIR") {
            self.data.dir = PathBuf::from(v);
        }
        if let Some(v) = env("PLUGINS_DIR") {
            self.plugins.dir = PathBuf::from(v);
        }
        if let Some(v) = env("UPDATE_AUTO").and_then(|v| v.parse().ok()) {
            self.update.auto = v;
        }
        if let Some(v) = env("UPDATE_CHANNEL") {
            self.update.channel = v;
        }
        if let Some(v) = env("UPDATE_INTERVAL").and_then(|v| v.parse().ok()) {
            self.update.interval_secs = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.server.port != 0, "server.port must be non-zero");
        anyhow::ensure!(self.server.api_port != 0, "server.api_port must be non-zero");
        anyhow::ensure!(
            self.server.port != self.server.api_port,
            "server.port and server.api_port must differ"
        );
        anyhow::ensure!(
            self.metrics.interval_secs >= 1,
            "metrics.interval must be >= 1 second"
        );
        anyhow::ensure!(
            self.audit.max_backups >= 1,
            "audit.max_backups must be >= 1"
        );
        anyhow::ensure!(
            self.ratelimit.burst_size >= 2,
            "ratelimit.burst_size must be >= 2"
        );
        Ok(())
    }

    /// Directory holding the shield (threat pipeline) state files.
    pub fn shield_dir(&self) -> PathBuf {
        self.data.dir.join("shield")
    }

    /// Directory holding the auto-generated TLS material.
    pub fn tls_dir(&self) -> PathBuf {
        self.data.dir.join("tls")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Framed RPC listener port.
    pub port: u16,
    /// JSON/HTTP API port.
    pub api_port: u16,
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9527,
            api_port: 9528,
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Certificate path; when absent a self-signed cert is generated under
    /// the data dir.
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cert: None,
            key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Static bearer token. Empty means a random token is generated at boot
    /// and printed to the log.
    pub token: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    #[serde(rename = "interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/wardend"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub dir: PathBuf,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/wardend/plugins"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    pub auto: bool,
    pub channel: String,
    #[serde(rename = "interval")]
    pub interval_secs: u64,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            auto: false,
            channel: "stable".into(),
            interval_secs: 3600,
        }
    }
}

/// Per-IP token bucket settings. Permissive enough for normal operator use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub commands_per_minute: u32,
    pub file_ops_per_minute: u32,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 300,
            commands_per_minute: 60,
            file_ops_per_minute: 120,
            burst_size: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub log_path: PathBuf,
    pub max_size_mb: u64,
    pub max_backups: u32,
    pub min_level: String,
    pub log_success_auth: bool,
    pub log_commands: bool,
    pub log_file_ops: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: PathBuf::from("/var/log/wardend/audit.log"),
            max_size_mb: 50,
            max_backups: 5,
            min_level: "info".into(),
            log_success_auth: false,
            log_commands: true,
            log_file_ops: false,
        }
    }
}

/// Command and path policy knobs consumed by the validators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicyConfig {
    pub enable_command_whitelist: bool,
    pub allow_sudo: bool,
    pub max_command_length: usize,
    pub max_arguments: usize,
    /// Extra forbidden path prefixes beyond the built-in set.
    pub forbidden_paths: Vec<String>,
}

impl Default for SecurityPolicyConfig {
    fn default() -> Self {
        Self {
            enable_command_whitelist: false,
            allow_sudo: true,
            max_command_length: 50_000,
            max_arguments: 200,
            forbidden_paths: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9527);
        assert_eq!(config.server.api_port, 9528);
        assert!(config.server.tls.enabled);
        assert!(config.auth.token.is_empty());
        assert_eq!(config.metrics.interval_secs, 2);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.data.dir, PathBuf::from("/var/lib/wardend"));
        assert_eq!(config.plugins.dir, PathBuf::from("/var/lib/wardend/plugins"));
        assert!(!config.update.auto);
        assert_eq!(config.update.channel, "stable");
        assert_eq!(config.update.interval_secs, 3600);
    }

    #[test]
    fn default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn load_from_toml_merges_defaults() {
        let toml_content = r#"
[server]
port = 7000

[auth]
token = "secret-token-0123456789abcdef0123456789abcdef"

[metrics]
interval = 5
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 7000);
        // Unset fields use defaults.
        assert_eq!(config.server.api_port, 9528);
        assert_eq!(config.metrics.interval_secs, 5);
        assert!(config.auth.token.starts_with("secret-token"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/wardend.toml")).unwrap();
        assert_eq!(config.server.port, 9527);
    }

    #[test]
    fn validation_rejects_equal_ports() {
        let mut config = Config::default();
        config.server.api_port = config.server.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_interval() {
        let mut config = Config::default();
        config.metrics.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_override_applies() {
        std::env::set_var("AUTH_TOKEN", "env-token-value");
        std::env::set_var("SERVER_PORT", "9600");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("AUTH_TOKEN");
        std::env::remove_var("SERVER_PORT");
        assert_eq!(config.auth.token, "env-token-value");
        assert_eq!(config.server.port, 9600);
    }

    #[test]
    fn shield_and_tls_dirs_hang_off_data_dir() {
        let config = Config::default();
        assert_eq!(config.shield_dir(), PathBuf::from("/var/lib/wardend/shield"));
        assert_eq!(config.tls_dir(), PathBuf::from("/var/lib/wardend/tls"));
    }

    #[test]
    fn serde_roundtrip() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.server.port, config.server.port);
        assert_eq!(back.audit.max_backups, config.audit.max_backups);
        assert_eq!(back.ratelimit.burst_size, config.ratelimit.burst_size);
    }
}
