//! Append-only audit log.
//!
//! Producers enqueue onto a bounded channel and never block; a single
//! writer task owns the file, writing one JSON object per line and rotating
//! by size. Overflow drops the event.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::AuditConfig;

/// Queue capacity between producers and the writer.
const QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Auth,
    Command,
    File,
    Security,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl EventLevel {
    fn rank(self) -> u8 {
        match self {
            EventLevel::Info => 0,
            EventLevel::Warning => 1,
            EventLevel::Error => 2,
            EventLevel::Critical => 3,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "warning" => EventLevel::Warning,
            "error" => EventLevel::Error,
            "critical" => EventLevel::Critical,
            _ => EventLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub level: EventLevel,
    pub action: String,
    pub client_ip: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(event_type: EventType, level: EventLevel, action: &str, client_ip: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            level,
            action: action.to_string(),
            client_ip: client_ip.to_string(),
            success: true,
            message: None,
            details: None,
        }
    }
}

pub struct AuditLogger {
    config: AuditConfig,
    min_level: EventLevel,
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditLogger {
    /// Create the logger and spawn its writer task. An unwritable log path
    /// disables auditing rather than failing the daemon.
    pub fn new(mut config: AuditConfig) -> Self {
        if config.enabled {
            if let Some(dir) = config.log_path.parent() {
                if std::fs::create_dir_all(dir).is_err() {
                    warn!(path = %config.log_path.display(), "audit log dir not writable, disabling audit");
                    config.enabled = false;
                }
            }
        }

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let min_level = EventLevel::parse(&config.min_level);
        if config.enabled {
            tokio::spawn(write_loop(config.clone(), rx));
        }
        Self {
            config,
            min_level,
            tx,
        }
    }

    fn should_log(&self, event: &AuditEvent) -> bool {
        if !self.config.enabled {
            return false;
        }
        if event.level.rank() < self.min_level.rank() {
            return false;
        }
        match event.event_type {
            EventType::Auth => {
                if event.success && !self.config.log_success_auth {
                    return false;
                }
                true
            }
            EventType::Command => self.config.log_commands,
            EventType::File => self.config.log_file_ops,
            _ => true,
        }
    }

    /// Enqueue an event; drops silently when the queue is full.
    pub fn log(&self, event: AuditEvent) {
        if !self.should_log(&event) {
            return;
        }
        if self.tx.try_send(event).is_err() {
            debug!("audit queue full, event dropped");
        }
    }

    pub fn log_auth(&self, client_ip: &str, success: bool, message: &str) {
        let level = if success {
            EventLevel::Info
        } else {
            EventLevel::Warning
        };
        let mut event = AuditEvent::new(EventType::Auth, level, "authenticate", client_ip);
        event.success = success;
        event.message = Some(message.to_string());
        self.log(event);
    }

    pub fn log_command(&self, client_ip: &str, command: &str, args: &[String], exit_code: i32) {
        let mut event =
            AuditEvent::new(EventType::Command, EventLevel::Info, "execute_command", client_ip);
        event.success = exit_code == 0;
        event.details = Some(serde_json::json!({
            "command": command,
            "args": args,
            "exit_code": exit_code,
        }));
        self.log(event);
    }

    pub fn log_file_op(&self, client_ip: &str, action: &str, path: &str, success: bool) {
        let mut event = AuditEvent::new(EventType::File, EventLevel::Info, action, client_ip);
        event.success = success;
        event.details = Some(serde_json::json!({ "path": path }));
        self.log(event);
    }

    pub fn log_security(&self, client_ip: &str, action: &str, message: &str, level: EventLevel) {
        let mut event = AuditEvent::new(EventType::Security, level, action, client_ip);
        event.success = false;
        event.message = Some(message.to_string());
        self.log(event);
    }
}

/// The single writer: consumes the queue, appends JSON lines, rotates by
/// size before each write.
async fn write_loop(config: AuditConfig, mut rx: mpsc::Receiver<AuditEvent>) {
    let mut file = match open_log(&config.log_path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "cannot open audit log, audit disabled");
            return;
        }
    };

    while let Some(event) = rx.recv().await {
        let max_bytes = config.max_size_mb * 1024 * 1024;
        if let Ok(meta) = tokio::fs::metadata(&config.log_path).await {
            if meta.len() >= max_bytes {
                drop(file);
                rotate(&config.log_path, config.max_backups).await;
                file = match open_log(&config.log_path).await {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "reopening audit log failed, audit stopped");
                        return;
                    }
                };
            }
        }

        let Ok(mut line) = serde_json::to_vec(&event) else {
            continue;
        };
        line.push(b'\n');
        if let Err(e) = file.write_all(&line).await {
            warn!(error = %e, "audit write failed");
            continue;
        }
        let _ = file.flush().await;
    }
}

async fn open_log(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Shift `.N -> .N+1` for N = backups-1 … 1, then the live file to `.1`.
async fn rotate(path: &Path, max_backups: u32) {
    let backup = |n: u32| -> PathBuf { PathBuf::from(format!("{}.{}", path.display(), n)) };

    let _ = tokio::fs::remove_file(backup(max_backups)).await;
    for n in (1..max_backups).rev() {
        let _ = tokio::fs::rename(backup(n), backup(n + 1)).await;
    }
    let _ = tokio::fs::rename(path, backup(1)).await;
}
