use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum frame size (16 MiB) to prevent unbounded allocations.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Preferred chunk size for file transfer frames.
pub const TRANSFER_CHUNK_SIZE: usize = 64 * 1024;

/// Framing: each frame is a 4-byte big-endian length prefix followed by JSON
/// bytes. The prefix encodes the size of the JSON payload only.

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// A frame sent from a client to the agent.
///
/// A connection carries calls sequentially: a `Request` opens a call, and a
/// streaming call owns the connection (exchanging `Stream` frames) until the
/// agent sends its terminal `Response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ClientFrame {
    /// Open a unary or streaming call. `token` carries the bearer credential
    /// ("Bearer " prefix tolerated); it is absent only for `Authenticate`.
    Request {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        request: AgentRequest,
    },
    /// Client-side data for the currently open stream.
    Stream { id: u64, frame: StreamFrame },
    /// Cancel the currently open stream.
    Cancel { id: u64 },
}

/// A frame sent from the agent to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ServerFrame {
    /// Terminal reply for the call with the given id.
    Response { id: u64, response: AgentResponse },
    /// One item of a server stream.
    Stream { id: u64, frame: StreamFrame },
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentRequest {
    /// Validate the configured token and return agent identity.
    Authenticate { token: String },

    /// Static host info plus a current metrics snapshot.
    GetSystemInfo,

    /// Server-stream of metric readings every `interval_secs` (clamped >= 1).
    GetMetrics(MetricsRequest),

    /// Execute a command under the security policy.
    ExecuteCommand(CommandRequest),

    /// Open an interactive shell over a pseudo-terminal (bidi stream).
    ShellStart(ShellStartRequest),

    ReadFile(FileRequest),
    WriteFile(WriteFileRequest),
    ListDirectory(ListDirectoryRequest),
    DeleteFile(FileRequest),

    /// Initial tail of `lines`, then follow when requested (server stream).
    TailLog(TailLogRequest),

    ListServices,
    ServiceAction(ServiceActionRequest),

    ListProcesses,
    KillProcess(KillProcessRequest),

    /// Open a chunked upload (client stream: FileChunk* then UploadEnd).
    UploadStart(UploadStartRequest),
    /// Chunked download (server stream: FileStart, FileChunk*, then Response).
    DownloadFile(FileRequest),

    SearchDockerHub(DockerSearchRequest),
    ProxyHttpRequest(ProxyRequest),

    PluginList,
    PluginInstall(PluginInstallRequest),
    PluginUninstall { id: String },
    PluginEnable { id: String },
    PluginDisable { id: String },
    PluginGetConfig { id: String },
    PluginSetConfig { id: String, config: serde_json::Value },
    PluginGetStatus { id: String },

    UpdateCheck,
    UpdateDownload { version: String },
    UpdateApply { version: String },
    UpdateGetConfig,
    UpdateSetConfig(UpdateConfigMsg),
    UpdateGetHistory,
}

impl AgentRequest {
    /// Wire method name, used for rate-limit routing and audit records.
    pub fn method_name(&self) -> &'static str {
        match self {
            AgentRequest::Authenticate { .. } => "Authenticate",
            AgentRequest::GetSystemInfo => "GetSystemInfo",
            AgentRequest::GetMetrics(_) => "GetMetrics",
            AgentRequest::ExecuteCommand(_) => "ExecuteCommand",
            AgentRequest::ShellStart(_) => "ExecuteShell",
            AgentRequest::ReadFile(_) => "ReadFile",
            AgentRequest::WriteFile(_) => "WriteFile",
            AgentRequest::ListDirectory(_) => "ListDirectory",
            AgentRequest::DeleteFile(_) => "DeleteFile",
            AgentRequest::TailLog(_) => "TailLog",
            AgentRequest::ListServices => "ListServices",
            AgentRequest::ServiceAction(_) => "ServiceAction",
            AgentRequest::ListProcesses => "ListProcesses",
            AgentRequest::KillProcess(_) => "KillProcess",
            AgentRequest::UploadStart(_) => "UploadFile",
            AgentRequest::DownloadFile(_) => "DownloadFile",
            AgentRequest::SearchDockerHub(_) => "SearchDockerHub",
            AgentRequest::ProxyHttpRequest(_) => "ProxyHttpRequest",
            AgentRequest::PluginList => "PluginList",
            AgentRequest::PluginInstall(_) => "PluginInstall",
            AgentRequest::PluginUninstall { .. } => "PluginUninstall",
            AgentRequest::PluginEnable { .. } => "PluginEnable",
            AgentRequest::PluginDisable { .. } => "PluginDisable",
            AgentRequest::PluginGetConfig { .. } => "PluginGetConfig",
            AgentRequest::PluginSetConfig { .. } => "PluginSetConfig",
            AgentRequest::PluginGetStatus { .. } => "PluginGetStatus",
            AgentRequest::UpdateCheck => "UpdateCheck",
            AgentRequest::UpdateDownload { .. } => "UpdateDownload",
            AgentRequest::UpdateApply { .. } => "UpdateApply",
            AgentRequest::UpdateGetConfig => "UpdateGetConfig",
            AgentRequest::UpdateSetConfig(_) => "UpdateSetConfig",
            AgentRequest::UpdateGetHistory => "UpdateGetHistory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRequest {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

fn default_metrics_interval() -> u64 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub sudo: bool,
}

fn default_command_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellStartRequest {
    /// Shell binary; empty means the agent picks its default.
    #[serde(default)]
    pub shell: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    /// Base64-encoded content.
    pub content: String,
    /// Unix mode bits; 0 means 0644.
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub create_dirs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDirectoryRequest {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub show_hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailLogRequest {
    pub path: String,
    #[serde(default = "default_tail_lines")]
    pub lines: usize,
    #[serde(default)]
    pub follow: bool,
}

fn default_tail_lines() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceActionRequest {
    pub name: String,
    /// One of start, stop, restart, reload, status, enable, disable.
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillProcessRequest {
    pub pid: i32,
    /// Signal number; 0 means SIGTERM.
    #[serde(default)]
    pub signal: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadStartRequest {
    pub path: String,
    pub total_size: u64,
    /// Unix mode bits; 0 means 0644.
    #[serde(default)]
    pub mode: u32,
    /// When true the uploaded file is a tar.gz to extract into `extract_to`.
    #[serde(default)]
    pub is_archive: bool,
    #[serde(default)]
    pub extract_to: Option<String>,
    #[serde(default)]
    pub create_dirs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSearchRequest {
    pub query: String,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Base64-encoded request body.
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInstallRequest {
    pub id: String,
    /// One of official, url, inline.
    pub source: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Base64-encoded tarball bytes for the inline source.
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfigMsg {
    pub auto_update: bool,
    pub check_interval_secs: u64,
    pub channel: String,
    #[serde(default)]
    pub notify_only: bool,
}

// ---------------------------------------------------------------------------
// Stream frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamFrame {
    /// One metrics reading on a GetMetrics stream.
    Metrics(MetricsSnapshot),

    /// One log line on a TailLog stream.
    LogLine { line: String, timestamp: i64 },

    /// Client keystrokes for the shell (base64).
    ShellData { data: String },
    /// Terminal resize for the shell.
    ShellResize { rows: u16, cols: u16 },
    /// Shell output from the agent (base64).
    ShellOutput { data: String },

    /// Download preamble: what the following chunks contain.
    FileStart { path: String, total_size: u64, mode: u32 },
    /// One chunk of file data (base64).
    FileChunk { data: String },
    /// Client-side end of upload.
    UploadEnd,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentResponse {
    Auth(AuthResponse),
    SystemInfo(SystemInfo),
    CommandResult(CommandResult),
    FileContent(FileContent),
    DirListing(DirListing),
    Services { services: Vec<ServiceInfo> },
    Processes { processes: Vec<ProcessInfo> },
    UploadResult(UploadResult),
    DockerSearch(DockerSearchResponse),
    HttpProxy(ProxyResponse),
    Plugins { plugins: Vec<InstalledPluginInfo> },
    PluginConfig { id: String, config: serde_json::Value },
    PluginStatus(PluginStatusInfo),
    UpdateInfo(UpdateInfoMsg),
    UpdateConfig(UpdateConfigMsg),
    UpdateHistory { records: Vec<UpdateRecordMsg> },

    /// Generic success for actions and stream completion.
    Ack { message: String },

    /// Terminal error for the call.
    Error(RpcError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    pub message: String,
    pub agent_version: String,
    /// Unix seconds after which the client should re-authenticate.
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    /// Base64-encoded content.
    pub content: String,
    pub info: FileInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub mode: u32,
    /// Modified time as Unix seconds.
    pub modified: i64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirListing {
    pub path: String,
    pub entries: Vec<FileInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    pub name: String,
    pub user: String,
    pub status: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_rss: u64,
    /// Process start time as Unix seconds.
    pub start_time: i64,
    pub cmdline: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub success: bool,
    pub message: String,
    pub bytes_written: u64,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSearchResponse {
    pub total_count: u64,
    pub images: Vec<DockerImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerImage {
    pub name: String,
    pub description: String,
    pub star_count: i64,
    pub pull_count: i64,
    pub is_official: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    /// Base64-encoded response body.
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledPluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub plugin_type: String,
    pub state: String,
    pub installed_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginStatusInfo {
    pub id: String,
    pub state: String,
    pub running: bool,
    pub uptime_secs: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stats: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInfoMsg {
    pub available: bool,
    pub current_version: String,
    pub latest_version: String,
    pub download_url: String,
    pub size: u64,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub release_notes: String,
    #[serde(default)]
    pub is_critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecordMsg {
    pub version: String,
    pub from_version: String,
    pub timestamp: i64,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// System readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub kernel_version: String,
    pub arch: String,
    pub uptime_secs: u64,
    pub boot_time: i64,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub disks: Vec<DiskInfo>,
    pub networks: Vec<NetworkInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuInfo {
    pub model: String,
    pub cores: u32,
    pub frequency_mhz: f64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub used_percent: f64,
    pub swap_total: u64,
    pub swap_used: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInfo {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: String,
    pub addresses: Vec<String>,
    pub mac: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

/// One rate reading derived from two host samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Unix seconds of the reading.
    pub timestamp: i64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub disks: Vec<DiskRate>,
    pub networks: Vec<NetworkRate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskRate {
    pub device: String,
    pub read_bytes_per_sec: u64,
    pub write_bytes_per_sec: u64,
    pub read_ops_per_sec: u64,
    pub write_ops_per_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRate {
    pub interface: String,
    pub bytes_sent_per_sec: u64,
    pub bytes_recv_per_sec: u64,
    pub packets_sent_per_sec: u64,
    pub packets_recv_per_sec: u64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthenticated,
    ResourceExhausted,
    PermissionDenied,
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

/// Encode a frame as length-prefixed JSON bytes.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Decode a length-prefixed JSON frame from a byte buffer.
/// Returns the deserialized frame and the number of bytes consumed.
pub fn decode_frame<T: serde::de::DeserializeOwned>(
    buf: &[u8],
) -> Result<(T, usize), Box<dyn std::error::Error + Send + Sync>> {
    if buf.len() < 4 {
        return Err("buffer too short for length prefix".into());
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE as usize {
        return Err(format!("frame too large: {} bytes", len).into());
    }
    if buf.len() < 4 + len {
        return Err("buffer too short for payload".into());
    }
    let msg: T = serde_json::from_slice(&buf[4..4 + len])?;
    Ok((msg, 4 + len))
}

/// Read one frame from an async reader.
pub async fn read_frame<R, T>(reader: &mut R) -> std::io::Result<T>
where
    R: AsyncReadExt + Unpin,
    T: serde::de::DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Write one frame to an async writer and flush it.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let encoded = encode_frame(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&encoded).await?;
    writer.flush().await
}
