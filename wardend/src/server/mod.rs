//! Framed RPC transport: the dispatcher both transports share state with.
//!
//! A connection carries sequential calls. Each request passes the
//! interceptor chain (rate limit, then auth) before its handler runs;
//! streaming calls own the connection until their terminal response. A
//! dedicated reader task feeds incoming frames through a channel so stream
//! handlers can select between socket input and their producers without
//! losing partial reads.

pub mod proxy;
pub mod tls;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::audit::AuditLogger;
use crate::auth::AuthGate;
use crate::collector::MetricsCollector;
use crate::config::Config;
use crate::emergency::{EmergencyGuard, GuardConfig};
use crate::error::{AgentError, AgentResult};
use crate::executor::{self, pty::PtySession, ExecOptions};
use crate::plugins::PluginManager;
use crate::probe::HostProbe;
use crate::ratelimit::RateLimiter;
use crate::security::{CommandValidator, PathValidator};
use crate::transfer::UploadSink;
use crate::updater::Updater;
use wardend_protocol::{
    read_frame, write_frame, AgentRequest, AgentResponse, AuthResponse, ClientFrame, DirListing,
    FileContent, InstalledPluginInfo, ServerFrame, StreamFrame, UploadResult,
    TRANSFER_CHUNK_SIZE,
};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Everything the request handlers need, shared by both transports.
pub struct AgentState {
    pub version: String,
    pub config: Arc<Config>,
    pub probe: Arc<HostProbe>,
    pub collector: Arc<MetricsCollector>,
    pub cmd_validator: Arc<CommandValidator>,
    pub path_validator: Arc<PathValidator>,
    pub limiter: Arc<RateLimiter>,
    pub auth: Arc<AuthGate>,
    pub audit: Arc<AuditLogger>,
    pub plugins: Arc<PluginManager>,
    pub updater: Arc<Updater>,
    pub emergency: Arc<EmergencyGuard>,
}

impl AgentState {
    /// Wire up all components from configuration.
    pub fn build(config: Arc<Config>, version: &str) -> AgentResult<Arc<Self>> {
        let plugins = Arc::new(PluginManager::new(
            config.plugins.dir.clone(),
            config.data.dir.clone(),
        )?);
        let updater = Arc::new(Updater::new(version, config.data.dir.clone())?);
        Ok(Arc::new(Self {
            version: version.to_string(),
            probe: Arc::new(HostProbe::new()),
            collector: Arc::new(MetricsCollector::new()),
            cmd_validator: Arc::new(CommandValidator::new(config.security.clone())),
            path_validator: Arc::new(PathValidator::new(&config.security)),
            limiter: Arc::new(RateLimiter::new(config.ratelimit.clone())),
            auth: Arc::new(AuthGate::new(&config.auth.token)),
            audit: Arc::new(AuditLogger::new(config.audit.clone())),
            plugins,
            updater,
            emergency: EmergencyGuard::new(),
            config,
        }))
    }
}

/// Accept loop for the framed RPC listener.
pub async fn serve_rpc(
    state: Arc<AgentState>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
) -> Result<()> {
    info!(tls = tls.is_some(), "RPC transport listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = Arc::clone(&state);
        let tls = tls.clone();
        tokio::spawn(async move {
            let ip = peer.ip();
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => handle_connection(state, tls_stream, ip).await,
                    Err(e) => debug!(%peer, error = %e, "TLS handshake failed"),
                },
                None => handle_connection(state, stream, ip).await,
            }
        });
    }
}

/// Run one connection to completion.
pub async fn handle_connection<S>(state: Arc<AgentState>, stream: S, peer: IpAddr)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    debug!(%peer, "connection opened");
    let (mut rd, wr) = tokio::io::split(stream);
    let (in_tx, in_rx) = mpsc::channel::<ClientFrame>(64);

    tokio::spawn(async move {
        loop {
            match read_frame::<_, ClientFrame>(&mut rd).await {
                Ok(frame) => {
                    if in_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        debug!(error = %e, "frame read failed");
                    }
                    return;
                }
            }
        }
    });

    let mut conn = Connection {
        state,
        wr,
        in_rx,
        peer,
    };
    conn.run().await;
    debug!(%peer, "connection closed");
}

struct Connection<W> {
    state: Arc<AgentState>,
    wr: W,
    in_rx: mpsc::Receiver<ClientFrame>,
    peer: IpAddr,
}

impl<W: AsyncWrite + Unpin> Connection<W> {
    async fn run(&mut self) {
        while let Some(frame) = self.in_rx.recv().await {
            let result = match frame {
                ClientFrame::Request { id, token, request } => {
                    self.handle_call(id, token.as_deref(), request).await
                }
                // Stream frames outside an open call are protocol noise.
                ClientFrame::Stream { id, .. } | ClientFrame::Cancel { id } => {
                    debug!(id, "stray stream frame outside a call");
                    Ok(())
                }
            };
            if result.is_err() {
                return;
            }
        }
    }

    async fn respond(&mut self, id: u64, response: AgentResponse) -> std::io::Result<()> {
        write_frame(&mut self.wr, &ServerFrame::Response { id, response }).await
    }

    async fn send_stream(&mut self, id: u64, frame: StreamFrame) -> std::io::Result<()> {
        write_frame(&mut self.wr, &ServerFrame::Stream { id, frame }).await
    }

    async fn respond_error(&mut self, id: u64, err: AgentError) -> std::io::Result<()> {
        self.respond(id, AgentResponse::Error(err.to_rpc())).await
    }

    /// Interceptor chain, then dispatch.
    async fn handle_call(
        &mut self,
        id: u64,
        token: Option<&str>,
        request: AgentRequest,
    ) -> std::io::Result<()> {
        let method = request.method_name();

        if !self.state.limiter.allow(self.peer, method) {
            return self
                .respond_error(
                    id,
                    AgentError::ResourceExhausted("rate limit exceeded, slow down".into()),
                )
                .await;
        }
        if let Err(e) = self.state.auth.check(self.peer, token, method) {
            self.state.audit.log_security(
                &self.peer.to_string(),
                method,
                &e.to_rpc().message,
                crate::audit::EventLevel::Warning,
            );
            return self.respond_error(id, e).await;
        }

        match request {
            AgentRequest::Authenticate { token } => self.authenticate(id, &token).await,
            AgentRequest::GetSystemInfo => {
                let info = self.state.probe.static_info().await;
                self.respond(id, AgentResponse::SystemInfo(info)).await
            }
            AgentRequest::GetMetrics(req) => self.stream_metrics(id, req.interval_secs).await,
            AgentRequest::ExecuteCommand(req) => self.execute_command(id, req).await,
            AgentRequest::ShellStart(req) => self.run_shell(id, req).await,
            AgentRequest::ReadFile(req) => self.read_file(id, &req.path).await,
            AgentRequest::WriteFile(req) => self.write_file(id, req).await,
            AgentRequest::ListDirectory(req) => {
                match executor::list_directory(
                    &self.state.path_validator,
                    &req.path,
                    req.recursive,
                    req.show_hidden,
                )
                .await
                {
                    Ok(entries) => {
                        self.respond(
                            id,
                            AgentResponse::DirListing(DirListing {
                                path: req.path,
                                entries,
                            }),
                        )
                        .await
                    }
                    Err(e) => self.respond_error(id, e).await,
                }
            }
            AgentRequest::DeleteFile(req) => {
                let result = executor::delete_file(&self.state.path_validator, &req.path).await;
                self.state.audit.log_file_op(
                    &self.peer.to_string(),
                    "delete_file",
                    &req.path,
                    result.is_ok(),
                );
                match result {
                    Ok(()) => self.respond(id, ack("file deleted")).await,
                    Err(e) => self.respond_error(id, e).await,
                }
            }
            AgentRequest::TailLog(req) => self.stream_tail(id, req).await,
            AgentRequest::ListServices => match executor::list_services().await {
                Ok(services) => self.respond(id, AgentResponse::Services { services }).await,
                Err(e) => self.respond_error(id, e).await,
            },
            AgentRequest::ServiceAction(req) => {
                let result = executor::service_action(&req.name, &req.action).await;
                self.state.audit.log_command(
                    &self.peer.to_string(),
                    "systemctl",
                    &[req.action.clone(), req.name.clone()],
                    if result.is_ok() { 0 } else { 1 },
                );
                match result {
                    Ok(()) => self.respond(id, ack("service action applied")).await,
                    Err(e) => self.respond_error(id, e).await,
                }
            }
            AgentRequest::ListProcesses => {
                let processes = self.state.probe.list_processes().await;
                self.respond(id, AgentResponse::Processes { processes }).await
            }
            AgentRequest::KillProcess(req) => {
                match executor::kill_process(req.pid, req.signal) {
                    Ok(()) => self.respond(id, ack("signal sent")).await,
                    Err(e) => self.respond_error(id, e).await,
                }
            }
            AgentRequest::UploadStart(req) => self.receive_upload(id, req).await,
            AgentRequest::DownloadFile(req) => self.stream_download(id, &req.path).await,
            AgentRequest::SearchDockerHub(req) => {
                match proxy::search_docker_hub(&req).await {
                    Ok(result) => self.respond(id, AgentResponse::DockerSearch(result)).await,
                    Err(e) => self.respond_error(id, e).await,
                }
            }
            AgentRequest::ProxyHttpRequest(req) => {
                match proxy::proxy_http_request(&req).await {
                    Ok(result) => self.respond(id, AgentResponse::HttpProxy(result)).await,
                    Err(e) => self.respond_error(id, e).await,
                }
            }
            AgentRequest::PluginList => {
                let plugins = self
                    .state
                    .plugins
                    .list()
                    .await
                    .into_iter()
                    .map(plugin_info)
                    .collect();
                self.respond(id, AgentResponse::Plugins { plugins }).await
            }
            AgentRequest::PluginInstall(req) => {
                let data = match req.data {
                    Some(encoded) => match B64.decode(&encoded) {
                        Ok(bytes) => Some(bytes),
                        Err(e) => {
                            return self
                                .respond_error(
                                    id,
                                    AgentError::InvalidArgument(format!(
                                        "invalid base64 plugin data: {}",
                                        e
                                    )),
                                )
                                .await
                        }
                    },
                    None => None,
                };
                match self
                    .state
                    .plugins
                    .install(&req.id, &req.source, req.url.as_deref(), data)
                    .await
                {
                    Ok(plugin) => {
                        self.respond(
                            id,
                            AgentResponse::Plugins {
                                plugins: vec![plugin_info(plugin)],
                            },
                        )
                        .await
                    }
                    Err(e) => self.respond_error(id, e).await,
                }
            }
            AgentRequest::PluginUninstall { id: plugin_id } => {
                match self.state.plugins.uninstall(&plugin_id).await {
                    Ok(()) => self.respond(id, ack("plugin uninstalled")).await,
                    Err(e) => self.respond_error(id, e).await,
                }
            }
            AgentRequest::PluginEnable { id: plugin_id } => {
                match self.state.plugins.enable(&plugin_id).await {
                    Ok(()) => self.respond(id, ack("plugin enabled")).await,
                    Err(e) => self.respond_error(id, e).await,
                }
            }
            AgentRequest::PluginDisable { id: plugin_id } => {
                match self.state.plugins.disable(&plugin_id).await {
                    Ok(()) => self.respond(id, ack("plugin disabled")).await,
                    Err(e) => self.respond_error(id, e).await,
                }
            }
            AgentRequest::PluginGetConfig { id: plugin_id } => {
                match self.state.plugins.get_config(&plugin_id).await {
                    Ok(config) => {
                        self.respond(
                            id,
                            AgentResponse::PluginConfig {
                                id: plugin_id,
                                config,
                            },
                        )
                        .await
                    }
                    Err(e) => self.respond_error(id, e).await,
                }
            }
            AgentRequest::PluginSetConfig { id: plugin_id, config } => {
                match self.state.plugins.set_config(&plugin_id, config).await {
                    Ok(()) => self.respond(id, ack("plugin config applied")).await,
                    Err(e) => self.respond_error(id, e).await,
                }
            }
            AgentRequest::PluginGetStatus { id: plugin_id } => {
                match self.state.plugins.status(&plugin_id).await {
                    Ok(status) => self.respond(id, AgentResponse::PluginStatus(status)).await,
                    Err(e) => self.respond_error(id, e).await,
                }
            }
            AgentRequest::UpdateCheck => match self.state.updater.check().await {
                Ok(info) => self.respond(id, AgentResponse::UpdateInfo(info)).await,
                Err(e) => self.respond_error(id, e).await,
            },
            AgentRequest::UpdateDownload { version } => {
                let info = match self.check_update_version(&version).await {
                    Ok(info) => info,
                    Err(e) => return self.respond_error(id, e).await,
                };
                match self.state.updater.download_to_cache(&info).await {
                    Ok(path) => {
                        self.respond(id, ack(&format!("downloaded to {}", path.display())))
                            .await
                    }
                    Err(e) => self.respond_error(id, e).await,
                }
            }
            AgentRequest::UpdateApply { version } => self.apply_update(id, &version).await,
            AgentRequest::UpdateGetConfig => {
                let config = self.state.updater.config().await;
                self.respond(id, AgentResponse::UpdateConfig(config)).await
            }
            AgentRequest::UpdateSetConfig(msg) => {
                self.state.updater.set_config(msg).await;
                self.respond(id, ack("update config applied")).await
            }
            AgentRequest::UpdateGetHistory => {
                let records = self.state.updater.history().await;
                self.respond(id, AgentResponse::UpdateHistory { records }).await
            }
        }
    }

    async fn authenticate(&mut self, id: u64, token: &str) -> std::io::Result<()> {
        let success = self.state.auth.authenticate(self.peer, token);
        self.state.audit.log_auth(
            &self.peer.to_string(),
            success,
            if success { "ok" } else { "invalid token" },
        );
        let message = if success {
            "authenticated".to_string()
        } else {
            "invalid auth token".to_string()
        };
        self.respond(
            id,
            AgentResponse::Auth(AuthResponse {
                success,
                message,
                agent_version: self.state.version.clone(),
                expires_at: (chrono::Utc::now() + chrono::Duration::hours(24)).timestamp(),
            }),
        )
        .await
    }

    async fn execute_command(
        &mut self,
        id: u64,
        req: wardend_protocol::CommandRequest,
    ) -> std::io::Result<()> {
        // The emergency guard hides behind magic command names rather than
        // dedicated wire methods.
        if let Some(result) = self.handle_emergency_command(&req).await {
            return self.respond(id, AgentResponse::CommandResult(result)).await;
        }

        let timeout_secs = if req.timeout_secs == 0 { 60 } else { req.timeout_secs };
        let result = executor::execute(
            &self.state.cmd_validator,
            &self.state.path_validator,
            &req.command,
            &req.args,
            ExecOptions {
                working_dir: req.working_dir.clone(),
                env: req.env.clone(),
                timeout: Duration::from_secs(timeout_secs),
                sudo: req.sudo,
            },
        )
        .await;

        match result {
            Ok(result) => {
                self.state.audit.log_command(
                    &self.peer.to_string(),
                    &req.command,
                    &req.args,
                    result.exit_code,
                );
                self.respond(id, AgentResponse::CommandResult(result)).await
            }
            Err(e) => self.respond_error(id, e).await,
        }
    }

    async fn handle_emergency_command(
        &mut self,
        req: &wardend_protocol::CommandRequest,
    ) -> Option<wardend_protocol::CommandResult> {
        let body = match req.command.as_str() {
            "__emergency:enable" => {
                let cpu = req.args.first().and_then(|a| a.parse().ok()).unwrap_or(95.0);
                let mem = req.args.get(1).and_then(|a| a.parse().ok()).unwrap_or(95.0);
                self.state
                    .emergency
                    .set_config(GuardConfig {
                        cpu_threshold: cpu,
                        mem_threshold: mem,
                    })
                    .await;
                self.state.emergency.enable().await;
                serde_json::json!({"success": true, "message": "emergency guard enabled"})
            }
            "__emergency:disable" => {
                self.state.emergency.disable().await;
                serde_json::json!({"success": true, "message": "emergency guard disabled"})
            }
            "__emergency:status" => self.state.emergency.status_json().await,
            _ => return None,
        };
        Some(wardend_protocol::CommandResult {
            exit_code: 0,
            stdout: body.to_string(),
            stderr: String::new(),
            duration_ms: 0,
        })
    }

    async fn read_file(&mut self, id: u64, path: &str) -> std::io::Result<()> {
        let result = executor::read_file(&self.state.path_validator, path).await;
        self.state.audit.log_file_op(
            &self.peer.to_string(),
            "read_file",
            path,
            result.is_ok(),
        );
        match result {
            Ok((content, info)) => {
                self.respond(
                    id,
                    AgentResponse::FileContent(FileContent {
                        content: B64.encode(content),
                        info,
                    }),
                )
                .await
            }
            Err(e) => self.respond_error(id, e).await,
        }
    }

    async fn write_file(
        &mut self,
        id: u64,
        req: wardend_protocol::WriteFileRequest,
    ) -> std::io::Result<()> {
        let content = match B64.decode(&req.content) {
            Ok(bytes) => bytes,
            Err(e) => {
                return self
                    .respond_error(
                        id,
                        AgentError::InvalidArgument(format!("invalid base64 content: {}", e)),
                    )
                    .await
            }
        };
        let result = executor::write_file(
            &self.state.path_validator,
            &req.path,
            &content,
            req.mode,
            req.create_dirs,
        )
        .await;
        self.state.audit.log_file_op(
            &self.peer.to_string(),
            "write_file",
            &req.path,
            result.is_ok(),
        );
        match result {
            Ok(info) => {
                self.respond(
                    id,
                    AgentResponse::FileContent(FileContent {
                        content: String::new(),
                        info,
                    }),
                )
                .await
            }
            Err(e) => self.respond_error(id, e).await,
        }
    }

    /// Server stream: one reading every interval until cancel/disconnect.
    async fn stream_metrics(&mut self, id: u64, interval_secs: u64) -> std::io::Result<()> {
        let interval_secs = interval_secs.max(1);
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Disjoint borrows so the select arms can read input while writing
        // output.
        let state = Arc::clone(&self.state);
        let wr = &mut self.wr;
        let in_rx = &mut self.in_rx;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reading = state.collector.collect().await;
                    write_frame(wr, &ServerFrame::Stream {
                        id,
                        frame: StreamFrame::Metrics(reading),
                    }).await?;
                }
                frame = in_rx.recv() => {
                    match frame {
                        Some(ClientFrame::Cancel { .. }) | None => break,
                        Some(_) => {}
                    }
                }
            }
        }
        self.respond(id, ack("metrics stream ended")).await
    }

    /// Server stream: initial tail, then follow when requested.
    async fn stream_tail(
        &mut self,
        id: u64,
        req: wardend_protocol::TailLogRequest,
    ) -> std::io::Result<()> {
        let mut lines = match executor::tail_file(
            &self.state.path_validator,
            &req.path,
            req.lines,
            req.follow,
        )
        .await
        {
            Ok(rx) => rx,
            Err(e) => return self.respond_error(id, e).await,
        };

        let wr = &mut self.wr;
        let in_rx = &mut self.in_rx;
        loop {
            tokio::select! {
                line = lines.recv() => {
                    match line {
                        Some(line) => {
                            write_frame(wr, &ServerFrame::Stream {
                                id,
                                frame: StreamFrame::LogLine {
                                    line,
                                    timestamp: chrono::Utc::now().timestamp(),
                                },
                            }).await?;
                        }
                        None => break,
                    }
                }
                frame = in_rx.recv() => {
                    match frame {
                        Some(ClientFrame::Cancel { .. }) | None => break,
                        Some(_) => {}
                    }
                }
            }
        }
        self.respond(id, ack("log stream ended")).await
    }

    /// Bidi stream bridging the PTY.
    async fn run_shell(
        &mut self,
        id: u64,
        req: wardend_protocol::ShellStartRequest,
    ) -> std::io::Result<()> {
        let shell = if req.shell.is_empty() {
            "/bin/bash".to_string()
        } else {
            req.shell.clone()
        };
        let mut session = match PtySession::spawn(&shell, &req.env, req.rows, req.cols) {
            Ok(session) => session,
            Err(e) => return self.respond_error(id, e).await,
        };
        self.state.audit.log_command(
            &self.peer.to_string(),
            &shell,
            &["<interactive shell>".to_string()],
            0,
        );

        // A clone of the master stream reads output while the session copy
        // takes input; both share the same fd.
        let mut pty_out = session.stream.clone();
        let wr = &mut self.wr;
        let in_rx = &mut self.in_rx;

        let mut buf = [0u8; executor::pty::OUTPUT_CHUNK_SIZE];
        loop {
            tokio::select! {
                read = pty_out.read(&mut buf) => {
                    match read {
                        Ok(0) => break, // child exited
                        Ok(n) => {
                            write_frame(wr, &ServerFrame::Stream {
                                id,
                                frame: StreamFrame::ShellOutput {
                                    data: B64.encode(&buf[..n]),
                                },
                            }).await?;
                        }
                        Err(e) => {
                            debug!(error = %e, "pty read failed");
                            break;
                        }
                    }
                }
                frame = in_rx.recv() => {
                    match frame {
                        Some(ClientFrame::Stream { frame: StreamFrame::ShellData { data }, .. }) => {
                            match B64.decode(&data) {
                                Ok(bytes) => {
                                    if session.stream.write_all(&bytes).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                        Some(ClientFrame::Stream { frame: StreamFrame::ShellResize { rows, cols }, .. }) => {
                            if let Err(e) = session.resize(rows, cols) {
                                debug!(error = %e.to_rpc().message, "pty resize failed");
                            }
                        }
                        Some(ClientFrame::Cancel { .. }) | None => break,
                        Some(_) => {}
                    }
                }
            }
        }

        session.shutdown().await;
        self.respond(id, ack("shell session ended")).await
    }

    /// Client stream: chunks then an end frame; any failure deletes the
    /// partial destination.
    async fn receive_upload(
        &mut self,
        id: u64,
        req: wardend_protocol::UploadStartRequest,
    ) -> std::io::Result<()> {
        let mut sink = match UploadSink::begin(&self.state.path_validator, &req).await {
            Ok(sink) => sink,
            Err(e) => return self.respond_error(id, e).await,
        };

        loop {
            match self.in_rx.recv().await {
                Some(ClientFrame::Stream { frame: StreamFrame::FileChunk { data }, .. }) => {
                    let bytes = match B64.decode(&data) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            sink.abort().await;
                            return self
                                .respond_error(
                                    id,
                                    AgentError::InvalidArgument(format!(
                                        "invalid base64 chunk: {}",
                                        e
                                    )),
                                )
                                .await;
                        }
                    };
                    if let Err(e) = sink.write_chunk(&bytes).await {
                        sink.abort().await;
                        return self.respond_error(id, e).await;
                    }
                }
                Some(ClientFrame::Stream { frame: StreamFrame::UploadEnd, .. }) => {
                    let bytes = sink.bytes_written();
                    return match sink.finish().await {
                        Ok(result) => {
                            self.state.audit.log_file_op(
                                &self.peer.to_string(),
                                "upload_file",
                                &result.path,
                                true,
                            );
                            self.respond(id, AgentResponse::UploadResult(result)).await
                        }
                        Err(e) => {
                            debug!(bytes, "upload failed at finish");
                            self.respond_error(id, e).await
                        }
                    };
                }
                Some(ClientFrame::Cancel { .. }) => {
                    sink.abort().await;
                    return self
                        .respond(
                            id,
                            AgentResponse::UploadResult(UploadResult {
                                success: false,
                                message: "upload cancelled".into(),
                                bytes_written: 0,
                                path: String::new(),
                            }),
                        )
                        .await;
                }
                Some(_) => {}
                None => {
                    // Connection dropped mid-upload.
                    sink.abort().await;
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed during upload",
                    ));
                }
            }
        }
    }

    /// Server stream: start frame, 64 KiB chunks, terminal response.
    async fn stream_download(&mut self, id: u64, path: &str) -> std::io::Result<()> {
        let clean = match self.state.path_validator.checked_read_path(path) {
            Ok(clean) => clean,
            Err(e) => return self.respond_error(id, e).await,
        };
        let mut file = match tokio::fs::File::open(&clean).await {
            Ok(file) => file,
            Err(e) => {
                return self
                    .respond_error(id, AgentError::from_io(e, &format!("open {}", path)))
                    .await
            }
        };
        let meta = match file.metadata().await {
            Ok(meta) => meta,
            Err(e) => {
                return self
                    .respond_error(id, AgentError::from_io(e, "stat download target"))
                    .await
            }
        };
        if meta.is_dir() {
            return self
                .respond_error(
                    id,
                    AgentError::InvalidArgument(
                        "cannot download a directory, archive it first".into(),
                    ),
                )
                .await;
        }

        use std::os::unix::fs::MetadataExt;
        self.send_stream(
            id,
            StreamFrame::FileStart {
                path: clean.to_string_lossy().to_string(),
                total_size: meta.len(),
                mode: meta.mode(),
            },
        )
        .await?;

        let mut chunk = vec![0u8; TRANSFER_CHUNK_SIZE];
        let mut sent: u64 = 0;
        loop {
            // A client cancel aborts the transfer between chunks.
            if let Ok(ClientFrame::Cancel { .. }) = self.in_rx.try_recv() {
                break;
            }
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            sent += n as u64;
            self.send_stream(
                id,
                StreamFrame::FileChunk {
                    data: B64.encode(&chunk[..n]),
                },
            )
            .await?;
        }

        self.state
            .audit
            .log_file_op(&self.peer.to_string(), "download_file", path, true);
        self.respond(id, ack(&format!("sent {} bytes", sent))).await
    }

    async fn check_update_version(
        &mut self,
        version: &str,
    ) -> AgentResult<wardend_protocol::UpdateInfoMsg> {
        let info = self.state.updater.check().await?;
        if !info.available || info.latest_version != version {
            return Err(AgentError::NotFound(format!(
                "version {} is not available",
                version
            )));
        }
        Ok(info)
    }

    async fn apply_update(&mut self, id: u64, version: &str) -> std::io::Result<()> {
        let info = match self.check_update_version(version).await {
            Ok(info) => info,
            Err(e) => return self.respond_error(id, e).await,
        };
        match self.state.updater.download_and_apply(&info, true).await {
            Ok(()) => self.respond(id, ack("update applied, restarting")).await,
            Err(e) => self.respond_error(id, e).await,
        }
    }
}

fn ack(message: &str) -> AgentResponse {
    AgentResponse::Ack {
        message: message.to_string(),
    }
}

fn plugin_info(plugin: crate::plugins::InstalledPlugin) -> InstalledPluginInfo {
    InstalledPluginInfo {
        id: plugin.manifest.id.clone(),
        name: plugin.manifest.name.clone(),
        version: plugin.manifest.version.clone(),
        plugin_type: format!("{:?}", plugin.manifest.plugin_type).to_lowercase(),
        state: crate::plugins::state_name(plugin.state),
        installed_at: plugin.installed_at.timestamp(),
        updated_at: plugin.updated_at.timestamp(),
        error: plugin.error,
    }
}
