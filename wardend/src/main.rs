mod api;
mod audit;
mod auth;
mod collector;
mod config;
mod emergency;
mod error;
mod executor;
mod plugins;
mod probe;
mod ratelimit;
mod security;
mod server;
mod shield;
mod transfer;
mod updater;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::server::AgentState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "wardend", about = "Host agent daemon: secure control plane for a Linux server", disable_version_flag = true)]
struct Cli {
    /// Path to the config file (TOML).
    #[arg(long, default_value = "/etc/wardend/wardend.toml")]
    config: PathBuf,

    /// Print version information and exit.
    #[arg(long)]
    version: bool,

    /// Generate a fresh auth token and exit.
    #[arg(long)]
    gen_token: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("wardend v{}", VERSION);
        return Ok(());
    }
    if cli.gen_token {
        println!("{}", auth::generate_token());
        return Ok(());
    }

    let config = Config::load(&cli.config)?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone())),
        )
        .init();

    run(Arc::new(config)).await
}

async fn run(config: Arc<Config>) -> Result<()> {
    std::fs::create_dir_all(&config.data.dir)
        .with_context(|| format!("creating data dir: {}", config.data.dir.display()))?;

    let state = AgentState::build(Arc::clone(&config), VERSION)
        .map_err(|e| anyhow::anyhow!("building agent state: {}", e))?;

    // Background loops.
    state.limiter.spawn_eviction_loop();
    state.updater.spawn_auto_loop();
    state.plugins.start_enabled().await;

    // TLS for the RPC listener; the certificate is generated on first boot.
    let tls = if config.server.tls.enabled {
        let cert = config
            .server
            .tls
            .cert
            .clone()
            .unwrap_or_else(|| config.tls_dir().join("cert.pem"));
        let key = config
            .server
            .tls
            .key
            .clone()
            .unwrap_or_else(|| config.tls_dir().join("key.pem"));
        Some(server::tls::load_or_generate(&cert, &key).context("loading TLS material")?)
    } else {
        tracing::warn!("TLS disabled, RPC transport is unencrypted");
        None
    };

    let rpc_addr = format!("{}:{}", config.server.host, config.server.port);
    let rpc_listener = tokio::net::TcpListener::bind(&rpc_addr)
        .await
        .with_context(|| format!("binding RPC listener on {}", rpc_addr))?;

    let api_addr = format!("{}:{}", config.server.host, config.server.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("binding API listener on {}", api_addr))?;

    tracing::info!(
        version = VERSION,
        rpc = %rpc_addr,
        api = %api_addr,
        auto_update = config.update.auto,
        "wardend started"
    );

    let api_router = api::build_router(Arc::clone(&state));
    let api_server = axum::serve(api_listener, api_router);

    let serve_result = tokio::select! {
        result = server::serve_rpc(Arc::clone(&state), rpc_listener, tls) => {
            result.context("RPC transport failed")
        }
        result = api_server => {
            result.context("API transport failed")
        }
        _ = shutdown_signal() => Ok(()),
    };

    tracing::info!("shutting down");
    state.plugins.stop_all().await;
    state.emergency.disable().await;
    tracing::info!("wardend stopped");
    serve_result
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM");
        }
    }
}
