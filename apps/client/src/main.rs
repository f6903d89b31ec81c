//! snapstream-client — reference playback client for the multi-room
//! synchronized audio broadcaster. Connects to a server, decodes whatever
//! codec it announces, and renders through a pluggable [`Renderer`] (a
//! no-op sink by default, since device backends are out of scope here).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use snapstream_core::client::{ClientIdentity, Controller, NullRenderer};
use tokio::signal;

/// snapstream-client - reference playback client.
#[derive(Parser, Debug)]
#[command(name = "snapstream-client")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address, `host:port`.
    #[arg(short = 'H', long, default_value = "127.0.0.1:1704", env = "SNAPSTREAM_SERVER")]
    server: String,

    /// Friendly name this client announces in `Hello`.
    #[arg(short = 'n', long, env = "SNAPSTREAM_CLIENT_NAME")]
    name: Option<String>,

    /// Extra latency (ms) added on top of the measured network latency and
    /// server buffer target.
    #[arg(short = 'l', long, default_value_t = 0, env = "SNAPSTREAM_LATENCY_MS")]
    latency_ms: i64,

    /// Directory used to persist this client's stable id across restarts.
    /// Without one, a fresh id is generated every run.
    #[arg(short = 'd', long, env = "SNAPSTREAM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", env = "SNAPSTREAM_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

/// Returns this client's stable id, reading it from `<data_dir>/client_id`
/// if one was persisted there, generating and persisting a fresh one
/// otherwise. Without a data directory, generates an ephemeral id.
fn stable_client_id(data_dir: Option<&PathBuf>) -> String {
    let Some(dir) = data_dir else {
        return uuid::Uuid::new_v4().to_string();
    };

    let path = dir.join("client_id");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    if let Err(err) = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, &id)) {
        log::warn!("failed to persist client id to {}: {err}", path.display());
    }
    id
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("snapstream-client v{}", env!("CARGO_PKG_VERSION"));

    let addr: SocketAddr = args
        .server
        .parse()
        .or_else(|_| {
            use std::net::ToSocketAddrs;
            args.server
                .to_socket_addrs()
                .ok()
                .and_then(|mut it| it.next())
                .ok_or_else(|| anyhow::anyhow!("could not resolve '{}'", args.server))
        })
        .with_context(|| format!("invalid server address '{}'", args.server))?;

    let host_name = hostname::get().ok().and_then(|s| s.into_string().ok()).unwrap_or_else(|| "unknown-host".to_string());
    let client_id = stable_client_id(args.data_dir.as_ref());
    let identity = ClientIdentity {
        host_name: host_name.clone(),
        mac: client_id,
        instance: 1,
        client_name: args.name.unwrap_or(host_name),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    };

    log::info!("connecting to {addr} as '{}'", identity.client_name);
    let controller = Controller::connect(addr, identity, Arc::new(NullRenderer), args.latency_ms)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;

    shutdown_signal().await;
    log::info!("shutdown signal received, disconnecting");
    controller.shutdown();

    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
