//! snapstream-server — standalone fan-out server for the multi-room
//! synchronized audio broadcaster.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use snapstream_core::control::{NullStreamControl, ScriptStreamControl};
use snapstream_core::persistence::PersistentStore;
use snapstream_core::server::{Server, ServerConfig as CoreServerConfig};
use snapstream_core::stream::Stream;
use snapstream_core::uri::StreamUri;
use tokio::net::TcpListener;
use tokio::signal;

use crate::config::ServerConfig;

/// snapstream-server - headless multi-room audio broadcaster.
#[derive(Parser, Debug)]
#[command(name = "snapstream-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "SNAPSTREAM_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "SNAPSTREAM_BIND_PORT")]
    port: Option<u16>,

    /// Data directory for persistent state (`server.json`).
    #[arg(short = 'd', long, env = "SNAPSTREAM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Additional source URI. May be repeated; appended to any configured
    /// via the config file or `SNAPSTREAM_SOURCES`.
    #[arg(short = 's', long = "source")]
    sources: Vec<String>,
}

/// Builds one [`Stream`] from a source URI, wiring up a
/// [`ScriptStreamControl`] when the URI carries a `controlscript` key and
/// [`NullStreamControl`] otherwise.
fn build_stream(id: String, uri: StreamUri) -> Result<Arc<Stream>> {
    let control = match uri.control_script() {
        Some((script, params)) => {
            let (control, mut notifications) = ScriptStreamControl::spawn(&script, &params)
                .with_context(|| format!("failed to start controlscript for stream '{id}'"))?;
            let stream_id = id.clone();
            tokio::spawn(async move {
                while let Some((method, params)) = notifications.recv().await {
                    log::debug!("stream '{stream_id}' control notification: {method} {params}");
                }
            });
            Arc::new(control) as Arc<dyn snapstream_core::control::StreamControl>
        }
        None => Arc::new(NullStreamControl),
    };
    Ok(Stream::new(id, uri, control)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("snapstream-server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }
    config.sources.extend(args.sources);

    if config.sources.is_empty() {
        log::warn!("no source URIs configured; the server will accept clients but never play audio");
    }

    let persistent_store = config.data_dir.as_ref().map(|dir| PersistentStore::new(dir.join("server.json")));
    let server_state = match &persistent_store {
        Some(store) => store.load().context("failed to load server.json")?,
        None => snapstream_core::persistence::ServerState::default(),
    };
    log::info!(
        "loaded persistent state: {} group(s), host_id='{}'",
        server_state.groups.len(),
        server_state.server.host_id
    );

    let server = Server::with_state(
        CoreServerConfig {
            zerocopy_enabled: config.zerocopy_enabled,
            max_queue_chunks: config.max_queue_chunks,
            forward_to_muted_clients: config.forward_to_muted_clients,
        },
        server_state,
        persistent_store,
    );

    for (index, raw_uri) in config.sources.iter().enumerate() {
        let uri = StreamUri::parse(raw_uri).with_context(|| format!("invalid source URI '{raw_uri}'"))?;
        let stream_id = uri.name();
        let stream = build_stream(stream_id.clone(), uri).with_context(|| format!("failed to build stream #{index} ('{raw_uri}')"))?;
        if let Err(err) = stream.start().await {
            log::error!("stream '{stream_id}' failed to start: {err}");
            continue;
        }
        log::info!("stream '{stream_id}' started from '{raw_uri}'");
        server.add_stream(stream);
    }

    let bind_addr = std::net::SocketAddr::new(config.bind_addr, config.bind_port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    log::info!("listening on {bind_addr}");

    let accept_task = tokio::spawn(server.clone().accept_loop(listener));
    let diagnostics_task = tokio::spawn(server.clone().run_diagnostics_timer());

    shutdown_signal().await;
    log::info!("shutdown signal received, cleaning up...");

    server.shutdown();
    accept_task.abort();
    diagnostics_task.abort();

    log::info!("shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C, SIGTERM, or SIGHUP).
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

    #[cfg(unix)]
    let hangup = async {
        signal::unix::signal(signal::unix::SignalKind::hangup())
            .expect("failed to install SIGHUP handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = hangup => {},
    }
}
