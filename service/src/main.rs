//! `bizcard-service` entry point.
//!
//! ## Modes
//!
//! - **Service mode** (default): load config, restore the card from the
//!   durable store, publish the tag payload, then serve the field
//!   endpoints until Ctrl+C.
//! - **`--ping`**: connect to the running service socket, send a hello
//!   handshake, verify the response, then exit.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use bizcard_core::{CardConfig, CardContext, LogIndicator, RefreshOutcome};
use bizcard_service::emulator::FileTagEmulator;
use bizcard_service::gatt::{ProtocolServer, ServerOptions};
use bizcard_service::store::FileStore;

fn socket_path(cfg: &CardConfig) -> PathBuf {
    cfg.service
        .socket_path
        .clone()
        .unwrap_or_else(bizcard_service::default_socket_path)
}

fn load_config() -> std::io::Result<CardConfig> {
    CardConfig::load().map_err(|e| std::io::Error::other(format!("Failed to load config: {e}")))
}

/// Connect to the service socket, send a hello handshake, verify the
/// response, then exit.
fn ping() -> std::io::Result<()> {
    let path = socket_path(&load_config()?);
    let mut stream = std::os::unix::net::UnixStream::connect(&path).map_err(|e| {
        std::io::Error::other(format!("ping: cannot connect to {}: {e}", path.display()))
    })?;
    stream.set_read_timeout(Some(std::time::Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(std::time::Duration::from_secs(5)))?;

    let hello = format!(
        r#"{{"id":0,"method":"hello","params":{{"protocol_version":"{}","client_version":"ping"}}}}"#,
        bizcard_service::PROTOCOL_VERSION,
    );
    stream.write_all(hello.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = std::io::BufReader::new(&stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let resp: serde_json::Value = serde_json::from_str(line.trim())
        .map_err(|e| std::io::Error::other(format!("ping: invalid response JSON: {e}")))?;
    if resp.get("result").is_some() {
        eprintln!("ping: service is alive");
        Ok(())
    } else {
        let msg = resp
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        Err(std::io::Error::other(format!("ping: hello failed: {msg}")))
    }
}

fn main() -> std::io::Result<()> {
    if std::env::args().nth(1).as_deref() == Some("--ping") {
        return ping();
    }

    run_service()
}

#[tokio::main]
async fn run_service() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("bizcard-service v{} starting", env!("CARGO_PKG_VERSION"));

    let cfg = load_config()?;

    let store = FileStore::with_base_dir(cfg.storage.dir.clone()).map_err(|e| {
        std::io::Error::other(format!("Failed to initialize durable store: {e}"))
    })?;
    tracing::info!("Durable store at {}", store.base_dir().display());

    let emulator = FileTagEmulator::new(cfg.tag.payload_path.clone());
    tracing::info!("Tag payload at {}", emulator.payload_path().display());

    let ctx = Arc::new(CardContext::new(
        Box::new(store),
        Box::new(emulator),
        Box::new(LogIndicator),
    ));

    // Restore and publish before accepting connections.
    let report = ctx.startup();
    match report.refresh {
        RefreshOutcome::Activated { payload_len } => {
            tracing::info!(payload_len, "tag emulation active");
        }
        other => tracing::warn!(?other, "card started without tag emulation"),
    }

    let server = Arc::new(ProtocolServer::new(
        Arc::clone(&ctx),
        ServerOptions::from(&cfg.service),
    ));

    let path = socket_path(&cfg);
    let listener = bizcard_service::ipc::bind(&path)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let srv_signal = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(
            "Signal received, shutting down (open connections: {})",
            srv_signal.connection_count()
        );
        let _ = shutdown_tx.send(true);
    });

    bizcard_service::ipc::serve(server, listener, shutdown_rx).await?;

    if let Err(e) = std::fs::remove_file(&path) {
        tracing::debug!("socket cleanup: {e}");
    }
    tracing::info!("bizcard-service exiting cleanly");
    Ok(())
}
