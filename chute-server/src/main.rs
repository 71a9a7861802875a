// Chute server: UDP upload listener with session store, credential store and transfer ledger.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use chute_server::{config, Dispatcher, FileCredentialStore, JsonLinesLedger, Server};

#[derive(Debug, Parser)]
#[command(name = "chute-server", version, about = "Receive file uploads over UDP")]
struct Args {
    /// Config file (default: ~/.config/chute/server.toml, then /etc/chute/server.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen address, e.g. 0.0.0.0:12345.
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,
    /// Directory uploads are written into.
    #[arg(long)]
    storage_dir: Option<PathBuf>,
    /// Directory for users.json and transfers.jsonl.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        cfg.bind = bind;
    }
    if let Some(dir) = args.storage_dir {
        cfg.storage_dir = dir;
    }
    if let Some(dir) = args.data_dir {
        cfg.data_dir = dir;
    }

    std::fs::create_dir_all(&cfg.storage_dir)
        .with_context(|| format!("creating {}", cfg.storage_dir.display()))?;
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("creating {}", cfg.data_dir.display()))?;

    let credentials = FileCredentialStore::open(cfg.users_path())?;
    let ledger = JsonLinesLedger::new(cfg.ledger_path());
    let dispatcher = Dispatcher::new(
        cfg.storage_dir.clone(),
        cfg.max_upload_bytes,
        Arc::new(credentials),
        Arc::new(ledger),
    );
    tracing::info!(
        storage = %cfg.storage_dir.display(),
        data = %cfg.data_dir.display(),
        max_upload_bytes = cfg.max_upload_bytes,
        max_in_flight = cfg.max_in_flight,
        "starting"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let server = Server::bind(cfg.bind, dispatcher, cfg.max_in_flight)
            .await
            .with_context(|| format!("binding {}", cfg.bind))?;
        server
            .run_until(async {
                if let Err(e) = shutdown_signal().await {
                    tracing::error!(error = %e, "signal handler failed; shutting down");
                }
            })
            .await?;
        anyhow::Ok(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
