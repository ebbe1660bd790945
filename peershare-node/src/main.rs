// PeerShare node: TCP overlay, file-sharing core and a stdin console.

mod config;
mod console;
mod transport;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use peershare_core::{FileSharing, Keypair, Overlay};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::transport::TcpOverlay;

const PEER_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "peershare-node", version, about = "Share files with peers over TCP")]
struct Cli {
    /// Config file (default: ~/.config/peershare/config.toml, then /etc/peershare/config.toml)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
    /// Listen address, overrides the config file
    #[arg(short, long)]
    listen: Option<String>,
    /// Peer to connect to (host:port); may be repeated
    #[arg(short, long = "peer")]
    peers: Vec<String>,
    /// Run without the stdin console until Ctrl+C
    #[arg(long)]
    headless: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they do not interleave with console output.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut cfg = match &cli.config {
        Some(path) => config::load_from(path)?,
        None => config::load(),
    };
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    cfg.peers.extend(cli.peers);

    let keypair = match &cfg.identity_file {
        Some(path) => load_or_create_identity(path)?,
        None => Keypair::generate(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, keypair, !cli.headless))
}

async fn run(cfg: config::Config, keypair: Keypair, interactive: bool) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("binding {}", cfg.listen))?;
    let local_addr = listener.local_addr()?;
    let overlay = TcpOverlay::new(keypair.peer_id(), local_addr.port());
    let overlay_events = overlay
        .take_events()
        .context("overlay events already taken")?;
    let (fs, file_events) = FileSharing::new(overlay.clone(), cfg.core())?;
    let fs = Arc::new(fs);
    info!(peer = %fs.local_peer_id(), listen = %local_addr, "peershare node started");

    tokio::spawn(overlay.clone().run_listener(listener));
    tokio::spawn(fs.clone().run(overlay_events));
    tokio::spawn(console::print_events(file_events));
    tokio::spawn(transport::maintain_peers(
        overlay.clone(),
        cfg.peers.clone(),
        PEER_RETRY_INTERVAL,
    ));

    if interactive {
        tokio::select! {
            r = console::run_console(fs, overlay, cfg.download_dir.clone()) => r?,
            r = shutdown_signal() => r?,
        }
    } else {
        shutdown_signal().await?;
    }
    info!("shutting down");
    Ok(())
}

/// Read the secret key from `path` (hex), or generate one and write it there.
fn load_or_create_identity(path: &Path) -> anyhow::Result<Keypair> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading identity {}", path.display()))?;
        let mut secret = [0u8; 32];
        hex::decode_to_slice(text.trim(), &mut secret)
            .with_context(|| format!("identity {} is not a 32-byte hex key", path.display()))?;
        return Ok(Keypair::from_secret_bytes(secret));
    }
    let keypair = Keypair::generate();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    std::fs::write(path, hex::encode(keypair.secret_bytes()))
        .with_context(|| format!("writing identity {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    info!(path = %path.display(), peer = %keypair.peer_id(), "created new identity");
    Ok(keypair)
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
