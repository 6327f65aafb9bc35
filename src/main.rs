//! Command line interface for operating the relay. Supports initialization,
//! ingesting events, rebuilding indexes, serving the WebSocket relay and
//! signature verification.

mod auth;
mod config;
mod connection;
mod dispatch;
mod event;
mod filter;
mod handlers;
mod message;
mod registry;
mod relay;
mod router;
mod server;
mod storage;
#[cfg(test)]
mod testutil;
mod verify;
mod ws;

use std::{fs, net::SocketAddr, path::Path, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{Settings, DEFAULT_ACCEPTED_KINDS};
use relay::Relay;
use storage::Store;
use tracing::{info, warn};
use verify::{Schnorr, SignatureVerifier};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "hornet-relay",
    author,
    version,
    about = "Nostr relay with live subscriptions and NIP-42 authentication"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env", global = true)]
    env: String,
    /// Log filter used when `RUST_LOG` is unset, e.g. `debug` or `hornet_relay=trace`.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the directory tree at `STORE_ROOT`.
    Init,
    /// Ingest one or more event files.
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Rebuild indexes from existing events.
    Reindex,
    /// Accept WebSocket clients and serve relay info on `BIND`.
    Serve,
    /// Verify a random sample of stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let store = Store::new(cfg.store_root.clone());
    match cli.command {
        Commands::Init => {
            store.init()?;
            info!(root = %cfg.store_root.display(), "store initialized");
        }
        Commands::Ingest { files } => {
            // Load each JSON file and store it if not already present.
            for f in files {
                let data = fs::read_to_string(&f).with_context(|| format!("reading {f}"))?;
                let ev: event::Event =
                    serde_json::from_str(&data).with_context(|| format!("parsing {f}"))?;
                if cfg.verify_sig {
                    Schnorr
                        .verify(&ev)
                        .with_context(|| format!("verifying {f}"))?;
                }
                let stored = store.ingest(&ev)?;
                info!(id = %ev.id, stored, "ingest");
            }
        }
        Commands::Reindex => {
            store.reindex()?;
            info!("indexes rebuilt");
        }
        Commands::Serve => {
            store.init()?;
            let addr: SocketAddr = cfg
                .bind
                .parse()
                .with_context(|| format!("BIND is not a socket address: {}", cfg.bind))?;
            let relay = Arc::new(Relay::from_settings(&cfg, Arc::new(store)));
            server::serve(addr, relay, shutdown_signal()).await?;
        }
        Commands::Verify { sample } => {
            // Randomly verify Schnorr signatures for `sample` events.
            let checked = store.verify_sample(sample, &Schnorr)?;
            info!(checked, "signatures verified");
        }
    }
    Ok(())
}

/// Resolves on Ctrl-C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("hornet-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", display_path(&store_root)));
    content.push_str("BIND=127.0.0.1:9900\n");
    content.push_str("RELAY_URL=ws://127.0.0.1:9900\n");
    content.push_str("VERIFY_SIG=1\n");
    content.push_str(&format!("ACCEPTED_KINDS={DEFAULT_ACCEPTED_KINDS}\n"));
    content.push_str("AUTH_REQUIRED_KINDS=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Install the global `tracing` subscriber; `RUST_LOG` wins over `--log-level`.
fn init_tracing(level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    run(cli).await
}
