//! LiveText Daemon (livetextd)
//!
//! Accepts editor connections over TCP and hosts one workspace per open document.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (TCP on 7070, in-memory storage)
//! livetextd
//!
//! # Custom port
//! livetextd --port 7100
//!
//! # With persistence
//! livetextd --db /var/lib/livetext/documents.db
//!
//! # With configuration file
//! livetextd --config /etc/livetext/livetext.toml
//! ```

mod config;
mod error;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use livetext_storage::{MemoryStorage, SqliteStorage, Storage};
use livetext_transport::{SessionRegistry, TcpServer};

use crate::config::{FileConfig, Settings};
use crate::error::StartupError;

/// LiveText Daemon - collaborative rich-text editing server
#[derive(Parser, Debug)]
#[command(name = "livetextd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "LIVETEXT_BIND")]
    bind: Option<String>,

    /// TCP port to listen on [default: 7070]
    #[arg(short, long, env = "LIVETEXT_PORT")]
    port: Option<u16>,

    /// Configuration file path
    #[arg(short, long, env = "LIVETEXT_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path for persistence (default: in-memory only)
    #[arg(long, env = "LIVETEXT_DB")]
    db: Option<PathBuf>,

    /// Period of the per-document save timer, in milliseconds [default: 5000]
    #[arg(long, env = "LIVETEXT_SAVE_INTERVAL_MS")]
    save_interval_ms: Option<u64>,

    /// Idle read time before a liveness ping, in milliseconds [default: 10000]
    #[arg(long, env = "LIVETEXT_IDLE_TIMEOUT_MS")]
    idle_timeout_ms: Option<u64>,

    /// Largest accepted frame, in bytes [default: 16777216]
    #[arg(long, env = "LIVETEXT_MAX_FRAME_SIZE")]
    max_frame_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long, env = "LIVETEXT_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn overrides(&self) -> FileConfig {
        FileConfig {
            bind: self.bind.clone(),
            port: self.port,
            db: self.db.clone(),
            save_interval_ms: self.save_interval_ms,
            idle_timeout_ms: self.idle_timeout_ms,
            max_frame_size: self.max_frame_size,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(file.merge(args.overrides()))?;

    // RUST_LOG takes precedence over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner();

    let storage = open_storage(&settings)?;

    let registry = SessionRegistry::new(storage, settings.workspace_config());
    let server = TcpServer::new(registry, settings.addr, settings.server_config());
    let listener = server.bind().await.map_err(|source| StartupError::Bind {
        addr: settings.addr,
        source,
    })?;

    info!(
        addr = %settings.addr,
        save_interval_ms = settings.save_interval.as_millis() as u64,
        idle_timeout_ms = settings.idle_timeout.as_millis() as u64,
        "Starting LiveText daemon"
    );

    let handle = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            tracing::error!(error = %e, "TCP server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    handle.abort();

    Ok(())
}

fn open_storage(settings: &Settings) -> Result<Arc<dyn Storage>, StartupError> {
    match &settings.db {
        Some(path) => {
            info!(path = %path.display(), "Initializing SQLite persistence");
            let storage = SqliteStorage::new(path).map_err(|source| StartupError::Storage {
                path: path.clone(),
                source,
            })?;
            Ok(Arc::new(storage))
        }
        None => {
            info!("Running in-memory only (no --db specified)");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}

fn print_banner() {
    println!(
        r#"
  ╦  ╦╦  ╦╔═╗╔╦╗╔═╗═╗ ╦╔╦╗
  ║  ║╚╗╔╝║╣  ║ ║╣ ╔╩╦╝ ║
  ╩═╝╩ ╚╝ ╚═╝ ╩ ╚═╝╩ ╚═ ╩
  Collaborative rich-text editing
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
