//! # iterlink
//!
//! Command line front end for the sync engine.
//!
//! - `watch`: connect, persist, and print every routed event as a JSON line
//! - `stats`: per-instance and per-session counts from the local store
//! - `events`: recent persisted events for one instance

#![deny(unsafe_code)]

mod printer;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iterlink_client::{MemoryCache, SyncEngine, WsConnector};
use iterlink_core::InstanceId;
use iterlink_settings::SyncSettings;
use iterlink_store::EventStore;
use tracing::info;

use crate::printer::PrintingCache;

/// Session event sync client.
#[derive(Parser, Debug)]
#[command(name = "iterlink", about = "Session event sync client", version)]
struct Cli {
    /// Settings file (default: ~/.iterlink/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Path to the `SQLite` event store (overrides settings).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the server and stream events to stdout.
    Watch {
        /// Server URL (overrides settings).
        #[arg(long)]
        url: Option<String>,
        /// Instance shown as active.
        #[arg(long)]
        instance: Option<String>,
    },
    /// Print store counts per instance and session.
    Stats {
        /// Only this instance, with its sessions.
        #[arg(long)]
        instance: Option<String>,
    },
    /// Print persisted events for an instance, oldest first.
    Events {
        /// Instance to list.
        instance: String,
        /// Most recent N events.
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

fn load(cli: &Cli) -> Result<SyncSettings> {
    let path = cli
        .settings
        .clone()
        .unwrap_or_else(iterlink_settings::settings_path);
    let mut settings = iterlink_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(db_path) = &cli.db_path {
        settings.store.db_path.clone_from(db_path);
    }
    Ok(settings)
}

fn init_logging(settings: &SyncSettings) {
    if settings.logging.json {
        iterlink_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        iterlink_core::logging::init_subscriber(&settings.logging.level);
    }
}

fn open_store(settings: &SyncSettings) -> Result<Arc<EventStore>> {
    let store = EventStore::open(&settings.store)
        .with_context(|| format!("Failed to open store at {}", settings.store.db_path.display()))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load(&cli)?;
    init_logging(&settings);

    match cli.command {
        Command::Watch { url, instance } => {
            if let Some(url) = url {
                settings.server.url = url;
            }
            let instance = instance.unwrap_or_else(|| settings.server.default_instance.clone());
            watch(&settings, InstanceId::from_raw(instance)).await
        }
        Command::Stats { instance } => {
            let store = open_store(&settings)?;
            let out = tokio::task::spawn_blocking(move || {
                printer::stats(&store, instance.map(InstanceId::from_raw).as_ref())
            })
            .await
            .context("stats task failed")??;
            print!("{out}");
            Ok(())
        }
        Command::Events { instance, limit } => {
            let store = open_store(&settings)?;
            let instance = InstanceId::from_raw(instance);
            let events = tokio::task::spawn_blocking(move || store.recent_events(&instance, limit))
                .await
                .context("events task failed")??;
            for event in &events {
                println!("{}", printer::event_line(event));
            }
            Ok(())
        }
    }
}

async fn watch(settings: &SyncSettings, active: InstanceId) -> Result<()> {
    let store = open_store(settings)?;
    let cache = Arc::new(PrintingCache::new(MemoryCache::new(active.clone())));
    let connector = Arc::new(WsConnector::new(settings.server.url.clone()));

    let engine = SyncEngine::start(settings, store, cache, connector)
        .await
        .context("Failed to start sync engine")?;
    engine.set_active_instance(active);
    engine.connect();

    let mut app = engine.app_messages();
    let mut state = engine.watch_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            msg = app.recv() => match msg {
                Ok(value) => println!("{value}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "application messages lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                info!(state = ?*state.borrow(), "connection state changed");
            }
        }
    }

    engine.stop().await;
    let stats = engine.stats();
    info!(written = stats.written, failed = stats.failed, "shutdown complete");
    Ok(())
}
