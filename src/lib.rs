// Vertigo - OpenAI-compatible reverse proxy for the Gemini API

pub mod api;
pub mod config;
pub mod db;
pub mod proxy;
pub mod store;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{AppConfig, StoreBackend};
use proxy::ProxyManager;
use store::{ConversationStore, MemoryStore, SqliteStore};

#[derive(Debug, Parser)]
#[command(name = "vertigo", version, about = "OpenAI-compatible reverse proxy for the Gemini API")]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "VERTIGO_CONFIG", default_value = "vertigo.yaml")]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = if debug {
        EnvFilter::new(default_level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    // A subscriber may already be installed (e.g. by an embedding test harness)
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init();
}

pub fn open_store(config: &AppConfig) -> Result<Arc<dyn ConversationStore>> {
    let store: Arc<dyn ConversationStore> = match config.store.backend {
        StoreBackend::Memory => {
            tracing::info!("Using in-memory conversation store");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Sqlite => {
            let store = SqliteStore::open(&config.store.path)
                .with_context(|| format!("Failed to open conversation database {}", config.store.path))?;
            tracing::info!("Using SQLite conversation store at {}", config.store.path);
            Arc::new(store)
        }
    };
    Ok(store)
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(&cli.config);
    let config_debug = config.as_ref().map(|c| c.debug).unwrap_or(false);
    init_tracing(cli.debug || config_debug);

    let config = config?;
    tracing::info!(
        "Config loaded from {:?} ({} API keys, {:?} store)",
        cli.config,
        config.gemini.api_keys.len(),
        config.store.backend
    );

    let store = open_store(&config)?;
    let proxy = ProxyManager::new(&config, store).context("Failed to build upstream client")?;

    tracing::info!("Starting API server...");
    api::start_server(&config.listen_addr(), Arc::new(proxy)).await
}
