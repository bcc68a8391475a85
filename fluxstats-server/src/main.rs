//! FluxStats Server - HTTP ingestion for pre-aggregated statistics

mod api;

use anyhow::Context;
use fluxstats_core::config::StatsConfig;
use fluxstats_core::statistic::{StatisticConfiguration, StatisticRegistry};
use fluxstats_core::store::MemoryAggregateStore;
use fluxstats_core::transport::MemoryBadEventSink;
use fluxstats_core::uid::{FileUidStore, UidDictionary};
use fluxstats_core::AggregationPipeline;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Environment variable naming the config file when no argument is given
const CONFIG_ENV: &str = "FLUXSTATS_CONFIG";

/// Bad events kept in memory for inspection
const BAD_EVENT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Data directory
    pub data_dir: PathBuf,
    pub log_format: LogFormat,
    /// Aggregation settings
    pub stats: StatsConfig,
    /// Statistics registered at startup
    pub statistics: Vec<StatisticConfiguration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8087)),
            data_dir: PathBuf::from("data"),
            log_format: LogFormat::default(),
            stats: StatsConfig::default(),
            statistics: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load from the file named by the first argument or `FLUXSTATS_CONFIG`,
    /// else use defaults
    fn load() -> anyhow::Result<Self> {
        let path = std::env::args()
            .nth(1)
            .or_else(|| std::env::var(CONFIG_ENV).ok());
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config file {}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path))
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::load()?;
    init_tracing(config.log_format);
    config.stats.validate()?;

    info!("Starting FluxStats server...");
    info!("Data directory: {:?}", config.data_dir);
    info!("HTTP server: http://{}", config.http_addr);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {:?}", config.data_dir))?;

    // Identifier dictionary, durable across restarts
    let uid_store = FileUidStore::open(config.data_dir.join("uids.log"), config.stats.uid_width)?;
    let dictionary = Arc::new(UidDictionary::new(
        Arc::new(uid_store),
        config.stats.dictionary_cache_capacity,
        config.stats.flush_retry.clone(),
    ));
    let warmed = dictionary.warm().await?;
    info!(entries = warmed, "Dictionary cache warmed");

    let registry = Arc::new(StatisticRegistry::new());
    for statistic in config.statistics.iter().cloned() {
        registry.register(statistic)?;
    }

    let store = Arc::new(MemoryAggregateStore::new(
        config.stats.uid_width,
        config.stats.max_event_ids,
    ));
    let bad_events = Arc::new(MemoryBadEventSink::new(BAD_EVENT_CAPACITY));
    let pipeline = Arc::new(AggregationPipeline::new(
        config.stats.clone(),
        registry.clone(),
        dictionary.clone(),
        store.clone(),
        bad_events.clone(),
    )?);
    pipeline.start().await?;

    let state = api::AppState {
        pipeline: pipeline.clone(),
        registry,
        dictionary,
        store,
        bad_events,
    };
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("FluxStats server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Final flushes run here
    pipeline.stop().await?;
    info!("FluxStats server stopped");
    Ok(())
}
