//! Single-process pipeline server.
//!
//! Loads a pipeline config (CLI argument, `GRANARY_CONFIG_PATH`, or
//! the built-in grants pipeline), wires in-memory storage and sink
//! backends with the stock handlers, and runs until interrupted.

use std::sync::Arc;

use anyhow::Context;
use granary_core::{init_logging, MemoryBackend};
use granary_flow::backend::{handlers, HandlerBackend};
use granary_flow::config::{env, PipelineConfig};
use granary_flow::events::InMemoryOutbox;
use granary_flow::metrics::init_metrics;
use granary_flow::runtime::PipelineRuntime;
use granary_flow::sink::{MemorySink, RecordKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("failed to load pipeline config")?;
    init_logging(config.log_format);
    init_metrics().context("failed to install metrics recorder")?;

    let storage = Arc::new(MemoryBackend::new());
    let sink = Arc::new(MemorySink::new());
    let outbox = Arc::new(InMemoryOutbox::new());

    let backend = HandlerBackend::new(storage.clone(), sink, outbox.clone());
    backend.register("copy-to-next-stage", handlers::copy_to_next_stage())?;
    backend.register("store-grants", handlers::upsert_to_sink(RecordKind::Grant))?;
    backend.register("store-patents", handlers::upsert_to_sink(RecordKind::Patent))?;

    let runtime = PipelineRuntime::start(config, storage, Arc::new(backend), outbox)
        .await
        .context("failed to start pipeline runtime")?;
    tracing::info!(api_addr = %runtime.api_addr(), "granary pipeline ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    runtime.shutdown().await;
    Ok(())
}

fn load_config() -> granary_flow::error::Result<PipelineConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(env::CONFIG_PATH).ok());
    match path {
        Some(path) => PipelineConfig::from_json_file(path),
        None => {
            let mut config = PipelineConfig::builtin_grants();
            config.apply_env()?;
            config.validate()?;
            Ok(config)
        }
    }
}
