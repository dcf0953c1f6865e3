use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod config;
mod db;
mod llm;
mod pipeline;
mod retrieval;
mod schema;
mod util;
mod web;

use crate::config::{AppConfig, CliArgs};
use crate::db::source_pool::SourcePoolManager;
use crate::llm::LlmManager;
use crate::pipeline::Pipeline;
use crate::retrieval::{ContextCategory, FileRetriever, RetrievalCoordinator};
use crate::schema::SchemaIntrospector;
use crate::pipeline::executor::SqlExecutor;
use crate::util::logging::init_tracing;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_tracing();

    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load configuration ({}), using defaults", e);
            AppConfig::default()
        }
    };

    // Ensure data directory exists
    let data_dir = PathBuf::from(&config.data_dir);
    if !data_dir.exists() {
        info!("Creating data directory: {}", config.data_dir);
        std::fs::create_dir_all(&data_dir)?;
    }

    info!("Initializing connection pools");
    let pools = Arc::new(SourcePoolManager::new());

    // Warm the pool for the configured source so a bad path fails at startup
    if let Err(e) = pools.pool_for(&config.source) {
        error!("Failed to open data source '{}': {}", config.source.id, e);
        return Err(e.into());
    }

    info!("Initializing LLM manager with backend: {}", config.llm.backend);
    let llm = Arc::new(LlmManager::new(&config.llm)?);

    let mut retrieval = RetrievalCoordinator::new(config.pipeline.context_limit);
    let categories = [
        (&config.retrieval.terminology_path, ContextCategory::Terminology),
        (&config.retrieval.examples_path, ContextCategory::SqlExample),
        (&config.retrieval.knowledge_path, ContextCategory::DomainKnowledge),
    ];
    for (path, category) in categories {
        if let Some(path) = path {
            info!("Registering {} retriever from {}", category.label(), path);
            retrieval = retrieval.with_retriever(
                category,
                Arc::new(FileRetriever::new(PathBuf::from(path), category)),
            );
        }
    }

    let introspector = SchemaIntrospector::new(
        Arc::clone(&pools),
        Duration::from_secs(config.pipeline.schema_cache_ttl_secs),
    );
    let executor = SqlExecutor::new(
        Arc::clone(&pools),
        Duration::from_secs(config.pipeline.result_cache_ttl_secs),
    );

    let pipeline = Pipeline::new(llm, retrieval, introspector, executor, &config.pipeline);

    let app_state = Arc::new(AppState::new(config.clone(), pipeline));

    info!(
        "Starting nl-query server on {}:{}",
        config.web.host, config.web.port
    );
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(std::io::Error::other(e.to_string()).into());
        }
    }

    Ok(())
}
