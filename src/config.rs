use clap::Parser;
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::schema::Dialect;

#[derive(Debug, Deserialize, Clone)]
pub struct DataSourceConfig {
    /// Stable identifier, used in cache keys.
    pub id: String,
    /// Path to the DuckDB database file (or ":memory:").
    pub path: String,
    #[serde(default)]
    pub dialect: Dialect,
    pub pool_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub backend: String, // "remote" or "ollama"
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_retries: u32,
    pub query_timeout_secs: u64,
    pub max_rows: usize,
    pub schema_cache_ttl_secs: u64,
    pub result_cache_ttl_secs: u64,
    /// Upper bound on retrieved context items folded into a prompt.
    pub context_limit: usize,
    /// Reject `SELECT *` with no WHERE/LIMIT/aggregate. Policy, not syntax.
    pub block_unbounded_select_star: bool,
    pub sample_rows: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RetrievalConfig {
    pub terminology_path: Option<String>,
    pub examples_path: Option<String>,
    pub knowledge_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub source: DataSourceConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub data_dir: String,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory for data storage
    #[arg(long)]
    pub data_dir: Option<String>,

    /// DuckDB database file to query
    #[arg(long)]
    pub database: Option<String>,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/nl-query/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(data_dir) = &args.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(database) = &args.database {
            config.source.path = database.clone();
        }

        Ok(config)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            query_timeout_secs: 30,
            max_rows: 200,
            schema_cache_ttl_secs: 3600,
            result_cache_ttl_secs: 600,
            context_limit: 20,
            block_unbounded_select_star: true,
            sample_rows: 3,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source: DataSourceConfig {
                id: "default".to_string(),
                path: "nl-query.duckdb".to_string(),
                dialect: Dialect::DuckDb,
                pool_size: 5,
            },
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            llm: LlmConfig {
                backend: "ollama".to_string(),
                model: "sqlcoder".to_string(),
                api_key: None,
                api_url: None,
            },
            pipeline: PipelineConfig::default(),
            retrieval: RetrievalConfig::default(),
            data_dir: "data".to_string(),
        }
    }
}
