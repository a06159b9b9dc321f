//! # Vassago CLI
//!
//! Ingest documents, ask organization-scoped questions and run the HTTP API.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "vassago")]
#[command(author = "Daemoniorum Engineering")]
#[command(version)]
#[command(about = "Retrieval-augmented answers over organization documents", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    json_logs: bool,

    /// Configuration file (defaults to ~/.config/vassago/config.toml)
    #[arg(short, long, global = true, env = "VASSAGO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Ingest text files as documents
    Ingest {
        /// Owning organization
        #[arg(short, long)]
        organization: String,

        /// Files to ingest; each file name (without extension) becomes the document id
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Explicit document id (single file only)
        #[arg(long)]
        id: Option<String>,

        /// Chunks embedded concurrently per document
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Ask a question
    Ask {
        /// The question
        query: String,

        /// Organization whose documents may be used
        #[arg(short, long)]
        organization: String,

        /// Number of chunks to retrieve
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },

    /// Delete a document and its chunks
    Delete {
        /// Document id
        document: String,

        /// Owning organization
        #[arg(short, long)]
        organization: String,
    },

    /// Display version and build info
    Version,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::Config::config_path);
    let mut cfg = config::Config::load(Some(&config_path))?;

    // Initialize logging
    let telemetry_config = vassago_telemetry::TelemetryConfig::new("vassago")
        .with_log_level(&cli.log_level);

    let telemetry_config = if cli.json_logs {
        telemetry_config.with_json_logs()
    } else {
        telemetry_config
    };

    let telemetry_config = match &cfg.telemetry.otlp_endpoint {
        Some(endpoint) => telemetry_config.with_otlp(endpoint),
        None => telemetry_config,
    };

    vassago_telemetry::init_logging(&telemetry_config);
    let _tracing = vassago_telemetry::init_tracing(&telemetry_config)
        .map_err(|e| eyre!("Failed to initialize tracing: {e}"))?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                cfg.server.host = host;
            }
            if let Some(port) = port {
                cfg.server.port = port;
            }
            commands::serve(&cfg).await?;
        }

        Commands::Ingest {
            organization,
            files,
            id,
            concurrency,
        } => {
            if let Some(concurrency) = concurrency {
                cfg.ingestion.concurrency = concurrency;
            }
            commands::ingest(&cfg, organization, files, id).await?;
        }

        Commands::Ask {
            query,
            organization,
            top_k,
        } => {
            commands::ask(&cfg, organization, query, top_k).await?;
        }

        Commands::Delete {
            document,
            organization,
        } => {
            commands::delete(&cfg, organization, document).await?;
        }

        Commands::Version => {
            commands::version();
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                config::show_config(&cfg, &config_path)?;
            }
            ConfigAction::Path => {
                println!("{}", config_path.display());
            }
        },
    }

    Ok(())
}
