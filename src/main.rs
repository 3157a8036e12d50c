use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hazardwatch::analysis::OutlierModels;
use hazardwatch::config::{AppConfig, LoggingConfig};
use hazardwatch::detect::StatusEngine;
use hazardwatch::security::{self, NODE_HEADER, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use hazardwatch::storage::{load_histories, SqliteStore};

#[derive(Parser)]
#[command(
    name = "hazardwatch",
    about = "Hazard status engine and signed telemetry ingestion for monitoring nodes",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to /etc/hazardwatch/hazardwatch.toml)
    #[arg(long, global = true, env = "HAZARDWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// Bind address, overriding server.bind
        #[arg(long)]
        bind: Option<String>,

        /// Keep readings in memory instead of SQLite
        #[arg(long)]
        memory: bool,
    },

    /// Validate and print the effective configuration (secrets redacted)
    CheckConfig,

    /// Print signed ingest headers for a request body
    Sign {
        /// Node identifier
        #[arg(long)]
        node: String,

        /// Shared secret for the node
        #[arg(long, env = "HAZARDWATCH_NODE_SECRET", hide_env_values = true)]
        secret: String,

        /// File containing the exact request body
        #[arg(long)]
        body_file: PathBuf,

        /// Epoch seconds (default: now)
        #[arg(long)]
        timestamp: Option<i64>,

        /// Nonce (default: random UUID)
        #[arg(long)]
        nonce: Option<String>,
    },

    /// Run one recompute pass over the database and print the result
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(p) => AppConfig::load(p)?,
        None => AppConfig::load_or_default(),
    };
    config.apply_env()?;
    Ok(config)
}

/// Subscriber used while the configuration itself is being loaded.
fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish()
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn sign(
    node: &str,
    secret: &str,
    body_file: &Path,
    timestamp: Option<i64>,
    nonce: Option<String>,
) -> Result<()> {
    let body = std::fs::read(body_file)
        .with_context(|| format!("failed to read body file {}", body_file.display()))?;
    let ts = timestamp.unwrap_or_else(|| Utc::now().timestamp());
    let nonce = nonce.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let signature = security::sign(secret.as_bytes(), node, ts, &nonce, &body)
        .map_err(|e| anyhow::anyhow!("cannot key hmac: {e}"))?;
    println!("{NODE_HEADER}: {node}");
    println!("{TIMESTAMP_HEADER}: {ts}");
    println!("{NONCE_HEADER}: {nonce}");
    println!("{SIGNATURE_HEADER}: {signature}");
    Ok(())
}

fn print_status(config: &AppConfig, json: bool) -> Result<()> {
    let store = SqliteStore::open(&config.server.db_path)?;
    let inputs = load_histories(&store, &config.server.known_nodes, config.server.history_limit)?;
    let models = OutlierModels::load(
        config.model.ground_path.as_deref(),
        config.model.water_path.as_deref(),
    );
    let engine = StatusEngine::new(config.status.clone(), models);
    let now = Utc::now();
    engine.recompute(&inputs, now);
    let view = engine.view(now, &config.server.known_nodes);

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!(
        "\nOverall: {} (p={:.2}, confidence={:.2})",
        view.overall.status, view.overall.abnormal_probability, view.overall.confidence
    );
    for reason in &view.overall.reasons {
        println!("  - {reason}");
    }
    println!();
    println!("{:<12} | {:<8} | {:>5} | {:>5} | Summary", "Node", "Status", "p", "conf");
    println!("{:-<12}-|-{:-<8}-|-{:-<5}-|-{:-<5}-|-{:-<40}", "", "", "", "", "");
    for (id, node) in &view.nodes {
        println!(
            "{:<12} | {:<8} | {:>5.2} | {:>5.2} | {}",
            id,
            node.display_status.to_string(),
            node.node.abnormal_probability,
            node.node.confidence,
            node.offline_reason.as_deref().unwrap_or(&node.node.summary)
        );
    }
    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // signing needs no configuration
    let command = match cli.command {
        Commands::Sign {
            node,
            secret,
            body_file,
            timestamp,
            nonce,
        } => return sign(&node, &secret, &body_file, timestamp, nonce),
        other => other,
    };

    let mut config = tracing::subscriber::with_default(bootstrap_subscriber(), || {
        load_config(cli.config.as_deref())
    })?;
    init_tracing(&config.logging);

    match command {
        Commands::Serve { bind, memory } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            config.validate()?;
            tracing::info!(bind = %config.server.bind, "starting hazardwatch");
            hazardwatch::serve(config, memory).await?;
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("{}", toml::to_string_pretty(&config)?);
            println!(
                "# hmac secrets configured for {} node(s)",
                config.security.hmac_secrets.len()
            );
        }
        Commands::Status { json } => print_status(&config, json)?,
        Commands::Sign { .. } => {}
    }

    Ok(())
}
