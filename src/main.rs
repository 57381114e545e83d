//! CLI entry point for the GTFS to NGSI-LD loader.
//!
//! Provides subcommands for loading and rebuilding configured data sources in
//! a context broker, checking context model coverage, and inspecting
//! realtime feeds.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gtfs_ngsi_loader::{
    config::PipelineConfig,
    coordinator::{Coordinator, SourceSelector},
    fetch::{BasicClient, fetch_source},
    infra::{memory::MemoryBroker, orion::OrionLdClient},
    output::{append_record, print_json, print_pretty},
    parser,
    registry::ContextRegistry,
    report::{Operation, Report, RunStatus},
    services::broker_api::BrokerApi,
};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_ngsi_loader")]
#[command(about = "Harmonize GTFS and point-of-interest data into an NGSI-LD context broker", long_about = None)]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, env = "PIPELINE_CONFIG", default_value = "config/pipeline.json", global = true)]
    config: PathBuf,

    /// Overrides broker.url from the configuration
    #[arg(long, env = "BROKER_URL", global = true)]
    broker_url: Option<String>,

    /// Run against an in-memory broker instead of the configured one
    #[arg(long, default_value_t = false, global = true)]
    dry_run: bool,

    /// CSV file to append per-source run summaries to
    #[arg(long, global = true)]
    report_csv: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the named sources (all configured sources when none are given)
    Load {
        #[arg(value_name = "SOURCE")]
        sources: Vec<String>,
    },
    /// Delete the named sources' entities from the broker, then load them again
    Rebuild {
        #[arg(value_name = "SOURCE")]
        sources: Vec<String>,
    },
    /// Load the context models and verify every configured source is covered
    CheckModels,
    /// Decode a GTFS-RT message from a file or URL and summarize its records
    Decode {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/gtfs_ngsi_loader.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_ngsi_loader.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let Cli {
        config,
        broker_url,
        dry_run,
        report_csv,
        command,
    } = Cli::parse();

    let (operation, sources) = match command {
        Commands::Decode { source } => {
            decode(&source).await?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::CheckModels => {
            let (coordinator, source_count) = build_coordinator(&config, broker_url, dry_run)?;
            coordinator.check_models()?;
            info!(sources = source_count, "All context models resolved");
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Load { sources } => (Operation::Load, sources),
        Commands::Rebuild { sources } => (Operation::Rebuild, sources),
    };

    let (coordinator, _) = build_coordinator(&config, broker_url, dry_run)?;
    let selector = SourceSelector::from_names(sources);
    let cancel = cancel_on_ctrl_c();
    let report = match operation {
        Operation::Load => coordinator.load(&selector, cancel).await,
        Operation::Rebuild => coordinator.rebuild(&selector, cancel).await,
    };
    finish(&report, report_csv.as_deref())
}

/// Reads configuration and context models and wires up the broker.
fn build_coordinator(
    config_path: &Path,
    broker_url: Option<String>,
    dry_run: bool,
) -> Result<(Coordinator, usize)> {
    let mut config = PipelineConfig::load(config_path)?;
    if let Some(url) = broker_url {
        config.broker.url = url;
    }
    let registry = Arc::new(ContextRegistry::load(
        &config.models.official,
        &config.models.custom,
    )?);
    let http = BasicClient::with_timeouts(
        Duration::from_secs(config.broker.timeout_secs),
        Duration::from_secs(config.broker.connect_timeout_secs),
    )?;

    let broker: Arc<dyn BrokerApi> = if dry_run {
        info!("Dry run: loading into an in-memory broker");
        Arc::new(MemoryBroker::new())
    } else {
        info!(url = %config.broker.url, "Using Orion-LD broker");
        Arc::new(OrionLdClient::new(config.broker.url.clone(), http.clone()))
    };
    let coordinator = Coordinator::new(&config, registry, broker, http);
    Ok((coordinator, config.sources.len()))
}

/// Cancels the run on Ctrl+C; batches already sent are allowed to finish.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling remaining batches");
            child.cancel();
        }
    });
    token
}

fn finish(report: &Report, report_csv: Option<&str>) -> Result<ExitCode> {
    print_pretty(report);
    let json = print_json(report)?;
    println!("{json}");
    if let Some(path) = report_csv {
        append_record(path, report).with_context(|| format!("writing {path}"))?;
    }

    Ok(match report.status() {
        RunStatus::Failed => ExitCode::from(2),
        RunStatus::PartiallyFailed => ExitCode::from(1),
        _ => ExitCode::SUCCESS,
    })
}

/// Decodes a realtime message and logs what the loader would extract from it.
#[tracing::instrument]
async fn decode(source: &str) -> Result<()> {
    let bytes = fetch_source(&BasicClient::new(), source).await?;
    let decoded = parser::decode(&bytes, &HashMap::new())?;

    let mut per_kind: BTreeMap<String, usize> = BTreeMap::new();
    for record in &decoded.records {
        *per_kind.entry(record.kind.to_string()).or_default() += 1;
    }
    for dropped in &decoded.dropped {
        warn!(entity_id = %dropped.entity_id, reason = %dropped.reason, "Dropped entity");
    }
    info!(
        timestamp = ?decoded.records.first().map(|r| r.timestamp),
        records = decoded.records.len(),
        dropped = decoded.dropped.len(),
        deleted = decoded.deleted,
        ?per_kind,
        "Feed decoded"
    );
    println!("{}", serde_json::to_string_pretty(&per_kind)?);
    Ok(())
}
