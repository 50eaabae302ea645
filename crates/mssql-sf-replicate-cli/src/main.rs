//! mssql-sf-replicate CLI - metadata-driven MSSQL to Snowflake replication.

use clap::{ArgGroup, Parser};
use mssql_sf_replicate::{
    Manifest, MssqlPool, ParquetSinkFactory, ReplicateError, ReplicationConfig, ReplicationSummary,
    Replicator, SnowflakeSinkFactory, SourceConfig, TargetConfig,
};
use mssql_sf_replicate::config::{DEFAULT_DDL_PATH, DEFAULT_LOAD_RETRIES, DEFAULT_RULES_PATH, DEFAULT_TIMEZONE};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mssql-sf-replicate")]
#[command(about = "Metadata-driven MSSQL to Snowflake table replication")]
#[command(version)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["table_config", "table_rules"]),
))]
struct Cli {
    /// Run setup: discover the tables of this YAML configuration document
    /// and write DDL and rules artifacts
    #[arg(short = 'c', long)]
    table_config: Option<PathBuf>,

    /// Run load: replicate the tables of this JSON rules document
    #[arg(short = 'r', long)]
    table_rules: Option<PathBuf>,

    /// Where setup writes the DDL artifact
    #[arg(long, default_value = DEFAULT_DDL_PATH)]
    ddl_out: PathBuf,

    /// Where setup writes the rules artifact
    #[arg(long, default_value = DEFAULT_RULES_PATH)]
    rules_out: PathBuf,

    /// Write batches as local parquet files under this directory instead of
    /// loading them into Snowflake
    #[arg(long, requires = "table_rules")]
    parquet_dir: Option<PathBuf>,

    /// Tables replicated concurrently
    #[arg(long, default_value = "1")]
    workers: usize,

    /// Omit primary key constraints from generated DDL
    #[arg(long)]
    no_pk: bool,

    /// Timezone for naive timestamps: UTC, a fixed offset such as +02:00, or
    /// an IANA name such as America/New_York
    #[arg(long, default_value = DEFAULT_TIMEZONE)]
    timezone: String,

    /// Timeout in seconds for each batch fetch
    #[arg(long)]
    query_timeout: Option<u64>,

    /// Timeout in seconds for each batch load
    #[arg(long)]
    load_timeout: Option<u64>,

    /// Retries for transient destination failures
    #[arg(long, default_value_t = DEFAULT_LOAD_RETRIES)]
    load_retries: u32,

    /// Output the load summary as JSON to stdout
    #[arg(long)]
    output_json: bool,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Cli {
    fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            workers: self.workers,
            timezone: self.timezone.clone(),
            use_pk: !self.no_pk,
            query_timeout: self.query_timeout.map(Duration::from_secs),
            load_timeout: self.load_timeout.map(Duration::from_secs),
            load_retries: self.load_retries,
            ddl_path: self.ddl_out.clone(),
            rules_path: self.rules_out.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // clap reports usage errors with exit code 2; usage errors here exit with 1
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), ReplicateError> {
    setup_logging(&cli.log_level, &cli.log_format)?;

    if let Ok(path) = dotenvy::dotenv() {
        info!("Loaded environment from {:?}", path);
    }

    let config = cli.replication_config();
    config.validate()?;

    let cancel_token = setup_signal_handler().await?;

    if let Some(config_path) = &cli.table_config {
        // parse the document before touching the environment or the network
        let manifest = Manifest::from_config_file(config_path)?;
        info!("Loaded configuration from {:?}", config_path);

        let replicator = source_replicator(&config, cancel_token).await?;
        let outcome = replicator.setup_manifest(manifest).await?;

        println!("Setup completed!");
        println!(
            "  Tables: {}/{}",
            outcome.report.tables_found,
            outcome.manifest.table_count()
        );
        for name in &outcome.report.out_of_order_tables {
            println!("  Out of order: {}", name);
        }
        println!("  DDL: {}", outcome.ddl_path.display());
        println!("  Rules: {}", outcome.rules_path.display());
        return Ok(());
    }

    let rules_path = cli
        .table_rules
        .as_ref()
        .ok_or_else(|| ReplicateError::Usage("one of --table-config or --table-rules is required".into()))?;
    let manifest = Manifest::from_rules_file(rules_path)?;
    info!("Loaded rules from {:?}", rules_path);

    let summary = match &cli.parquet_dir {
        Some(dir) => {
            let replicator = source_replicator(&config, cancel_token).await?;
            replicator
                .replicate(&manifest, Arc::new(ParquetSinkFactory::new(dir)))
                .await?
        }
        None => {
            let sink = SnowflakeSinkFactory::new(TargetConfig::from_env()?, config.load_retries)?;
            let replicator = source_replicator(&config, cancel_token).await?;
            replicator.replicate(&manifest, Arc::new(sink)).await?
        }
    };

    print_summary(&summary, cli.output_json)
}

async fn source_replicator(
    config: &ReplicationConfig,
    cancel_token: CancellationToken,
) -> Result<Replicator, ReplicateError> {
    let source = SourceConfig::from_env()?;
    let pool = MssqlPool::new(source, config.workers.max(1) as u32).await?;
    Ok(Replicator::new(config.clone(), Arc::new(pool))?.with_cancel(cancel_token))
}

fn print_summary(summary: &ReplicationSummary, json: bool) -> Result<(), ReplicateError> {
    if json {
        println!("{}", summary.to_json()?);
    } else {
        println!("\nReplication completed!");
        println!("  Run ID: {}", summary.run_id);
        println!("  Duration: {:.2}s", summary.duration_seconds);
        println!(
            "  Tables: {}/{}",
            summary.tables_completed, summary.tables_total
        );
        println!("  Batches: {}", summary.batches);
        println!("  Rows: {}", summary.rows_transferred);
    }
    Ok(())
}

fn setup_logging(level: &str, format: &str) -> Result<(), ReplicateError> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => {
            return Err(ReplicateError::Usage(format!(
                "invalid log level '{}' (expected trace, debug, info, warn or error)",
                other
            )))
        }
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => {
            return Err(ReplicateError::Usage(format!(
                "invalid log format '{}' (expected text or json)",
                other
            )))
        }
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, ReplicateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token_int = cancel_token.clone();
    tokio::spawn(async move {
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Stopping after in-flight batches...");
        token_int.cancel();
    });

    let token_term = cancel_token.clone();
    tokio::spawn(async move {
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Stopping after in-flight batches...");
        token_term.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, ReplicateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after in-flight batches...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
