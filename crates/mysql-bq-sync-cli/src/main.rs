//! mysql-bq-sync CLI - Chunked MySQL to BigQuery synchronization.

use clap::{Parser, Subcommand};
use mysql_bq_sync::error::EXIT_CANCELLED;
use mysql_bq_sync::{Config, Orchestrator, RunResult, SyncError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mysql-bq-sync")]
#[command(about = "Chunked MySQL to BigQuery synchronization")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize tables into the destination
    Run {
        /// Only sync these source systems (repeatable)
        #[arg(long = "source", value_name = "ID")]
        sources: Vec<String>,

        /// Override the incremental lookback window in days
        #[arg(long)]
        lookback_days: Option<u32>,

        /// Treat every table as full refresh
        #[arg(long)]
        force_full_refresh: bool,

        /// Override rows per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Sync a single table, given as <system>.<table>
        #[arg(long, value_name = "SYSTEM.TABLE")]
        table: Option<String>,

        /// Override the source query timeout in seconds
        #[arg(long, value_name = "SECS")]
        query_timeout: Option<u64>,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Dry run: resolve and show each table's plan without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Compare source and destination row counts
    Validate,

    /// Test source and destination connections
    HealthCheck,
}

/// Run parameters that override configuration values.
#[derive(Default)]
struct Overrides {
    lookback_days: Option<u32>,
    force_full_refresh: bool,
    chunk_size: Option<usize>,
    query_timeout: Option<u64>,
    workers: Option<usize>,
}

impl Overrides {
    /// Run-level values win over both the sync section and per-table records.
    fn apply(self, config: &mut Config) -> Result<(), SyncError> {
        if let Some(days) = self.lookback_days {
            config.sync.lookback_days = days;
            for record in config.strategies.values_mut().flat_map(|t| t.values_mut()) {
                record.lookback_days = None;
            }
        }
        if let Some(size) = self.chunk_size {
            config.sync.chunk_size = size;
            for record in config.strategies.values_mut().flat_map(|t| t.values_mut()) {
                record.chunk_size = None;
            }
        }
        if self.force_full_refresh {
            config.sync.force_full_refresh = true;
        }
        if let Some(secs) = self.query_timeout {
            config.sync.query_timeout_secs = secs;
        }
        if let Some(w) = self.workers {
            config.sync.workers = Some(w);
        }
        config.validate()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, SyncError> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
    let cancel_token = setup_signal_handler(cli.shutdown_timeout);

    match cli.command {
        Commands::Run {
            sources,
            lookback_days,
            force_full_refresh,
            chunk_size,
            table,
            query_timeout,
            workers,
            dry_run,
        } => {
            Overrides {
                lookback_days,
                force_full_refresh,
                chunk_size,
                query_timeout,
                workers,
            }
            .apply(&mut config)?;
            let selector = table.as_deref().map(parse_table_selector).transpose()?;

            let mut orchestrator = Orchestrator::new(config).await?.with_sources(sources);
            if let Some((system, name)) = selector {
                orchestrator = orchestrator.with_table(system, name);
            }

            if dry_run {
                let plans = orchestrator.plan().await?;
                if cli.output_json {
                    println!("{}", serde_json::to_string_pretty(&plans)?);
                } else {
                    println!("Dry run: {} tables", plans.len());
                    for plan in &plans {
                        println!(
                            "\n  {}.{} -> {}",
                            plan.system_id, plan.source_table, plan.destination_table
                        );
                        println!(
                            "    Strategy: {}{}",
                            plan.strategy,
                            if plan.degraded { " (degraded)" } else { "" }
                        );
                        println!("    Write mode: {}", plan.load_mode);
                        println!("    Query: {}", plan.source_query);
                        if let Some(ref predicate) = plan.delete_predicate {
                            println!("    Delete: {}", predicate);
                        }
                        println!(
                            "    Estimate: {} ({:?}), chunk size {}",
                            plan.estimate.value, plan.estimate.confidence, plan.chunk_size
                        );
                    }
                }
                return Ok(0);
            }

            let result = orchestrator.run(cancel_token).await?;
            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_summary(&result);
            }
            Ok(result.exit_code())
        }

        Commands::Validate => {
            let orchestrator = Orchestrator::new(config).await?;
            let tables = orchestrator.validate().await?;
            let mismatched = tables.iter().filter(|t| !t.matches).count();

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&tables)?);
            } else {
                println!("Row count validation:");
                for t in &tables {
                    let destination = t
                        .destination_rows
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "missing".to_string());
                    println!(
                        "  {} {}.{} -> {}: source {}, destination {}",
                        if t.matches { "OK  " } else { "DIFF" },
                        t.system_id,
                        t.source_table,
                        t.destination_table,
                        t.source_rows,
                        destination
                    );
                }
                println!("\n  {}/{} tables match", tables.len() - mismatched, tables.len());
            }

            if mismatched > 0 {
                return Ok(mysql_bq_sync::error::EXIT_PARTIAL_FAILURE);
            }
            Ok(0)
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config).await?;
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                for endpoint in result.sources.iter().chain(std::iter::once(&result.destination)) {
                    println!(
                        "  {}: {} ({}ms)",
                        endpoint.name,
                        if endpoint.connected { "OK" } else { "FAILED" },
                        endpoint.latency_ms
                    );
                    if let Some(ref err) = endpoint.error {
                        println!("    Error: {}", err);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(SyncError::Config("Health check failed".to_string()));
            }
            Ok(0)
        }
    }
}

fn parse_table_selector(selector: &str) -> Result<(&str, &str), SyncError> {
    match selector.split_once('.') {
        Some((system, table)) if !system.is_empty() && !table.is_empty() => Ok((system, table)),
        _ => Err(SyncError::Config(format!(
            "--table must be <system>.<table>, got '{}'",
            selector
        ))),
    }
}

fn print_summary(result: &RunResult) {
    println!("\nSync {}!", result.status);
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!("  Tables: {}/{}", result.tables_success, result.tables_total);
    println!("  Rows: {}", result.rows_loaded);
    for outcome in result.tables.iter().filter(|t| t.is_partial()) {
        println!(
            "  Partial: {}.{} ({} chunks skipped, {} failed)",
            outcome.system_id, outcome.source_table, outcome.chunks_skipped, outcome.chunks_failed
        );
    }
    if !result.failed_tables.is_empty() {
        println!("  Failed tables: {:?}", result.failed_tables);
    }
    for (source, err) in &result.source_errors {
        println!("  Source {} unavailable: {}", source, err);
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Exit if the run has not wound down within the shutdown timeout.
fn arm_shutdown_deadline(shutdown_timeout: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
        eprintln!("Shutdown timeout of {}s elapsed, exiting", shutdown_timeout);
        std::process::exit(i32::from(EXIT_CANCELLED));
    });
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (cron/orchestrator shutdown).
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to setup {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!(
                "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
                name, shutdown_timeout
            );
            token.cancel();
            arm_shutdown_deadline(shutdown_timeout);
        });
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to setup Ctrl-C handler: {}", e);
            return;
        }
        eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
        token.cancel();
        arm_shutdown_deadline(shutdown_timeout);
    });

    cancel_token
}
