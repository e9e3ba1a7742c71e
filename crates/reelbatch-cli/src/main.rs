//! ReelBatch CLI
//!
//! Runs an external command over many media items as one batch job and
//! inspects the persisted job history.

mod exec;
mod process;
mod report;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use reelbatch_lib::core::batch::{
    BatchEvent, BatchRequest, BatchScheduler, JobHistoryRecord, JobStatus, OperationKind,
    OperationRegistry, Priority,
};
use reelbatch_lib::core::fs::atomic_write_bytes;
use reelbatch_lib::core::settings::{BatchSettings, SettingsManager};

use crate::exec::CommandWork;
use crate::report::ReportFormat;

/// Journal file name inside the config directory
const HISTORY_FILE: &str = "history.jsonl";

#[derive(Parser, Debug)]
#[command(name = "reelbatch", version, about = "Batch operation scheduler for media items")]
struct Cli {
    /// Directory holding settings.json (defaults to the platform config dir)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// History journal path (overrides the settings file)
    #[arg(long, global = true)]
    history: Option<PathBuf>,

    /// Also write daily-rotated logs into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command for every item as one batch job
    Run {
        /// Operation name recorded in history (e.g. scene_detection)
        #[arg(long, short)]
        operation: String,

        /// Command line per item; `{item}` is replaced with the item ID
        #[arg(long, short = 'x')]
        exec: String,

        /// Items processed at the same time
        #[arg(long, short = 'j')]
        max_concurrent: Option<usize>,

        /// Priority against other jobs for the global budget
        #[arg(long, default_value = "medium")]
        priority: Priority,

        /// JSON options recorded with the job
        #[arg(long)]
        options: Option<String>,

        /// Report format
        #[arg(long, value_enum, default_value_t = ReportFormat::Json)]
        report: ReportFormat,

        /// Write the report here instead of stdout; a directory gets `<job-id>.<ext>`
        #[arg(long)]
        output: Option<PathBuf>,

        /// Item IDs, usually file paths
        #[arg(required = true)]
        items: Vec<String>,
    },
    /// List finished jobs, newest first
    History {
        /// Maximum number of jobs to show
        #[arg(long, short = 'n')]
        limit: Option<usize>,

        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Render the report of one finished job
    Report {
        /// Job ID from `history`
        job_id: String,

        /// Report format
        #[arg(long, value_enum, default_value_t = ReportFormat::Json)]
        format: ReportFormat,

        /// Write the report here instead of stdout; a directory gets `<job-id>.<ext>`
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Delete every history record
    ClearHistory,
    /// Aggregate counts over the history
    Stats,
}

/// Installs stderr logging plus an optional daily file layer
fn init_logging(verbose: u8, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let env_filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let _ = std::fs::create_dir_all(dir);
            let appender = tracing_appender::rolling::daily(dir, "reelbatch.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer);

    let _ = tracing::subscriber::set_global_default(subscriber);
    guard
}

fn config_dir(cli: &Cli) -> PathBuf {
    cli.settings.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("reelbatch")
    })
}

/// Settings from disk with the CLI overrides applied
fn load_settings(cli: &Cli) -> BatchSettings {
    let dir = config_dir(cli);
    let settings = SettingsManager::new(dir.clone()).load();

    let history_path = cli
        .history
        .clone()
        .or_else(|| settings.history_path.clone())
        .unwrap_or_else(|| dir.join(HISTORY_FILE));
    settings.with_history_path(history_path)
}

fn history_scheduler(cli: &Cli) -> BatchScheduler {
    BatchScheduler::new(OperationRegistry::default(), load_settings(cli))
}

/// Resolves `--output`; an existing directory gets a file named after the job
fn report_path(output: Option<&Path>, job_id: &str, format: ReportFormat) -> Option<PathBuf> {
    output.map(|path| {
        if path.is_dir() {
            path.join(format!("{job_id}.{}", format.extension()))
        } else {
            path.to_path_buf()
        }
    })
}

fn write_output(text: &str, output: Option<&Path>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            atomic_write_bytes(path, text.as_bytes())
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{text}"),
    }
    Ok(())
}

/// Prints one line per finished item until the job finishes
async fn print_progress(mut rx: broadcast::Receiver<BatchEvent>, job_id: String) {
    loop {
        match rx.recv().await {
            Ok(event) if event.job_id() != job_id => {}
            Ok(BatchEvent::ItemFinished {
                item_id,
                success,
                progress,
                ..
            }) => {
                let mark = if success { "ok" } else { "FAILED" };
                eprintln!(
                    "[{}/{}] {:>5.1}% {} {}",
                    progress.processed,
                    progress.total,
                    progress.percentage * 100.0,
                    mark,
                    item_id
                );
            }
            Ok(BatchEvent::JobCancelling { .. }) => {
                eprintln!("cancelling: waiting for running items to finish");
            }
            Ok(BatchEvent::JobFinished { .. }) => break,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Progress output lagging behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// 0 when every item succeeded, 130 when cancelled, 1 otherwise
fn exit_status(record: &JobHistoryRecord) -> u8 {
    match record.status {
        JobStatus::Completed if record.failure_count == 0 => 0,
        JobStatus::Cancelled => 130,
        _ => 1,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_batch(
    cli: &Cli,
    operation: &str,
    exec: &str,
    max_concurrent: Option<usize>,
    priority: Priority,
    options: Option<&str>,
    format: ReportFormat,
    output: Option<&Path>,
    items: &[String],
) -> anyhow::Result<ExitCode> {
    let kind: OperationKind = operation.parse()?;
    let work = CommandWork::parse(exec)?;
    let options = match options {
        Some(raw) => serde_json::from_str(raw).context("--options is not valid JSON")?,
        None => serde_json::json!({}),
    };

    let registry = OperationRegistry::builder()
        .register(kind.clone(), format!("runs `{}` per item", work.program()), work)
        .build();
    let scheduler = BatchScheduler::new(registry, load_settings(cli));

    let mut request = BatchRequest::new(kind, items.iter().cloned())
        .with_options(options)
        .with_priority(priority);
    if let Some(limit) = max_concurrent {
        request = request.with_max_concurrent(limit);
    }

    let rx = scheduler.subscribe();
    let job_id = scheduler.submit(request)?;
    info!(job_id = %job_id, items = items.len(), "Submitted batch job");
    let printer = tokio::spawn(print_progress(rx, job_id.clone()));

    let finished = scheduler.wait_for_completion(&job_id);
    tokio::pin!(finished);
    let record = tokio::select! {
        record = &mut finished => record?,
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %job_id, "Interrupted, cancelling batch job");
            scheduler.cancel(&job_id);
            finished.await?
        }
    };
    let _ = printer.await;

    eprintln!(
        "{}: {} ok, {} failed, {} skipped in {} ms",
        record.status,
        record.success_count,
        record.failure_count,
        record.skipped_count,
        record.execution_time_ms
    );
    for error in &record.errors {
        eprintln!("  {error}");
    }

    let path = report_path(output, &record.job_id, format);
    write_output(&report::render(&record, format)?, path.as_deref())?;
    Ok(ExitCode::from(exit_status(&record)))
}

fn show_history(cli: &Cli, limit: Option<usize>, json: bool) -> anyhow::Result<()> {
    let records = history_scheduler(cli).list_history(limit);
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("no finished jobs");
        return Ok(());
    }
    for record in &records {
        println!(
            "{}  {:<24} {:<16} {:>4}/{:<4} ok {:<4} failed {:<4} {}",
            record.job_id,
            record.operation.as_str(),
            record.status.as_str(),
            record.total_processed,
            record.total_items,
            record.success_count,
            record.failure_count,
            record.finished_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.log_dir.as_deref());

    match &cli.command {
        Commands::Run {
            operation,
            exec,
            max_concurrent,
            priority,
            options,
            report,
            output,
            items,
        } => {
            run_batch(
                &cli,
                operation,
                exec,
                *max_concurrent,
                *priority,
                options.as_deref(),
                *report,
                output.as_deref(),
                items,
            )
            .await
        }
        Commands::History { limit, json } => {
            show_history(&cli, *limit, *json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Report {
            job_id,
            format,
            output,
        } => {
            let record = history_scheduler(&cli)
                .get_history(job_id)
                .with_context(|| format!("job {job_id} not found in history"))?;
            let path = report_path(output.as_deref(), job_id, *format);
            write_output(&report::render(&record, *format)?, path.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::ClearHistory => {
            let removed = history_scheduler(&cli).clear_history();
            println!("removed {removed} job(s) from history");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stats => {
            let stats = history_scheduler(&cli).get_stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
