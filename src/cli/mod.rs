//! Command-line interface for powerflow.
//!
//! Provides commands for triggering runs, checking status, listing and
//! resuming runs, inspecting and seeding step artifacts, and loading
//! validated records into SQLite.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{Collaborators, RecordSink, SqliteSink};
use crate::config::ResolvedConfig;
use crate::core::{Orchestrator, Pipeline};
use crate::domain::{Lane, Manufacturer, ProductType, Run, RunState, StepKind, TriggerPayload};
use crate::ingest::{InboxConfig, InboxWatcher, PayloadOutcome};
use crate::steps::validate::merged_file;
use crate::steps::ValidatedEntry;
use crate::storage::Storage;

/// powerflow - resumable ETL pipeline for power-converter datasheets
#[derive(Parser, Debug)]
#[command(name = "powerflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline for one manufacturer
    Run {
        /// Manufacturer (recom, traco, xppower)
        #[arg(short, long, default_value = "recom")]
        manufacturer: Manufacturer,

        /// Product types to process (repeatable; default: all)
        #[arg(short = 't', long = "product-type")]
        product_types: Vec<ProductType>,

        /// Start at this step, reading artifacts earlier runs left
        #[arg(long)]
        from: Option<StepKind>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the pipeline for a JSON trigger payload
    Trigger {
        /// Payload file, or '-' to read stdin
        payload: String,

        /// Start at this step
        #[arg(long)]
        from: Option<StepKind>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Watch the inbox folder for trigger payloads
    Watch {
        /// Inbox directory (default: $POWERFLOW_HOME/inbox)
        #[arg(long)]
        inbox: Option<PathBuf>,

        /// Process payloads already in the inbox and exit
        #[arg(long)]
        once: bool,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Resume a run, re-executing the steps that did not produce output
    Resume {
        /// Run ID to resume
        run_id: String,
    },

    /// List artifacts of a step
    Artifacts {
        /// Step name, e.g. recom3_download_pdf
        step: String,

        /// Only files starting with this prefix
        #[arg(short, long, default_value = "")]
        prefix: String,
    },

    /// Print an artifact
    Show {
        /// Step name
        step: String,

        /// File name within the step
        file: String,
    },

    /// Seed a step artifact from a local file
    Import {
        /// Step name
        step: String,

        /// File name within the step
        file: String,

        /// Local file to copy
        source: PathBuf,
    },

    /// Load validated records into a SQLite database
    Load {
        manufacturer: Manufacturer,

        product_type: ProductType,

        /// Database file (created if missing)
        #[arg(long, env = "POWERFLOW_DB")]
        db: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = ResolvedConfig::load()?;

        match self.command {
            Commands::Run {
                manufacturer,
                product_types,
                from,
                json,
            } => {
                let product_types = if product_types.is_empty() {
                    ProductType::ALL.to_vec()
                } else {
                    product_types
                };
                let payload = TriggerPayload::new(manufacturer, product_types);
                run_payload(&config, payload, from, json).await
            }
            Commands::Trigger { payload, from, json } => {
                let payload = read_payload(&payload)?;
                run_payload(&config, payload, from, json).await
            }
            Commands::Watch { inbox, once } => watch(&config, inbox, once).await,
            Commands::Status { run_id, json } => show_status(&config, &run_id, json).await,
            Commands::Runs { limit } => list_runs(&config, limit).await,
            Commands::Resume { run_id } => resume_run(&config, &run_id).await,
            Commands::Artifacts { step, prefix } => list_artifacts(&config, &step, &prefix).await,
            Commands::Show { step, file } => show_artifact(&config, &step, &file).await,
            Commands::Import { step, file, source } => {
                import_artifact(&config, &step, &file, &source).await
            }
            Commands::Load {
                manufacturer,
                product_type,
                db,
            } => load_records(&config, Lane::new(manufacturer, product_type), &db).await,
            Commands::Config => show_config(&config),
        }
    }
}

fn orchestrator(config: &ResolvedConfig) -> Result<Orchestrator> {
    let collaborators = Collaborators::from_config(config)?;
    Ok(Orchestrator::from_config(config, collaborators))
}

fn parse_run_id(run_id: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id).with_context(|| format!("Invalid run ID: {}", run_id))
}

/// Read a payload from a file, or stdin for `-`
fn read_payload(source: &str) -> Result<TriggerPayload> {
    let content = if source == "-" {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("Failed to read payload file: {}", source))?
    };
    TriggerPayload::from_json(&content)
}

async fn run_payload(
    config: &ResolvedConfig,
    payload: TriggerPayload,
    from: Option<StepKind>,
    json: bool,
) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let run = match from {
        Some(step) => orchestrator.run_from(payload, step).await?,
        None => orchestrator.run(payload).await?,
    };
    finish(&run, json)
}

/// Print the outcome of a run; a run with failed steps exits non-zero
fn finish(run: &Run, json: bool) -> Result<()> {
    print_run(run, json)?;
    if let RunState::CompletedWithFailures { failed, .. } = run.state {
        if failed > 0 {
            std::process::exit(1);
        }
    }
    Ok(())
}

fn print_run(run: &Run, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&run.report())?);
        return Ok(());
    }

    println!("Run ID: {}", run.id);
    println!(
        "Payload: {} ({})",
        run.payload.manufacturer,
        run.payload
            .product_types
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("State: {}", state_label(&run.state));
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }

    println!();
    println!(
        "{:<36} {:<16} {:>7} {:>7} {:>7} {:>8}",
        "STEP", "STATUS", "COUNT", "TOTAL", "REUSED", "FAILURES"
    );
    println!("{}", "-".repeat(86));
    for result in &run.results {
        println!(
            "{:<36} {:<16} {:>7} {:>7} {:>7} {:>8}",
            result.report_key(),
            result.status.to_string(),
            result.counts.count,
            result.counts.total,
            result.counts.reused,
            result.counts.failures
        );
        if let Some(ref error) = result.error {
            println!("    {}", error);
        }
    }

    Ok(())
}

fn state_label(state: &RunState) -> String {
    match state {
        RunState::Running => "running".to_string(),
        RunState::Completed => "completed".to_string(),
        RunState::CompletedWithFailures { failed, partial } => {
            format!("completed with failures ({} failed, {} partial)", failed, partial)
        }
    }
}

async fn watch(config: &ResolvedConfig, inbox: Option<PathBuf>, once: bool) -> Result<()> {
    let orchestrator = Arc::new(orchestrator(config)?);
    let inbox = InboxConfig::new(inbox.unwrap_or_else(|| config.inbox_dir()));
    let watcher = InboxWatcher::new(inbox);

    let scanned = watcher.scan_once(&orchestrator).await?;
    eprintln!(
        "Processed {} waiting payload(s): {} ran, {} rejected",
        scanned.total(),
        scanned.ran,
        scanned.rejected
    );
    if once {
        return Ok(());
    }

    let (mut outcomes, handle) = watcher.watch(orchestrator).await?;
    eprintln!("Watching {} (Ctrl-C to stop)", watcher.config().inbox_dir.display());

    loop {
        tokio::select! {
            outcome = outcomes.recv() => match outcome {
                Some(PayloadOutcome::Ran { run_id, moved_to }) => {
                    eprintln!("Run {} finished; payload moved to {}", run_id, moved_to.display());
                }
                Some(PayloadOutcome::Rejected { error, moved_to }) => {
                    eprintln!("Payload rejected ({}); moved to {}", error, moved_to.display());
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.stop().await
}

async fn show_status(config: &ResolvedConfig, run_id: &str, json: bool) -> Result<()> {
    let run = orchestrator(config)?.status(parse_run_id(run_id)?).await?;
    print_run(&run, json)
}

async fn list_runs(config: &ResolvedConfig, limit: usize) -> Result<()> {
    let runs = orchestrator(config)?.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<10} {:<26} {:<20}", "RUN ID", "MAKER", "STARTED", "STATE");
    println!("{}", "-".repeat(100));
    for run in runs {
        println!(
            "{:<38} {:<10} {:<26} {:<20}",
            run.id,
            run.payload.manufacturer.as_str(),
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            state_label(&run.state)
        );
    }

    Ok(())
}

async fn resume_run(config: &ResolvedConfig, run_id: &str) -> Result<()> {
    let run = orchestrator(config)?.resume(parse_run_id(run_id)?).await?;
    finish(&run, false)
}

async fn list_artifacts(config: &ResolvedConfig, step: &str, prefix: &str) -> Result<()> {
    let storage = Storage::local(config.store_dir());
    let files = storage.steps.list(step, prefix).await?;
    if files.is_empty() {
        eprintln!("No artifacts under {}", step);
    }
    for file in files {
        println!("{}", file);
    }
    Ok(())
}

async fn show_artifact(config: &ResolvedConfig, step: &str, file: &str) -> Result<()> {
    let storage = Storage::local(config.store_dir());
    let text = storage.steps.read_text(step, file).await?;
    print!("{}", text);
    Ok(())
}

async fn import_artifact(config: &ResolvedConfig, step: &str, file: &str, source: &Path) -> Result<()> {
    let data = tokio::fs::read(source)
        .await
        .with_context(|| format!("Failed to read {}", source.display()))?;
    let storage = Storage::local(config.store_dir());
    storage.steps.write_bytes(step, file, &data).await?;
    eprintln!("Imported {} bytes as {}/{}", data.len(), step, file);
    Ok(())
}

async fn load_records(config: &ResolvedConfig, lane: Lane, db: &Path) -> Result<()> {
    let step = Pipeline::standard()
        .step_name(StepKind::Validate, lane.manufacturer)
        .context("Pipeline has no validate step")?;
    let storage = Storage::local(config.store_dir());
    let entries: Vec<ValidatedEntry> = storage
        .steps
        .read_json(&step, &merged_file(lane.product_type))
        .await
        .with_context(|| format!("No validated output for {}; run the pipeline first", lane))?;

    let sink = SqliteSink::open(db)?;
    let mut converters = 0;
    for entry in &entries {
        converters += sink.load(&lane, entry)?;
    }

    eprintln!(
        "Loaded {} converters from {} datasheets into {}",
        converters,
        entries.len(),
        db.display()
    );
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config(config: &ResolvedConfig) -> Result<()> {
    let set = |v: &Option<String>| if v.is_some() { "(set)" } else { "(not set)" };
    let settings = &config.pipeline;

    println!("powerflow configuration");
    println!();
    println!(
        "Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:   {}", config.home.display());
    println!("  Store:  {}", config.store_dir().display());
    println!("  Runs:   {}", config.runs_dir().display());
    println!("  Locks:  {}", config.locks_dir().display());
    println!("  Inbox:  {}", config.inbox_dir().display());
    println!();
    println!("Pipeline:");
    println!("  Checkpoint interval:    {}", settings.checkpoint_interval);
    println!("  Download concurrency:   {}", settings.download_concurrency);
    println!("  Extraction concurrency: {}", settings.extraction_concurrency);
    println!("  Lane concurrency:       {}", settings.lane_concurrency);
    println!("  Call timeout:           {}s", settings.call_timeout.as_secs());
    println!("  Retry attempts:         {}", settings.retry.max_attempts);
    println!("  Cache key:              {:?}", settings.cache_key);
    println!("  Failure policy:         {:?}", settings.failure_policy);
    println!();
    println!("Structured extraction:");
    println!("  Base URL: {}", config.openai.base_url);
    println!("  Model:    {}", config.openai.model);
    println!("  API key:  {}", set(&config.openai.api_key));
    println!();
    println!("Text extraction:");
    println!("  Endpoint: {}", config.document_intelligence.endpoint.as_deref().unwrap_or("(not set)"));
    println!("  Key:      {}", set(&config.document_intelligence.key));
    println!();
    println!("Steps:");
    for spec in Pipeline::standard().steps() {
        println!("  {:<16} {}", spec.kind.as_str(), spec.step_name(Manufacturer::Recom));
    }

    Ok(())
}
