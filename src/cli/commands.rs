//! CLI command definitions for lora-forge.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::dataset::FsDatasetPreparer;
use crate::generator::ConfigHeader;
use crate::pipeline::{
    BatchRequest, DatasetInput, ExecutionStrategy, PipelineConfig, PipelineMode, PipelineRequest,
    PipelineResult, PipelineRouter, PipelineServices, PipelineStatus, SingleRequest,
    TerminalConfirmer, VariationRequest, VariationSpec,
};
use crate::presets::{PresetManager, PresetProvider};
use crate::tracker::{JobTracker, MemoryJobTracker, SqliteJobTracker};
use crate::training::TrainingLauncher;

/// Dataset preparation and LoRA training configuration orchestrator.
#[derive(Parser)]
#[command(name = "lora-forge")]
#[command(about = "Prepare datasets and generate LoRA training configurations")]
#[command(version)]
#[command(
    long_about = "lora-forge prepares image/caption datasets, generates training configurations from presets, and drives the external trainer.\n\nExample usage:\n  lora-forge single ./raw/faces --preset sdxl\n  lora-forge variations --dataset faces --preset sdxl --vary learning_rate=1e-4,5e-5 --vary seed=1,2"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Workspace root (overrides LORA_FORGE_BASE_PATH).
    #[arg(short = 'b', long, global = true)]
    pub base_path: Option<PathBuf>,

    /// Preset directory (overrides LORA_FORGE_PRESETS_DIR).
    #[arg(long, global = true)]
    pub presets_dir: Option<PathBuf>,

    /// SQLite URL for the job tracker (overrides LORA_FORGE_DATABASE_URL).
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Delete existing datasets without asking.
    #[arg(short = 'y', long, global = true)]
    pub yes: bool,

    /// Print per-dataset details.
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Output JSON instead of a summary.
    #[arg(short = 'j', long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Prepare one dataset and generate its configurations.
    Single(SingleArgs),

    /// Prepare a list of datasets from a YAML or JSON file.
    Batch(BatchArgs),

    /// Generate a parameter sweep for a prepared dataset.
    #[command(alias = "variation")]
    Variations(VariationArgs),

    /// Show what a request file would do without running it.
    Plan(PlanArgs),

    /// Launch training for a generated configuration.
    Train(TrainArgs),

    /// List available presets.
    Presets,

    /// List recorded jobs.
    Jobs,
}

/// Arguments for `lora-forge single`.
#[derive(Parser, Debug)]
pub struct SingleArgs {
    /// Directory holding the raw images and captions.
    pub source: PathBuf,

    /// Dataset name (defaults to the source directory name).
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Repeats per image.
    #[arg(short = 'r', long, default_value = "30")]
    pub repeats: u32,

    /// Class token.
    #[arg(short = 'c', long, default_value = "person")]
    pub class_name: String,

    /// Generate only this preset (default: every preset).
    #[arg(short = 'p', long)]
    pub preset: Option<String>,

    /// Prepare the dataset without generating configurations.
    #[arg(long)]
    pub no_configs: bool,
}

/// Arguments for `lora-forge batch`.
#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// YAML or JSON file with a list of paths or dataset entries.
    pub file: PathBuf,

    /// Process datasets over a worker pool.
    #[arg(long, conflicts_with = "sequential")]
    pub parallel: bool,

    /// Process datasets one after another.
    #[arg(long)]
    pub sequential: bool,

    /// Worker pool size (overrides LORA_FORGE_MAX_WORKERS).
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    /// Stop at the first failing dataset (sequential only).
    #[arg(long)]
    pub stop_on_error: bool,

    /// Preset for datasets that do not name one.
    #[arg(short = 'p', long)]
    pub preset: Option<String>,

    /// Prepare datasets without generating configurations.
    #[arg(long)]
    pub no_configs: bool,
}

/// Arguments for `lora-forge variations`.
#[derive(Parser, Debug)]
pub struct VariationArgs {
    /// Prepared dataset name.
    #[arg(short = 'd', long)]
    pub dataset: String,

    /// Base preset.
    #[arg(short = 'p', long)]
    pub preset: String,

    /// YAML or JSON map of parameter to list of values.
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Parameter sweep as key=v1,v2 (repeatable, applied after --file).
    #[arg(long = "vary", value_name = "KEY=V1,V2")]
    pub vary: Vec<String>,

    /// Member name template; supports {dataset}, {preset} and {n}.
    #[arg(short = 't', long)]
    pub template: Option<String>,
}

/// Arguments for `lora-forge plan`.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// YAML or JSON request with a `mode` field.
    pub file: PathBuf,
}

/// Arguments for `lora-forge train`.
#[derive(Parser, Debug)]
pub struct TrainArgs {
    /// Generated configuration file.
    pub config: PathBuf,

    /// Job identifier (defaults to the one recorded in the file).
    #[arg(long)]
    pub job_id: Option<String>,

    /// Training command (overrides LORA_FORGE_TRAINING_COMMAND).
    #[arg(long)]
    pub command: Option<String>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli)?;

    match cli.command {
        Commands::Single(ref args) => run_single_command(&cli, config, args).await,
        Commands::Batch(ref args) => run_batch_command(&cli, config, args).await,
        Commands::Variations(ref args) => run_variations_command(&cli, config, args).await,
        Commands::Plan(ref args) => run_plan_command(&cli, config, args).await,
        Commands::Train(ref args) => run_train_command(&cli, config, args).await,
        Commands::Presets => run_presets_command(&cli, config),
        Commands::Jobs => run_jobs_command(&cli, config).await,
    }
}

fn build_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env()?;

    if let Some(base) = &cli.base_path {
        config = config.with_base_path(base);
    }
    if let Some(dir) = &cli.presets_dir {
        config = config.with_presets_dir(dir);
    }
    if let Some(url) = &cli.database_url {
        config = config.with_database_url(url);
    }
    if cli.yes {
        config = config.with_auto_clean(true);
    }
    if cli.verbose {
        config = config.with_verbose(true);
    }

    config.validate()?;
    Ok(config)
}

fn load_presets(config: &PipelineConfig) -> anyhow::Result<Arc<PresetManager>> {
    let dir = config.presets_dir();
    let presets = PresetManager::from_directory(&dir)
        .with_context(|| format!("Failed to load presets from {}", dir.display()))?;
    if presets.is_empty() {
        warn!(dir = %dir.display(), "No presets found");
    } else {
        info!(count = presets.len(), dir = %dir.display(), "Loaded presets");
    }
    Ok(Arc::new(presets))
}

async fn build_tracker(config: &PipelineConfig) -> anyhow::Result<Arc<dyn JobTracker>> {
    match &config.database_url {
        Some(url) => {
            let tracker = SqliteJobTracker::connect(url)
                .await
                .with_context(|| format!("Failed to open job database {}", url))?;
            Ok(Arc::new(tracker))
        }
        None => Ok(Arc::new(MemoryJobTracker::new())),
    }
}

async fn build_router(config: PipelineConfig) -> anyhow::Result<PipelineRouter> {
    let presets = load_presets(&config)?;
    let tracker = build_tracker(&config).await?;

    let mut services =
        PipelineServices::new(config, presets, tracker, Arc::new(FsDatasetPreparer::new()));
    if std::io::stdin().is_terminal() {
        services = services.with_confirmer(Arc::new(TerminalConfirmer));
    }
    Ok(PipelineRouter::new(services))
}

/// Reads a YAML or JSON file; `.json` selects JSON, anything else YAML.
fn load_structured<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("Invalid YAML in {}", path.display()))
    }
}

/// Parses a value as a TOML literal, falling back to a plain string.
fn parse_value(raw: &str) -> toml::Value {
    let raw = raw.trim();
    toml::from_str::<toml::Table>(&format!("v = {}", raw))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

/// Parses `key=v1,v2,...` into a sweep entry.
fn parse_vary(raw: &str) -> anyhow::Result<(String, Vec<toml::Value>)> {
    let (key, values) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Expected KEY=V1,V2 but got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow::anyhow!("Missing parameter name in '{}'", raw));
    }
    let values: Vec<toml::Value> = values
        .split(',')
        .filter(|v| !v.trim().is_empty())
        .map(parse_value)
        .collect();
    Ok((key.to_string(), values))
}

fn report(cli: &Cli, result: &PipelineResult) -> anyhow::Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        if cli.verbose {
            for (name, item) in &result.results {
                let marker = if item.success { "ok" } else { "FAILED" };
                println!("  [{}] {} ({} config(s))", marker, name, item.configs.len());
                if let Some(error) = &item.error {
                    println!("      error: {}", error);
                }
                for warning in &item.warnings {
                    println!("      warning: {}", warning);
                }
                for config in &item.configs {
                    println!("      {}", config.display());
                }
            }
        }
        println!("{}", result.summary());
    }

    if result.status == PipelineStatus::Failed {
        return Err(anyhow::anyhow!("{} pipeline failed", result.mode));
    }
    Ok(())
}

async fn run_single_command(
    cli: &Cli,
    config: PipelineConfig,
    args: &SingleArgs,
) -> anyhow::Result<()> {
    let mut request = SingleRequest::new(&args.source)
        .with_repeats(args.repeats)
        .with_class_name(&args.class_name)
        .with_generate_configs(!args.no_configs);
    if let Some(name) = &args.name {
        request = request.with_dataset_name(name);
    }
    if let Some(preset) = &args.preset {
        request = request.with_preset(preset);
    }

    let router = build_router(config).await?;
    let result = router.execute(request.into()).await;
    report(cli, &result)
}

async fn run_batch_command(
    cli: &Cli,
    mut config: PipelineConfig,
    args: &BatchArgs,
) -> anyhow::Result<()> {
    if let Some(workers) = args.max_workers {
        config = config.with_max_workers(workers);
        config.validate()?;
    }

    let datasets: Vec<DatasetInput> = load_structured(&args.file)?;
    let mut request = BatchRequest::new(datasets)
        .with_continue_on_error(!args.stop_on_error)
        .with_generate_configs(!args.no_configs);
    if args.parallel {
        request = request.with_strategy(ExecutionStrategy::Parallel);
    } else if args.sequential {
        request = request.with_strategy(ExecutionStrategy::Sequential);
    }
    if let Some(preset) = &args.preset {
        request = request.with_preset(preset);
    }

    let router = build_router(config).await?;
    let result = router.execute(request.into()).await;
    report(cli, &result)
}

async fn run_variations_command(
    cli: &Cli,
    config: PipelineConfig,
    args: &VariationArgs,
) -> anyhow::Result<()> {
    let mut spec: VariationSpec = match &args.file {
        Some(path) => load_structured(path)?,
        None => VariationSpec::new(),
    };
    for raw in &args.vary {
        let (key, values) = parse_vary(raw)?;
        spec.insert(key, values);
    }

    let mut request = VariationRequest::new(&args.dataset, &args.preset, spec);
    if let Some(template) = &args.template {
        request = request.with_naming_template(template);
    }

    let router = build_router(config).await?;
    let result = router.execute(request.into()).await;
    report(cli, &result)
}

async fn run_plan_command(
    cli: &Cli,
    config: PipelineConfig,
    args: &PlanArgs,
) -> anyhow::Result<()> {
    let request: PipelineRequest = load_structured(&args.file)?;
    let router = build_router(config).await?;
    let plan = router.plan(&request)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!("{}", plan.description);
        println!("  mode: {}", plan.mode);
        println!("  datasets: {}", plan.datasets.join(", "));
        println!("  presets: {}", plan.presets.join(", "));
        println!("  jobs: {}", plan.total_jobs);
    }
    Ok(())
}

async fn run_train_command(
    cli: &Cli,
    config: PipelineConfig,
    args: &TrainArgs,
) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&args.config)
        .with_context(|| format!("Failed to read {}", args.config.display()))?;
    let header = ConfigHeader::parse(&content);

    let job_id = match (&args.job_id, &header) {
        (Some(job_id), _) => job_id.clone(),
        (None, Some(header)) => header.job_id.clone(),
        (None, None) => {
            return Err(anyhow::anyhow!(
                "{} has no job header; pass --job-id",
                args.config.display()
            ))
        }
    };

    let tracker = build_tracker(&config).await?;
    if tracker.get_job(&job_id).await?.is_none() {
        let (mode, dataset, preset) = match &header {
            Some(h) => (h.mode, h.dataset.clone(), h.preset.clone()),
            None => (PipelineMode::Single, "unknown".to_string(), "unknown".to_string()),
        };
        info!(job_id = %job_id, "Registering job for external configuration");
        tracker
            .create_execution(&job_id, mode, &dataset, &preset)
            .await?;
    }

    let command = args
        .command
        .clone()
        .unwrap_or_else(|| config.training_command.clone());
    let launcher = TrainingLauncher::new(command, tracker);
    let show_progress = !cli.json;

    let outcome = launcher
        .launch(&job_id, &args.config, |snapshot| {
            if show_progress {
                println!("{}", snapshot.render());
            }
        })
        .await?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "job_id": outcome.job_id,
                "exit_code": outcome.exit_code,
                "progress": outcome.progress,
                "duration_secs": outcome.duration.as_secs_f64(),
            }))?
        );
    }

    if outcome.success() {
        println!("Training finished for job {}", outcome.job_id);
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "training process exited with code {}",
            outcome.exit_code
        ))
    }
}

fn run_presets_command(cli: &Cli, config: PipelineConfig) -> anyhow::Result<()> {
    let presets = load_presets(&config)?.get_presets();

    if cli.json {
        let listing: Vec<_> = presets
            .values()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "description": p.description,
                    "model_paths": p.model_paths,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if presets.is_empty() {
        println!("No presets in {}", config.presets_dir().display());
    }
    for preset in presets.values() {
        if preset.description.is_empty() {
            println!("{}", preset.name);
        } else {
            println!("{} - {}", preset.name, preset.description);
        }
    }
    Ok(())
}

async fn run_jobs_command(cli: &Cli, config: PipelineConfig) -> anyhow::Result<()> {
    if config.database_url.is_none() {
        warn!("No job database configured; set --database-url to list persisted jobs");
    }
    let tracker = build_tracker(&config).await?;
    let jobs = tracker.list_jobs().await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    for job in &jobs {
        println!(
            "{}  {:<18}  {:<10}  {}  {}{}",
            job.job_id,
            job.state.as_str(),
            job.mode.as_str(),
            job.dataset_name,
            job.preset_name,
            job.error_message
                .as_deref()
                .map(|e| format!("  ({})", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}
