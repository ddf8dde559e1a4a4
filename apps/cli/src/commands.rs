//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use compintel_core::{
    Pipeline, ProgressReporter, RunOptions, RunSummary, UnitReport, UnitStatus, select_competitors,
};
use compintel_llm::{CostLedger, LlmRequest, Prompt, Router, build_provider};
use compintel_shared::{
    AppConfig, RetryPolicy, Stage, UnitKey, config_file_path, init_config, load_config,
    resolve_api_key,
};
use compintel_storage::{CheckpointStore, CostGroup, Storage};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// CompIntel: resumable, budget-bounded competitor research.
#[derive(Parser)]
#[command(
    name = "compintel",
    version,
    about = "Collect and reconcile competitor claims under a checkpointed, cost-governed pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Project config file (defaults to ./compintel.toml).
    #[arg(long, global = true, env = "COMPINTEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Validate the config and create the checkpoint and research directories.
    Init,

    /// Research every competitor (or one), resuming completed work.
    Run {
        /// Restrict the run to one competitor (name or alias).
        #[arg(short, long)]
        competitor: Option<String>,

        /// Report planned operations without fetching, dispatching, or writing.
        #[arg(long)]
        dry_run: bool,

        /// Re-execute complete competitors and overwrite their documents.
        #[arg(long)]
        force: bool,
    },

    /// Inspect or clear stage checkpoints.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Show recorded provider spend.
    Cost {
        /// Restrict to one run (defaults to every run).
        #[arg(long)]
        run: Option<String>,
    },

    /// Send a one-word prompt to every configured provider whose key is set.
    TestLlm,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Checkpoint subcommands.
#[derive(Subcommand)]
pub(crate) enum CheckpointAction {
    /// List checkpoints, optionally for one competitor.
    List {
        #[arg(short, long)]
        competitor: Option<String>,
    },
    /// Print one checkpoint record as JSON.
    Show {
        competitor: String,

        #[arg(long, default_value = "research")]
        stage: Stage,
    },
    /// Remove checkpoints for one competitor, or all of them.
    Clear {
        competitor: Option<String>,

        /// Required to clear every competitor.
        #[arg(long, conflicts_with = "competitor")]
        all: bool,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "compintel=info",
        1 => "compintel=debug",
        _ => "compintel=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Init => cmd_init(config_path).await,
        Command::Run {
            competitor,
            dry_run,
            force,
        } => {
            let options = RunOptions {
                competitor,
                dry_run,
                force,
            };
            cmd_run(config_path, &options).await
        }
        Command::Checkpoint { action } => match action {
            CheckpointAction::List { competitor } => {
                cmd_checkpoint_list(config_path, competitor.as_deref()).await
            }
            CheckpointAction::Show { competitor, stage } => {
                cmd_checkpoint_show(config_path, &competitor, stage).await
            }
            CheckpointAction::Clear { competitor, all } => {
                cmd_checkpoint_clear(config_path, competitor.as_deref(), all).await
            }
        },
        Command::Cost { run } => cmd_cost(config_path, run.as_deref()).await,
        Command::TestLlm => cmd_test_llm(config_path).await,
        Command::Config { action } => match action {
            ConfigAction::Init { force } => cmd_config_init(config_path, force).await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

fn load_validated(config_path: Option<&Path>) -> Result<AppConfig> {
    let config = load_config(config_path)?;
    config.validate()?;
    Ok(config)
}

/// Checkpoint key for a competitor name, alias, or slug.
fn resolve_key(config: &AppConfig, competitor: &str) -> UnitKey {
    config
        .competitor(competitor)
        .map(|c| UnitKey::from_name(&c.name))
        .unwrap_or_else(|| UnitKey::from_name(competitor))
}

// ---------------------------------------------------------------------------
// init / run
// ---------------------------------------------------------------------------

async fn cmd_init(config_path: Option<&Path>) -> Result<()> {
    let config = load_validated(config_path)?;

    let checkpoints = config.paths.checkpoint_path();
    let research = config.paths.research_path();
    std::fs::create_dir_all(&checkpoints)
        .wrap_err_with(|| format!("creating {}", checkpoints.display()))?;
    for competitor in &config.competitors {
        let dir = research.join(UnitKey::from_name(&competitor.name).as_str());
        std::fs::create_dir_all(&dir).wrap_err_with(|| format!("creating {}", dir.display()))?;
    }
    Storage::open(&config.paths.database_path()).await?;

    info!(competitors = config.competitors.len(), "project initialized");
    println!();
    println!("  Project:      {}", config.project.name);
    println!("  Competitors:  {}", config.competitors.len());
    println!("  Checkpoints:  {}", checkpoints.display());
    println!("  Research:     {}", research.display());
    println!("  Database:     {}", config.paths.database_path().display());
    println!();
    Ok(())
}

async fn cmd_run(config_path: Option<&Path>, options: &RunOptions) -> Result<()> {
    let config = load_validated(config_path)?;
    let competitors = select_competitors(&config, options.competitor.as_deref())?;

    // A dry run opens nothing it could write to.
    let index = if options.dry_run {
        None
    } else {
        let storage = Arc::new(Storage::open(&config.paths.database_path()).await?);
        let run_id = Uuid::now_v7().to_string();
        storage.insert_run(&run_id, false).await?;
        Some((storage, run_id))
    };

    let mut ledger = CostLedger::from_config(&config.budget);
    if let Some((storage, run_id)) = &index {
        ledger = ledger.with_storage(storage.clone(), run_id.clone());
    }
    let router = Router::from_config(&config, Arc::new(ledger));
    if !options.dry_run && router.candidates(&config.pipeline.extraction_task).is_empty() {
        warn!(
            task = config.pipeline.extraction_task.as_str(),
            "no usable provider for the extraction task; extraction will fail"
        );
    }

    let pipeline = Pipeline::from_config(&config, Arc::new(router), index.clone())?;
    let progress = Arc::new(CliProgress::new(competitors.len()));

    info!(
        competitors = competitors.len(),
        dry_run = options.dry_run,
        force = options.force,
        "starting research run"
    );
    let outcome = pipeline.run(&competitors, options, progress).await;

    let summary = match outcome {
        Ok(summary) => summary,
        Err(e) => {
            if let Some((storage, run_id)) = &index {
                storage.finish_run(run_id, "failed", None).await?;
            }
            return Err(e.into());
        }
    };

    if let Some((storage, run_id)) = &index {
        let json = serde_json::to_string(&summary)?;
        storage
            .finish_run(run_id, summary.run_status(), Some(&json))
            .await?;
        println!();
        println!("  Run: {run_id}");
    }
    print_summary(&summary);

    if summary.is_success() {
        Ok(())
    } else if summary.budget_halted {
        Err(eyre!(
            "budget halted the run at ${:.4}; rerun with a larger budget to resume",
            summary.ledger.total_usd
        ))
    } else {
        Err(eyre!(
            "{} competitor(s) failed; rerun to resume from their checkpoints",
            summary.failed()
        ))
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "  {:<28} {:<10} {:>7} {:>10} {:>6}",
        "Competitor", "Status", "Claims", "Conflicts", "Gaps"
    );
    for unit in &summary.units {
        let status = match &unit.status {
            UnitStatus::Completed { .. } => "complete",
            UnitStatus::Resumed => "resumed",
            UnitStatus::Planned { would_resume: true, .. } => "resume",
            UnitStatus::Planned { .. } => "execute",
            UnitStatus::Failed { budget: true, .. } => "budget",
            UnitStatus::Failed { .. } => "failed",
            UnitStatus::Skipped => "skipped",
        };
        println!(
            "  {:<28} {:<10} {:>7} {:>10} {:>6}",
            unit.competitor, status, unit.claims, unit.conflicts, unit.coverage_gaps
        );
        match &unit.status {
            UnitStatus::Planned { operations, .. } => {
                for op in operations {
                    println!("      - {op}");
                }
            }
            UnitStatus::Failed { error, .. } => println!("      ! {error}"),
            _ => {}
        }
    }

    let ledger = &summary.ledger;
    println!();
    println!(
        "  Spend:  ${:.4} over {} call(s), {:.1}% of budget",
        ledger.total_usd, ledger.calls, ledger.budget_pct_used
    );
    println!(
        "  Tokens: {} in / {} out",
        ledger.input_tokens, ledger.output_tokens
    );
    if !ledger.alerts.is_empty() {
        let alerts: Vec<String> = ledger.alerts.iter().map(|pct| format!("{pct}%")).collect();
        println!("  Alerts: {}", alerts.join(", "));
    }
    println!("  Time:   {:.1}s", summary.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn unit_started(&self, competitor: &str, current: usize, total: usize) {
        self.bar
            .set_message(format!("Researching {competitor} ({current}/{total})"));
    }

    fn unit_finished(&self, report: &UnitReport) {
        self.bar.inc(1);
        if let UnitStatus::Failed { error, .. } = &report.status {
            self.bar
                .println(format!("  ✗ {}: {error}", report.competitor));
        }
    }

    fn done(&self, _summary: &RunSummary) {
        self.bar.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// checkpoint
// ---------------------------------------------------------------------------

fn checkpoint_store(config: &AppConfig) -> CheckpointStore {
    CheckpointStore::new(config.paths.checkpoint_path())
}

async fn cmd_checkpoint_list(config_path: Option<&Path>, competitor: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let key = competitor.map(|c| resolve_key(&config, c));
    let records = checkpoint_store(&config).list(key.as_ref()).await?;

    if records.is_empty() {
        println!("No checkpoints.");
        return Ok(());
    }
    println!(
        "  {:<28} {:<10} {:<12} {:>8} {:>8}  {}",
        "Key", "Stage", "Status", "Version", "Attempts", "Updated"
    );
    for record in &records {
        println!(
            "  {:<28} {:<10} {:<12} {:>8} {:>8}  {}",
            record.key.as_str(),
            record.stage.as_str(),
            record.status.as_str(),
            record.version,
            record.attempts,
            record.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_checkpoint_show(config_path: Option<&Path>, competitor: &str, stage: Stage) -> Result<()> {
    let config = load_config(config_path)?;
    let key = resolve_key(&config, competitor);
    let record = checkpoint_store(&config)
        .load(&key, stage)
        .await?
        .ok_or_else(|| eyre!("no {stage} checkpoint for '{key}'"))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn cmd_checkpoint_clear(
    config_path: Option<&Path>,
    competitor: Option<&str>,
    all: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let key = match (competitor, all) {
        (Some(c), _) => Some(resolve_key(&config, c)),
        (None, true) => None,
        (None, false) => return Err(eyre!("name a competitor or pass --all")),
    };
    let removed = checkpoint_store(&config).clear(key.as_ref()).await?;
    println!("Removed {removed} checkpoint(s).");
    Ok(())
}

// ---------------------------------------------------------------------------
// cost
// ---------------------------------------------------------------------------

async fn cmd_cost(config_path: Option<&Path>, run: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let storage = Storage::open_readonly(&config.paths.database_path()).await?;

    if let Some(run_id) = run {
        let record = storage
            .get_run(run_id)
            .await?
            .ok_or_else(|| eyre!("no run '{run_id}'"))?;
        println!();
        println!("  Run:      {}", record.id);
        println!("  Status:   {}", record.status);
        println!("  Started:  {}", record.started_at.format("%Y-%m-%d %H:%M:%S"));
        if let Some(finished) = record.finished_at {
            println!("  Finished: {}", finished.format("%Y-%m-%d %H:%M:%S"));
        }
    }

    let summary = storage.cost_summary(run).await?;
    let max_usd = config.budget.max_usd;
    println!();
    println!("  Total:  ${:.4} over {} call(s)", summary.total_usd, summary.calls);
    if max_usd > 0.0 && run.is_some() {
        println!(
            "  Budget: {:.1}% of ${max_usd:.2}",
            summary.total_usd / max_usd * 100.0
        );
    }
    print_groups("Provider", &summary.by_provider);
    print_groups("Task", &summary.by_task);

    if let Some(run_id) = run {
        let alerts = storage.list_budget_alerts(run_id).await?;
        for (pct, spent) in alerts {
            println!("  Alert:  {pct}% threshold crossed at ${spent:.4}");
        }
        let sources = storage.source_status_counts(run_id).await?;
        if !sources.is_empty() {
            let parts: Vec<String> = sources.iter().map(|(s, n)| format!("{s}={n}")).collect();
            println!("  Sources: {}", parts.join(", "));
        }
    }
    println!();
    Ok(())
}

fn print_groups(label: &str, groups: &[CostGroup]) {
    if groups.is_empty() {
        return;
    }
    println!();
    println!(
        "  {:<24} {:>6} {:>10} {:>10} {:>10}",
        label, "Calls", "In", "Out", "USD"
    );
    for group in groups {
        println!(
            "  {:<24} {:>6} {:>10} {:>10} {:>10.4}",
            group.key, group.calls, group.input_tokens, group.output_tokens, group.cost_usd
        );
    }
}

// ---------------------------------------------------------------------------
// test-llm
// ---------------------------------------------------------------------------

async fn cmd_test_llm(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let ledger = Arc::new(CostLedger::from_config(&config.budget));
    let prompt = Prompt::new("Reply with the single word: ok");

    let mut tested = 0;
    let mut failures = 0;
    for (task, routing) in &config.routing {
        for candidate in &routing.candidates {
            let label = format!("{task}: {} / {}", candidate.provider, candidate.model);
            if resolve_api_key(&candidate.api_key_env).is_err() {
                println!("  - {label}  skipped ({} not set)", candidate.api_key_env);
                continue;
            }
            tested += 1;
            let router = build_provider(candidate).map(|provider| {
                Router::new(ledger.clone(), RetryPolicy::none()).with_route(task.clone(), vec![provider])
            });
            let result = match router {
                Ok(router) => router.dispatch(task, &LlmRequest::Text(prompt.clone())).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(response) => println!(
                    "  ✓ {label}  \"{}\"  {} in / {} out  ${:.6}",
                    response.content.trim(),
                    response.input_tokens,
                    response.output_tokens,
                    response.cost_usd
                ),
                Err(e) => {
                    failures += 1;
                    println!("  ✗ {label}  {e}");
                }
            }
        }
    }

    println!();
    println!("  Spend: ${:.6}", ledger.total_usd().await);
    if tested == 0 {
        return Err(eyre!("no provider has its API key set"));
    }
    if failures > 0 {
        return Err(eyre!("{failures} of {tested} provider(s) failed"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let path = init_config(&config_file_path(config_path), force)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config: AppConfig = load_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
