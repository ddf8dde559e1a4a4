//! Batch `run` pipeline: research every selected competitor under the stage
//! execution contract, with bounded concurrency and a shared cost ledger.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use compintel_crawler::{HttpFetcher, RetryingSearch, SearchProvider, SearxSearch};
use compintel_llm::{LedgerSummary, Router};
use compintel_shared::{
    AppConfig, CompIntelError, CompetitorConfig, Result, RetryPolicy, UnitKey,
};
use compintel_storage::{CheckpointStore, Storage};

use crate::reconcile::Reconciler;
use crate::research::{ResearchContext, ResearchStage};
use crate::stage::{StageOutcome, StageRunner};

/// Flags that change how a run behaves.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict the run to one competitor (name, alias, or slug).
    pub competitor: Option<String>,
    /// Report planned operations; fetch, dispatch, and write nothing.
    pub dry_run: bool,
    /// Re-execute complete units and overwrite their research documents.
    pub force: bool,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    Completed { attempts: u32 },
    Resumed,
    Planned {
        would_resume: bool,
        operations: Vec<String>,
    },
    Failed { error: String, budget: bool },
    /// Not started because the budget halted earlier in the run.
    Skipped,
}

/// What happened to one competitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub competitor: String,
    pub key: UnitKey,
    #[serde(flatten)]
    pub status: UnitStatus,
    pub claims: usize,
    pub conflicts: usize,
    pub coverage_gaps: usize,
}

impl UnitReport {
    fn new(competitor: &CompetitorConfig, status: UnitStatus) -> Self {
        Self {
            competitor: competitor.name.clone(),
            key: UnitKey::from_name(&competitor.name),
            status,
            claims: 0,
            conflicts: 0,
            coverage_gaps: 0,
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub units: Vec<UnitReport>,
    pub budget_halted: bool,
    pub dry_run: bool,
    pub ledger: LedgerSummary,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunSummary {
    fn count(&self, pred: impl Fn(&UnitStatus) -> bool) -> usize {
        self.units.iter().filter(|u| pred(&u.status)).count()
    }

    pub fn completed(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::Completed { .. }))
    }

    pub fn resumed(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::Resumed))
    }

    pub fn planned(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::Planned { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::Skipped))
    }

    /// Every unit finished and the budget never halted the run.
    pub fn is_success(&self) -> bool {
        !self.budget_halted && self.failed() == 0 && self.skipped() == 0
    }

    /// Status string stored on the run record.
    pub fn run_status(&self) -> &'static str {
        if self.budget_halted {
            "budget_halted"
        } else if self.failed() > 0 {
            "failed"
        } else {
            "complete"
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a competitor's research starts.
    fn unit_started(&self, competitor: &str, current: usize, total: usize);
    /// Called when a competitor's research ends, however it ended.
    fn unit_finished(&self, report: &UnitReport);
    /// Called when the pipeline completes.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn unit_started(&self, _competitor: &str, _current: usize, _total: usize) {}
    fn unit_finished(&self, _report: &UnitReport) {}
    fn done(&self, _summary: &RunSummary) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Competitors a run covers: all of them, or the one matching `only`.
pub fn select_competitors(config: &AppConfig, only: Option<&str>) -> Result<Vec<CompetitorConfig>> {
    match only {
        None => Ok(config.competitors.clone()),
        Some(name) => config
            .competitor(name)
            .cloned()
            .map(|c| vec![c])
            .ok_or_else(|| CompIntelError::validation(format!("unknown competitor '{name}'"))),
    }
}

pub struct Pipeline {
    ctx: ResearchContext,
    store: Arc<CheckpointStore>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl Pipeline {
    pub fn new(ctx: ResearchContext, store: Arc<CheckpointStore>, retry: RetryPolicy) -> Self {
        let concurrency = ctx.pipeline.concurrency.max(1);
        Self {
            ctx,
            store,
            retry,
            concurrency,
        }
    }

    /// Wire the production collaborators from configuration.
    ///
    /// `index` is the database and run id that sources are recorded under.
    pub fn from_config(
        config: &AppConfig,
        router: Arc<Router>,
        index: Option<(Arc<Storage>, String)>,
    ) -> Result<Self> {
        let retry = RetryPolicy::from(&config.retry);
        let fetcher = HttpFetcher::new(&config.fetch, retry)?;
        let search = match config.search.endpoint.as_deref() {
            Some(endpoint) => {
                let searx = SearxSearch::new(endpoint, &config.fetch)?;
                Some(Arc::new(RetryingSearch::new(searx, retry)) as Arc<dyn SearchProvider>)
            }
            None => None,
        };
        let ctx = ResearchContext {
            fetcher: Arc::new(fetcher),
            search,
            router,
            reconciler: Arc::new(Reconciler::default()),
            pipeline: config.pipeline.clone(),
            search_config: config.search.clone(),
            research_dir: config.paths.research_path(),
            force: false,
            storage: index,
        };
        let store = Arc::new(CheckpointStore::new(config.paths.checkpoint_path()));
        Ok(Self::new(ctx, store, retry))
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Research `competitors`, at most `concurrency` at a time.
    ///
    /// Per-unit failures are reported, not returned: one competitor failing
    /// never stops the others. Once the budget halts, units that have not
    /// started are skipped; units already running finish their checkpoint
    /// writes.
    #[instrument(skip_all, fields(units = competitors.len(), dry_run = options.dry_run, force = options.force))]
    pub async fn run(
        &self,
        competitors: &[CompetitorConfig],
        options: &RunOptions,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<RunSummary> {
        let start = Instant::now();
        let ledger = self.ctx.router.ledger().clone();
        let runner = StageRunner::new(self.store.clone(), self.retry)
            .dry_run(options.dry_run)
            .force(options.force);
        let ctx = ResearchContext {
            force: options.force,
            ..self.ctx.clone()
        };

        progress.phase(if options.dry_run { "Planning research" } else { "Researching competitors" });
        info!(units = competitors.len(), concurrency = self.concurrency, "starting run");

        let total = competitors.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for (index, competitor) in competitors.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let runner = runner.clone();
            let ctx = ctx.clone();
            let ledger = ledger.clone();
            let progress = progress.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, UnitReport::new(&competitor, UnitStatus::Skipped));
                };
                if ledger.is_halted() {
                    warn!(competitor = %competitor.name, "budget halted; not starting");
                    let report = UnitReport::new(&competitor, UnitStatus::Skipped);
                    progress.unit_finished(&report);
                    return (index, report);
                }

                progress.unit_started(&competitor.name, index + 1, total);
                let key = UnitKey::from_name(&competitor.name);
                let stage = ResearchStage::new(competitor.clone(), ctx);
                let report = match runner.run(&key, &stage).await {
                    Ok(outcome) => unit_report(&competitor, outcome),
                    Err(e) => {
                        error!(competitor = %competitor.name, error = %e, "research failed");
                        UnitReport::new(
                            &competitor,
                            UnitStatus::Failed {
                                error: e.to_string(),
                                budget: e.is_budget(),
                            },
                        )
                    }
                };
                progress.unit_finished(&report);
                (index, report)
            });
        }

        let mut indexed = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(pair) => indexed.push(pair),
                Err(e) => {
                    return Err(CompIntelError::validation(format!("research worker aborted: {e}")));
                }
            }
        }
        indexed.sort_by_key(|(index, _)| *index);
        let units: Vec<UnitReport> = indexed.into_iter().map(|(_, report)| report).collect();

        let budget_halted = ledger.is_halted()
            || units
                .iter()
                .any(|u| matches!(u.status, UnitStatus::Failed { budget: true, .. }));
        let summary = RunSummary {
            units,
            budget_halted,
            dry_run: options.dry_run,
            ledger: ledger.summary().await,
            elapsed: start.elapsed(),
        };

        progress.done(&summary);
        info!(
            completed = summary.completed(),
            resumed = summary.resumed(),
            planned = summary.planned(),
            failed = summary.failed(),
            skipped = summary.skipped(),
            budget_halted = summary.budget_halted,
            cost_usd = summary.ledger.total_usd,
            elapsed_ms = summary.elapsed.as_millis(),
            "run complete"
        );
        Ok(summary)
    }
}

fn unit_report(
    competitor: &CompetitorConfig,
    outcome: StageOutcome<compintel_shared::ResearchResult>,
) -> UnitReport {
    let (status, result) = match outcome {
        StageOutcome::Resumed(result) => (UnitStatus::Resumed, Some(result)),
        StageOutcome::Executed { output, attempts } => (UnitStatus::Completed { attempts }, Some(output)),
        StageOutcome::Planned {
            would_resume,
            operations,
        } => (
            UnitStatus::Planned {
                would_resume,
                operations,
            },
            None,
        ),
    };
    let mut report = UnitReport::new(competitor, status);
    if let Some(result) = result {
        report.claims = result.claims.len();
        report.conflicts = result.claims.iter().filter(|c| c.is_conflicting()).count();
        report.coverage_gaps = result.coverage_gaps.len();
    }
    report
}
