//! Cost Ledger: append-only record of metered provider calls.
//!
//! One ledger is scoped to one pipeline run and shared (behind an `Arc`) by
//! every worker. All reads and appends go through a single async mutex, so
//! the running total is updated and read atomically and budget checks never
//! see a stale value.
//!
//! Crossing a soft threshold raises a [`BudgetAlert`] exactly once. Reaching
//! the hard ceiling flips the halt signal, which the router watches to cancel
//! in-flight dispatches.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use compintel_shared::{BudgetConfig, CompIntelError, CostLedgerEntry, Result};
use compintel_storage::Storage;

// ---------------------------------------------------------------------------
// Budget limits and signals
// ---------------------------------------------------------------------------

/// Budget thresholds resolved to USD.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetLimits {
    pub max_usd: f64,
    /// Ascending soft thresholds, in percent of `max_usd`.
    pub alert_at_pct: Vec<u32>,
    pub hard_stop_pct: u32,
}

impl From<&BudgetConfig> for BudgetLimits {
    fn from(config: &BudgetConfig) -> Self {
        let mut alert_at_pct = config.alert_at_pct.clone();
        alert_at_pct.sort_unstable();
        alert_at_pct.dedup();
        Self {
            max_usd: config.max_usd,
            alert_at_pct,
            hard_stop_pct: config.hard_stop_pct,
        }
    }
}

impl BudgetLimits {
    pub fn ceiling_usd(&self) -> f64 {
        self.threshold_usd(self.hard_stop_pct)
    }

    pub fn threshold_usd(&self, pct: u32) -> f64 {
        self.max_usd * f64::from(pct) / 100.0
    }

    /// Percent of `max_usd` that `spent_usd` represents. A zero budget is
    /// fully used before the first call.
    pub fn pct_used(&self, spent_usd: f64) -> f64 {
        if self.max_usd > 0.0 {
            spent_usd / self.max_usd * 100.0
        } else {
            100.0
        }
    }
}

/// Returned with a dispatch that proceeded past a soft threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetWarning {
    /// Highest soft threshold crossed, in percent.
    pub threshold_pct: u32,
    pub spent_usd: f64,
    pub max_usd: f64,
}

/// A soft threshold crossing, recorded once per run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetAlert {
    pub threshold_pct: u32,
    pub spent_usd: f64,
    pub raised_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CostLedger
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LedgerState {
    entries: Vec<CostLedgerEntry>,
    total_usd: f64,
    alerts: Vec<BudgetAlert>,
}

/// Shared cost governor for one run.
pub struct CostLedger {
    limits: BudgetLimits,
    state: Mutex<LedgerState>,
    /// `Some(total)` once the hard ceiling has been reached.
    halt_tx: watch::Sender<Option<f64>>,
    persistence: Option<(Arc<Storage>, String)>,
}

impl CostLedger {
    pub fn new(limits: BudgetLimits) -> Self {
        let (halt_tx, _) = watch::channel(None);
        Self {
            limits,
            state: Mutex::new(LedgerState::default()),
            halt_tx,
            persistence: None,
        }
    }

    pub fn from_config(config: &BudgetConfig) -> Self {
        Self::new(BudgetLimits::from(config))
    }

    /// Mirror entries and alerts into the run database under `run_id`.
    pub fn with_storage(mut self, storage: Arc<Storage>, run_id: impl Into<String>) -> Self {
        self.persistence = Some((storage, run_id.into()));
        self
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    /// Fail closed when the current total has reached the hard ceiling.
    ///
    /// Otherwise returns the highest soft threshold already crossed, if any.
    pub async fn ensure_can_dispatch(&self) -> Result<Option<BudgetWarning>> {
        let state = self.state.lock().await;
        let ceiling = self.limits.ceiling_usd();
        if state.total_usd >= ceiling {
            self.halt_tx.send_replace(Some(state.total_usd));
            return Err(CompIntelError::BudgetExceeded {
                spent_usd: state.total_usd,
                ceiling_usd: ceiling,
            });
        }
        Ok(self.warning_for(state.total_usd))
    }

    /// Current soft-threshold warning, if any threshold has been crossed.
    pub async fn warning(&self) -> Option<BudgetWarning> {
        let total = self.state.lock().await.total_usd;
        self.warning_for(total)
    }

    fn warning_for(&self, total_usd: f64) -> Option<BudgetWarning> {
        self.limits
            .alert_at_pct
            .iter()
            .rev()
            .find(|pct| total_usd >= self.limits.threshold_usd(**pct))
            .map(|pct| BudgetWarning {
                threshold_pct: *pct,
                spent_usd: total_usd,
                max_usd: self.limits.max_usd,
            })
    }

    /// Append one metered call and return the entry as recorded.
    ///
    /// The sequence number and cumulative total are assigned under the lock.
    /// Persistence failures are logged and never fail the call.
    pub async fn record(
        &self,
        task: &str,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) -> CostLedgerEntry {
        let (entry, new_alerts) = {
            let mut state = self.state.lock().await;
            let before = state.total_usd;
            state.total_usd += cost_usd.max(0.0);
            let entry = CostLedgerEntry {
                seq: state.entries.len() as u64 + 1,
                timestamp: Utc::now(),
                task: task.to_string(),
                provider: provider.to_string(),
                model: model.to_string(),
                input_tokens,
                output_tokens,
                cost_usd,
                cumulative_usd: state.total_usd,
            };
            state.entries.push(entry.clone());

            let mut new_alerts = Vec::new();
            for pct in &self.limits.alert_at_pct {
                let threshold = self.limits.threshold_usd(*pct);
                if before < threshold && state.total_usd >= threshold {
                    let alert = BudgetAlert {
                        threshold_pct: *pct,
                        spent_usd: state.total_usd,
                        raised_at: entry.timestamp,
                    };
                    state.alerts.push(alert.clone());
                    new_alerts.push(alert);
                }
            }
            if state.total_usd >= self.limits.ceiling_usd() {
                self.halt_tx.send_replace(Some(state.total_usd));
            }
            (entry, new_alerts)
        };

        info!(
            task,
            provider,
            model,
            input_tokens,
            output_tokens,
            cost_usd,
            cumulative_usd = entry.cumulative_usd,
            "metered call recorded"
        );
        for alert in &new_alerts {
            warn!(
                threshold_pct = alert.threshold_pct,
                spent_usd = alert.spent_usd,
                max_usd = self.limits.max_usd,
                "budget threshold crossed"
            );
        }
        if entry.cumulative_usd >= self.limits.ceiling_usd() {
            warn!(
                spent_usd = entry.cumulative_usd,
                ceiling_usd = self.limits.ceiling_usd(),
                "hard budget ceiling reached; further dispatch refused"
            );
        }

        self.persist(&entry, &new_alerts).await;
        entry
    }

    async fn persist(&self, entry: &CostLedgerEntry, alerts: &[BudgetAlert]) {
        let Some((storage, run_id)) = &self.persistence else {
            return;
        };
        if let Err(e) = storage.insert_cost_entry(run_id, entry).await {
            warn!(run_id = run_id.as_str(), seq = entry.seq, error = %e, "failed to persist cost entry");
        }
        for alert in alerts {
            if let Err(e) = storage
                .insert_budget_alert(run_id, alert.threshold_pct, alert.spent_usd)
                .await
            {
                warn!(run_id = run_id.as_str(), error = %e, "failed to persist budget alert");
            }
        }
    }

    /// Receiver that yields `Some(total)` once the hard ceiling is reached.
    pub fn halt_signal(&self) -> watch::Receiver<Option<f64>> {
        self.halt_tx.subscribe()
    }

    /// Resolves with the total once the hard ceiling is reached.
    pub async fn wait_for_halt(&self) -> Option<f64> {
        let mut halt = self.halt_tx.subscribe();
        halt.wait_for(Option::is_some).await.ok().and_then(|total| *total)
    }

    pub fn is_halted(&self) -> bool {
        self.halt_tx.borrow().is_some()
    }

    pub async fn total_usd(&self) -> f64 {
        self.state.lock().await.total_usd
    }

    pub async fn entries(&self) -> Vec<CostLedgerEntry> {
        self.state.lock().await.entries.clone()
    }

    pub async fn alerts(&self) -> Vec<BudgetAlert> {
        self.state.lock().await.alerts.clone()
    }

    /// Totals by provider and by task for the run so far.
    pub async fn summary(&self) -> LedgerSummary {
        let state = self.state.lock().await;
        let mut summary = LedgerSummary {
            total_usd: state.total_usd,
            calls: state.entries.len() as u64,
            budget_pct_used: self.limits.pct_used(state.total_usd),
            alerts: state.alerts.iter().map(|a| a.threshold_pct).collect(),
            ..LedgerSummary::default()
        };
        for entry in &state.entries {
            summary.input_tokens += entry.input_tokens;
            summary.output_tokens += entry.output_tokens;
            *summary.by_provider.entry(entry.provider.clone()).or_default() += entry.cost_usd;
            *summary.by_task.entry(entry.task.clone()).or_default() += entry.cost_usd;
        }
        summary
    }
}

/// In-memory spend report for the current run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub total_usd: f64,
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub budget_pct_used: f64,
    pub by_provider: BTreeMap<String, f64>,
    pub by_task: BTreeMap<String, f64>,
    /// Soft thresholds crossed, in percent.
    pub alerts: Vec<u32>,
}
