//! Stage Execution Contract.
//!
//! Every pipeline stage runs through [`StageRunner::run`], which wraps the
//! stage's domain logic with checkpoint-aware resume, bounded retry of
//! transient failures, and durable `in_progress` / `failed` / `complete`
//! snapshots. A task records partial output through [`StageProgress`]; a
//! failed or interrupted unit resumes from that state instead of starting
//! over.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, instrument, warn};

use compintel_shared::{
    CheckpointRecord, CheckpointStatus, CompIntelError, Result, RetryPolicy, Stage, UnitKey,
};
use compintel_storage::CheckpointStore;

/// The domain logic of one pipeline stage for one unit of work.
#[async_trait]
pub trait StageTask: Send + Sync {
    type Output: Serialize + DeserializeOwned + Send;
    /// Partial output carried across attempts and invocations.
    type Progress: Serialize + DeserializeOwned + Default + Send + Sync;

    fn stage(&self) -> Stage;

    /// Operations a dry run reports instead of executing.
    fn plan(&self, key: &UnitKey) -> Vec<String>;

    /// Run the stage. `attempt` is 1-based within this invocation.
    ///
    /// `progress` starts from whatever an earlier failed or interrupted run
    /// recorded; work it already holds must not be repeated.
    async fn execute(
        &self,
        key: &UnitKey,
        attempt: u32,
        progress: &mut StageProgress<Self::Progress>,
    ) -> Result<Self::Output>;
}

/// Partial stage output, snapshotted to an `in_progress` checkpoint on demand
/// and to the `failed` checkpoint when an attempt errors.
pub struct StageProgress<P> {
    store: Arc<CheckpointStore>,
    key: UnitKey,
    stage: Stage,
    attempts: u32,
    state: P,
}

impl<P: Serialize> StageProgress<P> {
    pub fn new(store: Arc<CheckpointStore>, key: UnitKey, stage: Stage, state: P) -> Self {
        Self {
            store,
            key,
            stage,
            attempts: 0,
            state,
        }
    }

    pub fn state(&self) -> &P {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut P {
        &mut self.state
    }

    /// Save the current state as an `in_progress` checkpoint.
    pub async fn persist(&self) -> Result<()> {
        let record = CheckpointRecord::new(self.key.clone(), self.stage, CheckpointStatus::InProgress)
            .with_payload(self.payload()?)
            .with_attempts(self.attempts);
        self.store.save(record).await?;
        Ok(())
    }

    fn payload(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&self.state).map_err(|e| {
            CompIntelError::parse(format!("stage {} progress is not serializable: {e}", self.stage))
        })
    }
}

/// What [`StageRunner::run`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    /// A `complete` checkpoint existed; domain logic was not invoked.
    Resumed(T),
    /// Domain logic ran and a `complete` checkpoint was written.
    Executed { output: T, attempts: u32 },
    /// Dry run: nothing executed and nothing written.
    Planned {
        would_resume: bool,
        operations: Vec<String>,
    },
}

impl<T> StageOutcome<T> {
    pub fn output(&self) -> Option<&T> {
        match self {
            Self::Resumed(output) | Self::Executed { output, .. } => Some(output),
            Self::Planned { .. } => None,
        }
    }

    pub fn into_output(self) -> Option<T> {
        match self {
            Self::Resumed(output) | Self::Executed { output, .. } => Some(output),
            Self::Planned { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Resumed(_) => "resumed",
            Self::Executed { .. } => "executed",
            Self::Planned { .. } => "planned",
        }
    }
}

/// Applies the checkpoint and retry discipline around a [`StageTask`].
#[derive(Clone)]
pub struct StageRunner {
    store: Arc<CheckpointStore>,
    retry: RetryPolicy,
    dry_run: bool,
    force: bool,
}

impl StageRunner {
    pub fn new(store: Arc<CheckpointStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            dry_run: false,
            force: false,
        }
    }

    /// Report planned operations; never invoke domain logic or write.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Discard any `complete` checkpoint and execute again.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    #[instrument(skip_all, fields(key = %key, stage = %task.stage()))]
    pub async fn run<T: StageTask>(&self, key: &UnitKey, task: &T) -> Result<StageOutcome<T::Output>> {
        let stage = task.stage();
        let existing = self.store.load(key, stage).await?;

        if let Some(record) = existing.as_ref().filter(|r| r.status == CheckpointStatus::Complete) {
            if !self.force {
                match decode_payload::<T::Output>(record) {
                    Ok(output) if !self.dry_run => {
                        info!("complete checkpoint found; skipping");
                        return Ok(StageOutcome::Resumed(output));
                    }
                    Ok(_) => {
                        return Ok(StageOutcome::Planned {
                            would_resume: true,
                            operations: Vec::new(),
                        });
                    }
                    Err(e) => warn!(error = %e, "complete checkpoint unreadable; re-executing"),
                }
            }
        }

        if self.dry_run {
            return Ok(StageOutcome::Planned {
                would_resume: false,
                operations: task.plan(key),
            });
        }

        if self.force {
            self.store.reset(key, stage).await?;
        }

        let prior_attempts = existing.as_ref().map_or(0, |r| r.attempts);
        let state = match existing.as_ref() {
            Some(record) if !self.force && record.status != CheckpointStatus::Complete => {
                resume_progress(record)
            }
            _ => T::Progress::default(),
        };
        let mut progress = StageProgress::new(Arc::clone(&self.store), key.clone(), stage, state);
        progress.attempts = prior_attempts;
        progress.persist().await?;

        let mut attempt = 1;
        loop {
            let total_attempts = prior_attempts + attempt;
            progress.attempts = total_attempts;
            match task.execute(key, attempt, &mut progress).await {
                Ok(output) => {
                    let payload = serde_json::to_value(&output).map_err(|e| {
                        CompIntelError::parse(format!("stage {stage} output is not serializable: {e}"))
                    })?;
                    self.store
                        .save(
                            CheckpointRecord::new(key.clone(), stage, CheckpointStatus::Complete)
                                .with_payload(payload)
                                .with_attempts(total_attempts),
                        )
                        .await?;
                    info!(attempt, "stage complete");
                    return Ok(StageOutcome::Executed {
                        output,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    self.store
                        .save(
                            CheckpointRecord::new(key.clone(), stage, CheckpointStatus::Failed)
                                .with_payload(progress.payload()?)
                                .with_error(e.to_string())
                                .with_attempts(total_attempts),
                        )
                        .await?;

                    if !e.is_transient() || attempt >= self.retry.max_attempts {
                        warn!(attempt, error = %e, "stage failed");
                        return Err(e);
                    }
                    let delay = self.retry.backoff(attempt, &e);
                    warn!(
                        attempt,
                        max = self.retry.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient stage failure; retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Progress recorded by a failed or interrupted run; unreadable state restarts.
fn resume_progress<P: DeserializeOwned + Default>(record: &CheckpointRecord) -> P {
    let Some(payload) = record.payload.clone() else {
        return P::default();
    };
    match serde_json::from_value(payload) {
        Ok(state) => {
            info!(status = record.status.as_str(), attempts = record.attempts, "resuming partial progress");
            state
        }
        Err(e) => {
            warn!(error = %e, "checkpoint progress unreadable; starting over");
            P::default()
        }
    }
}

fn decode_payload<T: DeserializeOwned>(record: &CheckpointRecord) -> Result<T> {
    let payload = record
        .payload
        .clone()
        .ok_or_else(|| CompIntelError::validation("complete checkpoint has no payload"))?;
    serde_json::from_value(payload)
        .map_err(|e| CompIntelError::parse(format!("checkpoint payload: {e}")))
}
