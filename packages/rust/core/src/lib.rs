//! Core pipeline orchestration and domain logic for CompIntel.
//!
//! This crate ties fetching, claim extraction, and reconciliation together
//! under the stage execution contract (checkpointed resume and bounded
//! retry), and drives every competitor through it (see [`Pipeline`]).

pub mod attributes;
pub mod extraction;
pub mod pipeline;
pub mod reconcile;
pub mod research;
pub mod stage;

pub use attributes::{AttributeExtractor, normalize_value};
pub use extraction::{claims_schema, extraction_prompt, parse_claims};
pub use pipeline::{
    Pipeline, ProgressReporter, RunOptions, RunSummary, SilentProgress, UnitReport, UnitStatus,
    select_competitors,
};
pub use reconcile::{
    ExactNormalized, ReconcileStats, Reconciler, ResearchInputs, SimilarityPolicy, TokenJaccard,
    coverage_gaps, sources_by_category,
};
pub use research::{ExtractedSource, PlannedSource, ResearchContext, ResearchProgress, ResearchStage};
pub use stage::{StageOutcome, StageProgress, StageRunner, StageTask};
