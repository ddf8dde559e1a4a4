//! Shared types, error model, configuration, and retry policy for CompIntel.
//!
//! This crate is the foundation depended on by all other CompIntel crates.
//! It provides:
//! - [`CompIntelError`]: the unified error type
//! - Domain types ([`Source`], [`Claim`], [`ResearchResult`], [`CheckpointRecord`])
//! - Configuration ([`AppConfig`], config loading and validation)
//! - [`RetryPolicy`] for bounded backoff on transient failures

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BudgetConfig, CompetitorConfig, DEFAULT_EXTRACTION_TASK, FetchConfig,
    KNOWN_PROVIDERS, PathsConfig, PipelineConfig, ProjectConfig, ProviderCandidate, RetryConfig,
    SearchConfig, SeedSource, TaskRouting, config_file_path, expand_path, init_config, load_config,
    load_config_from, resolve_api_key,
};
pub use error::{CompIntelError, Result};
pub use retry::RetryPolicy;
pub use types::{
    CURRENT_SCHEMA_VERSION, CheckpointRecord, CheckpointStatus, Claim, ClaimCategory,
    ConfidenceTier, CostLedgerEntry, FetchStatus, ResearchResult, Source, SourceCategory, Stage,
    UnitKey, normalize_text, slugify,
};
