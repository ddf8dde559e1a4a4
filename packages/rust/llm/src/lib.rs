//! LLM provider access for CompIntel.
//!
//! - [`LlmProvider`]: the two-capability interface (free text, structured JSON)
//! - [`providers`]: Anthropic, OpenAI, Grok and Gemini implementations
//! - [`CostLedger`]: per-run metered spend with soft alerts and a hard ceiling
//! - [`Router`]: task-to-provider routing with retry, failover and budget checks

pub mod ledger;
pub mod provider;
pub mod providers;
pub mod router;

pub use ledger::{BudgetAlert, BudgetLimits, BudgetWarning, CostLedger, LedgerSummary};
pub use provider::{Completion, JSON_INSTRUCTION, LlmProvider, LlmRequest, Pricing, Prompt};
pub use providers::{ProviderKind, ProviderSettings, build_provider};
pub use router::{LlmResponse, Router, strip_code_fences};
