//! Error types for CompIntel.
//!
//! Library crates use [`CompIntelError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all CompIntel operations.
#[derive(Debug, thiserror::Error)]
pub enum CompIntelError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Non-transient network/HTTP error.
    #[error("network error: {0}")]
    Network(String),

    /// Connection reset, DNS hiccup, 5xx and similar failures worth retrying.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Upstream asked us to slow down (HTTP 429 or equivalent).
    #[error("rate limited by {service}")]
    RateLimited {
        service: String,
        retry_after_secs: Option<u64>,
    },

    /// A fetch or dispatch exceeded its deadline.
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },

    /// A provider answered with an error.
    #[error("provider {provider} failed: {message}")]
    Provider {
        provider: String,
        message: String,
        transient: bool,
    },

    /// Every candidate provider for a task failed.
    #[error("all providers exhausted for task '{task}': {}", attempts.join("; "))]
    ProviderExhausted { task: String, attempts: Vec<String> },

    /// The hard budget ceiling has been crossed; dispatch is refused.
    #[error("budget exceeded: ${spent_usd:.4} spent of ${ceiling_usd:.2} ceiling")]
    BudgetExceeded { spent_usd: f64, ceiling_usd: f64 },

    /// Response or document parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or checkpoint storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CompIntelError>;

impl CompIntelError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientNetwork(_) | Self::RateLimited { .. } | Self::Timeout { .. } => true,
            Self::Provider { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Whether this is a budget refusal that should halt the whole run.
    pub fn is_budget(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. })
    }

    /// Server-suggested wait before the next attempt, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CompIntelError::config("missing competitors");
        assert_eq!(err.to_string(), "config error: missing competitors");

        let err = CompIntelError::BudgetExceeded {
            spent_usd: 20.5,
            ceiling_usd: 20.0,
        };
        assert_eq!(err.to_string(), "budget exceeded: $20.5000 spent of $20.00 ceiling");

        let err = CompIntelError::ProviderExhausted {
            task: "content_extraction".into(),
            attempts: vec!["claude: 503".into(), "openai: 429".into()],
        };
        assert!(err.to_string().contains("claude: 503; openai: 429"));
    }

    #[test]
    fn transient_classification() {
        assert!(CompIntelError::TransientNetwork("reset".into()).is_transient());
        assert!(
            CompIntelError::RateLimited {
                service: "search".into(),
                retry_after_secs: Some(3)
            }
            .is_transient()
        );
        assert!(
            CompIntelError::Timeout {
                operation: "fetch".into(),
                timeout_secs: 30
            }
            .is_transient()
        );
        assert!(
            !CompIntelError::Provider {
                provider: "claude".into(),
                message: "invalid key".into(),
                transient: false
            }
            .is_transient()
        );
        assert!(!CompIntelError::Network("HTTP 404".into()).is_transient());
    }

    #[test]
    fn budget_is_not_transient() {
        let err = CompIntelError::BudgetExceeded {
            spent_usd: 1.0,
            ceiling_usd: 1.0,
        };
        assert!(err.is_budget());
        assert!(!err.is_transient());
    }
}
