//! Project configuration for CompIntel.
//!
//! Config lives in `compintel.toml` in the working directory unless
//! `--config` points elsewhere. CLI flags override config file values,
//! which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CompIntelError, Result};
use crate::types::{SourceCategory, UnitKey};

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "compintel.toml";

/// Provider names accepted in routing candidates.
pub const KNOWN_PROVIDERS: &[&str] = &[
    "claude", "anthropic", "openai", "gpt", "gemini", "google", "grok", "xai",
];

/// Task name used for claim extraction when none is configured.
pub const DEFAULT_EXTRACTION_TASK: &str = "content_extraction";

// ---------------------------------------------------------------------------
// Config structs (matching compintel.toml schema)
// ---------------------------------------------------------------------------

/// Top-level project config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub project: ProjectConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Competitors to research, in run order.
    #[serde(default)]
    pub competitors: Vec<CompetitorConfig>,

    /// Task name → ordered provider candidates.
    #[serde(default)]
    pub routing: BTreeMap<String, TaskRouting>,
}

/// `[project]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_project_name")]
    pub name: String,

    /// The company the analysis is written for.
    #[serde(default)]
    pub target_company: String,

    #[serde(default)]
    pub industry: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: default_project_name(),
            target_company: String::new(),
            industry: String::new(),
        }
    }
}

fn default_project_name() -> String {
    "competitive-analysis".into()
}

/// `[paths]` section. Relative paths resolve against the working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,

    #[serde(default = "default_research_dir")]
    pub research_dir: String,

    /// libSQL database holding runs, the cost ledger, and source records.
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: default_checkpoint_dir(),
            research_dir: default_research_dir(),
            database: default_database(),
        }
    }
}

impl PathsConfig {
    pub fn checkpoint_path(&self) -> PathBuf {
        expand_path(&self.checkpoint_dir)
    }

    pub fn research_path(&self) -> PathBuf {
        expand_path(&self.research_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        expand_path(&self.database)
    }
}

fn default_checkpoint_dir() -> String {
    "checkpoints".into()
}
fn default_research_dir() -> String {
    "research".into()
}
fn default_database() -> String {
    ".compintel/compintel.db".into()
}

/// `[budget]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Budget in USD that percentages are measured against.
    #[serde(default = "default_max_usd")]
    pub max_usd: f64,

    /// Soft alert thresholds, in percent of `max_usd`.
    #[serde(default = "default_alert_at_pct")]
    pub alert_at_pct: Vec<u32>,

    /// Hard ceiling, in percent of `max_usd`.
    #[serde(default = "default_hard_stop_pct")]
    pub hard_stop_pct: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_usd: default_max_usd(),
            alert_at_pct: default_alert_at_pct(),
            hard_stop_pct: default_hard_stop_pct(),
        }
    }
}

impl BudgetConfig {
    /// Spend at which dispatch is refused.
    pub fn hard_ceiling_usd(&self) -> f64 {
        self.max_usd * f64::from(self.hard_stop_pct) / 100.0
    }
}

fn default_max_usd() -> f64 {
    20.0
}
fn default_alert_at_pct() -> Vec<u32> {
    vec![50, 75]
}
fn default_hard_stop_pct() -> u32 {
    100
}

/// `[retry]` section, shared by stage execution and provider dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,

    /// Total attempts per URL for 5xx, timeout, and connection failures.
    #[serde(default = "default_fetch_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Permit loopback and private-network hosts. Off outside tests.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            max_attempts: default_fetch_attempts(),
            user_agent: default_user_agent(),
            allow_private_hosts: false,
        }
    }
}

fn default_fetch_timeout() -> u64 {
    30
}
fn default_fetch_attempts() -> u32 {
    3
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0 Safari/537.36"
        .into()
}

/// `[search]` section. Without an endpoint only seed URLs are researched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// SearXNG-compatible base URL (`GET {endpoint}/search?q=..&format=json`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default = "default_results_per_query")]
    pub results_per_query: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            results_per_query: default_results_per_query(),
        }
    }
}

fn default_results_per_query() -> usize {
    3
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Competitors researched concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Upper bound on sources fetched per category per competitor.
    #[serde(default = "default_max_sources_per_category")]
    pub max_sources_per_category: usize,

    /// Routing task used for claim extraction.
    #[serde(default = "default_extraction_task")]
    pub extraction_task: String,

    /// Characters of page text sent to the extraction provider.
    #[serde(default = "default_source_text_limit")]
    pub source_text_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_sources_per_category: default_max_sources_per_category(),
            extraction_task: default_extraction_task(),
            source_text_limit: default_source_text_limit(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}
fn default_max_sources_per_category() -> usize {
    2
}
fn default_extraction_task() -> String {
    DEFAULT_EXTRACTION_TASK.into()
}
fn default_source_text_limit() -> usize {
    12_000
}

/// `[[competitors]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitorConfig {
    pub name: String,
    pub website: String,

    #[serde(default)]
    pub aliases: Vec<String>,

    #[serde(default)]
    pub notes: String,

    /// Known URLs to research, per category.
    #[serde(default)]
    pub sources: Vec<SeedSource>,
}

/// `[[competitors.sources]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedSource {
    pub category: SourceCategory,
    pub url: String,
}

/// `[routing.<task>]` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRouting {
    /// Tried in order; later entries are failover targets.
    #[serde(default)]
    pub candidates: Vec<ProviderCandidate>,
}

/// One provider/model a task may be dispatched to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCandidate {
    pub provider: String,
    pub model: String,

    /// Name of the env var holding the API key (never store the key itself).
    pub api_key_env: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Override for the provider's API base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// USD per million input tokens; overrides the built-in price table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_price_per_mtok: Option<f64>,

    /// USD per million output tokens; overrides the built-in price table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_price_per_mtok: Option<f64>,
}

fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f64 {
    0.3
}

impl AppConfig {
    /// A starter config with one competitor and a two-provider extraction route.
    pub fn example() -> Self {
        let mut routing = BTreeMap::new();
        routing.insert(
            DEFAULT_EXTRACTION_TASK.to_string(),
            TaskRouting {
                candidates: vec![
                    ProviderCandidate {
                        provider: "claude".into(),
                        model: "claude-sonnet-4-20250514".into(),
                        api_key_env: "ANTHROPIC_API_KEY".into(),
                        max_tokens: default_max_tokens(),
                        temperature: default_temperature(),
                        base_url: None,
                        input_price_per_mtok: None,
                        output_price_per_mtok: None,
                    },
                    ProviderCandidate {
                        provider: "openai".into(),
                        model: "gpt-4o-mini".into(),
                        api_key_env: "OPENAI_API_KEY".into(),
                        max_tokens: default_max_tokens(),
                        temperature: default_temperature(),
                        base_url: None,
                        input_price_per_mtok: None,
                        output_price_per_mtok: None,
                    },
                ],
            },
        );

        Self {
            project: ProjectConfig {
                name: "q4-landscape".into(),
                target_company: "Your Company".into(),
                industry: "logistics".into(),
            },
            competitors: vec![CompetitorConfig {
                name: "EFM Logistics".into(),
                website: "https://www.efmlogistics.example".into(),
                aliases: vec!["EFM".into()],
                notes: String::new(),
                sources: vec![SeedSource {
                    category: SourceCategory::CompanySite,
                    url: "https://www.efmlogistics.example/about".into(),
                }],
            }],
            routing,
            ..Self::default()
        }
    }

    /// Look up a competitor by name, alias, or slug, case-insensitively.
    pub fn competitor(&self, name: &str) -> Option<&CompetitorConfig> {
        self.competitors.iter().find(|c| {
            c.name.eq_ignore_ascii_case(name)
                || c.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
                || UnitKey::from_name(&c.name).as_str().eq_ignore_ascii_case(name)
        })
    }

    /// Check cross-field rules serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.competitors.is_empty() {
            return Err(CompIntelError::config("at least one competitor is required"));
        }
        for c in &self.competitors {
            if c.name.trim().is_empty() {
                return Err(CompIntelError::config("competitor name must not be empty"));
            }
            url::Url::parse(&c.website).map_err(|e| {
                CompIntelError::config(format!("competitor '{}' website invalid: {e}", c.name))
            })?;
        }

        let budget = &self.budget;
        if !(budget.max_usd >= 0.0) {
            return Err(CompIntelError::config("budget.max_usd must be >= 0"));
        }
        if budget.hard_stop_pct == 0 {
            return Err(CompIntelError::config("budget.hard_stop_pct must be > 0"));
        }
        if let Some(pct) = budget
            .alert_at_pct
            .iter()
            .find(|p| **p == 0 || **p > budget.hard_stop_pct)
        {
            return Err(CompIntelError::config(format!(
                "budget.alert_at_pct value {pct} must be in (0, {}]",
                budget.hard_stop_pct
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(CompIntelError::config("retry.max_attempts must be >= 1"));
        }
        if !(self.retry.multiplier >= 1.0) || !self.retry.multiplier.is_finite() {
            return Err(CompIntelError::config("retry.multiplier must be a finite value >= 1"));
        }
        if self.pipeline.concurrency == 0 {
            return Err(CompIntelError::config("pipeline.concurrency must be >= 1"));
        }

        for (task, route) in &self.routing {
            for candidate in &route.candidates {
                let name = candidate.provider.to_ascii_lowercase();
                if !KNOWN_PROVIDERS.contains(&name.as_str()) {
                    return Err(CompIntelError::config(format!(
                        "routing.{task}: unknown provider '{}' (expected one of {})",
                        candidate.provider,
                        KNOWN_PROVIDERS.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Expand a leading `~/` to the user's home directory.
pub fn expand_path(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Resolve the config path: explicit flag, else `./compintel.toml`.
pub fn config_file_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
}

/// Load the project config. Returns defaults if the file does not exist.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let path = config_file_path(explicit);

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the project config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CompIntelError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| CompIntelError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Write the example config to `path`. Refuses to overwrite unless `force`.
pub fn init_config(path: &Path, force: bool) -> Result<PathBuf> {
    if path.exists() && !force {
        return Err(CompIntelError::config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| CompIntelError::io(parent, e))?;
    }

    let content = toml::to_string_pretty(&AppConfig::example())
        .map_err(|e| CompIntelError::config(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| CompIntelError::io(path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path.to_path_buf())
}

/// Read an API key from the named environment variable.
pub fn resolve_api_key(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(CompIntelError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::example();
        let toml_str = toml::to_string_pretty(&config).expect("serialize example config");
        assert!(toml_str.contains("max_usd"));
        assert!(toml_str.contains("ANTHROPIC_API_KEY"));
        assert!(toml_str.contains("content_extraction"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::example();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.budget.alert_at_pct, vec![50, 75]);
        assert_eq!(parsed.routing[DEFAULT_EXTRACTION_TASK].candidates.len(), 2);
        assert_eq!(parsed.competitors[0].sources[0].category, SourceCategory::CompanySite);
        parsed.validate().expect("example config is valid");
    }

    #[test]
    fn config_with_competitors_and_routing() {
        let toml_str = r#"
[budget]
max_usd = 5.0
alert_at_pct = [50]

[[competitors]]
name = "EFM Logistics"
website = "https://efm.example"
aliases = ["EFM"]

[[competitors.sources]]
category = "professional_network"
url = "https://linkedin.example/company/efm"

[[routing.content_extraction.candidates]]
provider = "grok"
model = "grok-2"
api_key_env = "XAI_API_KEY"
input_price_per_mtok = 2.0
output_price_per_mtok = 10.0
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.competitors.len(), 1);
        assert_eq!(config.budget.hard_ceiling_usd(), 5.0);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.pipeline.concurrency, 1);
        assert!(config.competitor("efm").is_some());
        let candidate = &config.routing["content_extraction"].candidates[0];
        assert_eq!(candidate.max_tokens, 4096);
        assert_eq!(candidate.input_price_per_mtok, Some(2.0));
        config.validate().expect("valid");
    }

    #[test]
    fn validation_rejects_bad_configs() {
        let err = AppConfig::default().validate().expect_err("no competitors");
        assert!(err.to_string().contains("at least one competitor"));

        let mut config = AppConfig::example();
        config.budget.alert_at_pct = vec![50, 120];
        assert!(config.validate().is_err());

        let mut config = AppConfig::example();
        config.budget.hard_stop_pct = 0;
        assert!(config.validate().is_err());

        for multiplier in [-1.0, 0.5, f64::NAN, f64::INFINITY] {
            let mut config = AppConfig::example();
            config.retry.multiplier = multiplier;
            let err = config.validate().expect_err("bad multiplier");
            assert!(err.to_string().contains("retry.multiplier"));
        }

        let mut config = AppConfig::example();
        config
            .routing
            .get_mut(DEFAULT_EXTRACTION_TASK)
            .expect("route")
            .candidates[0]
            .provider = "mistral".into();
        let err = config.validate().expect_err("unknown provider");
        assert!(err.to_string().contains("mistral"));
    }

    #[test]
    fn init_config_refuses_overwrite() {
        let dir = std::env::temp_dir().join(format!("compintel-cfg-{}", uuid::Uuid::now_v7()));
        let path = dir.join(CONFIG_FILE_NAME);

        init_config(&path, false).expect("first init");
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).expect("forced init");

        let loaded = load_config(Some(&path)).expect("load");
        assert_eq!(loaded.competitors[0].name, "EFM Logistics");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_config_yields_defaults() {
        let path = std::env::temp_dir().join(format!("compintel-missing-{}.toml", uuid::Uuid::now_v7()));
        let config = load_config(Some(&path)).expect("defaults");
        assert!(config.competitors.is_empty());
        assert_eq!(config.budget.max_usd, 20.0);
    }

    #[test]
    fn api_key_resolution() {
        let result = resolve_api_key("CI_TEST_NONEXISTENT_KEY_12345");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }

    #[test]
    fn expand_home_prefix() {
        assert_eq!(expand_path("research"), PathBuf::from("research"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/ci/db"), home.join("ci/db"));
        }
    }
}
