//! Research stage: fetch every planned source for one competitor, extract
//! claims from the fetched ones, and reconcile them into a
//! [`ResearchResult`].
//!
//! Every fetch attempt becomes a [`Source`], whatever its status. Claim
//! extraction for a source starts only after that source's fetch finished,
//! and reconciliation runs only after every extraction completed.
//!
//! Each extraction is checkpointed as it lands, so a unit halted by the
//! budget resumes without fetching or paying for those sources again.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use compintel_crawler::{Fetcher, SearchProvider};
use compintel_llm::{LlmRequest, Router};
use compintel_shared::{
    Claim, CompetitorConfig, FetchStatus, PipelineConfig, ResearchResult, Result, SearchConfig,
    Source, SourceCategory, Stage, UnitKey,
};
use compintel_storage::{Storage, read_research_result, write_research_result};

use crate::extraction::{extraction_prompt, parse_claims};
use crate::reconcile::{Reconciler, ResearchInputs};
use crate::stage::{StageProgress, StageTask};

/// Characters of page text kept as a source's summary.
const SUMMARY_CHARS: usize = 280;

/// A URL the stage intends to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSource {
    pub category: SourceCategory,
    pub url: String,
    /// Where the URL came from: `seed`, `website`, or `search`.
    pub origin: &'static str,
}

/// A fetched source and the claims extracted from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedSource {
    pub source: Source,
    pub claims: Vec<Claim>,
}

/// Extractions finished so far for one competitor, with what they cost.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchProgress {
    pub extracted: Vec<ExtractedSource>,
    pub llm_calls: u32,
    pub cost_usd: f64,
}

impl ResearchProgress {
    fn extracted_for(&self, url: &str) -> Option<&ExtractedSource> {
        self.extracted.iter().find(|e| e.source.url == url)
    }
}

/// Collaborators shared by every competitor's research stage.
#[derive(Clone)]
pub struct ResearchContext {
    pub fetcher: Arc<dyn Fetcher>,
    pub search: Option<Arc<dyn SearchProvider>>,
    pub router: Arc<Router>,
    pub reconciler: Arc<Reconciler>,
    pub pipeline: PipelineConfig,
    pub search_config: SearchConfig,
    pub research_dir: PathBuf,
    /// Overwrite an already finalized research document.
    pub force: bool,
    /// Run index for source rows, when a database is open.
    pub storage: Option<(Arc<Storage>, String)>,
}

pub struct ResearchStage {
    competitor: CompetitorConfig,
    ctx: ResearchContext,
}

impl ResearchStage {
    pub fn new(competitor: CompetitorConfig, ctx: ResearchContext) -> Self {
        Self { competitor, ctx }
    }

    /// Seed URLs from config, plus the website as a company-site source when
    /// no company-site seed was given. Capped per category.
    pub fn seed_plan(&self) -> Vec<PlannedSource> {
        let cap = self.ctx.pipeline.max_sources_per_category.max(1);
        let mut plan: Vec<PlannedSource> = Vec::new();

        let has_site_seed = self
            .competitor
            .sources
            .iter()
            .any(|s| s.category == SourceCategory::CompanySite);
        if !has_site_seed && !self.competitor.website.is_empty() {
            plan.push(PlannedSource {
                category: SourceCategory::CompanySite,
                url: self.competitor.website.clone(),
                origin: "website",
            });
        }
        for seed in &self.competitor.sources {
            let in_category = plan.iter().filter(|p| p.category == seed.category).count();
            if in_category < cap && !plan.iter().any(|p| p.url == seed.url) {
                plan.push(PlannedSource {
                    category: seed.category,
                    url: seed.url.clone(),
                    origin: "seed",
                });
            }
        }
        plan
    }

    /// Seeds plus search results for categories without seeds.
    async fn full_plan(&self) -> Vec<PlannedSource> {
        let mut plan = self.seed_plan();
        let Some(search) = &self.ctx.search else {
            return plan;
        };
        let cap = self.ctx.pipeline.max_sources_per_category.max(1);
        let per_query = self.ctx.search_config.results_per_query.min(cap);

        for category in SourceCategory::ALL {
            if plan.iter().any(|p| p.category == category) {
                continue;
            }
            let query = format!("{} {}", self.competitor.name, category.search_hint());
            match search.search(&query, per_query).await {
                Ok(urls) => {
                    for url in urls {
                        if !plan.iter().any(|p| p.url == url) {
                            plan.push(PlannedSource {
                                category,
                                url,
                                origin: "search",
                            });
                        }
                    }
                }
                Err(e) => warn!(
                    competitor = %self.competitor.name,
                    category = category.as_str(),
                    error = %e,
                    "search failed; category left to coverage gaps"
                ),
            }
        }
        plan
    }

    async fn fetch_source(&self, planned: &PlannedSource) -> (Source, Option<String>) {
        let response = self.ctx.fetcher.fetch(&planned.url).await;
        let summary = match response.status {
            FetchStatus::Fetched => response.excerpt(SUMMARY_CHARS),
            _ => response.error.clone().unwrap_or_default(),
        };
        let source = Source::record(
            &planned.url,
            planned.category,
            response.status,
            response.status_code,
            summary,
        );
        debug!(
            url = planned.url.as_str(),
            status = response.status.as_str(),
            status_code = response.status_code,
            "source recorded"
        );
        let text = (response.status == FetchStatus::Fetched).then_some(response.text);
        (source, text)
    }
}

#[async_trait]
impl StageTask for ResearchStage {
    type Output = ResearchResult;
    type Progress = ResearchProgress;

    fn stage(&self) -> Stage {
        Stage::Research
    }

    fn plan(&self, key: &UnitKey) -> Vec<String> {
        let mut ops: Vec<String> = self
            .seed_plan()
            .iter()
            .map(|p| format!("fetch [{}] {} ({})", p.category, p.url, p.origin))
            .collect();
        if self.ctx.search.is_some() {
            ops.push(format!(
                "search for categories without seeds ({} per query)",
                self.ctx.search_config.results_per_query
            ));
        }
        ops.push(format!(
            "extract claims per fetched source via task '{}'",
            self.ctx.pipeline.extraction_task
        ));
        ops.push(format!("reconcile claims and write {}/research.json", key));
        ops
    }

    #[instrument(skip_all, fields(competitor = %self.competitor.name, attempt = attempt))]
    async fn execute(
        &self,
        key: &UnitKey,
        attempt: u32,
        progress: &mut StageProgress<ResearchProgress>,
    ) -> Result<ResearchResult> {
        if !self.ctx.force {
            if let Some(existing) = read_research_result(&self.ctx.research_dir, key).await? {
                info!("finalized research document found; nothing to research");
                return Ok(existing);
            }
        }

        let plan = self.full_plan().await;
        info!(
            sources = plan.len(),
            already_extracted = progress.state().extracted.len(),
            "research plan ready"
        );

        let mut sources = Vec::with_capacity(plan.len());
        for planned in &plan {
            if let Some(done) = progress.state().extracted_for(&planned.url) {
                debug!(url = planned.url.as_str(), "claims already extracted");
                sources.push(done.source.clone());
                continue;
            }

            let (source, text) = self.fetch_source(planned).await;
            if let Some(text) = text {
                let prompt = extraction_prompt(
                    &self.competitor.name,
                    &source,
                    &text,
                    self.ctx.pipeline.source_text_limit,
                );
                let response = self
                    .ctx
                    .router
                    .dispatch(&self.ctx.pipeline.extraction_task, &LlmRequest::Structured(prompt))
                    .await?;

                let claims = parse_claims(&response.content, &source);
                debug!(url = source.url.as_str(), claims = claims.len(), "claims extracted");
                let state = progress.state_mut();
                state.llm_calls += 1;
                state.cost_usd += response.cost_usd;
                state.extracted.push(ExtractedSource {
                    source: source.clone(),
                    claims,
                });
                progress.persist().await?;
            }
            sources.push(source);
        }

        let state = progress.state();
        // Paid-for extractions whose URL a later search no longer returned.
        for done in &state.extracted {
            if !sources.iter().any(|s| s.url == done.source.url) {
                sources.push(done.source.clone());
            }
        }
        let raw_claims: Vec<(Claim, Source)> = state
            .extracted
            .iter()
            .flat_map(|e| e.claims.iter().map(move |c| (c.clone(), e.source.clone())))
            .collect();
        let llm_calls = state.llm_calls;
        let cost_usd = state.cost_usd;

        let inputs = ResearchInputs {
            competitor: self.competitor.name.clone(),
            website: self.competitor.website.clone(),
            slug: key.clone(),
            sources,
            raw_claims,
            llm_calls,
            cost_usd,
        };
        let (result, stats) = self.ctx.reconciler.build_result(inputs);
        info!(
            claims = result.claims.len(),
            merged = stats.merged_claims,
            conflicts = stats.conflicts,
            gaps = result.coverage_gaps.len(),
            llm_calls,
            cost_usd,
            "claims reconciled"
        );

        if let Some((storage, run_id)) = &self.ctx.storage {
            if let Err(e) = storage
                .record_sources(run_id, &result.competitor, &result.sources)
                .await
            {
                warn!(error = %e, "failed to index sources");
            }
        }

        if !write_research_result(&self.ctx.research_dir, &result, self.ctx.force).await? {
            // A finalized document wins over a fresh run unless forced.
            if let Some(existing) = read_research_result(&self.ctx.research_dir, key).await? {
                return Ok(existing);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use compintel_crawler::FetchResponse;
    use compintel_llm::{Completion, LlmProvider, Pricing, Prompt};
    use compintel_shared::SeedSource;

    /// Serves canned pages keyed by URL; anything else is a 404.
    pub struct StaticFetcher {
        pub pages: HashMap<String, String>,
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> FetchResponse {
            match self.pages.get(url) {
                Some(text) => FetchResponse {
                    url: url.to_string(),
                    status: FetchStatus::Fetched,
                    status_code: Some(200),
                    html: format!("<p>{text}</p>"),
                    text: text.clone(),
                    title: None,
                    error: None,
                },
                None => FetchResponse {
                    url: url.to_string(),
                    status: FetchStatus::Failed,
                    status_code: Some(404),
                    html: String::new(),
                    text: String::new(),
                    title: None,
                    error: Some("HTTP 404".into()),
                },
            }
        }
    }

    /// Answers every extraction with one employee-count claim read from the page.
    pub struct EchoExtractor {
        pub calls: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for EchoExtractor {
        fn name(&self) -> &str {
            "echo"
        }
        fn model(&self) -> &str {
            "echo-1"
        }
        fn pricing(&self) -> Pricing {
            Pricing::new(1.0, 1.0)
        }
        async fn complete(&self, prompt: &Prompt) -> compintel_shared::Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let page = prompt.user.rsplit("Page text:\n").next().unwrap_or("");
            let content = serde_json::json!({"claims": [
                {"text": page, "category": "scale", "confidence": "verified_on_source"}
            ]});
            Ok(Completion {
                content: content.to_string(),
                input_tokens: 1_000,
                output_tokens: 100,
                finish_reason: None,
            })
        }
    }

    impl EchoExtractor {
        pub fn new() -> Arc<Self> {
            Arc::new(Self { calls: AtomicU32::new(0) })
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    /// One competitor whose two fetchable pages disagree on headcount, plus
    /// a careers page that 404s.
    pub fn efm_competitor() -> CompetitorConfig {
        CompetitorConfig {
            name: "EFM Logistics".into(),
            website: "https://efm.example/".into(),
            aliases: vec![],
            notes: String::new(),
            sources: vec![
                SeedSource {
                    category: SourceCategory::CompanySite,
                    url: "https://efm.example/about".into(),
                },
                SeedSource {
                    category: SourceCategory::CompanySite,
                    url: "https://efm.example/careers".into(),
                },
                SeedSource {
                    category: SourceCategory::ProfessionalNetwork,
                    url: "https://linkedin.example/company/efm".into(),
                },
            ],
        }
    }

    pub fn efm_fetcher() -> Arc<StaticFetcher> {
        let pages = HashMap::from([
            ("https://efm.example/about".to_string(), "~150 employees".to_string()),
            (
                "https://linkedin.example/company/efm".to_string(),
                "~200 employees".to_string(),
            ),
        ]);
        Arc::new(StaticFetcher { pages })
    }
}
