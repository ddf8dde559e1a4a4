//! Claim Reconciliation Engine.
//!
//! Turns raw per-source claim extractions into one deduplicated,
//! contradiction-annotated claim set per competitor:
//!
//! 1. Partition by claim category; claims never merge across categories.
//! 2. Merge claims the [`SimilarityPolicy`] judges equivalent, unioning their
//!    supporting sources.
//! 3. Claims on the same attribute with incompatible values are both kept,
//!    marked `conflicting`, and cite each other's sources as contradicting.
//! 4. A merged claim takes the highest-precedence tier of its constituents;
//!    any claim with contradicting sources is `conflicting`.
//!
//! Reconciliation is infallible: data-quality problems show up in the
//! output, never as errors.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::Utc;
use tracing::debug;

use compintel_shared::{
    CURRENT_SCHEMA_VERSION, Claim, ClaimCategory, ConfidenceTier, FetchStatus, ResearchResult,
    Source, SourceCategory, UnitKey, normalize_text,
};

use crate::attributes::{AttributeExtractor, normalize_value};

// ---------------------------------------------------------------------------
// Similarity policies
// ---------------------------------------------------------------------------

/// Decides whether two same-category claims state the same fact.
pub trait SimilarityPolicy: Send + Sync {
    fn equivalent(&self, a: &Claim, b: &Claim) -> bool;
}

/// Equal normalized text. The conservative default.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactNormalized;

impl SimilarityPolicy for ExactNormalized {
    fn equivalent(&self, a: &Claim, b: &Claim) -> bool {
        normalize_text(&a.text) == normalize_text(&b.text)
    }
}

/// Token-set Jaccard similarity at or above `threshold`.
///
/// Never merges two claims that assert different values for the same
/// attribute, however similar their wording.
#[derive(Debug, Clone, Copy)]
pub struct TokenJaccard {
    pub threshold: f64,
}

impl Default for TokenJaccard {
    fn default() -> Self {
        Self { threshold: 0.8 }
    }
}

impl SimilarityPolicy for TokenJaccard {
    fn equivalent(&self, a: &Claim, b: &Claim) -> bool {
        if values_conflict(a, b) {
            return false;
        }
        let a_norm = normalize_text(&a.text);
        let b_norm = normalize_text(&b.text);
        let ta: HashSet<&str> = a_norm.split_whitespace().collect();
        let tb: HashSet<&str> = b_norm.split_whitespace().collect();
        if ta.is_empty() && tb.is_empty() {
            return true;
        }
        let inter = ta.intersection(&tb).count() as f64;
        let union = ta.union(&tb).count() as f64;
        inter / union >= self.threshold
    }
}

/// Same attribute, different normalized values.
fn values_conflict(a: &Claim, b: &Claim) -> bool {
    match (&a.attribute, &a.value, &b.attribute, &b.value) {
        (Some(attr_a), Some(val_a), Some(attr_b), Some(val_b)) if attr_a == attr_b => {
            normalize_value(attr_a, val_a) != normalize_value(attr_b, val_b)
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Stats from one reconciliation pass, for logging and summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub raw_claims: usize,
    pub merged_claims: usize,
    pub conflicts: usize,
}

pub struct Reconciler {
    policy: Box<dyn SimilarityPolicy>,
    extractor: AttributeExtractor,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(Box::new(ExactNormalized))
    }
}

impl Reconciler {
    pub fn new(policy: Box<dyn SimilarityPolicy>) -> Self {
        Self {
            policy,
            extractor: AttributeExtractor,
        }
    }

    /// Merge raw `(claim, source)` extractions into the final claim set.
    ///
    /// Output is ordered by category, then by first appearance.
    pub fn reconcile(&self, raw: Vec<(Claim, Source)>) -> (Vec<Claim>, ReconcileStats) {
        let mut stats = ReconcileStats {
            raw_claims: raw.len(),
            ..ReconcileStats::default()
        };

        let mut by_category: BTreeMap<ClaimCategory, Vec<Claim>> = BTreeMap::new();
        for (mut claim, source) in raw {
            claim.source_ids.insert(source.id);
            if claim.attribute.is_none() {
                if let Some((attribute, value)) = self.extractor.extract(&claim.text) {
                    claim.attribute = Some(attribute);
                    claim.value = Some(value);
                }
            }
            by_category.entry(claim.category).or_default().push(claim);
        }

        let mut out = Vec::new();
        for (category, claims) in by_category {
            let mut groups = self.merge_equivalent(claims);
            stats.conflicts += mark_conflicts(&mut groups);
            for claim in &mut groups {
                if !claim.contradicting_source_ids.is_empty() {
                    claim.confidence = ConfidenceTier::Conflicting;
                }
            }
            debug!(category = category.as_str(), claims = groups.len(), "category reconciled");
            out.extend(groups);
        }
        stats.merged_claims = stats.raw_claims.saturating_sub(out.len());
        (out, stats)
    }

    fn merge_equivalent(&self, claims: Vec<Claim>) -> Vec<Claim> {
        let mut groups: Vec<Claim> = Vec::new();
        for claim in claims {
            match groups.iter_mut().find(|g| self.policy.equivalent(g, &claim)) {
                Some(group) => merge_into(group, claim),
                None => groups.push(claim),
            }
        }
        groups
    }
}

/// Fold `other` into `group`. Provenance only grows.
fn merge_into(group: &mut Claim, other: Claim) {
    group.source_ids.extend(other.source_ids);
    group
        .contradicting_source_ids
        .extend(other.contradicting_source_ids);
    if other.confidence.precedence() > group.confidence.precedence() {
        group.confidence = other.confidence;
    }
    if group.attribute.is_none() {
        group.attribute = other.attribute;
        group.value = other.value;
    }
}

/// Cross-annotate every pair of claims that conflict on an attribute.
/// Returns the number of conflicting pairs.
fn mark_conflicts(claims: &mut [Claim]) -> usize {
    let mut pairs = 0;
    for i in 0..claims.len() {
        for j in (i + 1)..claims.len() {
            if !values_conflict(&claims[i], &claims[j]) {
                continue;
            }
            let (left, right) = claims.split_at_mut(j);
            let (a, b) = (&mut left[i], &mut right[0]);
            a.contradicting_source_ids.extend(b.source_ids.iter().cloned());
            b.contradicting_source_ids.extend(a.source_ids.iter().cloned());
            pairs += 1;
        }
    }
    pairs
}

// ---------------------------------------------------------------------------
// Coverage and result assembly
// ---------------------------------------------------------------------------

/// Categories with no surviving claim traced to a `fetched` source.
pub fn coverage_gaps(sources: &[Source], claims: &[Claim]) -> Vec<SourceCategory> {
    let cited: BTreeSet<&str> = claims
        .iter()
        .flat_map(|c| c.source_ids.iter().map(String::as_str))
        .collect();
    let covered: BTreeSet<SourceCategory> = sources
        .iter()
        .filter(|s| s.status == FetchStatus::Fetched && cited.contains(s.id.as_str()))
        .map(|s| s.category)
        .collect();
    SourceCategory::ALL
        .into_iter()
        .filter(|c| !covered.contains(c))
        .collect()
}

/// Fetch attempts per category, failures included.
pub fn sources_by_category(sources: &[Source]) -> BTreeMap<SourceCategory, usize> {
    let mut counts = BTreeMap::new();
    for source in sources {
        *counts.entry(source.category).or_insert(0) += 1;
    }
    counts
}

/// Everything gathered for one competitor, before reconciliation.
#[derive(Debug, Clone)]
pub struct ResearchInputs {
    pub competitor: String,
    pub website: String,
    pub slug: UnitKey,
    pub sources: Vec<Source>,
    pub raw_claims: Vec<(Claim, Source)>,
    pub llm_calls: u32,
    pub cost_usd: f64,
}

impl Reconciler {
    /// Reconcile and assemble the persisted research document.
    pub fn build_result(&self, inputs: ResearchInputs) -> (ResearchResult, ReconcileStats) {
        let (claims, stats) = self.reconcile(inputs.raw_claims);
        let result = ResearchResult {
            schema_version: CURRENT_SCHEMA_VERSION,
            competitor: inputs.competitor,
            website: inputs.website,
            slug: inputs.slug,
            researched_at: Utc::now(),
            sources_by_category: sources_by_category(&inputs.sources),
            coverage_gaps: coverage_gaps(&inputs.sources, &claims),
            sources: inputs.sources,
            claims,
            llm_calls: inputs.llm_calls,
            cost_usd: inputs.cost_usd,
        };
        (result, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::EMPLOYEE_COUNT;

    fn source(category: SourceCategory, status: FetchStatus) -> Source {
        Source::record("https://efm.example/", category, status, Some(200), "")
    }

    fn claim(text: &str, category: ClaimCategory, tier: ConfidenceTier, src: &Source) -> (Claim, Source) {
        (Claim::new(text, category, tier, &src.id), src.clone())
    }

    #[test]
    fn equivalent_claims_merge_and_union_sources() {
        let about = source(SourceCategory::CompanySite, FetchStatus::Fetched);
        let dir = source(SourceCategory::DirectoryListing, FetchStatus::Fetched);
        let raw = vec![
            claim("Offers 24/7 dispatch.", ClaimCategory::ServiceModel, ConfidenceTier::Inferred, &about),
            claim("offers 24 7 dispatch", ClaimCategory::ServiceModel, ConfidenceTier::VerifiedOnSource, &dir),
        ];

        let (claims, stats) = Reconciler::default().reconcile(raw);
        assert_eq!(claims.len(), 1);
        assert_eq!(stats.merged_claims, 1);
        assert_eq!(claims[0].source_ids.len(), 2);
        assert!(claims[0].source_ids.contains(&about.id));
        assert!(claims[0].source_ids.contains(&dir.id));
        assert_eq!(claims[0].confidence, ConfidenceTier::VerifiedOnSource);
    }

    #[test]
    fn categories_never_merge() {
        let s = source(SourceCategory::News, FetchStatus::Fetched);
        let raw = vec![
            claim("Acquired by Apex Holdings", ClaimCategory::Ownership, ConfidenceTier::Estimated, &s),
            claim("Acquired by Apex Holdings", ClaimCategory::Financial, ConfidenceTier::Estimated, &s),
        ];
        let (claims, _) = Reconciler::default().reconcile(raw);
        assert_eq!(claims.len(), 2);
    }

    #[test]
    fn employee_count_conflict_is_symmetric() {
        let about = source(SourceCategory::CompanySite, FetchStatus::Fetched);
        let linkedin = source(SourceCategory::ProfessionalNetwork, FetchStatus::Fetched);
        let raw = vec![
            claim("~150 employees", ClaimCategory::Scale, ConfidenceTier::VerifiedOnSource, &about),
            claim("~200 employees", ClaimCategory::Scale, ConfidenceTier::VerifiedOnSource, &linkedin),
        ];

        let (claims, stats) = Reconciler::default().reconcile(raw);
        assert_eq!(claims.len(), 2);
        assert_eq!(stats.conflicts, 1);
        for c in &claims {
            assert_eq!(c.confidence, ConfidenceTier::Conflicting);
            assert_eq!(c.attribute.as_deref(), Some(EMPLOYEE_COUNT));
        }
        assert!(claims[0].contradicting_source_ids.contains(&linkedin.id));
        assert!(claims[1].contradicting_source_ids.contains(&about.id));
    }

    #[test]
    fn same_value_different_wording_is_not_a_conflict() {
        let a = source(SourceCategory::CompanySite, FetchStatus::Fetched);
        let b = source(SourceCategory::DirectoryListing, FetchStatus::Fetched);
        let raw = vec![
            claim("150 employees", ClaimCategory::Scale, ConfidenceTier::VerifiedOnSource, &a),
            claim("Team of 150 people", ClaimCategory::Scale, ConfidenceTier::Estimated, &b),
        ];
        let (claims, stats) = Reconciler::default().reconcile(raw);
        assert_eq!(stats.conflicts, 0);
        assert!(claims.iter().all(|c| c.contradicting_source_ids.is_empty()));
        assert!(claims.iter().all(|c| c.confidence != ConfidenceTier::Conflicting));
    }

    #[test]
    fn merged_provenance_is_superset_of_constituents() {
        let s1 = source(SourceCategory::News, FetchStatus::Fetched);
        let s2 = source(SourceCategory::TradePublication, FetchStatus::Fetched);
        let s3 = source(SourceCategory::SocialForum, FetchStatus::Fetched);
        let mut first = Claim::new("Uses Samsara telematics", ClaimCategory::Technology, ConfidenceTier::Inferred, &s1.id);
        first.source_ids.insert(s3.id.clone());
        let before = first.source_ids.clone();
        let raw = vec![
            (first, s1.clone()),
            claim("uses samsara telematics", ClaimCategory::Technology, ConfidenceTier::Estimated, &s2),
        ];

        let (claims, _) = Reconciler::default().reconcile(raw);
        assert_eq!(claims.len(), 1);
        assert!(claims[0].source_ids.is_superset(&before));
        assert!(claims[0].source_ids.contains(&s2.id));
        assert_eq!(claims[0].confidence, ConfidenceTier::Estimated);
    }

    #[test]
    fn jaccard_merges_near_duplicates_but_not_conflicts() {
        let a = source(SourceCategory::CompanySite, FetchStatus::Fetched);
        let b = source(SourceCategory::News, FetchStatus::Fetched);
        let near = vec![
            claim("EFM operates a fleet of refrigerated trucks in Texas", ClaimCategory::ServiceModel, ConfidenceTier::Estimated, &a),
            claim("EFM operates a fleet of refrigerated trucks across Texas", ClaimCategory::ServiceModel, ConfidenceTier::Estimated, &b),
        ];
        let jaccard = Reconciler::new(Box::new(TokenJaccard { threshold: 0.7 }));
        assert_eq!(jaccard.reconcile(near.clone()).0.len(), 1);
        assert_eq!(Reconciler::default().reconcile(near).0.len(), 2);

        let conflicting = vec![
            claim("The company has 150 employees", ClaimCategory::Scale, ConfidenceTier::Estimated, &a),
            claim("The company has 200 employees", ClaimCategory::Scale, ConfidenceTier::Estimated, &b),
        ];
        let (claims, stats) = Reconciler::new(Box::new(TokenJaccard { threshold: 0.5 })).reconcile(conflicting);
        assert_eq!(claims.len(), 2);
        assert_eq!(stats.conflicts, 1);
    }

    #[test]
    fn coverage_gaps_only_count_fetched_sources_with_claims() {
        let about = source(SourceCategory::CompanySite, FetchStatus::Fetched);
        let careers = source(SourceCategory::CompanySite, FetchStatus::Failed);
        let linkedin = source(SourceCategory::ProfessionalNetwork, FetchStatus::Fetched);
        let news = source(SourceCategory::News, FetchStatus::Fetched);
        let sources = vec![about.clone(), careers, linkedin.clone(), news];
        let claims = vec![
            Claim::new("a", ClaimCategory::Other, ConfidenceTier::Inferred, &about.id),
            Claim::new("b", ClaimCategory::Other, ConfidenceTier::Inferred, &linkedin.id),
        ];

        let gaps = coverage_gaps(&sources, &claims);
        assert_eq!(gaps.len(), 8);
        assert!(!gaps.contains(&SourceCategory::CompanySite));
        assert!(!gaps.contains(&SourceCategory::ProfessionalNetwork));
        // fetched but produced no claims
        assert!(gaps.contains(&SourceCategory::News));
    }

    #[test]
    fn failed_fetch_counts_as_attempt_without_claims() {
        let about = source(SourceCategory::CompanySite, FetchStatus::Fetched);
        let careers = Source::record(
            "https://efm.example/careers",
            SourceCategory::CompanySite,
            FetchStatus::Failed,
            Some(404),
            "",
        );
        let inputs = ResearchInputs {
            competitor: "EFM Logistics".into(),
            website: "https://efm.example".into(),
            slug: UnitKey::from_name("EFM Logistics"),
            sources: vec![about.clone(), careers],
            raw_claims: vec![claim("Founded in 1998", ClaimCategory::Ownership, ConfidenceTier::VerifiedOnSource, &about)],
            llm_calls: 1,
            cost_usd: 0.01,
        };

        let (result, _) = Reconciler::default().build_result(inputs);
        assert_eq!(result.sources.len(), 2);
        assert_eq!(result.sources_by_category[&SourceCategory::CompanySite], 2);
        assert_eq!(result.claims.len(), 1);
        assert_eq!(result.coverage_gaps.len(), 9);
        assert_eq!(result.slug.as_str(), "efm_logistics");
    }

    #[test]
    fn empty_input_yields_all_gaps() {
        let (result, stats) = Reconciler::default().build_result(ResearchInputs {
            competitor: "Nobody".into(),
            website: "https://nobody.example".into(),
            slug: UnitKey::from_name("Nobody"),
            sources: vec![],
            raw_claims: vec![],
            llm_calls: 0,
            cost_usd: 0.0,
        });
        assert!(result.claims.is_empty());
        assert_eq!(result.coverage_gaps.len(), 10);
        assert_eq!(stats, ReconcileStats::default());
    }
}
