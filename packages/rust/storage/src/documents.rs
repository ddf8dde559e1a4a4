//! Persisted research documents consumed read-only by downstream stages.

use std::path::{Path, PathBuf};

use compintel_shared::{CompIntelError, ResearchResult, Result, UnitKey};

use crate::checkpoint::write_atomic;

const RESEARCH_FILE_NAME: &str = "research.json";

/// `<research_dir>/<slug>/research.json`
pub fn research_result_path(research_dir: &Path, key: &UnitKey) -> PathBuf {
    research_dir.join(key.as_str()).join(RESEARCH_FILE_NAME)
}

/// Write a finalized research document.
///
/// An existing document is left untouched unless `force` is set. Returns
/// whether the file was written.
pub async fn write_research_result(
    research_dir: &Path,
    result: &ResearchResult,
    force: bool,
) -> Result<bool> {
    let path = research_result_path(research_dir, &result.slug);
    if !force && tokio::fs::try_exists(&path).await.unwrap_or(false) {
        tracing::warn!(
            competitor = %result.competitor,
            path = %path.display(),
            "research document already finalized, not overwriting"
        );
        return Ok(false);
    }
    write_atomic(&path, result).await?;
    tracing::info!(
        competitor = %result.competitor,
        path = %path.display(),
        claims = result.claims.len(),
        "research document written"
    );
    Ok(true)
}

/// Read a research document, if one has been finalized.
pub async fn read_research_result(
    research_dir: &Path,
    key: &UnitKey,
) -> Result<Option<ResearchResult>> {
    let path = research_result_path(research_dir, key);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CompIntelError::io(&path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| CompIntelError::parse(format!("{}: {e}", path.display())))
}
