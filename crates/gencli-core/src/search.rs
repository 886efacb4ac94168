//! Search functionality

use std::path::PathBuf;
use std::sync::Arc;

use crate::gemini::GeminiClient;
use crate::service::{CancelFlag, GenerationService, RetryPolicy, retry_with_backoff};
use crate::{Config, FileRecord, GenError, IndexStore, Result};

/// Best match for a query.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub record: FileRecord,
    pub similarity: f32,
}

/// Searcher for querying the index.
pub struct Searcher {
    service: Arc<dyn GenerationService>,
    store: IndexStore,
    threshold: f32,
    retry: RetryPolicy,
    cancel: CancelFlag,
}

impl Searcher {
    pub fn new(home: PathBuf, config: &Config, service: Arc<dyn GenerationService>) -> Self {
        Self {
            service,
            store: IndexStore::open(&home),
            threshold: config.relevance_threshold,
            retry: config.retry_policy(),
            cancel: CancelFlag::new(),
        }
    }

    /// Create a searcher for the data directory `home`, using the first
    /// configured API key.
    pub fn open(home: PathBuf) -> Result<Self> {
        let config = Config::load(&home)?;
        let key = config
            .resolve_api_keys()?
            .into_iter()
            .next()
            .ok_or_else(|| GenError::Config("no API key available".to_string()))?;
        let client = GeminiClient::new(key, &config)?;
        Ok(Self::new(home, &config, Arc::new(client)))
    }

    /// Find the indexed file that best matches `query`.
    pub async fn search(&self, query: &str) -> Result<Option<SearchHit>> {
        let records = self.store.load()?;
        self.search_records(&records, query).await
    }

    /// Same as [`Searcher::search`] over an already loaded collection.
    pub async fn search_records(
        &self,
        records: &[FileRecord],
        query: &str,
    ) -> Result<Option<SearchHit>> {
        if !records.iter().any(FileRecord::is_searchable) {
            tracing::debug!("No searchable records, skipping query embedding");
            return Ok(None);
        }

        let service = &*self.service;
        let query_embedding =
            retry_with_backoff(&self.retry, &self.cancel, move || service.embed(query)).await?;

        Ok(best_match(records, &query_embedding, self.threshold).map(|(record, similarity)| {
            SearchHit {
                record: record.clone(),
                similarity,
            }
        }))
    }
}

/// Highest-scoring searchable record, if it scores strictly above
/// `threshold`. The first record wins a tie. Records scoring NaN (a
/// corrupt stored vector) never match.
pub fn best_match<'a>(
    records: &'a [FileRecord],
    query: &[f32],
    threshold: f32,
) -> Option<(&'a FileRecord, f32)> {
    let mut best: Option<(&FileRecord, f32)> = None;
    for record in records.iter().filter(|r| r.is_searchable()) {
        let similarity = cosine_similarity(query, &record.embedding);
        if similarity.is_nan() {
            tracing::debug!("Ignoring {}: similarity is NaN", record.path().display());
            continue;
        }
        if best.is_none_or(|(_, top)| similarity > top) {
            best = Some((record, similarity));
        }
    }
    best.filter(|(_, similarity)| *similarity > threshold)
}

/// `a·b / (|a| |b|)`. Vectors of different length, or with zero norm, score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}
