//! Hybrid retrieval with multilingual query expansion.
//!
//! [`Retriever::retrieve_chunks`] turns one [`SearchQuery`] into one or more
//! index lookups, runs them in parallel and merges the results:
//!
//! 1. **Expand** the query into the configured languages (skipped when no
//!    languages are configured, no rephraser is attached, or the query spans
//!    several lines).
//! 2. **Dedupe** candidates by [`simplify_text`], keeping the first seen.
//! 3. **Retrieve** each candidate: embed, hybrid-rank, clean up.
//! 4. **Merge** by `(document_id, chunk_id)`, keeping the best score.
//! 5. **Report** metrics through the optional callback.
//!
//! Any failing branch aborts the whole call. Fetching by document id
//! ([`Retriever::inference_sections_from_ids`]) is the exception: a failed
//! document is left out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use crate::config::{Config, RetrievalConfig};
use crate::embedding::create_embedder;
use crate::models::{
    ChunkMetric, EmbedTextType, IndexFilters, InferenceSection, RetrievalMetrics,
    RetrievedChunk, SearchQuery,
};
use crate::parallel::{run_in_parallel, run_in_parallel_allow_failures, task, Task};
use crate::rephrase::create_rephraser;
use crate::text::simplify_text;
use crate::traits::{DocumentIndex, Embedder, HybridQuery, QueryRephraser};

/// Receives one [`RetrievalMetrics`] batch per non-empty retrieval.
pub type MetricsCallback<'a> = &'a (dyn Fn(RetrievalMetrics) + Sync);

/// Hybrid retriever over a [`DocumentIndex`].
pub struct Retriever {
    index: Arc<dyn DocumentIndex>,
    embedder: Arc<dyn Embedder>,
    rephraser: Option<Arc<dyn QueryRephraser>>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        index: Arc<dyn DocumentIndex>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            rephraser: None,
            config,
        }
    }

    /// Build the embedder and rephraser named in `config`.
    pub fn from_config(config: &Config, index: Arc<dyn DocumentIndex>) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let retriever = Self::new(index, embedder, config.retrieval.clone());
        Ok(match create_rephraser(&config.rephrase)? {
            Some(rephraser) => retriever.with_rephraser(rephraser),
            None => retriever,
        })
    }

    pub fn with_rephraser(mut self, rephraser: Arc<dyn QueryRephraser>) -> Self {
        self.rephraser = Some(rephraser);
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// A hybrid query carrying the configured weights and hit count.
    pub fn build_query(&self, text: impl Into<String>) -> SearchQuery {
        SearchQuery {
            hybrid_alpha: self.config.hybrid_alpha,
            recency_bias_multiplier: self.config.recency_bias_multiplier,
            num_hits: self.config.num_hits,
            ..SearchQuery::new(text)
        }
    }

    /// Ranked chunks for `query`, best first.
    ///
    /// `metrics_callback` is invoked exactly once when at least one chunk is
    /// returned, and never for an empty result.
    pub async fn retrieve_chunks(
        &self,
        query: &SearchQuery,
        metrics_callback: Option<MetricsCallback<'_>>,
    ) -> Result<Vec<RetrievedChunk>> {
        let candidates = self.query_candidates(query).await;
        debug!(candidates = candidates.len(), "running retrieval");

        let tasks: Vec<Task<Vec<RetrievedChunk>>> = candidates
            .into_iter()
            .map(|text| {
                let index = Arc::clone(&self.index);
                let embedder = Arc::clone(&self.embedder);
                let branch = query.with_query_text(text);
                task(async move { doc_index_retrieval(index, embedder, branch).await })
            })
            .collect();
        let branches = run_in_parallel(tasks).await?;
        let top_chunks = combine_retrieval_results(branches);

        if top_chunks.is_empty() {
            info!(
                query = %query.query,
                filters = ?query.filters,
                "No chunks returned for query"
            );
            return Ok(top_chunks);
        }

        if let Some(callback) = metrics_callback {
            callback(self.metrics_for(query, &top_chunks));
        }
        Ok(top_chunks)
    }

    /// The query texts to retrieve with. The original text always comes first.
    async fn query_candidates(&self, query: &SearchQuery) -> Vec<String> {
        let languages = &self.config.multilingual_expansion;
        let rephraser = match &self.rephraser {
            Some(r) if !languages.is_empty() && !is_multiline(&query.query) => r,
            _ => return vec![query.query.clone()],
        };

        let rephrases = match rephraser.expand(&query.query, languages).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "query expansion failed, using the original query only");
                Vec::new()
            }
        };
        dedupe_rephrases(&query.query, rephrases)
    }

    fn metrics_for(&self, query: &SearchQuery, chunks: &[RetrievedChunk]) -> RetrievalMetrics {
        let metrics = chunks
            .iter()
            .map(|c| ChunkMetric {
                document_id: c.document_id.clone(),
                chunk_content_start: c
                    .content
                    .chars()
                    .take(self.config.max_metrics_content)
                    .collect(),
                first_link: c.source_links.first().cloned(),
                score: c.score_or_zero(),
            })
            .collect();
        RetrievalMetrics {
            search_type: query.search_type,
            metrics,
        }
    }

    /// One section per document in `doc_identifiers`, fetched in parallel.
    ///
    /// Access filtering is turned off; the caller has already chosen these
    /// documents. Documents whose fetch fails or returns nothing are omitted.
    pub async fn inference_sections_from_ids(
        &self,
        doc_identifiers: &[(String, usize)],
        filters: &IndexFilters,
    ) -> Vec<InferenceSection> {
        let mut seen = HashSet::new();
        let document_ids: Vec<&str> = doc_identifiers
            .iter()
            .map(|(id, _)| id.as_str())
            .filter(|id| seen.insert(*id))
            .collect();

        let filters = IndexFilters {
            access_control_list: None,
            ..filters.clone()
        };
        let tasks: Vec<Task<Vec<RetrievedChunk>>> = document_ids
            .iter()
            .map(|id| {
                let index = Arc::clone(&self.index);
                let id = id.to_string();
                let filters = filters.clone();
                task(async move { index.id_based_retrieval(&id, None, None, &filters).await })
            })
            .collect();

        run_in_parallel_allow_failures(tasks)
            .await
            .into_iter()
            .flatten()
            .filter_map(InferenceSection::from_chunks)
            .collect()
    }
}

fn is_multiline(query: &str) -> bool {
    query.contains('\n') || query.contains('\r')
}

/// The original query followed by each rephrase whose simplified form has not
/// been seen yet.
pub fn dedupe_rephrases(original: &str, rephrases: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    std::iter::once(original.to_string())
        .chain(rephrases)
        .filter(|q| seen.insert(simplify_text(q)))
        .collect()
}

/// Embed one query, rank it in the index and clean up the hits.
pub async fn doc_index_retrieval(
    index: Arc<dyn DocumentIndex>,
    embedder: Arc<dyn Embedder>,
    query: SearchQuery,
) -> Result<Vec<RetrievedChunk>> {
    let embedding = embedder
        .encode(std::slice::from_ref(&query.query), EmbedTextType::Query)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("embedder returned no vector for the query"))?;

    let top_chunks = index
        .hybrid_retrieval(HybridQuery {
            query: &query.query,
            query_embedding: &embedding,
            final_keywords: Some(&query.processed_keywords),
            filters: &query.filters,
            hybrid_alpha: query.hybrid_alpha,
            time_decay_multiplier: query.recency_bias_multiplier,
            num_to_retrieve: query.num_hits,
            offset: query.offset,
        })
        .await?;
    Ok(cleanup_chunks(top_chunks))
}

/// Remove the indexing-time title prefix and metadata suffix from each
/// chunk's content.
pub fn cleanup_chunks(chunks: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
    chunks
        .into_iter()
        .map(|mut chunk| {
            if let Some(title) = chunk.title.as_deref().filter(|t| !t.is_empty()) {
                let prefix = format!("{title}\n");
                if let Some(rest) = chunk.content.strip_prefix(&prefix) {
                    chunk.content = rest.to_string();
                }
            }
            if let Some(suffix) = chunk.metadata_suffix.as_deref().filter(|s| !s.is_empty()) {
                if let Some(rest) = chunk.content.strip_suffix(suffix) {
                    chunk.content = rest.to_string();
                }
            }
            chunk
        })
        .collect()
}

/// Merge branch results: one entry per `(document_id, chunk_id)` holding the
/// highest score, sorted by score descending. Ties keep first-seen order.
pub fn combine_retrieval_results(
    branches: impl IntoIterator<Item = Vec<RetrievedChunk>>,
) -> Vec<RetrievedChunk> {
    let mut best: Vec<RetrievedChunk> = Vec::new();
    let mut slot_of: HashMap<(String, usize), usize> = HashMap::new();

    for chunk in branches.into_iter().flatten() {
        let key = (chunk.document_id.clone(), chunk.chunk_id);
        match slot_of.get(&key) {
            Some(&slot) => {
                if chunk.score_or_zero() > best[slot].score_or_zero() {
                    best[slot] = chunk;
                }
            }
            None => {
                slot_of.insert(key, best.len());
                best.push(chunk);
            }
        }
    }

    best.sort_by(|a, b| b.score_or_zero().total_cmp(&a.score_or_zero()));
    best
}
