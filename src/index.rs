//! In-memory [`DocumentIndex`] implementation.
//!
//! Chunks live in a `Vec` behind `std::sync::RwLock`. Ranking is brute
//! force: every chunk passing the filters is scored, then the list is
//! sorted and windowed.
//!
//! # Scoring
//!
//! ```text
//! keyword = matched keywords / total keywords
//! vector  = cosine(query_embedding, chunk_embedding)
//! blended = alpha * vector + (1 - alpha) * keyword
//! score   = blended / (1 + decay * years_since_update)
//! ```

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::embedding::cosine_similarity;
use crate::models::{IndexFilters, RetrievedChunk, Tag};
use crate::text;
use crate::traits::{DocumentIndex, HybridQuery};

const SECONDS_PER_YEAR: f64 = 365.25 * 24.0 * 3600.0;

/// A chunk together with everything the index filters and ranks on.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk: RetrievedChunk,
    pub embedding: Vec<f32>,
    pub document_sets: Vec<String>,
    pub tags: Vec<Tag>,
    pub access_control_list: Vec<String>,
}

impl IndexedChunk {
    pub fn new(chunk: RetrievedChunk, embedding: Vec<f32>) -> Self {
        Self {
            chunk,
            embedding,
            document_sets: Vec::new(),
            tags: Vec::new(),
            access_control_list: Vec::new(),
        }
    }

    pub fn with_document_sets(mut self, sets: Vec<String>) -> Self {
        self.document_sets = sets;
        self
    }

    pub fn with_tags(mut self, tags: Vec<Tag>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_access_control_list(mut self, acl: Vec<String>) -> Self {
        self.access_control_list = acl;
        self
    }

    fn passes(&self, filters: &IndexFilters) -> bool {
        if let Some(sources) = &filters.source_type {
            if !sources.contains(&self.chunk.source_type) {
                return false;
            }
        }
        if let Some(sets) = &filters.document_set {
            if !self.document_sets.iter().any(|s| sets.contains(s)) {
                return false;
            }
        }
        if let (Some(cutoff), Some(updated)) = (filters.time_cutoff, self.chunk.updated_at) {
            if updated < cutoff {
                return false;
            }
        }
        if let Some(tags) = &filters.tags {
            if !self.tags.iter().any(|t| tags.contains(t)) {
                return false;
            }
        }
        if let Some(acl) = &filters.access_control_list {
            if !self.access_control_list.iter().any(|entry| acl.contains(entry)) {
                return false;
            }
        }
        true
    }
}

/// Fraction of `keywords` found (case-insensitively) in the chunk's content
/// or title.
fn keyword_score(chunk: &RetrievedChunk, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let haystack = format!(
        "{} {}",
        chunk.title.as_deref().unwrap_or_default(),
        chunk.content
    )
    .to_lowercase();
    let hits = keywords
        .iter()
        .filter(|k| haystack.contains(&k.to_lowercase()))
        .count();
    hits as f64 / keywords.len() as f64
}

fn recency_factor(updated_at: Option<DateTime<Utc>>, decay: f64, now: DateTime<Utc>) -> f64 {
    let Some(updated) = updated_at else {
        return 1.0;
    };
    let years = ((now - updated).num_seconds() as f64 / SECONDS_PER_YEAR).max(0.0);
    1.0 / (1.0 + decay.max(0.0) * years)
}

/// In-process chunk index.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    chunks: RwLock<Vec<IndexedChunk>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<IndexedChunk>> {
        self.chunks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<IndexedChunk>> {
        self.chunks.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a chunk, replacing any chunk with the same
    /// `(document_id, chunk_id)`.
    pub fn upsert(&self, entry: IndexedChunk) {
        let mut chunks = self.write();
        match chunks.iter_mut().find(|c| c.chunk.key() == entry.chunk.key()) {
            Some(existing) => *existing = entry,
            None => chunks.push(entry),
        }
    }

    /// Replace every chunk of `document_id` with `entries`.
    pub fn replace_document(&self, document_id: &str, entries: Vec<IndexedChunk>) {
        let mut chunks = self.write();
        chunks.retain(|c| c.chunk.document_id != document_id);
        chunks.extend(entries);
    }

    /// Drop a document's chunks. Returns how many were removed.
    pub fn remove_document(&self, document_id: &str) -> usize {
        let mut chunks = self.write();
        let before = chunks.len();
        chunks.retain(|c| c.chunk.document_id != document_id);
        before - chunks.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[async_trait]
impl DocumentIndex for MemoryIndex {
    async fn hybrid_retrieval(&self, query: HybridQuery<'_>) -> Result<Vec<RetrievedChunk>> {
        let keywords = match query.final_keywords {
            Some(k) => k.to_vec(),
            None => text::query_keywords(query.query),
        };
        let alpha = query.hybrid_alpha.clamp(0.0, 1.0);
        let now = Utc::now();

        let chunks = self.read();
        let mut scored: Vec<(f64, &IndexedChunk)> = chunks
            .iter()
            .filter(|c| c.passes(query.filters))
            .map(|c| {
                let vector = cosine_similarity(query.query_embedding, &c.embedding) as f64;
                let keyword = keyword_score(&c.chunk, &keywords);
                let blended = alpha * vector + (1.0 - alpha) * keyword;
                let score =
                    blended * recency_factor(c.chunk.updated_at, query.time_decay_multiplier, now);
                (score, c)
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let results: Vec<RetrievedChunk> = scored
            .into_iter()
            .skip(query.offset)
            .take(query.num_to_retrieve)
            .map(|(score, c)| RetrievedChunk {
                score: Some(score),
                ..c.chunk.clone()
            })
            .collect();
        debug!(
            hits = results.len(),
            keywords = keywords.len(),
            "memory index hybrid retrieval"
        );
        Ok(results)
    }

    async fn id_based_retrieval(
        &self,
        document_id: &str,
        min_chunk_ind: Option<usize>,
        max_chunk_ind: Option<usize>,
        filters: &IndexFilters,
    ) -> Result<Vec<RetrievedChunk>> {
        let chunks = self.read();
        let mut found: Vec<RetrievedChunk> = chunks
            .iter()
            .filter(|c| c.chunk.document_id == document_id)
            .filter(|c| min_chunk_ind.map_or(true, |min| c.chunk.chunk_id >= min))
            .filter(|c| max_chunk_ind.map_or(true, |max| c.chunk.chunk_id <= max))
            .filter(|c| c.passes(filters))
            .map(|c| c.chunk.clone())
            .collect();
        found.sort_by_key(|c| c.chunk_id);
        Ok(found)
    }
}
