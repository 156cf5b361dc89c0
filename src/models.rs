//! Core data models used throughout the crawler and the retriever.
//!
//! Crawler side: [`WikiPage`] and [`WikiAttachment`] are raw API records,
//! [`NormalizedDocument`] is what a crawl produces. Retriever side:
//! [`SearchQuery`] goes in, [`RetrievedChunk`]s come out, and
//! [`RetrievalMetrics`] is handed to an optional metrics callback.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::text;

/// Source tag attached to every document produced by the wiki crawler.
pub const SOURCE_CONFLUENCE: &str = "confluence";

// ═══════════════════════════════════════════════════════════════════════
// Crawler models
// ═══════════════════════════════════════════════════════════════════════

/// Body representation requested from the wiki API.
///
/// `Storage` is the raw editor markup and is always preferred. `View` is the
/// rendered HTML, used only when a storage-format fetch keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Storage,
    View,
}

impl BodyFormat {
    /// Value for the API's `expand` query parameter.
    pub fn expand(self) -> &'static str {
        match self {
            BodyFormat::Storage => "body.storage.value,version",
            BodyFormat::View => "body.view.value,version",
        }
    }
}

/// A page (or comment) as returned by the wiki API.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WikiPage {
    pub id: String,
    pub title: String,
    /// Storage-format body, when it was expanded.
    pub body_storage: Option<String>,
    /// Rendered body, when it was expanded instead.
    pub body_view: Option<String>,
    /// Raw ISO-8601 last-modified timestamp (may or may not carry an offset).
    pub last_modified: String,
    pub author_email: Option<String>,
    /// Path of the page in the web UI, relative to the wiki base.
    pub web_path: String,
}

impl WikiPage {
    /// The page body HTML, preferring the storage representation.
    pub fn body_html(&self) -> Option<&str> {
        self.body_storage
            .as_deref()
            .or(self.body_view.as_deref())
    }
}

/// An attachment listed under a page.
#[derive(Debug, Clone, PartialEq)]
pub struct WikiAttachment {
    pub title: String,
    pub media_type: String,
    pub file_size: u64,
    /// Download link relative to the wiki base.
    pub download_path: String,
}

/// A linked block of text inside a [`NormalizedDocument`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Section {
    pub link: String,
    pub text: String,
}

/// A metadata value: either a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Text(String),
    List(Vec<String>),
}

/// The crawler's output unit.
///
/// `id` is the canonical page URL. `updated_at` is always UTC.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedDocument {
    pub id: String,
    pub sections: Vec<Section>,
    pub source: String,
    pub semantic_identifier: String,
    pub updated_at: DateTime<Utc>,
    pub owner_email: Option<String>,
    pub metadata: BTreeMap<String, MetadataValue>,
}

// ═══════════════════════════════════════════════════════════════════════
// Retrieval models
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Keyword,
    Semantic,
    Hybrid,
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SearchType::Keyword => "Keyword",
            SearchType::Semantic => "Semantic",
            SearchType::Hybrid => "Hybrid",
        };
        f.write_str(label)
    }
}

/// Whether text is embedded as a query or as an indexed passage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedTextType {
    Query,
    Passage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Structured filters applied by the document index.
///
/// Every `None` means "do not filter on this". An
/// `access_control_list` of `None` disables access filtering entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexFilters {
    pub source_type: Option<Vec<String>>,
    pub document_set: Option<Vec<String>>,
    pub time_cutoff: Option<DateTime<Utc>>,
    pub tags: Option<Vec<Tag>>,
    pub access_control_list: Option<Vec<String>>,
}

/// Input to one retrieval call.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub query: String,
    pub processed_keywords: Vec<String>,
    pub search_type: SearchType,
    pub filters: IndexFilters,
    /// Blend weight: `1.0` is pure vector, `0.0` pure keyword.
    pub hybrid_alpha: f64,
    pub recency_bias_multiplier: f64,
    pub num_hits: usize,
    pub offset: usize,
}

impl SearchQuery {
    /// Build a hybrid query with keywords derived from the text.
    pub fn new(query: impl Into<String>) -> Self {
        let query = query.into();
        let processed_keywords = text::query_keywords(&query);
        Self {
            query,
            processed_keywords,
            search_type: SearchType::Hybrid,
            filters: IndexFilters::default(),
            hybrid_alpha: 0.62,
            recency_bias_multiplier: 1.0,
            num_hits: 50,
            offset: 0,
        }
    }

    /// A copy of this query with only the text replaced.
    ///
    /// Keywords, filters and weights are kept from the original query.
    pub fn with_query_text(&self, query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..self.clone()
        }
    }
}

/// A scored sub-document unit returned by the document index.
///
/// Unique per `(document_id, chunk_id)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub document_id: String,
    /// Ordinal of the chunk within its document.
    pub chunk_id: usize,
    pub content: String,
    pub semantic_identifier: String,
    pub title: Option<String>,
    pub source_type: String,
    pub source_links: Vec<String>,
    pub score: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Metadata text appended to the content at indexing time.
    pub metadata_suffix: Option<String>,
}

impl RetrievedChunk {
    /// Relevance score, with a missing score counting as zero.
    pub fn score_or_zero(&self) -> f64 {
        self.score.unwrap_or(0.0)
    }

    pub fn key(&self) -> (&str, usize) {
        (&self.document_id, self.chunk_id)
    }
}

/// A contiguous view over one document's chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceSection {
    pub center_chunk: RetrievedChunk,
    pub chunks: Vec<RetrievedChunk>,
    pub combined_content: String,
}

impl InferenceSection {
    /// Build a section from a document's chunks. Returns `None` when there
    /// are no chunks to center on.
    pub fn from_chunks(mut chunks: Vec<RetrievedChunk>) -> Option<Self> {
        let center_chunk = chunks.first()?.clone();
        chunks.sort_by_key(|c| c.chunk_id);
        let combined_content = chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Some(Self {
            center_chunk,
            chunks,
            combined_content,
        })
    }
}

/// One line of retrieval metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkMetric {
    pub document_id: String,
    pub chunk_content_start: String,
    pub first_link: Option<String>,
    pub score: f64,
}

/// The batch handed to a retrieval metrics callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalMetrics {
    pub search_type: SearchType,
    pub metrics: Vec<ChunkMetric>,
}
