//! Seams to the external collaborators.
//!
//! ```text
//!  Wiki Crawler                      Hybrid Retriever
//! ┌──────────────────────┐          ┌───────────────────────────────┐
//! │ ConfluenceConnector  │          │ Retriever                     │
//! │   └─ RecursiveIndexer│          │   ├─ QueryRephraser (expand)  │
//! └─────────┬────────────┘          │   ├─ Embedder (encode)        │
//!           ▼                       │   └─ DocumentIndex (retrieve) │
//!        WikiApi                    └───────────────────────────────┘
//! ```
//!
//! Every trait is object-safe and `Send + Sync` so implementations can be
//! shared behind an `Arc` across parallel tasks. Production implementations
//! live in [`confluence::client`](crate::confluence::client),
//! [`embedding`](crate::embedding), [`rephrase`](crate::rephrase) and
//! [`index`](crate::index); tests swap in in-memory fakes.

use anyhow::Result;
use async_trait::async_trait;

use crate::error::WikiResult;
use crate::models::{
    BodyFormat, EmbedTextType, IndexFilters, RetrievedChunk, WikiAttachment, WikiPage,
};

// ═══════════════════════════════════════════════════════════════════════
// Wiki REST API
// ═══════════════════════════════════════════════════════════════════════

/// The remote wiki API consumed by the crawler.
///
/// Paginated calls take an offset (`start`) and a page size (`limit`) and
/// return an empty list once the collection is exhausted. Implementations
/// are expected to apply rate-limit handling to every call.
#[async_trait]
pub trait WikiApi: Send + Sync {
    async fn get_page_by_id(&self, page_id: &str, format: BodyFormat) -> WikiResult<WikiPage>;

    async fn get_child_pages(
        &self,
        page_id: &str,
        start: usize,
        limit: usize,
    ) -> WikiResult<Vec<WikiPage>>;

    /// Direct comments on a page or comment, bodies expanded in storage
    /// format.
    async fn get_child_comments(&self, content_id: &str) -> WikiResult<Vec<WikiPage>>;

    /// Pages of a space. `status` restricts the listing (`"current"`) when
    /// set.
    async fn get_space_pages(
        &self,
        space: &str,
        start: usize,
        limit: usize,
        status: Option<&str>,
        format: BodyFormat,
    ) -> WikiResult<Vec<WikiPage>>;

    async fn get_page_labels(&self, page_id: &str) -> WikiResult<Vec<String>>;

    async fn get_attachments(
        &self,
        page_id: &str,
        start: usize,
        limit: usize,
    ) -> WikiResult<Vec<WikiAttachment>>;

    /// Raw attachment bytes, or `None` when the download was refused.
    async fn download_attachment(&self, download_path: &str) -> WikiResult<Option<Vec<u8>>>;

    /// Display name for an account id / user key, or `None` when unknown.
    async fn get_user_display_name(&self, user_id: &str) -> WikiResult<Option<String>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Retrieval collaborators
// ═══════════════════════════════════════════════════════════════════════

/// Arguments of one hybrid retrieval call.
#[derive(Debug, Clone, Copy)]
pub struct HybridQuery<'a> {
    pub query: &'a str,
    pub query_embedding: &'a [f32],
    pub final_keywords: Option<&'a [String]>,
    pub filters: &'a IndexFilters,
    pub hybrid_alpha: f64,
    pub time_decay_multiplier: f64,
    pub num_to_retrieve: usize,
    pub offset: usize,
}

/// A chunk index supporting blended keyword and vector ranking.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Ranked chunks, best first.
    async fn hybrid_retrieval(&self, query: HybridQuery<'_>) -> Result<Vec<RetrievedChunk>>;

    /// All chunks of one document with ordinal in `[min_chunk_ind,
    /// max_chunk_ind]` (either bound optional), in ordinal order.
    async fn id_based_retrieval(
        &self,
        document_id: &str,
        min_chunk_ind: Option<usize>,
        max_chunk_ind: Option<usize>,
        filters: &IndexFilters,
    ) -> Result<Vec<RetrievedChunk>>;
}

/// Text embedding capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, in input order.
    async fn encode(&self, texts: &[String], text_type: EmbedTextType) -> Result<Vec<Vec<f32>>>;
}

/// Rewrites a query into other languages.
#[async_trait]
pub trait QueryRephraser: Send + Sync {
    /// Rephrasings of `query`, at most one per language. The original query
    /// need not be included.
    async fn expand(&self, query: &str, languages: &[String]) -> Result<Vec<String>>;
}
