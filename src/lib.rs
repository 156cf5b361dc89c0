//! # Wiki Harness
//!
//! Crawl a Confluence wiki into normalized documents, then retrieve ranked
//! chunks from an index with hybrid (keyword + vector) search.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────────────┐   ┌────────────────────┐
//! │ Confluence │──▶│ ConfluenceConnector │──▶│ NormalizedDocument │
//! │  REST API  │   │ space / tree scan   │   │      batches       │
//! └────────────┘   └─────────────────────┘   └────────────────────┘
//!
//! ┌─────────────┐   ┌──────────────┐   ┌────────────────┐
//! │ SearchQuery │──▶│  Retriever   │──▶│ RetrievedChunk │
//! └─────────────┘   │ expand/embed │   │    (merged)    │
//!                   │ rank/merge   │   └────────────────┘
//!                   └──────┬───────┘
//!                          ▼
//!                   DocumentIndex (MemoryIndex or external)
//! ```
//!
//! The library logs through `tracing` and never installs a subscriber;
//! binaries and tests choose their own.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`confluence`] | Wiki URL parsing, REST client, crawler |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`error`] | Crawler error taxonomy |
//! | [`extract`] | Attachment text extraction (PDF, OOXML, text) |
//! | [`index`] | In-memory hybrid document index |
//! | [`models`] | Core data types |
//! | [`parallel`] | Concurrent fan-out helpers |
//! | [`rate_limit`] | Retry-with-backoff for rate-limited calls |
//! | [`rephrase`] | Multilingual query rephrasing |
//! | [`search`] | Hybrid retrieval, merge and fetch-by-id |
//! | [`text`] | Storage-format rendering and query normalization |
//! | [`traits`] | Seams to the wiki API, index, embedder and rephraser |

pub mod config;
pub mod confluence;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod models;
pub mod parallel;
pub mod rate_limit;
pub mod rephrase;
pub mod search;
pub mod text;
pub mod traits;
