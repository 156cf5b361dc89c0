//! Wiki crawler for Confluence Cloud and self-hosted servers.
//!
//! # Configuration
//!
//! ```toml
//! [confluence]
//! wiki_page_url = "https://acme.atlassian.net/wiki/spaces/ENG/pages/123456/Handbook"
//! index_recursively = true
//! labels_to_skip = ["secret"]
//! ```
//!
//! # Environment Variables
//!
//! - `CONFLUENCE_USER_NAME`: account email (cloud only)
//! - `CONFLUENCE_ACCESS_TOKEN`: API token or personal access token
//!
//! # Usage
//!
//! ```rust,no_run
//! # async fn crawl() -> anyhow::Result<()> {
//! use wiki_harness::config::ConfluenceConnectorConfig;
//! use wiki_harness::confluence::{ConfluenceConnector, WikiCredentials};
//!
//! let mut connector = ConfluenceConnector::new(ConfluenceConnectorConfig::new(
//!     "https://acme.atlassian.net/wiki/spaces/ENG",
//! ))?;
//! let credentials = WikiCredentials::from_env(connector.source().is_cloud)?;
//! connector.load_credentials(&credentials)?;
//!
//! let mut batches = connector.load_from_state()?;
//! while let Some(docs) = batches.next_batch().await? {
//!     println!("{} documents", docs.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connector;
pub mod recursive;
pub mod url;
pub mod users;

pub use client::ConfluenceClient;
pub use connector::{
    parse_last_modified, ConfluenceConnector, DocBatchCursor, PageOutcome, SkipReason,
    TimeWindow, WikiCredentials,
};
pub use recursive::{ChildFetchFailure, RecursiveIndexer, CHILD_BATCH_SIZE};
pub use url::WikiSource;
pub use users::UserNameCache;
