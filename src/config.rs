//! TOML configuration.
//!
//! ```toml
//! [confluence]
//! wiki_page_url = "https://acme.atlassian.net/wiki/spaces/ENG/overview"
//! labels_to_skip = ["secret"]
//!
//! [retrieval]
//! multilingual_expansion = ["English", "German"]
//!
//! [embedding]
//! provider = "model_server"
//! url = "http://localhost:9000"
//! model = "intfloat/e5-base-v2"
//! dims = 768
//! ```
//!
//! Every section except `[confluence]` is optional. Values are validated
//! once by [`load_config`]; nothing is mutated afterwards.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub confluence: ConfluenceConnectorConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rephrase: RephraseConfig,
}

// ============ Wiki connector ============

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConfluenceConnectorConfig {
    /// Space or page URL; a page URL restricts the crawl to that page (tree).
    pub wiki_page_url: String,
    #[serde(default = "default_true")]
    pub index_recursively: bool,
    #[serde(default = "default_index_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Pages carrying any of these labels are never indexed.
    #[serde(default)]
    pub labels_to_skip: Vec<String>,
    /// When set, labels are only fetched to check `labels_to_skip` and are
    /// not added to document metadata.
    #[serde(default)]
    pub skip_label_indexing: bool,
    #[serde(default = "default_true")]
    pub index_only_active_pages: bool,
    /// Attachments larger than this (bytes) are not downloaded.
    #[serde(default = "default_attachment_size_threshold")]
    pub attachment_size_threshold: u64,
    /// Seconds a resolved user display name stays cached. Unset keeps
    /// names for the connector's lifetime.
    #[serde(default)]
    pub user_cache_ttl_secs: Option<u64>,
}

impl ConfluenceConnectorConfig {
    /// Defaults for everything but the URL.
    pub fn new(wiki_page_url: impl Into<String>) -> Self {
        Self {
            wiki_page_url: wiki_page_url.into(),
            index_recursively: true,
            batch_size: default_index_batch_size(),
            continue_on_failure: false,
            labels_to_skip: Vec::new(),
            skip_label_indexing: false,
            index_only_active_pages: true,
            attachment_size_threshold: default_attachment_size_threshold(),
            user_cache_ttl_secs: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_index_batch_size() -> usize {
    16
}
fn default_attachment_size_threshold() -> u64 {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_retries")]
    pub max_retries: u32,
    #[serde(default = "default_delay_secs")]
    pub default_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_retries: default_rate_limit_retries(),
            default_delay_secs: default_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

fn default_rate_limit_retries() -> u32 {
    5
}
fn default_delay_secs() -> u64 {
    10
}
fn default_max_delay_secs() -> u64 {
    600
}

// ============ Retrieval ============

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetrievalConfig {
    /// Target languages for query rephrasing. Empty disables expansion.
    #[serde(default)]
    pub multilingual_expansion: Vec<String>,
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_recency_bias")]
    pub recency_bias_multiplier: f64,
    #[serde(default = "default_num_hits")]
    pub num_hits: usize,
    /// Characters of chunk content kept per metrics record.
    #[serde(default = "default_max_metrics_content")]
    pub max_metrics_content: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            multilingual_expansion: Vec::new(),
            hybrid_alpha: default_hybrid_alpha(),
            recency_bias_multiplier: default_recency_bias(),
            num_hits: default_num_hits(),
            max_metrics_content: default_max_metrics_content(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.62
}
fn default_recency_bias() -> f64 {
    1.0
}
fn default_num_hits() -> usize {
    50
}
fn default_max_metrics_content() -> usize {
    200
}

// ============ Embedding ============

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL for `ollama` and `model_server`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub query_prefix: Option<String>,
    #[serde(default)]
    pub passage_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub normalize: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            query_prefix: None,
            passage_prefix: None,
            normalize: true,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

// ============ Query rephrasing ============

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RephraseConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RephraseConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RephraseConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

// ============ Loading ============

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.confluence.wiki_page_url.trim().is_empty() {
        anyhow::bail!("confluence.wiki_page_url must not be empty");
    }
    if config.confluence.batch_size == 0 {
        anyhow::bail!("confluence.batch_size must be > 0");
    }

    if config.rate_limit.max_delay_secs < config.rate_limit.default_delay_secs {
        anyhow::bail!("rate_limit.max_delay_secs must be >= rate_limit.default_delay_secs");
    }

    // Validate retrieval
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if config.retrieval.recency_bias_multiplier < 0.0 {
        anyhow::bail!("retrieval.recency_bias_multiplier must be >= 0.0");
    }
    if config.retrieval.num_hits == 0 {
        anyhow::bail!("retrieval.num_hits must be >= 1");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        "model_server" => {
            if config.embedding.url.is_none() {
                anyhow::bail!("embedding.url must be specified when provider is 'model_server'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or model_server.",
            other
        ),
    }

    match config.rephrase.provider.as_str() {
        "disabled" => {}
        "openai" | "ollama" => {
            if config.rephrase.model.is_none() {
                anyhow::bail!(
                    "rephrase.model must be specified when provider is '{}'",
                    config.rephrase.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown rephrase provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[confluence]
wiki_page_url = "https://acme.atlassian.net/wiki/spaces/ENG/overview"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert!(config.confluence.index_recursively);
        assert_eq!(config.confluence.batch_size, 16);
        assert!(!config.confluence.continue_on_failure);
        assert!(config.confluence.index_only_active_pages);
        assert_eq!(config.confluence.user_cache_ttl_secs, None);
        assert_eq!(config.rate_limit, RateLimitConfig::default());
        assert!(config.retrieval.multilingual_expansion.is_empty());
        assert_eq!(config.retrieval.max_metrics_content, 200);
        assert!(!config.embedding.is_enabled());
        assert!(!config.rephrase.is_enabled());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{MINIMAL}
[retrieval]
multilingual_expansion = ["English", "French"]
hybrid_alpha = 0.3

[embedding]
provider = "model_server"
url = "http://localhost:9000"
model = "intfloat/e5-base-v2"
dims = 768
"#
        )
        .unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(
            config.retrieval.multilingual_expansion,
            vec!["English", "French"]
        );
        assert!((config.retrieval.hybrid_alpha - 0.3).abs() < 1e-9);
        assert_eq!(config.embedding.dims, Some(768));
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let toml = format!("{MINIMAL}batch_size = 0\n");
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_user_cache_ttl() {
        let toml = format!("{MINIMAL}user_cache_ttl_secs = 900\n");
        let config = parse_config(&toml).unwrap();
        assert_eq!(config.confluence.user_cache_ttl_secs, Some(900));
    }

    #[test]
    fn test_rejects_alpha_out_of_range() {
        let toml = format!("{MINIMAL}\n[retrieval]\nhybrid_alpha = 1.5\n");
        assert!(parse_config(&toml).is_err());
    }

    #[test]
    fn test_rejects_unknown_embedding_provider() {
        let toml =
            format!("{MINIMAL}\n[embedding]\nprovider = \"cohere\"\nmodel = \"x\"\ndims = 8\n");
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_model_server_requires_url() {
        let toml = format!(
            "{MINIMAL}\n[embedding]\nprovider = \"model_server\"\nmodel = \"x\"\ndims = 8\n"
        );
        assert!(parse_config(&toml).is_err());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/wiki-harness.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/wiki-harness.toml"));
    }
}
