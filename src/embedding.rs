//! Embedding providers.
//!
//! - **[`DisabledEmbedder`]**: always errors; used when embeddings are not
//!   configured.
//! - **[`HttpEmbedder`]**: calls one of three HTTP backends:
//!   - `openai`: `POST https://api.openai.com/v1/embeddings` (`OPENAI_API_KEY`)
//!   - `ollama`: `POST {url}/api/embed`
//!   - `model_server`: `POST {url}/encoder/bi-encoder-embed`, the bi-encoder
//!     endpoint of a standalone inference server
//!
//! Use [`create_embedder`] to build the provider named in the config.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::models::EmbedTextType;
use crate::traits::Embedder;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
/// Token window requested from the model server.
const MODEL_SERVER_MAX_CONTEXT: usize = 512;

/// Build the embedder named by `config.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" | "ollama" | "model_server" => Ok(Arc::new(HttpEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled ============

/// Fails every call. Retrieval needs a real provider.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    async fn encode(&self, _texts: &[String], _text_type: EmbedTextType) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ HTTP providers ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    OpenAi,
    Ollama,
    ModelServer,
}

impl Backend {
    fn label(self) -> &'static str {
        match self {
            Backend::OpenAi => "OpenAI",
            Backend::Ollama => "Ollama",
            Backend::ModelServer => "Model server",
        }
    }
}

/// Request body of the model server's bi-encoder endpoint.
#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
    model_name: &'a str,
    max_context_length: usize,
    normalize_embeddings: bool,
    api_key: Option<&'a str>,
    provider_type: Option<&'a str>,
    text_type: EmbedTextType,
    manual_query_prefix: Option<&'a str>,
    manual_passage_prefix: Option<&'a str>,
}

pub struct HttpEmbedder {
    backend: Backend,
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    query_prefix: Option<String>,
    passage_prefix: Option<String>,
    normalize: bool,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let backend = match config.provider.as_str() {
            "openai" => Backend::OpenAi,
            "ollama" => Backend::Ollama,
            "model_server" => Backend::ModelServer,
            other => bail!("{} is not an HTTP embedding provider", other),
        };
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for {} provider", backend.label()))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for {} provider", backend.label()))?;

        let (endpoint, api_key) = match backend {
            Backend::OpenAi => {
                let key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
                (OPENAI_EMBEDDINGS_URL.to_string(), Some(key))
            }
            Backend::Ollama => {
                let url = config.url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL);
                (format!("{}/api/embed", url.trim_end_matches('/')), None)
            }
            Backend::ModelServer => {
                let url = config
                    .url
                    .as_deref()
                    .ok_or_else(|| anyhow!("embedding.url required for model_server provider"))?;
                (
                    format!("{}/encoder/bi-encoder-embed", url.trim_end_matches('/')),
                    None,
                )
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            backend,
            client,
            endpoint,
            api_key,
            model,
            dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            query_prefix: config.query_prefix.clone(),
            passage_prefix: config.passage_prefix.clone(),
            normalize: config.normalize,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    fn prefix_for(&self, text_type: EmbedTextType) -> Option<&str> {
        match text_type {
            EmbedTextType::Query => self.query_prefix.as_deref(),
            EmbedTextType::Passage => self.passage_prefix.as_deref(),
        }
    }

    fn request_body(&self, texts: &[String], text_type: EmbedTextType) -> Result<serde_json::Value> {
        match self.backend {
            Backend::OpenAi | Backend::Ollama => {
                let input = apply_prefix(texts, self.prefix_for(text_type));
                Ok(serde_json::json!({ "model": self.model, "input": input }))
            }
            // The server applies prefixes and normalization itself.
            Backend::ModelServer => serde_json::to_value(EmbedRequest {
                texts,
                model_name: &self.model,
                max_context_length: MODEL_SERVER_MAX_CONTEXT,
                normalize_embeddings: self.normalize,
                api_key: None,
                provider_type: None,
                text_type,
                manual_query_prefix: self.query_prefix.as_deref(),
                manual_passage_prefix: self.passage_prefix.as_deref(),
            })
            .context("serializing model server embed request"),
        }
    }

    fn parse(&self, json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
        match self.backend {
            Backend::OpenAi => parse_openai_response(json),
            Backend::Ollama | Backend::ModelServer => parse_embeddings_array(json),
        }
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        text_type: EmbedTextType,
    ) -> Result<Vec<Vec<f32>>> {
        let body = self.request_body(texts, text_type)?;
        let label = self.backend.label();
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(provider = label, attempt, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.post(&self.endpoint).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let mut vectors = self.parse(&json)?;
                        if vectors.len() != texts.len() {
                            bail!(
                                "{} returned {} embeddings for {} texts",
                                label,
                                vectors.len(),
                                texts.len()
                            );
                        }
                        if self.normalize && self.backend != Backend::ModelServer {
                            vectors.iter_mut().for_each(|v| l2_normalize(v));
                        }
                        return Ok(vectors);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(provider = label, status = status.as_u16(), "embedding request failed");
                        last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                        continue;
                    }
                    bail!("{} API error {}: {}", label, status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow!(
                        "{} connection error ({}): {}",
                        label,
                        self.endpoint,
                        e
                    ));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", label)))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn encode(&self, texts: &[String], text_type: EmbedTextType) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_batch(batch, text_type).await?);
        }
        Ok(out)
    }
}

fn apply_prefix(texts: &[String], prefix: Option<&str>) -> Vec<String> {
    match prefix {
        Some(p) if !p.is_empty() => texts.iter().map(|t| format!("{p}{t}")).collect(),
        _ => texts.to_vec(),
    }
}

/// `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, json_vector(embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// `{ "embeddings": [[...], ...] }` (Ollama and the model server).
fn parse_embeddings_array(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid embedding response: missing embeddings array"))?
        .iter()
        .map(json_vector)
        .collect()
}

fn json_vector(value: &serde_json::Value) -> Result<Vec<f32>> {
    Ok(value
        .as_array()
        .ok_or_else(|| anyhow!("Invalid embedding response: embedding is not an array"))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty, mismatched or zero
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
