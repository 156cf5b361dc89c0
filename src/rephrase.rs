//! Multilingual query rephrasing through a chat LLM.
//!
//! [`LlmRephraser`] asks the model to translate a query into each target
//! language, one request per language, all in flight at once. A language
//! whose request fails is logged and left out; the others still count.
//!
//! ```toml
//! [rephrase]
//! provider = "ollama"          # or "openai" (needs OPENAI_API_KEY)
//! model = "llama3.1"
//! url = "http://localhost:11434"
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::config::RephraseConfig;
use crate::parallel::{run_in_parallel_allow_failures, task, Task};
use crate::traits::QueryRephraser;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

const SYSTEM_PROMPT: &str = "You translate search queries. Reply with the translated query \
only: no quotes, no explanations, no preamble.";

/// Build the rephraser named by `config.provider`, or `None` when disabled.
pub fn create_rephraser(config: &RephraseConfig) -> Result<Option<Arc<dyn QueryRephraser>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" | "ollama" => Ok(Some(Arc::new(LlmRephraser::new(config)?))),
        other => bail!("Unknown rephrase provider: {}", other),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatApi {
    OpenAi,
    Ollama,
}

/// Everything one chat request needs; cloned into each parallel task.
#[derive(Clone)]
struct ChatClient {
    api: ChatApi,
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl ChatClient {
    async fn complete(&self, user_prompt: String) -> Result<String> {
        let messages = serde_json::json!([
            {"role": "system", "content": SYSTEM_PROMPT},
            {"role": "user", "content": user_prompt},
        ]);
        let body = match self.api {
            ChatApi::OpenAi => serde_json::json!({
                "model": self.model,
                "messages": messages,
                "temperature": 0,
            }),
            ChatApi::Ollama => serde_json::json!({
                "model": self.model,
                "messages": messages,
                "stream": false,
            }),
        };

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("chat API error {}: {}", status, text);
        }
        let json: serde_json::Value = response.json().await?;
        parse_chat_content(self.api, &json)
    }
}

fn parse_chat_content(api: ChatApi, json: &serde_json::Value) -> Result<String> {
    let content = match api {
        ChatApi::OpenAi => json.pointer("/choices/0/message/content"),
        ChatApi::Ollama => json.pointer("/message/content"),
    };
    content
        .and_then(|c| c.as_str())
        .map(clean_rephrase)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| anyhow!("chat response has no message content"))
}

/// Strip surrounding whitespace and quotes the model sometimes adds.
fn clean_rephrase(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}

fn translation_prompt(query: &str, language: &str) -> String {
    format!(
        "Rephrase the following search query in {language}. If it is already in {language}, \
         return it with only minimal changes.\n\nQuery: {query}"
    )
}

pub struct LlmRephraser {
    chat: ChatClient,
}

impl LlmRephraser {
    pub fn new(config: &RephraseConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("rephrase.model required"))?;
        let (api, endpoint, api_key) = match config.provider.as_str() {
            "openai" => {
                let key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
                (ChatApi::OpenAi, OPENAI_CHAT_URL.to_string(), Some(key))
            }
            "ollama" => {
                let url = config.url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL);
                (
                    ChatApi::Ollama,
                    format!("{}/api/chat", url.trim_end_matches('/')),
                    None,
                )
            }
            other => bail!("{} is not a chat provider", other),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            chat: ChatClient {
                api,
                client,
                endpoint,
                api_key,
                model,
            },
        })
    }
}

#[async_trait]
impl QueryRephraser for LlmRephraser {
    async fn expand(&self, query: &str, languages: &[String]) -> Result<Vec<String>> {
        let tasks: Vec<Task<String>> = languages
            .iter()
            .map(|language| {
                let chat = self.chat.clone();
                let prompt = translation_prompt(query, language);
                task(async move { chat.complete(prompt).await })
            })
            .collect();

        let rephrases: Vec<String> = run_in_parallel_allow_failures(tasks)
            .await
            .into_iter()
            .flatten()
            .collect();
        debug!(
            languages = languages.len(),
            rephrases = rephrases.len(),
            "query rephrased"
        );
        Ok(rephrases)
    }
}
