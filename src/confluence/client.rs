//! Confluence REST API (v1) client.
//!
//! Cloud sites authenticate with basic auth (account email + API token);
//! self-hosted servers take a personal access token as a bearer token.
//! Every request goes through the client's [`RetryPolicy`], so HTTP 429
//! responses are retried transparently.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{WikiError, WikiResult};
use crate::models::{BodyFormat, WikiAttachment, WikiPage};
use crate::rate_limit::{parse_retry_after, RetryPolicy};
use crate::traits::WikiApi;

use super::connector::WikiCredentials;

/// Page size used when walking a comment thread.
const COMMENT_PAGE_SIZE: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ============ Response shapes ============

#[derive(Debug, Deserialize)]
struct ApiList<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ApiContent {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<ApiBody>,
    #[serde(default)]
    version: Option<ApiVersion>,
    #[serde(rename = "_links", default)]
    links: Option<ApiLinks>,
}

#[derive(Debug, Deserialize)]
struct ApiBody {
    storage: Option<ApiBodyValue>,
    view: Option<ApiBodyValue>,
}

#[derive(Debug, Deserialize)]
struct ApiBodyValue {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct ApiVersion {
    #[serde(default)]
    when: String,
    by: Option<ApiUser>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    email: Option<String>,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiLinks {
    webui: Option<String>,
    download: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiAttachment {
    title: String,
    metadata: Option<ApiAttachmentMetadata>,
    extensions: Option<ApiAttachmentExtensions>,
    #[serde(rename = "_links")]
    links: Option<ApiLinks>,
}

#[derive(Debug, Deserialize)]
struct ApiAttachmentMetadata {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiAttachmentExtensions {
    #[serde(rename = "fileSize")]
    file_size: Option<u64>,
}

impl From<ApiContent> for WikiPage {
    fn from(c: ApiContent) -> Self {
        let (body_storage, body_view) = match c.body {
            Some(b) => (b.storage.map(|v| v.value), b.view.map(|v| v.value)),
            None => (None, None),
        };
        let (last_modified, author_email) = match c.version {
            Some(v) => (v.when, v.by.and_then(|u| u.email)),
            None => (String::new(), None),
        };
        WikiPage {
            id: c.id,
            title: c.title,
            body_storage,
            body_view,
            last_modified,
            author_email,
            web_path: c.links.and_then(|l| l.webui).unwrap_or_default(),
        }
    }
}

impl From<ApiAttachment> for WikiAttachment {
    fn from(a: ApiAttachment) -> Self {
        WikiAttachment {
            title: a.title,
            media_type: a
                .metadata
                .and_then(|m| m.media_type)
                .unwrap_or_default(),
            file_size: a.extensions.and_then(|e| e.file_size).unwrap_or(0),
            download_path: a.links.and_then(|l| l.download).unwrap_or_default(),
        }
    }
}

// ============ Client ============

enum Auth {
    Basic { username: String, token: String },
    Bearer(String),
}

/// HTTP implementation of [`WikiApi`].
pub struct ConfluenceClient {
    http: Client,
    base_url: String,
    is_cloud: bool,
    auth: Auth,
    retry: RetryPolicy,
}

impl ConfluenceClient {
    pub fn new(
        base_url: &str,
        is_cloud: bool,
        credentials: &WikiCredentials,
        retry: RetryPolicy,
    ) -> WikiResult<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        // Username-based auth is rejected by self-hosted servers.
        let auth = if is_cloud {
            Auth::Basic {
                username: credentials.username.clone(),
                token: credentials.access_token.clone(),
            }
        } else {
            Auth::Bearer(credentials.access_token.clone())
        };
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            is_cloud,
            auth,
            retry,
        })
    }

    /// Wiki base URL, without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::Basic { username, token } => req.basic_auth(username, Some(token)),
            Auth::Bearer(token) => req.bearer_auth(token),
        }
    }

    async fn get_json_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> WikiResult<T> {
        let resp = self
            .authorized(self.http.get(url).query(query))
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(WikiError::RateLimited {
                retry_after: parse_retry_after(resp.headers()),
            });
        }
        if !status.is_success() {
            return Err(WikiError::UpstreamFetchFailed {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| WikiError::Decode(format!("{url}: {e}")))
    }

    /// GET `{base}{path}` and decode the JSON body, retrying on 429.
    async fn get_json<T: DeserializeOwned>(
        &self,
        what: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> WikiResult<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(call = what, url = %url, "wiki API request");
        let url = url.as_str();
        self.retry
            .call(what, move || self.get_json_once(url, query))
            .await
    }
}

#[async_trait]
impl WikiApi for ConfluenceClient {
    async fn get_page_by_id(&self, page_id: &str, format: BodyFormat) -> WikiResult<WikiPage> {
        let content: ApiContent = self
            .get_json(
                "get_page_by_id",
                &format!("/rest/api/content/{page_id}"),
                &[("expand", format.expand().to_string())],
            )
            .await?;
        Ok(content.into())
    }

    async fn get_child_pages(
        &self,
        page_id: &str,
        start: usize,
        limit: usize,
    ) -> WikiResult<Vec<WikiPage>> {
        let list: ApiList<ApiContent> = self
            .get_json(
                "get_child_pages",
                &format!("/rest/api/content/{page_id}/child/page"),
                &[
                    ("start", start.to_string()),
                    ("limit", limit.to_string()),
                    ("expand", BodyFormat::Storage.expand().to_string()),
                ],
            )
            .await?;
        Ok(list.results.into_iter().map(WikiPage::from).collect())
    }

    async fn get_child_comments(&self, content_id: &str) -> WikiResult<Vec<WikiPage>> {
        let path = format!("/rest/api/content/{content_id}/child/comment");
        let mut comments = Vec::new();
        let mut start = 0usize;
        loop {
            let list: ApiList<ApiContent> = self
                .get_json(
                    "get_child_comments",
                    &path,
                    &[
                        ("start", start.to_string()),
                        ("limit", COMMENT_PAGE_SIZE.to_string()),
                        ("expand", "body.storage.value".to_string()),
                    ],
                )
                .await?;
            let n = list.results.len();
            comments.extend(list.results.into_iter().map(WikiPage::from));
            if n < COMMENT_PAGE_SIZE {
                break;
            }
            start += n;
        }
        Ok(comments)
    }

    async fn get_space_pages(
        &self,
        space: &str,
        start: usize,
        limit: usize,
        status: Option<&str>,
        format: BodyFormat,
    ) -> WikiResult<Vec<WikiPage>> {
        let mut query = vec![
            ("spaceKey", space.to_string()),
            ("type", "page".to_string()),
            ("start", start.to_string()),
            ("limit", limit.to_string()),
            ("expand", format.expand().to_string()),
        ];
        if let Some(status) = status {
            query.push(("status", status.to_string()));
        }
        let list: ApiList<ApiContent> = self
            .get_json("get_space_pages", "/rest/api/content", &query)
            .await?;
        Ok(list.results.into_iter().map(WikiPage::from).collect())
    }

    async fn get_page_labels(&self, page_id: &str) -> WikiResult<Vec<String>> {
        let list: ApiList<ApiLabel> = self
            .get_json(
                "get_page_labels",
                &format!("/rest/api/content/{page_id}/label"),
                &[],
            )
            .await?;
        Ok(list.results.into_iter().map(|l| l.name).collect())
    }

    async fn get_attachments(
        &self,
        page_id: &str,
        start: usize,
        limit: usize,
    ) -> WikiResult<Vec<WikiAttachment>> {
        let list: ApiList<ApiAttachment> = self
            .get_json(
                "get_attachments",
                &format!("/rest/api/content/{page_id}/child/attachment"),
                &[("start", start.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        Ok(list.results.into_iter().map(WikiAttachment::from).collect())
    }

    async fn download_attachment(&self, download_path: &str) -> WikiResult<Option<Vec<u8>>> {
        let url = format!("{}{}", self.base_url, download_path);
        let url = url.as_str();
        self.retry
            .call("download_attachment", move || async move {
                let resp = self.authorized(self.http.get(url)).send().await?;
                let status = resp.status();
                if status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(WikiError::RateLimited {
                        retry_after: parse_retry_after(resp.headers()),
                    });
                }
                if status != StatusCode::OK {
                    warn!(url = %url, status = status.as_u16(), "attachment download refused");
                    return Ok(None);
                }
                Ok(Some(resp.bytes().await?.to_vec()))
            })
            .await
    }

    async fn get_user_display_name(&self, user_id: &str) -> WikiResult<Option<String>> {
        // Cloud references users by account id, self-hosted by user key.
        let param = if self.is_cloud { "accountId" } else { "key" };
        let user: ApiUser = self
            .get_json(
                "get_user_display_name",
                "/rest/api/user",
                &[(param, user_id.to_string())],
            )
            .await?;
        Ok(user.display_name)
    }
}
