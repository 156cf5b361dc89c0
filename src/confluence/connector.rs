//! Page-to-document batching.
//!
//! [`ConfluenceConnector`] turns wiki pages into [`NormalizedDocument`]s.
//! The fetch mode is chosen once from the configured URL:
//!
//! - **space scan** (no page id): paginate the space listing.
//! - **page scan**: walk the page tree below the given page with
//!   [`RecursiveIndexer`], or index only that page when recursion is off.
//!
//! Batches are pulled through a [`DocBatchCursor`]. A batch shorter than the
//! configured batch size is the last one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfluenceConnectorConfig};
use crate::error::{WikiError, WikiResult};
use crate::extract::extract_attachment_text;
use crate::models::{
    BodyFormat, MetadataValue, NormalizedDocument, Section, WikiPage, SOURCE_CONFLUENCE,
};
use crate::rate_limit::RetryPolicy;
use crate::text;
use crate::traits::WikiApi;

use super::client::ConfluenceClient;
use super::recursive::{fetch_origin_page, RecursiveIndexer};
use super::url::WikiSource;
use super::users::UserNameCache;

const CONNECTOR_NAME: &str = "Confluence";
const ATTACHMENT_LIMIT: usize = 500;
const SPACE_NAME_KEY: &str = "Wiki Space Name";
const LABELS_KEY: &str = "labels";

// ============ Credentials ============

/// Wiki login. Cloud sites use `username` + API token; self-hosted servers
/// use only the personal access token.
#[derive(Clone)]
pub struct WikiCredentials {
    pub username: String,
    pub access_token: String,
}

impl std::fmt::Debug for WikiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WikiCredentials")
            .field("username", &self.username)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl WikiCredentials {
    pub fn new(username: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            access_token: access_token.into(),
        }
    }

    /// Load from `CONFLUENCE_USER_NAME` and `CONFLUENCE_ACCESS_TOKEN`.
    /// The user name is only required for cloud sites.
    pub fn from_env(is_cloud: bool) -> WikiResult<Self> {
        Self::from_lookup(is_cloud, |key| std::env::var(key).ok())
    }

    fn from_lookup(
        is_cloud: bool,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> WikiResult<Self> {
        let access_token = lookup("CONFLUENCE_ACCESS_TOKEN")
            .ok_or(WikiError::MissingCredentials(CONNECTOR_NAME))?;
        let username = match lookup("CONFLUENCE_USER_NAME") {
            Some(username) => username,
            None if is_cloud => return Err(WikiError::MissingCredentials(CONNECTOR_NAME)),
            None => String::new(),
        };
        Ok(Self::new(username, access_token))
    }
}

// ============ Outcomes ============

/// Inclusive UTC bounds for incremental polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Window from UNIX seconds.
    pub fn from_unix(start: i64, end: i64) -> WikiResult<Self> {
        match (
            DateTime::from_timestamp(start, 0),
            DateTime::from_timestamp(end, 0),
        ) {
            (Some(start), Some(end)) => Ok(Self { start, end }),
            _ => Err(WikiError::InvalidPollWindow { start, end }),
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }
}

/// Why a fetched page produced no document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    OutsideWindow,
    /// The page carries these labels from the skip set.
    DisallowedLabel(Vec<String>),
    EmptyContent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Indexed(NormalizedDocument),
    Skipped(SkipReason),
}

/// Pages read at one listing offset. `slots` counts the listing positions
/// consumed, including pages that were skipped after failing.
#[derive(Debug, Default)]
struct FetchedPages {
    pages: Vec<WikiPage>,
    slots: usize,
}

impl From<Vec<WikiPage>> for FetchedPages {
    fn from(pages: Vec<WikiPage>) -> Self {
        Self {
            slots: pages.len(),
            pages,
        }
    }
}

// ============ Connector ============

pub struct ConfluenceConnector {
    config: ConfluenceConnectorConfig,
    source: WikiSource,
    labels_to_skip: BTreeSet<String>,
    retry: RetryPolicy,
    api: Option<Arc<dyn WikiApi>>,
    users: UserNameCache,
}

impl ConfluenceConnector {
    /// Validate the wiki URL and pick the fetch mode.
    pub fn new(mut config: ConfluenceConnectorConfig) -> WikiResult<Self> {
        if config.batch_size == 0 {
            warn!("batch_size of 0 is not usable, using 1");
            config.batch_size = 1;
        }
        let source = WikiSource::from_url(&config.wiki_page_url)?;
        info!(
            wiki_base = %source.base_url,
            space = %source.space,
            page_id = %source.page_id,
            space_level_scan = source.is_space_scan(),
            index_recursively = config.index_recursively,
            "confluence connector configured"
        );
        let labels_to_skip = config.labels_to_skip.iter().cloned().collect();
        let users = UserNameCache::new(config.user_cache_ttl_secs.map(Duration::from_secs));
        Ok(Self {
            config,
            source,
            labels_to_skip,
            retry: RetryPolicy::default(),
            api: None,
            users,
        })
    }

    /// Connector for the `[confluence]` section, backing off per
    /// `[rate_limit]`.
    pub fn from_config(config: &Config) -> WikiResult<Self> {
        Ok(Self::new(config.confluence.clone())?
            .with_retry_policy(RetryPolicy::from(&config.rate_limit)))
    }

    /// Rate-limit policy for clients built by [`load_credentials`](Self::load_credentials).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the display-name cache (e.g. with one that expires entries).
    pub fn with_user_cache(mut self, users: UserNameCache) -> Self {
        self.users = users;
        self
    }

    pub fn source(&self) -> &WikiSource {
        &self.source
    }

    pub fn is_space_scan(&self) -> bool {
        self.source.is_space_scan()
    }

    /// Build the HTTP client for this wiki.
    pub fn load_credentials(&mut self, credentials: &WikiCredentials) -> WikiResult<()> {
        let client = ConfluenceClient::new(
            &self.source.base_url,
            self.source.is_cloud,
            credentials,
            self.retry.clone(),
        )?;
        self.api = Some(Arc::new(client));
        Ok(())
    }

    /// Use an already-built API implementation.
    pub fn attach_api(&mut self, api: Arc<dyn WikiApi>) {
        self.api = Some(api);
    }

    fn api(&self) -> WikiResult<Arc<dyn WikiApi>> {
        self.api
            .clone()
            .ok_or(WikiError::MissingCredentials(CONNECTOR_NAME))
    }

    /// Every page of the target.
    pub fn load_from_state(&self) -> WikiResult<DocBatchCursor<'_>> {
        Ok(DocBatchCursor::new(self, self.api()?, None))
    }

    /// Pages last modified within `[start, end]` (UNIX seconds, inclusive).
    pub fn poll_source(&self, start: i64, end: i64) -> WikiResult<DocBatchCursor<'_>> {
        let api = self.api()?;
        let window = TimeWindow::from_unix(start, end)?;
        Ok(DocBatchCursor::new(self, api, Some(window)))
    }

    /// Apply the continue-on-failure policy to a sub-fetch.
    fn tolerate<T: Default>(&self, result: WikiResult<T>, what: &str) -> WikiResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if self.config.continue_on_failure => {
                error!(error = %e, "ran into exception when fetching {what} from Confluence");
                Ok(T::default())
            }
            Err(e) => Err(e),
        }
    }

    // ---------- page fetching ----------

    async fn fetch_space(&self, api: &dyn WikiApi, start: usize) -> WikiResult<FetchedPages> {
        let space = self.source.space.as_str();
        let batch_size = self.config.batch_size;
        let status = self.config.index_only_active_pages.then_some("current");

        let e = match api
            .get_space_pages(space, start, batch_size, status, BodyFormat::Storage)
            .await
        {
            Ok(pages) => return Ok(pages.into()),
            Err(e) => e,
        };
        warn!(
            space,
            offset = start,
            batch_size,
            error = %e,
            "batch failed, processing pages individually"
        );

        let mut fetched = FetchedPages::default();
        for ind in start..start + batch_size {
            let pages = match api
                .get_space_pages(space, ind, 1, status, BodyFormat::Storage)
                .await
            {
                Ok(pages) => pages,
                Err(e) if e.is_http_status() => {
                    // Some pages fail to expand their storage body; the
                    // rendered view is less complete but loads.
                    warn!(
                        space,
                        offset = ind,
                        error = %e,
                        "page failed, trying view representation"
                    );
                    match api
                        .get_space_pages(space, ind, 1, None, BodyFormat::View)
                        .await
                    {
                        Ok(pages) => pages,
                        Err(e) if self.config.continue_on_failure => {
                            error!(
                                space,
                                offset = ind,
                                error = %e,
                                "page failed in both representations, skipping"
                            );
                            fetched.slots += 1;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            };
            if pages.is_empty() {
                break;
            }
            fetched.slots += pages.len();
            fetched.pages.extend(pages);
        }
        Ok(fetched)
    }

    // ---------- page processing ----------

    /// Turn one page into a document, or say why not.
    pub async fn process_page(
        &self,
        api: &dyn WikiApi,
        page: &WikiPage,
        window: Option<&TimeWindow>,
    ) -> WikiResult<PageOutcome> {
        let updated_at = parse_last_modified(&page.last_modified)?;
        if let Some(window) = window {
            if !window.contains(updated_at) {
                return Ok(PageOutcome::Skipped(SkipReason::OutsideWindow));
            }
        }

        let labels = if !self.labels_to_skip.is_empty() || !self.config.skip_label_indexing {
            self.tolerate(api.get_page_labels(&page.id).await, "labels")?
        } else {
            Vec::new()
        };
        let disallowed: Vec<String> = labels
            .iter()
            .filter(|l| self.labels_to_skip.contains(*l))
            .cloned()
            .collect();
        if !disallowed.is_empty() {
            info!(
                page_id = %page.id,
                labels = ?disallowed,
                "page has a label designated as disallowed, skipping"
            );
            return Ok(PageOutcome::Skipped(SkipReason::DisallowedLabel(disallowed)));
        }

        let page_url = format!("{}{}", self.source.base_url, page.web_path);
        let Some(html) = page.body_html().filter(|h| !h.trim().is_empty()) else {
            debug!(url = %page_url, "page is empty, skipping");
            return Ok(PageOutcome::Skipped(SkipReason::EmptyContent));
        };

        let mut page_text = self.render(api, html).await;
        let files_in_use = text::used_attachments(html);
        let attachment_text = self.tolerate(
            self.attachment_text(api, &page.id, &files_in_use).await,
            "attachments",
        )?;
        if !attachment_text.is_empty() {
            page_text.push('\n');
            page_text.push_str(&attachment_text);
        }
        page_text.push_str(&self.tolerate(self.comment_text(api, &page.id).await, "comments")?);

        let mut metadata = BTreeMap::new();
        metadata.insert(
            SPACE_NAME_KEY.to_string(),
            MetadataValue::Text(self.source.space.clone()),
        );
        if !self.config.skip_label_indexing && !labels.is_empty() {
            metadata.insert(LABELS_KEY.to_string(), MetadataValue::List(labels));
        }

        Ok(PageOutcome::Indexed(NormalizedDocument {
            id: page_url.clone(),
            sections: vec![Section {
                link: page_url,
                text: page_text,
            }],
            source: SOURCE_CONFLUENCE.to_string(),
            semantic_identifier: page.title.clone(),
            updated_at,
            owner_email: page.author_email.clone(),
            metadata,
        }))
    }

    /// Plain text with `@DisplayName` in place of user references.
    async fn render(&self, api: &dyn WikiApi, html: &str) -> String {
        let user_ids = text::mentioned_user_ids(html);
        let names = self.users.resolve_all(api, &user_ids).await;
        text::render_page_text(html, &names)
    }

    async fn attachment_text(
        &self,
        api: &dyn WikiApi,
        page_id: &str,
        files_in_use: &[String],
    ) -> WikiResult<String> {
        let threshold = self.config.attachment_size_threshold;
        let mut texts = Vec::new();
        for attachment in api.get_attachments(page_id, 0, ATTACHMENT_LIMIT).await? {
            if is_media(&attachment.media_type) {
                continue;
            }
            if !files_in_use.contains(&attachment.title) {
                continue;
            }
            if attachment.file_size > threshold {
                warn!(
                    attachment = %attachment.title,
                    size = attachment.file_size,
                    threshold,
                    "skipping attachment due to size"
                );
                continue;
            }
            let Some(bytes) = api.download_attachment(&attachment.download_path).await? else {
                continue;
            };
            match extract_attachment_text(&attachment.title, &attachment.media_type, &bytes) {
                Ok(Some(extracted)) => texts.push(extracted),
                Ok(None) => debug!(attachment = %attachment.title, "no text extracted"),
                Err(e) => warn!(attachment = %attachment.title, error = %e, "extraction failed"),
            }
        }
        Ok(texts.join("\n"))
    }

    /// Comment threads in depth-first order, each comment before its replies.
    async fn comment_text(&self, api: &dyn WikiApi, page_id: &str) -> WikiResult<String> {
        let mut out = String::new();
        let mut stack = api.get_child_comments(page_id).await?;
        stack.reverse();
        while let Some(comment) = stack.pop() {
            out.push_str("\nComment:\n");
            out.push_str(&self.render(api, comment.body_html().unwrap_or_default()).await);
            let mut replies = api.get_child_comments(&comment.id).await?;
            replies.reverse();
            stack.extend(replies);
        }
        Ok(out)
    }
}

fn is_media(media_type: &str) -> bool {
    media_type.starts_with("image/") || media_type.starts_with("video/")
}

/// Parse a last-modified stamp. Offsets are converted to UTC; stamps
/// without one are taken as UTC.
pub fn parse_last_modified(raw: &str) -> WikiResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| WikiError::Decode(format!("bad last-modified timestamp '{raw}': {e}")))
}

// ============ Cursor ============

/// Pull-based sequence of document batches.
///
/// Each call to [`next_batch`](Self::next_batch) fetches pages until at
/// least one document comes out or the source is exhausted. After `None`
/// or an error the cursor stays finished.
pub struct DocBatchCursor<'a> {
    connector: &'a ConfluenceConnector,
    api: Arc<dyn WikiApi>,
    window: Option<TimeWindow>,
    offset: usize,
    tree: Option<RecursiveIndexer>,
    done: bool,
}

impl<'a> DocBatchCursor<'a> {
    fn new(
        connector: &'a ConfluenceConnector,
        api: Arc<dyn WikiApi>,
        window: Option<TimeWindow>,
    ) -> Self {
        Self {
            connector,
            api,
            window,
            offset: 0,
            tree: None,
            done: false,
        }
    }

    /// The next non-empty batch, or `None` at the end.
    pub async fn next_batch(&mut self) -> WikiResult<Option<Vec<NormalizedDocument>>> {
        while !self.done {
            match self.step().await {
                Ok(docs) if docs.is_empty() => continue,
                Ok(docs) => return Ok(Some(docs)),
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Drain the cursor into one list.
    pub async fn collect_all(mut self) -> WikiResult<Vec<NormalizedDocument>> {
        let mut all = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            all.extend(batch);
        }
        Ok(all)
    }

    async fn step(&mut self) -> WikiResult<Vec<NormalizedDocument>> {
        let FetchedPages { pages, slots } = self.fetch_pages().await?;
        self.offset += slots;
        if slots < self.connector.config.batch_size {
            self.done = true;
        }

        let connector = self.connector;
        let api = self.api.as_ref();
        let mut docs = Vec::new();
        for page in &pages {
            let outcome = connector
                .process_page(api, page, self.window.as_ref())
                .await;
            match connector.tolerate(outcome.map(Some), "page")? {
                Some(PageOutcome::Indexed(doc)) => docs.push(doc),
                Some(PageOutcome::Skipped(reason)) => {
                    debug!(page_id = %page.id, ?reason, "page skipped")
                }
                None => {}
            }
        }
        Ok(docs)
    }

    /// Pages at the current offset. With continue-on-failure, a failing
    /// fetch is retried `batch_size` times and then yields nothing.
    async fn fetch_pages(&mut self) -> WikiResult<FetchedPages> {
        let continue_on_failure = self.connector.config.continue_on_failure;
        match self.fetch_pages_once().await {
            Ok(pages) => return Ok(pages),
            Err(e) if !continue_on_failure => return Err(e),
            Err(e) => {
                error!(error = %e, offset = self.offset, "ran into exception when fetching pages")
            }
        }
        for attempt in 0..self.connector.config.batch_size {
            match self.fetch_pages_once().await {
                Ok(pages) => return Ok(pages),
                Err(e) => error!(
                    error = %e,
                    offset = self.offset,
                    attempt = attempt + 1,
                    "ran into exception when fetching pages"
                ),
            }
        }
        Ok(FetchedPages::default())
    }

    async fn fetch_pages_once(&mut self) -> WikiResult<FetchedPages> {
        let connector = self.connector;
        let api = Arc::clone(&self.api);
        if connector.is_space_scan() {
            return connector.fetch_space(api.as_ref(), self.offset).await;
        }

        let origin = connector.source.page_id.as_str();
        if !connector.config.index_recursively {
            if self.offset > 0 {
                return Ok(FetchedPages::default());
            }
            return Ok(vec![fetch_origin_page(api.as_ref(), origin).await?].into());
        }

        if self.tree.is_none() {
            let mut tree =
                RecursiveIndexer::build(api.as_ref(), origin, connector.config.batch_size).await;
            let failures = std::mem::take(&mut tree.failures);
            info!(
                origin,
                pages = tree.pages().len(),
                failed_nodes = failures.len(),
                "page tree materialized"
            );
            let mut failures = failures.into_iter();
            if !connector.config.continue_on_failure {
                if let Some(failure) = failures.next() {
                    return Err(failure.error);
                }
            }
            for failure in failures {
                warn!(
                    page_id = %failure.page_id,
                    offset = failure.offset,
                    error = %failure.error,
                    "children of page skipped"
                );
            }
            self.tree = Some(tree);
        }

        let batch_size = connector.config.batch_size;
        Ok(self
            .tree
            .as_ref()
            .map(|tree| tree.get_pages(self.offset, batch_size).to_vec())
            .unwrap_or_default()
            .into())
    }
}
