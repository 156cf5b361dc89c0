//! Integration tests for the wiki crawler.
//!
//! A fake [`WikiApi`] serves a small wiki from memory so the connector,
//! recursive indexer and cursor run end-to-end without a network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use wiki_harness::config::{parse_config, ConfluenceConnectorConfig};
use wiki_harness::confluence::{ConfluenceConnector, RecursiveIndexer, UserNameCache};
use wiki_harness::error::{WikiError, WikiResult};
use wiki_harness::models::{
    BodyFormat, MetadataValue, NormalizedDocument, WikiAttachment, WikiPage,
};
use wiki_harness::traits::WikiApi;

const SPACE_URL: &str = "https://acme.atlassian.net/wiki/spaces/ENG";

// ─── Fake wiki ──────────────────────────────────────────────────────

#[derive(Default)]
struct FakeWiki {
    pages: HashMap<String, WikiPage>,
    children: HashMap<String, Vec<String>>,
    failing_children: HashSet<String>,
    space: Vec<String>,
    fail_space_listing: bool,
    /// Listing calls for more than one page fail.
    fail_multi_page_listing: bool,
    /// Single-page offsets whose storage body cannot be expanded.
    storage_failing_offsets: HashSet<usize>,
    /// Single-page offsets whose view body cannot be expanded either.
    view_failing_offsets: HashSet<usize>,
    labels: HashMap<String, Vec<String>>,
    comments: HashMap<String, Vec<WikiPage>>,
    users: HashMap<String, String>,
    attachments: HashMap<String, Vec<WikiAttachment>>,
    files: HashMap<String, Vec<u8>>,
    label_calls: AtomicUsize,
    user_calls: AtomicUsize,
}

fn page(id: &str, body: &str, last_modified: &str) -> WikiPage {
    WikiPage {
        id: id.to_string(),
        title: id.to_string(),
        body_storage: Some(body.to_string()),
        body_view: None,
        last_modified: last_modified.to_string(),
        author_email: Some(format!("{}@acme.io", id.to_lowercase())),
        web_path: format!("/spaces/ENG/pages/{id}"),
    }
}

fn at(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .unwrap()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

impl FakeWiki {
    fn add(&mut self, p: WikiPage) {
        self.pages.insert(p.id.clone(), p);
    }

    fn add_to_space(&mut self, p: WikiPage) {
        self.space.push(p.id.clone());
        self.add(p);
    }

    fn failed(url: &str) -> WikiError {
        WikiError::UpstreamFetchFailed {
            status: 500,
            url: url.to_string(),
        }
    }
}

fn window<T: Clone>(items: &[T], start: usize, limit: usize) -> Vec<T> {
    items.iter().skip(start).take(limit).cloned().collect()
}

#[async_trait]
impl WikiApi for FakeWiki {
    async fn get_page_by_id(&self, page_id: &str, _format: BodyFormat) -> WikiResult<WikiPage> {
        self.pages
            .get(page_id)
            .cloned()
            .ok_or_else(|| WikiError::UpstreamFetchFailed {
                status: 404,
                url: format!("/rest/api/content/{page_id}"),
            })
    }

    async fn get_child_pages(
        &self,
        page_id: &str,
        start: usize,
        limit: usize,
    ) -> WikiResult<Vec<WikiPage>> {
        if self.failing_children.contains(page_id) {
            return Err(Self::failed(&format!("/rest/api/content/{page_id}/child/page")));
        }
        let ids = self.children.get(page_id).cloned().unwrap_or_default();
        Ok(window(&ids, start, limit)
            .iter()
            .filter_map(|id| self.pages.get(id).cloned())
            .collect())
    }

    async fn get_child_comments(&self, content_id: &str) -> WikiResult<Vec<WikiPage>> {
        Ok(self.comments.get(content_id).cloned().unwrap_or_default())
    }

    async fn get_space_pages(
        &self,
        _space: &str,
        start: usize,
        limit: usize,
        _status: Option<&str>,
        format: BodyFormat,
    ) -> WikiResult<Vec<WikiPage>> {
        if self.fail_space_listing || (self.fail_multi_page_listing && limit > 1) {
            return Err(Self::failed("/rest/api/content"));
        }
        let failing = match format {
            BodyFormat::Storage => &self.storage_failing_offsets,
            BodyFormat::View => &self.view_failing_offsets,
        };
        if limit == 1 && failing.contains(&start) {
            return Err(Self::failed(&format!("/rest/api/content?start={start}")));
        }
        Ok(window(&self.space, start, limit)
            .iter()
            .filter_map(|id| self.pages.get(id).cloned())
            .map(|mut p| {
                if format == BodyFormat::View {
                    p.body_storage = None;
                    p.body_view = Some(format!("<div><p>Rendered {}</p></div>", p.id));
                }
                p
            })
            .collect())
    }

    async fn get_page_labels(&self, page_id: &str) -> WikiResult<Vec<String>> {
        self.label_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.labels.get(page_id).cloned().unwrap_or_default())
    }

    async fn get_attachments(
        &self,
        page_id: &str,
        start: usize,
        limit: usize,
    ) -> WikiResult<Vec<WikiAttachment>> {
        let all = self.attachments.get(page_id).cloned().unwrap_or_default();
        Ok(window(&all, start, limit))
    }

    async fn download_attachment(&self, download_path: &str) -> WikiResult<Option<Vec<u8>>> {
        Ok(self.files.get(download_path).cloned())
    }

    async fn get_user_display_name(&self, user_id: &str) -> WikiResult<Option<String>> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(self.users.get(user_id).cloned())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

/// Log output for a failing test: `RUST_LOG=wiki_harness=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn connector(config: ConfluenceConnectorConfig, wiki: &Arc<FakeWiki>) -> ConfluenceConnector {
    init_tracing();
    let mut connector = ConfluenceConnector::new(config).unwrap();
    connector.attach_api(wiki.clone());
    connector
}

fn titles(docs: &[NormalizedDocument]) -> Vec<String> {
    docs.iter().map(|d| d.semantic_identifier.clone()).collect()
}

fn text_of(doc: &NormalizedDocument) -> &str {
    &doc.sections[0].text
}

/// R has children [A, B]; A has children [C, D].
fn tree_wiki() -> FakeWiki {
    let mut wiki = FakeWiki::default();
    for id in ["R", "A", "B", "C", "D"] {
        wiki.add(page(id, &format!("<p>Body of {id}</p>"), &at(1_700_000_000)));
    }
    wiki.children
        .insert("R".to_string(), vec!["A".to_string(), "B".to_string()]);
    wiki.children
        .insert("A".to_string(), vec!["C".to_string(), "D".to_string()]);
    wiki
}

const TREE_URL: &str = "https://acme.atlassian.net/wiki/spaces/ENG/pages/R/Root";

// ─── URL handling ───────────────────────────────────────────────────

#[test]
fn test_cloud_and_self_hosted_keys() {
    let cloud = ConfluenceConnector::new(ConfluenceConnectorConfig::new(
        "https://acme.atlassian.net/wiki/spaces/ENG/pages/123456/Handbook",
    ))
    .unwrap();
    let source = cloud.source();
    assert_eq!(source.base_url, "https://acme.atlassian.net/wiki");
    assert_eq!(source.space, "ENG");
    assert_eq!(source.page_id, "123456");
    assert!(source.is_cloud);
    assert!(!cloud.is_space_scan());

    let server = ConfluenceConnector::new(ConfluenceConnectorConfig::new(
        "https://wiki.acme.io/display/OPS/pages/777/Runbooks",
    ))
    .unwrap();
    let source = server.source();
    assert_eq!(source.base_url, "https://wiki.acme.io");
    assert_eq!(source.space, "OPS");
    assert_eq!(source.page_id, "777");
    assert!(!source.is_cloud);
}

#[test]
fn test_url_without_page_is_space_scan() {
    let connector = ConfluenceConnector::new(ConfluenceConnectorConfig::new(SPACE_URL)).unwrap();
    assert_eq!(connector.source().page_id, "");
    assert!(connector.is_space_scan());
}

#[test]
fn test_invalid_url_is_fatal() {
    let err = ConfluenceConnector::new(ConfluenceConnectorConfig::new(
        "https://acme.io/some/random/page",
    ))
    .err()
    .unwrap();
    assert!(matches!(err, WikiError::InvalidSourceUrl(_)));
}

#[test]
fn test_connector_from_config() {
    let config = parse_config(
        r#"
[confluence]
wiki_page_url = "https://wiki.acme.io/display/OPS/pages/777/Runbooks"
index_recursively = false

[rate_limit]
max_retries = 2
"#,
    )
    .unwrap();
    let connector = ConfluenceConnector::from_config(&config).unwrap();
    assert_eq!(connector.source().space, "OPS");
    assert!(!connector.source().is_cloud);
}

#[test]
fn test_missing_credentials() {
    let connector = ConfluenceConnector::new(ConfluenceConnectorConfig::new(SPACE_URL)).unwrap();
    assert!(matches!(
        connector.load_from_state().err(),
        Some(WikiError::MissingCredentials(_))
    ));
    assert!(matches!(
        connector.poll_source(0, 100).err(),
        Some(WikiError::MissingCredentials(_))
    ));
}

// ─── Recursive page scan ────────────────────────────────────────────

#[tokio::test]
async fn test_recursive_tree_each_page_once() {
    let wiki = Arc::new(tree_wiki());
    let mut config = ConfluenceConnectorConfig::new(TREE_URL);
    config.batch_size = 2;
    let connector = connector(config, &wiki);

    let mut cursor = connector.load_from_state().unwrap();
    let mut batch_sizes = Vec::new();
    let mut docs = Vec::new();
    while let Some(batch) = cursor.next_batch().await.unwrap() {
        batch_sizes.push(batch.len());
        docs.extend(batch);
    }
    assert_eq!(batch_sizes, vec![2, 2, 1]);

    let mut ids = titles(&docs);
    ids.sort();
    assert_eq!(ids, vec!["A", "B", "C", "D", "R"]);
    // Origin page comes last.
    assert_eq!(docs.last().unwrap().semantic_identifier, "R");
}

#[tokio::test]
async fn test_origin_present_when_children_fail() {
    let mut wiki = tree_wiki();
    wiki.failing_children.insert("R".to_string());
    let wiki = Arc::new(wiki);

    let tree = RecursiveIndexer::build(wiki.as_ref(), "R", 16).await;
    let ids: Vec<&str> = tree.pages().iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["R"]);
    assert_eq!(tree.failures.len(), 1);
    assert_eq!(tree.failures[0].page_id, "R");

    let mut config = ConfluenceConnectorConfig::new(TREE_URL);
    config.continue_on_failure = true;
    let docs = connector(config, &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(titles(&docs), vec!["R"]);
}

#[tokio::test]
async fn test_leaf_failure_keeps_rest_of_tree() {
    let mut wiki = tree_wiki();
    wiki.failing_children.insert("B".to_string());
    let tree = RecursiveIndexer::build(&wiki, "R", 16).await;
    let mut ids: Vec<&str> = tree.pages().iter().map(|p| p.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["A", "B", "C", "D", "R"]);
    assert_eq!(tree.failures.len(), 1);
}

#[tokio::test]
async fn test_child_failure_propagates_without_continue() {
    let mut wiki = tree_wiki();
    wiki.failing_children.insert("A".to_string());
    let wiki = Arc::new(wiki);
    let result = connector(ConfluenceConnectorConfig::new(TREE_URL), &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await;
    assert!(matches!(result, Err(WikiError::UpstreamFetchFailed { .. })));
}

#[tokio::test]
async fn test_non_recursive_indexes_origin_only() {
    let wiki = Arc::new(tree_wiki());
    let mut config = ConfluenceConnectorConfig::new(TREE_URL);
    config.index_recursively = false;
    let docs = connector(config, &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(titles(&docs), vec!["R"]);
    assert_eq!(docs[0].id, "https://acme.atlassian.net/wiki/spaces/ENG/pages/R");
}

// ─── Space scan and filters ─────────────────────────────────────────

#[tokio::test]
async fn test_space_scan_paginates_until_short_page() {
    let mut wiki = FakeWiki::default();
    for i in 0..5 {
        wiki.add_to_space(page(&format!("P{i}"), "<p>text</p>", &at(1_700_000_000)));
    }
    let wiki = Arc::new(wiki);
    let mut config = ConfluenceConnectorConfig::new(SPACE_URL);
    config.batch_size = 2;
    let docs = connector(config, &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(titles(&docs), vec!["P0", "P1", "P2", "P3", "P4"]);

    let doc = &docs[0];
    assert_eq!(doc.source, "confluence");
    assert_eq!(doc.owner_email.as_deref(), Some("p0@acme.io"));
    assert_eq!(
        doc.metadata.get("Wiki Space Name"),
        Some(&MetadataValue::Text("ENG".to_string()))
    );
}

#[tokio::test]
async fn test_poll_window_is_inclusive() {
    let mut wiki = FakeWiki::default();
    for (id, ts) in [("early", 99), ("start", 100), ("mid", 150), ("end", 200), ("late", 201)] {
        wiki.add_to_space(page(id, "<p>text</p>", &at(ts)));
    }
    let wiki = Arc::new(wiki);
    let docs = connector(ConfluenceConnectorConfig::new(SPACE_URL), &wiki)
        .poll_source(100, 200)
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(titles(&docs), vec!["start", "mid", "end"]);
    // Pages outside the window never get their labels fetched.
    assert_eq!(wiki.label_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_disallowed_label_skips_page() {
    let mut wiki = FakeWiki::default();
    wiki.add_to_space(page("open", "<p>text</p>", &at(150)));
    wiki.add_to_space(page("hidden", "<p>text</p>", &at(150)));
    wiki.labels
        .insert("open".to_string(), vec!["howto".to_string()]);
    wiki.labels.insert(
        "hidden".to_string(),
        vec!["howto".to_string(), "secret".to_string()],
    );
    let wiki = Arc::new(wiki);

    let mut config = ConfluenceConnectorConfig::new(SPACE_URL);
    config.labels_to_skip = vec!["secret".to_string()];
    let docs = connector(config, &wiki)
        .poll_source(100, 200)
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(titles(&docs), vec!["open"]);
    assert_eq!(
        docs[0].metadata.get("labels"),
        Some(&MetadataValue::List(vec!["howto".to_string()]))
    );
}

#[tokio::test]
async fn test_skip_label_indexing_avoids_label_calls() {
    let mut wiki = FakeWiki::default();
    wiki.add_to_space(page("p", "<p>text</p>", &at(150)));
    wiki.labels.insert("p".to_string(), vec!["howto".to_string()]);
    let wiki = Arc::new(wiki);

    let mut config = ConfluenceConnectorConfig::new(SPACE_URL);
    config.skip_label_indexing = true;
    let docs = connector(config, &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert!(!docs[0].metadata.contains_key("labels"));
    assert_eq!(wiki.label_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_empty_pages_are_skipped() {
    let mut wiki = FakeWiki::default();
    wiki.add_to_space(page("blank", "   ", &at(150)));
    let mut no_body = page("nobody", "", &at(150));
    no_body.body_storage = None;
    wiki.add_to_space(no_body);
    wiki.add_to_space(page("full", "<p>content</p>", &at(150)));
    let wiki = Arc::new(wiki);

    let docs = connector(ConfluenceConnectorConfig::new(SPACE_URL), &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(titles(&docs), vec!["full"]);
}

// ─── Page text ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_comments_depth_first() {
    let mut wiki = FakeWiki::default();
    wiki.add_to_space(page("P", "<p>Page body</p>", &at(150)));
    let comment = |id: &str, text: &str| page(id, &format!("<p>{text}</p>"), &at(150));
    wiki.comments.insert(
        "P".to_string(),
        vec![comment("c1", "first"), comment("c2", "second")],
    );
    wiki.comments
        .insert("c1".to_string(), vec![comment("c1a", "first reply")]);
    wiki.comments
        .insert("c1a".to_string(), vec![comment("c1a1", "nested reply")]);
    let wiki = Arc::new(wiki);

    let docs = connector(ConfluenceConnectorConfig::new(SPACE_URL), &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    let text = text_of(&docs[0]);
    assert!(text.starts_with("Page body"));
    assert_eq!(text.matches("\nComment:\n").count(), 4);

    let order: Vec<usize> = ["first", "first reply", "nested reply", "second"]
        .iter()
        .map(|needle| text.find(&format!("Comment:\n{needle}")).unwrap())
        .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]), "order: {order:?}");
}

#[tokio::test]
async fn test_mentions_resolved_and_cached() {
    let mut wiki = FakeWiki::default();
    let body = r#"<p>Owner: <ac:link><ri:user ri:account-id="u1" /></ac:link></p><p>Backup: <ac:link><ri:user ri:account-id="ghost" /></ac:link></p>"#;
    wiki.add_to_space(page("one", body, &at(150)));
    wiki.add_to_space(page("two", body, &at(150)));
    wiki.users.insert("u1".to_string(), "Ada Lovelace".to_string());
    let wiki = Arc::new(wiki);

    let docs = connector(ConfluenceConnectorConfig::new(SPACE_URL), &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(docs.len(), 2);
    for doc in &docs {
        assert!(text_of(doc).contains("@Ada Lovelace"));
        assert!(text_of(doc).contains("@Unknown User"));
    }
    // Two distinct ids, each looked up once across both pages.
    assert_eq!(wiki.user_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_user_lookups_share_one_call() {
    let mut wiki = FakeWiki::default();
    wiki.users
        .insert("u1".to_string(), "Ada Lovelace".to_string());
    let wiki = Arc::new(wiki);
    let cache = UserNameCache::default();

    let (first, second) = tokio::join!(
        cache.display_name(&*wiki, "u1"),
        cache.display_name(&*wiki, "u1")
    );
    assert_eq!(first, "Ada Lovelace");
    assert_eq!(second, "Ada Lovelace");
    assert_eq!(wiki.user_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_user_names_expire_after_ttl() {
    let mut wiki = FakeWiki::default();
    wiki.users
        .insert("u1".to_string(), "Ada Lovelace".to_string());
    let wiki = Arc::new(wiki);
    let cache = UserNameCache::new(Some(Duration::from_millis(50)));

    assert_eq!(cache.display_name(&*wiki, "u1").await, "Ada Lovelace");
    assert_eq!(cache.display_name(&*wiki, "u1").await, "Ada Lovelace");
    assert_eq!(wiki.user_calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.display_name(&*wiki, "u1").await, "Ada Lovelace");
    assert_eq!(wiki.user_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_referenced_attachments_are_appended() {
    let mut wiki = FakeWiki::default();
    let body = r#"<p>See <ac:link><ri:attachment ri:filename="notes.txt" /></ac:link>
        and <ac:image><ri:attachment ri:filename="shot.png" /></ac:image></p>"#;
    wiki.add_to_space(page("P", body, &at(150)));
    let attachment = |title: &str, media_type: &str, size: u64| WikiAttachment {
        title: title.to_string(),
        media_type: media_type.to_string(),
        file_size: size,
        download_path: format!("/download/{title}"),
    };
    wiki.attachments.insert(
        "P".to_string(),
        vec![
            attachment("notes.txt", "text/plain", 17),
            attachment("shot.png", "image/png", 10),
            attachment("unused.txt", "text/plain", 6),
        ],
    );
    wiki.files
        .insert("/download/notes.txt".to_string(), b"attached findings".to_vec());
    wiki.files
        .insert("/download/unused.txt".to_string(), b"orphan".to_vec());
    let wiki = Arc::new(wiki);

    let docs = connector(ConfluenceConnectorConfig::new(SPACE_URL), &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    let text = text_of(&docs[0]);
    assert!(text.contains("\nattached findings"));
    assert!(!text.contains("orphan"));
}

#[tokio::test]
async fn test_oversized_attachment_is_skipped() {
    let mut wiki = FakeWiki::default();
    let body = r#"<p><ac:link><ri:attachment ri:filename="big.txt" /></ac:link></p>"#;
    wiki.add_to_space(page("P", body, &at(150)));
    wiki.attachments.insert(
        "P".to_string(),
        vec![WikiAttachment {
            title: "big.txt".to_string(),
            media_type: "text/plain".to_string(),
            file_size: 2_000,
            download_path: "/download/big.txt".to_string(),
        }],
    );
    wiki.files
        .insert("/download/big.txt".to_string(), b"too large".to_vec());
    let wiki = Arc::new(wiki);

    let mut config = ConfluenceConnectorConfig::new(SPACE_URL);
    config.attachment_size_threshold = 1_000;
    let docs = connector(config, &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert!(!text_of(&docs[0]).contains("too large"));
}

// ─── Failure policy ─────────────────────────────────────────────────

#[tokio::test]
async fn test_listing_failure_propagates_by_default() {
    let wiki = Arc::new(FakeWiki {
        fail_space_listing: true,
        ..FakeWiki::default()
    });
    let connector = connector(ConfluenceConnectorConfig::new(SPACE_URL), &wiki);
    let mut cursor = connector.load_from_state().unwrap();
    assert!(cursor.next_batch().await.is_err());
    // The cursor is finished after an error.
    assert!(cursor.next_batch().await.unwrap().is_none());
}

#[tokio::test]
async fn test_listing_failure_degrades_with_continue_on_failure() {
    let wiki = Arc::new(FakeWiki {
        fail_space_listing: true,
        ..FakeWiki::default()
    });
    let mut config = ConfluenceConnectorConfig::new(SPACE_URL);
    config.continue_on_failure = true;
    config.batch_size = 3;
    let docs = connector(config, &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert!(docs.is_empty());
}

#[tokio::test]
async fn test_bad_timestamp_tolerated_with_continue_on_failure() {
    let mut wiki = FakeWiki::default();
    wiki.add_to_space(page("broken", "<p>text</p>", "last tuesday"));
    wiki.add_to_space(page("fine", "<p>text</p>", &at(150)));
    let wiki = Arc::new(wiki);

    let strict = connector(ConfluenceConnectorConfig::new(SPACE_URL), &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await;
    assert!(matches!(strict, Err(WikiError::Decode(_))));

    let mut config = ConfluenceConnectorConfig::new(SPACE_URL);
    config.continue_on_failure = true;
    let docs = connector(config, &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(titles(&docs), vec!["fine"]);
}

/// Five pages where only single-page listing calls succeed; P1 loads only
/// through its view body.
fn flaky_space_wiki() -> FakeWiki {
    let mut wiki = FakeWiki {
        fail_multi_page_listing: true,
        ..FakeWiki::default()
    };
    for i in 0..5 {
        wiki.add_to_space(page(&format!("P{i}"), &format!("<p>Body of P{i}</p>"), &at(150)));
    }
    wiki.storage_failing_offsets.insert(1);
    wiki
}

fn flaky_space_config(continue_on_failure: bool) -> ConfluenceConnectorConfig {
    let mut config = ConfluenceConnectorConfig::new(SPACE_URL);
    config.batch_size = 3;
    config.continue_on_failure = continue_on_failure;
    config
}

#[tokio::test]
async fn test_failed_batch_retried_page_by_page_with_view_fallback() {
    let wiki = Arc::new(flaky_space_wiki());
    let docs = connector(flaky_space_config(false), &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(titles(&docs), vec!["P0", "P1", "P2", "P3", "P4"]);
    assert_eq!(text_of(&docs[0]), "Body of P0");
    assert_eq!(text_of(&docs[1]), "Rendered P1");
    assert_eq!(text_of(&docs[4]), "Body of P4");
}

#[tokio::test]
async fn test_page_failing_both_representations_propagates_by_default() {
    let mut wiki = flaky_space_wiki();
    wiki.view_failing_offsets.insert(1);
    let wiki = Arc::new(wiki);
    let result = connector(flaky_space_config(false), &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await;
    assert!(matches!(
        result,
        Err(WikiError::UpstreamFetchFailed { status: 500, .. })
    ));
}

#[tokio::test]
async fn test_page_failing_both_representations_skipped_with_continue_on_failure() {
    let mut wiki = flaky_space_wiki();
    wiki.view_failing_offsets.insert(1);
    let wiki = Arc::new(wiki);
    let docs = connector(flaky_space_config(true), &wiki)
        .load_from_state()
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    // The skipped slot still advances the offset, so later pages are kept.
    assert_eq!(titles(&docs), vec!["P0", "P2", "P3", "P4"]);
}
