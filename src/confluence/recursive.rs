//! Breadth-first materialization of a page tree.
//!
//! Starting from an origin page, every level of descendants is fetched
//! before the next one. Children of a node are paged through one at a time
//! (see [`CHILD_BATCH_SIZE`]). A failing node is recorded in
//! [`RecursiveIndexer::failures`] and the walk carries on with its
//! siblings; the origin page is always appended last when it can be
//! fetched.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::error::{WikiError, WikiResult};
use crate::models::{BodyFormat, WikiPage};
use crate::traits::WikiApi;

/// Page size for child-page pagination.
///
/// The configured connector batch size is accepted but not used here: the
/// crawler has always fetched one child per request.
pub const CHILD_BATCH_SIZE: usize = 1;

/// A node whose children could not be listed.
#[derive(Debug)]
pub struct ChildFetchFailure {
    pub page_id: String,
    pub offset: usize,
    pub error: WikiError,
}

/// The materialized page tree of one crawl.
#[derive(Debug, Default)]
pub struct RecursiveIndexer {
    origin_page_id: String,
    pages: Vec<WikiPage>,
    pub failures: Vec<ChildFetchFailure>,
}

impl RecursiveIndexer {
    /// Walk the whole tree below `origin_page_id`.
    ///
    /// `_batch_size` is the connector's batch size; see [`CHILD_BATCH_SIZE`].
    pub async fn build(api: &dyn WikiApi, origin_page_id: &str, _batch_size: usize) -> Self {
        let mut indexer = Self {
            origin_page_id: origin_page_id.to_string(),
            ..Self::default()
        };
        indexer.recurse_children_pages(api).await;
        indexer
    }

    pub fn origin_page_id(&self) -> &str {
        &self.origin_page_id
    }

    /// Every collected page, descendants in level order then the origin.
    pub fn pages(&self) -> &[WikiPage] {
        &self.pages
    }

    /// Up to `size` pages starting at `offset`; empty past the end.
    pub fn get_pages(&self, offset: usize, size: usize) -> &[WikiPage] {
        match self.pages.get(offset..) {
            Some(rest) => &rest[..size.min(rest.len())],
            None => &[],
        }
    }

    async fn recurse_children_pages(&mut self, api: &dyn WikiApi) {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(self.origin_page_id.clone());

        let mut current_level = vec![self.origin_page_id.clone()];
        let mut depth = 0usize;
        while !current_level.is_empty() {
            let mut next_level = Vec::new();
            for parent_id in &current_level {
                for child in self.fetch_all_children(api, parent_id).await {
                    if visited.insert(child.id.clone()) {
                        next_level.push(child.id.clone());
                        self.pages.push(child);
                    }
                }
            }
            debug!(
                origin = %self.origin_page_id,
                depth,
                found = next_level.len(),
                "page tree level materialized"
            );
            current_level = next_level;
            depth += 1;
        }

        match fetch_origin_page(api, &self.origin_page_id).await {
            Ok(origin) => self.pages.push(origin),
            Err(e) => warn!(
                page_id = %self.origin_page_id,
                error = %e,
                "appending origin page failed"
            ),
        }
    }

    /// Page through the children of one node until an empty batch.
    async fn fetch_all_children(&mut self, api: &dyn WikiApi, page_id: &str) -> Vec<WikiPage> {
        let mut children = Vec::new();
        let mut offset = 0usize;
        loop {
            match fetch_single_depth_child_pages(api, page_id, offset, CHILD_BATCH_SIZE).await {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => {
                    offset += batch.len();
                    children.extend(batch);
                }
                Err(error) => {
                    self.failures.push(ChildFetchFailure {
                        page_id: page_id.to_string(),
                        offset,
                        error,
                    });
                    break;
                }
            }
        }
        children
    }
}

/// The origin page with its storage body.
pub async fn fetch_origin_page(api: &dyn WikiApi, page_id: &str) -> WikiResult<WikiPage> {
    api.get_page_by_id(page_id, BodyFormat::Storage).await
}

/// One batch of children. A failed batch is retried item by item; the
/// first item that still fails is returned as the error.
async fn fetch_single_depth_child_pages(
    api: &dyn WikiApi,
    page_id: &str,
    start: usize,
    batch_size: usize,
) -> WikiResult<Vec<WikiPage>> {
    match api.get_child_pages(page_id, start, batch_size).await {
        Ok(pages) => Ok(pages),
        Err(e) => {
            warn!(
                page_id,
                offset = start,
                batch_size,
                error = %e,
                "batch failed, processing pages individually"
            );
            let mut pages = Vec::new();
            for ind in start..start + batch_size {
                match api.get_child_pages(page_id, ind, 1).await {
                    Ok(batch) => pages.extend(batch),
                    Err(e) => {
                        warn!(page_id, offset = ind, error = %e, "child page fetch failed");
                        return Err(e);
                    }
                }
            }
            Ok(pages)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(id: &str) -> WikiPage {
        WikiPage {
            id: id.to_string(),
            ..WikiPage::default()
        }
    }

    #[test]
    fn test_get_pages_windows() {
        let indexer = RecursiveIndexer {
            origin_page_id: "R".to_string(),
            pages: vec![page("A"), page("B"), page("R")],
            failures: Vec::new(),
        };
        let ids = |pages: &[WikiPage]| pages.iter().map(|p| p.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(indexer.get_pages(0, 2)), vec!["A", "B"]);
        assert_eq!(ids(indexer.get_pages(2, 2)), vec!["R"]);
        assert!(indexer.get_pages(3, 2).is_empty());
        assert!(indexer.get_pages(10, 2).is_empty());
    }
}
