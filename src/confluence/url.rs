//! Wiki URL classification and key extraction.

use reqwest::Url;
use tracing::error;

use crate::error::{WikiError, WikiResult};

const CLOUD_MARKERS: &[&str] = &[".atlassian.net/wiki/spaces/", ".jira.com/wiki/spaces/"];
const DISPLAY: &str = "/display/";
const PAGES: &str = "/pages/";

/// The crawl target named by a wiki URL.
///
/// An empty `page_id` means the whole space is scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiSource {
    /// Scheme, host and any path prefix in front of the space segment,
    /// e.g. `https://acme.atlassian.net/wiki`.
    pub base_url: String,
    pub space: String,
    pub page_id: String,
    pub is_cloud: bool,
}

impl WikiSource {
    /// Parse a space or page URL.
    ///
    /// Cloud URLs look like `https://{site}.atlassian.net/wiki/spaces/{space}/pages/{page}/{title}`;
    /// anything else is treated as self-hosted,
    /// `https://{host}/{prefix}/display/{space}/pages/{page}/{title}`.
    pub fn from_url(wiki_url: &str) -> WikiResult<Self> {
        let is_cloud = CLOUD_MARKERS.iter().any(|m| wiki_url.contains(m));
        let parsed = if is_cloud {
            parse_cloud(wiki_url)
        } else {
            parse_self_hosted(wiki_url)
        };
        parsed
            .map(|(base_url, space, page_id)| Self {
                base_url,
                space,
                page_id,
                is_cloud,
            })
            .map_err(|reason| {
                let err = WikiError::InvalidSourceUrl(reason);
                error!(url = wiki_url, "{err}");
                err
            })
    }

    /// True when no root page was given.
    pub fn is_space_scan(&self) -> bool {
        self.page_id.is_empty()
    }
}

fn origin(url: &Url) -> Result<String, String> {
    let host = url.host_str().ok_or_else(|| "URL has no host".to_string())?;
    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

fn parse_cloud(wiki_url: &str) -> Result<(String, String, String), String> {
    let url = Url::parse(wiki_url).map_err(|e| e.to_string())?;
    let path = url.path();
    let prefix = path.split("/spaces").next().unwrap_or_default();
    let base_url = format!("{}{}", origin(&url)?, prefix);

    // ["", "wiki", "spaces", space, "pages", page, ...]
    let parts: Vec<&str> = path.split('/').collect();
    let space = parts
        .get(3)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("no space segment in path '{path}'"))?
        .to_string();
    let page_id = parts.get(5).map(|p| p.to_string()).unwrap_or_default();
    Ok((base_url, space, page_id))
}

fn parse_self_hosted(wiki_url: &str) -> Result<(String, String, String), String> {
    let url = Url::parse(wiki_url).map_err(|e| e.to_string())?;
    let path = url.path();
    let (prefix, rest) = path
        .split_once(DISPLAY)
        .ok_or_else(|| format!("'{DISPLAY}' not found in path '{path}'"))?;
    let base_url = format!("{}{}", origin(&url)?, prefix);

    let space = rest.split('/').next().unwrap_or_default();
    if space.is_empty() {
        return Err(format!("no space segment in path '{path}'"));
    }
    let page_id = path
        .split_once(PAGES)
        .and_then(|(_, after)| after.split('/').next())
        .unwrap_or_default();
    Ok((base_url, space.to_string(), page_id.to_string()))
}
