use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::{Position, Url};

use super::error::{Result, ScrapeError};

static PAGE_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/list-\d+(/|$)").expect("page segment pattern"));

/// A listing URL with its page-index segment removed. `search` keeps the
/// leading `?` when present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingBase {
    pub base_path: String,
    pub search: String,
}

pub fn extract_base_url(raw: &str) -> Result<ListingBase> {
    let url = Url::parse(raw.trim()).map_err(|e| ScrapeError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ScrapeError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }

    let path = PAGE_SEGMENT.replacen(url.path(), 1, "$1");
    let path = path.trim_end_matches('/');
    let base_path = format!("{}{}", &url[..Position::BeforePath], path);
    let search = url.query().map(|q| format!("?{q}")).unwrap_or_default();
    Ok(ListingBase { base_path, search })
}

pub fn construct_page_url(base: &ListingBase, page: u32) -> String {
    format!("{}/list-{}{}", base.base_path, page, base.search)
}

pub fn target_domain(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

pub fn is_on_domain(candidate: &str, domain: &str) -> bool {
    Url::parse(candidate)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .map(|host| host == domain || host.ends_with(&format!(".{domain}")))
        .unwrap_or(false)
}

pub fn filter_property_urls<I>(urls: I, domain: &str) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    urls.into_iter()
        .filter_map(|raw| {
            let trimmed = raw.trim();
            if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
                return None;
            }
            if !is_on_domain(trimmed, domain) {
                return None;
            }
            let mut url = Url::parse(trimmed).ok()?;
            url.set_fragment(None);
            Some(url.to_string())
        })
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

pub fn is_property_link(href: &str) -> bool {
    Url::parse(href)
        .map(|u| u.path().contains("/property"))
        .unwrap_or(false)
}

pub fn resolve_href(page_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("mailto:")
        || href.starts_with("javascript:")
        || href.starts_with("tel:")
    {
        return None;
    }

    let mut resolved = if href.starts_with("http://") || href.starts_with("https://") {
        Url::parse(href).ok()?
    } else {
        Url::parse(page_url).ok()?.join(href).ok()?
    };
    resolved.set_fragment(None);
    Some(resolved.to_string())
}
