use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationTicket {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CookieInfo {
    pub name: String,
    #[serde(default)]
    pub domain: String,
}

/// Request delivered to the page-script. Serializes as
/// `{"mode": "collectUrls", "pageNumber": 3}` or
/// `{"mode": "collectDetails", "propertyIndex": 12}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum ExtractionRequest {
    #[serde(rename_all = "camelCase")]
    CollectUrls { page_number: u32 },
    #[serde(rename_all = "camelCase")]
    CollectDetails { property_index: usize },
}

#[async_trait]
pub trait BrowsingContext: Send + Sync {
    async fn begin_navigation(&self, url: &str) -> Result<NavigationTicket>;

    async fn load_complete(&self, ticket: &NavigationTicket) -> Result<bool>;

    async fn page_info(&self) -> Result<PageInfo>;

    async fn page_text(&self) -> Result<String>;

    async fn has_error_marker(&self) -> Result<bool>;

    async fn install_script(&self) -> Result<()>;

    /// Hands `request` to the installed page-script and waits for its reply.
    /// `None` means nothing answered.
    async fn send_request(&self, request: &ExtractionRequest) -> Result<Option<Value>>;

    async fn snapshot(&self) -> Result<PageSnapshot>;

    async fn cookies(&self) -> Result<Vec<CookieInfo>>;

    async fn delete_cookie(&self, name: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_use_the_page_wire_format() {
        assert_eq!(
            serde_json::to_value(ExtractionRequest::CollectUrls { page_number: 3 }).unwrap(),
            json!({"mode": "collectUrls", "pageNumber": 3})
        );
        assert_eq!(
            serde_json::to_value(ExtractionRequest::CollectDetails { property_index: 12 }).unwrap(),
            json!({"mode": "collectDetails", "propertyIndex": 12})
        );
    }
}
