use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::context::{
    BrowsingContext, CookieInfo, ExtractionRequest, NavigationTicket, PageInfo, PageSnapshot,
};
use super::error::{Result, ScrapeError};

#[derive(Debug, Clone, Default)]
pub enum MockReply {
    #[default]
    Silent,
    Json(Value),
    Hang,
    Fail(String),
}

#[derive(Debug, Clone, Default)]
pub struct MockPage {
    pub title: String,
    pub text: String,
    pub html: String,
    pub reply: MockReply,
    pub never_loads: bool,
    pub error_marker: bool,
}

impl MockPage {
    pub fn listing(urls: &[&str], page_number: u32) -> Self {
        Self {
            title: "Real Estate & Property for Sale".to_string(),
            reply: MockReply::Json(json!({
                "success": true,
                "data": { "urls": urls, "pageNumber": page_number }
            })),
            ..Self::default()
        }
    }

    pub fn detail(details: Value) -> Self {
        Self {
            title: "House for Sale".to_string(),
            reply: MockReply::Json(json!({ "success": true, "data": details })),
            ..Self::default()
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            title: "429 Too Many Requests".to_string(),
            text: "Too many requests. Please try again later.".to_string(),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct Inner {
    pages: HashMap<String, VecDeque<MockPage>>,
    current_url: String,
    current: MockPage,
    navigations: Vec<String>,
    requests: Vec<ExtractionRequest>,
    snapshots: usize,
    cookies: Vec<CookieInfo>,
    deleted: Vec<String>,
    fail_cookies: bool,
    cancel_after: Option<(usize, CancellationToken)>,
}

#[derive(Default)]
pub struct ScriptedContext {
    inner: Mutex<Inner>,
}

impl ScriptedContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn page(&self, url: &str, page: MockPage) -> &Self {
        self.lock()
            .pages
            .entry(url.to_string())
            .or_default()
            .push_back(page);
        self
    }

    pub fn set_cookies(&self, cookies: &[(&str, &str)]) {
        self.lock().cookies = cookies
            .iter()
            .map(|(name, domain)| CookieInfo {
                name: name.to_string(),
                domain: domain.to_string(),
            })
            .collect();
    }

    pub fn fail_cookie_calls(&self) {
        self.lock().fail_cookies = true;
    }

    pub fn cancel_after_navigations(&self, count: usize, token: CancellationToken) {
        self.lock().cancel_after = Some((count, token));
    }

    pub fn deleted_cookies(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.lock().navigations.clone()
    }

    pub fn visits_to(&self, url: &str) -> usize {
        self.lock().navigations.iter().filter(|u| *u == url).count()
    }

    pub fn requests(&self) -> Vec<ExtractionRequest> {
        self.lock().requests.clone()
    }

    pub fn snapshots(&self) -> usize {
        self.lock().snapshots
    }

    pub fn current_url(&self) -> String {
        self.lock().current_url.clone()
    }
}

#[async_trait]
impl BrowsingContext for ScriptedContext {
    async fn begin_navigation(&self, url: &str) -> Result<NavigationTicket> {
        let mut inner = self.lock();
        inner.navigations.push(url.to_string());
        let page = match inner.pages.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => MockPage::default(),
        };
        inner.current = page;
        inner.current_url = url.to_string();
        let count = inner.navigations.len();
        if let Some((after, token)) = &inner.cancel_after {
            if count >= *after {
                token.cancel();
            }
        }
        Ok(NavigationTicket {
            url: url.to_string(),
            token: count.to_string(),
        })
    }

    async fn load_complete(&self, _ticket: &NavigationTicket) -> Result<bool> {
        Ok(!self.lock().current.never_loads)
    }

    async fn page_info(&self) -> Result<PageInfo> {
        let inner = self.lock();
        Ok(PageInfo {
            url: inner.current_url.clone(),
            title: inner.current.title.clone(),
        })
    }

    async fn page_text(&self) -> Result<String> {
        Ok(self.lock().current.text.clone())
    }

    async fn has_error_marker(&self) -> Result<bool> {
        Ok(self.lock().current.error_marker)
    }

    async fn install_script(&self) -> Result<()> {
        Ok(())
    }

    async fn send_request(&self, request: &ExtractionRequest) -> Result<Option<Value>> {
        let reply = {
            let mut inner = self.lock();
            inner.requests.push(*request);
            inner.current.reply.clone()
        };
        match reply {
            MockReply::Silent => Ok(None),
            MockReply::Json(value) => Ok(Some(value)),
            MockReply::Fail(message) => Err(ScrapeError::WebDriver(message)),
            MockReply::Hang => std::future::pending().await,
        }
    }

    async fn snapshot(&self) -> Result<PageSnapshot> {
        let mut inner = self.lock();
        inner.snapshots += 1;
        if inner.current.html.is_empty() {
            return Err(ScrapeError::WebDriver("empty rendered snapshot".to_string()));
        }
        Ok(PageSnapshot {
            url: inner.current_url.clone(),
            title: inner.current.title.clone(),
            html: inner.current.html.clone(),
            text: inner.current.text.clone(),
        })
    }

    async fn cookies(&self) -> Result<Vec<CookieInfo>> {
        let inner = self.lock();
        if inner.fail_cookies {
            return Err(ScrapeError::WebDriver("no such window".to_string()));
        }
        Ok(inner.cookies.clone())
    }

    async fn delete_cookie(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_cookies {
            return Err(ScrapeError::WebDriver("no such window".to_string()));
        }
        inner.deleted.push(name.to_string());
        inner.cookies.retain(|c| c.name != name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
