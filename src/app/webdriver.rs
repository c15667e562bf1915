use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use reqwest::Method;
use serde_json::{Value, json};
use tracing::{debug, trace};

use super::context::{
    BrowsingContext, CookieInfo, ExtractionRequest, NavigationTicket, PageInfo, PageSnapshot,
};
use super::error::{Result, ScrapeError};

pub const DEFAULT_PAGE_SCRIPT: &str = include_str!("../../assets/page_extractor.js");

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum Browser {
    Chrome,
    Firefox,
    Edge,
}

fn webdriver_capabilities(browser: Browser, headless: bool) -> Value {
    match browser {
        Browser::Firefox => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("-headless".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "firefox",
                        "acceptInsecureCerts": true,
                        "pageLoadStrategy": "none",
                        "moz:firefoxOptions": { "args": args }
                    }
                }
            })
        }
        Browser::Edge => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("--headless=new".to_string());
            }
            args.push("--window-size=1400,1200".to_string());
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "MicrosoftEdge",
                        "acceptInsecureCerts": true,
                        "pageLoadStrategy": "none",
                        "ms:edgeOptions": { "args": args }
                    }
                }
            })
        }
        Browser::Chrome => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("--headless=new".to_string());
            }
            args.push("--window-size=1400,1200".to_string());
            args.push("--disable-gpu".to_string());
            args.push("--disable-dev-shm-usage".to_string());
            args.push("--no-first-run".to_string());
            args.push("--no-default-browser-check".to_string());
            if !cfg!(target_os = "macos") {
                args.push("--no-sandbox".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "acceptInsecureCerts": true,
                        "pageLoadStrategy": "none",
                        "goog:chromeOptions": { "args": args }
                    }
                }
            })
        }
    }
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}

fn parse_response(label: &str, status: reqwest::StatusCode, body: &str) -> Result<Value> {
    if !status.is_success() {
        let value: Value = serde_json::from_str(body).unwrap_or_default();
        if let Some(err) = value.pointer("/value/error").and_then(|v| v.as_str()) {
            let message = value
                .pointer("/value/message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown webdriver error");
            return Err(ScrapeError::WebDriver(format!(
                "{label} HTTP {}: {err}: {}",
                status.as_u16(),
                truncate_for_log(message, 240)
            )));
        }
        return Err(ScrapeError::WebDriver(format!(
            "{label} HTTP {}: {}",
            status.as_u16(),
            truncate_for_log(body, 240)
        )));
    }

    let value: Value = serde_json::from_str(body)
        .map_err(|e| ScrapeError::WebDriver(format!("{label} parse failed: {e}")))?;
    if let Some(err) = value.pointer("/value/error").and_then(|v| v.as_str()) {
        let message = value
            .pointer("/value/message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown webdriver error");
        return Err(ScrapeError::WebDriver(format!("{label}: {err}: {message}")));
    }
    Ok(value.get("value").cloned().unwrap_or(Value::Null))
}

pub struct WebDriverSession {
    client: reqwest::Client,
    endpoint: String,
    session_id: String,
    page_script: String,
}

impl WebDriverSession {
    pub async fn connect(
        client: reqwest::Client,
        endpoint: &str,
        browser: Browser,
        headless: bool,
        page_script: String,
        script_timeout: Duration,
    ) -> Result<Self> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let caps = webdriver_capabilities(browser, headless);
        let res = client
            .post(format!("{endpoint}/session"))
            .json(&caps)
            .send()
            .await
            .map_err(|e| ScrapeError::WebDriver(format!("session create request failed: {e}")))?;
        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| ScrapeError::WebDriver(format!("session create response read failed: {e}")))?;
        let value = parse_response("session create", status, &body)?;
        let session_id = value
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ScrapeError::WebDriver(format!(
                    "session id missing in response: {}",
                    truncate_for_log(&body, 220)
                ))
            })?;
        debug!(%endpoint, ?browser, headless, session_id, "webdriver session created");

        let session = Self {
            client,
            endpoint,
            session_id,
            page_script,
        };
        session
            .command(
                Method::POST,
                "timeouts",
                Some(json!({ "script": script_timeout.as_millis() as u64 })),
            )
            .await?;
        Ok(session)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = if path.is_empty() {
            format!("{}/session/{}", self.endpoint, self.session_id)
        } else {
            format!("{}/session/{}/{path}", self.endpoint, self.session_id)
        };
        let label = if path.is_empty() { "session" } else { path };
        let mut req = self.client.request(method, url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let res = req
            .send()
            .await
            .map_err(|e| ScrapeError::WebDriver(format!("{label} request failed: {e}")))?;
        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| ScrapeError::WebDriver(format!("{label} response read failed: {e}")))?;
        trace!(label, status = status.as_u16(), body = %truncate_for_log(&text, 200), "webdriver reply");
        parse_response(label, status, &text)
    }

    async fn execute_sync(&self, script: &str, args: Value) -> Result<Value> {
        self.command(
            Method::POST,
            "execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }
}

#[async_trait]
impl BrowsingContext for WebDriverSession {
    async fn begin_navigation(&self, url: &str) -> Result<NavigationTicket> {
        let token = format!("{}-{}", std::process::id(), fastrand::u64(..));
        // Tag the outgoing document so its readyState is not read as the new page's.
        let _ = self
            .execute_sync(
                "window.__propscrapeNavToken = arguments[0]; return true;",
                json!([token]),
            )
            .await;
        self.command(Method::POST, "url", Some(json!({ "url": url })))
            .await?;
        Ok(NavigationTicket {
            url: url.to_string(),
            token,
        })
    }

    async fn load_complete(&self, ticket: &NavigationTicket) -> Result<bool> {
        let value = self
            .execute_sync(
                "return document.readyState === 'complete' && window.__propscrapeNavToken !== arguments[0];",
                json!([ticket.token]),
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn page_info(&self) -> Result<PageInfo> {
        let url = self.command(Method::GET, "url", None).await?;
        let title = self.command(Method::GET, "title", None).await?;
        Ok(PageInfo {
            url: url.as_str().unwrap_or_default().to_string(),
            title: title.as_str().unwrap_or_default().to_string(),
        })
    }

    async fn page_text(&self) -> Result<String> {
        let value = self
            .execute_sync(
                "return document.body ? document.body.innerText : '';",
                json!([]),
            )
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn has_error_marker(&self) -> Result<bool> {
        let value = self
            .execute_sync("return !!document.querySelector('.error-page');", json!([]))
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn install_script(&self) -> Result<()> {
        self.execute_sync(&self.page_script, json!([])).await?;
        Ok(())
    }

    async fn send_request(&self, request: &ExtractionRequest) -> Result<Option<Value>> {
        let script = r#"
            const done = arguments[arguments.length - 1];
            const handle = window.__propscrapeHandle;
            if (typeof handle !== 'function') {
                done(null);
                return;
            }
            Promise.resolve()
                .then(() => handle(arguments[0]))
                .then(reply => done(reply === undefined ? null : reply))
                .catch(err => done({ success: false, error: String(err && err.message || err) }));
        "#;
        let value = self
            .command(
                Method::POST,
                "execute/async",
                Some(json!({ "script": script, "args": [request] })),
            )
            .await?;
        Ok((!value.is_null()).then_some(value))
    }

    async fn snapshot(&self) -> Result<PageSnapshot> {
        let script = r#"
            return {
                url: window.location.href || "",
                title: document.title || "",
                html: document.documentElement ? document.documentElement.outerHTML : "",
                text: document.body ? document.body.innerText : ""
            };
        "#;
        let value = self.execute_sync(script, json!([])).await?;
        let field = |name: &str| {
            value
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let snapshot = PageSnapshot {
            url: field("url"),
            title: field("title"),
            html: field("html"),
            text: field("text"),
        };
        if snapshot.url.is_empty() || snapshot.html.is_empty() {
            return Err(ScrapeError::WebDriver("empty rendered snapshot".to_string()));
        }
        Ok(snapshot)
    }

    async fn cookies(&self) -> Result<Vec<CookieInfo>> {
        let value = self.command(Method::GET, "cookie", None).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn delete_cookie(&self, name: &str) -> Result<()> {
        let encoded = url::form_urlencoded::byte_serialize(name.as_bytes()).collect::<String>();
        self.command(Method::DELETE, &format!("cookie/{encoded}"), None)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.command(Method::DELETE, "", None).await?;
        debug!(session_id = %self.session_id, "webdriver session closed");
        Ok(())
    }
}
