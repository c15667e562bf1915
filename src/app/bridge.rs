use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, warn};

use super::context::{BrowsingContext, ExtractionRequest, PageSnapshot};
use super::error::{Result, ScrapeError};
use super::state::{ExtractionPath, Features};
use super::urls::{is_property_link, resolve_href};

const URL_MARKERS: [&str; 3] = ["/429", "rate-limited", "too-many-requests"];
const TITLE_MARKERS: [&str; 2] = ["too many requests", "rate limited"];
const BODY_PHRASES: [&str; 4] = ["too many requests", "rate limit", "blocked", "try again later"];

const ADDRESS_SELECTORS: [&str; 3] = [
    ".property-info-address",
    "h1[class*=\"address\"]",
    "[data-testid*=\"address\"]",
];
const PRICE_SELECTORS: [&str; 4] = [
    ".property-price",
    ".property-info__price",
    "[class*=\"price\"]",
    "[class*=\"Price\"]",
];

// "429" as a status code, not as part of a price or listing id.
static STATUS_429: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[^\d$,.])429($|[^\d,.]|[.,]($|\D))").expect("status pattern"));
static BEDROOMS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*bed").expect("bedrooms pattern"));
static BATHROOMS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*bath").expect("bathrooms pattern"));
static CARSPACES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*car").expect("carspaces pattern"));
static PROPERTY_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)property-(house|unit|apartment|townhouse|land)").expect("type pattern")
});

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BridgeTimeouts {
    pub send_timeout: Duration,
    pub overall_timeout: Duration,
}

impl Default for BridgeTimeouts {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            overall_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetailFields {
    #[serde(deserialize_with = "lenient_string")]
    pub url: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub address: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub price: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub description: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub bedrooms: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub bathrooms: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub carspaces: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub property_type: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub agent: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub main_image: Option<String>,
    pub features: Features,
}

impl DetailFields {
    fn has_content(&self) -> bool {
        [
            &self.address,
            &self.price,
            &self.bedrooms,
            &self.bathrooms,
            &self.carspaces,
            &self.property_type,
        ]
        .iter()
        .any(|field| field.is_some())
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => non_empty(&s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[derive(Debug, Deserialize)]
struct PageReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedData {
    Urls(Vec<String>),
    Details(DetailFields),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    pub data: ExtractedData,
    pub path: ExtractionPath,
}

#[derive(Debug, Clone)]
pub struct ExtractionBridge {
    timeouts: BridgeTimeouts,
}

impl ExtractionBridge {
    pub fn new(timeouts: BridgeTimeouts) -> Self {
        Self { timeouts }
    }

    pub async fn extract<C>(&self, ctx: &C, request: ExtractionRequest) -> Result<ExtractionResult>
    where
        C: BrowsingContext + ?Sized,
    {
        let overall = self.timeouts.overall_timeout;
        tokio::time::timeout(overall, self.extract_inner(ctx, request))
            .await
            .map_err(|_| {
                ScrapeError::ExtractionFailed(format!(
                    "no extraction result within {}ms",
                    overall.as_millis()
                ))
            })?
    }

    async fn extract_inner<C>(&self, ctx: &C, request: ExtractionRequest) -> Result<ExtractionResult>
    where
        C: BrowsingContext + ?Sized,
    {
        ensure_not_rate_limited(ctx).await?;

        let primary_err = match self.primary(ctx, request).await {
            Ok(data) => {
                return Ok(ExtractionResult {
                    data,
                    path: ExtractionPath::Primary,
                });
            }
            Err(err) => err,
        };
        debug!(?request, error = %primary_err, "primary extraction failed, using fallback");

        match fallback(ctx, request).await {
            Ok(data) => Ok(ExtractionResult {
                data,
                path: ExtractionPath::Fallback,
            }),
            Err(fallback_err) => {
                warn!(?request, primary = %primary_err, fallback = %fallback_err, "both extraction paths failed");
                Err(ScrapeError::ExtractionFailed(format!(
                    "primary: {primary_err}; fallback: {fallback_err}"
                )))
            }
        }
    }

    async fn primary<C>(&self, ctx: &C, request: ExtractionRequest) -> Result<ExtractedData>
    where
        C: BrowsingContext + ?Sized,
    {
        let send_timeout = self.timeouts.send_timeout;
        let reply = tokio::time::timeout(send_timeout, async {
            ctx.install_script().await?;
            ctx.send_request(&request).await
        })
        .await
        .map_err(|_| {
            ScrapeError::ExtractionFailed(format!(
                "page script did not answer within {}ms",
                send_timeout.as_millis()
            ))
        })??;
        let reply = reply
            .ok_or_else(|| ScrapeError::ExtractionFailed("no response from page script".to_string()))?;
        let reply = serde_json::from_value::<PageReply>(reply)
            .map_err(|e| ScrapeError::ExtractionFailed(format!("unparseable page reply: {e}")))?;
        if !reply.success {
            return Err(ScrapeError::ExtractionFailed(
                reply
                    .error
                    .unwrap_or_else(|| "page script reported failure".to_string()),
            ));
        }
        parse_reply_data(request, reply.data)
    }
}

fn parse_reply_data(request: ExtractionRequest, data: Value) -> Result<ExtractedData> {
    match request {
        ExtractionRequest::CollectUrls { .. } => {
            let urls = data
                .get("urls")
                .unwrap_or(&data)
                .as_array()
                .ok_or_else(|| ScrapeError::ExtractionFailed("reply has no url list".to_string()))?
                .iter()
                .filter_map(|u| u.as_str().map(ToString::to_string))
                .collect();
            Ok(ExtractedData::Urls(urls))
        }
        ExtractionRequest::CollectDetails { .. } => {
            let details = data.get("details").cloned().unwrap_or(data);
            if !details.is_object() {
                return Err(ScrapeError::ExtractionFailed("reply has no details".to_string()));
            }
            let fields = serde_json::from_value::<DetailFields>(details)
                .map_err(|e| ScrapeError::ExtractionFailed(format!("unparseable details: {e}")))?;
            Ok(ExtractedData::Details(fields))
        }
    }
}

/// Fails with `RateLimited` when the loaded page is a block or throttle page.
/// A failed body-text read does not count as detection.
pub async fn ensure_not_rate_limited<C>(ctx: &C) -> Result<()>
where
    C: BrowsingContext + ?Sized,
{
    let info = ctx.page_info().await?;
    let url = info.url.to_ascii_lowercase();
    if let Some(marker) = URL_MARKERS.iter().find(|m| url.contains(*m)) {
        return Err(ScrapeError::RateLimited(format!("url contains {marker}")));
    }
    if title_is_rate_limited(&info.title) {
        return Err(ScrapeError::RateLimited(format!("page title \"{}\"", info.title)));
    }

    match ctx.page_text().await {
        Ok(text) => {
            if let Some(phrase) = rate_limit_phrase(&text) {
                return Err(ScrapeError::RateLimited(format!("page text mentions {phrase}")));
            }
        }
        Err(err) => debug!(error = %err, "page text unavailable, skipping content check"),
    }
    match ctx.has_error_marker().await {
        Ok(true) => Err(ScrapeError::RateLimited("site error page".to_string())),
        Ok(false) => Ok(()),
        Err(err) => {
            debug!(error = %err, "error marker check failed");
            Ok(())
        }
    }
}

fn title_is_rate_limited(title: &str) -> bool {
    let lower = title.to_ascii_lowercase();
    STATUS_429.is_match(&lower) || TITLE_MARKERS.iter().any(|m| lower.contains(m))
}

fn rate_limit_phrase(text: &str) -> Option<&'static str> {
    let lower = text.to_ascii_lowercase();
    if STATUS_429.is_match(&lower) {
        return Some("429");
    }
    BODY_PHRASES.iter().copied().find(|p| lower.contains(p))
}

async fn fallback<C>(ctx: &C, request: ExtractionRequest) -> Result<ExtractedData>
where
    C: BrowsingContext + ?Sized,
{
    let snapshot = ctx.snapshot().await?;
    debug!(url = %snapshot.url, title = %snapshot.title, "parsing rendered snapshot");
    match request {
        ExtractionRequest::CollectUrls { .. } => Ok(ExtractedData::Urls(fallback_urls(&snapshot))),
        ExtractionRequest::CollectDetails { .. } => {
            let fields = fallback_details(&snapshot);
            if !fields.has_content() {
                return Err(ScrapeError::ExtractionFailed(
                    "snapshot has no recognizable property fields".to_string(),
                ));
            }
            Ok(ExtractedData::Details(fields))
        }
    }
}

fn fallback_urls(snapshot: &PageSnapshot) -> Vec<String> {
    let doc = Html::parse_document(&snapshot.html);
    let Ok(anchors) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    doc.select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| resolve_href(&snapshot.url, href))
        .filter(|url| is_property_link(url))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

fn fallback_details(snapshot: &PageSnapshot) -> DetailFields {
    let doc = Html::parse_document(&snapshot.html);
    let text = if snapshot.text.trim().is_empty() {
        doc.root_element().text().collect::<Vec<_>>().join(" ")
    } else {
        snapshot.text.clone()
    };
    let capture = |re: &Regex| {
        re.captures(&text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    };
    DetailFields {
        url: non_empty(&snapshot.url),
        address: first_text(&doc, &ADDRESS_SELECTORS),
        price: first_text(&doc, &PRICE_SELECTORS),
        bedrooms: capture(&BEDROOMS),
        bathrooms: capture(&BATHROOMS),
        carspaces: capture(&CARSPACES),
        property_type: PROPERTY_TYPE
            .captures(&snapshot.url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_lowercase()),
        ..DetailFields::default()
    }
}

fn first_text(doc: &Html, selectors: &[&str]) -> Option<String> {
    selectors
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|selector| {
            doc.select(&selector)
                .map(|el| normalize_text(&el.text().collect::<Vec<_>>().join(" ")))
                .find(|text| !text.is_empty())
        })
}

fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{MockPage, MockReply, ScriptedContext};
    use serde_json::json;

    const DETAIL_URL: &str = "https://www.realestate.com.au/property-house-nsw-bondi-143429876";

    async fn loaded(ctx: &ScriptedContext, url: &str) {
        ctx.begin_navigation(url).await.unwrap();
    }

    fn bridge() -> ExtractionBridge {
        ExtractionBridge::new(BridgeTimeouts::default())
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_page_fails_fast() {
        let ctx = ScriptedContext::new();
        ctx.page(DETAIL_URL, MockPage::rate_limited());
        loaded(&ctx, DETAIL_URL).await;

        let err = bridge()
            .extract(&ctx, ExtractionRequest::CollectDetails { property_index: 0 })
            .await
            .unwrap_err();

        assert!(matches!(err, ScrapeError::RateLimited(_)));
        assert!(ctx.requests().is_empty());
        assert_eq!(ctx.snapshots(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn block_phrases_in_body_are_detected() {
        let ctx = ScriptedContext::new();
        ctx.page(
            DETAIL_URL,
            MockPage {
                text: "Access to this page has been blocked".to_string(),
                ..MockPage::detail(json!({"address": "1 Example St"}))
            },
        );
        loaded(&ctx, DETAIL_URL).await;

        let err = bridge()
            .extract(&ctx, ExtractionRequest::CollectDetails { property_index: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::RateLimited(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn prices_and_ids_containing_429_are_not_rate_limits() {
        let ctx = ScriptedContext::new();
        ctx.page(
            DETAIL_URL,
            MockPage {
                text: "Offers over $429,000. Listing id 1429876.".to_string(),
                ..MockPage::detail(json!({"address": "1 Example St", "bedrooms": 3}))
            },
        );
        loaded(&ctx, DETAIL_URL).await;

        let result = bridge()
            .extract(&ctx, ExtractionRequest::CollectDetails { property_index: 0 })
            .await
            .unwrap();
        assert_eq!(result.path, ExtractionPath::Primary);
        let ExtractedData::Details(fields) = result.data else {
            panic!("expected details");
        };
        assert_eq!(fields.bedrooms.as_deref(), Some("3"));
    }

    #[test]
    fn status_code_followed_by_punctuation_is_detected() {
        for text in ["Error 429.", "HTTP ERROR 429, please wait", "429."] {
            assert!(title_is_rate_limited(text), "{text}");
            assert_eq!(rate_limit_phrase(text), Some("429"), "{text}");
        }
        assert_eq!(rate_limit_phrase("Sold for 429.5k"), None);
        assert_eq!(rate_limit_phrase("Guide 429,000 to 450,000"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn site_error_marker_is_a_rate_limit() {
        let ctx = ScriptedContext::new();
        ctx.page(
            DETAIL_URL,
            MockPage {
                error_marker: true,
                ..MockPage::detail(json!({"address": "1 Example St"}))
            },
        );
        loaded(&ctx, DETAIL_URL).await;

        let err = bridge()
            .extract(&ctx, ExtractionRequest::CollectDetails { property_index: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::RateLimited(ref reason) if reason == "site error page"));
        assert!(ctx.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn primary_urls_come_back_as_sent() {
        let ctx = ScriptedContext::new();
        let listing = "https://www.realestate.com.au/buy/list-1";
        ctx.page(listing, MockPage::listing(&["https://www.realestate.com.au/property-unit-1"], 1));
        loaded(&ctx, listing).await;

        let result = bridge()
            .extract(&ctx, ExtractionRequest::CollectUrls { page_number: 1 })
            .await
            .unwrap();
        assert_eq!(
            result,
            ExtractionResult {
                data: ExtractedData::Urls(vec!["https://www.realestate.com.au/property-unit-1".to_string()]),
                path: ExtractionPath::Primary,
            }
        );
        assert_eq!(ctx.requests(), vec![ExtractionRequest::CollectUrls { page_number: 1 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_page_script_falls_back_to_snapshot() {
        let ctx = ScriptedContext::new();
        ctx.page(
            DETAIL_URL,
            MockPage {
                html: r#"<html><body>
                    <h1 class="property-info-address">12 Beach Rd, Bondi</h1>
                    <span class="property-price">$1,250,000</span>
                    <p>4 Beds 2 Baths 1 Car</p>
                </body></html>"#
                    .to_string(),
                reply: MockReply::Silent,
                ..MockPage::default()
            },
        );
        loaded(&ctx, DETAIL_URL).await;

        let result = bridge()
            .extract(&ctx, ExtractionRequest::CollectDetails { property_index: 4 })
            .await
            .unwrap();
        assert_eq!(result.path, ExtractionPath::Fallback);
        let ExtractedData::Details(fields) = result.data else {
            panic!("expected details");
        };
        assert_eq!(fields.address.as_deref(), Some("12 Beach Rd, Bondi"));
        assert_eq!(fields.price.as_deref(), Some("$1,250,000"));
        assert_eq!(fields.bedrooms.as_deref(), Some("4"));
        assert_eq!(fields.bathrooms.as_deref(), Some("2"));
        assert_eq!(fields.carspaces.as_deref(), Some("1"));
        assert_eq!(fields.property_type.as_deref(), Some("house"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_page_script_times_out_into_fallback() {
        let ctx = ScriptedContext::new();
        let listing = "https://www.realestate.com.au/buy/list-2";
        ctx.page(
            listing,
            MockPage {
                html: r##"<a href="/property-unit-vic-carlton-1">one</a>
                        <a href="/agent/someone">agent</a>
                        <a href="/property-unit-vic-carlton-1#photos">dup</a>"##
                    .to_string(),
                reply: MockReply::Hang,
                ..MockPage::default()
            },
        );
        loaded(&ctx, listing).await;
        let started = tokio::time::Instant::now();

        let result = bridge()
            .extract(&ctx, ExtractionRequest::CollectUrls { page_number: 2 })
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(result.path, ExtractionPath::Fallback);
        assert_eq!(
            result.data,
            ExtractedData::Urls(vec![
                "https://www.realestate.com.au/property-unit-vic-carlton-1".to_string()
            ])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn driver_error_on_request_falls_back_to_snapshot() {
        let ctx = ScriptedContext::new();
        ctx.page(
            DETAIL_URL,
            MockPage {
                html: r#"<h1 class="property-info-address">3 Hall St, Bondi</h1>"#.to_string(),
                reply: MockReply::Fail("javascript error: handler missing".to_string()),
                ..MockPage::default()
            },
        );
        loaded(&ctx, DETAIL_URL).await;

        let result = bridge()
            .extract(&ctx, ExtractionRequest::CollectDetails { property_index: 1 })
            .await
            .unwrap();
        assert_eq!(result.path, ExtractionPath::Fallback);
        assert_eq!(ctx.requests().len(), 1);
        let ExtractedData::Details(fields) = result.data else {
            panic!("expected details");
        };
        assert_eq!(fields.address.as_deref(), Some("3 Hall St, Bondi"));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_failure_and_empty_snapshot_is_extraction_failed() {
        let ctx = ScriptedContext::new();
        ctx.page(
            DETAIL_URL,
            MockPage {
                reply: MockReply::Json(json!({"success": false, "error": "selector missing"})),
                ..MockPage::default()
            },
        );
        loaded(&ctx, DETAIL_URL).await;

        let err = bridge()
            .extract(&ctx, ExtractionRequest::CollectDetails { property_index: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::ExtractionFailed(_)));
        assert_eq!(ctx.snapshots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_reply_counts_as_failure() {
        let ctx = ScriptedContext::new();
        ctx.page(
            DETAIL_URL,
            MockPage {
                reply: MockReply::Json(json!("not an object")),
                html: "<p>3 bed</p>".to_string(),
                ..MockPage::default()
            },
        );
        loaded(&ctx, DETAIL_URL).await;

        let result = bridge()
            .extract(&ctx, ExtractionRequest::CollectDetails { property_index: 0 })
            .await
            .unwrap();
        assert_eq!(result.path, ExtractionPath::Fallback);
    }
}
