use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::{Result, ScrapeError};
use super::urls::ListingBase;

pub const DEFAULT_BATCH_SIZE: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    #[default]
    Pending,
    Success,
    Error,
    NotScraped,
}

impl ScrapeStatus {
    pub fn label(self) -> &'static str {
        match self {
            ScrapeStatus::Pending => "pending",
            ScrapeStatus::Success => "success",
            ScrapeStatus::Error => "error",
            ScrapeStatus::NotScraped => "not_scraped",
        }
    }

    pub fn is_completed(self) -> bool {
        matches!(self, ScrapeStatus::Success | ScrapeStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionPath {
    Primary,
    Fallback,
}

impl ExtractionPath {
    pub fn label(self) -> &'static str {
        match self {
            ExtractionPath::Primary => "primary",
            ExtractionPath::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features(Vec<(String, Vec<String>)>);

impl Features {
    pub fn insert(&mut self, category: impl Into<String>, values: Vec<String>) {
        let category = category.into();
        match self.0.iter_mut().find(|(name, _)| *name == category) {
            Some((_, existing)) => existing.extend(values),
            None => self.0.push((category, values)),
        }
    }

    pub fn get(&self, category: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|(name, _)| name == category)
            .map(|(_, values)| values.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Features {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (category, values) in &self.0 {
            map.serialize_entry(category, values)?;
        }
        map.end()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FeatureValues {
    Many(Vec<String>),
    One(String),
}

struct FeaturesVisitor;

impl<'de> Visitor<'de> for FeaturesVisitor {
    type Value = Features;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of feature category to a list of strings")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Features, A::Error> {
        let mut features = Features::default();
        while let Some((category, values)) = access.next_entry::<String, FeatureValues>()? {
            let values = match values {
                FeatureValues::Many(values) => values,
                FeatureValues::One(value) => vec![value],
            };
            features.insert(category, values);
        }
        Ok(features)
    }
}

impl<'de> Deserialize<'de> for Features {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(FeaturesVisitor)
    }
}

/// A discovered detail-page URL. Older state files stored bare strings; both
/// shapes load into this one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PropertyRefRepr", rename_all = "camelCase")]
pub struct PropertyRef {
    url: String,
    pub scrape_attempts: u32,
    pub added_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PropertyRefRepr {
    Bare(String),
    Full {
        url: String,
        #[serde(default, rename = "scrapeAttempts")]
        scrape_attempts: u32,
        #[serde(default = "Utc::now", rename = "addedAt")]
        added_at: DateTime<Utc>,
    },
}

impl From<PropertyRefRepr> for PropertyRef {
    fn from(repr: PropertyRefRepr) -> Self {
        match repr {
            PropertyRefRepr::Bare(url) => PropertyRef::new(url),
            PropertyRefRepr::Full {
                url,
                scrape_attempts,
                added_at,
            } => PropertyRef {
                url: url.trim().to_string(),
                scrape_attempts,
                added_at,
            },
        }
    }
}

impl PropertyRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim().to_string(),
            scrape_attempts: 0,
            added_at: Utc::now(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PropertyRecord {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bedrooms: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bathrooms: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carspaces: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_image: Option<String>,
    #[serde(skip_serializing_if = "Features::is_empty")]
    pub features: Features,
    pub scrape_status: ScrapeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scraped_at: Option<DateTime<Utc>>,
    pub scrape_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionPath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
}

impl PropertyRecord {
    pub fn placeholder(url: &str, status: ScrapeStatus) -> Self {
        Self {
            url: url.to_string(),
            scrape_status: status,
            ..Self::default()
        }
    }

    pub fn scalar_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![("url", self.url.clone())];
        let optional = [
            ("address", &self.address),
            ("price", &self.price),
            ("description", &self.description),
            ("bedrooms", &self.bedrooms),
            ("bathrooms", &self.bathrooms),
            ("carspaces", &self.carspaces),
            ("propertyType", &self.property_type),
            ("agent", &self.agent),
            ("mainImage", &self.main_image),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                fields.push((name, value.clone()));
            }
        }
        fields.push(("scrapeStatus", self.scrape_status.label().to_string()));
        if let Some(error) = &self.error {
            fields.push(("error", error.clone()));
        }
        if let Some(at) = self.scraped_at {
            fields.push(("scrapedAt", at.to_rfc3339()));
        }
        fields.push(("scrapeAttempts", self.scrape_attempts.to_string()));
        if let Some(path) = self.extraction {
            fields.push(("extraction", path.label().to_string()));
        }
        if let Some(at) = self.last_attempt {
            fields.push(("lastAttempt", at.to_rfc3339()));
        }
        fields
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPhase {
    UrlCollection,
    Scraping,
    Watchdog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub phase: ErrorPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEntry {
    pub fn new(phase: ErrorPhase, error: impl Into<String>) -> Self {
        Self {
            phase,
            page: None,
            property_index: None,
            url: None,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn page(page: u32, url: &str, error: impl Into<String>) -> Self {
        Self {
            phase: ErrorPhase::UrlCollection,
            page: Some(page),
            property_index: None,
            url: Some(url.to_string()),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn property(index: usize, url: &str, error: impl Into<String>) -> Self {
        Self {
            phase: ErrorPhase::Scraping,
            page: None,
            property_index: Some(index),
            url: Some(url.to_string()),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

impl BatchWindow {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchInfo {
    pub start_index: usize,
    pub end_index: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub items_in_batch: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub item_in_batch: usize,
    pub batch_len: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub overall_current: usize,
    pub overall_total: usize,
}

impl BatchProgress {
    pub fn for_index(index: usize, batch_size: usize, total: usize) -> Self {
        let batch_size = batch_size.max(1);
        let batch = index / batch_size;
        let start = batch * batch_size;
        let end = (start + batch_size).min(total);
        Self {
            item_in_batch: index - start + 1,
            batch_len: end.saturating_sub(start),
            current_batch: batch + 1,
            total_batches: total.div_ceil(batch_size),
            overall_current: index + 1,
            overall_total: total,
        }
    }

    pub fn overall_percent(&self) -> u8 {
        percent(self.overall_current, self.overall_total)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total_urls: usize,
    pub scraped_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub pending_count: usize,
    pub not_scraped_count: usize,
    pub progress: u8,
}

fn percent(part: usize, whole: usize) -> u8 {
    if whole == 0 {
        return 0;
    }
    ((part.min(whole) * 100 + whole / 2) / whole) as u8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobState {
    pub current_page: u32,
    pub start_page: u32,
    pub end_page: u32,
    pub url_collection_complete: bool,
    pub property_urls: Vec<PropertyRef>,
    #[serde(with = "sparse_records")]
    pub scraped_data: BTreeMap<usize, PropertyRecord>,
    pub current_batch_index: usize,
    pub batch_size: usize,
    pub errors: Vec<ErrorEntry>,
    pub original_page_url: Option<String>,
    pub base_url: Option<ListingBase>,
    pub delay_ms: u64,
    pub is_processing: bool,
    pub last_url_collection_time: Option<DateTime<Utc>>,
    pub last_progress_time: Option<DateTime<Utc>>,
}

impl Default for JobState {
    fn default() -> Self {
        Self {
            current_page: 1,
            start_page: 1,
            end_page: 1,
            url_collection_complete: false,
            property_urls: Vec::new(),
            scraped_data: BTreeMap::new(),
            current_batch_index: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            errors: Vec::new(),
            original_page_url: None,
            base_url: None,
            delay_ms: 0,
            is_processing: false,
            last_url_collection_time: None,
            last_progress_time: None,
        }
    }
}

impl JobState {
    fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub fn batch_window(&self) -> BatchWindow {
        let size = self.effective_batch_size();
        let len = self.property_urls.len();
        let start = self.current_batch_index.saturating_mul(size).min(len);
        let end = start.saturating_add(size).min(len);
        BatchWindow {
            index: self.current_batch_index,
            start,
            end,
        }
    }

    pub fn total_batches(&self) -> usize {
        self.property_urls.len().div_ceil(self.effective_batch_size())
    }

    pub fn has_more_batches(&self) -> bool {
        self.current_batch_index < self.total_batches()
    }

    /// Moves the batch cursor past `from`. Only the first caller for a given
    /// window advances it.
    pub fn advance_batch(&mut self, from: usize) -> bool {
        if self.current_batch_index != from {
            return false;
        }
        self.current_batch_index += 1;
        true
    }

    pub fn batch_info(&self) -> BatchInfo {
        let window = self.batch_window();
        BatchInfo {
            start_index: window.start,
            end_index: window.end,
            current_batch: window.index + 1,
            total_batches: self.total_batches(),
            items_in_batch: window.len(),
        }
    }

    pub fn batch_progress(&self, index: usize) -> BatchProgress {
        BatchProgress::for_index(index, self.effective_batch_size(), self.property_urls.len())
    }

    pub fn append_unique_urls<I>(&mut self, urls: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut known = self
            .property_urls
            .iter()
            .map(|p| p.url().to_string())
            .collect::<HashSet<_>>();
        let before = self.property_urls.len();
        for url in urls {
            let url = url.trim();
            if url.is_empty() || known.contains(url) {
                continue;
            }
            known.insert(url.to_string());
            self.property_urls.push(PropertyRef::new(url));
        }
        self.property_urls.len() - before
    }

    pub fn url_at(&self, index: usize) -> Result<&str> {
        self.property_urls
            .get(index)
            .map(PropertyRef::url)
            .ok_or(ScrapeError::InvalidIndex {
                index,
                len: self.property_urls.len(),
            })
    }

    pub fn record(&self, index: usize) -> Option<&PropertyRecord> {
        self.scraped_data.get(&index)
    }

    pub fn is_success(&self, index: usize) -> bool {
        self.record(index)
            .is_some_and(|r| r.scrape_status == ScrapeStatus::Success)
    }

    pub fn put_record(&mut self, index: usize, record: PropertyRecord) -> Result<()> {
        self.url_at(index)?;
        self.scraped_data.insert(index, record);
        Ok(())
    }

    pub fn mark_pending(&mut self, index: usize) -> Result<()> {
        let url = self.url_at(index)?.to_string();
        let now = Utc::now();
        if let Some(entry) = self.property_urls.get_mut(index) {
            entry.scrape_attempts += 1;
        }
        let record = self
            .scraped_data
            .entry(index)
            .or_insert_with(|| PropertyRecord::placeholder(&url, ScrapeStatus::Pending));
        record.url = url;
        record.scrape_status = ScrapeStatus::Pending;
        record.scrape_attempts += 1;
        record.last_attempt = Some(now);
        Ok(())
    }

    pub fn mark_failed(&mut self, index: usize, error: &str) -> Result<()> {
        let url = self.url_at(index)?.to_string();
        let record = self
            .scraped_data
            .entry(index)
            .or_insert_with(|| PropertyRecord::placeholder(&url, ScrapeStatus::Error));
        record.scrape_status = ScrapeStatus::Error;
        record.error = Some(error.to_string());
        record.last_attempt = Some(Utc::now());
        Ok(())
    }

    pub fn log_error(&mut self, entry: ErrorEntry) {
        self.errors.push(entry);
    }

    pub fn completed_count(&self) -> usize {
        self.scraped_data
            .values()
            .filter(|r| r.scrape_status.is_completed())
            .count()
    }

    pub fn fill_placeholders(&mut self) -> usize {
        let mut added = 0;
        for (index, property) in self.property_urls.iter().enumerate() {
            self.scraped_data.entry(index).or_insert_with(|| {
                added += 1;
                PropertyRecord::placeholder(property.url(), ScrapeStatus::NotScraped)
            });
        }
        added
    }

    pub fn compact(&mut self) -> usize {
        let len = self.property_urls.len();
        self.scraped_data.retain(|index, _| *index < len);
        self.scraped_data.len()
    }

    pub fn cleanup(&mut self) -> usize {
        let before = self.property_urls.len();
        let mut seen = HashSet::<String>::new();
        let mut kept = Vec::with_capacity(before);
        let mut remap = HashMap::<usize, usize>::new();
        for (old_index, property) in self.property_urls.drain(..).enumerate() {
            if property.url().is_empty() || !seen.insert(property.url().to_string()) {
                continue;
            }
            remap.insert(old_index, kept.len());
            kept.push(property);
        }
        let records = std::mem::take(&mut self.scraped_data);
        self.scraped_data = records
            .into_iter()
            .filter_map(|(old, record)| remap.get(&old).map(|new| (*new, record)))
            .collect();
        self.property_urls = kept;
        before - self.property_urls.len()
    }

    pub fn export_records(&self) -> Vec<&PropertyRecord> {
        self.scraped_data.values().collect()
    }

    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics {
            total_urls: self.property_urls.len(),
            ..Statistics::default()
        };
        for record in self.scraped_data.values() {
            match record.scrape_status {
                ScrapeStatus::Success => stats.success_count += 1,
                ScrapeStatus::Error => stats.error_count += 1,
                ScrapeStatus::Pending => stats.pending_count += 1,
                ScrapeStatus::NotScraped => stats.not_scraped_count += 1,
            }
        }
        stats.scraped_count = stats.success_count + stats.error_count;
        stats.progress = percent(stats.scraped_count, stats.total_urls);
        stats
    }
}

mod sparse_records {
    use std::collections::BTreeMap;

    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::PropertyRecord;

    pub fn serialize<S: Serializer>(
        records: &BTreeMap<usize, PropertyRecord>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let len = records.keys().next_back().map_or(0, |last| last + 1);
        let mut seq = serializer.serialize_seq(Some(len))?;
        for index in 0..len {
            seq.serialize_element(&records.get(&index))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<usize, PropertyRecord>, D::Error> {
        let slots = Vec::<Option<PropertyRecord>>::deserialize(deserializer)?;
        Ok(slots
            .into_iter()
            .enumerate()
            .filter_map(|(index, record)| record.map(|record| (index, record)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_with_urls(count: usize, batch_size: usize) -> JobState {
        let mut state = JobState {
            batch_size,
            ..JobState::default()
        };
        state.append_unique_urls((0..count).map(|i| format!("https://example.com/property-{i}")));
        state
    }

    #[test]
    fn batch_window_clamps_to_url_count() {
        let mut state = state_with_urls(130, 60);
        assert_eq!(state.batch_window().range(), 0..60);
        assert!(state.advance_batch(0));
        assert_eq!(state.batch_window().range(), 60..120);
        assert!(state.advance_batch(1));
        assert_eq!(state.batch_window().range(), 120..130);
        assert_eq!(state.total_batches(), 3);
        assert!(state.advance_batch(2));
        assert!(state.batch_window().is_empty());
        assert!(!state.has_more_batches());
    }

    #[test]
    fn batch_info_reports_one_based_batches() {
        let mut state = state_with_urls(130, 60);
        state.advance_batch(0);
        state.advance_batch(1);
        assert_eq!(
            state.batch_info(),
            BatchInfo {
                start_index: 120,
                end_index: 130,
                current_batch: 3,
                total_batches: 3,
                items_in_batch: 10,
            }
        );
    }

    #[test]
    fn advance_batch_is_idempotent_per_window() {
        let mut state = state_with_urls(10, 4);
        assert!(state.advance_batch(0));
        assert!(!state.advance_batch(0));
        assert_eq!(state.current_batch_index, 1);
    }

    #[test]
    fn append_skips_duplicates_and_blank_urls() {
        let mut state = JobState::default();
        let added = state.append_unique_urls(vec![
            "https://example.com/a".to_string(),
            " https://example.com/a ".to_string(),
            String::new(),
            "https://example.com/b".to_string(),
        ]);
        assert_eq!(added, 2);
        assert_eq!(state.append_unique_urls(vec!["https://example.com/b".to_string()]), 0);
        assert_eq!(state.property_urls[1].url(), "https://example.com/b");
    }

    #[test]
    fn property_refs_load_from_bare_strings_and_objects() {
        let refs: Vec<PropertyRef> = serde_json::from_value(json!([
            "https://example.com/a",
            {"url": "https://example.com/b", "scrapeAttempts": 2, "addedAt": "2024-05-01T00:00:00Z"}
        ]))
        .unwrap();
        assert_eq!(refs[0].url(), "https://example.com/a");
        assert_eq!(refs[0].scrape_attempts, 0);
        assert_eq!(refs[1].url(), "https://example.com/b");
        assert_eq!(refs[1].scrape_attempts, 2);
    }

    #[test]
    fn scraped_data_serializes_with_null_holes() {
        let mut state = state_with_urls(3, 60);
        state
            .put_record(2, PropertyRecord::placeholder("https://example.com/property-2", ScrapeStatus::Success))
            .unwrap();
        let value = serde_json::to_value(&state).unwrap();
        let slots = value["scrapedData"].as_array().unwrap();
        assert_eq!(slots.len(), 3);
        assert!(slots[0].is_null());
        assert_eq!(slots[2]["scrapeStatus"], "success");

        let back: JobState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn pending_then_failed_keeps_prior_fields() {
        let mut state = state_with_urls(1, 60);
        let mut record = PropertyRecord::placeholder(state.url_at(0).unwrap(), ScrapeStatus::Error);
        record.address = Some("1 Example St".to_string());
        state.put_record(0, record).unwrap();

        state.mark_pending(0).unwrap();
        assert_eq!(state.record(0).unwrap().scrape_status, ScrapeStatus::Pending);
        state.mark_failed(0, "boom").unwrap();

        let record = state.record(0).unwrap();
        assert_eq!(record.scrape_status, ScrapeStatus::Error);
        assert_eq!(record.address.as_deref(), Some("1 Example St"));
        assert_eq!(record.scrape_attempts, 1);
        assert_eq!(state.property_urls[0].scrape_attempts, 1);
    }

    #[test]
    fn put_record_rejects_unknown_index() {
        let mut state = state_with_urls(2, 60);
        let err = state
            .put_record(5, PropertyRecord::default())
            .unwrap_err();
        assert!(matches!(err, ScrapeError::InvalidIndex { index: 5, len: 2 }));
    }

    #[test]
    fn fill_placeholders_covers_every_index() {
        let mut state = state_with_urls(4, 60);
        state
            .put_record(1, PropertyRecord::placeholder(state.url_at(1).unwrap(), ScrapeStatus::Success))
            .unwrap();
        assert_eq!(state.fill_placeholders(), 3);
        assert_eq!(state.scraped_data.len(), state.property_urls.len());
        assert_eq!(state.record(0).unwrap().scrape_status, ScrapeStatus::NotScraped);
        assert_eq!(state.record(1).unwrap().scrape_status, ScrapeStatus::Success);
    }

    #[test]
    fn cleanup_rekeys_records_after_dropping_duplicates() {
        let mut state = JobState::default();
        state.property_urls = vec![
            PropertyRef::new("https://example.com/a"),
            PropertyRef::new("https://example.com/a"),
            PropertyRef::new("https://example.com/b"),
        ];
        state.scraped_data.insert(
            2,
            PropertyRecord::placeholder("https://example.com/b", ScrapeStatus::Success),
        );
        state.scraped_data.insert(
            1,
            PropertyRecord::placeholder("https://example.com/a", ScrapeStatus::Error),
        );
        assert_eq!(state.cleanup(), 1);
        assert_eq!(state.property_urls.len(), 2);
        assert_eq!(state.record(1).unwrap().url, "https://example.com/b");
        assert!(state.record(0).is_none());
    }

    #[test]
    fn statistics_count_completed_records() {
        let mut state = state_with_urls(4, 60);
        state
            .put_record(0, PropertyRecord::placeholder("a", ScrapeStatus::Success))
            .unwrap();
        state
            .put_record(1, PropertyRecord::placeholder("b", ScrapeStatus::Error))
            .unwrap();
        state
            .put_record(2, PropertyRecord::placeholder("c", ScrapeStatus::Pending))
            .unwrap();
        let stats = state.statistics();
        assert_eq!(stats.total_urls, 4);
        assert_eq!(stats.scraped_count, 2);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.pending_count, 1);
        assert_eq!(stats.progress, 50);
    }

    #[test]
    fn batch_progress_reports_position_within_batch() {
        let progress = BatchProgress::for_index(61, 60, 130);
        assert_eq!(progress.item_in_batch, 2);
        assert_eq!(progress.batch_len, 60);
        assert_eq!(progress.current_batch, 2);
        assert_eq!(progress.total_batches, 3);
        assert_eq!(progress.overall_current, 62);

        let last = BatchProgress::for_index(129, 60, 130);
        assert_eq!(last.batch_len, 10);
        assert_eq!(last.overall_percent(), 100);
    }

    #[test]
    fn features_keep_first_seen_order() {
        let features: Features =
            serde_json::from_str(r#"{"Outdoor": ["Deck"], "Indoor": "Dishwasher"}"#).unwrap();
        let names = features.iter().map(|(name, _)| name).collect::<Vec<_>>();
        assert_eq!(names, vec!["Outdoor", "Indoor"]);
        assert_eq!(features.get("Indoor"), Some(&["Dishwasher".to_string()][..]));
    }
}
