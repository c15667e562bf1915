use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use super::state::{BatchProgress, ExtractionPath, JobState, ScrapeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    CollectingUrls,
    UrlsComplete,
    ScrapingBatch,
    BatchDone,
    Finished,
    Stopped,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::CollectingUrls => "collecting_urls",
            Phase::UrlsComplete => "urls_complete",
            Phase::ScrapingBatch => "scraping_batch",
            Phase::BatchDone => "batch_done",
            Phase::Finished => "finished",
            Phase::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total_results: usize,
    pub total_success: usize,
    pub total_errors: usize,
    pub partial_scrape: bool,
}

impl RunSummary {
    pub fn from_state(state: &JobState, partial_scrape: bool) -> Self {
        let stats = state.statistics();
        Self {
            total_results: state.scraped_data.len(),
            total_success: stats.success_count,
            total_errors: stats.error_count,
            partial_scrape,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub is_processing: bool,
    pub total_urls: usize,
    pub scraped_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub progress: u8,
}

impl StatusReport {
    pub fn from_state(state: &JobState) -> Self {
        let stats = state.statistics();
        Self {
            is_processing: state.is_processing,
            total_urls: stats.total_urls,
            scraped_count: stats.scraped_count,
            success_count: stats.success_count,
            error_count: stats.error_count,
            progress: stats.progress,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub url: String,
    pub start_page: u32,
    pub end_page: u32,
    pub delay: Duration,
    pub resume: bool,
}

#[derive(Debug, Clone)]
pub enum ScrapeEvent {
    Phase(Phase),
    PageProgress {
        page: u32,
        end_page: u32,
        found: usize,
        total_urls: usize,
    },
    ItemProgress {
        index: usize,
        url: String,
        progress: BatchProgress,
    },
    ItemFinished {
        index: usize,
        status: ScrapeStatus,
        path: Option<ExtractionPath>,
    },
    RetryScheduled {
        index: usize,
        attempt: u32,
        delay: Duration,
    },
    Status(String),
    Error(String),
    Completed(RunSummary),
    ExportReady(PathBuf),
}
