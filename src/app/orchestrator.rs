use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bridge::{ExtractedData, ExtractionBridge, ExtractionResult};
use super::config::ScrapeConfig;
use super::context::{BrowsingContext, ExtractionRequest};
use super::error::{Result, ScrapeError};
use super::mitigation::{Mitigator, compute_backoff};
use super::navigation::NavigationDriver;
use super::state::{ErrorEntry, ErrorPhase, JobState, PropertyRecord, ScrapeStatus};
use super::store::StateStore;
use super::types::{Phase, RunSummary, ScrapeEvent};
use super::urls::{construct_page_url, filter_property_urls, target_domain};
use super::watchdog::StallAction;

pub struct OrchestratorSession {
    pub state: JobState,
    store: StateStore,
    events: UnboundedSender<ScrapeEvent>,
    snapshots: Arc<watch::Sender<JobState>>,
    stop: CancellationToken,
    phase: Phase,
}

impl OrchestratorSession {
    pub fn new(
        state: JobState,
        store: StateStore,
        events: UnboundedSender<ScrapeEvent>,
        snapshots: Arc<watch::Sender<JobState>>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            state,
            store,
            events,
            snapshots,
            stop,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn emit(&self, event: ScrapeEvent) {
        let _ = self.events.send(event);
    }

    fn status(&self, message: impl Into<String>) {
        self.emit(ScrapeEvent::Status(message.into()));
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        info!(from = self.phase.label(), to = phase.label(), "phase transition");
        self.phase = phase;
        self.emit(ScrapeEvent::Phase(phase));
    }

    fn persist(&mut self) {
        self.snapshots.send_replace(self.state.clone());
        if let Err(err) = self.store.save(&self.state) {
            warn!(error = %err, "job state not persisted");
            self.emit(ScrapeEvent::Error(err.to_string()));
        }
    }

    fn stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.stop.cancelled() => true,
        }
    }
}

enum Raced<T> {
    Done(T),
    Stalled(StallAction),
}

enum ItemOutcome {
    Done,
    Stalled,
}

/// Runs `unit` to completion unless the watchdog sends an action that
/// `relevant` accepts. Stale actions are dropped and the unit keeps going.
async fn race_stall<F, P>(
    stall_rx: &mut UnboundedReceiver<StallAction>,
    unit: F,
    relevant: P,
) -> Raced<F::Output>
where
    F: Future,
    P: Fn(&StallAction) -> bool,
{
    tokio::pin!(unit);
    loop {
        tokio::select! {
            out = &mut unit => return Raced::Done(out),
            action = stall_rx.recv() => match action {
                Some(action) if relevant(&action) => return Raced::Stalled(action),
                Some(action) => debug!(?action, "ignoring stale stall action"),
                None => return Raced::Done(unit.await),
            },
        }
    }
}

async fn visit<C>(
    ctx: &C,
    driver: &mut NavigationDriver,
    bridge: &ExtractionBridge,
    url: &str,
    settle: Duration,
    request: ExtractionRequest,
) -> Result<ExtractionResult>
where
    C: BrowsingContext + ?Sized,
{
    driver.navigate(ctx, url, settle).await?;
    bridge.extract(ctx, request).await
}

pub struct Orchestrator<C> {
    ctx: C,
    config: ScrapeConfig,
    domain: String,
    driver: NavigationDriver,
    bridge: ExtractionBridge,
    mitigator: Mitigator,
    session: OrchestratorSession,
}

impl<C: BrowsingContext> Orchestrator<C> {
    pub fn new(ctx: C, config: ScrapeConfig, session: OrchestratorSession) -> Self {
        let domain = config
            .domain
            .clone()
            .or_else(|| {
                session
                    .state
                    .original_page_url
                    .as_deref()
                    .and_then(target_domain)
            })
            .unwrap_or_default();
        Self {
            driver: NavigationDriver::new(config.navigation),
            bridge: ExtractionBridge::new(config.bridge),
            mitigator: Mitigator::new(config.mitigation, domain.clone()),
            ctx,
            config,
            domain,
            session,
        }
    }

    pub fn session(&self) -> &OrchestratorSession {
        &self.session
    }

    pub fn context(&self) -> &C {
        &self.ctx
    }

    pub fn into_context(self) -> C {
        self.ctx
    }

    pub async fn run(&mut self, stall_rx: &mut UnboundedReceiver<StallAction>) -> Result<RunSummary> {
        self.session.state.is_processing = true;
        self.session.persist();
        match self.drive(stall_rx).await {
            Ok(()) => Ok(self.conclude().await),
            Err(err) => {
                error!(error = %err, "scraping halted");
                let phase = if err.is_systemic() || !self.session.state.url_collection_complete {
                    ErrorPhase::UrlCollection
                } else {
                    ErrorPhase::Scraping
                };
                self.session.state.log_error(ErrorEntry::new(phase, err.to_string()));
                self.session.state.is_processing = false;
                self.session.set_phase(Phase::Idle);
                self.session.persist();
                self.session.emit(ScrapeEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn drive(&mut self, stall_rx: &mut UnboundedReceiver<StallAction>) -> Result<()> {
        if !self.session.state.url_collection_complete {
            self.session.set_phase(Phase::CollectingUrls);
            self.collect_urls(stall_rx).await?;
            if self.session.stopped() {
                return Ok(());
            }
            self.session.state.url_collection_complete = true;
            self.session.set_phase(Phase::UrlsComplete);
            self.session.persist();
            info!(urls = self.session.state.property_urls.len(), "url collection complete");
        }

        if self.session.state.property_urls.is_empty() {
            return if self.session.stopped() {
                Ok(())
            } else {
                Err(ScrapeError::NoUrlsCollected)
            };
        }
        self.scrape_batches(stall_rx).await;
        Ok(())
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.session.state.delay_ms)
    }

    async fn collect_urls(&mut self, stall_rx: &mut UnboundedReceiver<StallAction>) -> Result<()> {
        let base = self.session.state.base_url.clone().ok_or_else(|| {
            ScrapeError::InvalidRequest("job state has no listing base url".to_string())
        })?;
        self.session.state.last_url_collection_time = Some(Utc::now());
        self.session.persist();

        loop {
            if self.session.stopped() {
                return Ok(());
            }
            let page = self.session.state.current_page;
            if page > self.session.state.end_page {
                return Ok(());
            }
            let url = construct_page_url(&base, page);
            self.collect_page(page, &url, stall_rx).await;

            if page >= self.session.state.end_page {
                return Ok(());
            }
            self.session.state.current_page = page + 1;
            self.session.persist();
            if self.session.pause(self.delay()).await {
                return Ok(());
            }
        }
    }

    async fn collect_page(
        &mut self,
        page: u32,
        url: &str,
        stall_rx: &mut UnboundedReceiver<StallAction>,
    ) {
        let settle = self.config.navigation.listing_settle;
        let request = ExtractionRequest::CollectUrls { page_number: page };
        let mut failures = 0;
        loop {
            if self.session.stopped() {
                return;
            }
            self.session.status(format!(
                "collecting page {page} of {}",
                self.session.state.end_page
            ));
            let raced = race_stall(
                stall_rx,
                visit(&self.ctx, &mut self.driver, &self.bridge, url, settle, request),
                |action| *action == StallAction::RecollectPage { page },
            )
            .await;

            match raced {
                Raced::Stalled(_) => {
                    warn!(page, "listing page stalled, re-issuing");
                    self.session.state.log_error(ErrorEntry::new(
                        ErrorPhase::Watchdog,
                        format!("re-issued collection of page {page}"),
                    ));
                    self.session.state.last_url_collection_time = Some(Utc::now());
                    self.session.persist();
                }
                Raced::Done(Ok(result)) => {
                    self.record_page_urls(page, result);
                    return;
                }
                Raced::Done(Err(err)) if failures == 0 => {
                    failures += 1;
                    warn!(page, error = %err, "listing page failed, retrying once");
                    self.session
                        .status(format!("page {page} failed, retrying: {err}"));
                    if self.session.pause(self.config.page_retry_delay).await {
                        return;
                    }
                }
                Raced::Done(Err(err)) => {
                    warn!(page, error = %err, "listing page failed twice, moving on");
                    self.session
                        .state
                        .log_error(ErrorEntry::page(page, url, err.to_string()));
                    self.session.persist();
                    self.session
                        .emit(ScrapeEvent::Error(format!("page {page}: {err}")));
                    return;
                }
            }
        }
    }

    fn record_page_urls(&mut self, page: u32, result: ExtractionResult) {
        let urls = match result.data {
            ExtractedData::Urls(urls) => urls,
            ExtractedData::Details(_) => Vec::new(),
        };
        let found = urls.len();
        let added = self
            .session
            .state
            .append_unique_urls(filter_property_urls(urls, &self.domain));
        self.session.state.last_url_collection_time = Some(Utc::now());
        self.session.persist();

        let total_urls = self.session.state.property_urls.len();
        info!(
            page,
            found,
            added,
            total_urls,
            path = result.path.label(),
            "collected listing page"
        );
        self.session.emit(ScrapeEvent::PageProgress {
            page,
            end_page: self.session.state.end_page,
            found: added,
            total_urls,
        });
    }

    async fn mitigate(&self) {
        if !self.mitigator.mitigate(&self.ctx, &self.session.stop).await {
            debug!("mitigation was partial");
        }
    }

    async fn scrape_batches(&mut self, stall_rx: &mut UnboundedReceiver<StallAction>) {
        loop {
            if self.session.stopped() {
                return;
            }
            let window = self.session.state.batch_window();
            if window.is_empty() {
                return;
            }
            let total_batches = self.session.state.total_batches();
            self.session.set_phase(Phase::ScrapingBatch);
            info!(
                batch = window.index + 1,
                total_batches,
                start = window.start,
                end = window.end,
                "starting batch"
            );
            self.session.status(format!(
                "batch {}/{}: properties {}-{}",
                window.index + 1,
                total_batches,
                window.start + 1,
                window.end
            ));
            self.session.state.last_progress_time = Some(Utc::now());
            self.session.persist();
            if self.mitigator.policy().per_batch {
                self.mitigate().await;
            }

            let mut stalled = false;
            for index in window.range() {
                if self.session.stopped() {
                    return;
                }
                if self.session.state.is_success(index) {
                    debug!(index, "already scraped, skipping");
                    continue;
                }
                if let ItemOutcome::Stalled = self.scrape_item(index, window.index, stall_rx).await {
                    stalled = true;
                    break;
                }
                if index + 1 < window.end && self.session.pause(self.config.item_delay).await {
                    return;
                }
            }
            if self.session.stopped() {
                return;
            }

            if stalled {
                self.session.state.log_error(ErrorEntry::new(
                    ErrorPhase::Watchdog,
                    format!("batch {} force-advanced after stall", window.index + 1),
                ));
                self.mitigate().await;
            }
            self.session.set_phase(Phase::BatchDone);
            if self.session.state.advance_batch(window.index) {
                self.session.persist();
            }
            if !self.session.state.has_more_batches() {
                return;
            }
            let pause = self.config.batch_pause(self.delay());
            info!(pause_ms = pause.as_millis() as u64, "pausing between batches");
            if self.session.pause(pause).await {
                return;
            }
        }
    }

    async fn scrape_item(
        &mut self,
        index: usize,
        batch_index: usize,
        stall_rx: &mut UnboundedReceiver<StallAction>,
    ) -> ItemOutcome {
        let url = match self.session.state.url_at(index) {
            Ok(url) => url.to_string(),
            Err(err) => {
                warn!(index, error = %err, "skipping unknown property index");
                return ItemOutcome::Done;
            }
        };
        let settle = self.config.navigation.detail_settle;
        let request = ExtractionRequest::CollectDetails {
            property_index: index,
        };
        let mut retries = 0u32;

        loop {
            if self.session.stopped() {
                return ItemOutcome::Done;
            }
            if let Err(err) = self.session.state.mark_pending(index) {
                warn!(index, error = %err, "could not mark property pending");
            }
            self.session.persist();
            self.session.emit(ScrapeEvent::ItemProgress {
                index,
                url: url.clone(),
                progress: self.session.state.batch_progress(index),
            });

            let raced = race_stall(
                stall_rx,
                visit(&self.ctx, &mut self.driver, &self.bridge, &url, settle, request),
                |action| *action == StallAction::ForceAdvanceBatch { batch_index },
            )
            .await;
            let outcome = match raced {
                Raced::Done(outcome) => outcome,
                Raced::Stalled(_) => {
                    self.record_failure(index, &url, "abandoned after stall");
                    return ItemOutcome::Stalled;
                }
            };

            match outcome.map_err(ScrapeError::classify) {
                Ok(result) => {
                    self.record_success(index, &url, result);
                    return ItemOutcome::Done;
                }
                Err(err) if err.is_rate_limited() && self.config.backoff.should_retry(retries) => {
                    let delay = compute_backoff(retries, &self.config.backoff);
                    retries += 1;
                    warn!(
                        index,
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "rate limited, backing off"
                    );
                    self.session.emit(ScrapeEvent::RetryScheduled {
                        index,
                        attempt: retries,
                        delay,
                    });
                    if self.mitigator.policy().per_retry {
                        self.mitigate().await;
                    }
                    if self.session.pause(delay).await {
                        return ItemOutcome::Done;
                    }
                }
                Err(err) => {
                    self.record_failure(index, &url, &err.to_string());
                    return ItemOutcome::Done;
                }
            }
        }
    }

    fn record_success(&mut self, index: usize, url: &str, result: ExtractionResult) {
        let fields = match result.data {
            ExtractedData::Details(fields) => fields,
            ExtractedData::Urls(_) => {
                self.record_failure(index, url, "page answered with a url list");
                return;
            }
        };
        let now = Utc::now();
        let scrape_attempts = self
            .session
            .state
            .record(index)
            .map_or(1, |r| r.scrape_attempts);
        let record = PropertyRecord {
            url: url.to_string(),
            address: fields.address,
            price: fields.price,
            description: fields.description,
            bedrooms: fields.bedrooms,
            bathrooms: fields.bathrooms,
            carspaces: fields.carspaces,
            property_type: fields.property_type,
            agent: fields.agent,
            main_image: fields.main_image,
            features: fields.features,
            scrape_status: ScrapeStatus::Success,
            error: None,
            scraped_at: Some(now),
            scrape_attempts,
            extraction: Some(result.path),
            last_attempt: Some(now),
        };
        if let Err(err) = self.session.state.put_record(index, record) {
            warn!(index, error = %err, "could not store property record");
            return;
        }
        self.session.state.last_progress_time = Some(now);
        self.session.persist();
        debug!(
            index,
            path = result.path.label(),
            page_url = fields.url.as_deref().unwrap_or_default(),
            "property scraped"
        );
        self.session.emit(ScrapeEvent::ItemFinished {
            index,
            status: ScrapeStatus::Success,
            path: Some(result.path),
        });
    }

    fn record_failure(&mut self, index: usize, url: &str, message: &str) {
        if let Err(err) = self.session.state.mark_failed(index, message) {
            warn!(index, error = %err, "could not store failure record");
        }
        self.session
            .state
            .log_error(ErrorEntry::property(index, url, message));
        self.session.state.last_progress_time = Some(Utc::now());
        self.session.persist();
        warn!(index, url, error = message, "property failed");
        self.session.emit(ScrapeEvent::Error(format!(
            "property {} failed: {message}",
            index + 1
        )));
        self.session.emit(ScrapeEvent::ItemFinished {
            index,
            status: ScrapeStatus::Error,
            path: None,
        });
    }

    async fn return_to_origin(&mut self) {
        let Some(origin) = self.session.state.original_page_url.clone() else {
            return;
        };
        let settle = self.config.navigation.listing_settle;
        if let Err(err) = self.driver.navigate(&self.ctx, &origin, settle).await {
            warn!(url = %origin, error = %err, "could not return to the listing page");
        }
    }

    async fn conclude(&mut self) -> RunSummary {
        let partial = self.session.stopped();
        if partial {
            self.session.set_phase(Phase::Stopped);
            let kept = self.session.state.compact();
            self.session.state.is_processing = false;
            self.session.persist();
            self.return_to_origin().await;
            info!(records = kept, "scraping stopped, partial results kept");
        } else {
            self.session.set_phase(Phase::Finished);
            self.return_to_origin().await;
            let synthesized = self.session.state.fill_placeholders();
            self.session.state.is_processing = false;
            self.session.persist();
            info!(
                synthesized,
                completed = self.session.state.completed_count(),
                "scraping finished"
            );
        }

        let summary = RunSummary::from_state(&self.session.state, partial);
        self.session.emit(ScrapeEvent::Completed(summary));
        summary
    }
}
