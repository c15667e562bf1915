use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cli::{Cli, Command, MitigationArg, ScrapeArgs};
use super::config::ScrapeConfig;
use super::context::BrowsingContext;
use super::data_io::{DataFormat, default_export_path, detect_data_format, write_export};
use super::error::{Result, ScrapeError};
use super::logging::init_logging;
use super::orchestrator::{Orchestrator, OrchestratorSession};
use super::state::{BatchInfo, JobState};
use super::store::StateStore;
use super::types::{RunSummary, ScrapeEvent, StartRequest, StatusReport};
use super::urls::{ListingBase, extract_base_url};
use super::watchdog::run_watchdog;
use super::webdriver::{DEFAULT_PAGE_SCRIPT, WebDriverSession};

struct AbortTaskOnDrop(tokio::task::AbortHandle);

impl Drop for AbortTaskOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Controller {
    config: ScrapeConfig,
    store: StateStore,
    stop: Mutex<CancellationToken>,
    snapshots: Arc<watch::Sender<JobState>>,
    events: UnboundedSender<ScrapeEvent>,
    running: AtomicBool,
}

impl Controller {
    pub fn new(config: ScrapeConfig, store: StateStore, events: UnboundedSender<ScrapeEvent>) -> Self {
        let snapshots = Arc::new(watch::channel(store.load()).0);
        Self {
            config,
            store,
            stop: Mutex::new(CancellationToken::new()),
            snapshots,
            events,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn start<C: BrowsingContext>(&self, ctx: C, request: StartRequest) -> Result<RunSummary> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ScrapeError::InvalidRequest(
                "a scrape is already running".to_string(),
            ));
        }
        let result = self.start_inner(ctx, request).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn start_inner<C: BrowsingContext>(&self, ctx: C, request: StartRequest) -> Result<RunSummary> {
        if request.start_page < 1 || request.start_page > request.end_page {
            return Err(ScrapeError::InvalidRequest(format!(
                "page range {}..={} is empty",
                request.start_page, request.end_page
            )));
        }
        let base = extract_base_url(&request.url)?;
        let stop = CancellationToken::new();
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = stop.clone();

        let state = self.prepare_state(&request, base)?;
        info!(
            url = %request.url,
            start_page = state.start_page,
            end_page = state.end_page,
            known_urls = state.property_urls.len(),
            batch = state.current_batch_index + 1,
            "starting scrape"
        );
        self.snapshots.send_replace(state.clone());

        let (stall_tx, mut stall_rx) = mpsc::unbounded_channel();
        let watchdog = tokio::spawn(run_watchdog(
            self.config.stall,
            self.snapshots.subscribe(),
            stall_tx,
        ));
        let _watchdog_guard = AbortTaskOnDrop(watchdog.abort_handle());

        let session = OrchestratorSession::new(
            state,
            self.store.clone(),
            self.events.clone(),
            Arc::clone(&self.snapshots),
            stop,
        );
        let mut orchestrator = Orchestrator::new(ctx, self.config.clone(), session);
        let result = orchestrator.run(&mut stall_rx).await;

        let ctx = orchestrator.into_context();
        if let Err(err) = ctx.close().await {
            warn!(error = %err, "browsing session did not close cleanly");
        }
        result
    }

    fn prepare_state(&self, request: &StartRequest, base: ListingBase) -> Result<JobState> {
        if request.resume {
            let mut saved = self.store.load();
            if saved.original_page_url.as_deref() == Some(request.url.as_str()) {
                let removed = saved.cleanup();
                if removed > 0 {
                    info!(removed, "dropped duplicate property urls from saved job");
                }
                saved.is_processing = true;
                saved.delay_ms = request.delay.as_millis() as u64;
                saved.last_progress_time = Some(Utc::now());
                self.store.save(&saved)?;
                return Ok(saved);
            }
            info!(url = %request.url, "no saved job for this listing, starting fresh");
        }

        let now = Utc::now();
        self.store.reset(|state| {
            state.start_page = request.start_page;
            state.current_page = request.start_page;
            state.end_page = request.end_page;
            state.original_page_url = Some(request.url.clone());
            state.base_url = Some(base);
            state.batch_size = self.config.batch_size;
            state.delay_ms = request.delay.as_millis() as u64;
            state.is_processing = true;
            state.last_url_collection_time = Some(now);
            state.last_progress_time = Some(now);
        })
    }

    pub fn stop(&self) {
        self.stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::from_state(&self.snapshots.borrow())
    }

    pub fn batch_info(&self) -> BatchInfo {
        self.snapshots.borrow().batch_info()
    }

    pub fn download_export(
        &self,
        format: DataFormat,
        output: Option<PathBuf>,
        output_dir: &Path,
    ) -> Result<PathBuf> {
        let state = self.snapshots.borrow().clone();
        let records = state.export_records();
        let (path, format) = match output {
            Some(path) => {
                let format = detect_data_format(&path.to_string_lossy(), format);
                (path, format)
            }
            None => (default_export_path(output_dir, format), format),
        };
        let written = write_export(&records, format, &path)?;
        info!(path = %written.display(), records = records.len(), "export written");
        let _ = self.events.send(ScrapeEvent::ExportReady(written.clone()));
        Ok(written)
    }
}

fn scrape_config(args: &ScrapeArgs) -> ScrapeConfig {
    let mut config = ScrapeConfig {
        batch_size: args.batch_size.max(1),
        domain: args.domain.clone(),
        ..ScrapeConfig::default()
    };
    config.stall.threshold = Duration::from_secs(args.stall_threshold_secs);
    config.stall.interval = Duration::from_secs(args.watchdog_interval_secs.max(1));
    config.mitigation.per_batch = args.mitigation == MitigationArg::PerBatchAndRetry;
    config
}

async fn print_events(mut rx: UnboundedReceiver<ScrapeEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ScrapeEvent::Phase(phase) => debug!(?phase, "phase changed"),
            ScrapeEvent::RetryScheduled {
                index,
                attempt,
                delay,
            } => debug!(index, attempt, delay_ms = delay.as_millis() as u64, "retry scheduled"),
            ScrapeEvent::Status(message) => info!("{message}"),
            ScrapeEvent::Error(err) => warn!("{err}"),
            ScrapeEvent::PageProgress {
                page,
                end_page,
                found,
                total_urls,
            } => info!("page {page}/{end_page}: {found} new urls, {total_urls} total"),
            ScrapeEvent::ItemProgress { url, progress, .. } => info!(
                "property {}/{} (batch {}/{}, {}%) {url}",
                progress.overall_current,
                progress.overall_total,
                progress.current_batch,
                progress.total_batches,
                progress.overall_percent()
            ),
            ScrapeEvent::ItemFinished {
                index,
                status,
                path,
            } => debug!(index, status = status.label(), path = ?path, "property finished"),
            ScrapeEvent::Completed(summary) => println!(
                "finished scrape: results={} success={} errors={} partial={}",
                summary.total_results,
                summary.total_success,
                summary.total_errors,
                summary.partial_scrape
            ),
            ScrapeEvent::ExportReady(path) => println!("export written: {}", path.display()),
        }
    }
}

/// The first interrupt stops the job gracefully. Returns true once a second
/// one arrives.
async fn interrupted_twice<F, Fut>(controller: &Controller, mut next_signal: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    if let Err(err) = next_signal().await {
        warn!(error = %err, "interrupt handler unavailable");
        return false;
    }
    info!("stop requested, finishing the current property (interrupt again to exit)");
    controller.stop();
    match next_signal().await {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, "interrupt handler closed");
            false
        }
    }
}

async fn run_scrape(args: ScrapeArgs) -> anyhow::Result<()> {
    let config = scrape_config(&args);
    let page_script = match &args.extractor_script {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading extractor script {}", path.display()))?,
        None => DEFAULT_PAGE_SCRIPT.to_string(),
    };
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("webdriver client build failed")?;
    let ctx = WebDriverSession::connect(
        client,
        &args.webdriver_url,
        args.browser,
        args.headless,
        page_script,
        config.bridge.overall_timeout,
    )
    .await
    .with_context(|| format!("could not open a browser session at {}", args.webdriver_url))?;
    info!(session = ctx.session_id(), browser = ?args.browser, "browser session ready");

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(rx));
    let controller = Arc::new(Controller::new(
        config,
        StateStore::new(&args.state_file),
        tx,
    ));

    let interrupt = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if interrupted_twice(&controller, tokio::signal::ctrl_c).await {
                warn!("second interrupt, exiting now");
                std::process::exit(130);
            }
        })
    };
    let interrupt_guard = AbortTaskOnDrop(interrupt.abort_handle());

    let request = StartRequest {
        url: args.url.clone(),
        start_page: args.start_page,
        end_page: args.end_page,
        delay: Duration::from_millis(args.delay_ms),
        resume: args.resume,
    };
    let outcome = controller.start(ctx, request).await;
    drop(interrupt_guard);

    let result = match outcome {
        Ok(_) if args.no_export => Ok(()),
        Ok(_) => match controller.download_export(args.format, None, &args.output_dir) {
            Ok(_) => Ok(()),
            Err(ScrapeError::NoData) => {
                warn!("no records to export");
                Ok(())
            }
            Err(err) => Err(anyhow::Error::new(err).context("export failed")),
        },
        Err(err) => Err(anyhow::Error::new(err).context("scrape failed")),
    };

    drop(controller);
    let _ = interrupt.await;
    let _ = printer.await;
    result
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Command::Scrape(args) => run_scrape(args).await,
        Command::Export {
            state_file,
            output,
            format,
        } => {
            let (tx, rx) = mpsc::unbounded_channel();
            let controller = Controller::new(ScrapeConfig::default(), StateStore::new(state_file), tx);
            drop(rx);
            let path = controller
                .download_export(format, output, Path::new("."))
                .context("export failed")?;
            println!("{}", path.display());
            Ok(())
        }
        Command::Status { state_file, json } => {
            let (tx, _rx) = mpsc::unbounded_channel();
            let controller = Controller::new(ScrapeConfig::default(), StateStore::new(state_file), tx);
            let report = controller.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let batch = controller.batch_info();
                println!(
                    "processing={} urls={} scraped={} success={} errors={} progress={}% batch={}/{}",
                    report.is_processing,
                    report.total_urls,
                    report.scraped_count,
                    report.success_count,
                    report.error_count,
                    report.progress,
                    batch.current_batch.min(batch.total_batches),
                    batch.total_batches
                );
            }
            Ok(())
        }
        Command::Reset { state_file } => {
            let store = StateStore::new(state_file);
            store.reset(|_| {}).context("reset failed")?;
            println!("job state reset: {}", store.path().display());
            Ok(())
        }
    }
}
