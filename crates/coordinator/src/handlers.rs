//! Executors for the secondary work discovery defers to the task queue.
//!
//! Every dispatched task runs on its own tokio task. Handlers push each
//! updated record to the caller together with its current filter verdict
//! and fold it into the session, even when the handler itself fails.

use scrape_hive_common::utils::{clean_phone, normalize_address};
use scrape_hive_common::{
    apply_filters, BusinessRecord, CapabilityChecker, CrawlConfig, CrawlUpdate, Extractor,
    FilterSet, PageError, RecordUpdate, SessionStore, TaskKind,
};
use scrape_hive_worker::{
    BrowserManager, Dispatch, EnqueueOptions, Metrics, PageHandle, TaskQueue,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::CrawlError;

/// What detail and enrichment tasks carry through the queue
#[derive(Debug, Clone)]
pub struct TaskPayload {
    pub session_id: String,
    pub record: BusinessRecord,
    pub filters: Option<FilterSet>,
}

/// Everything the controller and the task handlers share
pub(crate) struct CrawlContext {
    pub config: CrawlConfig,
    pub browser: BrowserManager,
    pub queue: TaskQueue<TaskPayload>,
    pub sessions: SessionStore,
    pub extractor: Arc<dyn Extractor>,
    pub checker: Arc<dyn CapabilityChecker>,
    pub updates: mpsc::UnboundedSender<CrawlUpdate>,
    pub metrics: Option<Metrics>,
    /// First fatal fault of the current run
    fatal: Mutex<Option<String>>,
}

impl CrawlContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CrawlConfig,
        browser: BrowserManager,
        queue: TaskQueue<TaskPayload>,
        sessions: SessionStore,
        extractor: Arc<dyn Extractor>,
        checker: Arc<dyn CapabilityChecker>,
        updates: mpsc::UnboundedSender<CrawlUpdate>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            config,
            browser,
            queue,
            sessions,
            extractor,
            checker,
            updates,
            metrics,
            fatal: Mutex::new(None),
        }
    }

    /// Keep the first reason; later faults are usually consequences of it
    pub fn record_fatal(&self, reason: impl Into<String>) {
        let mut fatal = self.fatal.lock().unwrap_or_else(|p| p.into_inner());
        if fatal.is_none() {
            *fatal = Some(reason.into());
        }
    }

    pub fn clear_fatal(&self) {
        *self.fatal.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn check_fatal(&self) -> Result<(), CrawlError> {
        match self.fatal.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            Some(reason) => Err(CrawlError::Fatal(reason)),
            None => Ok(()),
        }
    }

    /// Send a record to the caller with its current filter verdict
    pub fn announce(&self, record: &BusinessRecord, filters: Option<&FilterSet>) {
        let update = RecordUpdate {
            record: record.clone(),
            matches_filters: apply_filters(record, filters),
        };
        // The caller may have stopped listening
        let _ = self.updates.send(CrawlUpdate::Record(update));
    }

    /// Announce an updated record and fold it into its session
    pub async fn publish(&self, payload: &TaskPayload, record: &BusinessRecord) {
        self.announce(record, payload.filters.as_ref());
        if let Err(e) = self
            .sessions
            .merge_result(&payload.session_id, record.clone())
            .await
        {
            warn!(
                session_id = %payload.session_id,
                place_id = %record.place_id,
                "Failed to store updated record: {}",
                e
            );
        }
    }
}

/// Navigate, retrying transient failures with a linear backoff.
///
/// A load only counts when the page also renders the configured content
/// marker. Closed pages are not retried; the browser is gone.
pub(crate) async fn navigate_with_retry(
    config: &CrawlConfig,
    page: &dyn PageHandle,
    url: &str,
) -> Result<(), CrawlError> {
    let attempts = config.navigation_attempts.max(1);

    for attempt in 0..attempts {
        let failure = match page.navigate(url, config.navigation_timeout).await {
            Ok(()) => match &config.content_marker {
                None => return Ok(()),
                Some(marker) => {
                    if page.content().await?.contains(marker.as_str()) {
                        return Ok(());
                    }
                    format!("page does not contain `{}`", marker)
                }
            },
            Err(e) if !e.is_retryable() => return Err(e.into()),
            Err(e) => e.to_string(),
        };

        warn!(
            url = %url,
            attempt = attempt + 1,
            attempts,
            "Navigation attempt failed: {}",
            failure
        );

        if attempt + 1 < attempts {
            tokio::time::sleep(config.navigation_backoff_step * (attempt + 1)).await;
        }
    }

    Err(CrawlError::NavigationExhausted {
        url: url.to_string(),
        attempts,
    })
}

/// Wait for the detail marker, giving slow panels a few more chances.
/// Gives up early when the page lost its content marker (blocked or redirected).
pub(crate) async fn wait_for_selector_with_retry(
    config: &CrawlConfig,
    page: &dyn PageHandle,
    selector: &str,
    timeout: Duration,
) -> Result<(), CrawlError> {
    let attempts = config.detail_selector_retries + 1;
    let mut last_error = None;

    for attempt in 0..attempts {
        match page.wait_for_selector(selector, timeout).await {
            Ok(()) => return Ok(()),
            Err(PageError::Closed) => return Err(PageError::Closed.into()),
            Err(e) => {
                debug!(
                    selector = %selector,
                    attempt = attempt + 1,
                    "Selector wait failed: {}",
                    e
                );
                last_error = Some(e);
            }
        }

        if attempt + 1 < attempts {
            if let Some(marker) = &config.content_marker {
                if !page.content().await?.contains(marker.as_str()) {
                    warn!(selector = %selector, "Page lost its content marker, not waiting further");
                    break;
                }
            }
            tokio::time::sleep(config.selector_retry_delay).await;
        }
    }

    Err(last_error
        .unwrap_or_else(|| PageError::Selector {
            selector: selector.to_string(),
            reason: "page content changed".to_string(),
        })
        .into())
}

/// Open the listing's detail page and merge its contact fields
pub(crate) async fn fetch_detail(
    ctx: &CrawlContext,
    payload: &TaskPayload,
) -> Result<serde_json::Value, CrawlError> {
    let mut record = payload.record.clone();
    let page_id = format!("detail_{}", record.place_id);

    let (page, page_id) = match ctx.browser.new_page(Some(page_id)).await {
        Ok(opened) => opened,
        Err(e) => {
            ctx.publish(payload, &record).await;
            return Err(e.into());
        }
    };

    let outcome = load_detail(ctx, page.as_ref(), &mut record).await;
    ctx.browser.close_page(&page_id).await;

    if let Err(e) = outcome {
        // Keep whatever was extracted before the failure
        ctx.publish(payload, &record).await;
        return Err(e);
    }

    let wants_enrichment = payload
        .filters
        .as_ref()
        .is_some_and(FilterSet::needs_enrichment);

    if wants_enrichment && record.phone.is_some() {
        let options = EnqueueOptions {
            priority: ctx.config.enrichment_priority,
            id: Some(format!("enrich:{}", record.place_id)),
            ..Default::default()
        };
        let next = TaskPayload {
            record: record.clone(),
            ..payload.clone()
        };
        ctx.queue.enqueue(TaskKind::EnrichmentCheck, next, options);
    } else {
        ctx.publish(payload, &record).await;
    }

    Ok(json!({ "placeId": record.place_id, "phone": record.phone }))
}

async fn load_detail(
    ctx: &CrawlContext,
    page: &dyn PageHandle,
    record: &mut BusinessRecord,
) -> Result<(), CrawlError> {
    let config = &ctx.config;

    navigate_with_retry(config, page, &record.google_url).await?;
    wait_for_selector_with_retry(
        config,
        page,
        &config.detail_selector,
        config.detail_selector_timeout,
    )
    .await?;

    let markup = page.content().await?;
    let fields = ctx.extractor.extract_detail(&markup);

    if let Some(address) = fields.address {
        record.address = address;
    }
    if fields.phone.is_some() {
        record.phone = fields.phone;
    }
    if fields.website.is_some() {
        record.biz_website = fields.website;
    }
    record.is_verified = record.is_verified || fields.verified;

    if page.click(&config.overlay_close_selector).await.is_ok() {
        tokio::time::sleep(config.overlay_settle_delay).await;
    }

    record.address = normalize_address(&record.address);
    Ok(())
}

/// Run the messaging-capability check and merge its verdict.
///
/// Never fails: the record is published whatever the checker says.
pub(crate) async fn check_enrichment(
    ctx: &CrawlContext,
    payload: &TaskPayload,
) -> Result<serde_json::Value, CrawlError> {
    let mut record = payload.record.clone();
    record.has_messaging = false;
    record.is_chatbot = false;

    if let Some(phone) = record.phone.as_deref() {
        let cleaned = clean_phone(phone);
        let strict = payload.filters.as_ref().map_or(true, FilterSet::strict_mode);
        let result = ctx.checker.check_capability(&cleaned, strict).await;

        if let Some(error) = &result.error {
            debug!(
                place_id = %record.place_id,
                checker = ctx.checker.name(),
                "Capability check negative: {}",
                error
            );
        }

        record.has_messaging = result.present;
        if result.present {
            record.messaging_number = result.number.or(Some(cleaned));
            record.is_chatbot = result.secondary_flag;
        }
    }

    ctx.publish(payload, &record).await;
    Ok(json!({ "placeId": record.place_id, "hasMessaging": record.has_messaging }))
}

async fn execute(
    ctx: &CrawlContext,
    kind: &TaskKind,
    payload: &TaskPayload,
) -> Result<serde_json::Value, CrawlError> {
    match kind {
        TaskKind::DetailFetch => fetch_detail(ctx, payload).await,
        TaskKind::EnrichmentCheck => check_enrichment(ctx, payload).await,
        TaskKind::Other(name) => Err(CrawlError::UnknownTaskKind(name.clone())),
    }
}

/// Drain dispatches until the queue goes away
pub(crate) async fn run_executor(
    ctx: Arc<CrawlContext>,
    mut dispatches: mpsc::UnboundedReceiver<Dispatch<TaskPayload>>,
) {
    while let Some(Dispatch { task, completion }) = dispatches.recv().await {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            debug!(
                task_id = %task.id,
                kind = %task.kind,
                attempt = task.retry_count + 1,
                "Executing task"
            );

            match execute(&ctx, &task.kind, &task.payload).await {
                Ok(result) => completion.success(result),
                Err(e) => {
                    warn!(task_id = %task.id, kind = %task.kind, "Task failed: {}", e);
                    completion.failure(e.to_string());
                }
            }
        });
    }

    info!("Task executor stopped");
}
