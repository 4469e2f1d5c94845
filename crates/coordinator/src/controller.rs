use scrape_hive_common::utils::{build_search_url, parse_rating};
use scrape_hive_common::{
    BrowserConfig, BrowserStats, BusinessRecord, CapabilityChecker, CrawlConfig, CrawlUpdate,
    Extractor, FilterSet, ListingNode, LocationContext, QueueConfig, QueueStats, RunState,
    ScraperSettings, SessionStatus, SessionStore, StartRequest, TaskKind,
};
use scrape_hive_worker::{
    BrowserDriver, BrowserEvent, BrowserManager, EnqueueOptions, Metrics, PageHandle, QueueEvent,
    TaskQueue,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CrawlError;
use crate::handlers::{navigate_with_retry, run_executor, CrawlContext, TaskPayload};

/// Scrolls the results feed by one screen
const SCROLL_FEED_SCRIPT: &str =
    r#"document.querySelector('div[role="feed"]')?.scrollBy(0, 1000)"#;

/// Component configuration of one controller
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    pub crawl: CrawlConfig,
    pub queue: QueueConfig,
    pub browser: BrowserConfig,
}

impl From<&ScraperSettings> for ControllerConfig {
    fn from(settings: &ScraperSettings) -> Self {
        Self {
            crawl: settings.crawl_config(),
            queue: settings.queue_config(),
            browser: settings.browser_config(),
        }
    }
}

/// External pieces a controller is built from
pub struct Collaborators {
    pub driver: Arc<dyn BrowserDriver>,
    pub sessions: SessionStore,
    pub extractor: Arc<dyn Extractor>,
    pub checker: Arc<dyn CapabilityChecker>,
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlStats {
    pub queue: QueueStats,
    pub browser: BrowserStats,
    pub session_id: Option<String>,
    pub running: bool,
}

/// Per-run discovery progress; survives page recoveries
struct Discovery {
    session_id: String,
    filters: Option<FilterSet>,
    location: LocationContext,
    /// Feed entries already handled, in document order
    processed: usize,
    seen: HashSet<String>,
    /// Queue outcomes since the run started, checked for critical failures
    task_events: broadcast::Receiver<QueueEvent<TaskPayload>>,
}

/// Clears the running flag however `start` exits
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, CrawlError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| CrawlError::AlreadyRunning)?;
        Ok(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Pause dispatching while the browser is down and resume once it is back.
/// A failed restart is reported through `on_fatal`.
pub fn link_browser_to_queue<P, F>(
    mut events: broadcast::Receiver<BrowserEvent>,
    queue: TaskQueue<P>,
    on_fatal: F,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    P: Clone + Send + Sync + 'static,
    F: Fn(String) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(BrowserEvent::Crashed) => {
                    warn!("Browser crashed, pausing task dispatch");
                    queue.pause();
                }
                Ok(BrowserEvent::Restarted { restart_count }) => {
                    info!(restart_count, "Browser restarted, resuming task dispatch");
                    queue.resume();
                }
                Ok(BrowserEvent::RestartFailed(e)) => {
                    error!("Browser could not be restarted: {}", e);
                    on_fatal(e.to_string());
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Browser event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Drives one crawl run at a time: discovery on the search page, secondary
/// work through the task queue, and the session record throughout.
pub struct CrawlController {
    ctx: Arc<CrawlContext>,
    running: AtomicBool,
    run_token: Mutex<CancellationToken>,
    session_id: Mutex<Option<String>>,
    background: CancellationToken,
}

impl CrawlController {
    /// Build the controller and its background workers.
    ///
    /// Must be called inside a tokio runtime. The receiver yields every
    /// record update and run state change.
    pub fn new(
        config: ControllerConfig,
        collaborators: Collaborators,
    ) -> (Self, mpsc::UnboundedReceiver<CrawlUpdate>) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (queue, dispatches) = TaskQueue::new(config.queue);
        let browser = BrowserManager::new(config.browser, collaborators.driver);

        let ctx = Arc::new(CrawlContext::new(
            config.crawl,
            browser,
            queue,
            collaborators.sessions,
            collaborators.extractor,
            collaborators.checker,
            updates_tx,
            collaborators.metrics,
        ));
        let background = CancellationToken::new();

        tokio::spawn(run_executor(ctx.clone(), dispatches));

        let fatal_ctx = Arc::downgrade(&ctx);
        link_browser_to_queue(
            ctx.browser.subscribe(),
            ctx.queue.clone(),
            move |reason| {
                if let Some(ctx) = fatal_ctx.upgrade() {
                    ctx.record_fatal(reason);
                }
            },
            background.clone(),
        );

        tokio::spawn(watch_queue_events(
            Arc::downgrade(&ctx),
            ctx.queue.subscribe(),
            background.clone(),
        ));

        let controller = Self {
            ctx,
            running: AtomicBool::new(false),
            run_token: Mutex::new(CancellationToken::new()),
            session_id: Mutex::new(None),
            background,
        };
        (controller, updates_rx)
    }

    fn emit_state(&self, state: RunState) {
        let _ = self.ctx.updates.send(CrawlUpdate::State { state });
    }

    /// Run one crawl to completion.
    ///
    /// Resolves with the session's records once discovery hit the end of
    /// the list and the queue drained, or with what was collected so far
    /// after `stop`. Fails on fatal browser faults, critical task
    /// failures and exhausted navigation.
    pub async fn start(&self, request: StartRequest) -> Result<Vec<BusinessRecord>, CrawlError> {
        let _guard = RunGuard::acquire(&self.running)?;

        let url = build_search_url(&request.target, &request.location)
            .map_err(|e| CrawlError::InvalidTarget(e.to_string()))?;

        self.emit_state(RunState::Queued);
        self.ctx.clear_fatal();

        let dropped = self.ctx.queue.clear();
        if dropped > 0 {
            debug!(dropped, "Dropped tasks left over from the previous run");
        }
        self.ctx.queue.resume();
        let task_events = self.ctx.queue.subscribe();

        let session_id = self
            .ctx
            .sessions
            .create_session(request.target.as_text(), request.filters.clone())
            .await?;
        *self.lock_session() = Some(session_id.clone());

        let token = CancellationToken::new();
        *self.run_token.lock().unwrap_or_else(|p| p.into_inner()) = token.clone();

        info!(session_id = %session_id, url = %url, "Crawl started");
        self.emit_state(RunState::Discovering);

        let mut discovery = Discovery {
            session_id: session_id.clone(),
            filters: request.filters,
            location: request.location,
            processed: 0,
            seen: HashSet::new(),
            task_events,
        };
        let outcome = self.run(&mut discovery, &url, &token).await;

        let sessions = &self.ctx.sessions;
        match outcome {
            Ok(()) if token.is_cancelled() => {
                sessions
                    .update_status(&session_id, SessionStatus::Paused, None)
                    .await?;
                info!(session_id = %session_id, processed = discovery.processed, "Crawl paused");
                self.emit_state(RunState::Paused);
            }
            Ok(()) => {
                sessions
                    .update_status(&session_id, SessionStatus::Completed, None)
                    .await?;
                info!(session_id = %session_id, processed = discovery.processed, "Crawl completed");
                self.emit_state(RunState::Completed);
            }
            Err(e) => {
                let reason = e.to_string();
                error!(session_id = %session_id, "Crawl failed: {}", reason);
                if let Err(store_err) = sessions
                    .update_status(&session_id, SessionStatus::Failed, Some(reason.clone()))
                    .await
                {
                    warn!(session_id = %session_id, "Failed to mark session failed: {}", store_err);
                }
                self.emit_state(RunState::Failed(reason));
                return Err(e);
            }
        }

        Ok(sessions
            .get_session(&session_id)
            .await
            .map(|session| session.results)
            .unwrap_or_default())
    }

    /// Discovery (reopening the page after browser restarts) followed by the drain
    async fn run(
        &self,
        discovery: &mut Discovery,
        url: &str,
        token: &CancellationToken,
    ) -> Result<(), CrawlError> {
        let mut recoveries = 0;

        loop {
            match self.discover(discovery, url, token).await {
                Ok(()) => break,
                Err(e)
                    if e.is_recoverable()
                        && !token.is_cancelled()
                        && recoveries < self.ctx.config.discovery_recoveries =>
                {
                    recoveries += 1;
                    warn!(
                        session_id = %discovery.session_id,
                        recoveries,
                        processed = discovery.processed,
                        "Discovery page lost, reopening: {}",
                        e
                    );
                    self.ctx.check_fatal()?;
                }
                Err(e) => return Err(e),
            }
        }

        self.wait_for_drain(&mut discovery.task_events, token).await
    }

    async fn discover(
        &self,
        discovery: &mut Discovery,
        url: &str,
        token: &CancellationToken,
    ) -> Result<(), CrawlError> {
        let page_id = format!("search_{}", discovery.session_id);
        let (page, page_id) = self.ctx.browser.new_page(Some(page_id)).await?;

        let result = self.scroll_feed(page.as_ref(), discovery, url, token).await;
        self.ctx.browser.close_page(&page_id).await;
        result
    }

    async fn scroll_feed(
        &self,
        page: &dyn PageHandle,
        discovery: &mut Discovery,
        url: &str,
        token: &CancellationToken,
    ) -> Result<(), CrawlError> {
        let ctx = &self.ctx;
        navigate_with_retry(&ctx.config, page, url).await?;

        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            self.absorb_task_failures(&mut discovery.task_events);
            ctx.check_fatal()?;

            let cookies = page.cookies().await?;
            if let Err(e) = ctx.sessions.save_cookies(&discovery.session_id, cookies).await {
                warn!(session_id = %discovery.session_id, "Failed to save cookies: {}", e);
            }

            let markup = page.content().await?;
            let nodes = ctx.extractor.extract_listing_nodes(&markup);

            let processed_before = discovery.processed;
            let mut batch = Vec::new();
            for node in nodes.iter().skip(discovery.processed) {
                discovery.processed += 1;
                if let Some(record) = self.surface(discovery, node) {
                    batch.push(record);
                }
            }

            if discovery.processed > processed_before {
                debug!(
                    session_id = %discovery.session_id,
                    new_records = batch.len(),
                    processed = discovery.processed,
                    "Feed batch extracted"
                );
                // Persisted before any detail task can merge into it
                ctx.sessions
                    .update_progress(
                        &discovery.session_id,
                        Some(discovery.processed),
                        batch.clone(),
                    )
                    .await?;
            }

            for record in batch {
                let options = EnqueueOptions {
                    priority: ctx.config.detail_priority,
                    id: Some(format!("detail:{}", record.place_id)),
                    ..Default::default()
                };
                let payload = TaskPayload {
                    session_id: discovery.session_id.clone(),
                    record,
                    filters: discovery.filters.clone(),
                };
                ctx.queue.enqueue(TaskKind::DetailFetch, payload, options);
            }

            if nodes.last().is_some_and(|node| ctx.extractor.is_end_of_list(node)) {
                info!(
                    session_id = %discovery.session_id,
                    processed = discovery.processed,
                    "Reached the end of the list"
                );
                return Ok(());
            }

            page.evaluate(SCROLL_FEED_SCRIPT).await?;
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(ctx.config.scroll_delay) => {}
            }
        }
    }

    /// Turn a fresh feed entry into a record and show it to the caller
    fn surface(&self, discovery: &mut Discovery, node: &ListingNode) -> Option<BusinessRecord> {
        if !node.is_listing() {
            return None;
        }

        let extractor = &self.ctx.extractor;
        let mut record = extractor.node_to_record(node)?;
        if !discovery.seen.insert(record.place_id.clone()) {
            debug!(place_id = %record.place_id, "Listing already seen in this run");
            return None;
        }

        record.stamp_location(&discovery.location);
        record.is_verified = extractor.detect_verification_badge(&node.markup);
        record.rating_value = parse_rating(&record.stars);

        self.ctx.announce(&record, discovery.filters.as_ref());
        if let Some(metrics) = &self.ctx.metrics {
            metrics.records_discovered.inc();
        }
        Some(record)
    }

    /// Turn terminal failures of critical task kinds into a fatal run fault
    fn absorb_task_failures(&self, events: &mut broadcast::Receiver<QueueEvent<TaskPayload>>) {
        loop {
            match events.try_recv() {
                Ok(QueueEvent::Failed { task, error })
                    if self.ctx.config.critical_task_kinds.contains(&task.kind) =>
                {
                    error!(task_id = %task.id, kind = %task.kind, "Critical task failed: {}", error);
                    self.ctx
                        .record_fatal(format!("Task {} failed: {}", task.id, error));
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed queue outcomes while checking for critical failures");
                }
                Err(_) => break,
            }
        }
    }

    async fn wait_for_drain(
        &self,
        task_events: &mut broadcast::Receiver<QueueEvent<TaskPayload>>,
        token: &CancellationToken,
    ) -> Result<(), CrawlError> {
        let queue = &self.ctx.queue;

        loop {
            // Outcomes are published before a task leaves the queue, so
            // reading them after the emptiness check misses none
            let drained = queue.queue_length() == 0 && queue.active_tasks_count() == 0;
            self.absorb_task_failures(task_events);
            self.ctx.check_fatal()?;

            if drained || token.is_cancelled() {
                return Ok(());
            }

            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.ctx.config.drain_poll_interval) => {}
            }
        }
    }

    /// Ask the current run to halt; its session is left paused
    pub fn stop(&self) {
        info!("Stop requested");
        self.run_token
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .cancel();
        self.ctx.queue.pause();
    }

    /// Stop and release the queue, the background workers and the browser
    pub async fn shutdown(&self) {
        self.stop();
        self.ctx.queue.shutdown();
        self.background.cancel();
        self.ctx.browser.shutdown().await;
        info!("Crawl controller shut down");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.ctx.sessions
    }

    pub async fn stats(&self) -> CrawlStats {
        let session_id = self.lock_session().clone();
        CrawlStats {
            queue: self.ctx.queue.stats(),
            browser: self.ctx.browser.stats().await,
            session_id,
            running: self.is_running(),
        }
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.session_id.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Keep metrics current and log task outcomes
async fn watch_queue_events(
    ctx: std::sync::Weak<CrawlContext>,
    mut events: broadcast::Receiver<QueueEvent<TaskPayload>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(ctx) = ctx.upgrade() else {
            break;
        };

        match event {
            Ok(QueueEvent::Failed { task, error }) => {
                debug!(task_id = %task.id, kind = %task.kind, "Task dropped: {}", error);
            }
            Ok(QueueEvent::Retrying {
                task,
                attempt,
                backoff,
            }) => {
                debug!(task_id = %task.id, attempt, backoff = ?backoff, "Task scheduled for retry");
            }
            Ok(QueueEvent::Completed { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Queue event listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }

        if let Some(metrics) = &ctx.metrics {
            metrics.observe_queue(&ctx.queue.stats());
            metrics.observe_browser(&ctx.browser.stats().await);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::MapsExtractor;
    use async_trait::async_trait;
    use scrape_hive_common::{BrowserError, CapabilityResult, RecordUpdate};
    use scrape_hive_worker::testing::{MockDriver, PageScript};
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    struct AlwaysPresent;

    #[async_trait]
    impl CapabilityChecker for AlwaysPresent {
        async fn check_capability(&self, _phone: &str, _strict: bool) -> CapabilityResult {
            CapabilityResult {
                present: true,
                ..Default::default()
            }
        }

        fn name(&self) -> &str {
            "always_present"
        }
    }

    fn place_url(name: &str) -> String {
        format!("https://www.google.com/maps/place/{}/data=!4m7", name)
    }

    fn feed(names: &[&str], end: bool) -> String {
        let mut markup = String::from(r#"<html><body><div role="feed">"#);
        for name in names {
            markup.push_str(&format!(
                r#"<div><a href="{}"></a><div role="heading">{}</div><span><span role="img" aria-label="4.5 stars"></span><span>(12)</span></span><span>Cafe</span><span>1 Main St</span></div>"#,
                place_url(name),
                name
            ));
        }
        if end {
            markup.push_str("<div><p>You've reached the end of the list.</p></div>");
        }
        markup.push_str("</div></body></html>");
        markup
    }

    fn detail(phone: &str) -> String {
        format!(
            r#"<html><body><div role="main" aria-label="x"><button data-item-id="address">&#xe0c8;1 Main St, Springfield</button><button data-item-id="phone:tel:{}"></button></div></body></html>"#,
            phone
        )
    }

    fn script(snapshots: Vec<String>, names: &[&str]) -> PageScript {
        let pages: HashMap<String, String> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (place_url(name), detail(&format!("+1555010{:04}", i))))
            .collect();
        PageScript {
            feed_snapshots: snapshots,
            pages,
            ..Default::default()
        }
    }

    struct Harness {
        controller: Arc<CrawlController>,
        updates: mpsc::UnboundedReceiver<CrawlUpdate>,
        driver: MockDriver,
        _dir: TempDir,
    }

    impl Harness {
        fn drain_updates(&mut self) -> Vec<CrawlUpdate> {
            let mut updates = Vec::new();
            while let Ok(update) = self.updates.try_recv() {
                updates.push(update);
            }
            updates
        }
    }

    async fn harness(script: PageScript, tune: impl FnOnce(&mut ControllerConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionStore::open(dir.path()).await.unwrap();
        let driver = MockDriver::with_script(script);

        let mut config = ControllerConfig::default();
        config.crawl.content_marker = None;
        config.queue.rate_limit = Duration::ZERO;
        config.queue.concurrency = 3;
        tune(&mut config);

        let (controller, updates) = CrawlController::new(
            config,
            Collaborators {
                driver: Arc::new(driver.clone()),
                sessions,
                extractor: Arc::new(MapsExtractor::new().unwrap()),
                checker: Arc::new(AlwaysPresent),
                metrics: None,
            },
        );

        Harness {
            controller: Arc::new(controller),
            updates,
            driver,
            _dir: dir,
        }
    }

    fn states(updates: &[CrawlUpdate]) -> Vec<RunState> {
        updates
            .iter()
            .filter_map(|u| match u {
                CrawlUpdate::State { state } => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    fn records_for<'a>(updates: &'a [CrawlUpdate], place_id: &str) -> Vec<&'a RecordUpdate> {
        updates
            .iter()
            .filter_map(|u| match u {
                CrawlUpdate::Record(r) if r.record.place_id == place_id => Some(r),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_discovers_scrolls_and_enriches_details() {
        let names = ["Alpha", "Bravo", "Charlie"];
        let snapshots = vec![feed(&names[..2], false), feed(&names, true)];
        let mut h = harness(script(snapshots, &names), |_| {}).await;

        let results = h
            .controller
            .start(StartRequest::query("cafes"))
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        let mut ids: Vec<&str> = results.iter().map(|r| r.place_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["Alpha", "Bravo", "Charlie"]);
        for record in &results {
            assert!(record.phone.as_deref().unwrap().starts_with("+1555010"));
            assert_eq!(record.address, "1 Main St, Springfield");
            assert_eq!(record.rating_value, 4.5);
        }

        let updates = h.drain_updates();
        assert_eq!(
            states(&updates),
            vec![RunState::Queued, RunState::Discovering, RunState::Completed]
        );
        // Surfaced on discovery, then again once the detail page was read
        let alpha = records_for(&updates, "Alpha");
        assert_eq!(alpha.len(), 2);
        assert!(alpha[0].record.phone.is_none());
        assert!(alpha[1].record.phone.is_some());

        let session_id = h.controller.stats().await.session_id.unwrap();
        let session = h.controller.sessions().get_session(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.processed_items, 4);
        assert_eq!(session.results.len(), 3);
        assert!(!h.controller.is_running());
        assert_eq!(h.controller.stats().await.browser.open_pages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_verdict_is_reannounced_after_enrichment() {
        let names = ["Alpha"];
        let mut h = harness(script(vec![feed(&names, true)], &names), |_| {}).await;

        let filters = FilterSet {
            requires_messaging: true,
            ..Default::default()
        };
        let request = StartRequest::query("cafes")
            .with_location(LocationContext {
                city: Some("Springfield".to_string()),
                country: None,
            })
            .with_filters(filters);
        let results = h.controller.start(request).await.unwrap();

        assert!(results[0].has_messaging);
        assert_eq!(results[0].messaging_number.as_deref(), Some("+15550100000"));
        assert_eq!(results[0].city.as_deref(), Some("Springfield"));

        let updates = h.drain_updates();
        let alpha = records_for(&updates, "Alpha");
        assert_eq!(alpha.len(), 2);
        assert!(!alpha[0].matches_filters);
        assert!(alpha[1].matches_filters);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_leaves_session_paused() {
        let names = ["Alpha", "Bravo"];
        // Never reaches the end of the list
        let mut h = harness(script(vec![feed(&names, false)], &names), |_| {}).await;

        let controller = h.controller.clone();
        let run = tokio::spawn(async move { controller.start(StartRequest::query("cafes")).await });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.controller.is_running());
        h.controller.stop();

        let results = run.await.unwrap().unwrap();
        assert!(results.len() <= 2);

        let updates = h.drain_updates();
        assert_eq!(states(&updates).last(), Some(&RunState::Paused));

        let session_id = h.controller.stats().await.session_id.unwrap();
        let session = h.controller.sessions().get_session(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected_while_running() {
        let names = ["Alpha"];
        let h = harness(script(vec![feed(&names, false)], &names), |_| {}).await;

        let controller = h.controller.clone();
        let run = tokio::spawn(async move { controller.start(StartRequest::query("cafes")).await });
        tokio::time::sleep(Duration::from_secs(2)).await;

        let second = h.controller.start(StartRequest::query("bars")).await;
        assert!(matches!(second, Err(CrawlError::AlreadyRunning)));

        h.controller.stop();
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_in_flight_survive_browser_crash() {
        let names = ["Alpha", "Bravo", "Charlie"];
        let mut script = script(vec![feed(&names, true)], &names);
        script.navigation_delay = Duration::from_secs(5);
        let mut h = harness(script, |_| {}).await;

        let controller = h.controller.clone();
        let run = tokio::spawn(async move { controller.start(StartRequest::query("cafes")).await });

        while h.controller.stats().await.queue.active_tasks < 3 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        h.driver.crash_current();

        let results = run.await.unwrap().unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.phone.is_some()));

        let stats = h.controller.stats().await;
        assert_eq!(stats.queue.total_retried, 3);
        assert_eq!(stats.queue.total_failed, 0);
        assert_eq!(stats.queue.total_completed, 3);
        assert_eq!(stats.browser.total_restarts, 1);
        assert_eq!(h.driver.launch_count(), 2);
        assert_eq!(states(&h.drain_updates()).last(), Some(&RunState::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_reopens_page_after_restart() {
        let names = ["Alpha", "Bravo", "Charlie"];
        let snapshots = vec![
            feed(&names[..1], false),
            feed(&names[..2], false),
            feed(&names[..2], false),
            feed(&names, true),
        ];
        let h = harness(script(snapshots, &names), |_| {}).await;

        let controller = h.controller.clone();
        let run = tokio::spawn(async move { controller.start(StartRequest::query("cafes")).await });

        tokio::time::sleep(Duration::from_millis(1700)).await;
        h.driver.crash_current();

        let results = run.await.unwrap().unwrap();
        let mut ids: Vec<&str> = results.iter().map(|r| r.place_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["Alpha", "Bravo", "Charlie"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_storm_fails_the_run() {
        let names = ["Alpha"];
        let mut h = harness(script(vec![feed(&names, false)], &names), |config| {
            config.browser.max_restarts = 0;
        })
        .await;

        let controller = h.controller.clone();
        let run = tokio::spawn(async move { controller.start(StartRequest::query("cafes")).await });

        tokio::time::sleep(Duration::from_secs(3)).await;
        h.driver.crash_current();

        let err = run.await.unwrap().unwrap_err();
        assert!(
            matches!(
                err,
                CrawlError::Browser(BrowserError::CircuitOpen { .. }) | CrawlError::Fatal(_)
            ),
            "unexpected error: {err}"
        );
        assert_eq!(h.driver.launch_count(), 1);

        let updates = h.drain_updates();
        assert!(matches!(states(&updates).last(), Some(RunState::Failed(_))));

        let session_id = h.controller.stats().await.session_id.unwrap();
        let session = h.controller.sessions().get_session(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.error_reason.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_task_failure_fails_session() {
        let names = ["Alpha"];
        let mut script = script(vec![feed(&names, true)], &names);
        script.missing_selectors.push(place_url("Alpha"));
        let h = harness(script, |config| {
            config.crawl.critical_task_kinds = vec![TaskKind::DetailFetch];
            config.crawl.detail_selector_retries = 0;
            config.queue.default_max_retries = 1;
        })
        .await;

        let err = h
            .controller
            .start(StartRequest::query("cafes"))
            .await
            .unwrap_err();
        match err {
            CrawlError::Fatal(reason) => assert!(reason.starts_with("Task detail:Alpha failed")),
            other => panic!("unexpected error: {other}"),
        }

        let stats = h.controller.stats().await;
        assert_eq!(stats.queue.total_retried, 1);
        assert_eq!(stats.queue.total_failed, 1);

        let session_id = stats.session_id.unwrap();
        let session = h.controller.sessions().get_session(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        // The partial record is still kept
        assert_eq!(session.results.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_task_kind_fails_without_handler() {
        let h = harness(PageScript::default(), |_| {}).await;
        let mut events = h.controller.ctx.queue.subscribe();

        let payload = TaskPayload {
            session_id: "none".to_string(),
            record: BusinessRecord::default(),
            filters: None,
        };
        let options = EnqueueOptions {
            max_retries: Some(0),
            ..Default::default()
        };
        h.controller
            .ctx
            .queue
            .enqueue(TaskKind::Other("map_search".to_string()), payload, options);

        match events.recv().await.unwrap() {
            QueueEvent::Failed { task, error } => {
                assert_eq!(task.kind, TaskKind::Other("map_search".to_string()));
                assert_eq!(error, "unknown task kind: map_search");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_url_target_is_rejected() {
        let h = harness(PageScript::default(), |_| {}).await;
        let err = h
            .controller
            .start(StartRequest::url("not a url"))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::InvalidTarget(_)));
        assert!(!h.controller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_pauses_queue_until_restart() {
        let driver = MockDriver::new();
        let browser = BrowserManager::new(BrowserConfig::default(), Arc::new(driver.clone()));
        let (queue, _dispatches) = TaskQueue::<u32>::new(QueueConfig::default());
        let fatal = Arc::new(Mutex::new(None::<String>));
        let recorded = fatal.clone();

        let cancel = CancellationToken::new();
        link_browser_to_queue(
            browser.subscribe(),
            queue.clone(),
            move |reason| *recorded.lock().unwrap() = Some(reason),
            cancel.clone(),
        );

        browser.acquire().await.unwrap();
        let mut events = browser.subscribe();
        driver.fail_next_launches(1);
        driver.crash_current();

        assert!(matches!(events.recv().await.unwrap(), BrowserEvent::Crashed));
        assert!(matches!(
            events.recv().await.unwrap(),
            BrowserEvent::RestartFailed(_)
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.is_paused());
        assert!(fatal.lock().unwrap().is_some());

        browser.acquire().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            BrowserEvent::Restarted { .. }
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!queue.is_paused());
        cancel.cancel();
    }
}
