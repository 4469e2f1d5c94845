//! Supervised lifecycle of the shared browser and the pages checked out of it.
//!
//! One browser is live at a time. A watcher task per launch waits on the
//! browser's disconnect token; on a crash the manager clears its handle,
//! broadcasts [`BrowserEvent::Crashed`] and relaunches under a circuit
//! breaker. The manager knows nothing about the task queue: dependents
//! subscribe to the events and react themselves.

use scrape_hive_common::{
    collect_launch_args, BrowserConfig, BrowserError, BrowserStats, RelayEndpoint,
    UserAgentMode, UserAgentRotator,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::driver::{BrowserDriver, BrowserHandle, LaunchSpec, PageHandle};

const EVENT_CAPACITY: usize = 64;

/// Health changes of the managed browser
#[derive(Debug, Clone)]
pub enum BrowserEvent {
    /// The browser disconnected on its own; pages checked out of it are gone
    Crashed,
    /// A replacement browser is up
    Restarted { restart_count: u64 },
    /// The replacement could not be launched; `CircuitOpen` means no further recovery
    RestartFailed(BrowserError),
}

struct LiveBrowser {
    handle: Arc<dyn BrowserHandle>,
    generation: u64,
    /// Stops the crash watcher of this generation
    watcher: CancellationToken,
}

/// Restart timestamps inside the rolling window
#[derive(Default)]
struct CircuitBreaker {
    restarts: VecDeque<Instant>,
    tripped: bool,
}

struct Shared {
    config: BrowserConfig,
    driver: Arc<dyn BrowserDriver>,
    browser: RwLock<Option<LiveBrowser>>,
    pages: RwLock<HashMap<String, Arc<dyn PageHandle>>>,
    /// Serializes launches; callers arriving during a restart wait here
    launch_lock: Mutex<()>,
    breaker: Mutex<CircuitBreaker>,
    /// Relay the current browser was launched behind
    relay: RwLock<Option<RelayEndpoint>>,
    events: broadcast::Sender<BrowserEvent>,
    user_agents: UserAgentRotator,
    generation: AtomicU64,
    /// Whether a browser existed since the last shutdown; later launches are restarts
    launched_before: AtomicBool,
    total_launches: AtomicU64,
    total_restarts: AtomicU64,
}

/// Owns the browser and its pages. Clones share the same browser.
#[derive(Clone)]
pub struct BrowserManager {
    shared: Arc<Shared>,
}

impl BrowserManager {
    pub fn new(config: BrowserConfig, driver: Arc<dyn BrowserDriver>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            driver = driver.name(),
            headless = config.headless,
            max_restarts = config.max_restarts,
            "Browser manager created"
        );

        Self {
            shared: Arc::new(Shared {
                config,
                driver,
                browser: RwLock::new(None),
                pages: RwLock::new(HashMap::new()),
                launch_lock: Mutex::new(()),
                breaker: Mutex::new(CircuitBreaker::default()),
                relay: RwLock::new(None),
                events,
                user_agents: UserAgentRotator::default(),
                generation: AtomicU64::new(0),
                launched_before: AtomicBool::new(false),
                total_launches: AtomicU64::new(0),
                total_restarts: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrowserEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, event: BrowserEvent) {
        // No receivers is fine
        let _ = self.shared.events.send(event);
    }

    async fn healthy_browser(&self) -> Option<Arc<dyn BrowserHandle>> {
        self.shared
            .browser
            .read()
            .await
            .as_ref()
            .filter(|live| live.handle.is_alive())
            .map(|live| live.handle.clone())
    }

    /// Current healthy browser, launching one if absent or dead
    pub async fn acquire(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
        if let Some(browser) = self.healthy_browser().await {
            return Ok(browser);
        }

        let _guard = self.shared.launch_lock.lock().await;

        // A concurrent caller may have finished a launch while we waited
        if let Some(browser) = self.healthy_browser().await {
            return Ok(browser);
        }

        self.launch_locked().await
    }

    /// Launch a browser, replacing any previous one. Caller holds `launch_lock`.
    async fn launch_locked(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
        let is_restart = self.shared.launched_before.load(Ordering::SeqCst);

        if is_restart {
            self.admit_restart().await?;
        }

        if let Some(old) = self.shared.browser.write().await.take() {
            old.watcher.cancel();
            if !old.handle.is_alive() {
                // The crash watcher has not reported this one yet
                warn!(generation = old.generation, "Replacing crashed browser");
                self.emit(BrowserEvent::Crashed);
            }
            self.close_all_pages().await;
            old.handle.close().await;
        } else if is_restart {
            self.close_all_pages().await;
        }

        let spec = self.launch_spec().await;
        self.shared.total_launches.fetch_add(1, Ordering::SeqCst);

        let handle = match self.shared.driver.launch(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Browser launch failed: {}", e);
                return Err(e);
            }
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let watcher = CancellationToken::new();

        // Stored before the watcher starts so an immediate crash finds its generation
        *self.shared.browser.write().await = Some(LiveBrowser {
            handle: handle.clone(),
            generation,
            watcher: watcher.clone(),
        });
        self.spawn_crash_watcher(handle.clone(), generation, watcher);
        self.shared.launched_before.store(true, Ordering::SeqCst);

        if is_restart {
            let restart_count = self.shared.total_restarts.fetch_add(1, Ordering::SeqCst) + 1;
            info!(restart_count, generation, "Browser restarted");
            self.emit(BrowserEvent::Restarted { restart_count });
        } else {
            info!(generation, "Browser launched");
        }

        Ok(handle)
    }

    /// Record a restart attempt, or refuse it when the window is already full
    async fn admit_restart(&self) -> Result<(), BrowserError> {
        let window = self.shared.config.restart_window;
        let max_restarts = self.shared.config.max_restarts;
        let mut breaker = self.shared.breaker.lock().await;

        let now = Instant::now();
        while let Some(oldest) = breaker.restarts.front() {
            if now.duration_since(*oldest) >= window {
                breaker.restarts.pop_front();
            } else {
                break;
            }
        }

        if breaker.tripped || breaker.restarts.len() >= max_restarts {
            breaker.tripped = true;
            error!(
                restarts = breaker.restarts.len(),
                window = ?window,
                "Restart circuit breaker open"
            );
            return Err(BrowserError::CircuitOpen {
                restarts: breaker.restarts.len(),
                window,
            });
        }

        breaker.restarts.push_back(now);
        Ok(())
    }

    async fn launch_spec(&self) -> LaunchSpec {
        let config = &self.shared.config;
        let args = collect_launch_args(&config.launch_args_middlewares, config.headless);

        let relay = match &config.proxy_provider {
            Some(provider) => match provider.next_endpoint() {
                Ok(relay) => relay,
                Err(e) => {
                    warn!(provider = provider.name(), "No relay available, launching direct: {}", e);
                    None
                }
            },
            None => None,
        };

        let proxy_server = relay.as_ref().map(RelayEndpoint::proxy_server);
        match &proxy_server {
            Some(server) => info!("Using relay: {}", server),
            None => debug!("No relay configured - using direct connection"),
        }
        *self.shared.relay.write().await = relay;

        LaunchSpec {
            headless: config.headless,
            browser_path: config.browser_path.clone(),
            args,
            proxy_server,
            idle_timeout: config.idle_browser_timeout,
            operation_timeout: config.operation_timeout,
            health_check_interval: config.health_check_interval,
        }
    }

    fn spawn_crash_watcher(
        &self,
        handle: Arc<dyn BrowserHandle>,
        generation: u64,
        stop: CancellationToken,
    ) {
        let disconnected = handle.disconnected();
        // Weak so an abandoned manager can be dropped while a browser is up
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);

        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = disconnected.cancelled() => {}
            }

            if let Some(shared) = shared.upgrade() {
                BrowserManager { shared }.handle_crash(generation).await;
            }
        });
    }

    async fn handle_crash(&self, generation: u64) {
        {
            let mut slot = self.shared.browser.write().await;
            match slot.as_ref() {
                Some(live) if live.generation == generation => {
                    slot.take();
                }
                // Already replaced or shut down
                _ => return,
            }
        }

        warn!(generation, "Browser disconnected, restarting");
        self.emit(BrowserEvent::Crashed);
        self.close_all_pages().await;

        let _guard = self.shared.launch_lock.lock().await;
        if self.healthy_browser().await.is_some() {
            return;
        }

        if let Err(e) = self.launch_locked().await {
            error!("Browser restart failed: {}", e);
            self.emit(BrowserEvent::RestartFailed(e));
        }
    }

    /// Open a page, configure it and register it under `id` (generated if None)
    pub async fn new_page(
        &self,
        id: Option<String>,
    ) -> Result<(Arc<dyn PageHandle>, String), BrowserError> {
        let page_id = id.unwrap_or_else(|| format!("page_{}", Uuid::new_v4()));

        if self.is_checked_out(&page_id).await {
            return Err(BrowserError::PageInUse(page_id));
        }

        let browser = self.acquire().await?;
        let page = browser.new_page().await?;

        if let Err(e) = self.configure_page(page.as_ref()).await {
            page.close().await;
            return Err(e);
        }

        {
            let mut pages = self.shared.pages.write().await;
            if pages.get(&page_id).is_some_and(|p| !p.is_closed()) {
                drop(pages);
                page.close().await;
                return Err(BrowserError::PageInUse(page_id));
            }
            pages.insert(page_id.clone(), page.clone());
        }

        debug!(page_id = %page_id, "Page opened");
        Ok((page, page_id))
    }

    async fn is_checked_out(&self, page_id: &str) -> bool {
        self.shared
            .pages
            .read()
            .await
            .get(page_id)
            .is_some_and(|p| !p.is_closed())
    }

    async fn configure_page(&self, page: &dyn PageHandle) -> Result<(), BrowserError> {
        let config = &self.shared.config;
        let user_agent = match config.user_agent_mode {
            UserAgentMode::Rotate => Some(self.shared.user_agents.next_agent().to_string()),
            UserAgentMode::Fixed => config.user_agent.clone(),
            UserAgentMode::BrowserDefault => None,
        };
        if let Some(user_agent) = user_agent {
            page.set_user_agent(&user_agent).await?;
        }

        let credentials = self
            .shared
            .relay
            .read()
            .await
            .as_ref()
            .and_then(RelayEndpoint::credentials);
        if let Some((username, password)) = credentials {
            page.authenticate(&username, &password).await?;
        }

        Ok(())
    }

    /// Close and deregister a page; unknown or already closed ids are ignored
    pub async fn close_page(&self, page_id: &str) {
        let page = self.shared.pages.write().await.remove(page_id);
        if let Some(page) = page {
            page.close().await;
            debug!(page_id = %page_id, "Page closed");
        }
    }

    async fn close_all_pages(&self) {
        let pages: Vec<(String, Arc<dyn PageHandle>)> =
            self.shared.pages.write().await.drain().collect();

        if !pages.is_empty() {
            debug!(count = pages.len(), "Closing tracked pages");
        }
        for (_, page) in pages {
            page.close().await;
        }
    }

    /// Close every page and the browser; the next `acquire` launches fresh
    pub async fn shutdown(&self) {
        let _guard = self.shared.launch_lock.lock().await;

        let live = self.shared.browser.write().await.take();
        self.close_all_pages().await;

        if let Some(live) = live {
            live.watcher.cancel();
            live.handle.close().await;
        }

        *self.shared.breaker.lock().await = CircuitBreaker::default();
        *self.shared.relay.write().await = None;
        self.shared.launched_before.store(false, Ordering::SeqCst);

        info!("Browser manager shut down");
    }

    pub async fn stats(&self) -> BrowserStats {
        let is_running = self.healthy_browser().await.is_some();
        let open_pages = self.shared.pages.read().await.len();
        let (restarts_in_window, circuit_open) = {
            let breaker = self.shared.breaker.lock().await;
            let window = self.shared.config.restart_window;
            let now = Instant::now();
            let recent = breaker
                .restarts
                .iter()
                .filter(|at| now.duration_since(**at) < window)
                .count();
            (recent, breaker.tripped)
        };

        BrowserStats {
            is_running,
            open_pages,
            total_launches: self.shared.total_launches.load(Ordering::SeqCst),
            total_restarts: self.shared.total_restarts.load(Ordering::SeqCst),
            restarts_in_window,
            circuit_open,
        }
    }
}
