//! Scripted in-memory browser engine.
//!
//! Lets the resource manager and the crawl controller run without a real
//! browser: launches are counted, crashes are triggered on demand and pages
//! serve markup from a shared [`PageScript`].

use async_trait::async_trait;
use scrape_hive_common::{BrowserError, PageError, SessionCookie};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::driver::{BrowserDriver, BrowserHandle, LaunchSpec, PageHandle};

/// What pages of the mock engine render
#[derive(Debug, Clone, Default)]
pub struct PageScript {
    /// Search page markup; every scroll script advances to the next entry
    /// and the last one stays put
    pub feed_snapshots: Vec<String>,
    /// Markup served after navigating to a given URL
    pub pages: HashMap<String, String>,
    /// Remaining navigation failures per URL
    pub navigation_failures: HashMap<String, usize>,
    /// Time every navigation takes
    pub navigation_delay: Duration,
    /// URLs whose pages never render the awaited selector
    pub missing_selectors: Vec<String>,
    pub cookies: Vec<SessionCookie>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct DriverState {
    script: Mutex<PageScript>,
    launches: AtomicUsize,
    failing_launches: AtomicUsize,
    launch_specs: Mutex<Vec<LaunchSpec>>,
    browsers: Mutex<Vec<Arc<MockBrowser>>>,
    pages: Mutex<Vec<Arc<MockPage>>>,
}

/// Driver handing out [`MockBrowser`]s. Clones share state.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<DriverState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: PageScript) -> Self {
        let driver = Self::default();
        *lock(&driver.state.script) = script;
        driver
    }

    pub fn update_script(&self, update: impl FnOnce(&mut PageScript)) {
        update(&mut lock(&self.state.script));
    }

    /// Successful launches so far
    pub fn launch_count(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    pub fn fail_next_launches(&self, count: usize) {
        self.state.failing_launches.store(count, Ordering::SeqCst);
    }

    pub fn last_launch_spec(&self) -> Option<LaunchSpec> {
        lock(&self.state.launch_specs).last().cloned()
    }

    pub fn current_browser(&self) -> Option<Arc<MockBrowser>> {
        lock(&self.state.browsers).last().cloned()
    }

    /// Kill the newest browser as if its process died
    pub fn crash_current(&self) {
        if let Some(browser) = self.current_browser() {
            browser.crash();
        }
    }

    /// Page by creation order across all browsers
    pub fn page(&self, index: usize) -> Option<Arc<MockPage>> {
        lock(&self.state.pages).get(index).cloned()
    }

    pub fn page_count(&self) -> usize {
        lock(&self.state.pages).len()
    }
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
        lock(&self.state.launch_specs).push(spec.clone());

        let failing = self.state.failing_launches.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_launches.store(failing - 1, Ordering::SeqCst);
            return Err(BrowserError::Launch("scripted launch failure".to_string()));
        }

        self.state.launches.fetch_add(1, Ordering::SeqCst);
        let browser = Arc::new(MockBrowser {
            driver: self.state.clone(),
            alive: Arc::new(AtomicBool::new(true)),
            disconnected: CancellationToken::new(),
            pages: Mutex::new(Vec::new()),
        });
        lock(&self.state.browsers).push(browser.clone());
        Ok(browser)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

pub struct MockBrowser {
    driver: Arc<DriverState>,
    alive: Arc<AtomicBool>,
    disconnected: CancellationToken,
    pages: Mutex<Vec<Arc<MockPage>>>,
}

impl MockBrowser {
    pub fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
        for page in lock(&self.pages).iter() {
            page.closed.store(true, Ordering::SeqCst);
        }
        self.disconnected.cancel();
    }
}

#[async_trait]
impl BrowserHandle for MockBrowser {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }

    async fn new_page(&self) -> Result<Arc<dyn PageHandle>, BrowserError> {
        if !self.is_alive() {
            return Err(BrowserError::Disconnected);
        }

        let page = Arc::new(MockPage {
            driver: self.driver.clone(),
            browser_alive: self.alive.clone(),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            url: Mutex::new(None),
            scroll_position: AtomicUsize::new(0),
            user_agent: Mutex::new(None),
            credentials: Mutex::new(None),
        });
        lock(&self.pages).push(page.clone());
        lock(&self.driver.pages).push(page.clone());
        Ok(page)
    }

    async fn close(&self) {
        // A deliberate close does not count as a disconnect
        self.alive.store(false, Ordering::SeqCst);
        for page in lock(&self.pages).iter() {
            page.closed.store(true, Ordering::SeqCst);
        }
    }
}

pub struct MockPage {
    driver: Arc<DriverState>,
    browser_alive: Arc<AtomicBool>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    url: Mutex<Option<String>>,
    scroll_position: AtomicUsize,
    user_agent: Mutex<Option<String>>,
    credentials: Mutex<Option<(String, String)>>,
}

impl MockPage {
    pub fn user_agent(&self) -> Option<String> {
        lock(&self.user_agent).clone()
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        lock(&self.credentials).clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> Option<String> {
        lock(&self.url).clone()
    }

    fn ensure_usable(&self) -> Result<(), PageError> {
        if self.is_closed() {
            Err(PageError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PageHandle for MockPage {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), PageError> {
        self.ensure_usable()?;

        let delay = lock(&self.driver.script).navigation_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
            self.ensure_usable()?;
        }

        {
            let mut script = lock(&self.driver.script);
            if let Some(remaining) = script.navigation_failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(PageError::Navigation {
                        url: url.to_string(),
                        reason: "net::ERR_CONNECTION_RESET".to_string(),
                    });
                }
            }
        }

        *lock(&self.url) = Some(url.to_string());
        self.scroll_position.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn content(&self) -> Result<String, PageError> {
        self.ensure_usable()?;

        let url = self.url();
        let script = lock(&self.driver.script);
        if let Some(markup) = url.as_ref().and_then(|u| script.pages.get(u)) {
            return Ok(markup.clone());
        }

        let position = self.scroll_position.load(Ordering::SeqCst);
        Ok(script
            .feed_snapshots
            .get(position)
            .or_else(|| script.feed_snapshots.last())
            .cloned()
            .unwrap_or_default())
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<(), PageError> {
        self.ensure_usable()?;

        let url = self.url().unwrap_or_default();
        if lock(&self.driver.script).missing_selectors.contains(&url) {
            return Err(PageError::Selector {
                selector: selector.to_string(),
                reason: format!("not rendered within {:?}", timeout),
            });
        }
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<Option<serde_json::Value>, PageError> {
        self.ensure_usable()?;

        if script.contains("scroll") {
            self.scroll_position.fetch_add(1, Ordering::SeqCst);
        }
        Ok(None)
    }

    async fn click(&self, _selector: &str) -> Result<(), PageError> {
        self.ensure_usable()
    }

    async fn cookies(&self) -> Result<Vec<SessionCookie>, PageError> {
        self.ensure_usable()?;
        Ok(lock(&self.driver.script).cookies.clone())
    }

    async fn set_user_agent(&self, user_agent: &str) -> Result<(), PageError> {
        self.ensure_usable()?;
        *lock(&self.user_agent) = Some(user_agent.to_string());
        Ok(())
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<(), PageError> {
        self.ensure_usable()?;
        *lock(&self.credentials) = Some((username.to_string(), password.to_string()));
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.browser_alive.load(Ordering::SeqCst)
    }
}
