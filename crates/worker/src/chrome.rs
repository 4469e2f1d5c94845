use anyhow::anyhow;
use async_trait::async_trait;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Network;
use headless_chrome::{Browser, LaunchOptions};
use scrape_hive_common::{BrowserError, PageError, SessionCookie};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::driver::{BrowserDriver, BrowserHandle, LaunchSpec, PageHandle};

/// Check if an error indicates the browser process is dead.
fn is_dead_browser_error(error_msg: &str) -> bool {
    error_msg.contains("connection is closed") || error_msg.contains("No such process")
}

/// Check if an error indicates only the tab's CDP session is gone
fn is_dead_tab_error(error_msg: &str) -> bool {
    error_msg.contains("No session with given id")
}

/// Launches Chrome/Chromium through headless_chrome.
///
/// headless_chrome is fully blocking, so every call runs on the blocking
/// pool behind a hard timeout.
#[derive(Debug, Clone, Default)]
pub struct ChromeDriver;

impl ChromeDriver {
    /// Pre-flight check: verify browser binary exists and log useful diagnostics
    fn verify_browser_binary(binary_path: &Path) {
        use std::os::unix::fs::PermissionsExt;

        if !binary_path.exists() {
            warn!(
                "Browser binary not found at '{}'. headless_chrome will attempt auto-detection.",
                binary_path.display()
            );
            return;
        }

        match std::fs::metadata(binary_path) {
            Ok(metadata) => {
                let mode = metadata.permissions().mode();
                if mode & 0o111 == 0 {
                    warn!(
                        "Browser binary '{}' exists but is NOT executable (mode: {:o})",
                        binary_path.display(),
                        mode
                    );
                } else {
                    debug!("Browser binary verified: '{}'", binary_path.display());
                }
            }
            Err(e) => warn!(
                "Cannot read metadata for browser binary '{}': {}",
                binary_path.display(),
                e
            ),
        }
    }

    fn launch_blocking(spec: &LaunchSpec) -> anyhow::Result<Browser> {
        let args: Vec<&OsStr> = spec.args.iter().map(OsStr::new).collect();

        let mut launch_builder = LaunchOptions::default_builder();
        launch_builder
            .headless(spec.headless)
            .proxy_server(spec.proxy_server.as_deref())
            // Default idle timeout is 30s, which drops the websocket between scroll batches
            .idle_browser_timeout(spec.idle_timeout)
            .args(args);

        if let Some(ref browser_path) = spec.browser_path {
            launch_builder.path(Some(browser_path.clone()));
        }

        let launch_options = launch_builder
            .build()
            .map_err(|e| anyhow!("Failed to build launch options: {}", e))?;

        Browser::new(launch_options).map_err(|e| anyhow!("{}", e))
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
        if let Some(path) = &spec.browser_path {
            Self::verify_browser_binary(path);
        }

        info!(
            headless = spec.headless,
            args = spec.args.len(),
            proxy = ?spec.proxy_server,
            "Launching browser process"
        );

        let launch_spec = spec.clone();
        let browser = tokio::task::spawn_blocking(move || Self::launch_blocking(&launch_spec))
            .await
            .map_err(|e| BrowserError::Launch(format!("launch task failed: {}", e)))?
            .map_err(|e| {
                error!(
                    "Browser failed to launch: {}. Common causes: sandbox enabled inside a \
                     container, browser binary not found, missing shared libraries.",
                    e
                );
                BrowserError::Launch(e.to_string())
            })?;

        info!("Browser process launched successfully");

        let handle = Arc::new(ChromeBrowser {
            browser: Mutex::new(Some(Arc::new(browser))),
            alive: Arc::new(AtomicBool::new(true)),
            disconnected: CancellationToken::new(),
            closing: CancellationToken::new(),
            operation_timeout: spec.operation_timeout,
        });
        handle.start_health_watch(spec.health_check_interval);

        Ok(handle)
    }

    fn name(&self) -> &str {
        "chrome"
    }
}

/// A running Chrome process plus its liveness watcher
pub struct ChromeBrowser {
    browser: Mutex<Option<Arc<Browser>>>,
    alive: Arc<AtomicBool>,
    disconnected: CancellationToken,
    closing: CancellationToken,
    operation_timeout: Duration,
}

impl ChromeBrowser {
    fn current(&self) -> Option<Arc<Browser>> {
        self.browser.lock().ok().and_then(|guard| guard.clone())
    }

    fn mark_disconnected(&self) {
        if self.alive.swap(false, Ordering::SeqCst) && !self.closing.is_cancelled() {
            warn!("Browser connection lost");
            self.disconnected.cancel();
        }
    }

    /// Probe the browser on an interval; the first failed probe flags a disconnect.
    fn start_health_watch(self: &Arc<Self>, interval: Duration) {
        let this = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.closing.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(browser) = this.current() else {
                    break;
                };

                let probe = tokio::task::spawn_blocking(move || browser.get_version());
                let healthy = match tokio::time::timeout(this.operation_timeout, probe).await {
                    Ok(Ok(Ok(_))) => true,
                    Ok(Ok(Err(e))) => {
                        debug!("Browser health probe failed: {}", e);
                        false
                    }
                    Ok(Err(e)) => {
                        debug!("Browser health probe panicked: {}", e);
                        false
                    }
                    Err(_) => {
                        debug!("Browser health probe timed out");
                        false
                    }
                };

                if !healthy {
                    this.mark_disconnected();
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl BrowserHandle for ChromeBrowser {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.closing.is_cancelled()
    }

    fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }

    async fn new_page(&self) -> Result<Arc<dyn PageHandle>, BrowserError> {
        let browser = self.current().ok_or(BrowserError::Disconnected)?;

        let create = tokio::task::spawn_blocking(move || browser.new_tab());
        let tab = match tokio::time::timeout(self.operation_timeout, create).await {
            Ok(Ok(Ok(tab))) => tab,
            Ok(Ok(Err(e))) => {
                let msg = e.to_string();
                if is_dead_browser_error(&msg) {
                    self.mark_disconnected();
                    return Err(BrowserError::Disconnected);
                }
                return Err(PageError::Other(format!("Failed to create tab: {}", msg)).into());
            }
            Ok(Err(e)) => {
                return Err(PageError::Other(format!("Tab creation task failed: {}", e)).into())
            }
            Err(_) => {
                return Err(PageError::Timeout {
                    operation: "new_tab",
                    elapsed: self.operation_timeout,
                }
                .into())
            }
        };

        let _ = tab.set_default_timeout(self.operation_timeout);

        Ok(Arc::new(ChromePage {
            tab,
            closed: Arc::new(AtomicBool::new(false)),
            operation_timeout: self.operation_timeout,
        }))
    }

    async fn close(&self) {
        self.closing.cancel();
        self.alive.store(false, Ordering::SeqCst);

        let taken = self.browser.lock().ok().and_then(|mut guard| guard.take());
        if let Some(browser) = taken {
            // Dropping the last handle kills the process, which can block briefly
            let _ = tokio::task::spawn_blocking(move || drop(browser)).await;
            info!("Browser process closed");
        }
    }
}

/// One Chrome tab
pub struct ChromePage {
    tab: Arc<Tab>,
    closed: Arc<AtomicBool>,
    operation_timeout: Duration,
}

impl ChromePage {
    /// Run a blocking tab call with a hard timeout.
    ///
    /// With `abort_on_timeout` the tab is closed when the call hangs, which
    /// unblocks the stuck CDP request; the page is unusable afterwards.
    async fn run_blocking<T, F, E>(
        &self,
        operation: &'static str,
        limit: Duration,
        abort_on_timeout: bool,
        call: F,
        on_error: E,
    ) -> Result<T, PageError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Tab>) -> anyhow::Result<T> + Send + 'static,
        E: FnOnce(String) -> PageError,
    {
        if self.is_closed() {
            return Err(PageError::Closed);
        }

        let tab = self.tab.clone();
        let handle = tokio::task::spawn_blocking(move || call(tab));

        tokio::select! {
            _ = tokio::time::sleep(limit) => {
                if abort_on_timeout {
                    warn!("{} hard timeout after {:?} - closing tab to abort", operation, limit);
                    self.close().await;
                }
                Err(PageError::Timeout { operation, elapsed: limit })
            }
            result = handle => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => {
                    let msg = e.to_string();
                    if is_dead_browser_error(&msg) || is_dead_tab_error(&msg) {
                        self.closed.store(true, Ordering::SeqCst);
                        Err(PageError::Closed)
                    } else {
                        Err(on_error(msg))
                    }
                }
                Err(e) => Err(PageError::Other(format!("{} task failed: {}", operation, e))),
            }
        }
    }
}

#[async_trait]
impl PageHandle for ChromePage {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), PageError> {
        let target = url.to_string();
        let failed_url = url.to_string();
        self.run_blocking(
            "navigate",
            timeout,
            false,
            move |tab| {
                tab.navigate_to(&target)?.wait_until_navigated()?;
                Ok(())
            },
            move |reason| PageError::Navigation {
                url: failed_url,
                reason,
            },
        )
        .await
    }

    async fn content(&self) -> Result<String, PageError> {
        self.run_blocking(
            "get_content",
            self.operation_timeout,
            true,
            |tab| tab.get_content(),
            PageError::Other,
        )
        .await
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<(), PageError> {
        let css = selector.to_string();
        let failed = selector.to_string();
        // Outer limit leaves the engine's own wait room to report first
        self.run_blocking(
            "wait_for_selector",
            timeout + Duration::from_secs(2),
            false,
            move |tab| {
                tab.wait_for_element_with_custom_timeout(&css, timeout)?;
                Ok(())
            },
            move |reason| PageError::Selector {
                selector: failed,
                reason,
            },
        )
        .await
    }

    async fn evaluate(&self, script: &str) -> Result<Option<serde_json::Value>, PageError> {
        let script = script.to_string();
        self.run_blocking(
            "evaluate",
            self.operation_timeout,
            true,
            move |tab| Ok(tab.evaluate(&script, false)?.value),
            PageError::Other,
        )
        .await
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        let css = selector.to_string();
        let failed = selector.to_string();
        self.run_blocking(
            "click",
            self.operation_timeout,
            false,
            move |tab| {
                let element = tab.find_element(&css)?;
                element.click()?;
                Ok(())
            },
            move |reason| PageError::Selector {
                selector: failed,
                reason,
            },
        )
        .await
    }

    async fn cookies(&self) -> Result<Vec<SessionCookie>, PageError> {
        self.run_blocking(
            "get_cookies",
            self.operation_timeout,
            false,
            |tab| {
                let cookies = tab.get_cookies()?;
                Ok(cookies
                    .into_iter()
                    .map(|c| SessionCookie {
                        name: c.name,
                        value: c.value,
                        domain: c.domain,
                        path: c.path,
                        expires: c.expires,
                        http_only: c.http_only,
                        secure: c.secure,
                    })
                    .collect())
            },
            PageError::Other,
        )
        .await
    }

    async fn set_user_agent(&self, user_agent: &str) -> Result<(), PageError> {
        let user_agent = user_agent.to_string();
        self.run_blocking(
            "set_user_agent",
            self.operation_timeout,
            false,
            move |tab| {
                tab.call_method(Network::SetUserAgentOverride {
                    user_agent,
                    accept_language: None,
                    platform: None,
                    user_agent_metadata: None,
                })?;
                Ok(())
            },
            PageError::Other,
        )
        .await
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<(), PageError> {
        let username = username.to_string();
        let password = password.to_string();
        self.run_blocking(
            "authenticate",
            self.operation_timeout,
            false,
            move |tab| {
                tab.enable_fetch(None, Some(true))?;
                tab.authenticate(Some(username), Some(password))?;
                Ok(())
            },
            PageError::Other,
        )
        .await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let tab = self.tab.clone();
        let closing = tokio::task::spawn_blocking(move || tab.close(false));
        match tokio::time::timeout(self.operation_timeout, closing).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(e))) => debug!("Tab close reported an error: {}", e),
            Ok(Err(e)) => debug!("Tab close task failed: {}", e),
            Err(_) => warn!("Tab close timed out"),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_browser_errors() {
        assert!(is_dead_browser_error("Unable to make method calls because underlying connection is closed"));
        assert!(is_dead_browser_error("No such process (os error 3)"));
        assert!(!is_dead_browser_error("Navigate failed: net::ERR_NAME_NOT_RESOLVED"));
        assert!(is_dead_tab_error("No session with given id"));
    }
}
