//! Seams between the resource manager and a concrete browser engine.
//!
//! The manager only talks to these traits; `chrome` implements them on
//! top of headless_chrome and `testing` provides a scripted in-memory
//! engine for tests.

use async_trait::async_trait;
use scrape_hive_common::{BrowserError, PageError, SessionCookie};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a driver needs to start one browser process
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub headless: bool,
    pub browser_path: Option<PathBuf>,
    /// Command-line arguments, already run through the middlewares
    pub args: Vec<String>,
    /// `scheme://host:port` of the relay, without credentials
    pub proxy_server: Option<String>,
    pub idle_timeout: Duration,
    /// Hard timeout applied around each blocking engine call
    pub operation_timeout: Duration,
    pub health_check_interval: Duration,
}

/// Starts browser processes
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn BrowserHandle>, BrowserError>;

    /// Get unique identifier for this driver (used in logging)
    fn name(&self) -> &str;
}

/// A running browser process
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// False once the process or its control connection is gone
    fn is_alive(&self) -> bool;

    /// Cancelled when the browser disconnects on its own.
    /// Deliberate `close` calls do not cancel it.
    fn disconnected(&self) -> CancellationToken;

    async fn new_page(&self) -> Result<Arc<dyn PageHandle>, BrowserError>;

    /// Terminate the process; errors are swallowed
    async fn close(&self);
}

/// One page (tab) of a browser
#[async_trait]
pub trait PageHandle: Send + Sync {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), PageError>;

    /// Current rendered markup
    async fn content(&self) -> Result<String, PageError>;

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<(), PageError>;

    /// Run a script and return its JSON value, if any
    async fn evaluate(&self, script: &str) -> Result<Option<serde_json::Value>, PageError>;

    async fn click(&self, selector: &str) -> Result<(), PageError>;

    async fn cookies(&self) -> Result<Vec<SessionCookie>, PageError>;

    async fn set_user_agent(&self, user_agent: &str) -> Result<(), PageError>;

    /// Answer relay authentication challenges with these credentials
    async fn authenticate(&self, username: &str, password: &str) -> Result<(), PageError>;

    /// Close the page; closing twice is harmless
    async fn close(&self);

    fn is_closed(&self) -> bool;
}
