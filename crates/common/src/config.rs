use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::browser_middleware::{DefaultLaunchArgsMiddleware, LaunchArgsMiddleware};
use crate::proxy::ProxyProvider;
use crate::types::TaskKind;

/// User agents rotated across pages when rotation is enabled
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/92.0.4515.131 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/93.0.4577.63 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:90.0) Gecko/20100101 Firefox/90.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:91.0) Gecko/20100101 Firefox/91.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36 Edg/91.0.864.59",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.114 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/92.0.4515.131 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Safari/605.1.15",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 14_7_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.2 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 11; SM-G991B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/92.0.4515.159 Mobile Safari/537.36",
];

/// Top-level knobs of a scraper instance.
///
/// Everything else is derived from these through `queue_config`,
/// `browser_config` and `crawl_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperSettings {
    /// Launch the browser behind relays from the relay registry
    pub use_relays: bool,
    pub headless: bool,
    /// Secondary tasks allowed in flight at once
    pub max_concurrent_tasks: usize,
    /// Minimum gap between two task dispatches
    #[serde(with = "humantime_serde")]
    pub request_delay: Duration,
    /// Restarts tolerated inside the restart window before giving up
    pub max_restarts: usize,
    pub user_agent_rotation: bool,
}

impl Default for ScraperSettings {
    fn default() -> Self {
        Self {
            use_relays: false,
            headless: false,
            max_concurrent_tasks: 1,
            request_delay: Duration::from_millis(2000),
            max_restarts: 5,
            user_agent_rotation: true,
        }
    }
}

impl ScraperSettings {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            concurrency: self.max_concurrent_tasks.max(1),
            rate_limit: self.request_delay,
            ..Default::default()
        }
    }

    pub fn browser_config(&self) -> BrowserConfig {
        BrowserConfig {
            headless: self.headless,
            max_restarts: self.max_restarts,
            user_agent_mode: if self.user_agent_rotation {
                UserAgentMode::Rotate
            } else {
                UserAgentMode::BrowserDefault
            },
            ..Default::default()
        }
    }

    pub fn crawl_config(&self) -> CrawlConfig {
        CrawlConfig::default()
    }
}

/// Task queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum tasks in flight
    pub concurrency: usize,
    /// Minimum wall-clock gap between two dispatches
    #[serde(with = "humantime_serde")]
    pub rate_limit: Duration,
    /// Retry budget for tasks enqueued without an explicit one
    pub default_max_retries: u32,
    /// Backoff is `min(cap, base * factor^retry_count + jitter)`
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    pub backoff_factor: f64,
    #[serde(with = "humantime_serde")]
    pub backoff_cap: Duration,
    /// Upper bound of the uniform random jitter added to every backoff
    #[serde(with = "humantime_serde")]
    pub max_jitter: Duration,
    /// Longest the dispatch loop sleeps without being woken
    #[serde(with = "humantime_serde")]
    pub idle_tick: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            rate_limit: Duration::from_millis(2000),
            default_max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_factor: 1.5,
            backoff_cap: Duration::from_secs(30),
            max_jitter: Duration::from_secs(1),
            idle_tick: Duration::from_millis(100),
        }
    }
}

/// Which user agent new pages get
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserAgentMode {
    /// Next entry of `USER_AGENTS` for every page
    #[default]
    Rotate,
    /// `BrowserConfig::user_agent` for every page
    Fixed,
    /// Leave the browser's own user agent alone
    BrowserDefault,
}

impl FromStr for UserAgentMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rotate" => Ok(Self::Rotate),
            "fixed" => Ok(Self::Fixed),
            "browser_default" | "default" => Ok(Self::BrowserDefault),
            _ => Err(()),
        }
    }
}

/// Resource manager configuration
///
/// Note: This struct cannot derive Serialize/Deserialize because the relay
/// provider and middleware trait objects are not serializable.
#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    /// Path to browser binary. If None, uses Chrome/Chromium auto-detection.
    pub browser_path: Option<PathBuf>,
    pub user_agent_mode: UserAgentMode,
    /// Used with `UserAgentMode::Fixed`
    pub user_agent: Option<String>,
    /// Restarts allowed inside `restart_window` before the breaker trips
    pub max_restarts: usize,
    pub restart_window: Duration,
    /// How often the liveness watcher probes the browser process
    pub health_check_interval: Duration,
    /// Chrome closes itself after this long without CDP traffic
    pub idle_browser_timeout: Duration,
    /// Hard timeout around every blocking browser call
    pub operation_timeout: Duration,
    /// Middlewares for launch arguments, applied in order before each launch
    pub launch_args_middlewares: Vec<Box<dyn LaunchArgsMiddleware>>,
    /// Relay source consulted on every launch; None means direct connection
    pub proxy_provider: Option<Box<dyn ProxyProvider>>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            browser_path: None,
            user_agent_mode: UserAgentMode::default(),
            user_agent: None,
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(2),
            idle_browser_timeout: Duration::from_secs(3600),
            operation_timeout: Duration::from_secs(30),
            launch_args_middlewares: vec![Box::new(DefaultLaunchArgsMiddleware)],
            proxy_provider: None,
        }
    }
}

impl std::fmt::Debug for BrowserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let middleware_names: Vec<&str> = self
            .launch_args_middlewares
            .iter()
            .map(|m| m.name())
            .collect();

        f.debug_struct("BrowserConfig")
            .field("headless", &self.headless)
            .field("browser_path", &self.browser_path)
            .field("user_agent_mode", &self.user_agent_mode)
            .field("user_agent", &self.user_agent)
            .field("max_restarts", &self.max_restarts)
            .field("restart_window", &self.restart_window)
            .field("health_check_interval", &self.health_check_interval)
            .field("idle_browser_timeout", &self.idle_browser_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .field("launch_args_middlewares", &middleware_names)
            .field(
                "proxy_provider",
                &self.proxy_provider.as_ref().map(|p| p.name()),
            )
            .finish()
    }
}

/// Round-robin picker over `USER_AGENTS`; clones share the cursor
#[derive(Debug, Clone, Default)]
pub struct UserAgentRotator {
    cursor: Arc<AtomicUsize>,
}

impl UserAgentRotator {
    pub fn next_agent(&self) -> &'static str {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % USER_AGENTS.len();
        USER_AGENTS[index]
    }
}

/// Crawl controller and task handler timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Pause after each scroll before re-reading the feed
    #[serde(with = "humantime_serde")]
    pub scroll_delay: Duration,
    /// Poll interval while waiting for queued work to drain
    #[serde(with = "humantime_serde")]
    pub drain_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub navigation_timeout: Duration,
    pub navigation_attempts: u32,
    /// Wait before attempt n+1 is `navigation_backoff_step * (n + 1)`
    #[serde(with = "humantime_serde")]
    pub navigation_backoff_step: Duration,
    /// Text a successfully loaded page must contain; None accepts any page
    pub content_marker: Option<String>,
    /// Element that marks a rendered detail panel
    pub detail_selector: String,
    #[serde(with = "humantime_serde")]
    pub detail_selector_timeout: Duration,
    /// Extra attempts after the first selector wait fails
    pub detail_selector_retries: u32,
    #[serde(with = "humantime_serde")]
    pub selector_retry_delay: Duration,
    /// Close button of the detail overlay (dismissed best-effort)
    pub overlay_close_selector: String,
    #[serde(with = "humantime_serde")]
    pub overlay_settle_delay: Duration,
    /// Task kinds whose terminal failure fails the whole session
    pub critical_task_kinds: Vec<TaskKind>,
    /// Times discovery reopens its page after a browser restart in one run
    pub discovery_recoveries: u32,
    pub detail_priority: i32,
    pub enrichment_priority: i32,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            scroll_delay: Duration::from_secs(1),
            drain_poll_interval: Duration::from_secs(1),
            navigation_timeout: Duration::from_secs(30),
            navigation_attempts: 3,
            navigation_backoff_step: Duration::from_secs(2),
            content_marker: Some("Google Maps".to_string()),
            detail_selector: "[data-item-id]".to_string(),
            detail_selector_timeout: Duration::from_secs(8),
            detail_selector_retries: 2,
            selector_retry_delay: Duration::from_secs(1),
            overlay_close_selector: r#"div[role="main"][aria-label] .VfPpkd-kBDsod"#.to_string(),
            overlay_settle_delay: Duration::from_millis(500),
            critical_task_kinds: Vec::new(),
            discovery_recoveries: 1,
            detail_priority: 0,
            enrichment_priority: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = ScraperSettings::default();
        assert!(!settings.use_relays);
        assert!(!settings.headless);
        assert_eq!(settings.max_concurrent_tasks, 1);
        assert_eq!(settings.request_delay, Duration::from_millis(2000));
        assert_eq!(settings.max_restarts, 5);
        assert!(settings.user_agent_rotation);
    }

    #[test]
    fn test_settings_derive_component_configs() {
        let settings = ScraperSettings {
            max_concurrent_tasks: 0,
            request_delay: Duration::from_millis(250),
            user_agent_rotation: false,
            max_restarts: 2,
            ..Default::default()
        };

        let queue = settings.queue_config();
        assert_eq!(queue.concurrency, 1);
        assert_eq!(queue.rate_limit, Duration::from_millis(250));
        assert_eq!(queue.default_max_retries, 3);

        let browser = settings.browser_config();
        assert_eq!(browser.max_restarts, 2);
        assert_eq!(browser.restart_window, Duration::from_secs(60));
        assert_eq!(browser.user_agent_mode, UserAgentMode::BrowserDefault);
    }

    #[test]
    fn test_user_agent_mode_from_str() {
        assert_eq!("ROTATE".parse::<UserAgentMode>(), Ok(UserAgentMode::Rotate));
        assert_eq!("fixed".parse::<UserAgentMode>(), Ok(UserAgentMode::Fixed));
        assert_eq!("default".parse::<UserAgentMode>(), Ok(UserAgentMode::BrowserDefault));
        assert!("random".parse::<UserAgentMode>().is_err());
    }

    #[test]
    fn test_user_agent_rotator_wraps() {
        let rotator = UserAgentRotator::default();
        let shared = rotator.clone();
        let first = rotator.next_agent();
        for _ in 1..USER_AGENTS.len() {
            shared.next_agent();
        }
        assert_eq!(rotator.next_agent(), first);
    }

    #[test]
    fn test_crawl_config_serializes_humantime() {
        let json = serde_json::to_value(CrawlConfig::default()).unwrap();
        assert_eq!(json["scroll_delay"], "1s");
        assert_eq!(json["overlay_settle_delay"], "500ms");
    }

    #[test]
    fn test_browser_config_debug_names_middlewares() {
        let debug = format!("{:?}", BrowserConfig::default());
        assert!(debug.contains("default_launch_args"));
    }
}
