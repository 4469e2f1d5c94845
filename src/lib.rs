//! # Scrape Hive
//!
//! Crash-tolerant orchestration for incremental scraping of infinite-scroll
//! business listings. A crawl run scrolls a results feed, surfaces every new
//! listing immediately, and defers detail fetches and messaging-capability
//! checks to a prioritized, rate-limited task queue that survives browser
//! crashes.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use scrape_hive::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = ScraperSettings {
//!         headless: true,
//!         max_concurrent_tasks: 2,
//!         ..Default::default()
//!     };
//!
//!     let collaborators = Collaborators {
//!         driver: Arc::new(ChromeDriver::default()),
//!         sessions: SessionStore::open("./sessions").await?,
//!         extractor: Arc::new(MapsExtractor::new()?),
//!         checker: Arc::new(DisabledCapabilityChecker),
//!         metrics: None,
//!     };
//!
//!     let (controller, mut updates) =
//!         CrawlController::new(ControllerConfig::from(&settings), collaborators);
//!
//!     tokio::spawn(async move {
//!         while let Some(update) = updates.recv().await {
//!             println!("{:?}", update);
//!         }
//!     });
//!
//!     let request = StartRequest::query("coffee").with_location(LocationContext {
//!         city: Some("Lisbon".to_string()),
//!         country: Some("Portugal".to_string()),
//!     });
//!     let records = controller.start(request).await?;
//!     println!("{} records", records.len());
//!
//!     controller.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Common**: data model, configuration, filters, session store, relay registry
//! - **Worker**: task queue, browser resource manager, Chrome driver, metrics
//! - **Coordinator**: crawl controller, task handlers, default maps extractor
//!
//! ## Features
//!
//! - `worker` (default): Include the task queue and browser resource manager
//! - `coordinator` (default): Include the crawl controller
//!
//! Use `default-features = false` to include only what you need.

/// Re-export of common types and traits
pub use scrape_hive_common as common;

/// Re-export of worker functionality
#[cfg(feature = "worker")]
pub use scrape_hive_worker as worker;

/// Re-export of the crawl controller
#[cfg(feature = "coordinator")]
pub use scrape_hive_coordinator as coordinator;

/// Convenient re-exports of commonly used types
pub mod prelude {
    // Data model
    pub use crate::common::{
        BusinessRecord, CrawlUpdate, LocationContext, RecordUpdate, RunState, SearchTarget,
        StartRequest, TaskKind,
    };

    // Configuration
    pub use crate::common::{
        BrowserConfig, CrawlConfig, QueueConfig, ScraperSettings, UserAgentMode,
    };

    // Filters and sessions
    pub use crate::common::{apply_filters, FilterSet, SessionStatus, SessionStore};

    // Collaborator traits
    pub use crate::common::{
        CachedCapabilityChecker, CapabilityChecker, DisabledCapabilityChecker, Extractor,
        ProxyProvider, RelayEndpoint, RelayRegistry,
    };

    #[cfg(feature = "worker")]
    pub use crate::worker::{
        providers::{NoProxyProvider, StaticRelayProvider},
        BrowserManager, ChromeDriver, Metrics, TaskQueue,
    };

    #[cfg(feature = "coordinator")]
    pub use crate::coordinator::{
        Collaborators, ControllerConfig, CrawlController, CrawlError, MapsExtractor,
    };
}
