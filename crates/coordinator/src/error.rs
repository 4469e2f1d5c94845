use scrape_hive_common::{BrowserError, PageError, SessionError};
use thiserror::Error;

/// Why a crawl run (or one of its steps) did not finish
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("a crawl is already running on this controller")]
    AlreadyRunning,

    #[error("invalid search target: {0}")]
    InvalidTarget(String),

    #[error("could not load {url} after {attempts} attempts")]
    NavigationExhausted { url: String, attempts: u32 },

    #[error("unknown task kind: {0}")]
    UnknownTaskKind(String),

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error(transparent)]
    Page(#[from] PageError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// A browser restart storm or a critical task failure ended the run
    #[error("{0}")]
    Fatal(String),
}

impl CrawlError {
    /// Faults caused by the browser going away under an open page.
    /// Discovery reopens its page once the replacement browser is up.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Page(PageError::Closed)
                | Self::Browser(BrowserError::Disconnected)
                | Self::Browser(BrowserError::Page(PageError::Closed))
        )
    }
}
