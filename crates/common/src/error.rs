use std::time::Duration;
use thiserror::Error;

use crate::session::SessionStatus;

/// Coarse classification of a page failure, used by callers to pick a retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageErrorKind {
    Timeout,
    Navigation,
    Selector,
    Closed,
    Other,
}

/// Failure of a single page operation
#[derive(Debug, Clone, Error)]
pub enum PageError {
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("selector `{selector}` not found: {reason}")]
    Selector { selector: String, reason: String },

    #[error("page is closed or its browser disconnected")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl PageError {
    pub fn kind(&self) -> PageErrorKind {
        match self {
            Self::Timeout { .. } => PageErrorKind::Timeout,
            Self::Navigation { .. } => PageErrorKind::Navigation,
            Self::Selector { .. } => PageErrorKind::Selector,
            Self::Closed => PageErrorKind::Closed,
            Self::Other(_) => PageErrorKind::Other,
        }
    }

    /// Transient faults worth another attempt on the same page
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            PageErrorKind::Timeout | PageErrorKind::Navigation | PageErrorKind::Selector
        )
    }
}

/// Failure of the browser resource manager
#[derive(Debug, Clone, Error)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),

    /// Restart storm protection tripped; no further automatic recovery
    #[error("browser restarted {restarts} times within {window:?}, giving up")]
    CircuitOpen { restarts: usize, window: Duration },

    #[error("browser disconnected")]
    Disconnected,

    #[error("page id {0} is already checked out")]
    PageInUse(String),

    #[error(transparent)]
    Page(#[from] PageError),
}

impl BrowserError {
    /// Faults that end a run instead of being retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// Failure of the session store
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("session storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("session serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_error_kinds() {
        let timeout = PageError::Timeout {
            operation: "navigate",
            elapsed: Duration::from_secs(30),
        };
        assert_eq!(timeout.kind(), PageErrorKind::Timeout);
        assert!(timeout.is_retryable());
        assert!(!PageError::Closed.is_retryable());
        assert!(!PageError::Other("x".into()).is_retryable());
    }

    #[test]
    fn test_browser_error_fatal() {
        let open = BrowserError::CircuitOpen {
            restarts: 5,
            window: Duration::from_secs(60),
        };
        assert!(open.is_fatal());
        assert!(!BrowserError::Disconnected.is_fatal());
        assert!(!BrowserError::from(PageError::Closed).is_fatal());
    }
}
