use serde::{Deserialize, Serialize};
use std::fmt;

use crate::filters::FilterSet;

/// One extracted business listing.
///
/// Produced by the listing extractor during discovery and progressively
/// enriched by the detail and enrichment task handlers. `place_id` is the
/// identity key used to avoid enqueuing the same listing twice in a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessRecord {
    pub place_id: String,
    pub store_name: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub address: String,
    pub phone: Option<String>,
    /// Detail page URL taken from the listing anchor
    pub google_url: String,
    /// Raw review count text, e.g. "1,234"
    pub number_of_reviews: Option<String>,
    pub biz_website: Option<String>,
    /// Raw stars text, e.g. "4.5"
    #[serde(default)]
    pub stars: String,
    #[serde(default)]
    pub rating_value: f64,
    #[serde(default)]
    pub is_verified: bool,
    /// Result of the messaging-capability check (false until checked)
    #[serde(default)]
    pub has_messaging: bool,
    pub messaging_number: Option<String>,
    /// Secondary flag reported by the capability check (automated responder)
    #[serde(default)]
    pub is_chatbot: bool,
    pub country: Option<String>,
    pub city: Option<String>,
}

impl BusinessRecord {
    /// Review count with thousands separators removed, if parseable
    pub fn review_count(&self) -> Option<u64> {
        self.number_of_reviews
            .as_deref()
            .and_then(crate::utils::parse_review_count)
    }

    /// Copy location context onto the record (only the supplied parts)
    pub fn stamp_location(&mut self, location: &LocationContext) {
        if let Some(city) = &location.city {
            self.city = Some(city.clone());
        }
        if let Some(country) = &location.country {
            self.country = Some(country.clone());
        }
    }

    pub fn display_name(&self) -> &str {
        self.store_name.as_deref().unwrap_or(&self.place_id)
    }
}

/// Optional location used to scope a query and stamp discovered records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationContext {
    pub country: Option<String>,
    pub city: Option<String>,
}

/// What a crawl run starts from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchTarget {
    /// Free-text query, turned into a search URL with the location context
    Query(String),
    /// Ready-made results URL, used as-is
    Url(String),
}

impl SearchTarget {
    /// Text stored as the session query
    pub fn as_text(&self) -> &str {
        match self {
            Self::Query(q) => q,
            Self::Url(u) => u,
        }
    }
}

/// Parameters of a single `start` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub target: SearchTarget,
    #[serde(default)]
    pub location: LocationContext,
    pub filters: Option<FilterSet>,
}

impl StartRequest {
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            target: SearchTarget::Query(query.into()),
            location: LocationContext::default(),
            filters: None,
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self {
            target: SearchTarget::Url(url.into()),
            location: LocationContext::default(),
            filters: None,
        }
    }

    pub fn with_location(mut self, location: LocationContext) -> Self {
        self.location = location;
        self
    }

    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = Some(filters);
        self
    }
}

/// Kind of deferred work submitted to the task queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Open a listing's detail page and extract contact fields
    DetailFetch,
    /// Run the messaging-capability check for a record's phone number
    EnrichmentCheck,
    /// Kind without a registered handler; fails on dispatch
    Other(String),
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DetailFetch => write!(f, "detail_fetch"),
            Self::EnrichmentCheck => write!(f, "enrichment_check"),
            Self::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Overall state of a crawl run, as reported on the push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Discovering,
    Completed,
    Paused,
    Failed(String),
}

/// A new or updated record together with its current filter verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUpdate {
    pub record: BusinessRecord,
    pub matches_filters: bool,
}

/// Message pushed to the caller while a run is in progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrawlUpdate {
    Record(RecordUpdate),
    State { state: RunState },
}

/// Snapshot of the task queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks waiting for dispatch, including those waiting out a backoff
    pub queue_length: usize,
    pub active_tasks: usize,
    pub backing_off: usize,
    pub paused: bool,
    pub total_dispatched: u64,
    pub total_completed: u64,
    pub total_retried: u64,
    pub total_failed: u64,
}

/// Snapshot of the browser resource manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserStats {
    pub is_running: bool,
    pub open_pages: usize,
    pub total_launches: u64,
    pub total_restarts: u64,
    pub restarts_in_window: usize,
    pub circuit_open: bool,
}
