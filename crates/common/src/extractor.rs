use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::types::BusinessRecord;

/// One raw entry of the results feed, in document order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingNode {
    /// Outer markup of the feed entry
    pub markup: String,
    /// Detail link, present only for genuine listings
    pub detail_url: Option<String>,
}

impl ListingNode {
    pub fn is_listing(&self) -> bool {
        self.detail_url.is_some()
    }
}

/// Fields read from a rendered detail panel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailFields {
    pub address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub verified: bool,
}

/// Turns rendered markup into records.
///
/// Implementations are pure and synchronous; the crawl controller and the
/// detail handler feed them whatever the page currently renders.
pub trait Extractor: Send + Sync {
    /// Ordered feed entries currently present in the page
    fn extract_listing_nodes(&self, markup: &str) -> Vec<ListingNode>;

    /// Partial record for a listing node; None when the node has no usable link
    fn node_to_record(&self, node: &ListingNode) -> Option<BusinessRecord>;

    /// Whether the given node is the end-of-list sentinel
    fn is_end_of_list(&self, node: &ListingNode) -> bool;

    /// Whether listing or detail markup shows a verification badge
    fn detect_verification_badge(&self, markup: &str) -> bool;

    /// Contact fields from a rendered detail page
    fn extract_detail(&self, markup: &str) -> DetailFields;
}

/// Outcome of a messaging-capability check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityResult {
    pub present: bool,
    /// Secondary flag (automated responder detected)
    pub secondary_flag: bool,
    /// Number as registered with the messaging service, when known
    pub number: Option<String>,
    /// Why the check could not give a positive answer
    pub error: Option<String>,
}

impl CapabilityResult {
    pub fn absent(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Asynchronous messaging-capability check for a phone number.
///
/// Failures never surface as errors: they resolve to `present = false`
/// with `error` set. A non-strict check may accept weaker evidence of
/// presence than a strict one.
#[async_trait]
pub trait CapabilityChecker: Send + Sync {
    async fn check_capability(&self, phone: &str, strict: bool) -> CapabilityResult;

    /// Get unique identifier for this checker (used in logging)
    fn name(&self) -> &str;
}

/// Checker used when no verification backend is configured
#[derive(Debug, Clone, Default)]
pub struct DisabledCapabilityChecker;

#[async_trait]
impl CapabilityChecker for DisabledCapabilityChecker {
    async fn check_capability(&self, _phone: &str, _strict: bool) -> CapabilityResult {
        CapabilityResult::absent("capability check not configured")
    }

    fn name(&self) -> &str {
        "disabled"
    }
}

/// Minimum digits a number needs before it is worth checking
const MIN_PHONE_DIGITS: usize = 10;

/// Wraps a checker with number validation and a TTL cache.
///
/// The cache belongs to this wrapper; two wrappers never share entries.
pub struct CachedCapabilityChecker<C> {
    inner: C,
    ttl: Duration,
    cache: Arc<RwLock<HashMap<(String, bool), (CapabilityResult, Instant)>>>,
}

impl<C: CapabilityChecker> CachedCapabilityChecker<C> {
    pub fn new(inner: C, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Digits only, without a leading trunk zero
    fn standardize(phone: &str) -> String {
        let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
        match digits.strip_prefix('0') {
            Some(rest) => rest.to_string(),
            None => digits,
        }
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[async_trait]
impl<C: CapabilityChecker> CapabilityChecker for CachedCapabilityChecker<C> {
    async fn check_capability(&self, phone: &str, strict: bool) -> CapabilityResult {
        let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
        if digits.len() < MIN_PHONE_DIGITS {
            return CapabilityResult::absent("invalid phone number");
        }

        // Strict and lenient verdicts for one number are cached apart
        let key = (Self::standardize(phone), strict);
        if let Some((result, stored_at)) = self.cache.read().await.get(&key) {
            if stored_at.elapsed() < self.ttl {
                debug!(number = %key.0, strict, checker = self.inner.name(), "Capability cache hit");
                return result.clone();
            }
        }

        let result = self.inner.check_capability(phone, strict).await;
        self.cache
            .write()
            .await
            .insert(key, (result.clone(), Instant::now()));
        result
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
