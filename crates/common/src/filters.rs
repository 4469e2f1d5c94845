use serde::{Deserialize, Serialize};

use crate::types::BusinessRecord;

/// Filter options chosen for a run.
///
/// Every option is independent; an absent option never excludes a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSet {
    pub min_rating: Option<f64>,
    pub max_rating: Option<f64>,
    pub max_reviews: Option<u64>,
    #[serde(default)]
    pub exclude_verified: bool,
    #[serde(default)]
    pub requires_messaging: bool,
    #[serde(default)]
    pub detect_chatbot: bool,
    /// Strictness of the messaging-capability check; None means strict
    pub strict_messaging_mode: Option<bool>,
}

impl FilterSet {
    /// True when records need the enrichment check after their detail fetch
    pub fn needs_enrichment(&self) -> bool {
        self.requires_messaging || self.detect_chatbot
    }

    /// Strictness handed to the capability checker during enrichment
    pub fn strict_mode(&self) -> bool {
        self.strict_messaging_mode != Some(false)
    }

    /// Evaluate every predicate against the record's current fields.
    pub fn matches(&self, record: &BusinessRecord) -> bool {
        let rating_ok = self
            .min_rating
            .map_or(true, |min| record.rating_value >= min)
            && self
                .max_rating
                .map_or(true, |max| record.rating_value <= max);

        // Unparseable counts never exclude
        let reviews_ok = match (self.max_reviews, record.review_count()) {
            (Some(max), Some(count)) => count <= max,
            _ => true,
        };

        let verification_ok = !(self.exclude_verified && record.is_verified);
        let messaging_ok = !self.requires_messaging || record.has_messaging;

        // TODO: confirm with product whether detect_chatbot should exclude records
        // without the flag; today the predicate never excludes anything.
        let chatbot_ok = true;

        rating_ok && reviews_ok && verification_ok && messaging_ok && chatbot_ok
    }
}

/// Filter verdict for a record; no filter set means everything matches
pub fn apply_filters(record: &BusinessRecord, filters: Option<&FilterSet>) -> bool {
    filters.map_or(true, |f| f.matches(record))
}
