use anyhow::{anyhow, Result};
use scraper::{ElementRef, Html, Selector};
use scrape_hive_common::utils::{fallback_place_id, parse_rating, place_id_from_href};
use scrape_hive_common::{BusinessRecord, DetailFields, Extractor, ListingNode};

const END_OF_LIST_SENTINEL: &str = "you've reached the end of the list";
const PLACE_PATH_MARKER: &str = "/maps/place/";
const PHONE_ITEM_PREFIX: &str = "phone:tel:";

fn parse_selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector `{}`: {}", css, e))
}

fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Extractor for the maps results feed and place detail panel
#[derive(Debug, Clone)]
pub struct MapsExtractor {
    feed_item: Selector,
    anchor: Selector,
    heading: Selector,
    rating: Selector,
    span: Selector,
    review_span: Selector,
    address_item: Selector,
    phone_item: Selector,
    website: Selector,
    verified_badge: Selector,
}

impl MapsExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            feed_item: parse_selector(r#"div[role="feed"] > div"#)?,
            anchor: parse_selector("a")?,
            heading: parse_selector(r#"[role="heading"]"#)?,
            rating: parse_selector(r#"[role="img"]"#)?,
            span: parse_selector("span")?,
            review_span: parse_selector("span:not([role])")?,
            address_item: parse_selector(r#"[data-item-id="address"]"#)?,
            phone_item: parse_selector(r#"[data-item-id^="phone:tel"]"#)?,
            website: parse_selector(r#"[aria-label^="Website:"]"#)?,
            verified_badge: parse_selector(r#"[aria-label*="Verified"]"#)?,
        })
    }

    fn place_href(&self, root: ElementRef<'_>) -> Option<String> {
        root.select(&self.anchor)
            .filter_map(|a| a.value().attr("href"))
            .find(|href| href.contains(PLACE_PATH_MARKER))
            .map(str::to_string)
    }

    /// Stars label without the unit, "0" when the listing has no rating
    fn stars(&self, root: ElementRef<'_>) -> (String, Option<String>) {
        let Some(rating) = root.select(&self.rating).next() else {
            return ("0".to_string(), None);
        };

        let stars = rating
            .value()
            .attr("aria-label")
            .map(|label| label.replace("stars", "").replace("star", "").trim().to_string())
            .unwrap_or_else(|| "0".to_string());

        let reviews = rating
            .parent()
            .and_then(ElementRef::wrap)
            .and_then(|parent| parent.select(&self.review_span).next())
            .map(|span| text_of(span).replace(['(', ')'], ""))
            .filter(|text| !text.is_empty());

        (stars, reviews)
    }

    /// Leaf spans with text: category first, then the short address
    fn info_spans(&self, root: ElementRef<'_>) -> Vec<String> {
        root.select(&self.span)
            .filter(|span| span.select(&self.span).nth(1).is_none())
            .map(text_of)
            .filter(|text| !text.is_empty())
            .collect()
    }
}

impl Extractor for MapsExtractor {
    fn extract_listing_nodes(&self, markup: &str) -> Vec<ListingNode> {
        let document = Html::parse_document(markup);
        document
            .select(&self.feed_item)
            .map(|item| ListingNode {
                markup: item.html(),
                detail_url: self.place_href(item),
            })
            .collect()
    }

    fn node_to_record(&self, node: &ListingNode) -> Option<BusinessRecord> {
        let href = node.detail_url.clone()?;
        let fragment = Html::parse_fragment(&node.markup);
        let root = fragment.root_element();

        let store_name = root
            .select(&self.heading)
            .next()
            .map(text_of)
            .filter(|name| !name.is_empty());
        let (stars, number_of_reviews) = self.stars(root);

        let mut spans = self.info_spans(root).into_iter();
        let category = spans.next();
        let address = spans.next().unwrap_or_default();

        let place_id = place_id_from_href(&href).unwrap_or_else(|| fallback_place_id(&node.markup));

        Some(BusinessRecord {
            place_id,
            store_name,
            category,
            address,
            google_url: href,
            number_of_reviews,
            rating_value: parse_rating(&stars),
            stars,
            ..Default::default()
        })
    }

    fn is_end_of_list(&self, node: &ListingNode) -> bool {
        node.markup.to_lowercase().contains(END_OF_LIST_SENTINEL)
    }

    fn detect_verification_badge(&self, markup: &str) -> bool {
        if markup.contains("verified") || markup.contains("Verified") || markup.contains("badge") {
            return true;
        }
        Html::parse_fragment(markup)
            .select(&self.verified_badge)
            .next()
            .is_some()
    }

    fn extract_detail(&self, markup: &str) -> DetailFields {
        let document = Html::parse_document(markup);

        let address = document
            .select(&self.address_item)
            .next()
            .map(text_of)
            .filter(|text| !text.is_empty());

        let phone = document
            .select(&self.phone_item)
            .next()
            .and_then(|item| item.value().attr("data-item-id"))
            .map(|id| id.trim_start_matches(PHONE_ITEM_PREFIX).to_string())
            .filter(|phone| !phone.is_empty());

        let website = document
            .select(&self.website)
            .next()
            .and_then(|link| link.value().attr("href"))
            .map(str::to_string);

        let verified = document.select(&self.verified_badge).next().is_some();

        DetailFields {
            address,
            phone,
            website,
            verified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"
        <html><body><div role="feed">
          <div>
            <a href="https://www.google.com/maps/place/Blue+Door+Cafe/data=abc"></a>
            <div role="heading">Blue Door Cafe</div>
            <span><span role="img" aria-label="4.6 stars"></span><span>(1,204)</span></span>
            <span>Coffee shop</span>
            <span>12 Harbour St</span>
          </div>
          <div><span>Sponsored</span></div>
          <div>
            <a href="https://www.google.com/maps/place/Corner+Bakery/data=def"></a>
            <div role="heading">Corner Bakery</div>
          </div>
          <div><p>You've reached the end of the list.</p></div>
        </div></body></html>
    "#;

    const DETAIL: &str = r#"
        <html><body><div role="main" aria-label="Blue Door Cafe">
          <button data-item-id="address">&#xe0c8; 12 Harbour St, Portsmouth</button>
          <button data-item-id="phone:tel:+441234567890">+44 1234 567890</button>
          <a aria-label="Website: bluedoor.example" href="https://bluedoor.example/"></a>
          <span aria-label="Verified business"></span>
        </div></body></html>
    "#;

    #[test]
    fn test_extracts_feed_nodes_in_order() {
        let extractor = MapsExtractor::new().unwrap();
        let nodes = extractor.extract_listing_nodes(FEED);
        assert_eq!(nodes.len(), 4);
        assert!(nodes[0].is_listing());
        assert!(!nodes[1].is_listing());
        assert!(nodes[2].is_listing());
        assert!(extractor.is_end_of_list(&nodes[3]));
        assert!(!extractor.is_end_of_list(&nodes[0]));
    }

    #[test]
    fn test_node_to_record_reads_listing_fields() {
        let extractor = MapsExtractor::new().unwrap();
        let nodes = extractor.extract_listing_nodes(FEED);

        let record = extractor.node_to_record(&nodes[0]).unwrap();
        assert_eq!(record.place_id, "Blue+Door+Cafe");
        assert_eq!(record.store_name.as_deref(), Some("Blue Door Cafe"));
        assert_eq!(record.stars, "4.6");
        assert_eq!(record.rating_value, 4.6);
        assert_eq!(record.number_of_reviews.as_deref(), Some("1,204"));
        assert_eq!(record.review_count(), Some(1204));
        assert!(record.google_url.contains("/maps/place/"));

        let sparse = extractor.node_to_record(&nodes[2]).unwrap();
        assert_eq!(sparse.stars, "0");
        assert_eq!(sparse.rating_value, 0.0);
        assert!(sparse.number_of_reviews.is_none());

        assert!(extractor.node_to_record(&nodes[1]).is_none());
    }

    #[test]
    fn test_extract_detail_fields() {
        let extractor = MapsExtractor::new().unwrap();
        let fields = extractor.extract_detail(DETAIL);
        assert!(fields.address.unwrap().ends_with("12 Harbour St, Portsmouth"));
        assert_eq!(fields.phone.as_deref(), Some("+441234567890"));
        assert_eq!(fields.website.as_deref(), Some("https://bluedoor.example/"));
        assert!(fields.verified);
    }

    #[test]
    fn test_detail_without_fields() {
        let extractor = MapsExtractor::new().unwrap();
        let fields = extractor.extract_detail("<html><body><div role=\"main\"></div></body></html>");
        assert_eq!(fields, DetailFields::default());
    }

    #[test]
    fn test_verification_badge_in_listing_markup() {
        let extractor = MapsExtractor::new().unwrap();
        assert!(extractor.detect_verification_badge(r#"<div><img alt="badge"></div>"#));
        assert!(!extractor.detect_verification_badge("<div>Plain listing</div>"));
    }
}
