use sha2::{Digest, Sha256};

use crate::types::{LocationContext, SearchTarget};

const SEARCH_BASE_URL: &str = "https://www.google.com/maps/search/";
const PLACE_PATH_MARKER: &str = "/maps/place/";

/// Derive the stable place identifier from a listing's detail link.
///
/// Uses the path segment after `/maps/place/`, falling back to the `q`
/// query value. Returns None when neither is present.
pub fn place_id_from_href(href: &str) -> Option<String> {
    if let Some((_, rest)) = href.split_once(PLACE_PATH_MARKER) {
        let segment = rest.split(['/', '?']).next().unwrap_or_default();
        if !segment.is_empty() {
            return Some(segment.to_string());
        }
    }

    if let Some((_, rest)) = href.split_once("?q=") {
        let value = rest.split('&').next().unwrap_or_default();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    None
}

/// Generated identifier for listings whose link carries no place id.
/// Hashing the markup keeps it stable across scroll batches.
pub fn fallback_place_id(markup: &str) -> String {
    let digest = Sha256::digest(markup.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("place_{}", hex)
}

/// Keep only ASCII characters (drops the icon glyphs rendered in front of addresses)
pub fn normalize_address(address: &str) -> String {
    address
        .chars()
        .filter(char::is_ascii)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Strip everything except digits and `+`
pub fn clean_phone(phone: &str) -> String {
    phone
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect()
}

/// Parse review counts like "1,234" or "(87)"
pub fn parse_review_count(text: &str) -> Option<u64> {
    let digits: String = text
        .chars()
        .filter(|c| !matches!(c, ',' | '(' | ')') && !c.is_whitespace())
        .collect();
    digits.parse().ok()
}

/// Parse the leading number of a stars label ("4.5 stars"), 0.0 when absent
pub fn parse_rating(stars: &str) -> f64 {
    let number: String = stars
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    number.parse().unwrap_or(0.0)
}

/// Build the results URL for a search target.
///
/// Queries get the city and country appended (the country only when the
/// query does not already name it); both forms get `hl=en`.
pub fn build_search_url(
    target: &SearchTarget,
    location: &LocationContext,
) -> anyhow::Result<String> {
    let raw = match target {
        SearchTarget::Query(query) => {
            let mut text = query.trim().to_string();
            if let Some(city) = &location.city {
                text.push_str(&format!(" in {}", city));
            }
            if let Some(country) = &location.country {
                if !text.to_lowercase().contains(&country.to_lowercase()) {
                    text.push_str(&format!(", {}", country));
                }
            }
            format!("{}{}", SEARCH_BASE_URL, text.split(' ').collect::<Vec<_>>().join("+"))
        }
        SearchTarget::Url(url) => url.clone(),
    };

    let mut url = url::Url::parse(&raw)?;
    url.query_pairs_mut().append_pair("hl", "en");
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_id_from_place_path() {
        assert_eq!(
            place_id_from_href("https://www.google.com/maps/place/Cafe+Nero/data=!4m7?authuser=0"),
            Some("Cafe+Nero".to_string())
        );
    }

    #[test]
    fn test_place_id_from_query() {
        assert_eq!(
            place_id_from_href("https://maps.google.com/?q=ChIJ123&hl=en"),
            Some("ChIJ123".to_string())
        );
        assert_eq!(place_id_from_href("https://example.com/nothing"), None);
    }

    #[test]
    fn test_fallback_place_id_is_stable() {
        let a = fallback_place_id("<div>Cafe</div>");
        let b = fallback_place_id("<div>Cafe</div>");
        assert_eq!(a, b);
        assert!(a.starts_with("place_"));
        assert_eq!(a.len(), "place_".len() + 16);
        assert_ne!(a, fallback_place_id("<div>Bakery</div>"));
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("\u{e0c8} 12 Main St "), "12 Main St");
        assert_eq!(normalize_address("Straße 5"), "Strae 5");
    }

    #[test]
    fn test_clean_phone() {
        assert_eq!(clean_phone("+1 (555) 010-2030"), "+15550102030");
        assert_eq!(clean_phone("tel: 0700 123"), "0700123");
    }

    #[test]
    fn test_parse_review_count() {
        assert_eq!(parse_review_count("1,234"), Some(1234));
        assert_eq!(parse_review_count("(87)"), Some(87));
        assert_eq!(parse_review_count(""), None);
        assert_eq!(parse_review_count("lots"), None);
    }

    #[test]
    fn test_parse_rating() {
        assert_eq!(parse_rating("4.5"), 4.5);
        assert_eq!(parse_rating("4.5 stars"), 4.5);
        assert_eq!(parse_rating(""), 0.0);
        assert_eq!(parse_rating("No reviews"), 0.0);
    }

    #[test]
    fn test_build_search_url_with_location() {
        let url = build_search_url(
            &SearchTarget::Query("coffee shops".to_string()),
            &LocationContext {
                country: Some("France".to_string()),
                city: Some("Paris".to_string()),
            },
        )
        .unwrap();
        assert_eq!(
            url,
            "https://www.google.com/maps/search/coffee+shops+in+Paris,+France?hl=en"
        );
    }

    #[test]
    fn test_build_search_url_skips_repeated_country() {
        let url = build_search_url(
            &SearchTarget::Query("bakeries france".to_string()),
            &LocationContext {
                country: Some("France".to_string()),
                city: None,
            },
        )
        .unwrap();
        assert_eq!(url, "https://www.google.com/maps/search/bakeries+france?hl=en");
    }

    #[test]
    fn test_build_search_url_keeps_raw_url() {
        let url = build_search_url(
            &SearchTarget::Url("https://www.google.com/maps/search/dentists?authuser=0".into()),
            &LocationContext::default(),
        )
        .unwrap();
        assert_eq!(
            url,
            "https://www.google.com/maps/search/dentists?authuser=0&hl=en"
        );
        assert!(build_search_url(&SearchTarget::Url("not a url".into()), &LocationContext::default()).is_err());
    }
}
