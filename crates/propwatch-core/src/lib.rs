//! Domain model and record normalization for propwatch.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "propwatch-core";

/// A canonical rental listing as observed in one scrape cycle.
///
/// The `id` is the site's own stable identifier for the listing and is the
/// key every diff and history operation works with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub title: String,
    /// Monthly price in whole currency units.
    pub price: u64,
    pub location: String,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub property_type: Option<String>,
    /// Minutes since the listing was posted, as scraped from the site's
    /// relative timestamp. `None` means the site gave no usable timestamp;
    /// such listings never qualify as recently posted.
    pub posted_minutes_ago: Option<u32>,
    pub url: String,
}

impl Listing {
    pub fn priority(&self, max_price: u64) -> Priority {
        Priority::for_price(self.price, max_price)
    }
}

/// Urgency bucket derived from how far below the budget a listing sits.
/// Used only when rendering notifications, never for gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Urgent,
    High,
    Normal,
}

impl Priority {
    /// Below 70% of budget is urgent, below 90% is high, the rest normal.
    pub fn for_price(price: u64, max_price: u64) -> Self {
        if price < max_price.saturating_mul(7) / 10 {
            Priority::Urgent
        } else if price < max_price.saturating_mul(9) / 10 {
            Priority::High
        } else {
            Priority::Normal
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Priority::Urgent => "URGENT - GREAT DEAL",
            Priority::High => "HIGH PRIORITY",
            Priority::Normal => "Within budget",
        }
    }
}

/// Last-known state for a listing id, persisted across cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub last_price: u64,
    /// Set once, on first observation.
    pub first_seen_at: DateTime<Utc>,
    /// Updated on every cycle the id appears.
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    New,
    PriceChanged,
}

/// A classified change eligible for delivery. Produced by the diff engine,
/// consumed once by the dispatcher, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifiableEvent {
    pub kind: EventKind,
    pub listing: Listing,
    /// Present only for `PriceChanged`.
    pub previous_price: Option<u64>,
}

impl NotifiableEvent {
    pub fn new_listing(listing: Listing) -> Self {
        Self {
            kind: EventKind::New,
            listing,
            previous_price: None,
        }
    }

    pub fn price_changed(listing: Listing, previous_price: u64) -> Self {
        Self {
            kind: EventKind::PriceChanged,
            listing,
            previous_price: Some(previous_price),
        }
    }
}

/// Per-cycle summary, logged once per cycle and then discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub total_scraped: usize,
    pub new_count: usize,
    pub within_budget: usize,
    pub notifications_sent: usize,
    pub failed_notifications: usize,
    pub skipped_malformed: usize,
    pub fetch_failed: bool,
    pub duration: Duration,
}

impl fmt::Display for CycleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scraped={} new={} budget={} sent={} failed={} malformed={} fetch_failed={} duration={}ms",
            self.total_scraped,
            self.new_count,
            self.within_budget,
            self.notifications_sent,
            self.failed_notifications,
            self.skipped_malformed,
            self.fetch_failed,
            self.duration.as_millis()
        )
    }
}

/// Loosely-typed scrape output, one per listing card. Everything is optional
/// text; `normalize` decides what is usable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawListing {
    pub id: Option<String>,
    pub title: Option<String>,
    pub price: Option<String>,
    pub location: Option<String>,
    pub bedrooms: Option<String>,
    pub bathrooms: Option<String>,
    pub property_type: Option<String>,
    pub posted_text: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has malformed value `{value}`")]
    Malformed {
        field: &'static str,
        value: String,
    },
}

/// Convert a raw scraped record into a canonical [`Listing`].
///
/// A failure here affects only the one record; callers drop it and keep
/// processing the rest of the snapshot.
pub fn normalize(raw: RawListing, base_url: &str) -> Result<Listing, NormalizeError> {
    let id = required_text(raw.id, "id")?;
    let title = required_text(raw.title, "title")?;

    let price_text = raw
        .price
        .filter(|v| !v.trim().is_empty())
        .ok_or(NormalizeError::MissingField("price"))?;
    let price = parse_price(&price_text).ok_or_else(|| NormalizeError::Malformed {
        field: "price",
        value: price_text.clone(),
    })?;

    let url_text = required_text(raw.url, "url")?;
    let url = absolutize_url(&url_text, base_url);

    Ok(Listing {
        id,
        title,
        price,
        location: raw
            .location
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "Unknown".to_string()),
        bedrooms: raw.bedrooms.as_deref().and_then(first_integer),
        bathrooms: raw.bathrooms.as_deref().and_then(first_integer),
        property_type: raw
            .property_type
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()),
        posted_minutes_ago: raw.posted_text.as_deref().and_then(parse_posted_age),
        url,
    })
}

fn required_text(value: Option<String>, field: &'static str) -> Result<String, NormalizeError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(NormalizeError::MissingField(field))
}

/// Parse price text like `Rs15,000`, `Rs 15 000/month` into whole units.
pub fn parse_price(text: &str) -> Option<u64> {
    if text.contains('-') {
        return None;
    }
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Parse relative posting age like `40 minutes ago`, `2 hours ago`,
/// `1 day ago` into minutes. Unparseable text yields `None`.
pub fn parse_posted_age(text: &str) -> Option<u32> {
    let lower = text.trim().to_ascii_lowercase();
    if lower == "just now" || lower == "now" {
        return Some(0);
    }
    let n = first_integer(&lower)?;
    if lower.contains("minute") {
        Some(n)
    } else if lower.contains("hour") {
        n.checked_mul(60)
    } else if lower.contains("day") {
        n.checked_mul(1_440)
    } else if lower.contains("week") {
        n.checked_mul(10_080)
    } else {
        None
    }
}

fn first_integer(text: &str) -> Option<u32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if !digits.is_empty() {
            break;
        }
    }
    digits.parse().ok()
}

fn absolutize_url(url: &str, base_url: &str) -> String {
    if url.starts_with("http") {
        return url.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if url.starts_with('/') {
        format!("{base}{url}")
    } else {
        format!("{base}/{url}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_ok() -> RawListing {
        RawListing {
            id: Some("hz-1029".into()),
            title: Some("2BHK Flat in Baneshwor".into()),
            price: Some("Rs 9,500".into()),
            location: Some("Baneshwor, Kathmandu".into()),
            bedrooms: Some("Beds: 2".into()),
            bathrooms: Some("Bath: 1".into()),
            property_type: Some("Flat / Apartment".into()),
            posted_text: Some("40 minutes ago".into()),
            url: Some("/property/hz-1029".into()),
        }
    }

    #[test]
    fn normalize_happy_path() {
        let listing = normalize(raw_ok(), "https://nepalpropertybazaar.com").expect("normalize");
        assert_eq!(listing.id, "hz-1029");
        assert_eq!(listing.price, 9_500);
        assert_eq!(listing.bedrooms, Some(2));
        assert_eq!(listing.bathrooms, Some(1));
        assert_eq!(listing.posted_minutes_ago, Some(40));
        assert_eq!(listing.url, "https://nepalpropertybazaar.com/property/hz-1029");
    }

    #[test]
    fn normalize_rejects_missing_id() {
        let raw = RawListing {
            id: Some("   ".into()),
            ..raw_ok()
        };
        assert_eq!(
            normalize(raw, "https://example.com"),
            Err(NormalizeError::MissingField("id"))
        );
    }

    #[test]
    fn normalize_rejects_unparseable_price() {
        let raw = RawListing {
            price: Some("negotiable".into()),
            ..raw_ok()
        };
        assert!(matches!(
            normalize(raw, "https://example.com"),
            Err(NormalizeError::Malformed { field: "price", .. })
        ));
    }

    #[test]
    fn normalize_tolerates_missing_optionals() {
        let raw = RawListing {
            location: None,
            bedrooms: None,
            bathrooms: None,
            property_type: None,
            posted_text: None,
            ..raw_ok()
        };
        let listing = normalize(raw, "https://example.com").expect("normalize");
        assert_eq!(listing.location, "Unknown");
        assert_eq!(listing.bedrooms, None);
        assert_eq!(listing.posted_minutes_ago, None);
    }

    #[test]
    fn price_parsing_variants() {
        assert_eq!(parse_price("Rs15,000"), Some(15_000));
        assert_eq!(parse_price("Rs 15 000 / month"), Some(15_000));
        assert_eq!(parse_price("free"), None);
        assert_eq!(parse_price("Rs -500"), None);
    }

    #[test]
    fn posted_age_parsing_variants() {
        assert_eq!(parse_posted_age("40 minutes ago"), Some(40));
        assert_eq!(parse_posted_age("2 hours ago"), Some(120));
        assert_eq!(parse_posted_age("1 day ago"), Some(1_440));
        assert_eq!(parse_posted_age("3 weeks ago"), Some(30_240));
        assert_eq!(parse_posted_age("just now"), Some(0));
        assert_eq!(parse_posted_age("yesterday"), None);
    }

    #[test]
    fn priority_buckets_track_budget() {
        assert_eq!(Priority::for_price(6_000, 10_000), Priority::Urgent);
        assert_eq!(Priority::for_price(8_000, 10_000), Priority::High);
        assert_eq!(Priority::for_price(9_500, 10_000), Priority::Normal);
    }
}
