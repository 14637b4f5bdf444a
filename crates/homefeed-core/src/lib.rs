//! Core domain model for listings and sync run bookkeeping.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "homefeed-core";

/// Message recorded alongside every successful sync run.
pub const SYNC_SUCCESS_NOTE: &str = "Successfully updated listings";

/// Attributes captured when a listing is first observed.
///
/// Everything here is written once at creation. Re-observing the same token
/// only applies a [`ListingRefresh`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub id: String,
    pub external_numeric_id: i64,
    pub price: i64,
    pub city: Option<String>,
    pub neighborhood: Option<String>,
    pub area: Option<String>,
    pub street: Option<String>,
    pub house_number: Option<i32>,
    pub floor: Option<i32>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub rooms: Option<f64>,
    pub square_meters: Option<f64>,
    pub property_type: Option<String>,
    pub cover_image: Option<String>,
    pub images: Vec<String>,
    /// Marker JSON exactly as received from the feed.
    pub raw_data: String,
}

/// The mutable subset applied when an existing listing is observed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRefresh {
    pub price: i64,
}

impl ListingDraft {
    pub fn refresh(&self) -> ListingRefresh {
        ListingRefresh { price: self.price }
    }
}

/// Persisted listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: String,
    pub external_numeric_id: i64,
    pub price: i64,
    pub city: Option<String>,
    pub neighborhood: Option<String>,
    pub area: Option<String>,
    pub street: Option<String>,
    pub house_number: Option<i32>,
    pub floor: Option<i32>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub rooms: Option<f64>,
    pub square_meters: Option<f64>,
    pub property_type: Option<String>,
    pub cover_image: Option<String>,
    pub images: Vec<String>,
    pub raw_data: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_favorite: bool,
    pub is_hidden: bool,
}

impl Listing {
    /// Builds a freshly created row; both provenance timestamps equal `seen_at`.
    pub fn from_draft(draft: ListingDraft, seen_at: DateTime<Utc>) -> Self {
        Self {
            id: draft.id,
            external_numeric_id: draft.external_numeric_id,
            price: draft.price,
            city: draft.city,
            neighborhood: draft.neighborhood,
            area: draft.area,
            street: draft.street,
            house_number: draft.house_number,
            floor: draft.floor,
            lat: draft.lat,
            lon: draft.lon,
            rooms: draft.rooms,
            square_meters: draft.square_meters,
            property_type: draft.property_type,
            cover_image: draft.cover_image,
            images: draft.images,
            raw_data: draft.raw_data,
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            is_favorite: false,
            is_hidden: false,
        }
    }

    /// Applies a re-observation. `last_seen_at` never moves backwards so
    /// `first_seen_at <= last_seen_at` holds under out-of-order writers.
    pub fn apply_refresh(&mut self, refresh: ListingRefresh, seen_at: DateTime<Utc>) {
        self.price = refresh.price;
        if seen_at > self.last_seen_at {
            self.last_seen_at = seen_at;
        }
    }

    pub fn apply_annotations(&mut self, patch: &AnnotationPatch) {
        if let Some(is_favorite) = patch.is_favorite {
            self.is_favorite = is_favorite;
        }
        if let Some(is_hidden) = patch.is_hidden {
            self.is_hidden = is_hidden;
        }
    }
}

/// Whether an upsert inserted a new row or refreshed an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertKind {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upserted {
    pub listing: Listing,
    pub kind: UpsertKind,
}

/// User-facing annotation changes; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationPatch {
    #[serde(default)]
    pub is_favorite: Option<bool>,
    #[serde(default)]
    pub is_hidden: Option<bool>,
}

impl AnnotationPatch {
    pub fn is_empty(&self) -> bool {
        self.is_favorite.is_none() && self.is_hidden.is_none()
    }
}

/// Read-side filter over stored listings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingFilter {
    pub show_hidden: bool,
    pub favorites_only: bool,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub min_rooms: Option<f64>,
    pub max_rooms: Option<f64>,
}

impl ListingFilter {
    /// Bounds are inclusive. A listing without a room count never satisfies a
    /// room bound.
    pub fn matches(&self, listing: &Listing) -> bool {
        if !self.show_hidden && listing.is_hidden {
            return false;
        }
        if self.favorites_only && !listing.is_favorite {
            return false;
        }
        if self.min_price.is_some_and(|min| listing.price < min) {
            return false;
        }
        if self.max_price.is_some_and(|max| listing.price > max) {
            return false;
        }
        if let Some(min) = self.min_rooms {
            if !listing.rooms.is_some_and(|rooms| rooms >= min) {
                return false;
            }
        }
        if let Some(max) = self.max_rooms {
            if !listing.rooms.is_some_and(|rooms| rooms <= max) {
                return false;
            }
        }
        true
    }
}

/// Favorites first, then most recently discovered.
pub fn listing_display_order(a: &Listing, b: &Listing) -> Ordering {
    b.is_favorite
        .cmp(&a.is_favorite)
        .then_with(|| b.first_seen_at.cmp(&a.first_seen_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Success,
    Failure,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Success => "SUCCESS",
            SyncStatus::Failure => "FAILURE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUCCESS" => Some(SyncStatus::Success),
            "FAILURE" => Some(SyncStatus::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A run-log row about to be appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub status: SyncStatus,
    pub items_count: Option<i64>,
    pub message: Option<String>,
}

impl SyncLogEntry {
    pub fn success(items_count: usize) -> Self {
        Self {
            status: SyncStatus::Success,
            items_count: Some(i64::try_from(items_count).unwrap_or(i64::MAX)),
            message: Some(SYNC_SUCCESS_NOTE.to_string()),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: SyncStatus::Failure,
            items_count: None,
            message: Some(if message.is_empty() {
                "Unknown error".to_string()
            } else {
                message
            }),
        }
    }
}

/// Append-only audit record of one sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLog {
    pub id: i64,
    pub status: SyncStatus,
    pub items_count: Option<i64>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result handed back to whoever triggered a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub count: usize,
}

impl SyncOutcome {
    pub fn completed(count: usize) -> Self {
        Self {
            success: true,
            count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn draft(id: &str, price: i64, rooms: Option<f64>) -> ListingDraft {
        ListingDraft {
            id: id.to_string(),
            external_numeric_id: 7,
            price,
            city: Some("Tel Aviv".into()),
            neighborhood: None,
            area: None,
            street: None,
            house_number: None,
            floor: None,
            lat: None,
            lon: None,
            rooms,
            square_meters: Some(80.0),
            property_type: None,
            cover_image: None,
            images: vec![],
            raw_data: "{}".into(),
        }
    }

    #[test]
    fn created_listing_has_matching_timestamps_and_no_annotations() {
        let listing = Listing::from_draft(draft("a", 100, Some(3.0)), ts(8));
        assert_eq!(listing.first_seen_at, listing.last_seen_at);
        assert!(!listing.is_favorite);
        assert!(!listing.is_hidden);
    }

    #[test]
    fn refresh_touches_only_price_and_last_seen() {
        let mut listing = Listing::from_draft(draft("a", 100, Some(3.0)), ts(8));
        listing.is_favorite = true;
        let before = listing.clone();
        listing.apply_refresh(ListingRefresh { price: 90 }, ts(10));

        assert_eq!(listing.price, 90);
        assert_eq!(listing.last_seen_at, ts(10));
        assert_eq!(listing.first_seen_at, before.first_seen_at);
        assert_eq!(listing.rooms, before.rooms);
        assert!(listing.is_favorite);
    }

    #[test]
    fn refresh_never_moves_last_seen_backwards() {
        let mut listing = Listing::from_draft(draft("a", 100, None), ts(10));
        listing.apply_refresh(ListingRefresh { price: 80 }, ts(9));
        assert_eq!(listing.price, 80);
        assert_eq!(listing.last_seen_at, ts(10));
        assert!(listing.first_seen_at <= listing.last_seen_at);
    }

    #[test]
    fn filter_hides_hidden_unless_requested_and_applies_inclusive_bounds() {
        let mut hidden = Listing::from_draft(draft("h", 100, Some(3.0)), ts(8));
        hidden.is_hidden = true;
        let plain = Listing::from_draft(draft("p", 200, Some(4.0)), ts(8));
        let roomless = Listing::from_draft(draft("r", 200, None), ts(8));

        let default = ListingFilter::default();
        assert!(!default.matches(&hidden));
        assert!(default.matches(&plain));

        let bounded = ListingFilter {
            show_hidden: true,
            min_price: Some(100),
            max_price: Some(200),
            min_rooms: Some(3.0),
            ..Default::default()
        };
        assert!(bounded.matches(&hidden));
        assert!(bounded.matches(&plain));
        assert!(!bounded.matches(&roomless));
    }

    #[test]
    fn display_order_puts_favorites_first_then_newest() {
        let old_fav = {
            let mut l = Listing::from_draft(draft("old-fav", 1, None), ts(1));
            l.is_favorite = true;
            l
        };
        let new_plain = Listing::from_draft(draft("new", 1, None), ts(5));
        let older_plain = Listing::from_draft(draft("older", 1, None), ts(3));

        let mut rows = vec![older_plain, new_plain, old_fav];
        rows.sort_by(listing_display_order);
        let ids: Vec<_> = rows.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["old-fav", "new", "older"]);
    }

    #[test]
    fn failure_entry_substitutes_unknown_error_for_empty_message() {
        let entry = SyncLogEntry::failure("");
        assert_eq!(entry.status, SyncStatus::Failure);
        assert_eq!(entry.message.as_deref(), Some("Unknown error"));
        assert_eq!(entry.items_count, None);
    }

    #[test]
    fn outcome_serializes_as_success_and_count() {
        let json = serde_json::to_value(SyncOutcome::completed(4)).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "count": 4}));
    }
}
