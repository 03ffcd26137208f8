//! Core domain model for kwatera: listings, interactions and the clock they are stamped with.

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "kwatera-core";

/// Milliseconds since the Unix epoch.
pub type Millis = i64;

/// Extracted listing candidate, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub external_id: String,
    pub title: String,
    pub price: String,
    pub floor: Option<String>,
    pub area: Option<String>,
    pub image_url: Option<String>,
    pub external_link: String,
}

/// Persisted listing. `external_id` is the resolved absolute detail URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub external_id: String,
    pub title: String,
    pub price: String,
    pub floor: Option<String>,
    pub area: Option<String>,
    pub image_url: Option<String>,
    pub external_link: String,
    pub created_at: Millis,
    pub updated_at: Millis,
}

/// Engagement state for one listing within one user partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub listing_id: String,
    /// `None` is the anonymous partition.
    pub user_id: Option<String>,
    pub is_viewed: bool,
    pub is_liked: bool,
    pub viewed_at: Option<Millis>,
    pub liked_at: Option<Millis>,
    pub created_at: Millis,
    pub updated_at: Millis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InteractionFlags {
    pub is_viewed: bool,
    pub is_liked: bool,
}

/// Time source for record timestamps.
pub trait Clock: Send + Sync + Debug {
    fn now_millis(&self) -> Millis;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Millis {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Millis) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Millis) -> Millis {
        self.now.fetch_add(by, Ordering::SeqCst) + by
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_on_request() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        assert_eq!(clock.advance(500), 1_500);
        clock.set(42);
        assert_eq!(clock.now_millis(), 42);
    }

    #[test]
    fn flags_serialize_with_snake_case_keys() {
        let flags = InteractionFlags {
            is_viewed: true,
            is_liked: false,
        };
        let json = serde_json::to_value(flags).unwrap();
        assert_eq!(json, serde_json::json!({"is_viewed": true, "is_liked": false}));
    }

    #[test]
    fn missing_listing_details_serialize_as_null() {
        let listing = Listing {
            external_id: "https://www.otodom.pl/pl/oferta/a".into(),
            title: "Mieszkanie".into(),
            price: "2 500 zł".into(),
            floor: None,
            area: Some("25 m²".into()),
            image_url: None,
            external_link: "https://www.otodom.pl/pl/oferta/a".into(),
            created_at: 1,
            updated_at: 2,
        };
        let json = serde_json::to_value(&listing).unwrap();
        assert!(json["floor"].is_null());
        assert!(json["image_url"].is_null());
        assert_eq!(json["area"], "25 m²");
        assert_eq!(json["updated_at"], 2);
    }
}
