//! Utility functions for identifiers, timestamps and name validation.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use uuid::Uuid;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Generates a new random (v4) identifier.
#[must_use]
pub fn generate_id() -> Uuid {
    Uuid::new_v4()
}

/// Returns `now - duration`, saturating at the minimum representable time.
#[must_use]
pub fn before_now(duration: Duration) -> Timestamp {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now_utc().checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").ok())
        .as_ref()
}

/// Returns true if `name` can be used as a queue and counter namespace segment.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    name_pattern().is_some_and(|pattern| pattern.is_match(name))
}

/// Serde helpers for durations stored as milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes a duration as integer milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserializes integer milliseconds into a duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
