//! Timestamp helpers.

use chrono::{DateTime, Utc};

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Returns `candidate` unless it is earlier than `floor`, in which case
/// `floor` is returned. Keeps timestamps in a log non-decreasing.
#[must_use]
pub fn not_before(candidate: Timestamp, floor: Timestamp) -> Timestamp {
    if candidate < floor {
        floor
    } else {
        candidate
    }
}
