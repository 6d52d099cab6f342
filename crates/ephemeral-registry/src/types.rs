//! Registry types

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Longest lifetime a record may carry
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Opaque identifier of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Generate a fresh id: ingestion time in unix millis plus 128 bits of
    /// random entropy, so two ids minted in the same millisecond still differ.
    pub fn generate() -> Self {
        Self(format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ObjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata for one live object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub display_name: String,
    pub content_location: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl ObjectRecord {
    /// Build a record for content that was just written under `id`.
    ///
    /// The content location is the id itself and `created_at` is the current
    /// time truncated to milliseconds. `ttl` is capped at [`MAX_TTL`].
    pub fn new(id: ObjectId, display_name: &str, size: u64, ttl: Duration) -> Self {
        Self {
            content_location: id.as_str().to_string(),
            id,
            display_name: sanitize_display_name(display_name),
            size,
            created_at: Utc::now().trunc_subsecs(3),
            ttl_ms: u64::try_from(ttl.min(MAX_TTL).as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Expiry time, `None` if it falls outside the representable range
    pub fn checked_expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = TimeDelta::try_milliseconds(i64::try_from(self.ttl_ms).ok()?)?;
        self.created_at.checked_add_signed(ttl)
    }

    /// Expiry time, saturating at the latest representable instant
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.checked_expires_at().unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Time left before expiry, zero once the deadline has passed
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at() - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Reduce a client-supplied file name to its last path component.
pub fn sanitize_display_name(raw: &str) -> String {
    let name = raw
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();

    if name.is_empty() || name == "." || name == ".." {
        "file".to_string()
    } else {
        name.to_string()
    }
}

/// A state transition of the live set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(Vec<ObjectRecord>),
    Removed(ObjectId),
    RemovedAll,
    /// Remaining lifetime of every live object, one event per tick
    RemainingTimes(Vec<(ObjectId, Duration)>),
}

/// Counters describing the registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub live_objects: usize,
    pub live_bytes: u64,
    pub evicted: u64,
    pub deleted: u64,
    pub orphaned_content: u64,
    pub durability_gap: bool,
}
