//! Segment and membership records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::error::{Result, SegmentError};

const SECONDS_PER_HOUR: u64 = 3600;

/// A named cohort users can belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A user's membership in a segment. `expires_at == None` means permanent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub user_id: i64,
    pub segment_name: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Membership {
    pub fn key(&self) -> MembershipKey {
        MembershipKey::new(self.user_id, self.segment_name.clone())
    }

    pub fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
    }
}

/// Identifies the (user, segment) pair a timer enforces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MembershipKey {
    pub user_id: i64,
    pub segment: String,
}

impl MembershipKey {
    pub fn new(user_id: i64, segment: impl Into<String>) -> Self {
        Self {
            user_id,
            segment: segment.into(),
        }
    }
}

impl fmt::Display for MembershipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.segment)
    }
}

/// Convert a subscription timeout in hours into the one duration that drives
/// both the persisted expiry and the timer.
pub fn timeout_from_hours(hours: u32) -> Duration {
    Duration::from_secs(u64::from(hours) * SECONDS_PER_HOUR)
}

/// `now + ttl`, or a validation error if the result leaves chrono's range.
pub fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| SegmentError::validation("timeout is too large"))
}

/// Stores persist timestamps as epoch milliseconds.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| SegmentError::internal(format!("invalid timestamp {millis}")))
}
