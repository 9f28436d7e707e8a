//! Membership Store Trait
//!
//! Durable mapping of segment names to ids and of (user, segment, expiry)
//! membership rows. Every insert that references a segment performs the
//! lookup and the insert in one statement, so a concurrent segment delete
//! either cascades the new row away or makes the insert report `NotFound`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entity::{Membership, Segment};
use crate::error::Result;

/// Table names used by the SQL stores
#[derive(Debug, Clone)]
pub struct MembershipTableConfig {
    pub segments_table: String,
    pub memberships_table: String,
}

impl Default for MembershipTableConfig {
    fn default() -> Self {
        Self {
            segments_table: "segments".to_string(),
            memberships_table: "memberships".to_string(),
        }
    }
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    // ========================================================================
    // Segments
    // ========================================================================

    /// Insert a segment. Fails with `Conflict` if the name is taken.
    async fn create_segment(&self, name: &str) -> Result<()>;

    /// Delete a segment definition. Returns false if no such segment existed.
    ///
    /// Memberships must already be gone; the SQL stores reject the delete
    /// through the foreign key otherwise.
    async fn delete_segment(&self, name: &str) -> Result<bool>;

    async fn find_segment(&self, name: &str) -> Result<Option<Segment>>;

    // ========================================================================
    // Memberships
    // ========================================================================

    /// Delete every membership of the named segment.
    async fn delete_segment_memberships(&self, name: &str) -> Result<u64>;

    /// Insert (or make permanent) a membership if the segment exists,
    /// `NotFound` otherwise.
    async fn insert_permanent_membership(&self, user_id: i64, segment: &str) -> Result<()>;

    /// Insert (or replace the expiry of) a membership if the segment exists,
    /// `NotFound` otherwise.
    async fn insert_timed_membership(
        &self,
        user_id: i64,
        segment: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Delete a user's membership. Deleting an absent row is not an error.
    async fn delete_membership(&self, user_id: i64, segment: &str) -> Result<u64>;

    /// Delete a user's membership only if it carries an expiry at or before
    /// `expires_at`. Permanent rows and rows re-subscribed with a later
    /// expiry are left alone.
    async fn delete_expired_membership(
        &self,
        user_id: i64,
        segment: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<u64>;

    async fn count_segment_members(&self, name: &str) -> Result<u64>;

    async fn find_user_memberships(&self, user_id: i64) -> Result<Vec<Membership>>;

    /// All memberships that carry an expiry, for reconciliation.
    async fn find_timed_memberships(&self) -> Result<Vec<Membership>>;

    /// Delete every membership whose expiry is at or before `now`.
    async fn delete_expired_memberships(&self, now: DateTime<Utc>) -> Result<u64>;

    // ========================================================================
    // Schema Management
    // ========================================================================

    /// Create tables if they do not exist
    async fn init_schema(&self) -> Result<()>;
}

/// Whether a sqlx error is a unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db_err| db_err.is_unique_violation())
        .unwrap_or(false)
}
