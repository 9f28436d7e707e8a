//! Segment Service
//!
//! Business logic for segments and subscriptions. All consistency between
//! concurrent callers is delegated to the store's atomic statements; the
//! service itself holds no locks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::entity::{timeout_from_hours, Membership, MembershipKey, Segment};
use crate::error::{Result, SegmentError};
use crate::expiry::{ExpiryDeadline, ExpiryScheduler};
use crate::store::MembershipStore;

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Deadline for each individual store call
    pub store_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of a successful subscribe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub user_id: i64,
    pub segment_name: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Segment with its current member count.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSummary {
    #[serde(flatten)]
    pub segment: Segment,
    pub members: u64,
}

/// Outcome of a startup reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub expired: u64,
    pub rearmed: usize,
}

pub struct SegmentService {
    store: Arc<dyn MembershipStore>,
    expiry: ExpiryScheduler,
    config: ServiceConfig,
}

impl SegmentService {
    pub fn new(store: Arc<dyn MembershipStore>, config: ServiceConfig) -> Self {
        let expiry = ExpiryScheduler::new(store.clone(), config.store_timeout);
        Self {
            store,
            expiry,
            config,
        }
    }

    pub fn expiry(&self) -> &ExpiryScheduler {
        &self.expiry
    }

    /// Run one store call under the configured deadline.
    async fn guarded<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, "Store call exceeded deadline");
                Err(SegmentError::Timeout { operation })
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn create_segment(&self, name: &str) -> Result<()> {
        validate_segment_name(name)?;

        self.guarded("create_segment", self.store.create_segment(name))
            .await?;

        info!(segment = name, "Segment created");
        Ok(())
    }

    /// Remove all memberships of the segment, then the segment itself.
    /// The segment row is only touched once the cascade has succeeded.
    #[instrument(skip(self))]
    pub async fn delete_segment(&self, name: &str) -> Result<()> {
        validate_segment_name(name)?;

        let removed = self
            .guarded(
                "delete_segment_memberships",
                self.store.delete_segment_memberships(name),
            )
            .await?;

        let deleted = self
            .guarded("delete_segment", self.store.delete_segment(name))
            .await?;

        if !deleted {
            return Err(SegmentError::segment_not_found(name));
        }

        info!(segment = name, memberships_removed = removed, "Segment deleted");
        Ok(())
    }

    /// Subscribe a user permanently (`timeout_hours == 0`) or for the given
    /// number of hours. The expiry timer is armed only after the insert has
    /// succeeded and never delays the caller.
    #[instrument(skip(self))]
    pub async fn subscribe_user(
        &self,
        user_id: i64,
        segment: &str,
        timeout_hours: u32,
    ) -> Result<Subscription> {
        validate_user_id(user_id)?;
        validate_segment_name(segment)?;

        let key = MembershipKey::new(user_id, segment);

        if timeout_hours == 0 {
            self.guarded(
                "insert_permanent_membership",
                self.store.insert_permanent_membership(user_id, segment),
            )
            .await?;

            // A permanent subscribe supersedes an earlier timed one
            self.expiry.cancel(&key);

            info!(user_id, segment, "User subscribed permanently");
            return Ok(Subscription {
                user_id,
                segment_name: segment.to_string(),
                expires_at: None,
            });
        }

        let deadline = ExpiryDeadline::after(timeout_from_hours(timeout_hours))?;

        self.guarded(
            "insert_timed_membership",
            self.store
                .insert_timed_membership(user_id, segment, deadline.expires_at),
        )
        .await?;

        self.expiry.arm(key, deadline);

        info!(
            user_id,
            segment,
            timeout_hours,
            expires_at = %deadline.expires_at,
            "User subscribed with expiry"
        );
        Ok(Subscription {
            user_id,
            segment_name: segment.to_string(),
            expires_at: Some(deadline.expires_at),
        })
    }

    /// Remove a user's membership and cancel its timer. Removing a membership
    /// that does not exist is not an error. The timer is only cancelled once
    /// the delete has succeeded, so a failed unsubscribe keeps expiry enforced.
    #[instrument(skip(self))]
    pub async fn unsubscribe_user(&self, user_id: i64, segment: &str) -> Result<u64> {
        let removed = self
            .guarded(
                "delete_membership",
                self.store.delete_membership(user_id, segment),
            )
            .await?;

        let cancelled = self.expiry.cancel(&MembershipKey::new(user_id, segment));

        if removed == 0 {
            debug!(user_id, segment, "User was not subscribed");
        } else {
            info!(user_id, segment, timer_cancelled = cancelled, "User unsubscribed");
        }
        Ok(removed)
    }

    pub async fn find_segment(&self, name: &str) -> Result<SegmentSummary> {
        let segment = self
            .guarded("find_segment", self.store.find_segment(name))
            .await?
            .ok_or_else(|| SegmentError::segment_not_found(name))?;

        let members = self
            .guarded("count_segment_members", self.store.count_segment_members(name))
            .await?;

        Ok(SegmentSummary { segment, members })
    }

    pub async fn user_memberships(&self, user_id: i64) -> Result<Vec<Membership>> {
        validate_user_id(user_id)?;
        self.guarded(
            "find_user_memberships",
            self.store.find_user_memberships(user_id),
        )
        .await
    }

    /// Delete memberships whose persisted expiry has passed and re-arm timers
    /// for the rest. Intended for startup, when in-memory timers from a
    /// previous process are gone.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let now = Utc::now();

        let expired = self
            .guarded(
                "delete_expired_memberships",
                self.store.delete_expired_memberships(now),
            )
            .await?;

        let pending = self
            .guarded("find_timed_memberships", self.store.find_timed_memberships())
            .await?;

        let mut rearmed = 0;
        for membership in pending {
            let Some(expires_at) = membership.expires_at else {
                continue;
            };
            self.expiry
                .arm(membership.key(), ExpiryDeadline::at(expires_at, now));
            rearmed += 1;
        }

        info!(expired, rearmed, "Reconciled timed memberships");
        Ok(ReconcileReport { expired, rearmed })
    }

    /// Delete every membership past its persisted expiry.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let removed = self
            .guarded(
                "delete_expired_memberships",
                self.store.delete_expired_memberships(Utc::now()),
            )
            .await?;

        if removed > 0 {
            info!(removed, "Swept expired memberships");
        }
        Ok(removed)
    }

    /// Abort all armed timers.
    pub fn shutdown(&self) {
        self.expiry.shutdown();
    }
}

fn validate_segment_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SegmentError::validation("segment name must not be empty"));
    }
    Ok(())
}

fn validate_user_id(user_id: i64) -> Result<()> {
    if user_id <= 0 {
        return Err(SegmentError::validation("user id must be positive"));
    }
    Ok(())
}
