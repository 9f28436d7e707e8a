//! Expiration timers for timed memberships.
//!
//! Each timed subscription gets one tokio task that parks until its deadline,
//! issues a single expiration delete, and removes itself from the registry:
//!
//! ```text
//! Armed --deadline--> Fired --delete issued--> Reconciled
//!   \
//!    `--cancel / replace--> Cancelled
//! ```
//!
//! Timers live only in process memory. The persisted expiry is the source of
//! truth; see `SegmentService::reconcile` for recovery after a restart.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::entity::{expiry_after, MembershipKey};
use crate::error::Result;
use crate::store::MembershipStore;

/// When a timed membership ends, captured once so the persisted expiry and the
/// timer deadline describe the same moment.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryDeadline {
    pub expires_at: DateTime<Utc>,
    pub fires_at: Instant,
}

impl ExpiryDeadline {
    /// Deadline `ttl` from now.
    ///
    /// The monotonic and wall clocks are read back to back; together they
    /// stand for the single `now` both the timer and the persisted expiry
    /// are derived from.
    pub fn after(ttl: Duration) -> Result<Self> {
        let now = Utc::now();
        let started = Instant::now();

        let expires_at = expiry_after(now, ttl)?;
        let fires_at = started + ttl;
        Ok(Self {
            expires_at,
            fires_at,
        })
    }

    /// Deadline for an already persisted expiry. Overdue expiries fire
    /// immediately.
    pub fn at(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let remaining = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
        Self {
            expires_at,
            fires_at: Instant::now() + remaining,
        }
    }
}

struct ArmedTimer {
    generation: u64,
    expires_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Registry of armed expiration timers, addressable by (user, segment).
pub struct ExpiryScheduler {
    store: Arc<dyn MembershipStore>,
    timers: Arc<DashMap<MembershipKey, ArmedTimer>>,
    next_generation: AtomicU64,
    store_timeout: Duration,
}

impl ExpiryScheduler {
    pub fn new(store: Arc<dyn MembershipStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            timers: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            store_timeout,
        }
    }

    /// Arm a one-shot timer for `key`. A timer already armed for the same key
    /// is cancelled and replaced.
    pub fn arm(&self, key: MembershipKey, deadline: ExpiryDeadline) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        // The entry guard is held while spawning so the task cannot try to
        // deregister before its own entry exists.
        match self.timers.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let handle = self.spawn_timer(key.clone(), deadline, generation);
                let previous = occupied.insert(ArmedTimer {
                    generation,
                    expires_at: deadline.expires_at,
                    handle,
                });
                previous.handle.abort();
                debug!(membership = %key, expires_at = %deadline.expires_at, "Replaced expiry timer");
            }
            Entry::Vacant(vacant) => {
                let handle = self.spawn_timer(key.clone(), deadline, generation);
                vacant.insert(ArmedTimer {
                    generation,
                    expires_at: deadline.expires_at,
                    handle,
                });
                debug!(membership = %key, expires_at = %deadline.expires_at, "Armed expiry timer");
            }
        }

        metrics::counter!("segments.expiry.armed_total").increment(1);
    }

    fn spawn_timer(&self, key: MembershipKey, deadline: ExpiryDeadline, generation: u64) -> JoinHandle<()> {
        let store = self.store.clone();
        let timers = self.timers.clone();
        let store_timeout = self.store_timeout;

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline.fires_at).await;

            expire_membership(store.as_ref(), &key, deadline.expires_at, store_timeout).await;

            timers.remove_if(&key, |_, timer| timer.generation == generation);
        })
    }

    /// Cancel a still-armed timer. Returns false if none was armed.
    pub fn cancel(&self, key: &MembershipKey) -> bool {
        match self.timers.remove(key) {
            Some((_, timer)) => {
                timer.handle.abort();
                metrics::counter!("segments.expiry.cancelled_total").increment(1);
                debug!(membership = %key, "Cancelled expiry timer");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, key: &MembershipKey) -> bool {
        self.timers.contains_key(key)
    }

    /// Expiry enforced by the timer armed for `key`, if any.
    pub fn armed_expiry(&self, key: &MembershipKey) -> Option<DateTime<Utc>> {
        self.timers.get(key).map(|timer| timer.expires_at)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }

    /// Abort every armed timer.
    pub fn shutdown(&self) {
        let count = self.timers.len();
        self.timers.retain(|_, timer| {
            timer.handle.abort();
            false
        });
        if count > 0 {
            info!(count, "Aborted armed expiry timers");
        }
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Timer-fired delete. Failures are logged and counted, never retried or
/// surfaced; the row then outlives its expiry until a sweep or manual call.
async fn expire_membership(
    store: &dyn MembershipStore,
    key: &MembershipKey,
    expires_at: DateTime<Utc>,
    store_timeout: Duration,
) {
    let delete = store.delete_expired_membership(key.user_id, &key.segment, expires_at);

    match tokio::time::timeout(store_timeout, delete).await {
        Ok(Ok(0)) => {
            metrics::counter!("segments.expiry.noop_total").increment(1);
            debug!(membership = %key, "Membership already gone when timer fired");
        }
        Ok(Ok(removed)) => {
            metrics::counter!("segments.expiry.fired_total").increment(1);
            info!(
                user_id = key.user_id,
                segment = %key.segment,
                removed,
                "User unsubscribed from segment on expiry"
            );
        }
        Ok(Err(e)) => {
            metrics::counter!("segments.expiry.errors_total").increment(1);
            error!(membership = %key, error = %e, "Failed to remove expired membership");
        }
        Err(_) => {
            metrics::counter!("segments.expiry.errors_total").increment(1);
            warn!(
                membership = %key,
                timeout_ms = store_timeout.as_millis() as u64,
                "Timed out removing expired membership"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryMembershipStore;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn scheduler_with_member(ttl: Duration) -> (Arc<InMemoryMembershipStore>, ExpiryScheduler, ExpiryDeadline) {
        let store = Arc::new(InMemoryMembershipStore::new());
        store.create_segment("beta").await.unwrap();
        let deadline = ExpiryDeadline::after(ttl).unwrap();
        store
            .insert_timed_membership(42, "beta", deadline.expires_at)
            .await
            .unwrap();
        let scheduler = ExpiryScheduler::new(store.clone(), Duration::from_secs(5));
        (store, scheduler, deadline)
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_clocks_share_one_capture() {
        let ttl = Duration::from_secs(3600);
        let wall_before = Utc::now();
        let mono_before = Instant::now();

        let deadline = ExpiryDeadline::after(ttl).unwrap();

        let wall_after = Utc::now();
        assert_eq!(deadline.fires_at - mono_before, ttl);
        assert!(deadline.expires_at >= wall_before + chrono::Duration::hours(1));
        assert!(deadline.expires_at <= wall_after + chrono::Duration::hours(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_and_deregisters() {
        let (store, scheduler, deadline) = scheduler_with_member(Duration::from_secs(3600)).await;
        let key = MembershipKey::new(42, "beta");

        scheduler.arm(key.clone(), deadline);
        assert!(scheduler.is_armed(&key));

        tokio::time::sleep(Duration::from_secs(3599)).await;
        settle().await;
        assert_eq!(store.count_segment_members("beta").await.unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(store.count_segment_members("beta").await.unwrap(), 0);
        assert!(!scheduler.is_armed(&key));
        assert_eq!(scheduler.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (store, scheduler, deadline) = scheduler_with_member(Duration::from_secs(60)).await;
        let key = MembershipKey::new(42, "beta");

        scheduler.arm(key.clone(), deadline);
        assert!(scheduler.cancel(&key));
        assert!(!scheduler.cancel(&key));

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(store.count_segment_members("beta").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_timer() {
        let (store, scheduler, first) = scheduler_with_member(Duration::from_secs(60)).await;
        let key = MembershipKey::new(42, "beta");
        scheduler.arm(key.clone(), first);

        let second = ExpiryDeadline::after(Duration::from_secs(600)).unwrap();
        store
            .insert_timed_membership(42, "beta", second.expires_at)
            .await
            .unwrap();
        scheduler.arm(key.clone(), second);
        assert_eq!(scheduler.armed_count(), 1);
        assert_eq!(scheduler.armed_expiry(&key), Some(second.expires_at));

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(store.count_segment_members("beta").await.unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(store.count_segment_members("beta").await.unwrap(), 0);
        assert_eq!(scheduler.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_deadline_fires_immediately() {
        let (store, scheduler, deadline) = scheduler_with_member(Duration::from_secs(60)).await;
        let overdue = ExpiryDeadline::at(
            deadline.expires_at,
            deadline.expires_at + chrono::Duration::minutes(5),
        );

        scheduler.arm(MembershipKey::new(42, "beta"), overdue);
        settle().await;
        assert_eq!(store.count_segment_members("beta").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_all_timers() {
        let (store, scheduler, deadline) = scheduler_with_member(Duration::from_secs(60)).await;
        scheduler.arm(MembershipKey::new(42, "beta"), deadline);

        scheduler.shutdown();
        assert_eq!(scheduler.armed_count(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(store.count_segment_members("beta").await.unwrap(), 1);
    }
}
