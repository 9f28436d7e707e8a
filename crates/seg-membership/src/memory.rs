//! In-memory Membership Store
//!
//! Non-durable store for development mode and tests. One mutex guards the
//! whole state, which gives every operation the same atomicity the SQL stores
//! get from single statements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use crate::entity::{Membership, Segment};
use crate::error::{Result, SegmentError};
use crate::store::MembershipStore;

#[derive(Default)]
struct MemoryState {
    next_segment_id: i64,
    segments: HashMap<String, Segment>,
    /// (user_id, segment_id) -> expires_at
    memberships: BTreeMap<(i64, i64), Option<DateTime<Utc>>>,
}

impl MemoryState {
    fn segment_id(&self, name: &str) -> Option<i64> {
        self.segments.get(name).map(|s| s.id)
    }

    fn segment_name(&self, segment_id: i64) -> Option<&str> {
        self.segments
            .values()
            .find(|s| s.id == segment_id)
            .map(|s| s.name.as_str())
    }

    fn remove_where<F>(&mut self, mut predicate: F) -> u64
    where
        F: FnMut(&(i64, i64), &Option<DateTime<Utc>>) -> bool,
    {
        let before = self.memberships.len();
        self.memberships.retain(|key, expiry| !predicate(key, expiry));
        (before - self.memberships.len()) as u64
    }

    fn to_membership(&self, key: &(i64, i64), expires_at: Option<DateTime<Utc>>) -> Option<Membership> {
        self.segment_name(key.1).map(|name| Membership {
            user_id: key.0,
            segment_name: name.to_string(),
            expires_at,
        })
    }
}

#[derive(Default)]
pub struct InMemoryMembershipStore {
    state: Mutex<MemoryState>,
}

impl InMemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn upsert(&self, user_id: i64, segment: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut state = self.state.lock();
        let segment_id = state
            .segment_id(segment)
            .ok_or_else(|| SegmentError::segment_not_found(segment))?;
        state.memberships.insert((user_id, segment_id), expires_at);
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for InMemoryMembershipStore {
    async fn create_segment(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.segments.contains_key(name) {
            return Err(SegmentError::conflict(name));
        }

        state.next_segment_id += 1;
        let segment = Segment {
            id: state.next_segment_id,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        state.segments.insert(name.to_string(), segment);
        Ok(())
    }

    async fn delete_segment(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(segment_id) = state.segment_id(name) else {
            return Ok(false);
        };

        if state.memberships.keys().any(|(_, id)| *id == segment_id) {
            return Err(SegmentError::internal(format!(
                "segment '{name}' still has memberships"
            )));
        }

        state.segments.remove(name);
        Ok(true)
    }

    async fn find_segment(&self, name: &str) -> Result<Option<Segment>> {
        Ok(self.state.lock().segments.get(name).cloned())
    }

    async fn delete_segment_memberships(&self, name: &str) -> Result<u64> {
        let mut state = self.state.lock();
        let Some(segment_id) = state.segment_id(name) else {
            return Ok(0);
        };
        Ok(state.remove_where(|(_, id), _| *id == segment_id))
    }

    async fn insert_permanent_membership(&self, user_id: i64, segment: &str) -> Result<()> {
        self.upsert(user_id, segment, None)
    }

    async fn insert_timed_membership(
        &self,
        user_id: i64,
        segment: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.upsert(user_id, segment, Some(expires_at))
    }

    async fn delete_membership(&self, user_id: i64, segment: &str) -> Result<u64> {
        let mut state = self.state.lock();
        let Some(segment_id) = state.segment_id(segment) else {
            return Ok(0);
        };
        Ok(state.remove_where(|key, _| *key == (user_id, segment_id)))
    }

    async fn delete_expired_membership(
        &self,
        user_id: i64,
        segment: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        let Some(segment_id) = state.segment_id(segment) else {
            return Ok(0);
        };
        Ok(state.remove_where(|key, expiry| {
            *key == (user_id, segment_id) && matches!(expiry, Some(at) if *at <= expires_at)
        }))
    }

    async fn count_segment_members(&self, name: &str) -> Result<u64> {
        let state = self.state.lock();
        let Some(segment_id) = state.segment_id(name) else {
            return Ok(0);
        };
        Ok(state
            .memberships
            .keys()
            .filter(|(_, id)| *id == segment_id)
            .count() as u64)
    }

    async fn find_user_memberships(&self, user_id: i64) -> Result<Vec<Membership>> {
        let state = self.state.lock();
        let mut memberships: Vec<Membership> = state
            .memberships
            .iter()
            .filter(|((user, _), _)| *user == user_id)
            .filter_map(|(key, expiry)| state.to_membership(key, *expiry))
            .collect();
        memberships.sort_by(|a, b| a.segment_name.cmp(&b.segment_name));
        Ok(memberships)
    }

    async fn find_timed_memberships(&self) -> Result<Vec<Membership>> {
        let state = self.state.lock();
        let mut memberships: Vec<Membership> = state
            .memberships
            .iter()
            .filter(|(_, expiry)| expiry.is_some())
            .filter_map(|(key, expiry)| state.to_membership(key, *expiry))
            .collect();
        memberships.sort_by_key(|m| m.expires_at);
        Ok(memberships)
    }

    async fn delete_expired_memberships(&self, now: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .remove_where(|_, expiry| matches!(expiry, Some(at) if *at <= now)))
    }

    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_segment_lifecycle() {
        let store = InMemoryMembershipStore::new();
        store.create_segment("beta").await.unwrap();
        assert!(matches!(
            store.create_segment("beta").await,
            Err(SegmentError::Conflict { .. })
        ));

        let segment = store.find_segment("beta").await.unwrap().unwrap();
        assert_eq!(segment.name, "beta");

        assert!(store.delete_segment("beta").await.unwrap());
        assert!(!store.delete_segment("beta").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_segment_with_members_is_rejected() {
        let store = InMemoryMembershipStore::new();
        store.create_segment("beta").await.unwrap();
        store.insert_permanent_membership(1, "beta").await.unwrap();

        assert!(store.delete_segment("beta").await.is_err());
        assert_eq!(store.delete_segment_memberships("beta").await.unwrap(), 1);
        assert!(store.delete_segment("beta").await.unwrap());
    }

    #[tokio::test]
    async fn test_memberships_are_unique_per_user_and_segment() {
        let store = InMemoryMembershipStore::new();
        store.create_segment("beta").await.unwrap();
        store.create_segment("alpha").await.unwrap();

        store.insert_permanent_membership(1, "beta").await.unwrap();
        store.insert_permanent_membership(1, "beta").await.unwrap();
        store.insert_timed_membership(1, "alpha", Utc::now()).await.unwrap();

        assert_eq!(store.count_segment_members("beta").await.unwrap(), 1);
        let names: Vec<String> = store
            .find_user_memberships(1)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.segment_name)
            .collect();
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_removals_stay_scoped_under_concurrent_writes() {
        let store = std::sync::Arc::new(InMemoryMembershipStore::new());
        store.create_segment("alpha").await.unwrap();
        store.create_segment("beta").await.unwrap();
        for user_id in 1..=50 {
            store.insert_permanent_membership(user_id, "alpha").await.unwrap();
        }

        let writers: Vec<_> = (1..=50)
            .map(|user_id| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.insert_permanent_membership(user_id, "beta").await.unwrap();
                    store.delete_membership(user_id, "alpha").await.unwrap()
                })
            })
            .collect();
        let cascade = {
            let store = store.clone();
            tokio::spawn(async move { store.delete_segment_memberships("beta").await.unwrap() })
        };

        let mut removed_alpha = 0;
        for writer in writers {
            removed_alpha += writer.await.unwrap();
        }
        let removed_beta = cascade.await.unwrap();

        assert_eq!(removed_alpha, 50);
        assert_eq!(store.count_segment_members("alpha").await.unwrap(), 0);
        assert_eq!(
            store.count_segment_members("beta").await.unwrap() + removed_beta,
            50
        );
    }

    #[tokio::test]
    async fn test_expired_delete_leaves_permanent_rows() {
        let store = InMemoryMembershipStore::new();
        store.create_segment("beta").await.unwrap();
        store.insert_permanent_membership(1, "beta").await.unwrap();

        let removed = store
            .delete_expired_membership(1, "beta", Utc::now())
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.count_segment_members("beta").await.unwrap(), 1);
    }
}
