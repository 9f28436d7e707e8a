//! Periodic sweep of expired memberships.
//!
//! Backstop for timers that were lost (process restart) or whose delete
//! failed. Disabled unless an interval is configured.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::service::SegmentService;

pub struct ExpirySweeper {
    service: Arc<SegmentService>,
    sweep_interval: Duration,
    running: Arc<RwLock<bool>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExpirySweeper {
    pub fn new(service: Arc<SegmentService>, sweep_interval: Duration) -> Self {
        Self {
            service,
            sweep_interval,
            running: Arc::new(RwLock::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            warn!("Expiry sweeper already running");
            return;
        }
        *running = true;
        drop(running);

        info!(
            sweep_interval_secs = self.sweep_interval.as_secs(),
            "Starting expiry sweeper"
        );

        let service = self.service.clone();
        let sweep_interval = self.sweep_interval;
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !*running.read().await {
                    break;
                }
                if let Err(e) = service.sweep_expired().await {
                    metrics::counter!("segments.sweep.errors_total").increment(1);
                    error!(error = %e, "Error sweeping expired memberships");
                }
            }
        });

        if let Some(previous) = self.handle.lock().replace(handle) {
            previous.abort();
        }
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        drop(running);

        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        info!("Expiry sweeper stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryMembershipStore;
    use crate::service::ServiceConfig;
    use crate::store::MembershipStore;
    use chrono::Utc;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_overdue_rows() {
        let store = Arc::new(InMemoryMembershipStore::new());
        store.create_segment("beta").await.unwrap();
        store
            .insert_timed_membership(7, "beta", Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        store.insert_permanent_membership(8, "beta").await.unwrap();

        let service = Arc::new(SegmentService::new(store.clone(), ServiceConfig::default()));
        let sweeper = ExpirySweeper::new(service, Duration::from_secs(30));
        sweeper.start().await;
        assert!(sweeper.is_running().await);

        tokio::time::sleep(Duration::from_secs(31)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(store.count_segment_members("beta").await.unwrap(), 1);

        sweeper.stop().await;
        assert!(!sweeper.is_running().await);
    }
}
