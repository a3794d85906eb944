//! Periodic drain of pending allocations into the durable store.

use crate::allocator::CouponAllocator;
use chrono::Utc;
use flashsale_core::{
    CoordinationStore, CouponEvent, CouponEventRepository, NewUserCoupon, RepoError,
    UserCouponRepository,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

/// Drain cadence and batch sizing.
#[derive(Debug, Clone, Copy)]
pub struct DrainConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// Maximum allocations drained per event per tick.
    pub batch_size: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch_size: 100,
        }
    }
}

/// What one tick did, for tests and operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Active events whose queues were visited.
    pub events_visited: usize,
    /// Coupons persisted to the durable store.
    pub persisted: u64,
    /// Allocations pushed back after a failed batch.
    pub requeued: usize,
}

/// Periodic job converting allocator queue state into durable
/// [`flashsale_core::UserCoupon`] rows.
///
/// Batches are at-least-once: a failed insert is logged, its allocations
/// are returned to the queue head, and the durable uniqueness on
/// `(user_id, coupon_event_id)` absorbs any redelivered row.
pub struct QueueDrainScheduler<S> {
    allocator: CouponAllocator<S>,
    events: Arc<dyn CouponEventRepository>,
    coupons: Arc<dyn UserCouponRepository>,
    config: DrainConfig,
    // Single-flight: an externally triggered tick() never overlaps the
    // run() loop or another tick.
    in_flight: Mutex<()>,
}

impl<S: CoordinationStore> QueueDrainScheduler<S> {
    /// Create a scheduler.
    pub fn new(
        allocator: CouponAllocator<S>,
        events: Arc<dyn CouponEventRepository>,
        coupons: Arc<dyn UserCouponRepository>,
        config: DrainConfig,
    ) -> Self {
        Self {
            allocator,
            events,
            coupons,
            config,
            in_flight: Mutex::new(()),
        }
    }

    /// Tick forever at the configured interval. Errors are logged and the
    /// loop keeps going; the next tick retries naturally.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(report) if report.persisted > 0 || report.requeued > 0 => {
                    tracing::info!(
                        events = report.events_visited,
                        persisted = report.persisted,
                        requeued = report.requeued,
                        "drain tick finished"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "drain tick failed");
                }
            }
        }
    }

    /// Drain every active event's queue once.
    ///
    /// Skips silently when another tick is still running. Failures on a
    /// single event are contained: the batch is requeued and the tick
    /// moves on to the next event.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError`] only when the active-event listing itself
    /// fails; everything past that point is handled within the tick.
    pub async fn tick(&self) -> Result<DrainReport, RepoError> {
        let Ok(_flight) = self.in_flight.try_lock() else {
            tracing::debug!("previous drain still running, skipping tick");
            return Ok(DrainReport::default());
        };

        let now = Utc::now();
        let active = self.events.find_active(now).await?;

        let mut report = DrainReport::default();
        for event in active {
            report.events_visited += 1;
            if let Err(err) = self.drain_event(&event, &mut report).await {
                tracing::error!(
                    event_id = event.id.value(),
                    error = %err,
                    "failed to drain event queue"
                );
            }
        }
        Ok(report)
    }

    async fn drain_event(
        &self,
        event: &CouponEvent,
        report: &mut DrainReport,
    ) -> Result<(), RepoError> {
        let depth = self
            .allocator
            .queue_depth(event.id)
            .await
            .map_err(|e| RepoError::Storage(e.to_string()))?;
        if depth == 0 {
            return Ok(());
        }

        let pending = self
            .allocator
            .pop_pending(event.id, self.config.batch_size)
            .await
            .map_err(|e| RepoError::Storage(e.to_string()))?;
        if pending.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let rows: Vec<NewUserCoupon> = pending
            .iter()
            .map(|p| NewUserCoupon::from_event(p.user_id, event, now))
            .collect();

        match self.coupons.insert_batch(rows).await {
            Ok(inserted) => {
                report.persisted += inserted;
                if inserted > 0 {
                    let count = u32::try_from(inserted).unwrap_or(u32::MAX);
                    if let Err(err) = self.events.record_issued(event.id, count).await {
                        // The coupons are durable; only the event counter
                        // lags. Surfaced for the operator, not retried here.
                        tracing::error!(
                            event_id = event.id.value(),
                            inserted,
                            error = %err,
                            "failed to record issued quantity"
                        );
                    }
                }
                tracing::debug!(
                    event_id = event.id.value(),
                    batch = pending.len(),
                    inserted,
                    "drained allocation batch"
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    event_id = event.id.value(),
                    batch = pending.len(),
                    error = %err,
                    "batch insert failed, returning allocations to the queue"
                );
                report.requeued += pending.len();
                self.allocator
                    .requeue_front(event.id, &pending)
                    .await
                    .map_err(|e| RepoError::Storage(e.to_string()))?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration};
    use flashsale_core::{
        CouponEventId, DiscountSpec, RepoFuture, UserCoupon, UserCouponId, UserId,
    };
    use flashsale_memory::{
        InMemoryCoordinationStore, InMemoryCouponEventRepository, InMemoryUserCouponRepository,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Delegates to the in-memory repository, failing the first `failures`
    /// batch inserts the way a dropped database connection would.
    struct FlakyCouponRepository {
        inner: InMemoryUserCouponRepository,
        failures: AtomicUsize,
    }

    impl FlakyCouponRepository {
        fn failing(times: usize) -> Self {
            Self {
                inner: InMemoryUserCouponRepository::new(),
                failures: AtomicUsize::new(times),
            }
        }
    }

    impl UserCouponRepository for FlakyCouponRepository {
        fn insert_batch(&self, coupons: Vec<NewUserCoupon>) -> RepoFuture<'_, u64> {
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Box::pin(async {
                    Err(RepoError::Storage("database unavailable".to_owned()))
                });
            }
            self.inner.insert_batch(coupons)
        }

        fn exists(&self, user: UserId, event: CouponEventId) -> RepoFuture<'_, bool> {
            self.inner.exists(user, event)
        }

        fn find_by_user(&self, user: UserId) -> RepoFuture<'_, Vec<UserCoupon>> {
            self.inner.find_by_user(user)
        }

        fn find(&self, id: UserCouponId) -> RepoFuture<'_, Option<UserCoupon>> {
            self.inner.find(id)
        }

        fn mark_used(&self, id: UserCouponId, now: DateTime<Utc>) -> RepoFuture<'_, UserCoupon> {
            self.inner.mark_used(id, now)
        }
    }

    struct Fixture {
        allocator: CouponAllocator<InMemoryCoordinationStore>,
        events: Arc<InMemoryCouponEventRepository>,
        coupons: Arc<InMemoryUserCouponRepository>,
        scheduler: QueueDrainScheduler<InMemoryCoordinationStore>,
    }

    fn fixture(config: DrainConfig) -> Fixture {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let allocator = CouponAllocator::new(store);
        let events = Arc::new(InMemoryCouponEventRepository::new());
        let coupons = Arc::new(InMemoryUserCouponRepository::new());
        let scheduler = QueueDrainScheduler::new(
            allocator.clone(),
            Arc::clone(&events) as Arc<dyn CouponEventRepository>,
            Arc::clone(&coupons) as Arc<dyn UserCouponRepository>,
            config,
        );
        Fixture {
            allocator,
            events,
            coupons,
            scheduler,
        }
    }

    async fn seed_event(
        f: &Fixture,
        id: i64,
        total: u32,
    ) -> flashsale_core::CouponEvent {
        let now = Utc::now();
        let event = flashsale_core::CouponEvent::new(
            CouponEventId::new(id),
            "launch",
            DiscountSpec::Amount { amount: 1_000 },
            total,
            now - ChronoDuration::hours(1),
            now + ChronoDuration::hours(1),
        );
        f.events.save(event.clone()).await.unwrap();
        f.allocator
            .initialize_stock(event.id, total)
            .await
            .unwrap();
        event
    }

    #[tokio::test]
    async fn tick_drains_small_queue_in_one_batch() {
        let f = fixture(DrainConfig::default());
        let event = seed_event(&f, 1, 50).await;
        for id in 1..=30 {
            f.allocator.try_issue(event.id, UserId::new(id)).await.unwrap();
        }

        let report = f.scheduler.tick().await.unwrap();
        assert_eq!(report.persisted, 30);
        assert_eq!(report.requeued, 0);
        assert_eq!(f.allocator.queue_depth(event.id).await.unwrap(), 0);

        let stored = f.events.find(event.id).await.unwrap().unwrap();
        assert_eq!(stored.issued_quantity, 30);
        assert!(f
            .coupons
            .exists(UserId::new(17), event.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn tick_respects_batch_size_across_ticks() {
        let f = fixture(DrainConfig {
            interval: Duration::from_secs(10),
            batch_size: 10,
        });
        let event = seed_event(&f, 1, 50).await;
        for id in 1..=25 {
            f.allocator.try_issue(event.id, UserId::new(id)).await.unwrap();
        }

        assert_eq!(f.scheduler.tick().await.unwrap().persisted, 10);
        assert_eq!(f.scheduler.tick().await.unwrap().persisted, 10);
        assert_eq!(f.scheduler.tick().await.unwrap().persisted, 5);
        assert_eq!(f.allocator.queue_depth(event.id).await.unwrap(), 0);
        let stored = f.events.find(event.id).await.unwrap().unwrap();
        assert_eq!(stored.issued_quantity, 25);
    }

    #[tokio::test]
    async fn empty_queues_are_skipped() {
        let f = fixture(DrainConfig::default());
        seed_event(&f, 1, 10).await;
        let report = f.scheduler.tick().await.unwrap();
        assert_eq!(report.events_visited, 1);
        assert_eq!(report.persisted, 0);
    }

    #[tokio::test]
    async fn failed_batch_is_requeued_and_drained_next_tick() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let allocator = CouponAllocator::new(store);
        let events = Arc::new(InMemoryCouponEventRepository::new());
        let coupons = Arc::new(FlakyCouponRepository::failing(1));
        let scheduler = QueueDrainScheduler::new(
            allocator.clone(),
            Arc::clone(&events) as Arc<dyn CouponEventRepository>,
            Arc::clone(&coupons) as Arc<dyn UserCouponRepository>,
            DrainConfig::default(),
        );

        let now = Utc::now();
        let event = CouponEvent::new(
            CouponEventId::new(1),
            "launch",
            DiscountSpec::Amount { amount: 1_000 },
            50,
            now - ChronoDuration::hours(1),
            now + ChronoDuration::hours(1),
        );
        events.save(event.clone()).await.unwrap();
        allocator.initialize_stock(event.id, 50).await.unwrap();
        for id in 1..=5 {
            allocator.try_issue(event.id, UserId::new(id)).await.unwrap();
        }

        // The first tick hits the failing insert: nothing is persisted and
        // every allocation goes back to the queue head.
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.persisted, 0);
        assert_eq!(report.requeued, 5);
        assert_eq!(allocator.queue_depth(event.id).await.unwrap(), 5);
        assert_eq!(events.find(event.id).await.unwrap().unwrap().issued_quantity, 0);

        // The repository has recovered; the next tick drains the whole
        // requeued batch.
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.persisted, 5);
        assert_eq!(report.requeued, 0);
        assert_eq!(allocator.queue_depth(event.id).await.unwrap(), 0);
        assert_eq!(events.find(event.id).await.unwrap().unwrap().issued_quantity, 5);
        for id in 1..=5 {
            assert!(coupons.exists(UserId::new(id), event.id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn redelivered_batch_does_not_duplicate_rows() {
        let f = fixture(DrainConfig::default());
        let event = seed_event(&f, 1, 10).await;
        f.allocator.try_issue(event.id, UserId::new(1)).await.unwrap();

        // Drain once, then force the same allocation through again as a
        // redelivery; the unique constraint must absorb it.
        f.scheduler.tick().await.unwrap();
        let redelivered = vec![flashsale_core::PendingAllocation {
            user_id: UserId::new(1),
            coupon_event_id: event.id,
            enqueued_at: Utc::now(),
        }];
        f.allocator
            .requeue_front(event.id, &redelivered)
            .await
            .unwrap();

        let report = f.scheduler.tick().await.unwrap();
        assert_eq!(report.persisted, 0);
        let stored = f.events.find(event.id).await.unwrap().unwrap();
        assert_eq!(stored.issued_quantity, 1);
        assert_eq!(f.coupons.find_by_user(UserId::new(1)).await.unwrap().len(), 1);
    }
}
