//! Allocation pipeline under concurrent contention, end to end against
//! the in-memory coordination store.

use flashsale_core::{
    CouponEvent, CouponEventId, CouponEventRepository, DiscountSpec, UserCouponRepository, UserId,
};
use flashsale_memory::{
    InMemoryCoordinationStore, InMemoryCouponEventRepository, InMemoryUserCouponRepository,
};
use flashsale_runtime::{CouponAllocator, DrainConfig, IssueOutcome, QueueDrainScheduler};
use std::sync::Arc;

struct Pipeline {
    allocator: CouponAllocator<InMemoryCoordinationStore>,
    events: Arc<InMemoryCouponEventRepository>,
    coupons: Arc<InMemoryUserCouponRepository>,
    scheduler: QueueDrainScheduler<InMemoryCoordinationStore>,
}

async fn pipeline(event_id: i64, total: u32, batch_size: usize) -> Pipeline {
    tracing_subscriber::fmt()
        .with_test_writer()
        .try_init()
        .ok();

    let store = Arc::new(InMemoryCoordinationStore::new());
    let allocator = CouponAllocator::new(store);
    let events = Arc::new(InMemoryCouponEventRepository::new());
    let coupons = Arc::new(InMemoryUserCouponRepository::new());

    let now = chrono::Utc::now();
    let event = CouponEvent::new(
        CouponEventId::new(event_id),
        "flash sale",
        DiscountSpec::Amount { amount: 1_000 },
        total,
        now - chrono::Duration::hours(1),
        now + chrono::Duration::hours(1),
    );
    #[allow(clippy::unwrap_used)]
    {
        events.save(event.clone()).await.unwrap();
        allocator.initialize_stock(event.id, total).await.unwrap();
    }

    let scheduler = QueueDrainScheduler::new(
        allocator.clone(),
        Arc::clone(&events) as Arc<dyn CouponEventRepository>,
        Arc::clone(&coupons) as Arc<dyn UserCouponRepository>,
        DrainConfig {
            interval: std::time::Duration::from_secs(10),
            batch_size,
        },
    );
    Pipeline {
        allocator,
        events,
        coupons,
        scheduler,
    }
}

async fn issue_concurrently(
    allocator: &CouponAllocator<InMemoryCoordinationStore>,
    event: CouponEventId,
    users: impl Iterator<Item = i64>,
) -> (usize, usize, usize) {
    let mut handles = Vec::new();
    for user in users {
        let allocator = allocator.clone();
        handles.push(tokio::spawn(async move {
            allocator.try_issue(event, UserId::new(user)).await
        }));
    }

    let (mut issued, mut already, mut sold_out) = (0, 0, 0);
    for outcome in futures::future::join_all(handles).await {
        #[allow(clippy::unwrap_used)]
        match outcome.unwrap().unwrap() {
            IssueOutcome::Issued => issued += 1,
            IssueOutcome::AlreadyIssued => already += 1,
            IssueOutcome::SoldOut => sold_out += 1,
        }
    }
    (issued, already, sold_out)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[allow(clippy::unwrap_used)]
async fn oversubscribed_event_issues_exactly_the_quantity() {
    let p = pipeline(1, 50, 100).await;
    let event = CouponEventId::new(1);

    let (issued, already, sold_out) = issue_concurrently(&p.allocator, event, 1..=100).await;
    assert_eq!(issued, 50);
    assert_eq!(already, 0);
    assert_eq!(sold_out, 50);
    assert_eq!(p.allocator.remaining_stock(event).await.unwrap(), 0);
    assert_eq!(p.allocator.queue_depth(event).await.unwrap(), 50);

    // After the drain the durable count reconciles with the grants.
    let report = p.scheduler.tick().await.unwrap();
    assert_eq!(report.persisted, 50);
    let stored = p.events.find(event).await.unwrap().unwrap();
    assert_eq!(stored.issued_quantity, 50);
    assert_eq!(p.allocator.queue_depth(event).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[allow(clippy::unwrap_used)]
async fn same_user_wins_exactly_once_under_concurrency() {
    let p = pipeline(2, 10, 100).await;
    let event = CouponEventId::new(2);

    let (issued, already, sold_out) =
        issue_concurrently(&p.allocator, event, std::iter::repeat(7).take(32)).await;
    assert_eq!(issued, 1);
    assert_eq!(already, 31);
    assert_eq!(sold_out, 0);
    assert_eq!(p.allocator.remaining_stock(event).await.unwrap(), 9);

    let report = p.scheduler.tick().await.unwrap();
    assert_eq!(report.persisted, 1);
    assert_eq!(
        p.coupons.find_by_user(UserId::new(7)).await.unwrap().len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[allow(clippy::unwrap_used)]
async fn drain_moves_thirty_pending_in_one_oversized_batch() {
    let p = pipeline(3, 40, 100).await;
    let event = CouponEventId::new(3);

    let (issued, _, _) = issue_concurrently(&p.allocator, event, 1..=30).await;
    assert_eq!(issued, 30);

    let report = p.scheduler.tick().await.unwrap();
    assert_eq!(report.persisted, 30);
    assert_eq!(p.allocator.queue_depth(event).await.unwrap(), 0);
    for user in 1..=30 {
        assert!(p.coupons.exists(UserId::new(user), event).await.unwrap());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[allow(clippy::unwrap_used)]
async fn mixed_duplicates_and_newcomers_settle_consistently() {
    let p = pipeline(4, 20, 100).await;
    let event = CouponEventId::new(4);

    // 40 tasks over 25 distinct users, with users 1..=15 trying twice.
    let users = (1..=25).chain(1..=15);
    let (issued, already, sold_out) = issue_concurrently(&p.allocator, event, users).await;
    assert_eq!(issued, 20);
    assert_eq!(already + sold_out, 20);
    assert_eq!(p.allocator.remaining_stock(event).await.unwrap(), 0);

    p.scheduler.tick().await.unwrap();
    let stored = p.events.find(event).await.unwrap().unwrap();
    assert_eq!(stored.issued_quantity, 20);
}
