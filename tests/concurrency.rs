use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use ulid::Ulid;

use stayledger::catalog::InMemoryCatalog;
use stayledger::config::EngineOptions;
use stayledger::engine::{BookingRequest, Engine, EngineError};
use stayledger::gateway::SandboxGateway;
use stayledger::model::*;
use stayledger::notify::NotifyHub;

// ── Test infrastructure ──────────────────────────────────────

struct World {
    engine: Arc<Engine>,
    catalog: Arc<InMemoryCatalog>,
    policy_id: Ulid,
}

impl World {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("stayledger_int_test_{}", Ulid::new()));
        let catalog = Arc::new(InMemoryCatalog::new());
        let policy = CancellationPolicy::standard(Ulid::new(), PolicyName::Moderate);
        let policy_id = policy.id;
        catalog.insert_policy(policy);
        let engine = Engine::new(
            dir.join("stayledger.wal"),
            catalog.clone(),
            Arc::new(SandboxGateway::new()),
            Arc::new(NotifyHub::new()),
            EngineOptions {
                lock_wait: Duration::from_secs(5),
                ..EngineOptions::default()
            },
        )
        .unwrap();
        Self {
            engine: Arc::new(engine),
            catalog,
            policy_id,
        }
    }

    fn property(&self) -> Ulid {
        let property_id = Ulid::new();
        self.catalog.insert_listing(Listing {
            property_id,
            host_id: Ulid::new(),
            price_per_night: Decimal::new(120, 0),
            min_nights: 1,
            max_nights: 60,
            fees: Decimal::new(25, 0),
            cancellation_policy_id: self.policy_id,
        });
        property_id
    }
}

fn day(offset: u64) -> NaiveDate {
    Utc::now()
        .date_naive()
        .checked_add_days(Days::new(offset))
        .unwrap()
}

fn request(property_id: Ulid, start: u64, end: u64) -> BookingRequest {
    BookingRequest {
        property_id,
        guest_id: Ulid::new(),
        start: day(start),
        end: day(end),
        promotion_id: None,
    }
}

/// No two active bookings of a property share a night.
fn assert_no_overlap(engine: &Engine, property_id: Ulid) {
    let active: Vec<Booking> = engine
        .bookings_for_property(property_id)
        .into_iter()
        .filter(Booking::is_active)
        .collect();
    for (i, a) in active.iter().enumerate() {
        for b in &active[i + 1..] {
            assert!(
                !a.range.overlaps(&b.range),
                "{} and {} overlap: {} vs {}",
                a.id,
                b.id,
                a.range,
                b.range
            );
        }
    }
    let stays = engine.active_stays(property_id);
    assert_eq!(stays.len(), active.len());
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn overlapping_creates_admit_exactly_one() {
    let world = World::new();
    let pid = world.property();

    let tasks = (0..16).map(|_| {
        let engine = world.engine.clone();
        tokio::spawn(async move { engine.create_booking(request(pid, 20, 25)).await })
    });
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let created = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(EngineError::DatesUnavailable(_))))
        .count();
    assert_eq!(created, 1);
    assert_eq!(rejected, 15);
    assert_no_overlap(&world.engine, pid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn mixed_traffic_never_double_books() {
    let world = World::new();
    let pid = world.property();

    // Staggered ranges so neighbours collide.
    let tasks = (0..40u64).map(|i| {
        let engine = world.engine.clone();
        tokio::spawn(async move {
            let start = 10 + (i % 20) * 2;
            let created = engine.create_booking(request(pid, start, start + 3)).await;
            if let Ok(booking) = created {
                match i % 3 {
                    0 => {
                        let _ = engine.cancel_booking(booking.id).await;
                    }
                    1 => {
                        let _ = engine
                            .update_booking_dates(booking.id, day(start + 1), day(start + 4))
                            .await;
                    }
                    _ => {}
                }
            }
        })
    });
    for task in join_all(tasks).await {
        task.unwrap();
    }

    assert_no_overlap(&world.engine, pid);
    for booking in world.engine.bookings_for_property(pid) {
        if booking.is_active() {
            assert!(!world
                .engine
                .is_range_available(pid, booking.range.start, booking.range.end)
                .unwrap());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_reschedules_into_one_gap() {
    let world = World::new();
    let pid = world.property();
    let a = world.engine.create_booking(request(pid, 10, 12)).await.unwrap();
    let b = world.engine.create_booking(request(pid, 30, 32)).await.unwrap();

    let (ra, rb) = tokio::join!(
        world.engine.update_booking_dates(a.id, day(20), day(23)),
        world.engine.update_booking_dates(b.id, day(21), day(24)),
    );
    let winners = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(winners, 1);
    let (loser, loser_result) = if ra.is_ok() { (&b, rb) } else { (&a, ra) };
    assert!(matches!(loser_result, Err(EngineError::DatesUnavailable(_))));

    // The losing booking keeps its own nights.
    let kept = world.engine.get_booking(loser.id).unwrap();
    assert_eq!(kept.range, loser.range);
    assert!(!world
        .engine
        .is_range_available(pid, loser.range.start, loser.range.end)
        .unwrap());
    assert_no_overlap(&world.engine, pid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn swapping_dates_concurrently_moves_neither() {
    let world = World::new();
    let pid = world.property();
    let a = world.engine.create_booking(request(pid, 10, 12)).await.unwrap();
    let b = world.engine.create_booking(request(pid, 14, 16)).await.unwrap();

    // Each move lands on the other's current nights.
    let (ra, rb) = tokio::join!(
        world.engine.update_booking_dates(a.id, day(14), day(16)),
        world.engine.update_booking_dates(b.id, day(10), day(12)),
    );
    assert!(matches!(ra, Err(EngineError::DatesUnavailable(_))));
    assert!(matches!(rb, Err(EngineError::DatesUnavailable(_))));

    for original in [&a, &b] {
        let current = world.engine.get_booking(original.id).unwrap();
        assert_eq!(current.range, original.range);
        assert!(current.is_active());
        assert!(!world
            .engine
            .is_range_available(pid, original.range.start, original.range.end)
            .unwrap());
    }
    assert_no_overlap(&world.engine, pid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn promotion_cap_holds_across_tasks() {
    let world = World::new();
    let now = Utc::now();
    let promotion = world
        .engine
        .create_promotion(Promotion {
            id: Ulid::new(),
            discount_type: DiscountType::Fixed,
            amount: Decimal::new(15, 0),
            valid_from: now - chrono::Duration::hours(1),
            valid_until: now + chrono::Duration::days(90),
            max_uses: 5,
            used_count: 0,
        })
        .await
        .unwrap();
    let promotion_id = promotion.id;

    let tasks = (0..12).map(|_| {
        let engine = world.engine.clone();
        let pid = world.property();
        tokio::spawn(async move {
            let mut req = request(pid, 40, 43);
            req.promotion_id = Some(promotion_id);
            engine.create_booking(req).await
        })
    });
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);
    assert_eq!(
        results
            .iter()
            .filter(|r| **r == Err(EngineError::PromotionExhausted(promotion.id)))
            .count(),
        7
    );
    assert_eq!(world.engine.promotion(promotion.id).unwrap().used_count, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn properties_do_not_block_each_other() {
    let world = World::new();
    let properties: Vec<Ulid> = (0..8).map(|_| world.property()).collect();

    let started = Instant::now();
    let tasks = properties
        .iter()
        .flat_map(|&pid| (0..5u64).map(move |i| (pid, i)))
        .map(|(pid, i)| {
            let engine = world.engine.clone();
            tokio::spawn(async move {
                engine
                    .create_booking(request(pid, 10 + i * 4, 12 + i * 4))
                    .await
            })
        });
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(world.engine.booking_count(), 40);
    for pid in properties {
        assert_eq!(world.engine.active_stays(pid).len(), 5);
        assert_no_overlap(&world.engine, pid);
    }
}
