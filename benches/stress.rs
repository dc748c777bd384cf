use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use rust_decimal::Decimal;
use ulid::Ulid;

use stayledger::catalog::InMemoryCatalog;
use stayledger::config::EngineOptions;
use stayledger::engine::{BookingRequest, Engine};
use stayledger::gateway::SandboxGateway;
use stayledger::model::*;
use stayledger::notify::NotifyHub;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn day(offset: u64) -> NaiveDate {
    Utc::now()
        .date_naive()
        .checked_add_days(Days::new(offset))
        .expect("date in range")
}

struct Bench {
    engine: Arc<Engine>,
    catalog: Arc<InMemoryCatalog>,
    policy_id: Ulid,
}

impl Bench {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("stayledger_bench_{}", Ulid::new()));
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
        .expect("open engine");
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
            price_per_night: Decimal::new(95, 0),
            min_nights: 1,
            max_nights: 30,
            fees: Decimal::new(20, 0),
            cancellation_policy_id: self.policy_id,
        });
        property_id
    }
}

fn request(property_id: Ulid, start: u64, nights: u64) -> BookingRequest {
    BookingRequest {
        property_id,
        guest_id: Ulid::new(),
        start: day(start),
        end: day(start + nights),
        promotion_id: None,
    }
}

async fn phase1_sequential(bench: &Bench) {
    let pid = bench.property();
    let n = 2000u64;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        bench
            .engine
            .create_booking(request(pid, i * 2, 2))
            .await
            .expect("create booking");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
}

async fn phase2_concurrent(bench: &Bench) {
    let n_tasks = 10;
    let n_per_task = 200u64;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let engine = bench.engine.clone();
        let pid = bench.property();
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                engine
                    .create_booking(request(pid, j * 3, 3))
                    .await
                    .expect("create booking");
            }
        }));
    }
    for h in handles {
        h.await.expect("task panicked");
    }

    let elapsed = start.elapsed();
    let total = n_tasks as u64 * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} properties x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_contended(bench: &Bench) {
    let pid = bench.property();
    let n_tasks = 50;

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n_tasks {
        let engine = bench.engine.clone();
        // Every task fights over the same handful of weeks.
        let week = (i % 5) * 7;
        handles.push(tokio::spawn(async move {
            engine.create_booking(request(pid, week, 7)).await.is_ok()
        }));
    }
    let mut created = 0;
    for h in handles {
        if h.await.expect("task panicked") {
            created += 1;
        }
    }
    println!(
        "  {n_tasks} contenders for 5 weeks: {created} created in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

async fn phase4_read_under_load(bench: &Bench) {
    let pid = bench.property();
    for i in 0..200 {
        bench
            .engine
            .create_booking(request(pid, i * 2, 1))
            .await
            .expect("prefill");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for _ in 0..5 {
        let engine = bench.engine.clone();
        let stop = stop.clone();
        let wpid = bench.property();
        writers.push(tokio::spawn(async move {
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let _ = engine.create_booking(request(wpid, i * 2, 2)).await;
                i += 1;
            }
        }));
    }

    let mut readers = Vec::new();
    for _ in 0..10 {
        let engine = bench.engine.clone();
        readers.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(500);
            for k in 0..500u64 {
                let t = Instant::now();
                let from = day(k % 300);
                let _ = engine.is_range_available(pid, from, day(k % 300 + 3));
                let _ = engine.calendar(pid, from, day(k % 300 + 30));
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.expect("reader panicked"));
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("availability + calendar read", &mut all);
}

async fn phase5_compaction(bench: &Bench) {
    let appends = bench.engine.wal_appends_since_compact().await;
    let t = Instant::now();
    bench.engine.compact_wal().await.expect("compaction");
    println!(
        "  compacted {appends} appends ({} bookings) in {:.2}ms",
        bench.engine.booking_count(),
        t.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    println!("=== stayledger stress benchmark ===\n");
    let bench = Bench::new();

    println!("[phase 1] sequential create throughput");
    phase1_sequential(&bench).await;

    println!("\n[phase 2] concurrent creates, disjoint properties");
    phase2_concurrent(&bench).await;

    println!("\n[phase 3] contended creates, one property");
    phase3_contended(&bench).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(&bench).await;

    println!("\n[phase 5] WAL compaction");
    phase5_compaction(&bench).await;

    println!("\n=== done ===");
}
