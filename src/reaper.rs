use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use crate::engine::Engine;

/// Background task that completes checked-out stays once their last night has passed.
pub async fn run_completion_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let today = Utc::now().date_naive();
        let completed = engine.complete_due_bookings(today).await;
        if !completed.is_empty() {
            info!(count = completed.len(), %today, "completed due bookings");
        }
    }
}

/// Background task that rewrites the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        let repair = engine.wal_needs_repair();
        if appends < threshold && !repair {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, repair, "compacted WAL"),
            Err(e) => error!(error = %e, "WAL compaction failed"),
        }
    }
}
