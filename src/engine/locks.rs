use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use ulid::Ulid;

use crate::model::DateRange;
use crate::observability::{LOCK_TIMEOUTS_TOTAL, LOCK_WAIT_SECONDS};

use super::EngineError;

#[derive(Default)]
struct LeaseTable {
    held: Mutex<Vec<(u64, DateRange)>>,
    released: Notify,
}

/// Per-property range locks. Overlapping ranges of one property exclude each
/// other; disjoint ranges and other properties never wait.
#[derive(Default)]
pub(super) struct RangeLocks {
    tables: DashMap<Ulid, Arc<LeaseTable>>,
    next_token: AtomicU64,
}

/// Exclusive hold on a property's date range. Released on drop.
pub(super) struct RangeLease {
    table: Arc<LeaseTable>,
    token: u64,
    pub property_id: Ulid,
    pub range: DateRange,
}

impl RangeLocks {
    pub(super) async fn acquire(
        &self,
        property_id: Ulid,
        range: DateRange,
        wait: Duration,
    ) -> Result<RangeLease, EngineError> {
        let table = self.tables.entry(property_id).or_default().clone();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Register interest before checking, so a release between the
            // check and the await still wakes us.
            let notified = table.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut held = table.held.lock();
                if !held.iter().any(|(_, r)| r.overlaps(&range)) {
                    held.push((token, range));
                    metrics::histogram!(LOCK_WAIT_SECONDS).record(started.elapsed().as_secs_f64());
                    return Ok(RangeLease {
                        table: Arc::clone(&table),
                        token,
                        property_id,
                        range,
                    });
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                metrics::counter!(LOCK_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!(%property_id, %range, "range lease wait timed out");
                return Err(EngineError::StorageBusy);
            }
        }
    }

    #[cfg(test)]
    pub(super) fn held_count(&self, property_id: Ulid) -> usize {
        self.tables
            .get(&property_id)
            .map_or(0, |t| t.held.lock().len())
    }
}

impl RangeLease {
    pub(super) fn covers(&self, property_id: Ulid, range: &DateRange) -> bool {
        self.property_id == property_id
            && self.range.start <= range.start
            && range.end <= self.range.end
    }
}

impl Drop for RangeLease {
    fn drop(&mut self) {
        self.table.held.lock().retain(|(t, _)| *t != self.token);
        self.table.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn nights(from: u32, to: u32) -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2026, 9, from).unwrap(),
            NaiveDate::from_ymd_opt(2026, 9, to).unwrap(),
        )
    }

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn disjoint_ranges_do_not_wait() {
        let locks = RangeLocks::default();
        let pid = Ulid::new();
        let _a = locks.acquire(pid, nights(1, 5), WAIT).await.unwrap();
        let _b = locks.acquire(pid, nights(5, 9), WAIT).await.unwrap();
        let _c = locks.acquire(Ulid::new(), nights(1, 5), WAIT).await.unwrap();
        assert_eq!(locks.held_count(pid), 2);
    }

    #[tokio::test]
    async fn overlapping_range_times_out() {
        let locks = RangeLocks::default();
        let pid = Ulid::new();
        let _a = locks.acquire(pid, nights(1, 5), WAIT).await.unwrap();
        let err = locks.acquire(pid, nights(4, 6), WAIT).await.err();
        assert_eq!(err, Some(EngineError::StorageBusy));
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let locks = Arc::new(RangeLocks::default());
        let pid = Ulid::new();
        let first = locks.acquire(pid, nights(1, 5), WAIT).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire(pid, nights(2, 3), Duration::from_secs(5))
                    .await
                    .map(|lease| lease.range)
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);

        assert_eq!(waiter.await.unwrap().unwrap(), nights(2, 3));
        assert_eq!(locks.held_count(pid), 0);
    }

    #[tokio::test]
    async fn lease_covers_subranges_only() {
        let locks = RangeLocks::default();
        let pid = Ulid::new();
        let lease = locks.acquire(pid, nights(1, 10), WAIT).await.unwrap();
        assert!(lease.covers(pid, &nights(3, 6)));
        assert!(!lease.covers(pid, &nights(8, 12)));
        assert!(!lease.covers(Ulid::new(), &nights(3, 6)));
    }
}
