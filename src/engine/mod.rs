mod availability;
mod error;
mod locks;
mod mutations;
mod promotion;
mod queries;
mod store;
mod txn;

pub use error::EngineError;
pub use mutations::{BookingRequest, CancellationReceipt};

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::catalog::Catalog;
use crate::config::EngineOptions;
use crate::gateway::PaymentGateway;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{
    BOOKING_OP_DURATION_SECONDS, BOOKING_OPS_TOTAL, TXN_RETRIES_TOTAL, WAL_FLUSH_BATCH_SIZE,
    WAL_FLUSH_DURATION_SECONDS, outcome_label,
};
use crate::wal::Wal;

use locks::RangeLocks;
use store::Ledger;
use txn::Guards;

pub type SharedPropertyState = Arc<RwLock<PropertyState>>;

// ── Group-commit WAL channel ─────────────────────────────

/// A transaction's record on its way to the log.
pub(super) struct PendingCommit {
    commit: Commit,
    announce: Vec<Option<Ulid>>,
    guards: Guards,
    response: oneshot::Sender<io::Result<()>>,
}

pub(super) enum WalCommand {
    Append(PendingCommit),
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the log and applies what it makes durable.
struct WalWriter {
    wal: Wal,
    ledger: Arc<Ledger>,
    notify: Arc<NotifyHub>,
    faults: Arc<Faults>,
    /// Set by a failed flush: the file may hold frames memory never saw.
    /// Appends are refused until a compaction rewrites it.
    needs_repair: Arc<AtomicBool>,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Apply each flushed record to memory, announce it, release its guards,
///    and respond.
async fn wal_writer_loop(mut writer: WalWriter, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append(pending) => {
                let mut batch = vec![pending];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append(pending)) => batch.push(pending),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                writer.flush_and_apply(batch);
                if let Some(other) = deferred {
                    writer.handle_non_append(other);
                }
            }
            other => writer.handle_non_append(other),
        }
    }
}

impl WalWriter {
    fn flush_and_apply(&mut self, batch: Vec<PendingCommit>) {
        metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = Instant::now();
        let result = if self.needs_repair.load(Ordering::SeqCst) {
            Err(io::Error::other("log awaiting repair after a failed flush"))
        } else {
            self.flush_batch(&batch)
        };
        metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result
            && !self.needs_repair.swap(true, Ordering::SeqCst)
        {
            tracing::error!(commits = batch.len(), error = %e, "WAL flush failed, refusing appends until compaction");
        }

        for pending in batch {
            let PendingCommit {
                commit,
                announce,
                guards,
                response,
            } = pending;
            let outcome = match &result {
                Ok(()) => {
                    for (event, property_id) in commit.events.iter().zip(&announce) {
                        self.ledger.apply(event);
                        if let Some(property_id) = property_id {
                            self.notify.send(*property_id, event);
                        }
                    }
                    Ok(())
                }
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = response.send(outcome);
            drop(guards);
        }
    }

    fn flush_batch(&mut self, batch: &[PendingCommit]) -> io::Result<()> {
        if self.faults.take_flush_failure() {
            return Err(io::Error::other("injected flush failure"));
        }
        let mut append_err: Option<io::Error> = None;
        for pending in batch {
            if let Err(e) = self.wal.append_buffered(&pending.commit) {
                append_err = Some(e);
                break;
            }
        }
        // Flush even after an append error so partial bytes don't leak into the next batch.
        let flush_err = self.wal.flush_sync().err();
        match (append_err, flush_err) {
            (Some(e), _) | (None, Some(e)) => Err(e),
            (None, None) => Ok(()),
        }
    }

    fn handle_non_append(&mut self, cmd: WalCommand) {
        match cmd {
            WalCommand::Compact { commits, response } => {
                let result = Wal::write_compact_file(self.wal.path(), &commits)
                    .and_then(|()| self.wal.swap_compact_file());
                if result.is_ok() && self.needs_repair.swap(false, Ordering::SeqCst) {
                    info!("log rewritten from committed state, accepting appends again");
                }
                let _ = response.send(result);
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(self.wal.appends_since_compact());
            }
            WalCommand::Append(_) => unreachable!("appends are batched by the writer loop"),
        }
    }
}

/// Test hooks: make the next N commits (or flushes) fail as if the log write had.
#[derive(Default)]
pub(super) struct Faults {
    failing_commits: AtomicU32,
    failing_flushes: AtomicU32,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Faults {
    fn take_commit_failure(&self) -> bool {
        take_one(&self.failing_commits)
    }

    fn take_flush_failure(&self) -> bool {
        take_one(&self.failing_flushes)
    }
}

pub struct Engine {
    ledger: Arc<Ledger>,
    /// Held from promotion validation until the redemption is applied.
    promotion_gates: DashMap<Ulid, Arc<tokio::sync::Mutex<()>>>,
    locks: RangeLocks,
    /// Shared by open transactions, exclusive for compaction.
    barrier: Arc<tokio::sync::RwLock<()>>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    catalog: Arc<dyn Catalog>,
    gateway: Arc<dyn PaymentGateway>,
    options: EngineOptions,
    faults: Arc<Faults>,
    needs_repair: Arc<AtomicBool>,
}

impl Engine {
    /// Open the log at `wal_path`, replay it, and start the writer task.
    pub fn new(
        wal_path: PathBuf,
        catalog: Arc<dyn Catalog>,
        gateway: Arc<dyn PaymentGateway>,
        notify: Arc<NotifyHub>,
        options: EngineOptions,
    ) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let ledger = Arc::new(Ledger::default());
        let mut events = 0usize;
        for commit in &commits {
            for event in &commit.events {
                ledger.apply(event);
                events += 1;
            }
        }
        if !commits.is_empty() {
            info!(
                commits = commits.len(),
                events,
                bookings = ledger.bookings.len(),
                "replayed write-ahead log"
            );
        }

        let faults = Arc::new(Faults::default());
        let needs_repair = Arc::new(AtomicBool::new(false));
        let writer = WalWriter {
            wal: Wal::open(&wal_path)?,
            ledger: ledger.clone(),
            notify: notify.clone(),
            faults: faults.clone(),
            needs_repair: needs_repair.clone(),
        };
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(writer, wal_rx));

        Ok(Self {
            ledger,
            promotion_gates: DashMap::new(),
            locks: RangeLocks::default(),
            barrier: Arc::new(tokio::sync::RwLock::new(())),
            wal_tx,
            notify,
            catalog,
            gateway,
            options,
            faults,
            needs_repair,
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    #[cfg(test)]
    pub(crate) fn fail_next_commits(&self, n: u32) {
        self.faults.failing_commits.store(n, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn fail_next_flushes(&self, n: u32) {
        self.faults.failing_flushes.store(n, Ordering::SeqCst);
    }

    /// True after a failed flush, until `compact_wal` rewrites the log.
    pub fn wal_needs_repair(&self) -> bool {
        self.needs_repair.load(Ordering::SeqCst)
    }

    /// Run `attempt` until it succeeds, fails permanently, or the retry budget
    /// is spent. Delay doubles from `retry_backoff` each time.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut retries = 0u32;
        loop {
            match attempt().await {
                Err(e) if e.is_retryable() && retries < self.options.max_retries => {
                    let delay = self.options.retry_backoff * 2u32.saturating_pow(retries);
                    retries += 1;
                    metrics::counter!(TXN_RETRIES_TOTAL, "op" => op).increment(1);
                    warn!(op, retry = retries, error = %e, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                result => return result.map_err(EngineError::exhausted),
            }
        }
    }

    /// Rewrite the log as the minimal set of records for the committed state.
    /// New transactions wait until the rewrite is done. Also clears the
    /// append stop left by a failed flush.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.barrier.write().await;
        let commits = self.ledger.snapshot_commits();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                commits,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Record latency and outcome of one public operation.
async fn observed<T>(
    op: &'static str,
    fut: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    let started = Instant::now();
    let result = fut.await;
    metrics::histogram!(BOOKING_OP_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
    metrics::counter!(BOOKING_OPS_TOTAL, "op" => op, "outcome" => outcome_label(&result)).increment(1);
    result
}

/// Reject empty or inverted ranges.
fn valid_range(start: chrono::NaiveDate, end: chrono::NaiveDate) -> Result<DateRange, EngineError> {
    DateRange::try_new(start, end)
        .ok_or_else(|| EngineError::InvalidRange(format!("start {start} must be before end {end}")))
}
