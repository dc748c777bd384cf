use chrono::Utc;
use tokio::sync::{OwnedMutexGuard, OwnedRwLockReadGuard, oneshot};
use tracing::debug;
use ulid::Ulid;

use crate::model::{Commit, DateRange, Event};
use crate::observability::TXN_ROLLBACKS_TOTAL;

use super::locks::RangeLease;
use super::{Engine, EngineError, PendingCommit, WalCommand};

/// Everything a transaction keeps locked until its record is applied.
///
/// Travels with the record to the log writer, which drops it only after the
/// events are in memory, so the next holder of a lease always sees them.
pub(super) struct Guards {
    leases: Vec<RangeLease>,
    gates: Vec<OwnedMutexGuard<()>>,
    _barrier: OwnedRwLockReadGuard<()>,
}

/// A unit of work over the engine's state.
///
/// Staged events are only buffered. `commit` hands them to the log writer as
/// one record; the writer applies them after the record is durable, so no
/// reader sees a transaction partially or before it is committed. Dropping
/// an uncommitted transaction discards its events.
pub(super) struct Txn<'a> {
    engine: &'a Engine,
    id: Ulid,
    events: Vec<Event>,
    /// Property each staged event is announced on.
    announce: Vec<Option<Ulid>>,
    guards: Option<Guards>,
}

impl<'a> Txn<'a> {
    pub(super) fn new(engine: &'a Engine, barrier: OwnedRwLockReadGuard<()>) -> Self {
        Self {
            engine,
            id: Ulid::new(),
            events: Vec::new(),
            announce: Vec::new(),
            guards: Some(Guards {
                leases: Vec::new(),
                gates: Vec::new(),
                _barrier: barrier,
            }),
        }
    }

    pub(super) fn hold_lease(&mut self, lease: RangeLease) {
        if let Some(guards) = &mut self.guards {
            guards.leases.push(lease);
        }
    }

    pub(super) fn hold_gate(&mut self, gate: OwnedMutexGuard<()>) {
        if let Some(guards) = &mut self.guards {
            guards.gates.push(gate);
        }
    }

    pub(super) fn holds_lease_for(&self, property_id: Ulid, range: &DateRange) -> bool {
        self.guards
            .as_ref()
            .is_some_and(|g| g.leases.iter().any(|l| l.covers(property_id, range)))
    }

    pub(super) fn stage(&mut self, event: Event) {
        self.announce.push(self.engine.ledger.event_property(&event));
        self.events.push(event);
    }

    pub(super) async fn commit(mut self) -> Result<Ulid, EngineError> {
        let id = self.id;
        if self.events.is_empty() {
            return Ok(id);
        }
        if self.engine.faults.take_commit_failure() {
            return Err(EngineError::Wal("injected commit failure".into()));
        }

        let events = std::mem::take(&mut self.events);
        let announce = std::mem::take(&mut self.announce);
        let Some(guards) = self.guards.take() else {
            return Err(EngineError::Wal("transaction already handed off".into()));
        };
        let (tx, rx) = oneshot::channel();
        let pending = PendingCommit {
            commit: Commit {
                txn_id: id,
                committed_at: Utc::now(),
                events,
            },
            announce,
            guards,
            response: tx,
        };
        if self.engine.wal_tx.send(WalCommand::Append(pending)).await.is_err() {
            return Err(EngineError::Wal("WAL writer shut down".into()));
        }

        // From here the writer owns the outcome: the record is applied if and
        // only if it was flushed, whether or not anyone is still waiting.
        match rx.await {
            Ok(result) => result.map(|()| id).map_err(|e| EngineError::Wal(e.to_string())),
            Err(_) => Err(EngineError::Wal("WAL writer dropped response".into())),
        }
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.events.is_empty() {
            metrics::counter!(TXN_ROLLBACKS_TOTAL).increment(1);
            debug!(txn_id = %self.id, staged = self.events.len(), "discarding uncommitted transaction");
        }
    }
}

impl Engine {
    /// Open a transaction. Waits behind a running compaction, up to `lock_wait`.
    pub(super) async fn begin(&self) -> Result<Txn<'_>, EngineError> {
        let barrier = tokio::time::timeout(
            self.options.lock_wait,
            self.barrier.clone().read_owned(),
        )
        .await
        .map_err(|_| EngineError::StorageBusy)?;
        Ok(Txn::new(self, barrier))
    }
}
