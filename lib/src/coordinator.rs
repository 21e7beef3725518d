//! Transaction coordinator of one generation.
//!
//! All lifecycle transitions (begin, promote, commit, end) and the
//! writer/exclusive gates go through one mutex and one condition variable.
//! Table access inside a transaction works on the transaction's private
//! snapshot and never takes this lock.

use crate::errors::{Result, StoreError};
use crate::generation::GenerationId;
use crate::index::TupleTable;
use crate::journal::Change;
use crate::options::{PromoteMode, Wait};
use crate::txn::{TxnCore, TxnId, TxnMode, TxnState};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

struct ActiveTxn {
    mode: TxnMode,
    owner: ThreadId,
}

struct CoordinatorState {
    data_version: u64,
    committed: TupleTable,
    next_id: TxnId,
    active: HashMap<TxnId, ActiveTxn>,
    owners: HashMap<ThreadId, TxnId>,
    writer: Option<TxnId>,
    writers_blocked: bool,
    exclusive: bool,
    retired: bool,
}

impl CoordinatorState {
    fn writer_slot_free(&self) -> bool {
        self.writer.is_none() && !self.writers_blocked && !self.exclusive
    }
}

#[derive(Default)]
struct Counters {
    begin_read: AtomicU64,
    begin_write: AtomicU64,
    promotions: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    finished: AtomicU64,
}

/// Point-in-time view of a coordinator's counters and gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub data_version: u64,
    pub begin_read: u64,
    pub begin_write: u64,
    pub promotions: u64,
    pub commits: u64,
    pub aborts: u64,
    pub finished: u64,
    pub active_readers: usize,
    pub active_writers: usize,
    pub writers_blocked: bool,
    pub exclusive: bool,
    pub retired: bool,
}

pub struct TransactionCoordinator {
    generation: GenerationId,
    state: Mutex<CoordinatorState>,
    changed: Condvar,
    counters: Counters,
}

impl TransactionCoordinator {
    pub fn new(generation: GenerationId, committed: TupleTable, data_version: u64) -> Self {
        Self {
            generation,
            state: Mutex::new(CoordinatorState {
                data_version,
                committed,
                next_id: 1,
                active: HashMap::new(),
                owners: HashMap::new(),
                writer: None,
                writers_blocked: false,
                exclusive: false,
                retired: false,
            }),
            changed: Condvar::new(),
            counters: Counters::default(),
        }
    }

    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    /// Registers a transaction for the calling thread. WRITE waits for the
    /// writer slot; both modes wait while the coordinator is exclusive.
    pub fn begin(&self, mode: TxnMode) -> Result<TxnCore> {
        self.begin_with(mode, Wait::Block)?.ok_or_else(|| {
            StoreError::ProtocolViolation(format!(
                "blocking begin on generation {} returned without a transaction",
                self.generation
            ))
        })
    }

    /// As [`begin`](Self::begin) but returns `None` instead of waiting.
    pub fn try_begin(&self, mode: TxnMode) -> Result<Option<TxnCore>> {
        self.begin_with(mode, Wait::NoWait)
    }

    fn begin_with(&self, mode: TxnMode, wait: Wait) -> Result<Option<TxnCore>> {
        let me = thread::current().id();
        let mut st = self.state.lock();
        loop {
            if st.retired {
                return Err(StoreError::Retired(self.generation));
            }
            if let Some(id) = st.owners.get(&me) {
                return Err(StoreError::ProtocolViolation(format!(
                    "thread already owns active transaction {id} on generation {}",
                    self.generation
                )));
            }
            let ready = match mode {
                TxnMode::Read => !st.exclusive,
                TxnMode::Write => st.writer_slot_free(),
            };
            if ready {
                break;
            }
            if wait == Wait::NoWait {
                return Ok(None);
            }
            self.changed.wait(&mut st);
        }
        let id = st.next_id;
        st.next_id += 1;
        st.active.insert(id, ActiveTxn { mode, owner: me });
        st.owners.insert(me, id);
        match mode {
            TxnMode::Read => {
                self.counters.begin_read.fetch_add(1, Ordering::Relaxed);
            }
            TxnMode::Write => {
                st.writer = Some(id);
                self.counters.begin_write.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!(
            "begin {mode:?} txn {id} on generation {} at version {}",
            self.generation, st.data_version
        );
        Ok(Some(TxnCore::new(
            id,
            mode,
            st.data_version,
            st.committed.clone(),
        )))
    }

    /// Upgrades an active READ to WRITE. A WRITE is returned unchanged.
    pub fn promote(&self, core: &mut TxnCore, mode: PromoteMode) -> Result<()> {
        if core.state != TxnState::Active {
            return Err(StoreError::ProtocolViolation(format!(
                "promote of txn {} in state {:?}",
                core.id, core.state
            )));
        }
        if core.mode == TxnMode::Write {
            return Ok(());
        }
        let mut st = self.state.lock();
        self.check_registered(&st, core)?;
        match mode {
            PromoteMode::Isolated => {
                if st.retired {
                    return Err(StoreError::Retired(self.generation));
                }
                if core.data_version < st.data_version {
                    return Err(StoreError::Conflict(format!(
                        "txn {} read version {} but version {} has since committed",
                        core.id, core.data_version, st.data_version
                    )));
                }
                if !st.writer_slot_free() {
                    return Err(StoreError::Conflict(format!(
                        "txn {} cannot promote while another writer is active",
                        core.id
                    )));
                }
            }
            PromoteMode::ReadCommitted => {
                while !st.retired && !st.writer_slot_free() {
                    self.changed.wait(&mut st);
                }
                if st.retired {
                    return Err(StoreError::Retired(self.generation));
                }
                core.view = st.committed.clone();
                core.data_version = st.data_version;
            }
        }
        st.writer = Some(core.id);
        if let Some(active) = st.active.get_mut(&core.id) {
            active.mode = TxnMode::Write;
        }
        core.mode = TxnMode::Write;
        self.counters.promotions.fetch_add(1, Ordering::Relaxed);
        debug!("promoted txn {} on generation {}", core.id, self.generation);
        Ok(())
    }

    /// Commits the transaction. For a WRITE, `persist` is handed the new data
    /// version and the pending changes before the snapshot is published; if it
    /// fails the transaction is left ABORTED.
    pub fn commit<F>(&self, core: &mut TxnCore, persist: F) -> Result<()>
    where
        F: FnOnce(u64, &[Change]) -> Result<()>,
    {
        if core.state != TxnState::Active {
            return Err(StoreError::ProtocolViolation(format!(
                "commit of txn {} in state {:?}",
                core.id, core.state
            )));
        }
        if core.mode == TxnMode::Read {
            core.state = TxnState::Committed;
            self.counters.commits.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let mut st = self.state.lock();
        self.check_registered(&st, core)?;
        let version = st.data_version + 1;
        if !core.changes.is_empty() {
            if let Err(e) = persist(version, &core.changes) {
                warn!(
                    "commit of txn {} on generation {} failed: {e}",
                    core.id, self.generation
                );
                core.discard();
                core.state = TxnState::Aborted;
                self.counters.aborts.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        }
        st.data_version = version;
        st.committed = core.view.clone();
        core.changes.clear();
        core.data_version = version;
        core.state = TxnState::Committed;
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        debug!(
            "committed txn {} on generation {} as version {version}",
            core.id, self.generation
        );
        Ok(())
    }

    pub fn abort(&self, core: &mut TxnCore) -> Result<()> {
        match core.state {
            TxnState::Active => {}
            TxnState::Aborted => {
                return Err(StoreError::ProtocolViolation(format!(
                    "txn {} already aborted",
                    core.id
                )))
            }
            state => {
                return Err(StoreError::ProtocolViolation(format!(
                    "abort of txn {} in state {state:?}",
                    core.id
                )))
            }
        }
        core.discard();
        core.state = TxnState::Aborted;
        self.counters.aborts.fetch_add(1, Ordering::Relaxed);
        debug!("aborted txn {} on generation {}", core.id, self.generation);
        Ok(())
    }

    /// Releases the transaction's slot. Idempotent; an ACTIVE transaction is
    /// aborted first.
    pub fn end(&self, core: &mut TxnCore) -> Result<()> {
        if core.state == TxnState::Ended {
            return Ok(());
        }
        if core.state == TxnState::Active {
            if core.mode == TxnMode::Write {
                warn!(
                    "txn {} on generation {} ended without commit or abort; aborting",
                    core.id, self.generation
                );
            }
            core.discard();
            self.counters.aborts.fetch_add(1, Ordering::Relaxed);
        }
        let mut st = self.state.lock();
        if let Some(active) = st.active.remove(&core.id) {
            if st.owners.get(&active.owner) == Some(&core.id) {
                st.owners.remove(&active.owner);
            }
        }
        if st.writer == Some(core.id) {
            st.writer = None;
        }
        drop(st);
        core.state = TxnState::Ended;
        self.counters.finished.fetch_add(1, Ordering::Relaxed);
        self.changed.notify_all();
        Ok(())
    }

    /// Holds the writer slot without a transaction. Waits, bounded, for the
    /// current writer to end. Readers are unaffected.
    pub fn block_writers(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        if st.writers_blocked {
            return Err(StoreError::ProtocolViolation(format!(
                "writers already blocked on generation {}",
                self.generation
            )));
        }
        if st.retired {
            return Err(StoreError::Retired(self.generation));
        }
        // New writers queue up behind the flag while the current one drains.
        st.writers_blocked = true;
        while st.writer.is_some() {
            if self.changed.wait_until(&mut st, deadline).timed_out() && st.writer.is_some() {
                st.writers_blocked = false;
                drop(st);
                self.changed.notify_all();
                return Err(StoreError::Compaction(format!(
                    "writer still active on generation {} after {}ms",
                    self.generation,
                    timeout.as_millis()
                )));
            }
        }
        debug!("writers blocked on generation {}", self.generation);
        Ok(())
    }

    pub fn enable_writers(&self) -> Result<()> {
        let mut st = self.state.lock();
        if !st.writers_blocked {
            return Err(StoreError::ProtocolViolation(format!(
                "writers are not blocked on generation {}",
                self.generation
            )));
        }
        st.writers_blocked = false;
        drop(st);
        self.changed.notify_all();
        debug!("writers enabled on generation {}", self.generation);
        Ok(())
    }

    /// Stops all new transactions and waits, bounded, for the in-flight
    /// writer to end. Active readers keep running. On timeout the coordinator
    /// leaves exclusive mode again and the error is fatal.
    pub fn enter_exclusive_mode(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        if st.exclusive {
            return Err(StoreError::ProtocolViolation(format!(
                "generation {} is already in exclusive mode",
                self.generation
            )));
        }
        st.exclusive = true;
        while st.writer.is_some() {
            if self.changed.wait_until(&mut st, deadline).timed_out() && st.writer.is_some() {
                st.exclusive = false;
                drop(st);
                self.changed.notify_all();
                return Err(StoreError::ExclusiveTimeout {
                    generation: self.generation,
                    timeout_ms: timeout.as_millis(),
                });
            }
        }
        debug!("generation {} entered exclusive mode", self.generation);
        Ok(())
    }

    pub fn exit_exclusive_mode(&self) -> Result<()> {
        let mut st = self.state.lock();
        if !st.exclusive {
            return Err(StoreError::ProtocolViolation(format!(
                "generation {} is not in exclusive mode",
                self.generation
            )));
        }
        st.exclusive = false;
        drop(st);
        self.changed.notify_all();
        debug!("generation {} left exclusive mode", self.generation);
        Ok(())
    }

    /// Continues the data-version sequence of the coordinator being replaced.
    pub fn take_over_from(&self, previous: &TransactionCoordinator) {
        let version = previous.data_version();
        let mut st = self.state.lock();
        st.data_version = st.data_version.max(version);
    }

    /// Marks the generation as superseded. Waiting and future begins fail with
    /// [`StoreError::Retired`].
    pub fn retire(&self) {
        let mut st = self.state.lock();
        st.retired = true;
        drop(st);
        self.changed.notify_all();
        debug!("generation {} retired", self.generation);
    }

    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    pub fn is_exclusive(&self) -> bool {
        self.state.lock().exclusive
    }

    pub fn data_version(&self) -> u64 {
        self.state.lock().data_version
    }

    /// Latest committed snapshot and its version.
    pub fn committed_snapshot(&self) -> (u64, TupleTable) {
        let st = self.state.lock();
        (st.data_version, st.committed.clone())
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let st = self.state.lock();
        let active_writers = st
            .active
            .values()
            .filter(|a| a.mode == TxnMode::Write)
            .count();
        CoordinatorStats {
            data_version: st.data_version,
            begin_read: self.counters.begin_read.load(Ordering::Relaxed),
            begin_write: self.counters.begin_write.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            commits: self.counters.commits.load(Ordering::Relaxed),
            aborts: self.counters.aborts.load(Ordering::Relaxed),
            finished: self.counters.finished.load(Ordering::Relaxed),
            active_readers: st.active.len() - active_writers,
            active_writers,
            writers_blocked: st.writers_blocked,
            exclusive: st.exclusive,
            retired: st.retired,
        }
    }

    fn check_registered(&self, st: &MutexGuard<'_, CoordinatorState>, core: &TxnCore) -> Result<()> {
        if st.active.contains_key(&core.id) {
            Ok(())
        } else {
            Err(StoreError::ProtocolViolation(format!(
                "txn {} is not registered with generation {}",
                core.id, self.generation
            )))
        }
    }
}
