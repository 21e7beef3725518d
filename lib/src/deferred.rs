//! Runs a transaction on a dedicated worker thread.
//!
//! A thread that already owns a transaction on a coordinator cannot begin a
//! second one there. `DeferredTxn` hands the whole lifetime of the second
//! transaction to a worker: `before` runs on the worker during construction,
//! `body` and `after` run when [`DeferredTxn::run`] is called, and the caller
//! only ever sees the result.

use crate::api::Store;
use crate::errors::{Result, StoreError};
use crate::txn::{Transaction, TxnMode};
use log::{debug, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

/// How the body finished, as reported to `after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Succeeded,
    Failed,
    /// The runner was dropped without `run()` being called.
    Cancelled,
}

type Outcome<T> = thread::Result<Result<T>>;

pub struct DeferredTxn<T> {
    start: Option<SyncSender<bool>>,
    finish: Receiver<Outcome<T>>,
    worker: Option<JoinHandle<()>>,
    ran: bool,
}

impl<T: Send + 'static> DeferredTxn<T> {
    /// Spawns the worker and blocks until `before` has finished on it. An
    /// error from `before` is returned here; a panic in `before` becomes
    /// [`StoreError::Worker`].
    pub fn new<S, B, F, A>(before: B, body: F, after: A) -> Result<Self>
    where
        S: Send + 'static,
        B: FnOnce() -> Result<S> + Send + 'static,
        F: FnOnce(&mut S) -> Result<T> + Send + 'static,
        A: FnOnce(S, Completion) -> Result<()> + Send + 'static,
    {
        let (ready_tx, ready_rx) = sync_channel::<Result<()>>(0);
        let (start_tx, start_rx) = sync_channel::<bool>(0);
        let (finish_tx, finish_rx) = sync_channel::<Outcome<T>>(0);

        let worker = thread::Builder::new()
            .name("genstore-deferred".to_string())
            .spawn(move || {
                let mut state = match panic::catch_unwind(AssertUnwindSafe(before)) {
                    Ok(Ok(state)) => state,
                    Ok(Err(e)) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                    Err(payload) => {
                        let msg = panic_message(payload.as_ref());
                        let _ = ready_tx.send(Err(StoreError::Worker(format!(
                            "before hook panicked: {msg}"
                        ))));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    let _ = after(state, Completion::Cancelled);
                    return;
                }
                // A closed channel means the runner was dropped.
                if !start_rx.recv().unwrap_or(false) {
                    debug!("Deferred transaction cancelled before running");
                    if let Err(e) = after(state, Completion::Cancelled) {
                        warn!("Cleanup of cancelled deferred transaction failed: {e}");
                    }
                    return;
                }
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&mut state)));
                let completion = match &outcome {
                    Ok(Ok(_)) => Completion::Succeeded,
                    _ => Completion::Failed,
                };
                let finished = panic::catch_unwind(AssertUnwindSafe(|| after(state, completion)));
                let outcome = match (outcome, finished) {
                    (Err(payload), _) => Err(payload),
                    (Ok(Ok(value)), Ok(Ok(()))) => Ok(Ok(value)),
                    (Ok(Ok(_)), Ok(Err(e))) => Ok(Err(e)),
                    (Ok(Err(e)), Ok(after_result)) => {
                        if let Err(after_err) = after_result {
                            warn!("after hook failed following body error: {after_err}");
                        }
                        Ok(Err(e))
                    }
                    (Ok(_), Err(payload)) => Err(payload),
                };
                let _ = finish_tx.send(outcome);
            })?;

        let ready = ready_rx.recv().map_err(|_| {
            StoreError::Worker("worker exited before signalling readiness".to_string())
        });
        match ready {
            Ok(Ok(())) => Ok(Self {
                start: Some(start_tx),
                finish: finish_rx,
                worker: Some(worker),
                ran: false,
            }),
            Ok(Err(e)) | Err(e) => {
                let _ = worker.join();
                Err(e)
            }
        }
    }

    /// Runs `body` and `after` on the worker and waits for both. A panic in
    /// either is resumed on the calling thread with its original payload.
    pub fn run(&mut self) -> Result<T> {
        if self.ran {
            return Err(StoreError::ProtocolViolation(
                "deferred transaction has already been run".to_string(),
            ));
        }
        self.ran = true;
        let start = self.start.take().ok_or_else(|| {
            StoreError::ProtocolViolation("deferred transaction was cancelled".to_string())
        })?;
        start
            .send(true)
            .map_err(|_| StoreError::Worker("worker is gone".to_string()))?;
        let outcome = self
            .finish
            .recv()
            .map_err(|_| StoreError::Worker("worker exited without a result".to_string()))?;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    pub fn has_run(&self) -> bool {
        self.ran
    }
}

impl<T: Send + 'static> DeferredTxn<T> {
    /// Reads from `store` on the worker. The transaction is committed when
    /// `body` succeeds and aborted otherwise.
    pub fn read<F>(store: &Store, body: F) -> Result<Self>
    where
        F: FnOnce(&mut Transaction) -> Result<T> + Send + 'static,
    {
        Self::on_store(store, TxnMode::Read, body)
    }

    /// Writes to `store` on the worker. `run()` returns once the commit is
    /// durable and visible to new transactions.
    pub fn write<F>(store: &Store, body: F) -> Result<Self>
    where
        F: FnOnce(&mut Transaction) -> Result<T> + Send + 'static,
    {
        Self::on_store(store, TxnMode::Write, body)
    }

    fn on_store<F>(store: &Store, mode: TxnMode, body: F) -> Result<Self>
    where
        F: FnOnce(&mut Transaction) -> Result<T> + Send + 'static,
    {
        let store = store.clone();
        Self::new(
            move || store.begin(mode),
            body,
            |mut txn: Transaction, completion| {
                let result = match completion {
                    Completion::Succeeded => txn.commit(),
                    Completion::Failed | Completion::Cancelled => txn.abort(),
                };
                txn.end()?;
                result
            },
        )
    }
}

impl<T> Drop for DeferredTxn<T> {
    fn drop(&mut self) {
        if let Some(start) = self.start.take() {
            let _ = start.send(false);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<T> std::fmt::Debug for DeferredTxn<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredTxn").field("ran", &self.ran).finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
