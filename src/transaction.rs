//! Multi-party transactions
//!
//! A transaction is opened with the set of nodes expected to answer and
//! completes once every one of them has. Waiters park on a oneshot channel
//! under a deadline instead of polling a completion flag.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio::sync::oneshot;

use crate::coherency::types::Address;
use crate::membership::types::NodeId;

pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionKind {
    Read,
    Write,
    Invalidate,
    Migrate,
    Writeback,
    KernelExec,
    KernelFetch,
}

#[derive(Debug)]
pub struct Transaction<R> {
    pub id: TransactionId,
    pub initiator: NodeId,
    pub kind: TransactionKind,
    pub address: Option<Address>,
    pub expected: HashSet<NodeId>,
    pub completed: HashSet<NodeId>,
    pub responses: HashMap<NodeId, R>,
    pub complete: bool,
    pub created_at: Instant,
}

impl<R> Transaction<R> {
    pub fn missing(&self) -> Vec<NodeId> {
        let mut missing: Vec<NodeId> = self
            .expected
            .difference(&self.completed)
            .cloned()
            .collect();
        missing.sort();
        missing
    }

    fn is_satisfied(&self) -> bool {
        self.completed.is_superset(&self.expected)
    }
}

/// The waiter gave up before every expected responder answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionTimeout {
    pub id: TransactionId,
    pub missing: Vec<NodeId>,
    pub waited: Duration,
}

struct PendingTransaction<R> {
    transaction: Transaction<R>,
    waiter: Option<oneshot::Sender<Transaction<R>>>,
}

/// Returned by [`TransactionManager::begin`]; hand it back to `wait`.
pub struct TransactionHandle<R> {
    pub id: TransactionId,
    receiver: oneshot::Receiver<Transaction<R>>,
}

pub struct TransactionManager<R> {
    next_id: AtomicU64,
    pending: Mutex<HashMap<TransactionId, PendingTransaction<R>>>,
}

impl<R: Send + 'static> Default for TransactionManager<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Send + 'static> TransactionManager<R> {
    pub fn new() -> Self {
        Self {
            // Random start keeps ids from different processes apart.
            next_id: AtomicU64::new((rand::random::<u32>() as u64) << 16),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a transaction. With an empty `expected` set the handle resolves
    /// immediately.
    pub fn begin(
        &self,
        initiator: NodeId,
        kind: TransactionKind,
        address: Option<Address>,
        expected: HashSet<NodeId>,
    ) -> TransactionHandle<R> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let transaction = Transaction {
            id,
            initiator,
            kind,
            address,
            expected,
            completed: HashSet::new(),
            responses: HashMap::new(),
            complete: false,
            created_at: Instant::now(),
        };

        if transaction.is_satisfied() {
            let mut transaction = transaction;
            transaction.complete = true;
            let _ = tx.send(transaction);
        } else {
            self.pending.lock().insert(
                id,
                PendingTransaction {
                    transaction,
                    waiter: Some(tx),
                },
            );
        }

        TransactionHandle { id, receiver: rx }
    }

    /// Records `from`'s response. Returns `false` for unknown (finished or
    /// timed out) transactions and for responders that were not expected.
    pub fn respond(&self, id: TransactionId, from: &NodeId, response: R) -> bool {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(&id) else {
            tracing::debug!("Response from {} for unknown transaction {}", from, id);
            return false;
        };

        if !entry.transaction.expected.contains(from) {
            tracing::warn!("Unexpected responder {} for transaction {}", from, id);
            return false;
        }

        entry.transaction.completed.insert(from.clone());
        entry.transaction.responses.insert(from.clone(), response);

        if entry.transaction.is_satisfied()
            && let Some(mut finished) = pending.remove(&id)
        {
            finished.transaction.complete = true;
            if let Some(waiter) = finished.waiter.take() {
                let _ = waiter.send(finished.transaction);
            }
        }

        true
    }

    /// Waits for completion or the deadline, whichever comes first. The
    /// transaction is gone from the table either way.
    pub async fn wait(
        &self,
        handle: TransactionHandle<R>,
        timeout: Duration,
    ) -> Result<Transaction<R>, TransactionTimeout> {
        let started = Instant::now();
        let id = handle.id;

        match tokio::time::timeout(timeout, handle.receiver).await {
            Ok(Ok(transaction)) => Ok(transaction),
            Ok(Err(_)) | Err(_) => {
                let missing = self
                    .cancel(id)
                    .map(|transaction| transaction.missing())
                    .unwrap_or_default();
                Err(TransactionTimeout {
                    id,
                    missing,
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Removes a transaction without completing it.
    pub fn cancel(&self, id: TransactionId) -> Option<Transaction<R>> {
        self.pending
            .lock()
            .remove(&id)
            .map(|entry| entry.transaction)
    }

    /// Number of transactions still waiting on responders.
    pub fn depth(&self) -> usize {
        self.pending.lock().len()
    }
}
