//! Per-session transaction bookkeeping.
//!
//! In auto-commit mode every operation gets a fresh transaction that commits
//! when its last activation ends. Turning auto-commit off opens one explicit
//! write transaction and holds a reference on it, so it is suspended between
//! operations instead of committing. `commit` and `rollback` drop that
//! reference from inside the transaction and immediately open the next one.
//!
//! The coordinator lock is never held while calling into a transaction.

use crate::database::DatabaseCore;
use crate::transaction::{Transaction, TransactionFactory, TransactionId};
use crate::txmanager::ManagedTransaction;
use chrono::Utc;
use parking_lot::Mutex;
use quadra_spi::{Error, Result, SecurityAdapter};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct CoordinatorState {
    auto_commit: bool,
    explicit: Option<Arc<Transaction>>,
    /// Cause of the explicit transaction's failure, cleared by `rollback`.
    failure: Option<String>,
    live: HashMap<TransactionId, Weak<Transaction>>,
    writers: HashSet<TransactionId>,
    closed: bool,
}

struct CoordinatorShared {
    session_id: SessionId,
    core: Arc<DatabaseCore>,
    security: Arc<[Arc<dyn SecurityAdapter>]>,
    state: Mutex<CoordinatorState>,
}

impl CoordinatorShared {
    /// Forgets a finished transaction and hands back the writer lock if it
    /// held it.
    fn retire(&self, transaction: &Transaction, failure: Option<&str>) {
        let id = transaction.id();
        let (was_writer, dropped) = {
            let mut state = self.state.lock();
            state.live.remove(&id);
            let was_writer = state.writers.remove(&id);
            let is_explicit = state.explicit.as_ref().is_some_and(|t| t.id() == id);
            let dropped = if is_explicit {
                if let Some(cause) = failure {
                    state.failure = Some(cause.to_string());
                }
                state.explicit.take()
            } else {
                None
            };
            (was_writer, dropped)
        };
        if was_writer {
            if let Err(err) = self.core.write_lock().release(self.session_id) {
                tracing::error!(session = %self.session_id, tx = %id, error = %err, "write lock imbalance");
            }
        }
        drop(dropped);
    }
}

impl TransactionFactory for CoordinatorShared {
    fn transaction_start(&self, transaction: &Transaction) -> Result<Box<dyn ManagedTransaction>> {
        tracing::trace!(session = %self.session_id, tx = %transaction.id(), "beginning managed transaction");
        self.core.transaction_manager().begin()
    }

    fn transaction_complete(&self, transaction: &Transaction) {
        tracing::debug!(session = %self.session_id, tx = %transaction.id(), "transaction complete");
        self.retire(transaction, None);
    }

    fn transaction_aborted(&self, transaction: &Transaction, cause: &str) {
        tracing::warn!(session = %self.session_id, tx = %transaction.id(), cause, "transaction aborted");
        self.retire(transaction, Some(cause));
    }
}

pub struct TransactionCoordinator {
    shared: Arc<CoordinatorShared>,
}

impl TransactionCoordinator {
    pub fn new(core: Arc<DatabaseCore>, security: Arc<[Arc<dyn SecurityAdapter>]>) -> Self {
        Self {
            shared: Arc::new(CoordinatorShared {
                session_id: SessionId::new(),
                core,
                security,
                state: Mutex::new(CoordinatorState {
                    auto_commit: true,
                    explicit: None,
                    failure: None,
                    live: HashMap::new(),
                    writers: HashSet::new(),
                    closed: false,
                }),
            }),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.session_id
    }

    pub fn security_adapters(&self) -> &Arc<[Arc<dyn SecurityAdapter>]> {
        &self.shared.security
    }

    pub fn is_auto_commit(&self) -> bool {
        self.shared.state.lock().auto_commit
    }

    /// Cause of the explicit transaction's failure, if the session must be
    /// rolled back before it can continue.
    pub fn failure(&self) -> Option<String> {
        self.shared.state.lock().failure.clone()
    }

    pub fn live_transactions(&self) -> usize {
        self.shared
            .state
            .lock()
            .live
            .values()
            .filter(|t| t.strong_count() > 0)
            .count()
    }

    /// The transaction the next operation runs in.
    pub fn transaction(&self, write: bool) -> Result<Arc<Transaction>> {
        {
            let state = self.shared.state.lock();
            if state.closed {
                return Err(Error::invalid_state("session is closed"));
            }
            if let Some(cause) = &state.failure {
                return Err(Error::transaction(format!(
                    "Session transaction failed: {cause}; roll back before continuing"
                )));
            }
            if !state.auto_commit {
                return state
                    .explicit
                    .clone()
                    .ok_or_else(|| Error::invalid_state("explicit transaction missing"));
            }
        }
        self.new_transaction(write)
    }

    fn new_transaction(&self, write: bool) -> Result<Arc<Transaction>> {
        let shared = &self.shared;
        if shared.core.is_closed() {
            return Err(Error::invalid_state("database is closed"));
        }
        if write {
            shared.core.write_lock().acquire(shared.session_id);
        }
        let factory: Arc<dyn TransactionFactory> = shared.clone();
        let transaction = match Transaction::new(factory, shared.core.clone(), shared.security.clone(), write) {
            Ok(transaction) => transaction,
            Err(err) => {
                if write {
                    if let Err(release) = shared.core.write_lock().release(shared.session_id) {
                        tracing::warn!(session = %shared.session_id, error = %release, "write lock release failed");
                    }
                }
                return Err(err);
            }
        };
        let mut state = shared.state.lock();
        state.live.insert(transaction.id(), Arc::downgrade(&transaction));
        if write {
            state.writers.insert(transaction.id());
        }
        Ok(transaction)
    }

    // ========================================================================
    // Explicit transactions
    // ========================================================================

    pub fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        let (current, explicit, failure) = {
            let state = self.shared.state.lock();
            if state.closed {
                return Err(Error::invalid_state("session is closed"));
            }
            (state.auto_commit, state.explicit.clone(), state.failure.clone())
        };
        match (current, auto_commit) {
            (true, false) => {
                let transaction = self.new_transaction(true)?;
                transaction.reference()?;
                tracing::debug!(session = %self.session_id(), tx = %transaction.id(), "auto-commit off");
                let mut state = self.shared.state.lock();
                state.auto_commit = false;
                state.explicit = Some(transaction);
                Ok(())
            }
            (false, true) => {
                if let Some(cause) = failure {
                    return Err(Error::transaction(format!(
                        "Session transaction failed: {cause}; roll back before committing"
                    )));
                }
                let transaction =
                    explicit.ok_or_else(|| Error::invalid_state("explicit transaction missing"))?;
                transaction.execute_transaction_operation(|t| t.dereference())?;
                tracing::debug!(session = %self.session_id(), tx = %transaction.id(), "auto-commit on");
                let mut state = self.shared.state.lock();
                state.auto_commit = true;
                let dropped = state.explicit.take();
                drop(state);
                drop(dropped);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Commits the explicit transaction and opens the next one.
    pub fn commit(&self) -> Result<()> {
        if self.is_auto_commit() {
            return Err(Error::invalid_state("commit requested in auto-commit mode"));
        }
        self.set_auto_commit(true)?;
        self.set_auto_commit(false)
    }

    /// Rolls back the explicit transaction, or clears a recorded failure,
    /// then opens the next one.
    pub fn rollback(&self) -> Result<()> {
        let (explicit, failed) = {
            let mut state = self.shared.state.lock();
            if state.auto_commit {
                return Err(Error::invalid_state("rollback requested in auto-commit mode"));
            }
            (state.explicit.clone(), state.failure.take().is_some())
        };
        if !failed {
            let transaction =
                explicit.ok_or_else(|| Error::invalid_state("explicit transaction missing"))?;
            transaction.execute_transaction_operation(|t| {
                t.dereference()?;
                t.explicit_rollback()
            })?;
        }
        tracing::debug!(session = %self.session_id(), recovered = failed, "rolled back explicit transaction");
        let transaction = self.new_transaction(true)?;
        transaction.reference()?;
        let mut state = self.shared.state.lock();
        let dropped = state.explicit.replace(transaction);
        drop(state);
        drop(dropped);
        Ok(())
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    /// Heuristically rolls back transactions released longer than
    /// `max_idle_ms` ago. Returns how many were rolled back.
    pub fn reap_idle(&self, max_idle_ms: u64) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let candidates: Vec<Arc<Transaction>> = self
            .shared
            .state
            .lock()
            .live
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        let max_idle = i64::try_from(max_idle_ms).unwrap_or(i64::MAX);
        let mut reaped = 0;
        for transaction in candidates {
            let last = transaction.last_active();
            if last > 0 && now.saturating_sub(last) > max_idle {
                tracing::info!(tx = %transaction.id(), idle_ms = now - last, "reaping idle transaction");
                transaction.heuristic_rollback("Transaction idle timeout")?;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Rolls back any explicit work and terminates every live transaction.
    pub fn close(&self) -> Result<()> {
        let (explicit, failed) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            (state.explicit.clone(), state.failure.is_some())
        };
        let mut outcome = Ok(());
        if let (Some(transaction), false) = (explicit, failed) {
            outcome = transaction.execute_transaction_operation(|t| {
                t.dereference()?;
                t.explicit_rollback()
            });
        }
        let remaining: Vec<Arc<Transaction>> = {
            let mut state = self.shared.state.lock();
            state.auto_commit = true;
            let dropped = state.explicit.take();
            let remaining = state.live.values().filter_map(Weak::upgrade).collect();
            drop(state);
            drop(dropped);
            remaining
        };
        for transaction in remaining {
            transaction.heuristic_rollback("Session closed")?;
        }
        tracing::debug!(session = %self.session_id(), "session closed");
        outcome
    }
}

impl Drop for TransactionCoordinator {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(session = %self.session_id(), error = %err, "error closing session");
        }
    }
}
