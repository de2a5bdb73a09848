//! A single database transaction.
//!
//! ```text
//!   Constructed ──activate──► Active ◄──resume── Suspended
//!                               │ └──deactivate (referenced)──┘
//!                               ├─ deactivate (unreferenced) ─► commit ─► Finished
//!                               └─ any failure ─► implicit rollback ──► Failed
//! ```
//!
//! `inuse` counts nested activations by the executing thread; `using` counts
//! outstanding references (explicit transactions, open answers). The
//! transaction commits when its last activation ends with no references
//! left, and suspends when references remain.
//!
//! The `inner` lock is never held across calls into the context, the
//! managed transaction's participants, or the coordinator callbacks.

use crate::answer::AnswerOperation;
use crate::context::DatabaseOperationContext;
use crate::database::DatabaseCore;
use crate::metadata::DatabaseMetadata;
use crate::operations::Operation;
use crate::txmanager::ManagedTransaction;
use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex};
use quadra_spi::{EnlistableResource, Error, ResourceId, Result, SecurityAdapter};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Constructed,
    Active,
    Suspended,
    Finished,
    Failed,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Finished | TransactionState::Failed)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Constructed => "constructed",
            TransactionState::Active => "active",
            TransactionState::Suspended => "suspended",
            TransactionState::Finished => "finished",
            TransactionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Callbacks into whoever created the transaction.
pub(crate) trait TransactionFactory: Send + Sync {
    fn transaction_start(&self, transaction: &Transaction) -> Result<Box<dyn ManagedTransaction>>;

    fn transaction_complete(&self, transaction: &Transaction);

    fn transaction_aborted(&self, transaction: &Transaction, cause: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastActive {
    Never,
    InUse,
    ReleasedAt(i64),
}

struct TxInner {
    state: TransactionState,
    inuse: u32,
    using: u32,
    managed: Option<Box<dyn ManagedTransaction>>,
    enlisted: Vec<Arc<dyn EnlistableResource>>,
    enlisted_ids: HashSet<ResourceId>,
    rollback_cause: Option<String>,
    last_active: LastActive,
}

impl TxInner {
    fn take_enlisted(&mut self) -> Vec<Arc<dyn EnlistableResource>> {
        self.enlisted_ids.clear();
        std::mem::take(&mut self.enlisted)
    }
}

pub struct Transaction {
    id: TransactionId,
    write: bool,
    factory: Arc<dyn TransactionFactory>,
    context: DatabaseOperationContext,
    exec: ReentrantMutex<()>,
    inner: Mutex<TxInner>,
}

fn failed_error(cause: &Option<String>, message: &str) -> Error {
    match cause {
        Some(cause) => Error::transaction(format!("{message}: {cause}")),
        None => Error::transaction(message),
    }
}

impl Transaction {
    pub(crate) fn new(
        factory: Arc<dyn TransactionFactory>,
        core: Arc<DatabaseCore>,
        security: Arc<[Arc<dyn SecurityAdapter>]>,
        write: bool,
    ) -> Result<Arc<Self>> {
        let session = core.session_factory().new_session(write)?;
        let transaction = Arc::new_cyclic(|weak| Transaction {
            id: TransactionId::new(),
            write,
            factory,
            context: DatabaseOperationContext::new(core, weak.clone(), session, security, write),
            exec: ReentrantMutex::new(()),
            inner: Mutex::new(TxInner {
                state: TransactionState::Constructed,
                inuse: 0,
                using: 0,
                managed: None,
                enlisted: Vec::new(),
                enlisted_ids: HashSet::new(),
                rollback_cause: None,
                last_active: LastActive::Never,
            }),
        });
        tracing::debug!(tx = %transaction.id, write, "transaction created");
        Ok(transaction)
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub fn reference_count(&self) -> u32 {
        self.inner.lock().using
    }

    pub fn context(&self) -> &DatabaseOperationContext {
        &self.context
    }

    /// Milliseconds since the epoch of the last release, `-1` while in use,
    /// `0` if never used.
    pub fn last_active(&self) -> i64 {
        match self.inner.lock().last_active {
            LastActive::Never => 0,
            LastActive::InUse => -1,
            LastActive::ReleasedAt(millis) => millis,
        }
    }

    // ========================================================================
    // References
    // ========================================================================

    pub fn reference(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            TransactionState::Finished => {
                Err(Error::transaction("Attempt to reference terminated transaction"))
            }
            TransactionState::Failed => Err(failed_error(
                &inner.rollback_cause,
                "Attempt to reference failed transaction",
            )),
            _ => {
                inner.using += 1;
                tracing::trace!(tx = %self.id, using = inner.using, "referenced");
                Ok(())
            }
        }
    }

    pub fn dereference(&self) -> Result<()> {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.using == 0 {
                tracing::error!(tx = %self.id, state = %inner.state, "reference count underflow");
                Err((
                    inner.state,
                    Error::invalid_state("Attempt to dereference unreferenced transaction"),
                ))
            } else if inner.state == TransactionState::Suspended {
                Err((
                    inner.state,
                    Error::invalid_state("Attempt to dereference suspended transaction"),
                ))
            } else {
                inner.using -= 1;
                tracing::trace!(tx = %self.id, using = inner.using, "dereferenced");
                Ok(())
            }
        };
        match outcome {
            Ok(()) => Ok(()),
            Err((TransactionState::Active, err)) => Err(self.implicit_rollback(err)),
            Err((_, err)) => Err(err),
        }
    }

    // ========================================================================
    // Activation
    // ========================================================================

    fn activate(&self) -> Result<ActivationGuard<'_>> {
        let state = {
            let mut inner = self.inner.lock();
            let state = inner.state;
            match state {
                TransactionState::Active => {
                    inner.inuse += 1;
                    inner.last_active = LastActive::InUse;
                    return Ok(ActivationGuard::new(self));
                }
                TransactionState::Finished => {
                    return Err(Error::transaction("Attempt to activate terminated transaction"))
                }
                TransactionState::Failed => {
                    return Err(failed_error(
                        &inner.rollback_cause,
                        "Attempt to activate failed transaction",
                    ))
                }
                state => state,
            }
        };

        match state {
            TransactionState::Constructed => self.start()?,
            TransactionState::Suspended => self.resume()?,
            _ => return Err(Error::invalid_state(format!("cannot activate {state} transaction"))),
        }
        Ok(ActivationGuard::new(self))
    }

    fn start(&self) -> Result<()> {
        let managed = match self.factory.transaction_start(self) {
            Ok(managed) => managed,
            Err(err) => return Err(self.abort_transaction("Failed to start transaction", err)),
        };
        {
            let mut inner = self.inner.lock();
            if inner.state != TransactionState::Constructed {
                drop(inner);
                let mut managed = managed;
                if let Err(err) = managed.rollback() {
                    tracing::warn!(tx = %self.id, error = %err, "rollback of orphaned start failed");
                }
                return Err(Error::transaction("Transaction terminated while starting"));
            }
            inner.managed = Some(managed);
            inner.state = TransactionState::Active;
            inner.inuse = 1;
            inner.last_active = LastActive::InUse;
        }
        tracing::debug!(tx = %self.id, "transaction started");
        if let Err(err) = self.context.initiate() {
            return Err(self.implicit_rollback(err));
        }
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let failure = {
            let mut inner = self.inner.lock();
            if inner.state != TransactionState::Suspended {
                return Err(failed_error(
                    &inner.rollback_cause,
                    "Transaction terminated while resuming",
                ));
            }
            let resumed = match inner.managed.as_mut() {
                Some(managed) => managed.resume(),
                None => Err(Error::transaction("suspended transaction lost its association")),
            };
            match resumed {
                Ok(()) => {
                    inner.state = TransactionState::Active;
                    inner.inuse = 1;
                    inner.last_active = LastActive::InUse;
                    None
                }
                Err(err) => Some(err),
            }
        };
        match failure {
            None => {
                tracing::trace!(tx = %self.id, "transaction resumed");
                Ok(())
            }
            Some(err) => Err(self.abort_transaction("Failed to resume transaction", err)),
        }
    }

    fn deactivate(&self) -> Result<()> {
        enum Next {
            Commit,
            Fail(Error),
            Done,
        }
        let next = {
            let mut inner = self.inner.lock();
            inner.last_active = LastActive::ReleasedAt(Utc::now().timestamp_millis());
            let state = inner.state;
            match state {
                TransactionState::Active if inner.inuse == 1 && inner.using == 0 => Next::Commit,
                TransactionState::Active if inner.inuse == 1 => {
                    let suspended = match inner.managed.as_mut() {
                        Some(managed) => managed.suspend(),
                        None => Err(Error::transaction("active transaction lost its association")),
                    };
                    match suspended {
                        Ok(()) => {
                            inner.state = TransactionState::Suspended;
                            inner.inuse = 0;
                            Next::Done
                        }
                        Err(err) => Next::Fail(err),
                    }
                }
                TransactionState::Active => {
                    inner.inuse -= 1;
                    Next::Done
                }
                TransactionState::Finished => {
                    if inner.inuse == 0 {
                        tracing::error!(tx = %self.id, "deactivation without activation");
                    } else {
                        inner.inuse -= 1;
                    }
                    Next::Done
                }
                TransactionState::Failed => {
                    return Err(failed_error(&inner.rollback_cause, "Transaction failed"));
                }
                state @ (TransactionState::Constructed | TransactionState::Suspended) => {
                    return Err(Error::invalid_state(format!(
                        "Attempt to deactivate {state} transaction"
                    )));
                }
            }
        };
        match next {
            Next::Commit => self.commit(),
            Next::Fail(err) => Err(self.implicit_rollback(err)),
            Next::Done => Ok(()),
        }
    }

    fn commit(&self) -> Result<()> {
        tracing::debug!(tx = %self.id, "committing transaction");
        if let Err(err) = self.context.prepare_commit() {
            let cause = self.implicit_rollback(err);
            return Err(Error::transaction_caused_by("Transaction commit failed", cause));
        }
        let managed = {
            let mut inner = self.inner.lock();
            if inner.state != TransactionState::Active {
                return Err(failed_error(&inner.rollback_cause, "Transaction terminated before commit"));
            }
            inner.managed.take()
        };
        let Some(mut managed) = managed else {
            return Err(self.implicit_rollback(Error::transaction("no transaction to commit")));
        };
        if let Err(err) = managed.commit() {
            let cause = self.implicit_rollback(err);
            return Err(Error::transaction_caused_by("Transaction commit failed", cause));
        }
        {
            let mut inner = self.inner.lock();
            inner.state = TransactionState::Finished;
            inner.inuse = 0;
            inner.take_enlisted();
        }
        let cleared = self.context.clear();
        self.factory.transaction_complete(self);
        tracing::debug!(tx = %self.id, "transaction committed");
        cleared.map_err(|err| Error::transaction_caused_by("Error cleaning up after commit", err))
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Runs `operation` inside this transaction. Any failure rolls the
    /// transaction back.
    pub fn execute(&self, operation: &mut dyn Operation, metadata: &DatabaseMetadata) -> Result<()> {
        if operation.is_write_operation() && !self.write {
            return Err(Error::invalid_state("write operation submitted to a read-only transaction"));
        }
        let _exclusive = self.exec.lock();
        let guard = self.activate()?;
        let outcome = self
            .context
            .system_resolver()
            .and_then(|system| operation.execute(&self.context, system.as_ref(), metadata));
        self.finish(guard, outcome)
    }

    /// Runs one step of a lazily evaluated answer.
    pub fn execute_answer(&self, operation: &mut AnswerOperation<'_>) -> Result<()> {
        let _exclusive = self.exec.lock();
        let guard = self.activate()?;
        let outcome = operation.execute();
        self.finish(guard, outcome)
    }

    /// Coordinator hook: runs `body` with the transaction active.
    pub(crate) fn execute_transaction_operation(
        &self,
        body: impl FnOnce(&Transaction) -> Result<()>,
    ) -> Result<()> {
        let _exclusive = self.exec.lock();
        let guard = self.activate()?;
        let outcome = body(self);
        self.finish(guard, outcome)
    }

    fn finish(&self, guard: ActivationGuard<'_>, outcome: Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => guard.release(),
            Err(err) => {
                let err = self.implicit_rollback(err);
                guard.discard();
                Err(err)
            }
        }
    }

    // ========================================================================
    // Enlistment
    // ========================================================================

    /// Enlists `resource` once; later enlistments of the same id are no-ops.
    pub fn enlist(&self, resource: Arc<dyn EnlistableResource>) -> Result<()> {
        let failure = {
            let mut inner = self.inner.lock();
            let id = resource.resource_id();
            if inner.enlisted_ids.contains(&id) {
                return Ok(());
            }
            if inner.state != TransactionState::Active {
                Some(Error::transaction(format!(
                    "Attempt to enlist resource in {} transaction",
                    inner.state
                )))
            } else {
                let enlisted = match inner.managed.as_mut() {
                    Some(managed) => managed.enlist(resource.clone()),
                    None => Err(Error::transaction("no transaction to enlist in")),
                };
                match enlisted {
                    Ok(()) => {
                        inner.enlisted_ids.insert(id);
                        inner.enlisted.push(resource);
                        None
                    }
                    Err(err) => Some(err),
                }
            }
        };
        match failure {
            None => Ok(()),
            Some(err) => {
                tracing::warn!(tx = %self.id, error = %err, "enlistment failed");
                Err(self.implicit_rollback(err))
            }
        }
    }

    // ========================================================================
    // Rollback and abort
    // ========================================================================

    /// Rolls back after a failure and marks the transaction failed. Returns
    /// `cause` itself, so query-level failures keep their kind; only a
    /// rollback that fails too is reported as a transaction error.
    fn implicit_rollback(&self, cause: Error) -> Error {
        let (managed, enlisted) = {
            let mut inner = self.inner.lock();
            if let Some(first) = &inner.rollback_cause {
                tracing::error!(tx = %self.id, first = %first, error = %cause, "error during rollback");
                return Error::transaction_caused_by("Transaction already in rollback", cause);
            }
            let state = inner.state;
            match state {
                TransactionState::Active | TransactionState::Suspended => {
                    inner.rollback_cause = Some(cause.to_string());
                    inner.state = TransactionState::Failed;
                    (inner.managed.take(), inner.take_enlisted())
                }
                _ => {
                    drop(inner);
                    return self.abort_transaction("Attempt to roll back inactive transaction", cause);
                }
            }
        };
        tracing::warn!(tx = %self.id, error = %cause, "implicit rollback");
        let mut rollback_failed = false;
        if let Some(mut managed) = managed {
            if let Err(err) = managed.rollback() {
                tracing::error!(tx = %self.id, error = %err, "rollback failed, aborting resources");
                rollback_failed = true;
                for resource in &enlisted {
                    resource.abort();
                }
            }
        }
        if let Err(err) = self.context.clear() {
            tracing::warn!(tx = %self.id, error = %err, "error clearing context after rollback");
        }
        self.factory.transaction_aborted(self, &cause.to_string());
        if rollback_failed {
            Error::transaction_caused_by("Transaction rollback failed", cause)
        } else {
            cause
        }
    }

    pub fn abort_transaction(&self, message: &str, cause: Error) -> Error {
        let (managed, enlisted) = {
            let mut inner = self.inner.lock();
            if inner.state == TransactionState::Finished {
                drop(inner);
                tracing::warn!(tx = %self.id, error = %cause, "{message} on finished transaction");
                return Error::transaction_caused_by(format!("{message} - Transaction already finished"), cause);
            }
            if inner.rollback_cause.is_none() {
                inner.rollback_cause = Some(cause.to_string());
            }
            inner.state = TransactionState::Failed;
            (inner.managed.take(), inner.take_enlisted())
        };
        tracing::error!(tx = %self.id, error = %cause, "{message} - Aborting");
        if let Some(mut managed) = managed {
            if let Err(err) = managed.rollback() {
                tracing::warn!(tx = %self.id, error = %err, "rollback during abort failed");
            }
        }
        self.factory.transaction_aborted(self, message);
        for resource in &enlisted {
            resource.abort();
        }
        if let Err(err) = self.context.clear() {
            tracing::warn!(tx = %self.id, error = %err, "error clearing context during abort");
        }
        Error::transaction_caused_by(format!("{message} - Aborting"), cause)
    }

    /// Aborts with the cause's own message.
    pub fn abort(&self, cause: Error) -> Error {
        let message = cause.to_string();
        self.abort_transaction(&message, cause)
    }

    /// Forces the transaction into a terminal state, whatever it is doing.
    /// An execution in flight fails when it next touches the transaction.
    pub fn heuristic_rollback(&self, cause: &str) -> Result<()> {
        let state = self.state();
        tracing::warn!(tx = %self.id, state = %state, cause, "heuristic rollback");
        match state {
            TransactionState::Finished | TransactionState::Failed => {}
            TransactionState::Active | TransactionState::Suspended => {
                let err = self.implicit_rollback(Error::transaction(cause));
                tracing::warn!(tx = %self.id, error = %err, "heuristic rollback completed");
            }
            TransactionState::Constructed => {
                let err = self.abort_transaction(cause, Error::transaction(cause));
                tracing::warn!(tx = %self.id, error = %err, "heuristic abort completed");
            }
        }
        Ok(())
    }

    /// Coordinator-requested rollback of an active explicit transaction.
    pub(crate) fn explicit_rollback(&self) -> Result<()> {
        let (managed, state) = {
            let mut inner = self.inner.lock();
            if inner.state != TransactionState::Active {
                return Err(Error::transaction(format!(
                    "Attempt to roll back {} transaction",
                    inner.state
                )));
            }
            inner.state = TransactionState::Finished;
            inner.take_enlisted();
            (inner.managed.take(), inner.state)
        };
        tracing::debug!(tx = %self.id, state = %state, "explicit rollback");
        let rolled_back = match managed {
            Some(mut managed) => managed.rollback(),
            None => Ok(()),
        };
        let cleared = self.context.clear();
        self.factory.transaction_complete(self);
        rolled_back?;
        cleared
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("write", &self.write)
            .field("state", &inner.state)
            .field("inuse", &inner.inuse)
            .field("using", &inner.using)
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        match self.inner.get_mut().state {
            TransactionState::Finished | TransactionState::Failed => {}
            TransactionState::Constructed => {
                // Never started, so there is nothing to roll back.
                self.inner.get_mut().state = TransactionState::Failed;
                self.factory.transaction_aborted(self, "transaction never activated");
            }
            _ => {
                let err = self.abort_transaction(
                    "Transaction dropped while still valid",
                    Error::transaction("transaction dropped"),
                );
                tracing::warn!(tx = %self.id, error = %err, "aborted on drop");
            }
        }
    }
}

// ============================================================================
// Activation guard
// ============================================================================

/// Ends one activation. Dropped without `release`, it deactivates anyway,
/// rolling back first if the thread is panicking.
struct ActivationGuard<'a> {
    transaction: &'a Transaction,
    armed: bool,
}

impl<'a> ActivationGuard<'a> {
    fn new(transaction: &'a Transaction) -> Self {
        Self {
            transaction,
            armed: true,
        }
    }

    fn release(mut self) -> Result<()> {
        self.armed = false;
        self.transaction.deactivate()
    }

    fn discard(mut self) {
        self.armed = false;
        if let Err(err) = self.transaction.deactivate() {
            tracing::trace!(tx = %self.transaction.id, error = %err, "deactivation after failure");
        }
    }
}

impl Drop for ActivationGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if std::thread::panicking() {
            let err = self
                .transaction
                .implicit_rollback(Error::transaction("operation panicked"));
            tracing::warn!(tx = %self.transaction.id, error = %err, "rolled back after panic");
        }
        if let Err(err) = self.transaction.deactivate() {
            tracing::warn!(tx = %self.transaction.id, error = %err, "deactivation on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::context::OperationContext;
    use crate::database::Database;
    use crate::operations::PreallocateOperation;
    use crate::txmanager::TransactionManager;
    use proptest::prelude::*;
    use quadra_spi::{GlobalNode, SystemResolver};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    struct RecordingFactory {
        manager: Arc<dyn TransactionManager>,
        completed: AtomicUsize,
        aborted: Mutex<Vec<String>>,
    }

    impl TransactionFactory for RecordingFactory {
        fn transaction_start(&self, _transaction: &Transaction) -> Result<Box<dyn ManagedTransaction>> {
            self.manager.begin()
        }

        fn transaction_complete(&self, _transaction: &Transaction) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        fn transaction_aborted(&self, _transaction: &Transaction, cause: &str) {
            self.aborted.lock().push(cause.to_string());
        }
    }

    struct Fixture {
        database: Database,
        factory: Arc<RecordingFactory>,
    }

    impl Fixture {
        fn new() -> Self {
            let database = Database::open(DatabaseConfig::default()).unwrap();
            let factory = Arc::new(RecordingFactory {
                manager: database.core().transaction_manager().clone(),
                completed: AtomicUsize::new(0),
                aborted: Mutex::new(Vec::new()),
            });
            Self { database, factory }
        }

        fn transaction(&self, write: bool) -> Arc<Transaction> {
            let core = self.database.core().clone();
            let security = core.new_security_adapters().unwrap();
            Transaction::new(self.factory.clone(), core, security, write).unwrap()
        }

        fn metadata(&self) -> &DatabaseMetadata {
            self.database.metadata()
        }
    }

    struct Failing;

    impl Operation for Failing {
        fn execute(
            &mut self,
            _context: &dyn OperationContext,
            _system_resolver: &dyn SystemResolver,
            _metadata: &DatabaseMetadata,
        ) -> Result<()> {
            Err(Error::Resolver("disk on fire".into()))
        }

        fn is_write_operation(&self) -> bool {
            false
        }
    }

    /// Parks inside `execute` until released.
    struct Parked {
        started: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    impl Operation for Parked {
        fn execute(
            &mut self,
            _context: &dyn OperationContext,
            _system_resolver: &dyn SystemResolver,
            _metadata: &DatabaseMetadata,
        ) -> Result<()> {
            self.started
                .send(())
                .map_err(|_| Error::Resolver("observer gone".into()))?;
            self.release
                .recv()
                .map_err(|_| Error::Resolver("release dropped".into()))
        }

        fn is_write_operation(&self) -> bool {
            false
        }
    }

    /// Runs a parked operation on another thread, calls `interrupt` while it
    /// is inside `execute`, then lets it finish and returns its outcome.
    fn interrupt_in_flight(f: &Fixture, tx: &Transaction, interrupt: impl FnOnce()) -> Result<()> {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        std::thread::scope(|scope| {
            let running = scope.spawn(move || {
                let mut op = Parked {
                    started: started_tx,
                    release: release_rx,
                };
                tx.execute(&mut op, f.metadata())
            });
            started_rx.recv().unwrap();
            assert_eq!(tx.state(), TransactionState::Active);
            interrupt();
            release_tx.send(()).unwrap();
            running.join().unwrap()
        })
    }

    struct Counting {
        id: ResourceId,
        prepared: AtomicUsize,
        committed: AtomicUsize,
    }

    impl EnlistableResource for Counting {
        fn resource_id(&self) -> ResourceId {
            self.id
        }
        fn prepare(&self) -> Result<()> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn commit(&self) -> Result<()> {
            self.committed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn rollback(&self) -> Result<()> {
            Ok(())
        }
        fn abort(&self) {}
    }

    #[test]
    fn test_unreferenced_execution_commits() {
        let f = Fixture::new();
        let tx = f.transaction(true);
        assert_eq!(tx.state(), TransactionState::Constructed);
        assert_eq!(tx.last_active(), 0);

        let mut op = PreallocateOperation::new(GlobalNode::uri("urn:n"));
        tx.execute(&mut op, f.metadata()).unwrap();
        assert!(op.node_id().unwrap().is_persistent());
        assert_eq!(tx.state(), TransactionState::Finished);
        assert_eq!(f.factory.completed.load(Ordering::SeqCst), 1);
        assert!(tx.last_active() > 0);
    }

    #[test]
    fn test_referenced_transaction_suspends_between_operations() {
        let f = Fixture::new();
        let tx = f.transaction(true);
        tx.reference().unwrap();

        let mut op = PreallocateOperation::new(GlobalNode::uri("urn:n"));
        tx.execute(&mut op, f.metadata()).unwrap();
        assert_eq!(tx.state(), TransactionState::Suspended);
        assert!(tx.dereference().unwrap_err().is_invalid_state());

        tx.execute_transaction_operation(|t| t.dereference()).unwrap();
        assert_eq!(tx.state(), TransactionState::Finished);
        assert_eq!(f.factory.completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_operation_rolls_back_and_poisons() {
        let f = Fixture::new();
        let tx = f.transaction(false);
        let err = tx.execute(&mut Failing, f.metadata()).unwrap_err();
        assert!(matches!(err, Error::Resolver(_)));
        assert_eq!(tx.state(), TransactionState::Failed);
        assert_eq!(f.factory.aborted.lock().len(), 1);

        let again = tx.execute(&mut Failing, f.metadata()).unwrap_err();
        assert!(again.to_string().contains("failed transaction"));
        assert!(tx.reference().is_err());
    }

    #[test]
    fn test_write_operation_rejected_in_read_transaction() {
        let f = Fixture::new();
        let tx = f.transaction(false);
        let mut op = PreallocateOperation::new(GlobalNode::uri("urn:n"));
        assert!(tx.execute(&mut op, f.metadata()).unwrap_err().is_invalid_state());
        assert_eq!(tx.state(), TransactionState::Constructed);
    }

    #[test]
    fn test_double_enlistment_prepares_once() {
        let f = Fixture::new();
        let tx = f.transaction(true);
        let resource = Arc::new(Counting {
            id: ResourceId::new(),
            prepared: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
        });
        tx.execute_transaction_operation(|t| {
            t.enlist(resource.clone())?;
            t.enlist(resource.clone())
        })
        .unwrap();
        assert_eq!(tx.state(), TransactionState::Finished);
        assert_eq!(resource.prepared.load(Ordering::SeqCst), 1);
        assert_eq!(resource.committed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_enlist_outside_activation_fails() {
        let f = Fixture::new();
        let tx = f.transaction(true);
        let resource = Arc::new(Counting {
            id: ResourceId::new(),
            prepared: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
        });
        assert!(tx.enlist(resource).is_err());
        assert!(tx.state().is_terminal());
    }

    #[test]
    fn test_heuristic_rollback_terminates_suspended_transaction() {
        let f = Fixture::new();
        let tx = f.transaction(true);
        tx.reference().unwrap();
        tx.execute_transaction_operation(|_| Ok(())).unwrap();
        assert_eq!(tx.state(), TransactionState::Suspended);

        tx.heuristic_rollback("idle").unwrap();
        assert_eq!(tx.state(), TransactionState::Failed);
        tx.heuristic_rollback("again").unwrap();
        assert_eq!(f.factory.aborted.lock().len(), 1);
    }

    #[test]
    fn test_heuristic_rollback_fails_execution_in_flight() {
        let f = Fixture::new();
        let tx = f.transaction(false);
        let outcome = interrupt_in_flight(&f, &tx, || tx.heuristic_rollback("operator abort").unwrap());

        let err = outcome.unwrap_err();
        assert!(err.to_string().contains("operator abort"));
        assert_eq!(tx.state(), TransactionState::Failed);
        assert_eq!(f.factory.completed.load(Ordering::SeqCst), 0);
        assert_eq!(f.factory.aborted.lock().len(), 1);
    }

    #[test]
    fn test_abort_fails_execution_in_flight() {
        let f = Fixture::new();
        let tx = f.transaction(false);
        let outcome = interrupt_in_flight(&f, &tx, || {
            let err = tx.abort_transaction("shutting down", Error::transaction("database closing"));
            assert!(err.is_transactional());
        });

        assert!(outcome.is_err());
        assert_eq!(tx.state(), TransactionState::Failed);
        assert_eq!(f.factory.completed.load(Ordering::SeqCst), 0);
        assert!(tx.reference().is_err());
    }

    #[test]
    fn test_abort_on_finished_transaction_keeps_state() {
        let f = Fixture::new();
        let tx = f.transaction(true);
        tx.execute_transaction_operation(|_| Ok(())).unwrap();
        let err = tx.abort(Error::transaction("late"));
        assert!(err.to_string().contains("already finished"));
        assert_eq!(tx.state(), TransactionState::Finished);
    }

    #[test]
    fn test_explicit_rollback_requires_active() {
        let f = Fixture::new();
        let tx = f.transaction(true);
        assert!(tx.explicit_rollback().is_err());
        tx.reference().unwrap();
        tx.execute_transaction_operation(|t| {
            t.dereference()?;
            t.explicit_rollback()
        })
        .unwrap();
        assert_eq!(tx.state(), TransactionState::Finished);
        assert_eq!(f.factory.completed.load(Ordering::SeqCst), 1);
    }

    // ========================================================================
    // Strategies
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            failure_persistence: None,
            ..ProptestConfig::default()
        })]

        #[test]
        fn test_balanced_references_commit(n in 1usize..12) {
            let f = Fixture::new();
            let tx = f.transaction(true);
            tx.execute_transaction_operation(|t| {
                for _ in 0..n {
                    t.reference()?;
                }
                for _ in 0..n {
                    t.dereference()?;
                }
                Ok(())
            })
            .unwrap();
            prop_assert_eq!(tx.state(), TransactionState::Finished);
            prop_assert_eq!(tx.reference_count(), 0);
        }

        #[test]
        fn test_extra_dereference_is_fatal(n in 0usize..12) {
            let f = Fixture::new();
            let tx = f.transaction(true);
            let outcome = tx.execute_transaction_operation(|t| {
                for _ in 0..n {
                    t.reference()?;
                }
                for _ in 0..=n {
                    t.dereference()?;
                }
                Ok(())
            });
            prop_assert!(outcome.is_err());
            prop_assert_eq!(tx.state(), TransactionState::Failed);
            prop_assert_eq!(f.factory.aborted.lock().len(), 1);
        }
    }
}
