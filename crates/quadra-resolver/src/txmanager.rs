//! Transaction manager contract and the local two-phase coordinator.
//!
//! The core only needs `new_transaction_manager` / `close` from the factory
//! and begin / enlist / suspend / resume / commit / rollback from the
//! transactions it hands out. Association with the caller is explicit: a
//! suspended transaction refuses enlistment until it is resumed.

use quadra_spi::{EnlistableResource, Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub trait TransactionManagerFactory: Send + Sync {
    fn new_transaction_manager(&self) -> Result<Arc<dyn TransactionManager>>;

    fn close(&self) -> Result<()>;
}

pub trait TransactionManager: Send + Sync {
    fn begin(&self) -> Result<Box<dyn ManagedTransaction>>;
}

pub trait ManagedTransaction: Send {
    fn enlist(&mut self, resource: Arc<dyn EnlistableResource>) -> Result<()>;

    fn suspend(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    /// Prepares every participant, then commits them. Any prepare failure
    /// rolls everything back and is returned.
    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;
}

// ============================================================================
// Local implementation
// ============================================================================

#[derive(Default)]
pub struct LocalTransactionManagerFactory {
    closed: Arc<AtomicBool>,
}

impl LocalTransactionManagerFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionManagerFactory for LocalTransactionManagerFactory {
    fn new_transaction_manager(&self) -> Result<Arc<dyn TransactionManager>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::transaction("transaction manager factory is closed"));
        }
        Ok(Arc::new(LocalTransactionManager {
            closed: self.closed.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct LocalTransactionManager {
    closed: Arc<AtomicBool>,
}

impl TransactionManager for LocalTransactionManager {
    fn begin(&self) -> Result<Box<dyn ManagedTransaction>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::transaction("transaction manager is closed"));
        }
        Ok(Box::new(LocalTransaction {
            resources: Vec::new(),
            status: Status::Associated,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Associated,
    Suspended,
    Completed,
}

struct LocalTransaction {
    resources: Vec<Arc<dyn EnlistableResource>>,
    status: Status,
}

impl LocalTransaction {
    fn check_not_completed(&self, action: &str) -> Result<()> {
        if self.status == Status::Completed {
            Err(Error::transaction(format!("cannot {action} a completed transaction")))
        } else {
            Ok(())
        }
    }

    fn rollback_all(&mut self) -> Option<Error> {
        let mut first_error = None;
        for resource in &self.resources {
            if let Err(err) = resource.rollback() {
                tracing::warn!(resource = %resource.resource_id(), error = %err, "rollback failed");
                first_error.get_or_insert(err);
            }
        }
        self.resources.clear();
        self.status = Status::Completed;
        first_error
    }
}

impl ManagedTransaction for LocalTransaction {
    fn enlist(&mut self, resource: Arc<dyn EnlistableResource>) -> Result<()> {
        self.check_not_completed("enlist in")?;
        if self.status == Status::Suspended {
            return Err(Error::transaction("cannot enlist in a suspended transaction"));
        }
        let id = resource.resource_id();
        if self.resources.iter().any(|r| r.resource_id() == id) {
            return Err(Error::transaction(format!("resource {id} enlisted twice")));
        }
        self.resources.push(resource);
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        self.check_not_completed("suspend")?;
        self.status = Status::Suspended;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.check_not_completed("resume")?;
        if self.status != Status::Suspended {
            return Err(Error::transaction("resume of a transaction that is not suspended"));
        }
        self.status = Status::Associated;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.check_not_completed("commit")?;
        for resource in &self.resources {
            if let Err(err) = resource.prepare() {
                self.rollback_all();
                return Err(Error::transaction_caused_by("prepare failed", err));
            }
        }
        let mut first_error = None;
        for resource in &self.resources {
            if let Err(err) = resource.commit() {
                tracing::error!(resource = %resource.resource_id(), error = %err, "commit failed after prepare");
                first_error.get_or_insert(err);
            }
        }
        self.resources.clear();
        self.status = Status::Completed;
        match first_error {
            Some(err) => Err(Error::transaction_caused_by("heuristic mixed outcome", err)),
            None => Ok(()),
        }
    }

    fn rollback(&mut self) -> Result<()> {
        self.check_not_completed("roll back")?;
        match self.rollback_all() {
            Some(err) => Err(Error::transaction_caused_by("rollback failed", err)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use quadra_spi::ResourceId;

    struct Recorder {
        id: ResourceId,
        fail_prepare: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl EnlistableResource for Recorder {
        fn resource_id(&self) -> ResourceId {
            self.id
        }
        fn prepare(&self) -> Result<()> {
            self.log.lock().push("prepare");
            if self.fail_prepare {
                Err(Error::Resolver("no".into()))
            } else {
                Ok(())
            }
        }
        fn commit(&self) -> Result<()> {
            self.log.lock().push("commit");
            Ok(())
        }
        fn rollback(&self) -> Result<()> {
            self.log.lock().push("rollback");
            Ok(())
        }
        fn abort(&self) {}
    }

    fn recorder(fail_prepare: bool, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            id: ResourceId::new(),
            fail_prepare,
            log: log.clone(),
        })
    }

    fn begin() -> Box<dyn ManagedTransaction> {
        LocalTransactionManagerFactory::new()
            .new_transaction_manager()
            .unwrap()
            .begin()
            .unwrap()
    }

    #[test]
    fn test_commit_prepares_all_before_committing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tx = begin();
        tx.enlist(recorder(false, &log)).unwrap();
        tx.enlist(recorder(false, &log)).unwrap();
        tx.commit().unwrap();
        assert_eq!(*log.lock(), vec!["prepare", "prepare", "commit", "commit"]);
    }

    #[test]
    fn test_prepare_failure_rolls_back_everyone() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tx = begin();
        tx.enlist(recorder(false, &log)).unwrap();
        tx.enlist(recorder(true, &log)).unwrap();
        assert!(tx.commit().unwrap_err().is_transactional());
        assert_eq!(*log.lock(), vec!["prepare", "prepare", "rollback", "rollback"]);
    }

    #[test]
    fn test_suspended_transaction_refuses_enlistment() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tx = begin();
        tx.suspend().unwrap();
        assert!(tx.enlist(recorder(false, &log)).is_err());
        tx.resume().unwrap();
        tx.enlist(recorder(false, &log)).unwrap();
    }

    #[test]
    fn test_same_resource_cannot_be_enlisted_twice() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tx = begin();
        let r = recorder(false, &log);
        tx.enlist(r.clone()).unwrap();
        assert!(tx.enlist(r).is_err());
    }

    #[test]
    fn test_closed_factory_refuses_managers() {
        let factory = LocalTransactionManagerFactory::new();
        let manager = factory.new_transaction_manager().unwrap();
        factory.close().unwrap();
        assert!(factory.new_transaction_manager().is_err());
        assert!(manager.begin().is_err());
    }
}
