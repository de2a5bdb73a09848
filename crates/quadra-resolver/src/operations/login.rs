use super::{Operation, ResultSlot};
use crate::context::OperationContext;
use crate::metadata::DatabaseMetadata;
use quadra_spi::{Error, Result, SystemResolver};

/// Presents credentials to every security adapter of the session.
pub struct LoginOperation {
    security_domain: String,
    user: String,
    password: String,
    done: ResultSlot<()>,
}

impl LoginOperation {
    pub fn new(security_domain: &str, user: &str, password: &str) -> Result<Self> {
        if user.is_empty() {
            return Err(Error::InvalidArgument("user name is required".into()));
        }
        Ok(Self {
            security_domain: security_domain.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            done: ResultSlot::new("LoginOperation"),
        })
    }

    pub fn result(&self) -> Result<()> {
        self.done.get().copied()
    }
}

impl Operation for LoginOperation {
    fn execute(
        &mut self,
        context: &dyn OperationContext,
        _system_resolver: &dyn SystemResolver,
        _metadata: &DatabaseMetadata,
    ) -> Result<()> {
        for adapter in context.security_adapters() {
            adapter.login(&self.security_domain, &self.user, &self.password)?;
        }
        self.done.set(())
    }

    fn is_write_operation(&self) -> bool {
        false
    }
}
