use super::{Operation, ResultSlot};
use crate::answer::QueryAnswer;
use crate::context::OperationContext;
use crate::metadata::DatabaseMetadata;
use crate::query::Query;
use quadra_spi::{Result, SystemResolver};

/// Evaluates a query. Select answers stay bound to the transaction until
/// they are closed.
pub struct QueryOperation {
    query: Query,
    answer: ResultSlot<QueryAnswer>,
}

impl QueryOperation {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            answer: ResultSlot::new("QueryOperation"),
        }
    }

    pub fn answer(&self) -> Result<&QueryAnswer> {
        self.answer.get()
    }

    pub fn into_answer(mut self) -> Result<QueryAnswer> {
        self.answer.take()
    }
}

impl Operation for QueryOperation {
    fn execute(
        &mut self,
        context: &dyn OperationContext,
        _system_resolver: &dyn SystemResolver,
        _metadata: &DatabaseMetadata,
    ) -> Result<()> {
        let answer = context.do_query(&self.query)?;
        self.answer.set(answer)
    }

    fn is_write_operation(&self) -> bool {
        false
    }
}
