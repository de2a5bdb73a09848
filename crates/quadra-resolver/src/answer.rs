//! Query answers and the operations that drive them inside their transaction.
//!
//! A select query hands back a [`TransactionalAnswer`]. Its cursor may be
//! advanced long after the query operation returned, so every call is
//! wrapped in an [`AnswerOperation`] and executed through
//! [`Transaction::execute_answer`], which re-activates the owning
//! transaction for the duration of the call.

use crate::transaction::Transaction;
use parking_lot::Mutex;
use quadra_spi::{Error, GlobalNode, ResolverSession, Result, Tuples, Variable};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Answer operation results
// ============================================================================

/// Generic payload of [`AnswerOperationResult::Object`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerValue {
    Node(GlobalNode),
    Unbound,
    Variables(Vec<Variable>),
}

/// What an answer operation produced. Only the produced tag can be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerOperationResult {
    Void,
    Object(AnswerValue),
    Int(i32),
    Long(i64),
    Boolean(bool),
}

impl AnswerOperationResult {
    fn tag(&self) -> &'static str {
        match self {
            AnswerOperationResult::Void => "void",
            AnswerOperationResult::Object(_) => "object",
            AnswerOperationResult::Int(_) => "int",
            AnswerOperationResult::Long(_) => "long",
            AnswerOperationResult::Boolean(_) => "boolean",
        }
    }

    fn mismatch(&self, wanted: &str) -> Error {
        Error::invalid_state(format!("answer result is {}, not {wanted}", self.tag()))
    }

    pub fn as_void(&self) -> Result<()> {
        match self {
            AnswerOperationResult::Void => Ok(()),
            other => Err(other.mismatch("void")),
        }
    }

    pub fn as_object(&self) -> Result<&AnswerValue> {
        match self {
            AnswerOperationResult::Object(value) => Ok(value),
            other => Err(other.mismatch("object")),
        }
    }

    pub fn as_int(&self) -> Result<i32> {
        match self {
            AnswerOperationResult::Int(value) => Ok(*value),
            other => Err(other.mismatch("int")),
        }
    }

    pub fn as_long(&self) -> Result<i64> {
        match self {
            AnswerOperationResult::Long(value) => Ok(*value),
            other => Err(other.mismatch("long")),
        }
    }

    pub fn as_boolean(&self) -> Result<bool> {
        match self {
            AnswerOperationResult::Boolean(value) => Ok(*value),
            other => Err(other.mismatch("boolean")),
        }
    }
}

type AnswerBody<'a> = Box<dyn FnOnce() -> Result<AnswerOperationResult> + 'a>;

/// One step of answer evaluation, run exactly once inside the owning
/// transaction.
pub struct AnswerOperation<'a> {
    name: &'static str,
    body: Option<AnswerBody<'a>>,
    result: Option<AnswerOperationResult>,
}

impl<'a> AnswerOperation<'a> {
    pub fn new(
        name: &'static str,
        body: impl FnOnce() -> Result<AnswerOperationResult> + 'a,
    ) -> Self {
        Self {
            name,
            body: Some(Box::new(body)),
            result: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn execute(&mut self) -> Result<()> {
        let body = self.body.take().ok_or_else(|| {
            Error::invalid_state(format!("answer operation {} already executed", self.name))
        })?;
        self.result = Some(body()?);
        Ok(())
    }

    pub fn result(&self) -> Result<&AnswerOperationResult> {
        self.result.as_ref().ok_or_else(|| {
            Error::invalid_state(format!("answer operation {} has not been executed", self.name))
        })
    }
}

impl fmt::Debug for AnswerOperation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnswerOperation")
            .field("name", &self.name)
            .field("result", &self.result)
            .finish()
    }
}

// ============================================================================
// Answers
// ============================================================================

/// Cursor over query results, one row at a time.
pub trait Answer: Send {
    fn variables(&self) -> &[Variable];

    fn before_first(&mut self) -> Result<()>;

    fn next(&mut self) -> Result<bool>;

    fn column_index(&self, variable: &Variable) -> Result<usize>;

    /// Value of `column` in the current row; `None` when unbound.
    fn get_object(&mut self, column: usize) -> Result<Option<GlobalNode>>;

    fn row_count(&mut self) -> Result<i64>;

    fn is_unconstrained(&mut self) -> Result<bool>;

    fn close(&mut self) -> Result<()>;
}

/// Answer over materialized tuples, globalizing values on demand.
pub struct TuplesAnswer {
    tuples: Tuples,
    session: Arc<dyn ResolverSession>,
    cursor: Option<usize>,
    closed: bool,
}

impl TuplesAnswer {
    pub fn new(tuples: Tuples, session: Arc<dyn ResolverSession>) -> Self {
        Self {
            tuples,
            session,
            cursor: None,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::invalid_state("answer is closed"))
        } else {
            Ok(())
        }
    }
}

impl Answer for TuplesAnswer {
    fn variables(&self) -> &[Variable] {
        self.tuples.variables()
    }

    fn before_first(&mut self) -> Result<()> {
        self.check_open()?;
        self.cursor = None;
        Ok(())
    }

    fn next(&mut self) -> Result<bool> {
        self.check_open()?;
        let next = self.cursor.map_or(0, |c| c + 1);
        if next < self.tuples.row_count() {
            self.cursor = Some(next);
            Ok(true)
        } else {
            self.cursor = Some(self.tuples.row_count());
            Ok(false)
        }
    }

    fn column_index(&self, variable: &Variable) -> Result<usize> {
        self.tuples
            .column_index(variable)
            .ok_or_else(|| Error::Tuples(format!("no column for {variable}")))
    }

    fn get_object(&mut self, column: usize) -> Result<Option<GlobalNode>> {
        self.check_open()?;
        let row = self
            .cursor
            .filter(|&c| c < self.tuples.row_count())
            .ok_or_else(|| Error::invalid_state("cursor is not on a row"))?;
        if column >= self.tuples.variables().len() {
            return Err(Error::Tuples(format!("column {column} out of range")));
        }
        let value = self.tuples.value(row, column);
        if value.is_none() {
            Ok(None)
        } else {
            self.session.globalize(value).map(Some)
        }
    }

    fn row_count(&mut self) -> Result<i64> {
        self.check_open()?;
        Ok(self.tuples.row_count() as i64)
    }

    fn is_unconstrained(&mut self) -> Result<bool> {
        self.check_open()?;
        Ok(self.tuples.is_unconstrained())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Shared between a [`TransactionalAnswer`] and the context that registered
/// it, so the context can force-close it when the transaction finishes.
pub(crate) struct AnswerSlot {
    inner: Mutex<Option<Box<dyn Answer>>>,
}

impl AnswerSlot {
    /// Drops the inner answer without touching the transaction.
    pub(crate) fn session_close(&self) -> Result<()> {
        match self.inner.lock().take() {
            Some(mut answer) => answer.close(),
            None => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.inner.lock().is_some()
    }
}

/// An answer that keeps its transaction referenced until it is closed.
pub struct TransactionalAnswer {
    transaction: Arc<Transaction>,
    slot: Arc<AnswerSlot>,
    variables: Vec<Variable>,
}

impl TransactionalAnswer {
    pub(crate) fn new(transaction: Arc<Transaction>, answer: Box<dyn Answer>) -> Result<Self> {
        transaction.reference()?;
        let variables = answer.variables().to_vec();
        Ok(Self {
            transaction,
            slot: Arc::new(AnswerSlot {
                inner: Mutex::new(Some(answer)),
            }),
            variables,
        })
    }

    pub(crate) fn slot(&self) -> &Arc<AnswerSlot> {
        &self.slot
    }

    pub fn is_open(&self) -> bool {
        self.slot.is_open()
    }

    fn run(
        &self,
        name: &'static str,
        step: impl FnOnce(&mut dyn Answer) -> Result<AnswerOperationResult>,
    ) -> Result<AnswerOperationResult> {
        let slot = &self.slot;
        let mut op = AnswerOperation::new(name, move || {
            let mut guard = slot.inner.lock();
            let answer = guard
                .as_mut()
                .ok_or_else(|| Error::invalid_state("answer closed by transaction completion"))?;
            step(answer.as_mut())
        });
        self.transaction.execute_answer(&mut op)?;
        op.result().cloned()
    }

    /// Reads every remaining row, globalized.
    pub fn rows(&mut self) -> Result<Vec<Vec<Option<GlobalNode>>>> {
        let width = self.variables.len();
        let mut rows = Vec::new();
        while self.next()? {
            let mut row = Vec::with_capacity(width);
            for column in 0..width {
                row.push(self.get_object(column)?);
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

impl Answer for TransactionalAnswer {
    fn variables(&self) -> &[Variable] {
        &self.variables
    }

    fn before_first(&mut self) -> Result<()> {
        self.run("before_first", |a| {
            a.before_first()?;
            Ok(AnswerOperationResult::Void)
        })?
        .as_void()
    }

    fn next(&mut self) -> Result<bool> {
        self.run("next", |a| Ok(AnswerOperationResult::Boolean(a.next()?)))?
            .as_boolean()
    }

    fn column_index(&self, variable: &Variable) -> Result<usize> {
        let index = self.run("column_index", |a| {
            let index = a.column_index(variable)?;
            i32::try_from(index)
                .map(AnswerOperationResult::Int)
                .map_err(|_| Error::Tuples(format!("column index {index} overflows")))
        })?;
        Ok(index.as_int()? as usize)
    }

    fn get_object(&mut self, column: usize) -> Result<Option<GlobalNode>> {
        let result = self.run("get_object", |a| {
            Ok(AnswerOperationResult::Object(match a.get_object(column)? {
                Some(node) => AnswerValue::Node(node),
                None => AnswerValue::Unbound,
            }))
        })?;
        match result.as_object()? {
            AnswerValue::Node(node) => Ok(Some(node.clone())),
            AnswerValue::Unbound => Ok(None),
            AnswerValue::Variables(_) => Err(Error::invalid_state("expected a node value")),
        }
    }

    fn row_count(&mut self) -> Result<i64> {
        self.run("row_count", |a| Ok(AnswerOperationResult::Long(a.row_count()?)))?
            .as_long()
    }

    fn is_unconstrained(&mut self) -> Result<bool> {
        self.run("is_unconstrained", |a| {
            Ok(AnswerOperationResult::Boolean(a.is_unconstrained()?))
        })?
        .as_boolean()
    }

    fn close(&mut self) -> Result<()> {
        if !self.slot.is_open() {
            return Ok(());
        }
        let slot = self.slot.clone();
        let transaction = self.transaction.clone();
        let mut op = AnswerOperation::new("close", move || {
            if let Some(mut answer) = slot.inner.lock().take() {
                answer.close()?;
            }
            transaction.dereference()?;
            Ok(AnswerOperationResult::Void)
        });
        self.transaction.execute_answer(&mut op)?;
        op.result()?.as_void()
    }
}

impl Drop for TransactionalAnswer {
    fn drop(&mut self) {
        if self.slot.is_open() {
            if let Err(err) = self.close() {
                tracing::warn!(error = %err, "failed to close answer on drop");
            }
        }
    }
}

/// Result of a query operation.
pub enum QueryAnswer {
    Boolean(bool),
    Rows(TransactionalAnswer),
}

impl QueryAnswer {
    pub fn as_boolean(&self) -> Result<bool> {
        match self {
            QueryAnswer::Boolean(value) => Ok(*value),
            QueryAnswer::Rows(_) => Err(Error::invalid_state("select answer read as boolean")),
        }
    }

    pub fn into_rows(self) -> Result<TransactionalAnswer> {
        match self {
            QueryAnswer::Rows(answer) => Ok(answer),
            QueryAnswer::Boolean(_) => Err(Error::invalid_state("ask answer read as rows")),
        }
    }
}

impl fmt::Debug for QueryAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryAnswer::Boolean(value) => f.debug_tuple("Boolean").field(value).finish(),
            QueryAnswer::Rows(answer) => f
                .debug_struct("Rows")
                .field("variables", &answer.variables)
                .field("open", &answer.is_open())
                .finish(),
        }
    }
}

/// Runs `body` over `answer` and closes it. A close failure is reported only
/// when `body` succeeded; otherwise it is logged and the primary error wins.
pub fn with_answer<T>(
    answer: &mut dyn Answer,
    body: impl FnOnce(&mut dyn Answer) -> Result<T>,
) -> Result<T> {
    let outcome = body(&mut *answer);
    let closed = answer.close();
    match (outcome, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(close_err)) => Err(close_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => {
            tracing::warn!(error = %close_err, "suppressed answer close failure after earlier error");
            Err(err)
        }
    }
}
