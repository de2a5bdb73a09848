use super::{graph_node, require_graph_uri, Operation, ResultSlot};
use crate::answer::with_answer;
use crate::context::OperationContext;
use crate::metadata::DatabaseMetadata;
use crate::query::{Query, QueryKind};
use crate::security;
use quadra_spi::{Error, GlobalNode, NodeId, ResolverSession, Result, Statement, SystemResolver};

/// Where the statements to insert or delete come from.
#[derive(Debug, Clone)]
pub enum StatementSource {
    Statements(Vec<[GlobalNode; 3]>),
    /// Each row of a three-column select is one statement.
    Query(Query),
}

#[derive(Debug)]
pub struct ModifyGraphOperation {
    graph_uri: String,
    source: StatementSource,
    insert: bool,
    modified: ResultSlot<usize>,
}

impl ModifyGraphOperation {
    pub fn new(graph_uri: &str, source: StatementSource, insert: bool) -> Result<Self> {
        require_graph_uri(graph_uri)?;
        if let StatementSource::Query(query) = &source {
            if query.kind != QueryKind::Select || query.variables.len() != 3 {
                return Err(Error::InvalidArgument(
                    "statement query must select exactly three variables".into(),
                ));
            }
        }
        Ok(Self {
            graph_uri: graph_uri.to_string(),
            source,
            insert,
            modified: ResultSlot::new("ModifyGraphOperation"),
        })
    }

    pub fn insert(graph_uri: &str, statements: Vec<[GlobalNode; 3]>) -> Result<Self> {
        Self::new(graph_uri, StatementSource::Statements(statements), true)
    }

    pub fn delete(graph_uri: &str, statements: Vec<[GlobalNode; 3]>) -> Result<Self> {
        Self::new(graph_uri, StatementSource::Statements(statements), false)
    }

    pub fn is_insert(&self) -> bool {
        self.insert
    }

    /// Statements handed to the resolver.
    pub fn statement_count(&self) -> Result<usize> {
        self.modified.get().copied()
    }

    /// Localizes a triple. Deletion never allocates: a triple naming an
    /// unknown node cannot be stored, so it is skipped.
    fn localize(&self, session: &dyn ResolverSession, triple: &[GlobalNode; 3]) -> Result<Option<Statement>> {
        let mut ids = [NodeId::NONE; 3];
        for (id, node) in ids.iter_mut().zip(triple) {
            *id = if self.insert {
                session.localize_persistent(node)?
            } else {
                match session.lookup_persistent(node)? {
                    Some(id) => id,
                    None => return Ok(None),
                }
            };
        }
        Ok(Some(Statement::new(ids[0], ids[1], ids[2])))
    }

    fn collect(&self, context: &dyn OperationContext) -> Result<Vec<Statement>> {
        let session = context.session();
        match &self.source {
            StatementSource::Statements(triples) => {
                let mut statements = Vec::with_capacity(triples.len());
                for triple in triples {
                    statements.extend(self.localize(session.as_ref(), triple)?);
                }
                Ok(statements)
            }
            StatementSource::Query(query) => {
                let mut answer = context.do_query(query)?.into_rows()?;
                let triples = with_answer(&mut answer, |rows| {
                    let mut triples = Vec::new();
                    while rows.next()? {
                        let (Some(s), Some(p), Some(o)) =
                            (rows.get_object(0)?, rows.get_object(1)?, rows.get_object(2)?)
                        else {
                            continue;
                        };
                        triples.push([s, p, o]);
                    }
                    Ok(triples)
                })?;
                let mut statements = Vec::with_capacity(triples.len());
                for triple in &triples {
                    statements.extend(self.localize(session.as_ref(), triple)?);
                }
                Ok(statements)
            }
        }
    }
}

impl Operation for ModifyGraphOperation {
    fn execute(
        &mut self,
        context: &dyn OperationContext,
        _system_resolver: &dyn SystemResolver,
        _metadata: &DatabaseMetadata,
    ) -> Result<()> {
        let session = context.session();
        let node = graph_node(&self.graph_uri);
        let graph = if self.insert {
            session.localize_persistent(&node)?
        } else {
            session
                .lookup_persistent(&node)?
                .ok_or_else(|| Error::NoSuchGraph(self.graph_uri.clone()))?
        };
        let graph = context.canonical_model(graph)?;
        security::check_modifiable(context.security_adapters(), graph, session.as_ref())?;

        let factory = context.find_model_resolver_factory(graph)?;
        let statements = self.collect(context)?;
        if !statements.is_empty() {
            let resolver = context.obtain_resolver(&factory)?;
            resolver.modify_model(graph, &statements, self.insert)?;
        }
        tracing::debug!(
            graph = %self.graph_uri,
            insert = self.insert,
            statements = statements.len(),
            "modified graph"
        );
        self.modified.set(statements.len())
    }

    fn is_write_operation(&self) -> bool {
        true
    }
}
