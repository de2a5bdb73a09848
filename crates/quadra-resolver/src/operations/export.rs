use super::{graph_node, require_graph_uri, Operation, ResultSlot};
use crate::cache::graph_statements;
use crate::context::OperationContext;
use crate::metadata::DatabaseMetadata;
use crate::ntriples;
use crate::security;
use quadra_spi::{Error, Result, SystemResolver};
use std::io::Write;

/// Writes every statement of a graph to `writer` as N-Triples.
pub struct ExportOperation<W: Write> {
    graph_uri: String,
    writer: Option<W>,
    written: ResultSlot<usize>,
}

impl<W: Write> ExportOperation<W> {
    pub fn new(graph_uri: &str, writer: W) -> Result<Self> {
        require_graph_uri(graph_uri)?;
        Ok(Self {
            graph_uri: graph_uri.to_string(),
            writer: Some(writer),
            written: ResultSlot::new("ExportOperation"),
        })
    }

    pub fn statements_written(&self) -> Result<usize> {
        self.written.get().copied()
    }

    /// Hands the writer back once the export has run.
    pub fn into_writer(mut self) -> Result<W> {
        self.written.get()?;
        self.writer
            .take()
            .ok_or_else(|| Error::invalid_state("export writer already taken"))
    }
}

impl<W: Write> Operation for ExportOperation<W> {
    fn execute(
        &mut self,
        context: &dyn OperationContext,
        _system_resolver: &dyn SystemResolver,
        _metadata: &DatabaseMetadata,
    ) -> Result<()> {
        if self.written.is_set() {
            return Err(Error::invalid_state("ExportOperation executed twice"));
        }
        let session = context.session();
        let graph = session
            .lookup_persistent(&graph_node(&self.graph_uri))?
            .ok_or_else(|| Error::NoSuchGraph(self.graph_uri.clone()))?;
        let graph = context.canonical_model(graph)?;
        security::check_visible(context.security_adapters(), graph, session.as_ref())?;

        let factory = context.find_model_resolver_factory(graph)?;
        if !factory.supports_export() {
            return Err(Error::Query(format!(
                "graph {} does not support export",
                self.graph_uri
            )));
        }
        let statements = if security::can_resolve(context.security_adapters(), graph, session.as_ref())? {
            let resolver = context.obtain_resolver(&factory)?;
            graph_statements(resolver.as_ref(), graph)?
        } else {
            Vec::new()
        };

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::invalid_state("export writer already taken"))?;
        for statement in &statements {
            ntriples::write_statement(
                writer,
                &session.globalize(statement.subject)?,
                &session.globalize(statement.predicate)?,
                &session.globalize(statement.object)?,
            )?;
        }
        writer
            .flush()
            .map_err(|err| Error::Query(format!("export flush failed: {err}")))?;
        tracing::info!(graph = %self.graph_uri, statements = statements.len(), "exported graph");
        self.written.set(statements.len())
    }

    fn is_write_operation(&self) -> bool {
        false
    }
}
