use super::{graph_node, require_graph_uri, Operation, ResultSlot};
use crate::context::OperationContext;
use crate::metadata::DatabaseMetadata;
use crate::security;
use quadra_spi::{Error, Result, SystemResolver};

/// Creates `uri` with `model_type` unless it already exists with that type.
/// Returns whether a graph was created.
fn create_graph(
    context: &dyn OperationContext,
    uri: &str,
    model_type: &str,
    enforce_security: bool,
) -> Result<bool> {
    let factory = context
        .find_model_type_resolver_factory(model_type)?
        .ok_or_else(|| Error::UnsupportedModelType(model_type.to_string()))?;
    let session = context.session();
    let graph = session.localize_persistent(&graph_node(uri))?;
    let graph = context.canonical_model(graph)?;
    if enforce_security {
        security::check_visible_for_create(context.security_adapters(), graph, session.as_ref())?;
    }

    if let Some(existing) = context.graph_type(graph)? {
        if existing == model_type {
            tracing::debug!(graph = uri, model_type, "graph already exists");
            return Ok(false);
        }
        return Err(Error::TypeConflict {
            graph: uri.to_string(),
            existing,
        });
    }
    if enforce_security {
        security::check_creatable(context.security_adapters(), graph, session.as_ref())?;
    }

    let resolver = context.obtain_resolver(&factory)?;
    resolver.create_model(graph, model_type)?;
    tracing::info!(graph = uri, model_type, "created graph");
    Ok(true)
}

pub struct CreateGraphOperation {
    graph_uri: String,
    model_type: Option<String>,
    created: ResultSlot<bool>,
}

impl CreateGraphOperation {
    /// Without a model type the database's default graph type is used.
    pub fn new(graph_uri: &str, model_type: Option<&str>) -> Result<Self> {
        require_graph_uri(graph_uri)?;
        if let Some(ty) = model_type {
            url::Url::parse(ty)
                .map_err(|_| Error::InvalidArgument(format!("model type {ty:?} is not a URI")))?;
        }
        Ok(Self {
            graph_uri: graph_uri.to_string(),
            model_type: model_type.map(str::to_string),
            created: ResultSlot::new("CreateGraphOperation"),
        })
    }

    pub fn created(&self) -> Result<bool> {
        self.created.get().copied()
    }
}

impl Operation for CreateGraphOperation {
    fn execute(
        &mut self,
        context: &dyn OperationContext,
        _system_resolver: &dyn SystemResolver,
        metadata: &DatabaseMetadata,
    ) -> Result<()> {
        let model_type = self
            .model_type
            .as_deref()
            .unwrap_or_else(|| metadata.default_graph_type());
        let created = create_graph(context, &self.graph_uri, model_type, true)?;
        self.created.set(created)
    }

    fn is_write_operation(&self) -> bool {
        true
    }
}

/// Idempotent creation used when provisioning a factory's default graphs.
/// Skips the creation permission check.
pub struct CreateDefaultGraphOperation {
    graph_uri: String,
    model_type: String,
    created: ResultSlot<bool>,
}

impl CreateDefaultGraphOperation {
    pub fn new(graph_uri: &str, model_type: &str) -> Result<Self> {
        require_graph_uri(graph_uri)?;
        if model_type.is_empty() {
            return Err(Error::InvalidArgument("model type is required".into()));
        }
        Ok(Self {
            graph_uri: graph_uri.to_string(),
            model_type: model_type.to_string(),
            created: ResultSlot::new("CreateDefaultGraphOperation"),
        })
    }

    pub fn created(&self) -> Result<bool> {
        self.created.get().copied()
    }
}

impl Operation for CreateDefaultGraphOperation {
    fn execute(
        &mut self,
        context: &dyn OperationContext,
        _system_resolver: &dyn SystemResolver,
        _metadata: &DatabaseMetadata,
    ) -> Result<()> {
        let created = create_graph(context, &self.graph_uri, &self.model_type, false)?;
        self.created.set(created)
    }

    fn is_write_operation(&self) -> bool {
        true
    }
}
