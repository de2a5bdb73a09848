use super::{require_graph_uri, Operation, ResultSlot};
use crate::context::OperationContext;
use crate::metadata::DatabaseMetadata;
use crate::rules::{RuleLoader, Rules};
use quadra_spi::{Result, SystemResolver};
use std::sync::Arc;

/// Reads a rule graph into an executable rule set.
pub struct BuildRulesOperation {
    loader: Arc<dyn RuleLoader>,
    rule_graph: String,
    base_graph: String,
    destination_graph: String,
    rules: ResultSlot<Arc<dyn Rules>>,
}

impl BuildRulesOperation {
    pub fn new(
        loader: Arc<dyn RuleLoader>,
        rule_graph: &str,
        base_graph: &str,
        destination_graph: &str,
    ) -> Result<Self> {
        for uri in [rule_graph, base_graph, destination_graph] {
            require_graph_uri(uri)?;
        }
        Ok(Self {
            loader,
            rule_graph: rule_graph.to_string(),
            base_graph: base_graph.to_string(),
            destination_graph: destination_graph.to_string(),
            rules: ResultSlot::new("BuildRulesOperation"),
        })
    }

    pub fn rules(&self) -> Result<Arc<dyn Rules>> {
        self.rules.get().cloned()
    }
}

impl Operation for BuildRulesOperation {
    fn execute(
        &mut self,
        context: &dyn OperationContext,
        _system_resolver: &dyn SystemResolver,
        _metadata: &DatabaseMetadata,
    ) -> Result<()> {
        let rules = self.loader.read_rules(
            context,
            &self.rule_graph,
            &self.base_graph,
            &self.destination_graph,
        )?;
        self.rules.set(rules)
    }

    fn is_write_operation(&self) -> bool {
        false
    }
}

/// Runs a rule set, writing inferences into its destination graph.
pub struct ApplyRulesOperation {
    rules: Arc<dyn Rules>,
    inferred: ResultSlot<u64>,
}

impl ApplyRulesOperation {
    pub fn new(rules: Arc<dyn Rules>) -> Self {
        Self {
            rules,
            inferred: ResultSlot::new("ApplyRulesOperation"),
        }
    }

    pub fn inferred(&self) -> Result<u64> {
        self.inferred.get().copied()
    }
}

impl Operation for ApplyRulesOperation {
    fn execute(
        &mut self,
        context: &dyn OperationContext,
        system_resolver: &dyn SystemResolver,
        _metadata: &DatabaseMetadata,
    ) -> Result<()> {
        let inferred = self.rules.run(context, system_resolver)?;
        self.inferred.set(inferred)
    }

    fn is_write_operation(&self) -> bool {
        true
    }
}
