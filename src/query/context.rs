//! Query Context
//!
//! State for one resolution request: the fact bag, the operations and
//! strategies it may not use, and its cancellation flag. Nested searches run
//! in child contexts that see their parent's cancellation but never cancel
//! the parent.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::trace;

use super::engine::QueryEngine;
use super::strategies::StrategyKind;
use super::{CancellationHandle, FailureBehaviour, InvocationConstraints, QueryResult, QuerySpecNode};
use crate::config::QueryConfig;
use crate::error::Result;
use crate::facts::{FactBag, FactSearch};
use crate::graph::GraphBuilder;
use crate::invocation::OperationInvoker;
use crate::models::TypedInstance;
use crate::schema::Schema;

static QUERY_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_query_id() -> String {
    format!("q{}", QUERY_COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-query state
pub struct QueryContext {
    engine: QueryEngine,
    schema: Arc<Schema>,
    facts: Arc<Mutex<FactBag>>,
    invoker: Arc<dyn OperationInvoker>,
    query_id: String,
    parent: Option<Arc<QueryContext>>,
    excluded_operations: BTreeSet<String>,
    excluded_strategies: BTreeSet<StrategyKind>,
    is_projecting: bool,
    failure_behaviour: FailureBehaviour,
    cancel: CancellationHandle,
    cancel_rx: watch::Receiver<bool>,
    /// (start fact hash, target type) pairs the graph search need not retry
    search_exclusions: Arc<Mutex<HashSet<(u64, String)>>>,
}

impl QueryContext {
    pub(crate) fn root(
        engine: QueryEngine,
        schema: Arc<Schema>,
        invoker: Arc<dyn OperationInvoker>,
        facts: Vec<TypedInstance>,
    ) -> Self {
        let (cancel, cancel_rx) = CancellationHandle::new();
        let failure_behaviour = engine.config().query.failure_behaviour;
        Self {
            facts: Arc::new(Mutex::new(FactBag::with_facts(schema.clone(), facts))),
            engine,
            schema,
            invoker,
            query_id: next_query_id(),
            parent: None,
            excluded_operations: BTreeSet::new(),
            excluded_strategies: BTreeSet::new(),
            is_projecting: false,
            failure_behaviour,
            cancel,
            cancel_rx,
            search_exclusions: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// A child inheriting everything but cancellation, over `facts`
    fn child(self: &Arc<Self>, facts: Arc<Mutex<FactBag>>) -> Self {
        let (cancel, cancel_rx) = CancellationHandle::new();
        Self {
            engine: self.engine.clone(),
            schema: self.schema.clone(),
            facts,
            invoker: self.invoker.clone(),
            query_id: format!("{}/{}", self.query_id, next_query_id()),
            parent: Some(self.clone()),
            excluded_operations: self.excluded_operations.clone(),
            excluded_strategies: self.excluded_strategies.clone(),
            is_projecting: self.is_projecting,
            failure_behaviour: self.failure_behaviour,
            cancel,
            cancel_rx,
            search_exclusions: self.search_exclusions.clone(),
        }
    }

    // ========== Child contexts ==========

    /// A child knowing only `fact` (and its enum synonyms)
    pub fn only(self: &Arc<Self>, fact: TypedInstance) -> Arc<Self> {
        let mut bag = FactBag::new(self.schema.clone());
        let synonyms = bag.synonyms_of(&fact);
        bag.add_fact(fact);
        bag.add_facts(synonyms);
        Arc::new(self.child(Arc::new(Mutex::new(bag))))
    }

    /// A child with a copy of these facts plus `facts`
    pub fn with_additional_facts(self: &Arc<Self>, facts: Vec<TypedInstance>) -> Arc<Self> {
        let mut bag = lock(&self.facts).clone();
        bag.add_facts(facts);
        Arc::new(self.child(Arc::new(Mutex::new(bag))))
    }

    /// A child sharing these facts that may not use `strategy`
    pub fn excluding_strategy(self: &Arc<Self>, strategy: StrategyKind) -> Arc<Self> {
        let mut child = self.child(self.facts.clone());
        child.excluded_strategies.insert(strategy);
        Arc::new(child)
    }

    /// A child sharing these facts that may not call `operations`
    pub fn excluding_operations(self: &Arc<Self>, operations: impl IntoIterator<Item = String>) -> Arc<Self> {
        let mut child = self.child(self.facts.clone());
        child.excluded_operations.extend(operations);
        Arc::new(child)
    }

    /// A child sharing these facts that builds from what is known rather
    /// than discovering
    pub fn projecting(self: &Arc<Self>) -> Arc<Self> {
        let mut child = self.child(self.facts.clone());
        child.is_projecting = true;
        Arc::new(child)
    }

    /// A child sharing these facts that reports failures the given way
    pub fn with_failure_behaviour(self: &Arc<Self>, behaviour: FailureBehaviour) -> Arc<Self> {
        let mut child = self.child(self.facts.clone());
        child.failure_behaviour = behaviour;
        Arc::new(child)
    }

    // ========== Queries ==========

    pub fn find(self: &Arc<Self>, type_name: &str) -> Result<QueryResult> {
        self.find_with(QuerySpecNode::discover(type_name), InvocationConstraints::default())
    }

    pub fn find_with(self: &Arc<Self>, spec: QuerySpecNode, constraints: InvocationConstraints) -> Result<QueryResult> {
        self.engine.find_in(self.clone(), spec, constraints)
    }

    pub fn build(self: &Arc<Self>, type_name: &str) -> Result<QueryResult> {
        self.engine.build_in(self.clone(), type_name)
    }

    // ========== Facts ==========

    pub fn facts(&self) -> Vec<TypedInstance> {
        lock(&self.facts).facts().to_vec()
    }

    pub fn add_fact(&self, fact: TypedInstance) {
        lock(&self.facts).add_fact(fact);
    }

    pub fn add_facts(&self, facts: impl IntoIterator<Item = TypedInstance>) {
        lock(&self.facts).add_facts(facts);
    }

    pub fn get_fact_or_null(&self, search: &FactSearch) -> Option<TypedInstance> {
        lock(&self.facts).get_fact_or_null(search)
    }

    pub fn has_fact(&self, search: &FactSearch) -> bool {
        lock(&self.facts).has_fact(search)
    }

    pub fn breadth_first_filter(&self, predicate: impl Fn(&TypedInstance) -> bool) -> Vec<TypedInstance> {
        lock(&self.facts).breadth_first_filter(predicate)
    }

    // ========== Search exclusions ==========

    pub fn is_search_excluded(&self, start: &TypedInstance, target: &str) -> bool {
        lock(&self.search_exclusions).contains(&(start.value_hash(), target.to_string()))
    }

    pub fn exclude_search(&self, start: &TypedInstance, target: &str) {
        trace!("[{}] Excluding searches for {} from {}", self.query_id, target, start);
        lock(&self.search_exclusions).insert((start.value_hash(), target.to_string()));
    }

    // ========== Cancellation ==========

    /// This context or any ancestor was cancelled
    pub fn is_cancel_requested(&self) -> bool {
        *self.cancel_rx.borrow() || self.parent.as_ref().is_some_and(|p| p.is_cancel_requested())
    }

    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancel.clone()
    }

    // ========== Accessors ==========

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn invoker(&self) -> &Arc<dyn OperationInvoker> {
        &self.invoker
    }

    pub fn config(&self) -> &QueryConfig {
        self.engine.config()
    }

    pub fn graph_builder(&self) -> Arc<GraphBuilder> {
        self.engine.graph_builder(&self.schema)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_projecting(&self) -> bool {
        self.is_projecting
    }

    pub fn failure_behaviour(&self) -> FailureBehaviour {
        self.failure_behaviour
    }

    pub fn excluded_operations(&self) -> &BTreeSet<String> {
        &self.excluded_operations
    }

    pub fn is_strategy_excluded(&self, strategy: StrategyKind) -> bool {
        self.excluded_strategies.contains(&strategy)
    }
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("query_id", &self.query_id)
            .field("facts", &lock(&self.facts).len())
            .field("excluded_operations", &self.excluded_operations)
            .field("excluded_strategies", &self.excluded_strategies)
            .field("is_projecting", &self.is_projecting)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::StubOperationInvoker;
    use crate::models::DataSource;
    use crate::schema::{EnumValue, Type};
    use serde_json::json;

    fn engine() -> (QueryEngine, Arc<Schema>) {
        let schema = Arc::new(Schema::new(
            vec![
                Type::new("ClientId").inheriting("String"),
                Type::new("Currency").with_enum_value(EnumValue {
                    name: "GBP".to_string(),
                    value: None,
                    synonyms: vec!["IsoCurrency.GBP".to_string()],
                }),
                Type::new("IsoCurrency").with_enum_value(EnumValue {
                    name: "GBP".to_string(),
                    value: None,
                    synonyms: vec![],
                }),
            ],
            vec![],
        ));
        let stubs = Arc::new(StubOperationInvoker::new(schema.clone()));
        (QueryEngine::new(schema.clone(), stubs), schema)
    }

    fn client_id(id: &str) -> TypedInstance {
        TypedInstance::scalar("ClientId", json!(id), DataSource::Provided)
    }

    #[test]
    fn test_child_cancellation_is_one_way() {
        let (engine, _) = engine();
        let parent = engine.query_context(vec![client_id("C1")]);
        let child = parent.only(client_id("C2"));
        let sibling = parent.only(client_id("C3"));

        child.request_cancel();
        assert!(child.is_cancel_requested());
        assert!(!parent.is_cancel_requested());
        assert!(!sibling.is_cancel_requested());

        parent.request_cancel();
        assert!(sibling.is_cancel_requested());
    }

    #[test]
    fn test_only_adds_enum_synonyms() {
        let (engine, schema) = engine();
        let ctx = engine.query_context(vec![client_id("C1")]);
        let gbp = TypedInstance::from_json("Currency", &json!("GBP"), &schema, DataSource::Provided).unwrap();

        let child = ctx.only(gbp);
        let types: Vec<_> = child.facts().into_iter().map(|f| f.type_name).collect();
        assert_eq!(types, vec!["Currency".to_string(), "IsoCurrency".to_string()]);
        assert_eq!(ctx.facts().len(), 1);
    }

    #[test]
    fn test_fact_sharing() {
        let (engine, _) = engine();
        let ctx = engine.query_context(vec![client_id("C1")]);

        let copy = ctx.with_additional_facts(vec![client_id("C2")]);
        assert_eq!(copy.facts().len(), 2);
        assert_eq!(ctx.facts().len(), 1);

        let shared = ctx.excluding_strategy(StrategyKind::ObjectConstruction);
        shared.add_fact(client_id("C3"));
        assert_eq!(ctx.facts().len(), 2);
        assert!(shared.is_strategy_excluded(StrategyKind::ObjectConstruction));
        assert!(!ctx.is_strategy_excluded(StrategyKind::ObjectConstruction));
    }

    #[test]
    fn test_search_exclusions_are_shared_with_children() {
        let (engine, _) = engine();
        let ctx = engine.query_context(vec![client_id("C1")]);
        let child = ctx.only(client_id("C2"));

        child.exclude_search(&client_id("C1"), "Client");
        assert!(ctx.is_search_excluded(&client_id("C1"), "Client"));
        assert!(!ctx.is_search_excluded(&client_id("C1"), "ClientId"));
    }
}
