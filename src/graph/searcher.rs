//! Graph Searcher
//!
//! Proposes the least-cost path from one known fact to a target type,
//! evaluates it, and retries until a path yields an acceptable value, no
//! path remains, a path traps the search, or the attempt cap is reached.
//!
//! The graph is rebuilt before every proposal so facts discovered by earlier
//! attempts (operation results, constructed parameters) become start points
//! for later ones.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::builder::GraphBuilder;
use super::edges::EvaluatedPath;
use super::paths::{EvaluatedPathSet, PathExclusionCalculator};
use super::{Connection, Element, SearchPath};
use crate::config::SearchConfig;
use crate::error::{QueryError, Result};
use crate::facts::FactPredicate;
use crate::models::{DataSource, TypedInstance};
use crate::schema::Schema;

/// The environment a search runs in: current facts, cancellation, and the
/// means to walk a proposed path
#[async_trait]
pub trait PathEvaluator: Send + Sync {
    fn facts(&self) -> Vec<TypedInstance>;

    fn is_cancelled(&self) -> bool;

    fn query_id(&self) -> &str;

    async fn evaluate(&self, start: &TypedInstance, path: &SearchPath) -> EvaluatedPath;
}

/// A value found by walking a path
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub value: TypedInstance,
    pub path: EvaluatedPath,
}

/// Everything one search session learned
#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub result: Option<SearchResult>,
    /// Provenance of the last value of every path that did not succeed
    pub failed_attempts: Vec<DataSource>,
    pub paths_evaluated: usize,
    /// Some path proposed no route at all from the start fact
    pub no_path: bool,
    /// An operation on an evaluated path returned the start fact again
    pub produced_start_fact: bool,
}

/// Searches from one start fact to one target type
#[derive(Debug)]
pub struct GraphSearcher {
    start: TypedInstance,
    target_type: String,
    builder: Arc<GraphBuilder>,
    config: SearchConfig,
    excluded_operations: BTreeSet<String>,
    predicate: FactPredicate,
}

impl GraphSearcher {
    pub fn new(start: TypedInstance, target_type: impl Into<String>, builder: Arc<GraphBuilder>, config: SearchConfig) -> Self {
        Self {
            start,
            target_type: target_type.into(),
            builder,
            config,
            excluded_operations: BTreeSet::new(),
            predicate: FactPredicate::Any,
        }
    }

    pub fn excluding_operations(mut self, operations: BTreeSet<String>) -> Self {
        self.excluded_operations = operations;
        self
    }

    pub fn with_predicate(mut self, predicate: FactPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Run the search. Only cancellation is an error; every other way of
    /// not finding a value is reported through the outcome.
    pub async fn search(&self, env: &dyn PathEvaluator) -> Result<SearchOutcome> {
        let schema = self.builder.schema().clone();
        let start_node = Element::instance_of(&self.start);
        let target_node = Element::type_node(&self.target_type);

        let mut paths = EvaluatedPathSet::new(&self.config);
        let mut excluded_edges: BTreeSet<Connection> = BTreeSet::new();
        let mut trapped: HashSet<u64> = HashSet::new();
        let mut outcome = SearchOutcome::default();

        for attempt in 0..self.config.max_search_count {
            if env.is_cancelled() {
                return Err(QueryError::QueryCancelled {
                    query_id: env.query_id().to_string(),
                });
            }

            let graph = self.builder.build(&env.facts(), &self.excluded_operations, &excluded_edges);
            let Some(path) = graph.find_path(&start_node, &target_node, |c| paths.cost(c)) else {
                debug!(
                    "[{}] No more paths from {} to {} after {} attempts",
                    env.query_id(),
                    self.start,
                    self.target_type,
                    attempt
                );
                outcome.no_path = outcome.paths_evaluated == 0;
                return Ok(outcome);
            };
            let path_hash = path.exact_hash();

            if paths.contains_path(&path) {
                if !trapped.insert(path_hash) {
                    warn!("[{}] Search is trapped on path {}", env.query_id(), path.describe());
                    return Ok(outcome);
                }
                let excluded = paths
                    .evaluated_path(path_hash)
                    .map(PathExclusionCalculator::edges_to_exclude)
                    .unwrap_or_default();
                if excluded.is_empty() {
                    warn!(
                        "[{}] Path {} was already evaluated and nothing can be excluded",
                        env.query_id(),
                        path.describe()
                    );
                    return Ok(outcome);
                }
                for edge in &excluded {
                    debug!("[{}] Excluding {}", env.query_id(), edge);
                }
                excluded_edges.extend(excluded);
                continue;
            }

            if paths.contains_equivalent_path(&path) {
                debug!("[{}] Ignoring equivalent path {}", env.query_id(), path.describe());
                paths.add_ignored_path(&path);
                continue;
            }

            debug!("[{}] Evaluating path {}", env.query_id(), path.describe());
            paths.add_proposed_path(&path);
            outcome.paths_evaluated += 1;
            let evaluated = env.evaluate(&self.start, &path).await;

            if evaluated
                .operation_results()
                .any(|result| result.same_value(&self.start))
            {
                outcome.produced_start_fact = true;
            }

            if evaluated.is_success() && self.predicate.test(evaluated.result_value()) {
                if let Some(value) = select_result_value(&schema, &self.target_type, evaluated.result_value()) {
                    info!(
                        "[{}] Found {} after {} paths via {}",
                        env.query_id(),
                        value,
                        outcome.paths_evaluated,
                        path.describe()
                    );
                    outcome.result = Some(SearchResult {
                        value,
                        path: evaluated,
                    });
                    return Ok(outcome);
                }
            }

            outcome.failed_attempts.push(evaluated.result_value().source.clone());
            paths.add_evaluated_path(path_hash, evaluated);
        }

        warn!(
            "[{}] Gave up searching for {} from {} after {} attempts",
            env.query_id(),
            self.target_type,
            self.start,
            self.config.max_search_count
        );
        Ok(outcome)
    }
}

/// The value to return when a path ends on `value`: an exact type match,
/// a member of a requested collection type, or an assignable value
pub fn select_result_value(schema: &Schema, target_type: &str, value: &TypedInstance) -> Option<TypedInstance> {
    let target = schema.resolve_alias(target_type);
    if schema.resolve_alias(&value.type_name) == target {
        return Some(value.clone());
    }
    if let Ok(t) = schema.type_named(&target) {
        if t.collection_member_type() == Some(value.type_name.as_str()) {
            return Some(value.clone());
        }
    }
    schema
        .is_assignable(&value.type_name, &target)
        .then(|| value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::edges::EvaluatedEdge;
    use crate::graph::Relationship;
    use crate::schema::{Field, Operation, Parameter, Service, Type};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(
            vec![
                Type::new("ClientId").inheriting("String"),
                Type::new("ClientJurisdiction").inheriting("String"),
                Type::new("TradeRequest").with_attribute("clientId", Field::of("ClientId")),
                Type::new("Client")
                    .with_attribute("id", Field::of("ClientId"))
                    .with_attribute("jurisdiction", Field::of("ClientJurisdiction")),
                // A cycle: a node refers back to its parent
                Type::new("Node")
                    .with_attribute("id", Field::of("NodeId"))
                    .with_attribute("parent", Field::of("Node")),
                Type::new("NodeId").inheriting("String"),
            ],
            vec![
                Service::new("ClientService").with_operation(
                    Operation::new("getClient", "Client").with_parameter(Parameter::of("ClientId")),
                ),
                Service::new("NodeService").with_operation(
                    Operation::new("getNode", "Node").with_parameter(Parameter::of("NodeId")),
                ),
            ],
        ))
    }

    /// Walks paths without touching a query context; every operation fails
    /// unless `succeed` is set, in which case each edge yields `answer`.
    struct ScriptedEvaluator {
        facts: Vec<TypedInstance>,
        succeed: bool,
        answer: TypedInstance,
        evaluated: Mutex<Vec<u64>>,
        invocations: AtomicUsize,
        cancelled: AtomicBool,
    }

    impl ScriptedEvaluator {
        fn new(facts: Vec<TypedInstance>, succeed: bool, answer: TypedInstance) -> Self {
            Self {
                facts,
                succeed,
                answer,
                evaluated: Mutex::new(Vec::new()),
                invocations: AtomicUsize::new(0),
                cancelled: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl PathEvaluator for ScriptedEvaluator {
        fn facts(&self) -> Vec<TypedInstance> {
            self.facts.clone()
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }

        fn query_id(&self) -> &str {
            "test"
        }

        async fn evaluate(&self, start: &TypedInstance, path: &SearchPath) -> EvaluatedPath {
            self.evaluated.lock().unwrap().push(path.simplified_hash());
            let mut edges = Vec::new();
            for connection in &path.edges {
                if connection.relationship == Relationship::Provides {
                    self.invocations.fetch_add(1, Ordering::SeqCst);
                    if !self.succeed {
                        edges.push(EvaluatedEdge::failed(connection.clone(), start.clone(), "500"));
                        break;
                    }
                }
                edges.push(EvaluatedEdge::success(connection.clone(), start.clone(), self.answer.clone()));
            }
            EvaluatedPath {
                start: start.clone(),
                edges,
            }
        }
    }

    fn trade_request(schema: &Schema) -> TypedInstance {
        TypedInstance::from_json("TradeRequest", &json!({"clientId": "C1"}), schema, DataSource::Provided).unwrap()
    }

    fn searcher(schema: &Arc<Schema>, start: TypedInstance, target: &str) -> GraphSearcher {
        let builder = Arc::new(GraphBuilder::new(schema.clone(), 10));
        GraphSearcher::new(start, target, builder, SearchConfig::default())
    }

    #[tokio::test]
    async fn test_first_successful_path_wins() {
        let schema = schema();
        let fact = trade_request(&schema);
        let answer = TypedInstance::scalar("ClientJurisdiction", json!("GBP"), DataSource::Provided);
        let env = ScriptedEvaluator::new(vec![fact.clone()], true, answer);

        let outcome = searcher(&schema, fact, "ClientJurisdiction").search(&env).await.unwrap();
        let result = outcome.result.unwrap();
        assert_eq!(result.value.to_raw(), json!("GBP"));
        assert_eq!(outcome.paths_evaluated, 1);
        assert!(outcome.failed_attempts.is_empty());
    }

    #[tokio::test]
    async fn test_failing_operation_is_invoked_once() {
        let schema = schema();
        let fact = trade_request(&schema);
        let answer = TypedInstance::scalar("ClientJurisdiction", json!("GBP"), DataSource::Provided);
        let env = ScriptedEvaluator::new(vec![fact.clone()], false, answer);

        let outcome = searcher(&schema, fact, "ClientJurisdiction").search(&env).await.unwrap();
        assert!(outcome.result.is_none());
        assert_eq!(env.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.failed_attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_equivalent_paths_are_never_evaluated_twice() {
        let schema = schema();
        let node = TypedInstance::from_json(
            "Node",
            &json!({"id": "N1", "parent": {"id": "N0"}}),
            &schema,
            DataSource::Provided,
        )
        .unwrap();
        let answer = TypedInstance::scalar("ClientJurisdiction", json!("GBP"), DataSource::Provided);
        let env = ScriptedEvaluator::new(vec![node.clone()], false, answer);

        // Cyclic schema with an unreachable target terminates
        let outcome = searcher(&schema, node.clone(), "ClientJurisdiction").search(&env).await.unwrap();
        assert!(outcome.result.is_none());
        assert!(outcome.no_path);

        let outcome = searcher(&schema, node, "Node").search(&env).await.unwrap();
        assert!(outcome.result.is_none());
        assert!(outcome.paths_evaluated <= SearchConfig::default().max_search_count);
        let evaluated = env.evaluated.lock().unwrap();
        let distinct: HashSet<_> = evaluated.iter().collect();
        assert_eq!(distinct.len(), evaluated.len());
    }

    #[tokio::test]
    async fn test_cancellation_stops_search() {
        let schema = schema();
        let fact = trade_request(&schema);
        let answer = TypedInstance::scalar("ClientJurisdiction", json!("GBP"), DataSource::Provided);
        let env = ScriptedEvaluator::new(vec![fact.clone()], true, answer);
        env.cancelled.store(true, Ordering::SeqCst);

        let err = searcher(&schema, fact, "ClientJurisdiction").search(&env).await.unwrap_err();
        assert!(matches!(err, QueryError::QueryCancelled { .. }));
        assert_eq!(env.invocations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_select_result_value() {
        let schema = schema();
        let id = TypedInstance::scalar("ClientId", json!("C1"), DataSource::Provided);
        assert!(select_result_value(&schema, "ClientId", &id).is_some());
        assert!(select_result_value(&schema, "String", &id).is_some());
        assert!(select_result_value(&schema, "ClientId[]", &id).is_some());
        assert!(select_result_value(&schema, "ClientJurisdiction", &id).is_none());
    }
}
