//! Path bookkeeping for one search session
//!
//! Tracks which paths were proposed, evaluated or ignored, prices edges for
//! the next proposal, and decides which edge to cut when the same path comes
//! back.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use super::edges::{EvaluatedEdge, EvaluatedPath};
use super::{Connection, Element, ElementKind, Relationship, SearchPath};
use crate::config::SearchConfig;

/// A material step of a path. Two paths with the same steps would do the
/// same work, however they are routed through the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SimplifiedStep {
    Start(Element),
    /// Read an attribute (`Type/attr`)
    Navigate(String),
    /// Step into a collection member
    MapMember(Element),
    /// Call an operation
    Invoke(String),
    /// Use a value as a parameter of this type
    Populate(String),
}

impl SimplifiedStep {
    pub fn from_connection(connection: &Connection) -> Option<Self> {
        match connection.relationship {
            Relationship::HasAttribute | Relationship::InstanceHasAttribute => {
                Some(SimplifiedStep::Navigate(connection.to.value.clone()))
            }
            Relationship::CanArrayMapTo => Some(SimplifiedStep::MapMember(connection.to.clone())),
            Relationship::Provides | Relationship::CanConstructQuery => {
                Some(SimplifiedStep::Invoke(connection.from.value.clone()))
            }
            Relationship::CanPopulate => connection
                .to
                .parameter_type()
                .map(|t| SimplifiedStep::Populate(t.to_string())),
            Relationship::IsAttributeOf
            | Relationship::IsTypeOf
            | Relationship::RequiresParameter
            | Relationship::IsParameterOn
            | Relationship::IsInstanceOf
            | Relationship::ExtendsType
            | Relationship::IsSynonymOf => None,
        }
    }
}

/// Paths seen by one search session, and the edge costs they imply
#[derive(Debug)]
pub struct EvaluatedPathSet {
    initial_cost: f64,
    penalty_cost: f64,
    proposed: HashSet<u64>,
    simplified: HashMap<u64, SearchPath>,
    evaluated: HashMap<u64, EvaluatedPath>,
    transition_counts: HashMap<Connection, usize>,
    penalties: HashMap<Connection, f64>,
}

impl EvaluatedPathSet {
    pub fn new(config: &SearchConfig) -> Self {
        Self {
            initial_cost: config.initial_edge_cost,
            penalty_cost: config.penalty_cost,
            proposed: HashSet::new(),
            simplified: HashMap::new(),
            evaluated: HashMap::new(),
            transition_counts: HashMap::new(),
            penalties: HashMap::new(),
        }
    }

    /// Exactly this path was proposed before
    pub fn contains_path(&self, path: &SearchPath) -> bool {
        self.proposed.contains(&path.exact_hash())
    }

    /// A path with the same material steps was proposed before
    pub fn contains_equivalent_path(&self, path: &SearchPath) -> bool {
        self.simplified.contains_key(&path.simplified_hash())
    }

    pub fn equivalent_path(&self, path: &SearchPath) -> Option<&SearchPath> {
        self.simplified.get(&path.simplified_hash())
    }

    pub fn add_proposed_path(&mut self, path: &SearchPath) -> u64 {
        let hash = path.exact_hash();
        self.proposed.insert(hash);
        self.simplified
            .entry(path.simplified_hash())
            .or_insert_with(|| path.clone());
        self.update_transition_counts(path);
        hash
    }

    /// An equivalent path that was skipped still makes its edges dearer
    pub fn add_ignored_path(&mut self, path: &SearchPath) {
        self.update_transition_counts(path);
    }

    pub fn add_evaluated_path(&mut self, path_hash: u64, evaluated: EvaluatedPath) {
        for edge in penalised_edges(&evaluated) {
            trace!("Penalising {}", edge);
            let cost = self.penalties.entry(edge).or_insert(self.penalty_cost);
            *cost = cost.max(self.penalty_cost);
        }
        self.evaluated.insert(path_hash, evaluated);
    }

    pub fn evaluated_path(&self, path_hash: u64) -> Option<&EvaluatedPath> {
        self.evaluated.get(&path_hash)
    }

    pub fn evaluated_count(&self) -> usize {
        self.evaluated.len()
    }

    /// Price of walking `connection` on the next proposal
    pub fn cost(&self, connection: &Connection) -> f64 {
        if self.evaluated.is_empty() {
            return self.initial_cost;
        }
        if let Some(penalty) = self.penalties.get(connection) {
            return *penalty;
        }
        (self.transition_counts.get(connection).copied().unwrap_or(0) + 1) as f64
    }

    fn update_transition_counts(&mut self, path: &SearchPath) {
        for edge in &path.edges {
            *self.transition_counts.entry(edge.clone()).or_insert(0) += 1;
        }
    }
}

/// After a failed operation, penalise the operation edge and the edge that
/// supplied its input, so another input can be tried.
fn penalised_edges(evaluated: &EvaluatedPath) -> Vec<Connection> {
    let Some(failed_index) = evaluated
        .edges
        .iter()
        .position(|e| !e.is_success() && e.connection.from.kind == ElementKind::Operation)
    else {
        return Vec::new();
    };
    let mut edges = vec![evaluated.edges[failed_index].connection.clone()];
    if let Some(input) = evaluated.edges[..failed_index]
        .iter()
        .rev()
        .find(|e| e.connection.from.kind == ElementKind::ProvidedInstanceMember)
    {
        edges.push(input.connection.clone());
    }
    edges
}

/// Picks the edge to cut when a path is proposed a second time
pub struct PathExclusionCalculator;

impl PathExclusionCalculator {
    /// The `IsParameterOn` edge feeding the implicated operation, which is
    /// the first operation on the path. Paths without operations lose their
    /// last evaluated edge.
    pub fn edges_to_exclude(evaluated: &EvaluatedPath) -> Vec<Connection> {
        let operations: Vec<(usize, &EvaluatedEdge)> = evaluated
            .edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.connection.from.kind == ElementKind::Operation)
            .collect();

        let implicated = match operations.as_slice() {
            [] => None,
            [(index, _)] => Some(*index),
            many => many.iter().map(|(i, _)| *i).min(),
        };

        let Some(operation_index) = implicated else {
            return evaluated
                .edges
                .last()
                .map(|e| vec![e.connection.clone()])
                .unwrap_or_default();
        };

        evaluated.edges[..=operation_index]
            .iter()
            .rev()
            .find(|e| {
                e.connection.from.kind == ElementKind::Parameter
                    && e.connection.relationship == Relationship::IsParameterOn
            })
            .map(|e| vec![e.connection.clone()])
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataSource, TypedInstance};
    use serde_json::json;

    fn value(type_name: &str) -> TypedInstance {
        TypedInstance::scalar(type_name, json!("x"), DataSource::Provided)
    }

    fn scenario_path() -> SearchPath {
        let start = Element::provided_instance("TradeRequest");
        let op = Element::operation("ClientService.getClient");
        SearchPath {
            start: start.clone(),
            edges: vec![
                Connection::new(
                    start,
                    Relationship::InstanceHasAttribute,
                    Element::provided_instance_member("TradeRequest", "clientId"),
                ),
                Connection::new(
                    Element::provided_instance_member("TradeRequest", "clientId"),
                    Relationship::IsAttributeOf,
                    Element::provided_instance("ClientId"),
                ),
                Connection::new(
                    Element::provided_instance("ClientId"),
                    Relationship::CanPopulate,
                    Element::parameter("ClientId"),
                ),
                Connection::new(Element::parameter("ClientId"), Relationship::IsParameterOn, op.clone()),
                Connection::new(op, Relationship::Provides, Element::provided_instance("Client")),
            ],
            cost: 5.0,
        }
    }

    fn evaluate(path: &SearchPath, fail_at: Option<usize>) -> EvaluatedPath {
        let mut edges = Vec::new();
        for (i, connection) in path.edges.iter().enumerate() {
            let edge = if Some(i) == fail_at {
                EvaluatedEdge::failed(connection.clone(), value("Prev"), "boom")
            } else {
                EvaluatedEdge::success(connection.clone(), value("Prev"), value("Next"))
            };
            let failed = !edge.is_success();
            edges.push(edge);
            if failed {
                break;
            }
        }
        EvaluatedPath {
            start: value("TradeRequest"),
            edges,
        }
    }

    #[test]
    fn test_simplified_steps_drop_pass_through_edges() {
        let steps = scenario_path().simplified();
        assert_eq!(
            steps,
            vec![
                SimplifiedStep::Start(Element::provided_instance("TradeRequest")),
                SimplifiedStep::Navigate("TradeRequest/clientId".to_string()),
                SimplifiedStep::Populate("ClientId".to_string()),
                SimplifiedStep::Invoke("ClientService.getClient".to_string()),
            ]
        );
    }

    #[test]
    fn test_costs_before_and_after_evaluation() {
        let config = SearchConfig::default();
        let mut set = EvaluatedPathSet::new(&config);
        let path = scenario_path();
        assert_eq!(set.cost(&path.edges[0]), 1.0);

        let hash = set.add_proposed_path(&path);
        assert!(set.contains_path(&path));
        assert!(set.contains_equivalent_path(&path));
        // Nothing evaluated yet: every edge is equal
        assert_eq!(set.cost(&path.edges[0]), 1.0);

        set.add_evaluated_path(hash, evaluate(&path, Some(4)));
        assert_eq!(set.cost(&path.edges[4]), 100.0);
        assert_eq!(set.cost(&path.edges[1]), 100.0);
        assert_eq!(set.cost(&path.edges[0]), 2.0);

        set.add_ignored_path(&path);
        assert_eq!(set.cost(&path.edges[0]), 3.0);
    }

    #[test]
    fn test_exclusion_targets_is_parameter_on() {
        let path = scenario_path();
        let excluded = PathExclusionCalculator::edges_to_exclude(&evaluate(&path, Some(4)));
        assert_eq!(excluded, vec![path.edges[3].clone()]);
    }

    #[test]
    fn test_exclusion_without_operation_cuts_failed_edge() {
        let path = scenario_path();
        let excluded = PathExclusionCalculator::edges_to_exclude(&evaluate(&path, Some(0)));
        assert_eq!(excluded, vec![path.edges[0].clone()]);
    }
}
