//! Discovery Graph
//!
//! Directed graph of types, attributes, operations, parameters and provided
//! instances, connected by typed [`Relationship`] edges. Nodes live in a
//! petgraph arena and are found through a HashMap index, so cyclic schemas
//! never produce owning cycles.
//!
//! - `builder`: builds graphs from a schema plus the current facts
//! - `paths`: path bookkeeping, costs, penalties and exclusions
//! - `searcher`: the retrying least-cost path search
//! - `edges`: evaluators that walk a path and compute values

pub mod builder;
pub mod edges;
pub mod paths;
pub mod searcher;

pub use builder::GraphBuilder;
pub use edges::{evaluator_for, EdgeEvaluator, EvaluatableEdge, EvaluatedEdge, EvaluatedPath, ParameterFactory};
pub use paths::{EvaluatedPathSet, PathExclusionCalculator, SimplifiedStep};
pub use searcher::{GraphSearcher, PathEvaluator, SearchOutcome, SearchResult};

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use petgraph::algo::astar;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::models::TypedInstance;

/// Prefix of parameter node values
pub const PARAM_PREFIX: &str = "param/";

/// Kind of a graph node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    Type,
    Member,
    Operation,
    Parameter,
    ProvidedInstance,
    ProvidedInstanceMember,
}

/// A node in the discovery graph
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Element {
    pub kind: ElementKind,
    /// Type name, attribute fqn (`Type/attr`), operation or parameter name
    pub value: String,
    /// Discriminates a known fact from the theoretical instance of its type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<u64>,
}

impl Element {
    fn new(kind: ElementKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            instance: None,
        }
    }

    pub fn type_node(type_name: &str) -> Self {
        Self::new(ElementKind::Type, type_name)
    }

    pub fn member(type_name: &str, attribute: &str) -> Self {
        Self::new(ElementKind::Member, attribute_fqn(type_name, attribute))
    }

    pub fn parameter(type_name: &str) -> Self {
        Self::new(ElementKind::Parameter, format!("{}{}", PARAM_PREFIX, type_name))
    }

    pub fn operation(qualified_name: &str) -> Self {
        Self::new(ElementKind::Operation, qualified_name)
    }

    /// A value of `type_name` that some operation may return
    pub fn provided_instance(type_name: &str) -> Self {
        Self::new(ElementKind::ProvidedInstance, type_name)
    }

    /// A concrete known value
    pub fn instance_of(fact: &TypedInstance) -> Self {
        Self {
            kind: ElementKind::ProvidedInstance,
            value: fact.type_name.clone(),
            instance: Some(fact.value_hash()),
        }
    }

    pub fn provided_instance_member(type_name: &str, attribute: &str) -> Self {
        Self::new(ElementKind::ProvidedInstanceMember, attribute_fqn(type_name, attribute))
    }

    /// Type named by a parameter node
    pub fn parameter_type(&self) -> Option<&str> {
        match self.kind {
            ElementKind::Parameter => self.value.strip_prefix(PARAM_PREFIX),
            _ => None,
        }
    }

    /// `(type, attribute)` of a member or provided-instance member
    pub fn attribute(&self) -> Option<(&str, &str)> {
        match self.kind {
            ElementKind::Member | ElementKind::ProvidedInstanceMember => self.value.rsplit_once('/'),
            _ => None,
        }
    }

    pub fn is_known_instance(&self) -> bool {
        self.kind == ElementKind::ProvidedInstance && self.instance.is_some()
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instance {
            Some(hash) => write!(f, "{:?}({}@{})", self.kind, self.value, hash),
            None => write!(f, "{:?}({})", self.kind, self.value),
        }
    }
}

/// `Type/attribute`
pub fn attribute_fqn(type_name: &str, attribute: &str) -> String {
    format!("{}/{}", type_name, attribute)
}

/// Typed edge label
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Relationship {
    HasAttribute,
    IsAttributeOf,
    IsTypeOf,
    InstanceHasAttribute,
    RequiresParameter,
    IsParameterOn,
    Provides,
    IsInstanceOf,
    CanPopulate,
    ExtendsType,
    IsSynonymOf,
    CanArrayMapTo,
    CanConstructQuery,
}

impl Relationship {
    /// Edges that carry the previous value forward unchanged
    pub fn is_pass_through(&self) -> bool {
        matches!(
            self,
            Relationship::IsAttributeOf
                | Relationship::IsTypeOf
                | Relationship::IsParameterOn
                | Relationship::IsInstanceOf
                | Relationship::CanPopulate
                | Relationship::ExtendsType
                | Relationship::IsSynonymOf
                | Relationship::CanConstructQuery
        )
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Relationship::HasAttribute => "hasAttribute",
            Relationship::IsAttributeOf => "isAttributeOf",
            Relationship::IsTypeOf => "isTypeOf",
            Relationship::InstanceHasAttribute => "instanceHasAttribute",
            Relationship::RequiresParameter => "requiresParameter",
            Relationship::IsParameterOn => "isParameterOn",
            Relationship::Provides => "provides",
            Relationship::IsInstanceOf => "isInstanceOf",
            Relationship::CanPopulate => "canPopulate",
            Relationship::ExtendsType => "extendsType",
            Relationship::IsSynonymOf => "isSynonymOf",
            Relationship::CanArrayMapTo => "canArrayMapTo",
            Relationship::CanConstructQuery => "canConstructQuery",
        };
        f.write_str(name)
    }
}

/// A directed, labelled edge
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub from: Element,
    pub relationship: Relationship,
    pub to: Element,
}

impl Connection {
    pub fn new(from: Element, relationship: Relationship, to: Element) -> Self {
        Self {
            from,
            relationship,
            to,
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.from, self.relationship, self.to)
    }
}

/// A proposed route from a start node to a target node
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPath {
    pub start: Element,
    pub edges: Vec<Connection>,
    pub cost: f64,
}

impl SearchPath {
    /// Hash of every node and edge on the path, ignoring cost
    pub fn exact_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.start.hash(&mut hasher);
        self.edges.hash(&mut hasher);
        hasher.finish()
    }

    /// Material steps only: start, navigation, invocation and population
    pub fn simplified(&self) -> Vec<SimplifiedStep> {
        std::iter::once(SimplifiedStep::Start(self.start.clone()))
            .chain(self.edges.iter().filter_map(SimplifiedStep::from_connection))
            .collect()
    }

    pub fn simplified_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.simplified().hash(&mut hasher);
        hasher.finish()
    }

    pub fn describe(&self) -> String {
        let mut out = self.start.to_string();
        for edge in &self.edges {
            out.push_str(&format!(" -[{}]-> {}", edge.relationship, edge.to));
        }
        out
    }
}

/// A built discovery graph
#[derive(Debug, Default)]
pub struct DiscoveryGraph {
    pub(crate) graph: DiGraph<Element, Relationship>,
    pub(crate) index: HashMap<Element, NodeIndex>,
}

impl DiscoveryGraph {
    /// Build from connections; a repeated (from, to) pair keeps its first edge
    pub fn from_connections<'a>(connections: impl IntoIterator<Item = &'a Connection>) -> Self {
        let mut graph = DiscoveryGraph::default();
        for connection in connections {
            let from = graph.node_or_insert(&connection.from);
            let to = graph.node_or_insert(&connection.to);
            if graph.graph.find_edge(from, to).is_none() {
                graph.graph.add_edge(from, to, connection.relationship);
            }
        }
        graph
    }

    fn node_or_insert(&mut self, element: &Element) -> NodeIndex {
        if let Some(idx) = self.index.get(element) {
            return *idx;
        }
        let idx = self.graph.add_node(element.clone());
        self.index.insert(element.clone(), idx);
        idx
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, element: &Element) -> bool {
        self.index.contains_key(element)
    }

    pub fn relationship(&self, from: &Element, to: &Element) -> Option<Relationship> {
        let from = self.index.get(from)?;
        let to = self.index.get(to)?;
        let edge = self.graph.find_edge(*from, *to)?;
        self.graph.edge_weight(edge).copied()
    }

    /// Outgoing edges of a node
    pub fn connections_from(&self, element: &Element) -> Vec<Connection> {
        let Some(idx) = self.index.get(element) else {
            return Vec::new();
        };
        self.graph
            .edges(*idx)
            .map(|e| {
                Connection::new(
                    self.graph[e.source()].clone(),
                    *e.weight(),
                    self.graph[e.target()].clone(),
                )
            })
            .collect()
    }

    /// Least-cost path from `start` to `target`
    pub fn find_path(
        &self,
        start: &Element,
        target: &Element,
        cost: impl Fn(&Connection) -> f64,
    ) -> Option<SearchPath> {
        let start_idx = *self.index.get(start)?;
        let target_idx = *self.index.get(target)?;
        if start_idx == target_idx {
            return None;
        }
        let (total, nodes) = astar(
            &self.graph,
            start_idx,
            |n| n == target_idx,
            |e| {
                cost(&Connection::new(
                    self.graph[e.source()].clone(),
                    *e.weight(),
                    self.graph[e.target()].clone(),
                ))
            },
            |_| 0.0,
        )?;
        let edges = nodes
            .windows(2)
            .filter_map(|pair| {
                let edge = self.graph.find_edge(pair[0], pair[1])?;
                Some(Connection::new(
                    self.graph[pair[0]].clone(),
                    self.graph[edge],
                    self.graph[pair[1]].clone(),
                ))
            })
            .collect();
        Some(SearchPath {
            start: start.clone(),
            edges,
            cost: total,
        })
    }

    /// Graphviz DOT rendering
    pub fn to_dot(&self) -> String {
        let mut output = String::new();

        output.push_str("digraph DiscoveryGraph {\n");
        output.push_str("  rankdir=LR;\n");
        output.push_str("  node [shape=box, style=\"filled,rounded\", fontname=\"Helvetica\", fontsize=10];\n");
        output.push_str("  edge [fontname=\"Helvetica\", fontsize=8, fontcolor=\"#808080\"];\n");
        output.push('\n');

        let color_map = [
            (ElementKind::Type, "#00BCD4"),
            (ElementKind::Member, "#B2EBF2"),
            (ElementKind::Operation, "#F44336"),
            (ElementKind::Parameter, "#FF9800"),
            (ElementKind::ProvidedInstance, "#4CAF50"),
            (ElementKind::ProvidedInstanceMember, "#C8E6C9"),
        ];

        let mut nodes: Vec<_> = self.graph.node_indices().collect();
        nodes.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        for idx in nodes {
            let element = &self.graph[idx];
            let color = color_map
                .iter()
                .find(|(kind, _)| *kind == element.kind)
                .map(|(_, color)| *color)
                .unwrap_or("#9E9E9E");
            output.push_str(&format!(
                "  \"n{}\" [label=\"{}\", fillcolor=\"{}\"];\n",
                idx.index(),
                element.to_string().replace('"', "'"),
                color
            ));
        }

        output.push('\n');

        for edge in self.graph.edge_references() {
            output.push_str(&format!(
                "  \"n{}\" -> \"n{}\" [label=\"{}\"];\n",
                edge.source().index(),
                edge.target().index(),
                edge.weight()
            ));
        }

        output.push_str("}\n");
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DataSource;
    use serde_json::json;

    fn chain() -> Vec<Connection> {
        vec![
            Connection::new(Element::type_node("A"), Relationship::HasAttribute, Element::member("A", "b")),
            Connection::new(Element::member("A", "b"), Relationship::IsTypeOf, Element::type_node("B")),
            Connection::new(Element::type_node("A"), Relationship::ExtendsType, Element::type_node("B")),
        ]
    }

    #[test]
    fn test_duplicate_pair_keeps_first_edge() {
        let mut connections = chain();
        connections.push(Connection::new(
            Element::type_node("A"),
            Relationship::CanPopulate,
            Element::member("A", "b"),
        ));
        let graph = DiscoveryGraph::from_connections(&connections);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 3);
        assert_eq!(
            graph.relationship(&Element::type_node("A"), &Element::member("A", "b")),
            Some(Relationship::HasAttribute)
        );
    }

    #[test]
    fn test_find_path_uses_cost() {
        let graph = DiscoveryGraph::from_connections(&chain());
        let direct = graph
            .find_path(&Element::type_node("A"), &Element::type_node("B"), |_| 1.0)
            .unwrap();
        assert_eq!(direct.edges.len(), 1);
        assert_eq!(direct.edges[0].relationship, Relationship::ExtendsType);

        let via_member = graph
            .find_path(&Element::type_node("A"), &Element::type_node("B"), |c| {
                if c.relationship == Relationship::ExtendsType {
                    10.0
                } else {
                    1.0
                }
            })
            .unwrap();
        assert_eq!(via_member.edges.len(), 2);
        assert_eq!(via_member.cost, 2.0);
        assert_ne!(direct.exact_hash(), via_member.exact_hash());
    }

    #[test]
    fn test_missing_nodes_have_no_path() {
        let graph = DiscoveryGraph::from_connections(&chain());
        assert!(graph
            .find_path(&Element::type_node("B"), &Element::type_node("A"), |_| 1.0)
            .is_none());
        assert!(graph
            .find_path(&Element::type_node("Z"), &Element::type_node("A"), |_| 1.0)
            .is_none());
    }

    #[test]
    fn test_element_helpers() {
        let fact = TypedInstance::scalar("ClientId", json!("C1"), DataSource::Provided);
        let element = Element::instance_of(&fact);
        assert!(element.is_known_instance());
        assert_eq!(element, Element::instance_of(&fact.clone().with_source(DataSource::MixedSources)));
        assert!(!Element::provided_instance("ClientId").is_known_instance());
        assert_eq!(Element::parameter("ClientId").parameter_type(), Some("ClientId"));
        assert_eq!(
            Element::provided_instance_member("Client", "id").attribute(),
            Some(("Client", "id"))
        );
    }

    #[test]
    fn test_to_dot() {
        let dot = DiscoveryGraph::from_connections(&chain()).to_dot();
        assert!(dot.starts_with("digraph DiscoveryGraph {"));
        assert!(dot.contains("label=\"extendsType\""));
    }
}
