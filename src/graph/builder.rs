//! Discovery graph builder
//!
//! The schema-derived connections (types, attributes, operations, parameters
//! and the theoretical instances operations return) depend only on the
//! schema and the excluded operations, so they are cached per exclusion
//! signature. Fact connections are appended per build and the finished
//! graph is cached per (facts, excluded edges).

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{Connection, DiscoveryGraph, Element, Relationship};
use crate::models::{TypedInstance, TypedValue};
use crate::schema::{operation_name, Schema};

/// Connections in insertion order; a repeated (from, to) pair is dropped
#[derive(Debug, Clone, Default)]
struct ConnectionSet {
    connections: Vec<Connection>,
    pairs: HashSet<(Element, Element)>,
}

impl ConnectionSet {
    fn connect(&mut self, from: Element, relationship: Relationship, to: Element) {
        if self.pairs.insert((from.clone(), to.clone())) {
            self.connections.push(Connection::new(from, relationship, to));
        }
    }
}

/// Builds discovery graphs for one schema version
#[derive(Debug)]
pub struct GraphBuilder {
    schema: Arc<Schema>,
    capacity: usize,
    base_cache: Mutex<HashMap<u64, Arc<ConnectionSet>>>,
    graph_cache: Mutex<HashMap<u64, Arc<DiscoveryGraph>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GraphBuilder {
    pub fn new(schema: Arc<Schema>, capacity: usize) -> Self {
        Self {
            schema,
            capacity: capacity.max(1),
            base_cache: Mutex::new(HashMap::new()),
            graph_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Graph of the schema plus `facts`, without excluded operations or edges
    pub fn build(
        &self,
        facts: &[TypedInstance],
        excluded_operations: &BTreeSet<String>,
        excluded_edges: &BTreeSet<Connection>,
    ) -> Arc<DiscoveryGraph> {
        let mut hasher = DefaultHasher::new();
        excluded_operations.hash(&mut hasher);
        excluded_edges.hash(&mut hasher);
        for fact in facts {
            fact.value_hash().hash(&mut hasher);
        }
        let key = hasher.finish();

        if let Some(graph) = lock(&self.graph_cache).get(&key) {
            return graph.clone();
        }

        let mut set = (*self.base_connections(excluded_operations)).clone();
        let mut visited = HashSet::new();
        for fact in facts {
            self.append_fact(&mut set, fact, &mut visited);
        }
        let graph = Arc::new(DiscoveryGraph::from_connections(
            set.connections
                .iter()
                .filter(|c| !excluded_edges.contains(*c)),
        ));
        debug!(
            "Built discovery graph: {} nodes, {} edges ({} facts, {} excluded edges)",
            graph.node_count(),
            graph.edge_count(),
            facts.len(),
            excluded_edges.len()
        );

        let mut cache = lock(&self.graph_cache);
        if cache.len() >= self.capacity {
            cache.clear();
        }
        cache.insert(key, graph.clone());
        graph
    }

    fn base_connections(&self, excluded_operations: &BTreeSet<String>) -> Arc<ConnectionSet> {
        let mut hasher = DefaultHasher::new();
        excluded_operations.hash(&mut hasher);
        let key = hasher.finish();

        if let Some(set) = lock(&self.base_cache).get(&key) {
            return set.clone();
        }

        let mut set = ConnectionSet::default();
        self.append_types(&mut set);
        self.append_services(&mut set, excluded_operations);
        let set = Arc::new(set);

        let mut cache = lock(&self.base_cache);
        if cache.len() >= self.capacity {
            cache.clear();
        }
        cache.insert(key, set.clone());
        set
    }

    // ========== Schema connections ==========

    fn append_types(&self, set: &mut ConnectionSet) {
        for t in self.schema.sorted_types() {
            let type_node = Element::type_node(&t.name);
            for inherited in &t.inherits {
                set.connect(type_node.clone(), Relationship::ExtendsType, Element::type_node(inherited));
            }
            if t.is_closed() {
                continue;
            }
            for (attribute, field) in &t.attributes {
                let member = Element::member(&t.name, attribute);
                set.connect(type_node.clone(), Relationship::HasAttribute, member.clone());
                set.connect(member.clone(), Relationship::IsAttributeOf, type_node.clone());
                set.connect(member, Relationship::IsTypeOf, Element::type_node(&field.type_name));
            }
        }
    }

    fn append_services(&self, set: &mut ConnectionSet, excluded_operations: &BTreeSet<String>) {
        for service in self.schema.services() {
            for operation in &service.operations {
                let qualified = operation_name(&service.name, &operation.name);
                if excluded_operations.contains(&qualified) {
                    continue;
                }
                let operation_node = Element::operation(&qualified);
                for parameter in &operation.parameters {
                    let param_node = Element::parameter(&parameter.type_name);
                    set.connect(operation_node.clone(), Relationship::RequiresParameter, param_node.clone());
                    set.connect(param_node.clone(), Relationship::IsParameterOn, operation_node.clone());

                    // Values found along the way may populate fields of a parameter object
                    if let Ok(param_type) = self.schema.type_named(&parameter.type_name) {
                        if param_type.is_parameter_type() {
                            for field in param_type.attributes.values() {
                                set.connect(
                                    Element::parameter(&field.type_name),
                                    Relationship::IsParameterOn,
                                    param_node.clone(),
                                );
                            }
                        }
                    }
                }
                self.append_provided_instance(set, &operation.return_type, Some(&operation_node));
            }
        }
    }

    /// The theoretical instance of `type_name` an operation returns
    fn append_provided_instance(&self, set: &mut ConnectionSet, type_name: &str, provider: Option<&Element>) {
        let instance = Element::provided_instance(type_name);
        if let Some(provider) = provider {
            set.connect(provider.clone(), Relationship::Provides, instance.clone());
        }
        set.connect(instance.clone(), Relationship::IsInstanceOf, Element::type_node(type_name));
        self.append_can_populate(set, &instance, type_name);
        self.append_instance_attributes(set, &instance, type_name, None);
    }

    fn append_can_populate(&self, set: &mut ConnectionSet, instance: &Element, type_name: &str) {
        set.connect(instance.clone(), Relationship::CanPopulate, Element::parameter(type_name));
        for inherited in self.schema.inheritance_graph(type_name) {
            set.connect(instance.clone(), Relationship::CanPopulate, Element::parameter(&inherited));
        }
    }

    /// Attribute members of an instance. For a known value only its
    /// populated attributes are linked.
    fn append_instance_attributes(
        &self,
        set: &mut ConnectionSet,
        instance: &Element,
        type_name: &str,
        value: Option<&TypedInstance>,
    ) {
        let Ok(t) = self.schema.type_named(type_name) else {
            return;
        };
        if t.is_closed() {
            return;
        }
        for (attribute, field) in &t.attributes {
            if let Some(value) = value {
                match value.attribute(attribute) {
                    Some(attr_value) if !attr_value.is_null() => {}
                    _ => continue,
                }
            }
            let member = Element::provided_instance_member(type_name, attribute);
            set.connect(instance.clone(), Relationship::InstanceHasAttribute, member.clone());
            let member_instance = Element::provided_instance(&field.type_name);
            set.connect(member, Relationship::IsAttributeOf, member_instance.clone());
            set.connect(member_instance.clone(), Relationship::CanPopulate, Element::parameter(&field.type_name));
            set.connect(member_instance, Relationship::IsInstanceOf, Element::type_node(&field.type_name));
        }
    }

    // ========== Fact connections ==========

    /// A known fact links straight to the parameters it can populate. It is
    /// never linked `IsInstanceOf` its type, so one bad value can be
    /// excluded without cutting the type-level graph.
    fn append_fact(&self, set: &mut ConnectionSet, fact: &TypedInstance, visited: &mut HashSet<Element>) {
        let node = Element::instance_of(fact);
        if !visited.insert(node.clone()) || fact.is_null() {
            return;
        }
        self.append_can_populate(set, &node, &fact.type_name);

        let closed = self
            .schema
            .type_named(&fact.type_name)
            .map(|t| t.is_closed())
            .unwrap_or(false);
        if closed {
            return;
        }

        match &fact.value {
            TypedValue::Object(attributes) => {
                self.append_instance_attributes(set, &node, &fact.type_name, Some(fact));
                for attr_value in attributes.values() {
                    self.append_nested_value(set, attr_value, visited);
                }
            }
            TypedValue::Collection(members) => {
                for member in members {
                    set.connect(node.clone(), Relationship::CanArrayMapTo, Element::instance_of(member));
                    self.append_fact(set, member, visited);
                }
            }
            TypedValue::Enum { name, .. } => {
                for (synonym_type, synonym_value) in self.schema.enum_synonyms(&fact.type_name, name) {
                    let Some(synonym) = self.enum_instance(&synonym_type, &synonym_value, fact) else {
                        continue;
                    };
                    set.connect(node.clone(), Relationship::IsSynonymOf, Element::instance_of(&synonym));
                    self.append_fact(set, &synonym, visited);
                }
            }
            TypedValue::Null | TypedValue::Scalar(_) => {}
        }
    }

    /// Attribute values reach the graph through the theoretical instance of
    /// their type; nested objects expose their own populated attributes.
    fn append_nested_value(&self, set: &mut ConnectionSet, value: &TypedInstance, visited: &mut HashSet<Element>) {
        let TypedValue::Object(attributes) = &value.value else {
            return;
        };
        let instance = Element::provided_instance(&value.type_name);
        if !visited.insert(Element::instance_of(value)) {
            return;
        }
        self.append_instance_attributes(set, &instance, &value.type_name, Some(value));
        for attr_value in attributes.values() {
            self.append_nested_value(set, attr_value, visited);
        }
    }

    fn enum_instance(&self, type_name: &str, value_name: &str, like: &TypedInstance) -> Option<TypedInstance> {
        let t = self.schema.type_named(type_name).ok()?;
        let value = t.enum_values.iter().find(|v| v.name == value_name)?;
        Some(TypedInstance {
            type_name: type_name.to_string(),
            value: TypedValue::Enum {
                name: value.name.clone(),
                value: value.raw_value(),
            },
            source: like.source.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DataSource;
    use crate::schema::{Field, Modifier, Operation, Parameter, Service, Type};
    use serde_json::json;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(
            vec![
                Type::new("ClientId").inheriting("String"),
                Type::new("ClientJurisdiction").inheriting("String"),
                Type::new("TradeRequest").with_attribute("clientId", Field::of("ClientId")),
                Type::new("Client")
                    .with_attribute("id", Field::of("ClientId"))
                    .with_attribute("jurisdiction", Field::of("ClientJurisdiction")),
                Type::new("Secret")
                    .with_attribute("id", Field::of("ClientId"))
                    .with_modifier(Modifier::Closed),
            ],
            vec![Service::new("ClientService").with_operation(
                Operation::new("getClient", "Client").with_parameter(Parameter::of("ClientId")),
            )],
        ))
    }

    fn trade_request(schema: &Schema) -> TypedInstance {
        TypedInstance::from_json("TradeRequest", &json!({"clientId": "C1"}), schema, DataSource::Provided).unwrap()
    }

    #[test]
    fn test_schema_connections() {
        let schema = schema();
        let builder = GraphBuilder::new(schema.clone(), 10);
        let graph = builder.build(&[], &BTreeSet::new(), &BTreeSet::new());

        let op = Element::operation("ClientService.getClient");
        assert_eq!(
            graph.relationship(&Element::parameter("ClientId"), &op),
            Some(Relationship::IsParameterOn)
        );
        assert_eq!(
            graph.relationship(&op, &Element::provided_instance("Client")),
            Some(Relationship::Provides)
        );
        assert_eq!(
            graph.relationship(
                &Element::provided_instance("Client"),
                &Element::provided_instance_member("Client", "jurisdiction")
            ),
            Some(Relationship::InstanceHasAttribute)
        );
        assert_eq!(
            graph.relationship(&Element::type_node("ClientId"), &Element::type_node("String")),
            Some(Relationship::ExtendsType)
        );
        // Closed types expose no attributes
        assert!(!graph.contains(&Element::member("Secret", "id")));
    }

    #[test]
    fn test_fact_connections_skip_is_instance_of() {
        let schema = schema();
        let builder = GraphBuilder::new(schema.clone(), 10);
        let fact = trade_request(&schema);
        let graph = builder.build(&[fact.clone()], &BTreeSet::new(), &BTreeSet::new());

        let node = Element::instance_of(&fact);
        let outgoing = graph.connections_from(&node);
        assert!(outgoing.iter().all(|c| c.relationship != Relationship::IsInstanceOf));
        assert!(outgoing
            .iter()
            .any(|c| c.relationship == Relationship::InstanceHasAttribute
                && c.to == Element::provided_instance_member("TradeRequest", "clientId")));
        assert!(outgoing
            .iter()
            .any(|c| c.relationship == Relationship::CanPopulate && c.to == Element::parameter("TradeRequest")));
    }

    #[test]
    fn test_scenario_path_exists() {
        let schema = schema();
        let builder = GraphBuilder::new(schema.clone(), 10);
        let fact = trade_request(&schema);
        let graph = builder.build(&[fact.clone()], &BTreeSet::new(), &BTreeSet::new());

        let path = graph
            .find_path(&Element::instance_of(&fact), &Element::type_node("ClientJurisdiction"), |_| 1.0)
            .unwrap();
        let relationships: Vec<_> = path.edges.iter().map(|e| e.relationship).collect();
        assert!(relationships.contains(&Relationship::Provides));
        assert_eq!(path.edges.first().unwrap().relationship, Relationship::InstanceHasAttribute);
    }

    #[test]
    fn test_excluded_operations_and_edges() {
        let schema = schema();
        let builder = GraphBuilder::new(schema.clone(), 10);
        let op = Element::operation("ClientService.getClient");

        let excluded_ops = BTreeSet::from(["ClientService.getClient".to_string()]);
        let graph = builder.build(&[], &excluded_ops, &BTreeSet::new());
        assert!(!graph.contains(&op));

        let edge = Connection::new(Element::parameter("ClientId"), Relationship::IsParameterOn, op.clone());
        let graph = builder.build(&[], &BTreeSet::new(), &BTreeSet::from([edge]));
        assert!(graph.contains(&op));
        assert!(graph.relationship(&Element::parameter("ClientId"), &op).is_none());
    }

    #[test]
    fn test_graphs_are_cached() {
        let schema = schema();
        let builder = GraphBuilder::new(schema.clone(), 10);
        let facts = vec![trade_request(&schema)];
        let first = builder.build(&facts, &BTreeSet::new(), &BTreeSet::new());
        let second = builder.build(&facts, &BTreeSet::new(), &BTreeSet::new());
        assert!(Arc::ptr_eq(&first, &second));
    }
}
