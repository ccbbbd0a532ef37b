//! Edge Evaluators
//!
//! Walking a proposed path means applying one evaluator per edge, in order,
//! and stopping at the first failure. Most relationships only exist for
//! connectivity and carry the previous value through unchanged; attribute
//! navigation reads a value off an object, and `Provides` calls the
//! operation.
//!
//! Evaluators never raise: remote or lookup failures become a failed
//! [`EvaluatedEdge`] whose result is a typed null carrying the provenance of
//! the failure, so the searcher can record it and propose another path.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use super::searcher::PathEvaluator;
use super::{Connection, Relationship, SearchPath};
use crate::error::{QueryError, Result};
use crate::facts::{FactDiscoveryStrategy, FactPredicate, FactSearch};
use crate::invocation::invoke_operation;
use crate::models::{DataSource, OperationParam, TypedInstance};
use crate::query::context::QueryContext;
use crate::query::{InvocationConstraints, QuerySpecNode};
use crate::schema::{Operation, Parameter, Schema, Type};

// ============================================================================
// Evaluated edges and paths
// ============================================================================

/// An edge about to be walked, with the value that arrived at its source
#[derive(Debug, Clone)]
pub struct EvaluatableEdge {
    pub previous_value: TypedInstance,
    pub connection: Connection,
}

/// The recorded outcome of walking one edge
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedEdge {
    pub connection: Connection,
    pub previous_value: TypedInstance,
    pub result: TypedInstance,
    pub error: Option<String>,
}

impl EvaluatedEdge {
    pub fn success(connection: Connection, previous_value: TypedInstance, result: TypedInstance) -> Self {
        Self {
            connection,
            previous_value,
            result,
            error: None,
        }
    }

    /// A failure with no value to show for it
    pub fn failed(connection: Connection, previous_value: TypedInstance, error: impl Into<String>) -> Self {
        let error = error.into();
        let result = TypedInstance::null(
            previous_value.type_name.clone(),
            DataSource::FailedEvaluation { message: error.clone() },
        );
        Self::failed_with(connection, previous_value, result, error)
    }

    /// A failure whose typed null records what was tried
    pub fn failed_with(
        connection: Connection,
        previous_value: TypedInstance,
        result: TypedInstance,
        error: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            previous_value,
            result,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One walk along a proposed path, up to and including the first failure
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedPath {
    pub start: TypedInstance,
    pub edges: Vec<EvaluatedEdge>,
}

impl EvaluatedPath {
    pub fn is_success(&self) -> bool {
        self.edges.iter().all(EvaluatedEdge::is_success)
    }

    /// Value produced by the last walked edge
    pub fn result_value(&self) -> &TypedInstance {
        self.edges.last().map(|e| &e.result).unwrap_or(&self.start)
    }

    pub fn failed_edge(&self) -> Option<&EvaluatedEdge> {
        self.edges.iter().find(|e| !e.is_success())
    }

    /// Values returned by operations along the path
    pub fn operation_results(&self) -> impl Iterator<Item = &TypedInstance> {
        self.edges
            .iter()
            .filter(|e| e.is_success() && e.connection.relationship == Relationship::Provides)
            .map(|e| &e.result)
    }
}

// ============================================================================
// Evaluator dispatch
// ============================================================================

/// Computes the value at the far end of one edge
#[async_trait]
pub trait EdgeEvaluator: Send + Sync {
    async fn evaluate(&self, edge: EvaluatableEdge, ctx: &Arc<QueryContext>) -> EvaluatedEdge;
}

/// The evaluator for a relationship
pub fn evaluator_for(relationship: Relationship) -> &'static dyn EdgeEvaluator {
    match relationship {
        Relationship::IsAttributeOf
        | Relationship::IsTypeOf
        | Relationship::IsParameterOn
        | Relationship::IsInstanceOf
        | Relationship::CanPopulate
        | Relationship::ExtendsType
        | Relationship::IsSynonymOf
        | Relationship::CanConstructQuery => &PassThroughEvaluator,
        Relationship::RequiresParameter => &RequiresParameterEvaluator,
        Relationship::HasAttribute | Relationship::InstanceHasAttribute => &AttributeEvaluator,
        Relationship::CanArrayMapTo => &ArrayMappingEvaluator,
        Relationship::Provides => &OperationInvocationEvaluator,
    }
}

#[async_trait]
impl PathEvaluator for Arc<QueryContext> {
    fn facts(&self) -> Vec<TypedInstance> {
        QueryContext::facts(self)
    }

    fn is_cancelled(&self) -> bool {
        self.is_cancel_requested()
    }

    fn query_id(&self) -> &str {
        QueryContext::query_id(self)
    }

    async fn evaluate(&self, start: &TypedInstance, path: &SearchPath) -> EvaluatedPath {
        let mut evaluated = EvaluatedPath {
            start: start.clone(),
            edges: Vec::with_capacity(path.edges.len()),
        };
        let mut previous = start.clone();
        for connection in &path.edges {
            let edge = EvaluatableEdge {
                previous_value: previous.clone(),
                connection: connection.clone(),
            };
            let result = evaluator_for(connection.relationship).evaluate(edge, self).await;
            debug!(
                "[{}] {} => {}{}",
                self.query_id(),
                connection,
                result.result,
                result.error.as_deref().map(|e| format!(" (failed: {})", e)).unwrap_or_default()
            );
            let failed = !result.is_success();
            previous = result.result.clone();
            evaluated.edges.push(result);
            if failed {
                break;
            }
        }
        evaluated
    }
}

// ============================================================================
// Evaluators
// ============================================================================

/// Connectivity only: the previous value carries through
struct PassThroughEvaluator;

#[async_trait]
impl EdgeEvaluator for PassThroughEvaluator {
    async fn evaluate(&self, edge: EvaluatableEdge, _ctx: &Arc<QueryContext>) -> EvaluatedEdge {
        let value = edge.previous_value.clone();
        EvaluatedEdge::success(edge.connection, edge.previous_value, value)
    }
}

/// Resolves the parameter an operation needs
struct RequiresParameterEvaluator;

#[async_trait]
impl EdgeEvaluator for RequiresParameterEvaluator {
    async fn evaluate(&self, edge: EvaluatableEdge, ctx: &Arc<QueryContext>) -> EvaluatedEdge {
        let Some(param_type) = edge.connection.to.parameter_type().map(str::to_string) else {
            return EvaluatedEdge::failed(edge.connection, edge.previous_value, "Edge does not lead to a parameter");
        };
        if !edge.previous_value.is_null() && ctx.schema().is_assignable(&edge.previous_value.type_name, &param_type) {
            let value = edge.previous_value.clone();
            return EvaluatedEdge::success(edge.connection, edge.previous_value, value);
        }
        let operation = edge.connection.from.value.clone();
        match ParameterFactory::discover(&param_type, ctx, Some(&operation)).await {
            Ok(value) => EvaluatedEdge::success(edge.connection, edge.previous_value, value),
            Err(e) => EvaluatedEdge::failed(edge.connection, edge.previous_value, e.to_string()),
        }
    }
}

/// Reads `Type/attr` off the previous object value
struct AttributeEvaluator;

#[async_trait]
impl EdgeEvaluator for AttributeEvaluator {
    async fn evaluate(&self, edge: EvaluatableEdge, _ctx: &Arc<QueryContext>) -> EvaluatedEdge {
        let Some((type_name, attribute)) = edge.connection.to.attribute() else {
            return EvaluatedEdge::failed(edge.connection, edge.previous_value, "Edge does not lead to an attribute");
        };
        let (type_name, attribute) = (type_name.to_string(), attribute.to_string());
        if edge.previous_value.is_null() {
            return EvaluatedEdge::failed(
                edge.connection,
                edge.previous_value,
                format!("Cannot read {} from a null {}", attribute, type_name),
            );
        }
        match edge.previous_value.attribute(&attribute) {
            Some(value) if !value.is_null() => {
                let value = value.clone();
                EvaluatedEdge::success(edge.connection, edge.previous_value, value)
            }
            _ => EvaluatedEdge::failed(
                edge.connection,
                edge.previous_value,
                format!("Attribute {} on type {} evaluated to null", attribute, type_name),
            ),
        }
    }
}

/// Steps from a collection to the member the edge points at
struct ArrayMappingEvaluator;

#[async_trait]
impl EdgeEvaluator for ArrayMappingEvaluator {
    async fn evaluate(&self, edge: EvaluatableEdge, _ctx: &Arc<QueryContext>) -> EvaluatedEdge {
        let member = edge.previous_value.members().and_then(|members| {
            members
                .iter()
                .find(|m| Some(m.value_hash()) == edge.connection.to.instance)
                .cloned()
        });
        match member {
            Some(member) => EvaluatedEdge::success(edge.connection, edge.previous_value, member),
            None => EvaluatedEdge::failed(
                edge.connection,
                edge.previous_value,
                "Collection does not contain the expected member",
            ),
        }
    }
}

/// Calls the operation at the source of a `Provides` edge
struct OperationInvocationEvaluator;

#[async_trait]
impl EdgeEvaluator for OperationInvocationEvaluator {
    async fn evaluate(&self, edge: EvaluatableEdge, ctx: &Arc<QueryContext>) -> EvaluatedEdge {
        let schema = ctx.schema().clone();
        let qualified = edge.connection.from.value.clone();
        let (service, operation) = match schema.operation(&qualified) {
            Ok((service, operation)) => (service.clone(), operation.clone()),
            Err(e) => return EvaluatedEdge::failed(edge.connection, edge.previous_value, e.to_string()),
        };

        let parameters = match resolve_parameters(&schema, &operation, &edge.previous_value, ctx, &qualified).await {
            Ok(parameters) => parameters,
            Err(e) => return EvaluatedEdge::failed(edge.connection, edge.previous_value, e.to_string()),
        };

        match invoke_operation(ctx.invoker(), &schema, &service, &operation, parameters).await {
            Ok(result) => {
                ctx.add_fact(result.clone());
                EvaluatedEdge::success(edge.connection, edge.previous_value, result)
            }
            Err(failure) => EvaluatedEdge::failed_with(edge.connection, edge.previous_value, failure.result, failure.message),
        }
    }
}

async fn resolve_parameters(
    schema: &Schema,
    operation: &Operation,
    previous_value: &TypedInstance,
    ctx: &Arc<QueryContext>,
    qualified: &str,
) -> Result<Vec<OperationParam>> {
    let mut resolved = Vec::with_capacity(operation.parameters.len());
    for parameter in &operation.parameters {
        let value = parameter_value(schema, parameter, previous_value, ctx, qualified).await?;
        resolved.push(OperationParam {
            parameter_name: parameter.display_name().to_string(),
            value,
        });
    }
    Ok(resolved)
}

async fn parameter_value(
    schema: &Schema,
    parameter: &Parameter,
    previous_value: &TypedInstance,
    ctx: &Arc<QueryContext>,
    qualified: &str,
) -> Result<TypedInstance> {
    if let Some(constant) = parameter.constant_value() {
        return TypedInstance::from_json(&parameter.type_name, constant, schema, DataSource::DefinedInSchema);
    }
    if !previous_value.is_null() && schema.is_assignable(&previous_value.type_name, &parameter.type_name) {
        return Ok(previous_value.clone());
    }
    ParameterFactory::discover(&parameter.type_name, ctx, Some(qualified)).await
}

// ============================================================================
// Parameter factory
// ============================================================================

const CONSTRUCTION_MISS: &str = "Could not find an instance when constructing a parameter";

/// Finds or builds operation parameters from the facts of a context
pub struct ParameterFactory;

impl ParameterFactory {
    /// Top-level fact, then any-depth fact, then construction
    pub fn discover<'a>(
        type_name: &'a str,
        ctx: &'a Arc<QueryContext>,
        operation: Option<&'a str>,
    ) -> BoxFuture<'a, Result<TypedInstance>> {
        Box::pin(async move {
            for strategy in [
                FactDiscoveryStrategy::TopLevelOnly,
                FactDiscoveryStrategy::AnyDepthExpectOneDistinct,
            ] {
                let search = FactSearch::new(type_name, strategy).with_filter(FactPredicate::HasValue);
                if let Some(fact) = ctx.get_fact_or_null(&search) {
                    return Ok(fact);
                }
            }

            let t = ctx.schema().type_named(type_name)?;
            if !Self::can_construct(ctx.schema(), &t) {
                return Err(QueryError::UnresolvedOperationParameters {
                    operation: operation.unwrap_or("<none>").to_string(),
                    message: format!("No instance of {} is known and it cannot be constructed", type_name),
                });
            }
            let built = Self::construct(t, ctx, operation, BTreeSet::new()).await?;
            debug!("[{}] Constructed parameter {}", ctx.query_id(), built);
            ctx.add_fact(built.clone());
            Ok(built)
        })
    }

    /// Parameter types, and collections of them
    pub fn can_construct(schema: &Schema, t: &Type) -> bool {
        if t.is_parameter_type() {
            return true;
        }
        t.collection_member_type()
            .and_then(|member| schema.type_named(member).ok())
            .map(|member| member.is_parameter_type())
            .unwrap_or(false)
    }

    fn construct<'a>(
        t: Arc<Type>,
        ctx: &'a Arc<QueryContext>,
        operation: Option<&'a str>,
        under_construction: BTreeSet<String>,
    ) -> BoxFuture<'a, Result<TypedInstance>> {
        Box::pin(async move {
            if let Some(member_type) = t.collection_member_type() {
                return Self::construct_collection(member_type, ctx, operation).await;
            }

            let mut under_construction = under_construction;
            under_construction.insert(t.name.clone());

            let mut attributes = BTreeMap::new();
            for (name, field) in &t.attributes {
                if let Some(value) = Self::attribute_value(ctx, &field.type_name, operation).await {
                    attributes.insert(name.clone(), value);
                    continue;
                }
                if let Some(default) = &field.default_value {
                    let value = TypedInstance::from_json(
                        &field.type_name,
                        default,
                        ctx.schema(),
                        DataSource::DefinedInSchema,
                    )?;
                    attributes.insert(name.clone(), value);
                    continue;
                }

                let field_type = ctx.schema().type_named(&field.type_name)?;
                if !field_type.is_scalar() && !under_construction.contains(&field_type.name) {
                    match Self::construct(field_type, ctx, operation, under_construction.clone()).await {
                        Ok(value) => {
                            attributes.insert(name.clone(), value);
                            continue;
                        }
                        Err(e) if field.nullable => {
                            debug!("[{}] {}.{} left null: {}", ctx.query_id(), t.name, name, e);
                        }
                        Err(e) => return Err(e),
                    }
                }

                if field.nullable {
                    attributes.insert(
                        name.clone(),
                        TypedInstance::null(field.type_name.clone(), DataSource::failed_search(CONSTRUCTION_MISS)),
                    );
                } else {
                    return Err(QueryError::UnresolvedOperationParameters {
                        operation: operation.unwrap_or("<none>").to_string(),
                        message: format!("{} of {}.{} ({})", CONSTRUCTION_MISS, t.name, name, field.type_name),
                    });
                }
            }
            let source = DataSource::single_source_or_mixed(attributes.values());
            Ok(TypedInstance::object(t.name.clone(), attributes, source))
        })
    }

    /// One member per member of each known collection, each built from that
    /// member alone
    async fn construct_collection(
        member_type: &str,
        ctx: &Arc<QueryContext>,
        operation: Option<&str>,
    ) -> Result<TypedInstance> {
        let member_def = ctx.schema().type_named(member_type)?;
        let sources: Vec<TypedInstance> = ctx
            .facts()
            .into_iter()
            .filter(TypedInstance::is_collection)
            .flat_map(TypedInstance::flatten)
            .collect();

        let mut members = Vec::new();
        for source in sources {
            let child = ctx.only(source);
            match Self::construct(member_def.clone(), &child, operation, BTreeSet::new()).await {
                Ok(member) => members.push(member),
                Err(e) => debug!("[{}] Skipping collection member: {}", ctx.query_id(), e),
            }
        }
        if members.is_empty() {
            return Err(QueryError::UnresolvedOperationParameters {
                operation: operation.unwrap_or("<none>").to_string(),
                message: format!("No collection to build {}[] from", member_type),
            });
        }
        Ok(TypedInstance::collection_of(member_type, members))
    }

    /// A known value, else the first result of a search that may not call
    /// back into `operation`
    async fn attribute_value(
        ctx: &Arc<QueryContext>,
        type_name: &str,
        operation: Option<&str>,
    ) -> Option<TypedInstance> {
        let search = FactSearch::new(type_name, FactDiscoveryStrategy::AnyDepthExpectOneDistinct)
            .with_filter(FactPredicate::HasValue);
        if let Some(fact) = ctx.get_fact_or_null(&search) {
            return Some(fact);
        }

        let mut constraints = InvocationConstraints::default();
        if let Some(operation) = operation {
            constraints.excluded_operations.insert(operation.to_string());
        }
        let mut result = match ctx.find_with(QuerySpecNode::discover(type_name), constraints) {
            Ok(result) => result,
            Err(e) => {
                debug!("[{}] Not searching for {}: {}", ctx.query_id(), type_name, e);
                return None;
            }
        };
        match result.first().await {
            Ok(value) if value.has_value() => Some(value),
            Ok(_) => None,
            Err(e) => {
                debug!("[{}] Search for {} failed: {}", ctx.query_id(), type_name, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Element;
    use crate::invocation::StubOperationInvoker;
    use crate::query::QueryEngine;
    use crate::schema::{Field, Modifier, Operation, Parameter, Service, Type};
    use serde_json::json;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(
            vec![
                Type::new("ClientId").inheriting("String"),
                Type::new("Region").inheriting("String"),
                Type::new("Client")
                    .with_attribute("id", Field::of("ClientId"))
                    .with_attribute("region", Field::of("Region").nullable()),
                Type::new("ClientRequest")
                    .with_attribute("id", Field::of("ClientId"))
                    .with_attribute("region", Field::of("Region").nullable())
                    .with_modifier(Modifier::Parameter),
            ],
            vec![Service::new("ClientService")
                .with_operation(Operation::new("getClient", "Client").with_parameter(Parameter::of("ClientId")))
                .with_operation(
                    Operation::new("lookup", "Client").with_parameter(Parameter::of("ClientRequest")),
                )],
        ))
    }

    fn context(
        schema: &Arc<Schema>,
        stubs: StubOperationInvoker,
        facts: Vec<TypedInstance>,
    ) -> (Arc<QueryContext>, Arc<StubOperationInvoker>) {
        let stubs = Arc::new(stubs);
        let engine = QueryEngine::new(schema.clone(), stubs.clone());
        (engine.query_context(facts), stubs)
    }

    fn client_id() -> TypedInstance {
        TypedInstance::scalar("ClientId", json!("C1"), DataSource::Provided)
    }

    fn provides() -> Connection {
        Connection::new(
            Element::operation("ClientService.getClient"),
            Relationship::Provides,
            Element::provided_instance("Client"),
        )
    }

    #[tokio::test]
    async fn test_pass_through_keeps_value() {
        let schema = schema();
        let (ctx, _) = context(&schema, StubOperationInvoker::new(schema.clone()), vec![]);
        for relationship in [Relationship::IsTypeOf, Relationship::CanPopulate, Relationship::IsSynonymOf] {
            assert!(relationship.is_pass_through());
            let edge = EvaluatableEdge {
                previous_value: client_id(),
                connection: Connection::new(
                    Element::instance_of(&client_id()),
                    relationship,
                    Element::parameter("ClientId"),
                ),
            };
            let result = evaluator_for(relationship).evaluate(edge, &ctx).await;
            assert!(result.is_success());
            assert_eq!(result.result, client_id());
        }
    }

    #[tokio::test]
    async fn test_attribute_evaluator_reads_value() {
        let schema = schema();
        let (ctx, _) = context(&schema, StubOperationInvoker::new(schema.clone()), vec![]);
        let client = TypedInstance::from_json("Client", &json!({"id": "C1"}), &schema, DataSource::Provided).unwrap();

        let edge = EvaluatableEdge {
            previous_value: client.clone(),
            connection: Connection::new(
                Element::instance_of(&client),
                Relationship::InstanceHasAttribute,
                Element::provided_instance_member("Client", "id"),
            ),
        };
        let result = evaluator_for(Relationship::InstanceHasAttribute).evaluate(edge, &ctx).await;
        assert!(result.is_success());
        assert_eq!(result.result.to_raw(), json!("C1"));

        let edge = EvaluatableEdge {
            previous_value: client.clone(),
            connection: Connection::new(
                Element::instance_of(&client),
                Relationship::InstanceHasAttribute,
                Element::provided_instance_member("Client", "region"),
            ),
        };
        let result = evaluator_for(Relationship::InstanceHasAttribute).evaluate(edge, &ctx).await;
        assert!(!result.is_success());
        assert_eq!(
            result.error.as_deref(),
            Some("Attribute region on type Client evaluated to null")
        );
    }

    #[tokio::test]
    async fn test_invocation_stamps_provenance() {
        let schema = schema();
        let stubs = StubOperationInvoker::new(schema.clone())
            .with_response("ClientService.getClient", json!({"id": "C1", "region": "EU"}));
        let (ctx, stubs) = context(&schema, stubs, vec![client_id()]);

        let edge = EvaluatableEdge {
            previous_value: client_id(),
            connection: provides(),
        };
        let result = evaluator_for(Relationship::Provides).evaluate(edge, &ctx).await;
        assert!(result.is_success());
        assert_eq!(stubs.invocation_count("ClientService.getClient"), 1);

        let DataSource::OperationResult { call, inputs, .. } = &result.result.source else {
            panic!("expected an operation result, got {:?}", result.result.source);
        };
        assert_eq!(call.operation, "getClient");
        assert!(!call.is_failed);
        assert_eq!(inputs[0].value.to_raw(), json!("C1"));
        // Nested values carry the same provenance
        assert_eq!(result.result.attribute("region").unwrap().source, result.result.source);
        // The result became a fact
        assert_eq!(ctx.facts().len(), 2);
    }

    #[tokio::test]
    async fn test_invocation_failure_becomes_failed_edge() {
        let schema = schema();
        let stubs = StubOperationInvoker::new(schema.clone())
            .with_failure("ClientService.getClient", 500, "Internal Server Error");
        let (ctx, _) = context(&schema, stubs, vec![client_id()]);

        let edge = EvaluatableEdge {
            previous_value: client_id(),
            connection: provides(),
        };
        let result = evaluator_for(Relationship::Provides).evaluate(edge, &ctx).await;
        assert!(!result.is_success());
        assert!(result.result.is_null());
        let DataSource::OperationResult { call, inputs, .. } = &result.result.source else {
            panic!("expected an operation result, got {:?}", result.result.source);
        };
        assert!(call.is_failed);
        assert_eq!(call.response_code, Some(500));
        assert_eq!(inputs.len(), 1);
    }

    #[tokio::test]
    async fn test_parameter_factory_constructs_parameter_objects() {
        let schema = schema();
        let (ctx, _) = context(&schema, StubOperationInvoker::new(schema.clone()), vec![client_id()]);
        let request = ParameterFactory::discover("ClientRequest", &ctx, Some("ClientService.lookup"))
            .await
            .unwrap();
        assert_eq!(request.type_name, "ClientRequest");
        assert_eq!(request.attribute("id").unwrap().to_raw(), json!("C1"));
        // Region is nullable and unknown
        let region = request.attribute("region").unwrap();
        assert!(region.is_null());
        assert!(matches!(region.source, DataSource::FailedSearch { .. }));
        assert_eq!(request.source, DataSource::MixedSources);
    }

    #[tokio::test]
    async fn test_parameter_factory_rejects_unconstructable_types() {
        let schema = schema();
        let (ctx, _) = context(&schema, StubOperationInvoker::new(schema.clone()), vec![]);
        let err = ParameterFactory::discover("ClientId", &ctx, Some("ClientService.getClient"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::UnresolvedOperationParameters { .. }));
    }
}
