//! Object Builder
//!
//! Produces a value of a type from what a context knows, constructing
//! composite values attribute by attribute when no existing fact fits.
//! Unresolved attributes of open types are left out; closed types with
//! unresolved attributes produce a failed-search null instead.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::context::QueryContext;
use super::strategies::StrategyKind;
use crate::error::{QueryError, Result};
use crate::facts::{FactDiscoveryStrategy, FactSearch};
use crate::models::{DataSource, TypedInstance};
use crate::schema::Type;

pub struct ObjectBuilder {
    ctx: Arc<QueryContext>,
}

impl ObjectBuilder {
    pub fn new(ctx: Arc<QueryContext>) -> Self {
        Self { ctx }
    }

    /// `None` when nothing could be found or built
    pub async fn build(&self, type_name: &str) -> Result<Option<TypedInstance>> {
        self.build_type(type_name.to_string(), BTreeSet::new()).await
    }

    fn build_type(&self, type_name: String, visited: BTreeSet<String>) -> BoxFuture<'_, Result<Option<TypedInstance>>> {
        Box::pin(async move {
            if self.ctx.is_cancel_requested() {
                return Err(QueryError::QueryCancelled {
                    query_id: self.ctx.query_id().to_string(),
                });
            }
            let t = self.ctx.schema().type_named(&type_name)?;
            if let Some(existing) = self.existing_value(&t) {
                return Ok(Some(existing));
            }
            if let Some(member) = t.collection_member_type() {
                let member = member.to_string();
                return Ok(self
                    .build_type(member.clone(), visited)
                    .await?
                    .filter(TypedInstance::has_value)
                    .map(|value| TypedInstance::collection_of(&member, value.flatten())));
            }
            if t.is_scalar() {
                return self.discover(&type_name).await;
            }
            self.build_object(&t, visited).await
        })
    }

    /// A fact of the type anywhere in the bag. Several candidates resolve to
    /// the single exact type match, else the single non-null one.
    fn existing_value(&self, t: &Type) -> Option<TypedInstance> {
        let schema = self.ctx.schema();
        let found = self
            .ctx
            .get_fact_or_null(&FactSearch::new(&t.name, FactDiscoveryStrategy::AnyDepthAllowMany))?;
        if t.is_collection() {
            return Some(found);
        }
        let mut candidates = found.flatten();
        if candidates.len() == 1 {
            return candidates.pop().filter(TypedInstance::has_value);
        }

        let exact_name = schema.resolve_alias(&t.name);
        let exact: Vec<&TypedInstance> = candidates
            .iter()
            .filter(|c| schema.resolve_alias(&c.type_name) == exact_name)
            .collect();
        if let [only] = exact.as_slice() {
            return Some((*only).clone());
        }
        let non_null: Vec<&TypedInstance> = candidates.iter().filter(|c| c.has_value()).collect();
        if let [only] = non_null.as_slice() {
            return Some((*only).clone());
        }

        warn!(
            "[{}] {} candidate values of {} are known; none is preferred",
            self.ctx.query_id(),
            non_null.len(),
            t.name
        );
        Some(TypedInstance::null(
            t.name.clone(),
            DataSource::failed_search(format!("Ambiguous: {} values of {} are known", non_null.len(), t.name)),
        ))
    }

    /// Scalars come from the pipeline, never from construction
    async fn discover(&self, type_name: &str) -> Result<Option<TypedInstance>> {
        let nested = self.ctx.excluding_strategy(StrategyKind::ObjectConstruction);
        let mut result = nested.find(type_name)?;
        match result.first().await {
            Ok(value) if value.has_value() => Ok(Some(value)),
            Ok(_) => Ok(None),
            Err(e) if e.is_search_failure() => {
                debug!("[{}] No {} to build with: {}", self.ctx.query_id(), type_name, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// The only object among the top-level facts, if there is exactly one
    fn source_object(&self) -> Option<TypedInstance> {
        let mut objects = self
            .ctx
            .facts()
            .into_iter()
            .filter(|f| f.has_value() && f.attributes().is_some());
        let first = objects.next()?;
        objects.next().is_none().then_some(first)
    }

    async fn build_object(&self, t: &Type, visited: BTreeSet<String>) -> Result<Option<TypedInstance>> {
        if visited.contains(&t.name) {
            debug!("[{}] {} is already under construction", self.ctx.query_id(), t.name);
            return Ok(None);
        }
        let mut visited = visited;
        visited.insert(t.name.clone());

        let schema = self.ctx.schema().clone();
        let source = self.source_object();
        let mut attributes = BTreeMap::new();
        let mut unresolved = Vec::new();

        for (name, field) in &t.attributes {
            if field.expression.is_some() {
                continue;
            }
            let copied = source
                .as_ref()
                .and_then(|s| s.attribute(name))
                .filter(|v| v.has_value() && schema.is_assignable(&v.type_name, &field.type_name));
            if let Some(value) = copied {
                attributes.insert(name.clone(), value.clone());
                continue;
            }

            match self.build_type(field.type_name.clone(), visited.clone()).await? {
                Some(value) if value.has_value() => {
                    attributes.insert(name.clone(), value);
                }
                _ => match &field.default_value {
                    Some(default) => {
                        let value =
                            TypedInstance::from_json(&field.type_name, default, &schema, DataSource::DefinedInSchema)?;
                        attributes.insert(name.clone(), value);
                    }
                    None => unresolved.push(name.clone()),
                },
            }
        }

        if t.is_closed() && !unresolved.is_empty() {
            let message = format!(
                "Closed type {} cannot be built: unresolved {}",
                t.name,
                unresolved.join(", ")
            );
            debug!("[{}] {}", self.ctx.query_id(), message);
            return Ok(Some(TypedInstance::null(t.name.clone(), DataSource::failed_search(message))));
        }
        if attributes.is_empty() {
            return Ok(None);
        }
        if !unresolved.is_empty() {
            debug!(
                "[{}] Built {} without {}",
                self.ctx.query_id(),
                t.name,
                unresolved.join(", ")
            );
        }
        Ok(Some(TypedInstance::object(t.name.clone(), attributes, DataSource::MixedSources)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::StubOperationInvoker;
    use crate::query::QueryEngine;
    use crate::schema::{Field, Modifier, Operation, Parameter, Schema, Service};
    use serde_json::json;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(
            vec![
                Type::new("ClientId"),
                Type::new("ClientName"),
                Type::new("Region"),
                Type::new("Isin"),
                Type::new("ClientSummary")
                    .with_attribute("id", Field::of("ClientId"))
                    .with_attribute("name", Field::of("ClientName"))
                    .with_attribute("region", Field::of("Region").nullable()),
                Type::new("Instrument")
                    .with_attribute("isin", Field::of("Isin"))
                    .with_attribute("name", Field::of("ClientName"))
                    .with_modifier(Modifier::Closed),
                Type::new("Node")
                    .with_attribute("id", Field::of("ClientId"))
                    .with_attribute("next", Field::of("Node")),
                Type::new("Trade")
                    .with_attribute("client", Field::of("ClientId"))
                    .with_attribute("owner", Field::of("ClientId")),
                Type::new("Ownership").with_attribute("owner", Field::of("ClientId")),
            ],
            vec![Service::new("ClientService")
                .with_operation(Operation::new("nameOf", "ClientName").with_parameter(Parameter::of("ClientId")))],
        ))
    }

    fn context(facts: Vec<TypedInstance>) -> Arc<QueryContext> {
        let schema = schema();
        let stubs = Arc::new(
            StubOperationInvoker::new(schema.clone()).with_response("ClientService.nameOf", json!("Acme")),
        );
        QueryEngine::new(schema, stubs).query_context(facts)
    }

    fn client_id(value: &str) -> TypedInstance {
        TypedInstance::scalar("ClientId", json!(value), DataSource::Provided)
    }

    #[tokio::test]
    async fn test_build_open_type_omits_unresolved_attributes() {
        let ctx = context(vec![client_id("C1")]);
        let built = ObjectBuilder::new(ctx).build("ClientSummary").await.unwrap().unwrap();

        assert_eq!(built.source, DataSource::MixedSources);
        assert_eq!(built.attribute("id").unwrap().to_raw(), json!("C1"));
        assert_eq!(built.attribute("name").unwrap().to_raw(), json!("Acme"));
        assert!(built.attribute("region").is_none());
    }

    #[tokio::test]
    async fn test_build_closed_type_with_gaps_is_failure_marker() {
        let ctx = context(vec![client_id("C1")]);
        let built = ObjectBuilder::new(ctx).build("Instrument").await.unwrap().unwrap();

        assert!(built.is_null());
        assert!(matches!(built.source, DataSource::FailedSearch { .. }));
    }

    #[tokio::test]
    async fn test_existing_fact_is_returned() {
        let ctx = context(vec![client_id("C1")]);
        let built = ObjectBuilder::new(ctx).build("ClientId").await.unwrap().unwrap();
        assert_eq!(built, client_id("C1"));
    }

    #[tokio::test]
    async fn test_self_referencing_type_terminates() {
        let ctx = context(vec![client_id("C1")]);
        let built = ObjectBuilder::new(ctx).build("Node").await.unwrap().unwrap();

        assert_eq!(built.attribute("id").unwrap().to_raw(), json!("C1"));
        assert!(built.attribute("next").is_none());
    }

    #[tokio::test]
    async fn test_ambiguous_values_yield_failure_null() {
        let ctx = context(vec![client_id("C1"), client_id("C2")]);
        let built = ObjectBuilder::new(ctx).build("ClientId").await.unwrap().unwrap();
        assert!(built.is_null());
    }

    #[tokio::test]
    async fn test_attributes_copied_from_source_object_by_name() {
        let schema = schema();
        let trade = TypedInstance::from_json(
            "Trade",
            &json!({"client": "C1", "owner": "C2"}),
            &schema,
            DataSource::Provided,
        )
        .unwrap();
        let ctx = context(vec![trade]);
        let built = ObjectBuilder::new(ctx).build("Ownership").await.unwrap().unwrap();
        assert_eq!(built.attribute("owner").unwrap().to_raw(), json!("C2"));
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_building() {
        let ctx = context(vec![client_id("C1")]);
        ctx.request_cancel();
        let err = ObjectBuilder::new(ctx).build("ClientSummary").await.unwrap_err();
        assert!(matches!(err, QueryError::QueryCancelled { .. }));
    }
}
