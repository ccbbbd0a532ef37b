//! Query strategies
//!
//! Resolution tactics, tried in order by the engine:
//!
//! 1. [`FactScanStrategy`]: the value is already known
//! 2. [`DirectServiceInvocationStrategy`]: an operation needing no inputs
//!    (or only schema constants) returns it
//! 3. [`GraphSearchStrategy`]: a chain of attribute reads and operation
//!    calls leads from a known fact to it
//! 4. [`ObjectConstructionStrategy`]: it can be assembled field by field
//!
//! A strategy that has nothing to offer answers `NotAttempted`, carrying
//! whatever failed along the way; the engine stops at the first `Attempted`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::context::QueryContext;
use super::object_builder::ObjectBuilder;
use super::{InvocationConstraints, QueryMode, QuerySpecNode};
use crate::error::{QueryError, Result};
use crate::facts::{FactDiscoveryStrategy, FactPredicate, FactSearch};
use crate::graph::GraphSearcher;
use crate::invocation::invoke_operation;
use crate::models::{DataSource, OperationParam, TypedInstance};
use crate::schema::{operation_name, Operation, Service};

/// Identifies a strategy, for exclusion from nested queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    FactScan,
    DirectServiceInvocation,
    GraphSearch,
    ObjectConstruction,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::FactScan => "fact scan",
            StrategyKind::DirectServiceInvocation => "direct service invocation",
            StrategyKind::GraphSearch => "graph search",
            StrategyKind::ObjectConstruction => "object construction",
        };
        f.write_str(name)
    }
}

/// What a strategy made of a target
pub enum StrategyResult {
    /// The strategy cannot address the target
    NotAttempted { failed_attempts: Vec<DataSource> },
    /// Candidate values, lazily produced
    Attempted(BoxStream<'static, Result<TypedInstance>>),
}

impl StrategyResult {
    pub fn not_attempted() -> Self {
        StrategyResult::NotAttempted {
            failed_attempts: Vec::new(),
        }
    }

    fn single(value: TypedInstance) -> Self {
        StrategyResult::Attempted(stream::once(async move { Ok(value) }).boxed())
    }

    pub fn is_attempted(&self) -> bool {
        matches!(self, StrategyResult::Attempted(_))
    }
}

impl fmt::Debug for StrategyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyResult::NotAttempted { failed_attempts } => f
                .debug_struct("NotAttempted")
                .field("failed_attempts", &failed_attempts.len())
                .finish(),
            StrategyResult::Attempted(_) => f.write_str("Attempted(..)"),
        }
    }
}

/// One resolution tactic
#[async_trait]
pub trait QueryStrategy: Send + Sync + fmt::Debug {
    fn kind(&self) -> StrategyKind;

    async fn invoke(
        &self,
        target: &QuerySpecNode,
        ctx: &Arc<QueryContext>,
        constraints: &InvocationConstraints,
    ) -> Result<StrategyResult>;
}

/// The standard pipeline, in order
pub fn default_strategies() -> Vec<Arc<dyn QueryStrategy>> {
    vec![
        Arc::new(FactScanStrategy),
        Arc::new(DirectServiceInvocationStrategy),
        Arc::new(GraphSearchStrategy),
        Arc::new(ObjectConstructionStrategy),
    ]
}

fn all_excluded_operations(ctx: &QueryContext, constraints: &InvocationConstraints) -> BTreeSet<String> {
    ctx.excluded_operations()
        .union(&constraints.excluded_operations)
        .cloned()
        .collect()
}

// ============================================================================
// Fact scan
// ============================================================================

#[derive(Debug)]
pub struct FactScanStrategy;

#[async_trait]
impl QueryStrategy for FactScanStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FactScan
    }

    async fn invoke(
        &self,
        target: &QuerySpecNode,
        ctx: &Arc<QueryContext>,
        constraints: &InvocationConstraints,
    ) -> Result<StrategyResult> {
        let search = match target.mode {
            QueryMode::Discover => FactSearch::new(&target.type_name, FactDiscoveryStrategy::AnyDepthExpectOneDistinct)
                .with_filter(FactPredicate::HasValue),
            QueryMode::Gather => FactSearch::new(&target.type_name, FactDiscoveryStrategy::AnyDepthAllowMany),
        };
        match ctx.get_fact_or_null(&search) {
            Some(fact) if constraints.predicate.test(&fact) => {
                debug!("[{}] Found {} among the facts", ctx.query_id(), fact);
                Ok(StrategyResult::single(fact))
            }
            _ => Ok(StrategyResult::not_attempted()),
        }
    }
}

// ============================================================================
// Direct service invocation
// ============================================================================

#[derive(Debug)]
pub struct DirectServiceInvocationStrategy;

impl DirectServiceInvocationStrategy {
    /// Operations returning the target whose every parameter is a constant
    fn candidates(ctx: &QueryContext, target: &str, excluded: &BTreeSet<String>) -> Vec<(Service, Operation)> {
        ctx.schema()
            .operations_with_return_type(target)
            .into_iter()
            .filter(|(service, operation)| !excluded.contains(&operation_name(&service.name, &operation.name)))
            .filter(|(_, operation)| operation.parameters.iter().all(|p| p.constant_value().is_some()))
            .map(|(service, operation)| (service.clone(), operation.clone()))
            .collect()
    }

    fn call(ctx: &Arc<QueryContext>, service: Service, operation: Operation) -> BoxFuture<'static, Result<TypedInstance>> {
        let ctx = ctx.clone();
        async move {
            let schema = ctx.schema().clone();
            let mut parameters = Vec::with_capacity(operation.parameters.len());
            for parameter in &operation.parameters {
                let Some(constant) = parameter.constant_value() else {
                    continue;
                };
                parameters.push(OperationParam {
                    parameter_name: parameter.display_name().to_string(),
                    value: TypedInstance::from_json(&parameter.type_name, constant, &schema, DataSource::DefinedInSchema)?,
                });
            }
            match invoke_operation(ctx.invoker(), &schema, &service, &operation, parameters).await {
                Ok(value) => {
                    ctx.add_fact(value.clone());
                    Ok(value)
                }
                Err(failure) => Err(QueryError::SearchFailed {
                    message: failure.message,
                    failed_attempts: vec![failure.result.source],
                }),
            }
        }
        .boxed()
    }
}

#[async_trait]
impl QueryStrategy for DirectServiceInvocationStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DirectServiceInvocation
    }

    async fn invoke(
        &self,
        target: &QuerySpecNode,
        ctx: &Arc<QueryContext>,
        constraints: &InvocationConstraints,
    ) -> Result<StrategyResult> {
        if ctx.is_projecting() {
            return Ok(StrategyResult::not_attempted());
        }
        let excluded = all_excluded_operations(ctx, constraints);
        let mut candidates = Self::candidates(ctx, &target.type_name, &excluded);
        if candidates.is_empty() {
            return Ok(StrategyResult::not_attempted());
        }

        match target.mode {
            QueryMode::Discover => {
                let (service, operation) = candidates.remove(0);
                info!(
                    "[{}] Invoking {} directly for {}",
                    ctx.query_id(),
                    operation_name(&service.name, &operation.name),
                    target.type_name
                );
                Ok(StrategyResult::Attempted(stream::once(Self::call(ctx, service, operation)).boxed()))
            }
            QueryMode::Gather => {
                info!(
                    "[{}] Invoking {} operations for {}",
                    ctx.query_id(),
                    candidates.len(),
                    target.type_name
                );
                let calls: Vec<_> = candidates
                    .into_iter()
                    .map(|(service, operation)| Self::call(ctx, service, operation))
                    .collect();
                let buffer = ctx.config().query.result_buffer.max(1);
                Ok(StrategyResult::Attempted(
                    stream::iter(calls).buffer_unordered(buffer).boxed(),
                ))
            }
        }
    }
}

// ============================================================================
// Graph search
// ============================================================================

#[derive(Debug)]
pub struct GraphSearchStrategy;

#[async_trait]
impl QueryStrategy for GraphSearchStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::GraphSearch
    }

    async fn invoke(
        &self,
        target: &QuerySpecNode,
        ctx: &Arc<QueryContext>,
        constraints: &InvocationConstraints,
    ) -> Result<StrategyResult> {
        let builder = ctx.graph_builder();
        let excluded = all_excluded_operations(ctx, constraints);
        let mut failed_attempts = Vec::new();

        for fact in ctx.facts() {
            if fact.is_null() || ctx.is_search_excluded(&fact, &target.type_name) {
                continue;
            }
            let searcher = GraphSearcher::new(
                fact.clone(),
                target.type_name.clone(),
                builder.clone(),
                ctx.config().search.clone(),
            )
            .excluding_operations(excluded.clone())
            .with_predicate(constraints.predicate);

            let outcome = searcher.search(ctx).await?;
            failed_attempts.extend(outcome.failed_attempts);
            if let Some(result) = outcome.result {
                let value = result.value.append_failed_attempts(failed_attempts);
                return Ok(StrategyResult::single(value));
            }
            if outcome.no_path || outcome.produced_start_fact {
                ctx.exclude_search(&fact, &target.type_name);
            }
        }

        debug!(
            "[{}] Graph search found no {} ({} failed attempts)",
            ctx.query_id(),
            target.type_name,
            failed_attempts.len()
        );
        Ok(StrategyResult::NotAttempted { failed_attempts })
    }
}

// ============================================================================
// Object construction
// ============================================================================

#[derive(Debug)]
pub struct ObjectConstructionStrategy;

#[async_trait]
impl QueryStrategy for ObjectConstructionStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ObjectConstruction
    }

    async fn invoke(
        &self,
        target: &QuerySpecNode,
        ctx: &Arc<QueryContext>,
        _constraints: &InvocationConstraints,
    ) -> Result<StrategyResult> {
        let t = ctx.schema().type_named(&target.type_name)?;
        if t.is_scalar() || t.is_closed() || t.is_collection() {
            return Ok(StrategyResult::not_attempted());
        }
        match ObjectBuilder::new(ctx.clone()).build(&target.type_name).await? {
            Some(value) if !value.is_null() => Ok(StrategyResult::single(value)),
            _ => Ok(StrategyResult::not_attempted()),
        }
    }
}
