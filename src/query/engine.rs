//! Query Engine
//!
//! Entry point for resolution. `find` runs the strategy pipeline for a
//! target and streams what the first attempting strategy produces; `build`
//! constructs the target from the known facts with the object builder.
//!
//! Nothing is resolved until the returned [`QueryResult`] is polled.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tracing::{debug, info};

use super::context::QueryContext;
use super::object_builder::ObjectBuilder;
use super::strategies::{default_strategies, QueryStrategy, StrategyResult};
use super::{FailureBehaviour, InvocationConstraints, QueryResult, QuerySpecNode};
use crate::checksum::Checksum;
use crate::config::QueryConfig;
use crate::error::{QueryError, Result};
use crate::graph::GraphBuilder;
use crate::invocation::{CachingOperationInvoker, OperationInvoker};
use crate::models::{DataSource, TypedInstance};
use crate::schema::{Schema, SchemaProvider};

/// Resolves target types against a schema and an operation invoker.
/// Cloning is cheap; clones share the graph caches.
#[derive(Clone)]
pub struct QueryEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    schema_provider: Arc<dyn SchemaProvider>,
    invoker: Arc<dyn OperationInvoker>,
    strategies: Vec<Arc<dyn QueryStrategy>>,
    config: QueryConfig,
    /// One builder per schema version
    builders: Mutex<HashMap<Checksum, Arc<GraphBuilder>>>,
}

impl QueryEngine {
    pub fn new(schema_provider: impl SchemaProvider + 'static, invoker: Arc<dyn OperationInvoker>) -> Self {
        Self::with_config(schema_provider, invoker, QueryConfig::default())
    }

    pub fn with_config(
        schema_provider: impl SchemaProvider + 'static,
        invoker: Arc<dyn OperationInvoker>,
        config: QueryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                schema_provider: Arc::new(schema_provider),
                invoker,
                strategies: default_strategies(),
                config,
                builders: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.inner.schema_provider.schema()
    }

    /// The shared graph builder for this schema version
    pub fn graph_builder(&self, schema: &Arc<Schema>) -> Arc<GraphBuilder> {
        let mut builders = self.inner.builders.lock().unwrap_or_else(PoisonError::into_inner);
        builders
            .entry(schema.fingerprint().clone())
            .or_insert_with(|| {
                debug!("Creating graph builder for schema {}", schema.fingerprint().short());
                Arc::new(GraphBuilder::new(schema.clone(), self.inner.config.cache.graph_capacity))
            })
            .clone()
    }

    /// A fresh top-level context over `facts`
    pub fn query_context(&self, facts: Vec<TypedInstance>) -> Arc<QueryContext> {
        let invoker: Arc<dyn OperationInvoker> = if self.inner.config.cache.invocation_cache_enabled {
            Arc::new(CachingOperationInvoker::new(self.inner.invoker.clone()))
        } else {
            self.inner.invoker.clone()
        };
        Arc::new(QueryContext::root(self.clone(), self.schema(), invoker, facts))
    }

    // ========== Entry points ==========

    /// Discover one value of `target`
    pub fn find(&self, target: &str, facts: Vec<TypedInstance>) -> Result<QueryResult> {
        self.query_context(facts).find(target)
    }

    /// Discover every value of `target`
    pub fn gather(&self, target: &str, facts: Vec<TypedInstance>) -> Result<QueryResult> {
        self.query_context(facts)
            .find_with(QuerySpecNode::gather(target), InvocationConstraints::default())
    }

    /// Construct `target` from what is known
    pub fn build(&self, target: &str, facts: Vec<TypedInstance>) -> Result<QueryResult> {
        self.query_context(facts).build(target)
    }

    // ========== Pipeline ==========

    pub(crate) fn find_in(
        &self,
        ctx: Arc<QueryContext>,
        spec: QuerySpecNode,
        constraints: InvocationConstraints,
    ) -> Result<QueryResult> {
        ctx.schema().type_named(&spec.type_name)?;
        debug!("[{}] Finding {:?} {}", ctx.query_id(), spec.mode, spec.type_name);

        let fully_resolved = Arc::new(AtomicBool::new(true));
        let query_id = ctx.query_id().to_string();
        let cancel = ctx.cancellation_handle();
        let resolution = Resolution {
            strategies: self.inner.strategies.clone(),
            ctx,
            spec: spec.clone(),
            constraints,
            fully_resolved: fully_resolved.clone(),
            phase: Phase::Strategies(0),
            pending: VecDeque::new(),
            failed_attempts: Vec::new(),
            attempted: false,
            emitted: false,
        };
        let results = stream::unfold(resolution, |mut resolution| async move {
            let item = resolution.next().await?;
            Some((item, resolution))
        })
        .boxed();
        Ok(QueryResult::new(spec, query_id, results, fully_resolved, cancel))
    }

    pub(crate) fn build_in(&self, ctx: Arc<QueryContext>, type_name: &str) -> Result<QueryResult> {
        ctx.schema().type_named(type_name)?;
        debug!("[{}] Building {}", ctx.query_id(), type_name);

        let fully_resolved = Arc::new(AtomicBool::new(true));
        let query_id = ctx.query_id().to_string();
        let cancel = ctx.cancellation_handle();
        let flag = fully_resolved.clone();
        let target = type_name.to_string();
        let results = stream::once(async move { build_values(ctx, target, flag).await })
            .flat_map(|built| {
                let items: Vec<Result<TypedInstance>> = match built {
                    Ok(values) => values.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            })
            .boxed();
        Ok(QueryResult::new(
            QuerySpecNode::discover(type_name),
            query_id,
            results,
            fully_resolved,
            cancel,
        ))
    }
}

impl fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEngine")
            .field("invoker", &self.inner.invoker)
            .field("strategies", &self.inner.strategies)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Strategy pipeline stream
// ============================================================================

enum Phase {
    /// Next strategy to try
    Strategies(usize),
    Streaming(BoxStream<'static, Result<TypedInstance>>),
    Done,
}

struct Resolution {
    strategies: Vec<Arc<dyn QueryStrategy>>,
    ctx: Arc<QueryContext>,
    spec: QuerySpecNode,
    constraints: InvocationConstraints,
    fully_resolved: Arc<AtomicBool>,
    phase: Phase,
    /// Collection members waiting to be emitted
    pending: VecDeque<TypedInstance>,
    failed_attempts: Vec<DataSource>,
    attempted: bool,
    emitted: bool,
}

impl Resolution {
    async fn next(&mut self) -> Option<Result<TypedInstance>> {
        loop {
            let finished = matches!(self.phase, Phase::Done) && self.pending.is_empty();
            if !finished && self.ctx.is_cancel_requested() {
                self.phase = Phase::Done;
                self.pending.clear();
                info!("[{}] Cancelled while resolving {}", self.ctx.query_id(), self.spec.type_name);
                return Some(Err(QueryError::QueryCancelled {
                    query_id: self.ctx.query_id().to_string(),
                }));
            }
            if let Some(value) = self.pending.pop_front() {
                return Some(Ok(value));
            }
            if matches!(self.phase, Phase::Done) {
                return None;
            }

            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,
                Phase::Strategies(index) => {
                    let Some(strategy) = self.strategies.get(index).cloned() else {
                        return Some(self.fail());
                    };
                    self.phase = Phase::Strategies(index + 1);
                    if self.ctx.is_strategy_excluded(strategy.kind()) {
                        continue;
                    }
                    match strategy.invoke(&self.spec, &self.ctx, &self.constraints).await {
                        Ok(StrategyResult::NotAttempted { failed_attempts }) => {
                            debug!(
                                "[{}] {} did not attempt {}",
                                self.ctx.query_id(),
                                strategy.kind(),
                                self.spec.type_name
                            );
                            self.failed_attempts.extend(failed_attempts);
                        }
                        Ok(StrategyResult::Attempted(results)) => {
                            info!(
                                "[{}] Resolving {} via {}",
                                self.ctx.query_id(),
                                self.spec.type_name,
                                strategy.kind()
                            );
                            self.attempted = true;
                            self.phase = Phase::Streaming(results);
                        }
                        Err(e) => {
                            self.phase = Phase::Done;
                            return Some(Err(e));
                        }
                    }
                }
                Phase::Streaming(mut results) => match results.next().await {
                    Some(Ok(value)) => {
                        self.phase = Phase::Streaming(results);
                        self.emitted = true;
                        self.enqueue(value);
                    }
                    Some(Err(e)) if e.is_search_failure() => {
                        debug!("[{}] Candidate for {} failed: {}", self.ctx.query_id(), self.spec.type_name, e);
                        self.failed_attempts.extend_from_slice(e.failed_attempts());
                        self.phase = Phase::Streaming(results);
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None if self.emitted => return None,
                    None => return Some(self.fail()),
                },
            }
        }
    }

    /// Collections are emitted member by member, each carrying the failed
    /// attempts seen so far
    fn enqueue(&mut self, value: TypedInstance) {
        for member in value.flatten() {
            if member.is_null() && member.source.is_failure() {
                self.fully_resolved.store(false, Ordering::SeqCst);
            }
            self.pending
                .push_back(member.append_failed_attempts(self.failed_attempts.clone()));
        }
    }

    fn fail(&mut self) -> Result<TypedInstance> {
        self.phase = Phase::Done;
        self.fully_resolved.store(false, Ordering::SeqCst);
        let failed_attempts = std::mem::take(&mut self.failed_attempts);
        let type_name = self.spec.type_name.clone();
        info!(
            "[{}] No value of {} found ({} failed attempts)",
            self.ctx.query_id(),
            type_name,
            failed_attempts.len()
        );

        let message = format!("No strategy found a value of {}", type_name);
        if self.ctx.failure_behaviour() == FailureBehaviour::SendFailureMarker {
            return Ok(TypedInstance::null(
                type_name,
                DataSource::FailedSearch {
                    message,
                    failed_attempts,
                },
            ));
        }
        if !self.attempted && self.ctx.is_root() && failed_attempts.is_empty() {
            Err(QueryError::UnresolvedTypeInQuery {
                type_name,
                failed_attempts,
            })
        } else {
            Err(QueryError::SearchFailed {
                message,
                failed_attempts,
            })
        }
    }
}

// ============================================================================
// Build
// ============================================================================

async fn build_values(
    ctx: Arc<QueryContext>,
    target: String,
    fully_resolved: Arc<AtomicBool>,
) -> Result<Vec<TypedInstance>> {
    if ctx.is_cancel_requested() {
        return Err(QueryError::QueryCancelled {
            query_id: ctx.query_id().to_string(),
        });
    }
    let t = ctx.schema().type_named(&target)?;
    let member_target = t.collection_member_type().unwrap_or(&target).to_string();
    let facts = ctx.facts();

    if !facts.is_empty() && facts.iter().all(TypedInstance::is_collection) {
        let members: Vec<TypedInstance> = facts.into_iter().flat_map(TypedInstance::flatten).collect();
        info!(
            "[{}] Projecting {} collection members to {}",
            ctx.query_id(),
            members.len(),
            member_target
        );
        let mut built = Vec::with_capacity(members.len());
        for member in members {
            let projected = ctx.only(member).projecting();
            let value = ObjectBuilder::new(projected).build(&member_target).await?;
            built.push(settle(&ctx, &member_target, value, &fully_resolved)?);
        }
        return Ok(built);
    }

    if t.is_collection() && !facts.is_empty() && facts.iter().all(TypedInstance::is_null) {
        return Ok(vec![TypedInstance::collection_of(&member_target, Vec::new())]);
    }

    let value = ObjectBuilder::new(ctx.projecting()).build(&target).await?;
    Ok(vec![settle(&ctx, &target, value, &fully_resolved)?])
}

/// A built value, or the failure its absence means for this context
fn settle(
    ctx: &QueryContext,
    type_name: &str,
    value: Option<TypedInstance>,
    fully_resolved: &AtomicBool,
) -> Result<TypedInstance> {
    let marker = match value {
        Some(value) if !value.is_null() => return Ok(value),
        Some(marker) => marker,
        None => TypedInstance::null(
            type_name,
            DataSource::failed_search(format!("Could not build {}", type_name)),
        ),
    };
    fully_resolved.store(false, Ordering::SeqCst);
    if ctx.failure_behaviour() == FailureBehaviour::SendFailureMarker {
        return Ok(marker);
    }
    Err(QueryError::SearchFailed {
        message: format!("Could not build {}", type_name),
        failed_attempts: vec![marker.source],
    })
}
