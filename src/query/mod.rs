//! Query Engine
//!
//! Resolution of a target type from known facts:
//!
//! - `engine`: the [`QueryEngine`] and its strategy pipeline stream
//! - `context`: per-query state ([`QueryContext`]): facts, exclusions,
//!   cancellation and child contexts
//! - `strategies`: the four resolution tactics, tried in order
//! - `object_builder`: recursive construction of composite values

pub mod context;
pub mod engine;
pub mod object_builder;
pub mod strategies;

pub use context::QueryContext;
pub use engine::QueryEngine;
pub use object_builder::ObjectBuilder;
pub use strategies::{
    DirectServiceInvocationStrategy, FactScanStrategy, GraphSearchStrategy, ObjectConstructionStrategy,
    QueryStrategy, StrategyKind, StrategyResult,
};

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{QueryError, Result};
use crate::facts::FactPredicate;
use crate::models::TypedInstance;
use crate::schema::Type;

// ============================================================================
// Query specification
// ============================================================================

/// Whether one value or every value is wanted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    Discover,
    Gather,
}

/// A resolution request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuerySpecNode {
    pub type_name: String,
    pub mode: QueryMode,
}

impl QuerySpecNode {
    pub fn discover(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            mode: QueryMode::Discover,
        }
    }

    pub fn gather(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            mode: QueryMode::Gather,
        }
    }
}

/// What an unresolvable query does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureBehaviour {
    /// Raise `SearchFailed` / `UnresolvedTypeInQuery`
    #[default]
    Throw,
    /// Emit a typed null carrying the failure instead
    SendFailureMarker,
}

/// Limits on how a query may be answered
#[derive(Debug, Clone)]
pub struct InvocationConstraints {
    /// Results must pass this
    pub predicate: FactPredicate,
    /// `Service.operation` names that may not be called
    pub excluded_operations: BTreeSet<String>,
}

impl Default for InvocationConstraints {
    fn default() -> Self {
        Self {
            predicate: FactPredicate::Any,
            excluded_operations: BTreeSet::new(),
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation flag for one query context
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancellationHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (sender, receiver) = watch::channel(false);
        (
            Self {
                sender: Arc::new(sender),
            },
            receiver,
        )
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

// ============================================================================
// Results
// ============================================================================

/// The answer to a `find` or `build`. Nothing is resolved until the stream
/// is polled.
pub struct QueryResult {
    pub query_spec: QuerySpecNode,
    pub query_id: String,
    /// Types synthesised while answering; empty unless results were projected
    pub anonymous_types: Vec<Type>,
    results: BoxStream<'static, Result<TypedInstance>>,
    fully_resolved: Arc<AtomicBool>,
    cancel: CancellationHandle,
}

impl QueryResult {
    pub(crate) fn new(
        query_spec: QuerySpecNode,
        query_id: String,
        results: BoxStream<'static, Result<TypedInstance>>,
        fully_resolved: Arc<AtomicBool>,
        cancel: CancellationHandle,
    ) -> Self {
        Self {
            query_spec,
            query_id,
            anonymous_types: Vec::new(),
            results,
            fully_resolved,
            cancel,
        }
    }

    /// False once a failure marker was emitted or the answering strategy
    /// produced nothing
    pub fn is_fully_resolved(&self) -> bool {
        self.fully_resolved.load(Ordering::SeqCst)
    }

    /// Stops the query at its next cancellation check
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancel.clone()
    }

    pub async fn next(&mut self) -> Option<Result<TypedInstance>> {
        self.results.next().await
    }

    /// The first result. An empty stream is a search failure.
    pub async fn first(&mut self) -> Result<TypedInstance> {
        match self.results.next().await {
            Some(result) => result,
            None => Err(QueryError::SearchFailed {
                message: format!("No results for {}", self.query_spec.type_name),
                failed_attempts: Vec::new(),
            }),
        }
    }

    /// Every result, stopping at the first error
    pub async fn collect(&mut self) -> Result<Vec<TypedInstance>> {
        (&mut self.results).try_collect().await
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<TypedInstance>> {
        self.results
    }
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("query_spec", &self.query_spec)
            .field("query_id", &self.query_id)
            .field("fully_resolved", &self.is_fully_resolved())
            .finish_non_exhaustive()
    }
}
