//! Operation invocation
//!
//! The engine never talks to a transport. It hands a service, an operation
//! and resolved parameters to an [`OperationInvoker`] and receives a stream
//! of typed values, or an error. [`invoke_operation`] stamps what comes back
//! with the call that produced it.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, error, trace};

use crate::checksum::value_hash;
use crate::error::{QueryError, Result};
use crate::models::{DataSource, OperationParam, RemoteCall, TypedInstance};
use crate::schema::{operation_name, Operation, Schema, Service};

/// Performs remote calls
#[async_trait]
pub trait OperationInvoker: Send + Sync + fmt::Debug {
    async fn invoke(
        &self,
        service: &Service,
        operation: &Operation,
        parameters: Vec<OperationParam>,
    ) -> Result<BoxStream<'static, Result<TypedInstance>>>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Stamped invocation
// ============================================================================

/// A call that produced no usable value
#[derive(Debug, Clone)]
pub struct InvocationFailure {
    /// Typed null recording the call, or why nothing came back
    pub result: TypedInstance,
    pub message: String,
}

/// Invoke `operation` and stamp the result with an `OperationResult`
/// source. Collection return types yield one collection; otherwise the
/// first value is used.
pub async fn invoke_operation(
    invoker: &Arc<dyn OperationInvoker>,
    schema: &Schema,
    service: &Service,
    operation: &Operation,
    parameters: Vec<OperationParam>,
) -> std::result::Result<TypedInstance, InvocationFailure> {
    let started = Utc::now();
    let outcome = match invoker.invoke(service, operation, parameters.clone()).await {
        Ok(stream) => stream.try_collect::<Vec<_>>().await,
        Err(e) => Err(e),
    };
    let duration_ms = (Utc::now() - started).num_milliseconds();

    let call = |response_code: Option<u16>, error: Option<String>| RemoteCall {
        service: service.name.clone(),
        operation: operation.name.clone(),
        timestamp: started,
        duration_ms,
        response_code,
        is_failed: error.is_some(),
        error,
    };

    let results = match outcome {
        Ok(results) => results,
        Err(e) => {
            let status = match &e {
                QueryError::Invocation { status, .. } => *status,
                _ => None,
            };
            let message = e.to_string();
            let source = DataSource::OperationResult {
                call: call(status, Some(message.clone())),
                inputs: parameters,
                failed_attempts: Vec::new(),
            };
            return Err(InvocationFailure {
                result: TypedInstance::null(operation.return_type.clone(), source),
                message,
            });
        }
    };

    let source = DataSource::OperationResult {
        call: call(None, None),
        inputs: parameters,
        failed_attempts: Vec::new(),
    };
    let return_type = schema.type_named(&operation.return_type).ok();

    if let Some(member_type) = return_type.as_ref().and_then(|t| t.collection_member_type()) {
        let members = results.into_iter().flat_map(TypedInstance::flatten).collect();
        return Ok(TypedInstance::collection(member_type, members, source.clone()).with_source_deep(source));
    }

    let mut results = results.into_iter();
    let Some(first) = results.next() else {
        let message = format!("Operation {} returned no results", operation.name);
        return Err(InvocationFailure {
            result: TypedInstance::null(operation.return_type.clone(), DataSource::failed_search(message.clone())),
            message,
        });
    };
    let extra = results.count();
    if extra > 0 {
        error!(
            "Operation {} returned {} values for single-valued type {}; using the first",
            operation.name,
            extra + 1,
            operation.return_type
        );
    }
    if first.is_null() {
        return Err(InvocationFailure {
            result: first.with_source(source),
            message: format!("Operation {} returned null", operation.name),
        });
    }
    Ok(first.with_source_deep(source))
}

// ============================================================================
// Caching invoker
// ============================================================================

/// Deduplicates calls by operation and argument values. Only successful
/// results are kept. Concurrent calls with the same key share one
/// invocation.
#[derive(Debug)]
pub struct CachingOperationInvoker {
    inner: Arc<dyn OperationInvoker>,
    cache: Mutex<HashMap<String, Arc<OnceCell<Vec<TypedInstance>>>>>,
}

impl CachingOperationInvoker {
    pub fn new(inner: Arc<dyn OperationInvoker>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(service: &Service, operation: &Operation, parameters: &[OperationParam]) -> String {
        let mut key = operation_name(&service.name, &operation.name);
        for param in parameters {
            key.push_str(&format!(":{:x}", value_hash(&param.value.to_raw())));
        }
        key
    }

    /// Number of cached results
    pub fn len(&self) -> usize {
        lock(&self.cache).values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OperationInvoker for CachingOperationInvoker {
    async fn invoke(
        &self,
        service: &Service,
        operation: &Operation,
        parameters: Vec<OperationParam>,
    ) -> Result<BoxStream<'static, Result<TypedInstance>>> {
        let key = Self::cache_key(service, operation, &parameters);
        let cell = lock(&self.cache).entry(key.clone()).or_default().clone();
        if cell.initialized() {
            trace!("Invocation cache hit for {}", key);
        }

        // A failed call leaves the cell empty, so the next caller retries
        let results = cell
            .get_or_try_init(|| async move {
                self.inner
                    .invoke(service, operation, parameters)
                    .await?
                    .try_collect::<Vec<_>>()
                    .await
            })
            .await?
            .clone();
        Ok(stream::iter(results.into_iter().map(Ok)).boxed())
    }
}

// ============================================================================
// Stub invoker
// ============================================================================

/// A canned response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StubResponse {
    Failure { status: u16, message: String },
    Value { value: serde_json::Value },
}

/// Serves canned responses per `Service.operation` and counts invocations
#[derive(Debug)]
pub struct StubOperationInvoker {
    schema: Arc<Schema>,
    responses: HashMap<String, StubResponse>,
    invocations: Mutex<HashMap<String, usize>>,
}

impl StubOperationInvoker {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            responses: HashMap::new(),
            invocations: Mutex::new(HashMap::new()),
        }
    }

    /// Load responses from a JSON object keyed by `Service.operation`
    pub fn from_file(schema: Arc<Schema>, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let responses: HashMap<String, StubResponse> = serde_json::from_str(&content)?;
        debug!("Loaded {} stubbed operations from {:?}", responses.len(), path);
        Ok(Self {
            responses,
            ..Self::new(schema)
        })
    }

    /// Respond with `value`. For single-valued return types a JSON array is
    /// several results.
    pub fn with_response(mut self, operation: &str, value: serde_json::Value) -> Self {
        self.responses
            .insert(operation.to_string(), StubResponse::Value { value });
        self
    }

    pub fn with_failure(mut self, operation: &str, status: u16, message: &str) -> Self {
        self.responses.insert(
            operation.to_string(),
            StubResponse::Failure {
                status,
                message: message.to_string(),
            },
        );
        self
    }

    pub fn invocation_count(&self, operation: &str) -> usize {
        lock(&self.invocations).get(operation).copied().unwrap_or(0)
    }

    pub fn total_invocations(&self) -> usize {
        lock(&self.invocations).values().sum()
    }
}

#[async_trait]
impl OperationInvoker for StubOperationInvoker {
    async fn invoke(
        &self,
        service: &Service,
        operation: &Operation,
        parameters: Vec<OperationParam>,
    ) -> Result<BoxStream<'static, Result<TypedInstance>>> {
        let name = operation_name(&service.name, &operation.name);
        *lock(&self.invocations).entry(name.clone()).or_insert(0) += 1;
        debug!(
            "Stub invoking {}({})",
            name,
            parameters
                .iter()
                .map(|p| p.value.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let value = match self.responses.get(&name) {
            Some(StubResponse::Value { value }) => value,
            Some(StubResponse::Failure { status, message }) => {
                return Err(QueryError::Invocation {
                    operation: name,
                    message: message.clone(),
                    status: Some(*status),
                })
            }
            None => {
                return Err(QueryError::Invocation {
                    operation: name,
                    message: "No stubbed response".to_string(),
                    status: None,
                })
            }
        };

        let return_type = self.schema.type_named(&operation.return_type)?;
        let values = match value {
            serde_json::Value::Array(items) if !return_type.is_collection() => items.clone(),
            other => vec![other.clone()],
        };
        let results = values
            .iter()
            .map(|v| TypedInstance::from_json(&operation.return_type, v, &self.schema, DataSource::Provided))
            .collect::<Result<Vec<_>>>()?;
        Ok(stream::iter(results.into_iter().map(Ok)).boxed())
    }
}
