//! Familiar Query
//!
//! Type-driven query resolution: given a target type and some known facts,
//! produce a value of that type by finding it, calling an operation that
//! returns it, following a chain of attribute reads and operation calls, or
//! building it field by field.
//!
//! ## Features
//!
//! - **Strategy Pipeline**: fact scan, direct invocation, graph search and
//!   object construction, tried in order
//! - **Discovery Graph**: types, attributes, operations and known facts as a
//!   petgraph graph, searched least-cost first
//! - **Path Retry**: failed and duplicate paths are penalised or excluded so
//!   cyclic schemas terminate
//! - **Provenance**: every value records how it was obtained, including the
//!   failed attempts along the way
//! - **Streaming**: results are a lazy, cancellable stream
//!
//! ## Architecture
//!
//! ```text
//! QueryEngine ── QueryContext (facts, exclusions, cancellation)
//!     │
//!     ├── FactScanStrategy ────────── FactBag
//!     ├── DirectServiceInvocationStrategy ── OperationInvoker
//!     ├── GraphSearchStrategy ─────── GraphBuilder → DiscoveryGraph
//!     │                                GraphSearcher → EdgeEvaluator
//!     └── ObjectConstructionStrategy ─ ObjectBuilder
//! ```

pub mod checksum;
pub mod config;
pub mod error;
pub mod facts;
pub mod graph;
pub mod invocation;
pub mod models;
pub mod query;
pub mod schema;

pub use checksum::Checksum;
pub use config::QueryConfig;
pub use error::{QueryError, Result};
pub use facts::{FactBag, FactDiscoveryStrategy, FactPredicate, FactSearch};
pub use graph::{DiscoveryGraph, GraphBuilder, GraphSearcher};
pub use invocation::{CachingOperationInvoker, OperationInvoker, StubOperationInvoker};
pub use models::{DataSource, OperationParam, RemoteCall, TypedInstance, TypedValue};
pub use query::{
    FailureBehaviour, InvocationConstraints, QueryContext, QueryEngine, QueryMode, QueryResult, QuerySpecNode,
};
pub use schema::{Schema, SchemaProvider, Type};
