//! shelfgraph-store - Embedded property-graph store.
//!
//! Nodes live in one sled tree per label and are keyed by their source
//! identifier, so identifiers survive verbatim and a node can never be
//! duplicated. Edges live in one tree per relationship type, keyed by the
//! `(from, to)` identifier pair. Writes go through collection transactions
//! that apply bounded batches and can be undone as a unit.

pub mod error;
pub mod schema;
pub mod storage;
pub mod value;

pub use error::{Endpoint, Error};
pub use schema::{EdgeTypeDef, GraphSchema, NodeTypeDef, PropertyDef, SchemaDeclaration, ValueType};
pub use storage::{
    CollectionSummary, CommitRecord, EdgeKey, EdgeTxn, GraphStore, NodeRecord, NodeTxn,
    StoreConfig, WriteOutcome,
};
pub use value::{Properties, Property, Value};

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
