//! Store error types.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Which end of an edge a dangling check refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// The edge source node.
    From,
    /// The edge target node.
    To,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::From => write!(f, "source"),
            Endpoint::To => write!(f, "target"),
        }
    }
}

/// Graph store errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// IO error outside of sled (directory probing, removal).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Key decoding error.
    #[error("invalid key format in tree {tree}")]
    InvalidKey {
        /// Tree holding the malformed key.
        tree: String,
    },

    /// The directory holds a sled database written by something else.
    #[error("store at {path} has format {found:?}, expected {expected:?}")]
    FormatMismatch {
        /// Store directory.
        path: PathBuf,
        /// Format marker found on disk.
        found: String,
        /// Format marker this build writes.
        expected: String,
    },

    /// A node label or edge type was used before being declared.
    #[error("{kind} type {name} is not declared")]
    UndeclaredType {
        /// "node" or "edge".
        kind: &'static str,
        /// Type name.
        name: String,
    },

    /// Undoing a collection failed; some of its keys may remain.
    #[error("rollback of {tree} failed: {reason}")]
    RollbackFailed {
        /// Tree being rolled back.
        tree: String,
        /// What went wrong.
        reason: String,
    },

    /// A declared type exists with a different shape.
    #[error("schema conflict on {type_name}: {reason}")]
    SchemaConflict {
        /// Type name.
        type_name: String,
        /// What differs.
        reason: String,
    },

    /// A node's properties do not fit its declared type.
    #[error("{label} {id}: property {property} {reason}")]
    PropertyViolation {
        /// Node label.
        label: String,
        /// Node identifier.
        id: i64,
        /// Offending property.
        property: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A node with this identifier exists with different attributes.
    #[error("identifier collision on {label} {id}: stored attributes differ in {}", .diverging.join(", "))]
    IdentifierCollision {
        /// Node label.
        label: String,
        /// Node identifier.
        id: i64,
        /// Properties whose stored value differs from the incoming one.
        diverging: Vec<String>,
    },

    /// An edge endpoint is not present as a node.
    #[error("{edge_type} edge {from_id} -> {to_id}: {missing} {missing_label} {missing_id} does not exist")]
    DanglingEdge {
        /// Relationship type.
        edge_type: String,
        /// Source node identifier.
        from_id: i64,
        /// Target node identifier.
        to_id: i64,
        /// Which end is missing.
        missing: Endpoint,
        /// Label of the missing node.
        missing_label: String,
        /// Identifier of the missing node.
        missing_id: i64,
    },
}

impl Error {
    pub(crate) fn invalid_key(tree: impl Into<String>) -> Self {
        Error::InvalidKey { tree: tree.into() }
    }
}
