//! Migration error types.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::verify::Mismatch;

/// Classification of a migration failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorKind {
    /// The source snapshot is missing or unreadable.
    SourceUnavailable,
    /// The source snapshot is mid-write, locked or malformed.
    SourceCorrupt,
    /// The backup copy could not be written or verified.
    BackupWriteError,
    /// The target path cannot be used as a graph store.
    TargetUnavailable,
    /// A required source field is null or out of range.
    FieldMappingError,
    /// A relationship points at an identifier that was never seen.
    DanglingReference,
    /// The target declares a type with a different shape.
    SchemaConflict,
    /// The target holds a node with the same identifier and other attributes.
    IdentifierCollision,
    /// The target store failed while writing.
    TargetWriteError,
    /// The written graph does not match the source.
    VerificationFailure,
}

impl ErrorKind {
    /// Name printed in `error[<Kind>]` diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SourceUnavailable => "SourceUnavailable",
            ErrorKind::SourceCorrupt => "SourceCorrupt",
            ErrorKind::BackupWriteError => "BackupWriteError",
            ErrorKind::TargetUnavailable => "TargetUnavailable",
            ErrorKind::FieldMappingError => "FieldMappingError",
            ErrorKind::DanglingReference => "DanglingReference",
            ErrorKind::SchemaConflict => "SchemaConflict",
            ErrorKind::IdentifierCollision => "IdentifierCollision",
            ErrorKind::TargetWriteError => "TargetWriteError",
            ErrorKind::VerificationFailure => "VerificationFailure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Migration errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The source snapshot does not exist or cannot be read.
    #[error("source {} is unavailable: {reason}", .path.display())]
    SourceUnavailable {
        /// Source path.
        path: PathBuf,
        /// Why it cannot be used.
        reason: String,
    },

    /// The source snapshot is inconsistent or locked.
    #[error("source {} is corrupt: {reason}", .path.display())]
    SourceCorrupt {
        /// Source path.
        path: PathBuf,
        /// What was detected.
        reason: String,
    },

    /// SQLite failed while reading an already validated source.
    #[error("source read failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The backup could not be created or did not verify.
    #[error("backup {} failed: {reason}", .path.display())]
    BackupWrite {
        /// Backup path or directory.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The target path is not usable.
    #[error("target {} is unavailable: {reason}", .path.display())]
    TargetUnavailable {
        /// Target path.
        path: PathBuf,
        /// Why it cannot be used.
        reason: String,
    },

    /// A required field is missing or invalid.
    #[error("{entity} {id}: field {field} {reason}")]
    FieldMapping {
        /// Source entity.
        entity: String,
        /// Row identifier.
        id: i64,
        /// Offending column.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A relationship references an identifier absent from its node stream.
    #[error("{entity} {id} references missing {target_entity} {target_id} via {relation}")]
    DanglingReference {
        /// Entity holding the reference.
        entity: String,
        /// Identifier of the referencing row.
        id: i64,
        /// Relationship type.
        relation: String,
        /// Referenced entity.
        target_entity: String,
        /// Referenced identifier.
        target_id: i64,
    },

    /// A type exists in the target with a different shape.
    #[error("schema conflict on {type_name}: {reason}")]
    SchemaConflict {
        /// Node label or edge type.
        type_name: String,
        /// What differs.
        reason: String,
    },

    /// A node with this identifier already exists with other attributes.
    #[error("identifier collision on {entity} {id}: stored attributes differ in {}", .diverging.join(", "))]
    IdentifierCollision {
        /// Node label.
        entity: String,
        /// Node identifier.
        id: i64,
        /// Properties that differ.
        diverging: Vec<String>,
    },

    /// The target store failed during a write.
    #[error("target write failed: {0}")]
    TargetWrite(#[source] shelfgraph_store::Error),

    /// The written graph does not match the source.
    #[error("verification failed with {} mismatch(es): {}", .mismatches.len(), render(.mismatches))]
    Verification {
        /// Every divergence found.
        mismatches: Vec<Mismatch>,
    },
}

fn render(mismatches: &[Mismatch]) -> String {
    mismatches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl MigrationError {
    /// Taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            MigrationError::SourceCorrupt { .. } | MigrationError::Sqlite(_) => {
                ErrorKind::SourceCorrupt
            }
            MigrationError::BackupWrite { .. } => ErrorKind::BackupWriteError,
            MigrationError::TargetUnavailable { .. } => ErrorKind::TargetUnavailable,
            MigrationError::FieldMapping { .. } => ErrorKind::FieldMappingError,
            MigrationError::DanglingReference { .. } => ErrorKind::DanglingReference,
            MigrationError::SchemaConflict { .. } => ErrorKind::SchemaConflict,
            MigrationError::IdentifierCollision { .. } => ErrorKind::IdentifierCollision,
            MigrationError::TargetWrite(_) => ErrorKind::TargetWriteError,
            MigrationError::Verification { .. } => ErrorKind::VerificationFailure,
        }
    }

    pub(crate) fn field(
        entity: &str,
        id: i64,
        field: &str,
        reason: impl Into<String>,
    ) -> Self {
        MigrationError::FieldMapping {
            entity: entity.to_string(),
            id,
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<shelfgraph_store::Error> for MigrationError {
    fn from(err: shelfgraph_store::Error) -> Self {
        use shelfgraph_store::Error as StoreError;

        match err {
            StoreError::SchemaConflict { type_name, reason } => {
                MigrationError::SchemaConflict { type_name, reason }
            }
            StoreError::IdentifierCollision {
                label,
                id,
                diverging,
            } => MigrationError::IdentifierCollision {
                entity: label,
                id,
                diverging,
            },
            StoreError::DanglingEdge {
                edge_type,
                from_id,
                to_id,
                missing,
                missing_label,
                missing_id,
            } => {
                let (id, entity) = match missing {
                    shelfgraph_store::Endpoint::From => (to_id, "edge target"),
                    shelfgraph_store::Endpoint::To => (from_id, "edge source"),
                };
                MigrationError::DanglingReference {
                    entity: entity.to_string(),
                    id,
                    relation: edge_type,
                    target_entity: missing_label,
                    target_id: missing_id,
                }
            }
            other => MigrationError::TargetWrite(other),
        }
    }
}
