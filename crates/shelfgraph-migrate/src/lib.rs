//! shelfgraph-migrate - Relational snapshot to property-graph migration.
//!
//! The engine backs up a SQLite snapshot of the library application, reads
//! its users, books and reading logs, maps them to graph nodes and typed
//! relationships, writes them into a [`shelfgraph_store::GraphStore`] and
//! verifies the result before declaring success. Any failure after the
//! first write rolls the target back; the source is never opened for
//! writing.
//!
//! # Example
//!
//! ```no_run
//! use shelfgraph_migrate::{MigrationConfig, MigrationOrchestrator};
//!
//! let config = MigrationConfig::new("data/books.db", "data/graph");
//! let outcome = MigrationOrchestrator::new(config).run();
//! println!("{}", outcome.report.final_phase);
//! ```

pub mod backup;
pub mod config;
pub mod error;
pub mod mapper;
pub mod orchestrator;
pub mod report;
pub mod source;
pub mod verify;
pub mod writer;

pub use backup::{BackupArtifact, BackupManager, BackupManifest};
pub use config::MigrationConfig;
pub use error::{ErrorKind, MigrationError};
pub use mapper::{EdgeDescriptor, NodeDescriptor, ReadingStatus, SeenIds};
pub use orchestrator::{MigrationObserver, MigrationOrchestrator, Outcome, Phase, Transition};
pub use report::MigrationReport;
pub use source::{BookRow, ReadingLogRow, SourceLayout, SourceReader, UserRow};
pub use verify::{IntegrityVerifier, Mismatch, VerificationSummary};
pub use writer::GraphWriter;

/// Result alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrationError>;
