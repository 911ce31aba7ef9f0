//! Storage layer for shelfgraph.
//!
//! This module provides the sled-based graph store and its collection
//! transactions.

mod config;
mod engine;
mod record;
mod transaction;

pub mod key;

pub use config::StoreConfig;
pub use engine::{GraphStore, FORMAT_MARKER};
pub use key::EdgeKey;
pub use record::NodeRecord;
pub(crate) use record::aligned;
pub use transaction::{CollectionSummary, CommitRecord, EdgeTxn, NodeTxn, WriteOutcome};
