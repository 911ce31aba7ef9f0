//! Run report.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shelfgraph_store::CollectionSummary;

use crate::backup::BackupArtifact;
use crate::config::MigrationConfig;
use crate::error::{ErrorKind, MigrationError};
use crate::orchestrator::{Phase, Transition};
use crate::source::SourceLayout;
use crate::verify::VerificationSummary;
use crate::writer::Completion;

/// Kind of collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Node,
    Edge,
}

/// Counts for one committed collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    /// Node label or edge type.
    pub name: String,
    pub kind: CollectionKind,
    /// Entries inserted by this run.
    pub written: usize,
    /// Entries already present and identical.
    pub unchanged: usize,
    /// Store batches applied.
    pub batches: usize,
}

impl CollectionReport {
    /// Entries present after the run.
    pub fn total(&self) -> usize {
        self.written + self.unchanged
    }
}

/// Error section of the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&MigrationError> for ErrorReport {
    fn from(err: &MigrationError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Everything a run did, in order.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub source: PathBuf,
    pub target: PathBuf,
    /// Terminal phase.
    pub final_phase: Phase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock run time in milliseconds.
    pub elapsed_ms: u64,
    /// Pre-migration backup, once taken.
    pub backup: Option<BackupArtifact>,
    /// Source layout, once the source is open.
    pub source_layout: Option<SourceLayout>,
    /// Completion marker found on a pre-existing target.
    pub previous_run: Option<Completion>,
    /// Committed collections, in write order.
    pub collections: Vec<CollectionReport>,
    /// Every phase transition with its timestamp.
    pub transitions: Vec<Transition>,
    pub verification: Option<VerificationSummary>,
    pub error: Option<ErrorReport>,
}

impl MigrationReport {
    /// Empty report for a run about to start.
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            source: config.source.clone(),
            target: config.target.clone(),
            final_phase: Phase::Idle,
            started_at: Utc::now(),
            finished_at: None,
            elapsed_ms: 0,
            backup: None,
            source_layout: None,
            previous_run: None,
            collections: Vec::new(),
            transitions: Vec::new(),
            verification: None,
            error: None,
        }
    }

    /// Record a committed collection.
    pub fn record(&mut self, kind: CollectionKind, summary: &CollectionSummary) {
        self.collections.push(CollectionReport {
            name: summary.collection.clone(),
            kind,
            written: summary.written,
            unchanged: summary.unchanged,
            batches: summary.batches,
        });
    }

    /// Collection by name.
    pub fn collection(&self, name: &str) -> Option<&CollectionReport> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Nodes present for a label after the run.
    pub fn nodes(&self, label: &str) -> Option<usize> {
        self.collection(label)
            .filter(|c| c.kind == CollectionKind::Node)
            .map(CollectionReport::total)
    }

    /// Edges present for a type after the run.
    pub fn edges(&self, edge_type: &str) -> Option<usize> {
        self.collection(edge_type)
            .filter(|c| c.kind == CollectionKind::Edge)
            .map(CollectionReport::total)
    }

    /// Entries this run inserted across all collections.
    pub fn written(&self) -> usize {
        self.collections.iter().map(|c| c.written).sum()
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "migration {} -> {}: {} in {} ms",
            self.source.display(),
            self.target.display(),
            self.final_phase,
            self.elapsed_ms
        )?;
        for c in &self.collections {
            let unit = match c.kind {
                CollectionKind::Node => "nodes",
                CollectionKind::Edge => "edges",
            };
            writeln!(
                f,
                "  {:<12} {:>8} {unit} ({} written, {} unchanged)",
                c.name,
                c.total(),
                c.written,
                c.unchanged
            )?;
        }
        if let Some(backup) = &self.backup {
            writeln!(
                f,
                "  backup       {} (sha256 {})",
                backup.path.display(),
                backup.manifest.sha256
            )?;
        }
        if let Some(error) = &self.error {
            writeln!(f, "  error[{}]: {}", error.kind, error.message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(collection: &str, written: usize, unchanged: usize) -> CollectionSummary {
        CollectionSummary {
            collection: collection.to_string(),
            written,
            unchanged,
            batches: 1,
        }
    }

    #[test]
    fn test_counts_by_kind() {
        let mut report = MigrationReport::new(&MigrationConfig::default());
        report.record(CollectionKind::Node, &summary("Book", 3, 2));
        report.record(CollectionKind::Edge, &summary("OWNS", 5, 0));

        assert_eq!(report.nodes("Book"), Some(5));
        assert_eq!(report.edges("OWNS"), Some(5));
        assert_eq!(report.nodes("OWNS"), None);
        assert_eq!(report.written(), 8);
    }

    #[test]
    fn test_json_carries_phase_and_error() {
        let mut report = MigrationReport::new(&MigrationConfig::default());
        report.final_phase = Phase::Failed("source missing".to_string());
        report.error = Some(ErrorReport {
            kind: ErrorKind::SourceUnavailable,
            message: "source missing".to_string(),
        });

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["final_phase"]["state"], "failed");
        assert_eq!(json["final_phase"]["reason"], "source missing");
        assert_eq!(json["error"]["kind"], "SourceUnavailable");
    }
}
