//! Migration sequencing.
//!
//! ```text
//! Idle -> BackingUp -> Reading -> WritingNodes -> WritingEdges -> Verifying -> Succeeded
//! ```
//!
//! Any failure is terminal. Before the target is opened this is `Failed`;
//! once the target is open the run is undone and ends in `RolledBack`. The
//! source and its backup are never touched by a rollback.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shelfgraph_store::{CollectionSummary, GraphStore};
use tracing::{error, info, warn};

use crate::backup::{BackupArtifact, BackupManager};
use crate::config::MigrationConfig;
use crate::error::MigrationError;
use crate::mapper::{self, SeenIds, BOOK, LOGGED, OWNS, READING_LOG, READ_ON, USER};
use crate::report::{CollectionKind, ErrorReport, MigrationReport};
use crate::source::SourceReader;
use crate::verify::IntegrityVerifier;
use crate::writer::{Completion, GraphWriter};

/// Run state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum Phase {
    /// Not started.
    Idle,
    /// Copying the source to the backup directory.
    BackingUp,
    /// Opening and validating the source.
    Reading,
    /// Writing node collections.
    WritingNodes,
    /// Writing edge collections.
    WritingEdges,
    /// Comparing the target with the source.
    Verifying,
    /// Verified and marked complete.
    Succeeded,
    /// Ended without a rollback, with the reason.
    Failed(String),
    /// The target was undone, with the reason.
    RolledBack(String),
}

impl Phase {
    /// Whether the run has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed(_) | Phase::RolledBack(_))
    }

    /// Process exit status for a terminal phase.
    pub fn exit_code(&self) -> i32 {
        match self {
            Phase::Succeeded => 0,
            Phase::RolledBack(_) => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => f.write_str("Idle"),
            Phase::BackingUp => f.write_str("BackingUp"),
            Phase::Reading => f.write_str("Reading"),
            Phase::WritingNodes => f.write_str("WritingNodes"),
            Phase::WritingEdges => f.write_str("WritingEdges"),
            Phase::Verifying => f.write_str("Verifying"),
            Phase::Succeeded => f.write_str("Succeeded"),
            Phase::Failed(reason) => write!(f, "Failed: {reason}"),
            Phase::RolledBack(reason) => write!(f, "RolledBack: {reason}"),
        }
    }
}

/// A phase change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    /// Phase entered.
    pub phase: Phase,
    /// When it was entered.
    pub at: DateTime<Utc>,
}

/// Hooks called as a run progresses.
pub trait MigrationObserver {
    /// Called after every phase change.
    fn on_transition(&mut self, _transition: &Transition) {}

    /// Called after a collection commits, with the store it was written to.
    fn on_collection_committed(&mut self, _summary: &CollectionSummary, _store: &GraphStore) {}
}

/// Result of a run.
#[derive(Debug)]
pub struct Outcome {
    pub report: MigrationReport,
    /// The failure, if the run did not succeed.
    pub error: Option<MigrationError>,
}

impl Outcome {
    /// Process exit status.
    pub fn exit_code(&self) -> i32 {
        self.report.final_phase.exit_code()
    }

    /// Whether the run succeeded.
    pub fn is_success(&self) -> bool {
        self.report.final_phase == Phase::Succeeded
    }
}

/// Drives one migration run.
pub struct MigrationOrchestrator {
    config: MigrationConfig,
    observer: Option<Box<dyn MigrationObserver>>,
    phase: Phase,
    report: MigrationReport,
}

impl MigrationOrchestrator {
    /// Create an orchestrator for one run.
    pub fn new(config: MigrationConfig) -> Self {
        let report = MigrationReport::new(&config);
        Self {
            config,
            observer: None,
            phase: Phase::Idle,
            report,
        }
    }

    /// Attach an observer.
    pub fn with_observer(mut self, observer: impl MigrationObserver + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Current phase.
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Run to a terminal phase.
    pub fn run(mut self) -> Outcome {
        let started = Instant::now();
        info!(
            source = %self.config.source.display(),
            path = %self.config.target.display(),
            batch_size = self.config.batch_size,
            "migration started"
        );

        let error = match self.prepare() {
            Err(e) => {
                self.finish_failed(&e);
                Some(e)
            }
            Ok((source, artifact, writer)) => self.migrate(&source, &artifact, writer).err(),
        };

        self.report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.report.finished_at = Some(Utc::now());
        self.report.final_phase = self.phase.clone();
        self.report.error = error.as_ref().map(ErrorReport::from);

        match &error {
            None => info!(elapsed_ms = self.report.elapsed_ms, "migration succeeded"),
            Some(e) => error!(kind = %e.kind(), error = %e, phase = %self.phase, "migration ended"),
        }
        Outcome {
            report: self.report,
            error,
        }
    }

    /// Steps that touch nothing but the backup directory.
    fn prepare(&mut self) -> Result<(SourceReader, BackupArtifact, GraphWriter), MigrationError> {
        self.transition(Phase::BackingUp);
        let artifact = BackupManager::new(&self.config.backup_dir).backup(&self.config.source)?;
        self.report.backup = Some(artifact.clone());

        self.transition(Phase::Reading);
        let source = SourceReader::open(&self.config.source)?;
        self.report.source_layout = Some(source.layout().clone());

        self.transition(Phase::WritingNodes);
        let writer = GraphWriter::open(&self.config)?;
        if let Some(previous) = writer.previous() {
            info!(
                completed_at = %previous.completed_at,
                source_unchanged = (previous.source_sha256 == artifact.manifest.sha256),
                "target holds a completed run"
            );
            self.report.previous_run = Some(previous.clone());
        }
        Ok((source, artifact, writer))
    }

    /// Write and verify; any error rolls the target back.
    fn migrate(
        &mut self,
        source: &SourceReader,
        artifact: &BackupArtifact,
        mut writer: GraphWriter,
    ) -> Result<(), MigrationError> {
        match self.write_and_verify(source, &mut writer) {
            Ok(()) => {
                let completion = Completion {
                    source_sha256: artifact.manifest.sha256.clone(),
                    completed_at: Utc::now(),
                };
                match writer.complete(&completion) {
                    Ok(()) => {
                        drop(writer);
                        self.transition(Phase::Succeeded);
                        Ok(())
                    }
                    Err(e) => Err(self.roll_back(writer, e)),
                }
            }
            Err(e) => Err(self.roll_back(writer, e)),
        }
    }

    fn write_and_verify(
        &mut self,
        source: &SourceReader,
        writer: &mut GraphWriter,
    ) -> Result<(), MigrationError> {
        let mut seen = SeenIds::new();

        let users = writer.write_nodes(
            USER,
            source.users().map(|row| -> Result<_, MigrationError> {
                let node = mapper::map_user(&row?)?;
                seen.record(&node);
                Ok(node)
            }),
        )?;
        self.committed(CollectionKind::Node, &users, writer)?;

        let books = writer.write_nodes(
            BOOK,
            source.books().map(|row| -> Result<_, MigrationError> {
                let node = mapper::map_book(&row?)?;
                seen.record(&node);
                Ok(node)
            }),
        )?;
        self.committed(CollectionKind::Node, &books, writer)?;

        let logs = writer.write_nodes(
            READING_LOG,
            source.reading_logs().map(|row| -> Result<_, MigrationError> {
                let node = mapper::map_reading_log(&row?)?;
                seen.record(&node);
                Ok(node)
            }),
        )?;
        self.committed(CollectionKind::Node, &logs, writer)?;

        self.transition(Phase::WritingEdges);

        let owns = writer.write_edges(
            OWNS,
            source.books().map(|row| mapper::owns_edge(&row?, &seen)),
        )?;
        self.committed(CollectionKind::Edge, &owns, writer)?;

        let logged = writer.write_edges(
            LOGGED,
            source
                .reading_logs()
                .map(|row| mapper::logged_edge(&row?, &seen)),
        )?;
        self.committed(CollectionKind::Edge, &logged, writer)?;

        let read_on = writer.write_edges(
            READ_ON,
            source
                .reading_logs()
                .map(|row| mapper::read_on_edge(&row?, &seen)),
        )?;
        self.committed(CollectionKind::Edge, &read_on, writer)?;

        self.transition(Phase::Verifying);
        let verifier = IntegrityVerifier::new(source, writer.store()?, self.config.sample_size);
        self.report.verification = Some(verifier.verify()?);
        Ok(())
    }

    fn committed(
        &mut self,
        kind: CollectionKind,
        summary: &CollectionSummary,
        writer: &GraphWriter,
    ) -> Result<(), MigrationError> {
        self.report.record(kind, summary);
        if let Some(observer) = self.observer.as_mut() {
            observer.on_collection_committed(summary, writer.store()?);
        }
        Ok(())
    }

    fn roll_back(&mut self, writer: GraphWriter, err: MigrationError) -> MigrationError {
        warn!(kind = %err.kind(), phase = %self.phase, "rolling back target");
        match writer.rollback() {
            Ok(_) => self.transition(Phase::RolledBack(err.to_string())),
            Err(rollback) => {
                error!(error = %rollback, "rollback failed");
                self.transition(Phase::Failed(format!("{err}; rollback failed: {rollback}")));
            }
        }
        err
    }

    fn finish_failed(&mut self, err: &MigrationError) {
        self.transition(Phase::Failed(err.to_string()));
    }

    fn transition(&mut self, phase: Phase) {
        info!(from = %self.phase, to = %phase, "phase transition");
        let transition = Transition {
            phase: phase.clone(),
            at: Utc::now(),
        };
        if let Some(observer) = self.observer.as_mut() {
            observer.on_transition(&transition);
        }
        self.report.transitions.push(transition);
        self.phase = phase;
    }
}
