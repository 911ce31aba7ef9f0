//! Target store writes with run-level undo.
//!
//! The writer owns the target [`GraphStore`] for the whole run. Each node
//! label and edge type is written by one collection transaction; committed
//! collections are kept in a journal so [`GraphWriter::rollback`] can return
//! the target to its pre-run state.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shelfgraph_store::{
    CollectionSummary, CommitRecord, Error as StoreError, GraphStore, SchemaDeclaration,
};
use tracing::{debug, error, info, warn};

use crate::config::MigrationConfig;
use crate::error::MigrationError;
use crate::mapper::{self, EdgeDescriptor, NodeDescriptor};

/// What the target path held before this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Nothing; the store is created by this run.
    Absent,
    /// An empty directory.
    EmptyDir,
    /// A completed store from an earlier run.
    Existing,
}

/// Completion marker stored in the target after a verified run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// Digest of the source snapshot that was migrated.
    pub source_sha256: String,
    /// When verification passed.
    pub completed_at: DateTime<Utc>,
}

/// Writes node and edge collections into the target store.
pub struct GraphWriter {
    store: Option<GraphStore>,
    target: PathBuf,
    origin: Origin,
    batch_size: usize,
    declaration: SchemaDeclaration,
    journal: Vec<CommitRecord>,
    /// Marker of the completed run this one started from.
    previous: Option<Completion>,
    /// A collection whose undo failed; its keys may still be in the store.
    stranded: Option<StoreError>,
}

impl GraphWriter {
    /// Open or create the target and declare the graph schema.
    ///
    /// A recognised store without a completion marker is left over from an
    /// interrupted run; it is destroyed and the target is rebuilt from
    /// scratch. A completed store has its marker cleared until this run
    /// completes or rolls back, so an interrupted rerun is also rebuilt.
    pub fn open(config: &MigrationConfig) -> Result<Self, MigrationError> {
        let target = config.target.clone();
        let mut origin = classify_target(&target)?;

        let mut store = open_store(config)?;
        if origin == Origin::Existing && store.completion()?.is_none() {
            warn!(
                path = %target.display(),
                "target holds an incomplete run, rebuilding from scratch"
            );
            drop(store);
            fs::remove_dir_all(&target).map_err(|e| unavailable(&target, e.to_string()))?;
            store = open_store(config)?;
            origin = Origin::Absent;
        }

        let previous = match origin {
            Origin::Existing => read_completion(&store, &target)?,
            _ => None,
        };

        let declaration = match declare(&store, origin) {
            Ok(declaration) => declaration,
            Err(e) => {
                if origin != Origin::Existing {
                    drop(store);
                    discard(&target, origin)?;
                }
                return Err(e);
            }
        };
        if previous.is_some() {
            if let Err(e) = store.clear_completion() {
                store.retract_schema(&declaration)?;
                return Err(e.into());
            }
        }

        info!(
            path = %target.display(),
            existing = (origin == Origin::Existing),
            declared = declaration.inserted.len(),
            "target opened"
        );
        Ok(Self {
            store: Some(store),
            target,
            origin,
            batch_size: config.batch_size,
            declaration,
            journal: Vec::new(),
            previous,
            stranded: None,
        })
    }

    /// The target store.
    pub fn store(&self) -> Result<&GraphStore, MigrationError> {
        self.store.as_ref().ok_or_else(|| MigrationError::TargetUnavailable {
            path: self.target.clone(),
            reason: "store already closed".to_string(),
        })
    }

    /// Completion marker of the run the target was left at, if any.
    pub fn previous(&self) -> Option<&Completion> {
        self.previous.as_ref()
    }

    /// Write one node collection.
    ///
    /// Either every node lands or, on the first error, the collection is
    /// rolled back and the error returned.
    pub fn write_nodes<I>(
        &mut self,
        label: &str,
        nodes: I,
    ) -> Result<CollectionSummary, MigrationError>
    where
        I: IntoIterator<Item = Result<NodeDescriptor, MigrationError>>,
    {
        let mut txn = self.store()?.begin_nodes(label, self.batch_size)?;
        for node in nodes {
            let staged = node.and_then(|node| {
                debug_assert_eq!(node.label, label);
                txn.put(node.id, node.properties).map_err(MigrationError::from)
            });
            if let Err(e) = staged {
                let undo = txn.rollback();
                self.abort(label, undo);
                return Err(e);
            }
        }
        let (summary, record) = txn.commit().map_err(|e| self.commit_failed(e))?;
        self.committed(summary, record)
    }

    /// Write one edge collection, with the same all-or-nothing rule.
    pub fn write_edges<I>(
        &mut self,
        edge_type: &str,
        edges: I,
    ) -> Result<CollectionSummary, MigrationError>
    where
        I: IntoIterator<Item = Result<EdgeDescriptor, MigrationError>>,
    {
        let mut txn = self.store()?.begin_edges(edge_type, self.batch_size)?;
        for edge in edges {
            let staged = edge.and_then(|edge| {
                debug_assert_eq!(edge.edge_type, edge_type);
                txn.put(edge.from, edge.to).map_err(MigrationError::from)
            });
            if let Err(e) = staged {
                let undo = txn.rollback();
                self.abort(edge_type, undo);
                return Err(e);
            }
        }
        let (summary, record) = txn.commit().map_err(|e| self.commit_failed(e))?;
        self.committed(summary, record)
    }

    /// Record a verified run and flush the target.
    pub fn complete(&mut self, completion: &Completion) -> Result<(), MigrationError> {
        let bytes = encode_completion(completion)?;
        self.store()?.mark_completed(&bytes)?;
        self.journal.clear();
        self.declaration = SchemaDeclaration::default();
        self.previous = Some(completion.clone());
        Ok(())
    }

    /// Undo this run.
    ///
    /// A target created by this run is deleted. A pre-existing target has the
    /// keys this run inserted and the types it declared removed, and gets its
    /// completion marker back.
    ///
    /// Fails if a collection could not be undone. The pre-existing target is
    /// then left without a completion marker, so the next run rebuilds it.
    pub fn rollback(mut self) -> Result<usize, MigrationError> {
        match self.origin {
            Origin::Absent | Origin::EmptyDir => {
                drop(self.store.take());
                discard(&self.target, self.origin)?;
                info!(path = %self.target.display(), "target removed");
                Ok(0)
            }
            Origin::Existing => {
                let stranded = self.stranded.take();
                let store = self.store()?;
                let mut removed = 0;
                for record in self.journal.iter().rev() {
                    removed += store.revert(record)?;
                }
                store.retract_schema(&self.declaration)?;
                if let Some(e) = stranded {
                    store.flush()?;
                    return Err(MigrationError::TargetWrite(e));
                }
                match &self.previous {
                    Some(previous) => store.mark_completed(&encode_completion(previous)?)?,
                    None => store.flush()?,
                }
                info!(path = %self.target.display(), removed, "target restored");
                Ok(removed)
            }
        }
    }

    fn abort(&mut self, collection: &str, undo: Result<usize, StoreError>) {
        match undo {
            Ok(removed) => warn!(collection, removed, "collection rolled back"),
            Err(e) => {
                error!(collection, error = %e, "collection rollback failed");
                self.stranded = Some(StoreError::RollbackFailed {
                    tree: collection.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn commit_failed(&mut self, err: StoreError) -> MigrationError {
        if let StoreError::RollbackFailed { tree, reason } = &err {
            error!(tree = %tree, error = %reason, "collection rollback failed");
            self.stranded = Some(StoreError::RollbackFailed {
                tree: tree.clone(),
                reason: reason.clone(),
            });
        }
        err.into()
    }

    fn committed(
        &mut self,
        summary: CollectionSummary,
        record: CommitRecord,
    ) -> Result<CollectionSummary, MigrationError> {
        info!(
            collection = %summary.collection,
            written = summary.written,
            unchanged = summary.unchanged,
            batches = summary.batches,
            "collection committed"
        );
        if !record.inserted.is_empty() {
            self.journal.push(record);
        }
        Ok(summary)
    }
}

fn classify_target(target: &Path) -> Result<Origin, MigrationError> {
    let metadata = match fs::metadata(target) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Origin::Absent),
        Err(e) => return Err(unavailable(target, e.to_string())),
    };
    if !metadata.is_dir() {
        return Err(unavailable(target, "not a directory".to_string()));
    }
    let mut entries = fs::read_dir(target).map_err(|e| unavailable(target, e.to_string()))?;
    if entries.next().is_none() {
        return Ok(Origin::EmptyDir);
    }
    if !GraphStore::is_store_dir(target) {
        return Err(unavailable(
            target,
            "directory exists and is not a shelfgraph store".to_string(),
        ));
    }
    Ok(Origin::Existing)
}

fn open_store(config: &MigrationConfig) -> Result<GraphStore, MigrationError> {
    GraphStore::open(config.store_config()).map_err(|e| unavailable(&config.target, e.to_string()))
}

/// Remove a target this run created, leaving an empty directory if one was
/// there before.
fn discard(target: &Path, origin: Origin) -> Result<(), MigrationError> {
    match fs::remove_dir_all(target) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(unavailable(target, e.to_string())),
    }
    if origin == Origin::EmptyDir {
        fs::create_dir_all(target).map_err(|e| unavailable(target, e.to_string()))?;
    }
    Ok(())
}

fn declare(store: &GraphStore, origin: Origin) -> Result<SchemaDeclaration, MigrationError> {
    let declaration = store.declare_schema(&mapper::graph_schema())?;
    if origin == Origin::Existing && !declaration.is_noop() {
        debug!(types = ?declaration.inserted, "types added to existing target");
    }
    Ok(declaration)
}

fn read_completion(
    store: &GraphStore,
    target: &Path,
) -> Result<Option<Completion>, MigrationError> {
    let Some(bytes) = store.completion()? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| unavailable(target, format!("unreadable completion marker: {e}")))
}

fn encode_completion(completion: &Completion) -> Result<Vec<u8>, MigrationError> {
    serde_json::to_vec(completion).map_err(|e| {
        MigrationError::TargetWrite(StoreError::Serialization(e.to_string()))
    })
}

fn unavailable(path: &Path, reason: String) -> MigrationError {
    MigrationError::TargetUnavailable {
        path: path.to_path_buf(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{map_user, USER};
    use crate::source::UserRow;
    use crate::ErrorKind;

    fn user(id: i64) -> Result<NodeDescriptor, MigrationError> {
        map_user(&UserRow {
            id,
            username: Some(format!("reader{id}")),
            ..Default::default()
        })
    }

    fn completion(sha: &str) -> Completion {
        Completion {
            source_sha256: sha.to_string(),
            completed_at: Utc::now(),
        }
    }

    /// A completed target holding user 1.
    fn completed_target(dir: &Path) -> MigrationConfig {
        let config = MigrationConfig::new(dir.join("books.db"), dir.join("graph"));
        let mut writer = GraphWriter::open(&config).unwrap();
        writer.write_nodes(USER, vec![user(1)]).unwrap();
        writer.complete(&completion("aa11")).unwrap();
        config
    }

    #[test]
    fn test_rerun_clears_and_restores_completion_marker() {
        let dir = tempfile::tempdir().unwrap();
        let config = completed_target(dir.path());

        let mut writer = GraphWriter::open(&config).unwrap();
        assert_eq!(writer.previous().unwrap().source_sha256, "aa11");
        assert!(writer.store().unwrap().completion().unwrap().is_none());

        writer.write_nodes(USER, vec![user(2)]).unwrap();
        assert_eq!(writer.rollback().unwrap(), 1);

        let store = GraphStore::open(config.store_config()).unwrap();
        assert!(store.contains_node(USER, 1).unwrap());
        assert!(!store.contains_node(USER, 2).unwrap());
        let marker: Completion =
            serde_json::from_slice(&store.completion().unwrap().unwrap()).unwrap();
        assert_eq!(marker.source_sha256, "aa11");
    }

    #[test]
    fn test_failed_collection_undo_fails_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let config = completed_target(dir.path());

        let mut writer = GraphWriter::open(&config).unwrap();
        writer.write_nodes(USER, vec![user(2)]).unwrap();
        writer.stranded = Some(StoreError::RollbackFailed {
            tree: "node:Book".to_string(),
            reason: "no space left on device".to_string(),
        });

        let err = writer.rollback().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TargetWriteError);
        assert!(err.to_string().contains("rollback of node:Book failed"), "{err}");

        // Journaled writes are still undone; the marker stays cleared so the
        // next run starts over.
        let store = GraphStore::open(config.store_config()).unwrap();
        assert!(!store.contains_node(USER, 2).unwrap());
        assert!(store.completion().unwrap().is_none());
    }

    #[test]
    fn test_created_target_is_removed_despite_failed_undo() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigrationConfig::new(dir.path().join("books.db"), dir.path().join("graph"));

        let mut writer = GraphWriter::open(&config).unwrap();
        writer.write_nodes(USER, vec![user(1)]).unwrap();
        writer.stranded = Some(StoreError::RollbackFailed {
            tree: "node:User".to_string(),
            reason: "io".to_string(),
        });

        writer.rollback().unwrap();
        assert!(!config.target.exists());
    }

    #[test]
    fn test_failed_write_rolls_back_collection() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigrationConfig::new(dir.path().join("books.db"), dir.path().join("graph"))
            .with_batch_size(1);

        let mut writer = GraphWriter::open(&config).unwrap();
        let bad = Err(MigrationError::field(USER, 3, "username", "is required"));
        let err = writer
            .write_nodes(USER, vec![user(1), user(2), bad])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FieldMappingError);
        assert_eq!(writer.store().unwrap().count_nodes(USER).unwrap(), 0);
        assert!(writer.stranded.is_none());
    }
}
