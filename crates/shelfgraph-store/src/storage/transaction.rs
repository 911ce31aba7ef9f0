//! Collection write transactions.
//!
//! A collection transaction covers every write to one node label or one edge
//! type. Writes are staged and applied as atomic sled batches of bounded
//! size. Every key the transaction inserts is logged, so a rollback (explicit
//! or on drop without commit) removes exactly what this transaction added and
//! leaves previously committed data in place.

use std::collections::{HashMap, HashSet};

use sled::Tree;
use tracing::{debug, warn};

use super::key::{current_timestamp, edge_tree_name, encode_id, node_tree_name, EdgeKey};
use super::NodeRecord;
use crate::error::{Endpoint, Error};
use crate::schema::{EdgeTypeDef, NodeTypeDef};
use crate::value::Properties;

/// What a single `put` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The entry was staged for insertion.
    Written,
    /// An identical entry already exists.
    Unchanged,
}

/// Counts for one committed collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSummary {
    /// Node label or edge type.
    pub collection: String,
    /// Entries inserted by this transaction.
    pub written: usize,
    /// Entries that already existed unchanged.
    pub unchanged: usize,
    /// Number of sled batches applied.
    pub batches: usize,
}

/// Keys inserted by a committed collection, for run-level undo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitRecord {
    /// Tree the keys live in.
    pub tree: String,
    /// Inserted keys.
    pub inserted: Vec<Vec<u8>>,
}

/// Staging buffer and undo log shared by node and edge transactions.
struct BatchLog {
    tree: Tree,
    tree_name: String,
    batch_size: usize,
    pending: Vec<(Vec<u8>, Vec<u8>)>,
    inserted: Vec<Vec<u8>>,
    unchanged: usize,
    batches: usize,
    finished: bool,
}

impl BatchLog {
    fn new(tree: Tree, tree_name: String, batch_size: usize) -> Self {
        Self {
            tree,
            tree_name,
            batch_size: batch_size.max(1),
            pending: Vec::new(),
            inserted: Vec::new(),
            unchanged: 0,
            batches: 0,
            finished: false,
        }
    }

    fn stage(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), Error> {
        self.pending.push((key, value));
        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut batch = sled::Batch::default();
        for (key, value) in &self.pending {
            batch.insert(key.as_slice(), value.as_slice());
        }
        self.tree.apply_batch(batch)?;

        let applied = self.pending.len();
        self.inserted
            .extend(self.pending.drain(..).map(|(key, _)| key));
        self.batches += 1;
        debug!(
            tree = %self.tree_name,
            applied,
            total = self.inserted.len(),
            "batch applied"
        );
        Ok(())
    }

    fn commit(&mut self) -> Result<(CollectionSummary, CommitRecord), Error> {
        if let Err(e) = self.flush() {
            return Err(match self.rollback() {
                Ok(_) => e,
                Err(undo) => Error::RollbackFailed {
                    tree: self.tree_name.clone(),
                    reason: format!("{e}; undo failed: {undo}"),
                },
            });
        }
        self.finished = true;
        let summary = CollectionSummary {
            collection: self
                .tree_name
                .split_once(':')
                .map(|(_, name)| name.to_string())
                .unwrap_or_else(|| self.tree_name.clone()),
            written: self.inserted.len(),
            unchanged: self.unchanged,
            batches: self.batches,
        };
        let record = CommitRecord {
            tree: self.tree_name.clone(),
            inserted: std::mem::take(&mut self.inserted),
        };
        Ok((summary, record))
    }

    fn rollback(&mut self) -> Result<usize, Error> {
        self.finished = true;
        self.pending.clear();
        if self.inserted.is_empty() {
            return Ok(0);
        }

        let mut batch = sled::Batch::default();
        for key in &self.inserted {
            batch.remove(key.as_slice());
        }
        self.tree.apply_batch(batch)?;
        let removed = self.inserted.len();
        self.inserted.clear();
        debug!(tree = %self.tree_name, removed, "collection rolled back");
        Ok(removed)
    }
}

impl Drop for BatchLog {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.rollback() {
            warn!(tree = %self.tree_name, error = %e, "rollback on drop failed");
        }
    }
}

/// A write transaction over one node collection.
pub struct NodeTxn {
    def: NodeTypeDef,
    log: BatchLog,
    /// Staged but not yet applied nodes.
    staged: HashMap<i64, Properties>,
}

impl NodeTxn {
    pub(crate) fn new(def: NodeTypeDef, tree: Tree, batch_size: usize) -> Self {
        let tree_name = node_tree_name(&def.name);
        Self {
            def,
            log: BatchLog::new(tree, tree_name, batch_size),
            staged: HashMap::new(),
        }
    }

    /// Node label this transaction writes.
    pub fn label(&self) -> &str {
        &self.def.name
    }

    /// Stage a node.
    ///
    /// A node already stored with identical attributes is left alone. One
    /// stored with different attributes fails with
    /// [`Error::IdentifierCollision`].
    pub fn put(&mut self, id: i64, properties: Properties) -> Result<WriteOutcome, Error> {
        self.def.validate(id, &properties)?;

        let existing = match self.staged.get(&id) {
            Some(staged) => Some(staged.clone()),
            None => match self.log.tree.get(encode_id(id))? {
                Some(bytes) => Some(NodeRecord::from_bytes(&bytes)?.properties),
                None => None,
            },
        };

        if let Some(stored) = existing {
            let diverging = stored.diverging(&properties);
            if diverging.is_empty() {
                self.log.unchanged += 1;
                return Ok(WriteOutcome::Unchanged);
            }
            return Err(Error::IdentifierCollision {
                label: self.def.name.clone(),
                id,
                diverging,
            });
        }

        let record = NodeRecord::new(properties);
        let value = record.to_bytes()?;
        self.staged.insert(id, record.properties);
        let before = self.log.batches;
        self.log.stage(encode_id(id).to_vec(), value)?;
        if self.log.batches != before {
            self.staged.clear();
        }
        Ok(WriteOutcome::Written)
    }

    /// Apply remaining writes and finish the transaction.
    pub fn commit(mut self) -> Result<(CollectionSummary, CommitRecord), Error> {
        self.log.commit()
    }

    /// Remove every node this transaction inserted.
    pub fn rollback(mut self) -> Result<usize, Error> {
        self.log.rollback()
    }
}

/// A write transaction over one edge collection.
pub struct EdgeTxn {
    def: EdgeTypeDef,
    log: BatchLog,
    from_nodes: Tree,
    to_nodes: Tree,
    staged: HashSet<EdgeKey>,
}

impl EdgeTxn {
    pub(crate) fn new(
        def: EdgeTypeDef,
        tree: Tree,
        from_nodes: Tree,
        to_nodes: Tree,
        batch_size: usize,
    ) -> Self {
        let tree_name = edge_tree_name(&def.name);
        Self {
            def,
            log: BatchLog::new(tree, tree_name, batch_size),
            from_nodes,
            to_nodes,
            staged: HashSet::new(),
        }
    }

    /// Edge type this transaction writes.
    pub fn edge_type(&self) -> &str {
        &self.def.name
    }

    /// Stage an edge. Both endpoints must already be stored.
    pub fn put(&mut self, from: i64, to: i64) -> Result<WriteOutcome, Error> {
        let dangling = |missing: Endpoint, missing_label: &str, missing_id: i64| {
            Error::DanglingEdge {
                edge_type: self.def.name.clone(),
                from_id: from,
                to_id: to,
                missing,
                missing_label: missing_label.to_string(),
                missing_id,
            }
        };
        if !self.from_nodes.contains_key(encode_id(from))? {
            return Err(dangling(Endpoint::From, &self.def.from, from));
        }
        if !self.to_nodes.contains_key(encode_id(to))? {
            return Err(dangling(Endpoint::To, &self.def.to, to));
        }

        let key = EdgeKey::new(from, to);
        if self.staged.contains(&key) || self.log.tree.contains_key(key.encode())? {
            self.log.unchanged += 1;
            return Ok(WriteOutcome::Unchanged);
        }

        self.staged.insert(key);
        let before = self.log.batches;
        self.log
            .stage(key.encode().to_vec(), current_timestamp().to_be_bytes().to_vec())?;
        if self.log.batches != before {
            self.staged.clear();
        }
        Ok(WriteOutcome::Written)
    }

    /// Apply remaining writes and finish the transaction.
    pub fn commit(mut self) -> Result<(CollectionSummary, CommitRecord), Error> {
        self.log.commit()
    }

    /// Remove every edge this transaction inserted.
    pub fn rollback(mut self) -> Result<usize, Error> {
        self.log.rollback()
    }
}

#[cfg(test)]
mod tests {
    use crate::schema::{GraphSchema, PropertyDef, ValueType};
    use crate::storage::{GraphStore, StoreConfig};
    use crate::value::Value;

    use super::*;

    fn store() -> (GraphStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = GraphStore::open(StoreConfig::new(dir.path().join("graph"))).unwrap();
        store
            .declare_schema(
                &GraphSchema::new()
                    .with_node(
                        NodeTypeDef::new("Book")
                            .with_property(PropertyDef::required("id", ValueType::Int64))
                            .with_property(PropertyDef::required("title", ValueType::String)),
                    )
                    .with_node(
                        NodeTypeDef::new("ReadingLog")
                            .with_property(PropertyDef::required("id", ValueType::Int64)),
                    )
                    .with_edge(EdgeTypeDef::new("READ_ON", "Book", "ReadingLog")),
            )
            .unwrap();
        (store, dir)
    }

    fn book(id: i64, title: &str) -> Properties {
        Properties::new().with("id", id).with("title", title)
    }

    #[test]
    fn test_batches_are_bounded() {
        let (store, _dir) = store();
        let mut txn = store.begin_nodes("Book", 3).unwrap();
        for id in 1..=7 {
            assert_eq!(txn.put(id, book(id, "t")).unwrap(), WriteOutcome::Written);
        }
        let (summary, record) = txn.commit().unwrap();

        assert_eq!(summary.collection, "Book");
        assert_eq!(summary.written, 7);
        assert_eq!(summary.batches, 3);
        assert_eq!(record.tree, "node:Book");
        assert_eq!(store.count_nodes("Book").unwrap(), 7);
    }

    #[test]
    fn test_identical_node_is_unchanged() {
        let (store, _dir) = store();
        let mut txn = store.begin_nodes("Book", 10).unwrap();
        txn.put(1, book(1, "Dune")).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin_nodes("Book", 10).unwrap();
        assert_eq!(txn.put(1, book(1, "Dune")).unwrap(), WriteOutcome::Unchanged);
        let (summary, record) = txn.commit().unwrap();
        assert_eq!(summary.written, 0);
        assert_eq!(summary.unchanged, 1);
        assert!(record.inserted.is_empty());
    }

    #[test]
    fn test_collision_names_diverging_property() {
        let (store, _dir) = store();
        let mut txn = store.begin_nodes("Book", 10).unwrap();
        txn.put(1, book(1, "Dune")).unwrap();

        // Still staged, not yet applied.
        let err = txn.put(1, book(1, "Emma")).unwrap_err();
        match err {
            Error::IdentifierCollision { label, id, diverging } => {
                assert_eq!(label, "Book");
                assert_eq!(id, 1);
                assert_eq!(diverging, vec!["title".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rollback_keeps_prior_commits() {
        let (store, _dir) = store();
        let mut txn = store.begin_nodes("Book", 10).unwrap();
        txn.put(1, book(1, "Dune")).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin_nodes("Book", 2).unwrap();
        txn.put(1, book(1, "Dune")).unwrap();
        for id in 2..=5 {
            txn.put(id, book(id, "t")).unwrap();
        }
        assert_eq!(txn.rollback().unwrap(), 4);
        assert_eq!(store.node_ids("Book").unwrap(), vec![1]);
    }

    #[test]
    fn test_drop_without_commit_rolls_back() {
        let (store, _dir) = store();
        {
            let mut txn = store.begin_nodes("Book", 1).unwrap();
            txn.put(1, book(1, "Dune")).unwrap();
            txn.put(2, book(2, "Emma")).unwrap();
        }
        assert_eq!(store.count_nodes("Book").unwrap(), 0);
    }

    #[test]
    fn test_property_violation_rejected() {
        let (store, _dir) = store();
        let mut txn = store.begin_nodes("Book", 10).unwrap();
        let err = txn
            .put(1, Properties::new().with("id", 1i64).with("title", Value::Null))
            .unwrap_err();
        assert!(matches!(err, Error::PropertyViolation { .. }));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let (store, _dir) = store();
        let mut books = store.begin_nodes("Book", 10).unwrap();
        books.put(1, book(1, "Dune")).unwrap();
        books.commit().unwrap();
        let mut logs = store.begin_nodes("ReadingLog", 10).unwrap();
        logs.put(5, Properties::new().with("id", 5i64)).unwrap();
        logs.commit().unwrap();

        let mut edges = store.begin_edges("READ_ON", 10).unwrap();
        assert_eq!(edges.put(1, 5).unwrap(), WriteOutcome::Written);
        assert_eq!(edges.put(1, 5).unwrap(), WriteOutcome::Unchanged);

        let err = edges.put(2, 5).unwrap_err();
        assert!(matches!(
            err,
            Error::DanglingEdge { missing: Endpoint::From, missing_id: 2, .. }
        ));
        let err = edges.put(1, 6).unwrap_err();
        assert!(matches!(
            err,
            Error::DanglingEdge { missing: Endpoint::To, ref missing_label, .. } if missing_label == "ReadingLog"
        ));

        let (summary, _) = edges.commit().unwrap();
        assert_eq!(summary.written, 1);
        assert_eq!(summary.unchanged, 1);
    }
}
