//! Graph store implementation.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use sled::{Db, Tree};
use tracing::{debug, info};

use super::key::{decode_id, edge_tree_name, encode_id, node_tree_name, EdgeKey};
use super::transaction::{CommitRecord, EdgeTxn, NodeTxn};
use super::{NodeRecord, StoreConfig};
use crate::error::Error;
use crate::schema::{EdgeTypeDef, GraphSchema, NodeTypeDef, SchemaDeclaration};

/// Tree name for store metadata.
const META_TREE: &str = "meta";

/// Tree name for type declarations.
const SCHEMA_TREE: &str = "schema";

/// Format marker written to every store this crate creates.
pub const FORMAT_MARKER: &[u8] = b"shelfgraph/1";

/// Meta key holding the format marker.
const FORMAT_KEY: &[u8] = b"format";

/// Meta key holding the completion marker.
const COMPLETED_KEY: &[u8] = b"migration:completed";

/// Name sled gives its default tree.
const SLED_DEFAULT_TREE: &[u8] = b"__sled__default";

#[derive(Debug, Default)]
struct SchemaCache {
    nodes: HashMap<String, NodeTypeDef>,
    edges: HashMap<String, EdgeTypeDef>,
}

/// An embedded property-graph store backed by sled.
pub struct GraphStore {
    /// The underlying sled database.
    db: Db,

    /// Tree for metadata.
    meta_tree: Tree,

    /// Tree for type declarations.
    schema_tree: Tree,

    /// Decoded declarations.
    schema: RwLock<SchemaCache>,
}

impl GraphStore {
    /// Open or create a store with the given configuration.
    ///
    /// A directory holding a sled database without the shelfgraph format
    /// marker is rejected with [`Error::FormatMismatch`].
    pub fn open(config: StoreConfig) -> Result<Self, Error> {
        let sled_config = config.to_sled_config();
        let db = sled_config.open()?;

        let foreign = db.tree_names().iter().any(|name| {
            let name: &[u8] = name;
            name != SLED_DEFAULT_TREE && name != META_TREE.as_bytes()
        }) || !db.is_empty();
        let meta_tree = db.open_tree(META_TREE)?;

        match meta_tree.get(FORMAT_KEY)? {
            Some(found) if &found[..] == FORMAT_MARKER => {}
            None if !foreign => {
                meta_tree.insert(FORMAT_KEY, FORMAT_MARKER)?;
            }
            found => {
                return Err(Error::FormatMismatch {
                    path: config.path.clone(),
                    found: found
                        .map(|f| String::from_utf8_lossy(&f).into_owned())
                        .unwrap_or_else(|| "none".to_string()),
                    expected: String::from_utf8_lossy(FORMAT_MARKER).into_owned(),
                });
            }
        }

        let schema_tree = db.open_tree(SCHEMA_TREE)?;
        let mut cache = SchemaCache::default();
        for item in schema_tree.iter() {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key).into_owned();
            if let Some(label) = key.strip_prefix("node:") {
                cache.nodes.insert(label.to_string(), NodeTypeDef::from_bytes(&value)?);
            } else if let Some(edge_type) = key.strip_prefix("edge:") {
                cache
                    .edges
                    .insert(edge_type.to_string(), EdgeTypeDef::from_bytes(&value)?);
            } else {
                return Err(Error::invalid_key(SCHEMA_TREE));
            }
        }

        debug!(
            path = %config.path.display(),
            node_types = cache.nodes.len(),
            edge_types = cache.edges.len(),
            "graph store opened"
        );

        Ok(Self {
            db,
            meta_tree,
            schema_tree,
            schema: RwLock::new(cache),
        })
    }

    /// Whether `path` looks like a sled directory.
    pub fn is_store_dir(path: &Path) -> bool {
        path.join("conf").is_file() && path.join("db").is_file()
    }

    // ========== Schema ==========

    /// Declare node and edge types.
    ///
    /// Types already present with the same shape are left alone. If any
    /// type conflicts, nothing is written.
    pub fn declare_schema(&self, schema: &GraphSchema) -> Result<SchemaDeclaration, Error> {
        let mut cache = self.schema.write();
        let mut new_nodes = Vec::new();
        let mut new_edges = Vec::new();

        for node in &schema.nodes {
            match cache.nodes.get(&node.name) {
                Some(existing) => {
                    if let Some(reason) = existing.shape_difference(node) {
                        return Err(Error::SchemaConflict {
                            type_name: node.name.clone(),
                            reason,
                        });
                    }
                }
                None => new_nodes.push(node),
            }
        }

        for edge in &schema.edges {
            match cache.edges.get(&edge.name) {
                Some(existing) if existing != edge => {
                    return Err(Error::SchemaConflict {
                        type_name: edge.name.clone(),
                        reason: format!(
                            "declared {} -> {}, expected {} -> {}",
                            existing.from, existing.to, edge.from, edge.to
                        ),
                    });
                }
                Some(_) => {}
                None => new_edges.push(edge),
            }
            for label in [&edge.from, &edge.to] {
                if !cache.nodes.contains_key(label) && schema.node(label).is_none() {
                    return Err(Error::UndeclaredType {
                        kind: "node",
                        name: label.clone(),
                    });
                }
            }
        }

        let mut batch = sled::Batch::default();
        let mut declaration = SchemaDeclaration::default();
        for node in &new_nodes {
            let key = node_tree_name(&node.name);
            batch.insert(key.as_bytes(), node.to_bytes()?);
            declaration.inserted.push(key);
        }
        for edge in &new_edges {
            let key = edge_tree_name(&edge.name);
            batch.insert(key.as_bytes(), edge.to_bytes()?);
            declaration.inserted.push(key);
        }
        self.schema_tree.apply_batch(batch)?;

        for node in new_nodes {
            cache.nodes.insert(node.name.clone(), node.clone());
        }
        for edge in new_edges {
            cache.edges.insert(edge.name.clone(), edge.clone());
        }

        if !declaration.is_noop() {
            info!(types = ?declaration.inserted, "schema declared");
        }
        Ok(declaration)
    }

    /// Remove the types a declaration added, along with their trees.
    pub fn retract_schema(&self, declaration: &SchemaDeclaration) -> Result<(), Error> {
        let mut cache = self.schema.write();
        for key in &declaration.inserted {
            self.schema_tree.remove(key.as_bytes())?;
            self.db.drop_tree(key.as_bytes())?;
            if let Some(label) = key.strip_prefix("node:") {
                cache.nodes.remove(label);
            } else if let Some(edge_type) = key.strip_prefix("edge:") {
                cache.edges.remove(edge_type);
            }
        }
        Ok(())
    }

    /// Declared node type for a label.
    pub fn node_type(&self, label: &str) -> Option<NodeTypeDef> {
        self.schema.read().nodes.get(label).cloned()
    }

    /// Declared edge type by name.
    pub fn edge_type(&self, edge_type: &str) -> Option<EdgeTypeDef> {
        self.schema.read().edges.get(edge_type).cloned()
    }

    /// All declared types.
    pub fn schema(&self) -> GraphSchema {
        let cache = self.schema.read();
        let mut nodes: Vec<_> = cache.nodes.values().cloned().collect();
        let mut edges: Vec<_> = cache.edges.values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        edges.sort_by(|a, b| a.name.cmp(&b.name));
        GraphSchema { nodes, edges }
    }

    // ========== Nodes ==========

    /// Begin a write transaction over one node collection.
    pub fn begin_nodes(&self, label: &str, batch_size: usize) -> Result<NodeTxn, Error> {
        let def = self.node_type(label).ok_or_else(|| Error::UndeclaredType {
            kind: "node",
            name: label.to_string(),
        })?;
        let tree = self.db.open_tree(node_tree_name(label))?;
        Ok(NodeTxn::new(def, tree, batch_size))
    }

    /// Get a node by identifier.
    pub fn get_node(&self, label: &str, id: i64) -> Result<Option<NodeRecord>, Error> {
        match self.node_tree(label)?.get(encode_id(id))? {
            Some(bytes) => Ok(Some(NodeRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether a node exists.
    pub fn contains_node(&self, label: &str, id: i64) -> Result<bool, Error> {
        Ok(self.node_tree(label)?.contains_key(encode_id(id))?)
    }

    /// Number of nodes with a label.
    pub fn count_nodes(&self, label: &str) -> Result<usize, Error> {
        Ok(self.node_tree(label)?.len())
    }

    /// Identifiers of all nodes with a label, ascending.
    pub fn node_ids(&self, label: &str) -> Result<Vec<i64>, Error> {
        let tree = self.node_tree(label)?;
        let tree_name = node_tree_name(label);
        tree.iter()
            .keys()
            .map(|key| {
                let key = key?;
                decode_id(&key).ok_or_else(|| Error::invalid_key(tree_name.as_str()))
            })
            .collect()
    }

    /// Remove a node. Edges referencing it are left in place.
    pub fn remove_node(&self, label: &str, id: i64) -> Result<bool, Error> {
        Ok(self.node_tree(label)?.remove(encode_id(id))?.is_some())
    }

    // ========== Edges ==========

    /// Begin a write transaction over one edge collection.
    pub fn begin_edges(&self, edge_type: &str, batch_size: usize) -> Result<EdgeTxn, Error> {
        let def = self.edge_type(edge_type).ok_or_else(|| Error::UndeclaredType {
            kind: "edge",
            name: edge_type.to_string(),
        })?;
        let from_nodes = self.node_tree(&def.from)?;
        let to_nodes = self.node_tree(&def.to)?;
        let tree = self.db.open_tree(edge_tree_name(edge_type))?;
        Ok(EdgeTxn::new(def, tree, from_nodes, to_nodes, batch_size))
    }

    /// Whether an edge exists.
    pub fn contains_edge(&self, edge_type: &str, from: i64, to: i64) -> Result<bool, Error> {
        Ok(self
            .edge_tree(edge_type)?
            .contains_key(EdgeKey::new(from, to).encode())?)
    }

    /// Number of edges of a type.
    pub fn count_edges(&self, edge_type: &str) -> Result<usize, Error> {
        Ok(self.edge_tree(edge_type)?.len())
    }

    /// Scan all edges of a type, ordered by source then target.
    pub fn scan_edges(
        &self,
        edge_type: &str,
    ) -> Result<impl Iterator<Item = Result<EdgeKey, Error>> + '_, Error> {
        let tree = self.edge_tree(edge_type)?;
        let tree_name = edge_tree_name(edge_type);
        Ok(tree.iter().keys().map(move |key| {
            let key = key?;
            EdgeKey::decode(&key).ok_or_else(|| Error::invalid_key(tree_name.as_str()))
        }))
    }

    // ========== Run bookkeeping ==========

    /// Undo a committed collection by removing the keys it inserted.
    pub fn revert(&self, record: &CommitRecord) -> Result<usize, Error> {
        let tree = self.db.open_tree(&record.tree)?;
        let mut batch = sled::Batch::default();
        for key in &record.inserted {
            batch.remove(key.as_slice());
        }
        tree.apply_batch(batch)?;
        info!(tree = %record.tree, removed = record.inserted.len(), "collection reverted");
        Ok(record.inserted.len())
    }

    /// Record that a run finished and was verified.
    pub fn mark_completed(&self, summary: &[u8]) -> Result<(), Error> {
        self.meta_tree.insert(COMPLETED_KEY, summary)?;
        self.flush()
    }

    /// Completion marker written by a previous run, if any.
    pub fn completion(&self) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.meta_tree.get(COMPLETED_KEY)?.map(|v| v.to_vec()))
    }

    /// Remove the completion marker.
    pub fn clear_completion(&self) -> Result<(), Error> {
        self.meta_tree.remove(COMPLETED_KEY)?;
        Ok(())
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }

    fn node_tree(&self, label: &str) -> Result<Tree, Error> {
        if !self.schema.read().nodes.contains_key(label) {
            return Err(Error::UndeclaredType {
                kind: "node",
                name: label.to_string(),
            });
        }
        Ok(self.db.open_tree(node_tree_name(label))?)
    }

    fn edge_tree(&self, edge_type: &str) -> Result<Tree, Error> {
        if !self.schema.read().edges.contains_key(edge_type) {
            return Err(Error::UndeclaredType {
                kind: "edge",
                name: edge_type.to_string(),
            });
        }
        Ok(self.db.open_tree(edge_tree_name(edge_type))?)
    }
}
