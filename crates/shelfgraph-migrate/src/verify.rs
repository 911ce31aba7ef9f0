//! Post-write verification of the target against the source.
//!
//! Checks, in order: node counts per label, edge counts per type, edge
//! endpoints and per-target cardinality, then attribute parity for the first
//! and last `sample_size` records of every collection. All divergences are
//! collected before failing so the report names every one of them.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use shelfgraph_store::{GraphStore, NodeRecord};
use tracing::{debug, info, warn};

use crate::error::MigrationError;
use crate::mapper::{self, NodeDescriptor, BOOK, LOGGED, OWNS, READING_LOG, READ_ON, USER};
use crate::source::{BookRow, ReadingLogRow, SourceReader, SourceRecord, UserRow};

/// Identifiers listed per count mismatch.
const MAX_LISTED: usize = 20;

/// One divergence between source and target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Mismatch {
    /// Node count differs from the source row count.
    NodeCount {
        label: String,
        source: u64,
        target: u64,
        /// Source identifiers without a node.
        missing: Vec<i64>,
        /// Nodes without a source row.
        unexpected: Vec<i64>,
    },
    /// Edge count differs from the source relation count.
    EdgeCount {
        edge_type: String,
        source: u64,
        target: u64,
    },
    /// A node does not have exactly one incoming edge of a type.
    EdgeCardinality {
        edge_type: String,
        label: String,
        id: i64,
        found: usize,
    },
    /// An edge endpoint has no node.
    DanglingEdge {
        edge_type: String,
        from: i64,
        to: i64,
        missing_label: String,
        missing_id: i64,
    },
    /// A sampled node's attributes differ from its source row.
    Attribute {
        label: String,
        id: i64,
        diverging: Vec<String>,
    },
    /// A sampled source row has no node.
    MissingSampleNode { label: String, id: i64 },
    /// A sampled source row's relationship has no edge.
    MissingSampleEdge {
        edge_type: String,
        from: i64,
        to: i64,
    },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::NodeCount {
                label,
                source,
                target,
                missing,
                unexpected,
            } => {
                write!(f, "{label} nodes: source {source}, target {target}")?;
                if !missing.is_empty() {
                    write!(f, ", missing ids {}", join_ids(missing))?;
                }
                if !unexpected.is_empty() {
                    write!(f, ", unexpected ids {}", join_ids(unexpected))?;
                }
                Ok(())
            }
            Mismatch::EdgeCount {
                edge_type,
                source,
                target,
            } => write!(f, "{edge_type} edges: source {source}, target {target}"),
            Mismatch::EdgeCardinality {
                edge_type,
                label,
                id,
                found,
            } => write!(f, "{label} {id} has {found} {edge_type} edges, expected 1"),
            Mismatch::DanglingEdge {
                edge_type,
                from,
                to,
                missing_label,
                missing_id,
            } => write!(
                f,
                "{edge_type} ({from} -> {to}) points at missing {missing_label} {missing_id}"
            ),
            Mismatch::Attribute {
                label,
                id,
                diverging,
            } => write!(f, "{label} {id} differs in {}", diverging.join(", ")),
            Mismatch::MissingSampleNode { label, id } => {
                write!(f, "sampled {label} {id} is missing")
            }
            Mismatch::MissingSampleEdge {
                edge_type,
                from,
                to,
            } => write!(f, "sampled {edge_type} ({from} -> {to}) is missing"),
        }
    }
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Source and target counts of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountCheck {
    /// Node label or edge type.
    pub name: String,
    /// Count expected from the source.
    pub source: u64,
    /// Count found in the target.
    pub target: u64,
}

/// Result of a passing verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationSummary {
    /// Node counts per label.
    pub nodes: Vec<CountCheck>,
    /// Edge counts per type.
    pub edges: Vec<CountCheck>,
    /// Records compared attribute by attribute.
    pub sampled: usize,
    /// Edges whose endpoints were checked.
    pub edges_scanned: usize,
}

/// Compares the target store with the source snapshot.
pub struct IntegrityVerifier<'a> {
    source: &'a SourceReader,
    store: &'a GraphStore,
    sample_size: usize,
}

impl<'a> IntegrityVerifier<'a> {
    /// Create a verifier sampling `sample_size` records from each end of
    /// every collection.
    pub fn new(source: &'a SourceReader, store: &'a GraphStore, sample_size: usize) -> Self {
        Self {
            source,
            store,
            sample_size,
        }
    }

    /// Run every check.
    ///
    /// Fails with [`MigrationError::Verification`] listing all mismatches.
    pub fn verify(&self) -> Result<VerificationSummary, MigrationError> {
        let mut mismatches = Vec::new();
        let mut summary = VerificationSummary::default();

        summary.nodes.push(self.check_nodes::<UserRow>(USER, &mut mismatches)?);
        summary.nodes.push(self.check_nodes::<BookRow>(BOOK, &mut mismatches)?);
        summary
            .nodes
            .push(self.check_nodes::<ReadingLogRow>(READING_LOG, &mut mismatches)?);

        for (edge_type, expected) in [
            (OWNS, self.source.owns_count()?),
            (LOGGED, self.source.logged_count()?),
            (READ_ON, self.source.read_on_count()?),
        ] {
            let found = self.store.count_edges(edge_type)? as u64;
            if found != expected {
                mismatches.push(Mismatch::EdgeCount {
                    edge_type: edge_type.to_string(),
                    source: expected,
                    target: found,
                });
            }
            summary.edges.push(CountCheck {
                name: edge_type.to_string(),
                source: expected,
                target: found,
            });
            summary.edges_scanned += self.check_edges(edge_type, &mut mismatches)?;
        }

        summary.sampled += self.check_samples::<UserRow>(USER, mapper::map_user, &mut mismatches)?;
        summary.sampled += self.check_samples::<BookRow>(BOOK, mapper::map_book, &mut mismatches)?;
        summary.sampled += self.check_samples::<ReadingLogRow>(
            READING_LOG,
            mapper::map_reading_log,
            &mut mismatches,
        )?;

        if !mismatches.is_empty() {
            for mismatch in &mismatches {
                warn!(%mismatch, "verification mismatch");
            }
            return Err(MigrationError::Verification { mismatches });
        }

        info!(
            sampled = summary.sampled,
            edges_scanned = summary.edges_scanned,
            "verification passed"
        );
        Ok(summary)
    }

    fn check_nodes<T: SourceRecord>(
        &self,
        label: &str,
        mismatches: &mut Vec<Mismatch>,
    ) -> Result<CountCheck, MigrationError> {
        let expected = self.source.count::<T>()?;
        let found = self.store.count_nodes(label)? as u64;
        if found != expected {
            let source_ids: BTreeSet<i64> = self.source.ids::<T>()?.into_iter().collect();
            let target_ids: BTreeSet<i64> = self.store.node_ids(label)?.into_iter().collect();
            mismatches.push(Mismatch::NodeCount {
                label: label.to_string(),
                source: expected,
                target: found,
                missing: source_ids
                    .difference(&target_ids)
                    .take(MAX_LISTED)
                    .copied()
                    .collect(),
                unexpected: target_ids
                    .difference(&source_ids)
                    .take(MAX_LISTED)
                    .copied()
                    .collect(),
            });
        }
        Ok(CountCheck {
            name: label.to_string(),
            source: expected,
            target: found,
        })
    }

    /// Endpoint existence and exactly one incoming edge per target node.
    fn check_edges(
        &self,
        edge_type: &str,
        mismatches: &mut Vec<Mismatch>,
    ) -> Result<usize, MigrationError> {
        let Some(def) = self.store.edge_type(edge_type) else {
            return Err(shelfgraph_store::Error::UndeclaredType {
                kind: "edge",
                name: edge_type.to_string(),
            }
            .into());
        };

        let mut incoming: HashMap<i64, usize> = HashMap::new();
        let mut scanned = 0;
        for key in self.store.scan_edges(edge_type)? {
            let key = key?;
            scanned += 1;
            *incoming.entry(key.to).or_default() += 1;

            for (label, id) in [(&def.from, key.from), (&def.to, key.to)] {
                if !self.store.contains_node(label, id)? {
                    mismatches.push(Mismatch::DanglingEdge {
                        edge_type: edge_type.to_string(),
                        from: key.from,
                        to: key.to,
                        missing_label: label.clone(),
                        missing_id: id,
                    });
                }
            }
        }

        for id in self.store.node_ids(&def.to)? {
            let found = incoming.get(&id).copied().unwrap_or(0);
            if found != 1 {
                mismatches.push(Mismatch::EdgeCardinality {
                    edge_type: edge_type.to_string(),
                    label: def.to.clone(),
                    id,
                    found,
                });
            }
        }

        debug!(edge_type, scanned, "edges checked");
        Ok(scanned)
    }

    fn check_samples<T: SourceRecord + SampleEdges>(
        &self,
        label: &str,
        map: fn(&T) -> Result<NodeDescriptor, MigrationError>,
        mismatches: &mut Vec<Mismatch>,
    ) -> Result<usize, MigrationError> {
        let mut ids: BTreeSet<i64> = self
            .source
            .first_ids::<T>(self.sample_size)?
            .into_iter()
            .collect();
        ids.extend(self.source.last_ids::<T>(self.sample_size)?);

        let mut sampled = 0;
        for id in ids {
            let Some(row) = self.source.fetch::<T>(id)? else {
                continue;
            };
            sampled += 1;

            let expected = map(&row)?;
            match self.store.get_node(label, id)? {
                None => mismatches.push(Mismatch::MissingSampleNode {
                    label: label.to_string(),
                    id,
                }),
                Some(NodeRecord { properties, .. }) => {
                    let diverging = expected.properties.diverging(&properties);
                    if !diverging.is_empty() {
                        mismatches.push(Mismatch::Attribute {
                            label: label.to_string(),
                            id,
                            diverging,
                        });
                    }
                }
            }

            for (edge_type, from, to) in row.sample_edges() {
                if !self.store.contains_edge(edge_type, from, to)? {
                    mismatches.push(Mismatch::MissingSampleEdge {
                        edge_type: edge_type.to_string(),
                        from,
                        to,
                    });
                }
            }
        }
        Ok(sampled)
    }
}

/// Relationships a source row implies, for spot checks.
trait SampleEdges {
    fn sample_edges(&self) -> Vec<(&'static str, i64, i64)>;
}

impl SampleEdges for UserRow {
    fn sample_edges(&self) -> Vec<(&'static str, i64, i64)> {
        Vec::new()
    }
}

impl SampleEdges for BookRow {
    fn sample_edges(&self) -> Vec<(&'static str, i64, i64)> {
        self.user_id
            .map(|user| (OWNS, user, self.id))
            .into_iter()
            .collect()
    }
}

impl SampleEdges for ReadingLogRow {
    fn sample_edges(&self) -> Vec<(&'static str, i64, i64)> {
        let mut edges = Vec::with_capacity(2);
        if let Some(user) = self.user_id {
            edges.push((LOGGED, user, self.id));
        }
        if let Some(book) = self.book_id {
            edges.push((READ_ON, book, self.id));
        }
        edges
    }
}
