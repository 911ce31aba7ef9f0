//! Key encoding for node and edge trees.

use std::fmt;

/// Size of an encoded node identifier.
pub const ID_SIZE: usize = 8;

/// Size of an encoded edge key.
pub const EDGE_KEY_SIZE: usize = ID_SIZE * 2;

/// Encode a node identifier.
///
/// The sign bit is flipped before big-endian encoding so that lexicographic
/// key order matches numeric order, including for negative identifiers.
pub fn encode_id(id: i64) -> [u8; ID_SIZE] {
    ((id as u64) ^ (1 << 63)).to_be_bytes()
}

/// Decode a node identifier.
pub fn decode_id(bytes: &[u8]) -> Option<i64> {
    let raw: [u8; ID_SIZE] = bytes.try_into().ok()?;
    Some((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
}

/// Key of one edge: `[from_id (8 bytes)][to_id (8 bytes)]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey {
    /// Source node identifier.
    pub from: i64,
    /// Target node identifier.
    pub to: i64,
}

impl EdgeKey {
    /// Create an edge key.
    pub fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }

    /// Encode the key to bytes.
    pub fn encode(&self) -> [u8; EDGE_KEY_SIZE] {
        let mut buf = [0u8; EDGE_KEY_SIZE];
        buf[..ID_SIZE].copy_from_slice(&encode_id(self.from));
        buf[ID_SIZE..].copy_from_slice(&encode_id(self.to));
        buf
    }

    /// Decode a key from bytes.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != EDGE_KEY_SIZE {
            return None;
        }
        Some(Self {
            from: decode_id(&bytes[..ID_SIZE])?,
            to: decode_id(&bytes[ID_SIZE..])?,
        })
    }
}

impl fmt::Debug for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} -> {})", self.from, self.to)
    }
}

/// Tree holding nodes of one label.
pub fn node_tree_name(label: &str) -> String {
    format!("node:{label}")
}

/// Tree holding edges of one type.
pub fn edge_tree_name(edge_type: &str) -> String {
    format!("edge:{edge_type}")
}

/// Get current timestamp in microseconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
