//! Stored node payloads.

use crate::error::Error;
use crate::value::Properties;
use rkyv::{Archive, Deserialize, Serialize};

/// A stored node with metadata.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node attributes.
    pub properties: Properties,

    /// Write timestamp in microseconds since Unix epoch.
    pub created_at: u64,
}

impl NodeRecord {
    /// Create a new record with the current timestamp.
    pub fn new(properties: Properties) -> Self {
        Self {
            properties,
            created_at: super::key::current_timestamp(),
        }
    }

    /// Serialize the record to bytes using rkyv.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a record read back from the store.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned(bytes))
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Copy stored bytes into a buffer rkyv can validate in place.
///
/// sled hands values back at arbitrary alignment.
pub(crate) fn aligned(bytes: &[u8]) -> rkyv::util::AlignedVec<16> {
    let mut buf: rkyv::util::AlignedVec<16> = rkyv::util::AlignedVec::with_capacity(bytes.len());
    buf.extend_from_slice(bytes);
    buf
}
