use std::fmt;

use serde::{Deserialize, Serialize};

/// Reference to the funding UTXO that backs a registry entry.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OutPoint {
    pub txid: [u8; 32],
    pub vout: u32,
}

impl OutPoint {
    pub const fn new(txid: [u8; 32], vout: u32) -> Self {
        Self { txid, vout }
    }

    /// The null outpoint is used on the wire to request a full list sync.
    pub const fn null() -> Self {
        Self {
            txid: [0u8; 32],
            vout: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::null()
    }

    pub fn short(&self) -> String {
        format!("{}-{}", hex::encode(&self.txid[..8]), self.vout)
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// 256-bit hash used for message identities, block hashes and scores.
/// Ordering is lexicographic over the bytes, which matches big-endian
/// numeric ordering of the value.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

pub type BlockHash = Hash256;

/// Deterministic per-block score of an entry; compared as a 256-bit
/// big-endian unsigned integer.
pub type Score = Hash256;
