use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry not synced: {0}")]
    NotSynced(&'static str),
    #[error("duplicate collateral outpoint")]
    DuplicateOutpoint,
    #[error("duplicate service address")]
    DuplicateAddr,
    #[error("unknown collateral outpoint")]
    UnknownOutpoint,
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("stale block height {height}, tip {tip}")]
    StaleHeight { height: u64, tip: u64 },
    #[error("block hash unavailable at height {0}")]
    BlockHashUnavailable(u64),
    #[error("verification nonce mismatch: requested {requested}, received {received}")]
    NonceMismatch { requested: u32, received: u32 },
    #[error("verification height mismatch: requested {requested}, received {received}")]
    HeightMismatch { requested: u64, received: u64 },
    #[error("rank {rank} is below the verification threshold {max}")]
    RankTooLow { rank: u32, max: u32 },
    #[error("address already verified recently")]
    AlreadyVerified,
    #[error("verification names the same entry twice")]
    SelfVerify,
    #[error("pending request timed out")]
    Timeout,
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// A message rejection paired with the misbehavior score the offending peer
/// should be charged. A score of zero means "drop silently".
#[derive(Debug)]
pub struct Rejection {
    pub error: RegistryError,
    pub misbehavior: i32,
}

impl Rejection {
    pub fn new(error: RegistryError, misbehavior: i32) -> Self {
        Self { error, misbehavior }
    }

    pub fn silent(error: RegistryError) -> Self {
        Self::new(error, 0)
    }
}
