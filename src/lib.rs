//! Peer-to-peer service-node registry and Proof-of-Service reputation
//! engine.
//!
//! The crate tracks the dynamic set of collateral-backed service entries a
//! node learns about through gossip: announcements introduce and refresh
//! entries, pings keep them alive, and pairwise verifications prove that
//! an address really is operated by the entry claiming it. On top of that
//! state the engine answers the two queries the rest of the node cares
//! about, deterministically on every node: who gets paid at a given block
//! height, and how the entries rank under the block-hash-seeded score.
//!
//! Embedders construct a [`registry::RegistryCore`] with the collaborator
//! interfaces from [`interfaces`], feed inbound traffic through
//! [`registry::RegistryCore::process_message`], and drive periodic work
//! (housekeeping, verification rounds, pending-request queues) from their
//! scheduler. [`storage::RegistryStore`] persists the whole registry as a
//! single versioned blob across restarts.
//!
//! Lock hierarchy: chain state (held inside [`interfaces::ChainOps`]
//! implementations) before the registry lock; the pending-verification
//! queue is a leaf. Code in this crate resolves chain data before taking
//! the registry lock wherever an operation needs both.

pub mod caches;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod entry;
pub mod errors;
pub mod interfaces;
pub mod messages;
pub mod registry;
pub mod storage;
pub mod types;
pub mod verify;

pub use config::RegistryConfig;
pub use entry::{Entry, EntrySnapshot, EntryState};
pub use errors::{RegistryError, RegistryResult};
pub use interfaces::{
    ActiveIdentity, ChainOps, GovernanceOps, IdentityOps, NetOps, PaymentOps, PeerId, SyncOps,
};
pub use messages::{Broadcast, Ping, Verification, WireMessage};
pub use registry::{RegistryCore, RegistrySnapshot};
pub use storage::RegistryStore;
pub use types::{BlockHash, Hash256, OutPoint};
