//! Interfaces presented by the rest of the node. The registry engine only
//! ever touches chain state, networking, sync progress, payments,
//! governance and the local service identity through these traits, so the
//! engine can be driven by the real node or by in-memory test doubles.

use std::net::SocketAddr;
use std::sync::Arc;

use ed25519_dalek::Keypair;

use crate::crypto::SignatureScheme;
use crate::messages::WireMessage;
use crate::types::{BlockHash, Hash256, OutPoint};

/// Opaque handle the network layer uses to identify a connected peer.
pub type PeerId = u64;

/// Chain state owned by the validation layer. Implementations hold the
/// chain lock internally; callers that take the registry lock as well must
/// order chain access first (see the crate-level lock hierarchy).
pub trait ChainOps: Send + Sync {
    fn block_hash_at(&self, height: u64) -> Option<BlockHash>;
    /// Height of a known block; `None` when the hash is not in the index.
    fn block_height_of(&self, hash: &BlockHash) -> Option<u64>;
    fn current_tip_height(&self) -> u64;
    /// Confirmation depth of the collateral UTXO; `None` once spent or
    /// never seen.
    fn utxo_confirmations(&self, outpoint: &OutPoint) -> Option<i64>;
    /// Network-adjusted unix time; the engine's only clock.
    fn adjusted_time(&self) -> i64;
    /// Signature scheme currently in force for registry messages.
    fn signature_scheme(&self) -> SignatureScheme {
        SignatureScheme::Hash
    }
}

/// Outbound surface of the P2P layer.
pub trait NetOps: Send + Sync {
    fn push_message(&self, peer: PeerId, message: WireMessage);
    fn for_each_peer(&self, f: &mut dyn FnMut(PeerId, SocketAddr));
    fn find_peer(&self, addr: &SocketAddr) -> Option<PeerId>;
    /// Schedule an outbound connection to a service entry.
    fn add_pending_peer(&self, addr: SocketAddr);
    fn is_connected_or_pending(&self, addr: &SocketAddr) -> bool;
    fn misbehaving(&self, peer: PeerId, score: i32);
    /// Feed a gossiped service address into the address book.
    fn add_address(&self, addr: SocketAddr, source: SocketAddr);
    /// Drop an inbound hash from the peer's ask-for queue.
    fn erase_asked(&self, _peer: PeerId, _hash: Hash256) {}
    /// Cheap reachability check used by the duplicate-address sweep.
    /// Implementations may answer from cached connection state.
    fn probe_connect(&self, addr: &SocketAddr) -> bool;
}

impl dyn NetOps {
    /// Send a message to every connected peer.
    pub fn relay(&self, message: &WireMessage) {
        self.for_each_peer(&mut |peer, _addr| {
            self.push_message(peer, message.clone());
        });
    }
}

/// Progress of the initial sync state machine.
pub trait SyncOps: Send + Sync {
    fn is_blockchain_synced(&self) -> bool;
    fn is_list_synced(&self) -> bool;
    fn is_winners_synced(&self) -> bool;
    fn is_fully_synced(&self) -> bool;
    /// Keep the sync timeout alive while useful data is still arriving.
    fn bump_asset_last_time(&self, tag: &str);
}

/// Payment schedule queries owned by the block-reward module.
pub trait PaymentOps: Send + Sync {
    /// True when the entry is already slated for payment within the
    /// propagation window (~8 blocks) above `height`.
    fn is_scheduled(&self, outpoint: &OutPoint, height: u64) -> bool;
    fn min_protocol_version(&self) -> u32;
    /// How many payment blocks the node keeps; bounds last-paid rescans.
    fn storage_limit(&self) -> u64;
    /// Most recent payment to `outpoint` at or below `height`, scanning at
    /// most `scan_back` blocks; `(block height, block time)`.
    fn last_paid_at(&self, outpoint: &OutPoint, height: u64, scan_back: u64) -> Option<(u64, i64)>;
}

/// Governance reacts to registry membership changes.
pub trait GovernanceOps: Send + Sync {
    fn entries_added(&self);
    fn entries_removed(&self, dirty_vote_hashes: &[Hash256]);
}

/// Hook used when our own announcement arrives from the network and the
/// local identity machinery must re-arm itself.
pub trait IdentityOps: Send + Sync {
    fn manage_state(&self);
}

/// The local operator-controlled service identity. A plain value handed to
/// the verification entry points; absent on ordinary full nodes.
#[derive(Clone)]
pub struct ActiveIdentity {
    pub outpoint: OutPoint,
    pub service_addr: SocketAddr,
    pub keypair: Arc<Keypair>,
}

impl ActiveIdentity {
    pub fn new(outpoint: OutPoint, service_addr: SocketAddr, keypair: Arc<Keypair>) -> Self {
        Self {
            outpoint,
            service_addr,
            keypair,
        }
    }

    pub fn service_pubkey(&self) -> [u8; 32] {
        self.keypair.public.to_bytes()
    }
}
