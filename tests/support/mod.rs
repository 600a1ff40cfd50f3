//! In-memory collaborator doubles for driving the registry engine in
//! integration tests.

// not every test binary exercises every helper
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use ed25519_dalek::{Keypair, SecretKey};
use parking_lot::Mutex;

use spn_registry::crypto::{generate_keypair, SignatureScheme};
use spn_registry::interfaces::{
    ChainOps, GovernanceOps, IdentityOps, NetOps, PaymentOps, PeerId, SyncOps,
};
use spn_registry::messages::{Broadcast, Ping, WireMessage};
use spn_registry::types::{BlockHash, Hash256, OutPoint};
use spn_registry::{ActiveIdentity, RegistryConfig, RegistryCore};

pub struct MockChain {
    pub time: AtomicI64,
    pub tip: AtomicU64,
    pub hashes: Mutex<HashMap<u64, BlockHash>>,
    pub confirmations: Mutex<HashMap<OutPoint, Option<i64>>>,
    pub default_confirmations: AtomicI64,
}

impl MockChain {
    pub fn new(tip: u64, time: i64) -> Self {
        let mut hashes = HashMap::new();
        for height in 0..=tip {
            hashes.insert(height, deterministic_hash(height));
        }
        Self {
            time: AtomicI64::new(time),
            tip: AtomicU64::new(tip),
            hashes: Mutex::new(hashes),
            confirmations: Mutex::new(HashMap::new()),
            default_confirmations: AtomicI64::new(10_000),
        }
    }

    pub fn advance_time(&self, seconds: i64) {
        self.time.fetch_add(seconds, Ordering::SeqCst);
    }

    pub fn set_time(&self, time: i64) {
        self.time.store(time, Ordering::SeqCst);
    }

    pub fn now(&self) -> i64 {
        self.time.load(Ordering::SeqCst)
    }

    pub fn spend_utxo(&self, outpoint: OutPoint) {
        self.confirmations.lock().insert(outpoint, None);
    }
}

fn deterministic_hash(height: u64) -> BlockHash {
    let mut bytes = [0x42u8; 32];
    bytes[..8].copy_from_slice(&height.to_be_bytes());
    Hash256(bytes)
}

impl ChainOps for MockChain {
    fn block_hash_at(&self, height: u64) -> Option<BlockHash> {
        self.hashes.lock().get(&height).copied()
    }

    fn block_height_of(&self, hash: &BlockHash) -> Option<u64> {
        self.hashes
            .lock()
            .iter()
            .find(|(_, h)| *h == hash)
            .map(|(height, _)| *height)
    }

    fn current_tip_height(&self) -> u64 {
        self.tip.load(Ordering::SeqCst)
    }

    fn utxo_confirmations(&self, outpoint: &OutPoint) -> Option<i64> {
        self.confirmations
            .lock()
            .get(outpoint)
            .copied()
            .unwrap_or(Some(self.default_confirmations.load(Ordering::SeqCst)))
    }

    fn adjusted_time(&self) -> i64 {
        self.now()
    }

    fn signature_scheme(&self) -> SignatureScheme {
        SignatureScheme::Hash
    }
}

#[derive(Default)]
pub struct MockNet {
    pub sent: Mutex<Vec<(PeerId, WireMessage)>>,
    pub peers: Mutex<HashMap<PeerId, SocketAddr>>,
    pub misbehavior: Mutex<HashMap<PeerId, i32>>,
    pub pending_peers: Mutex<HashSet<SocketAddr>>,
    pub addresses: Mutex<Vec<(SocketAddr, SocketAddr)>>,
    pub unreachable: Mutex<HashSet<SocketAddr>>,
}

impl MockNet {
    pub fn connect(&self, peer: PeerId, addr: SocketAddr) {
        self.peers.lock().insert(peer, addr);
    }

    pub fn sent_to(&self, peer: PeerId) -> Vec<WireMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|(p, _)| *p == peer)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn misbehavior_of(&self, peer: PeerId) -> i32 {
        self.misbehavior.lock().get(&peer).copied().unwrap_or(0)
    }
}

impl NetOps for MockNet {
    fn push_message(&self, peer: PeerId, message: WireMessage) {
        self.sent.lock().push((peer, message));
    }

    fn for_each_peer(&self, f: &mut dyn FnMut(PeerId, SocketAddr)) {
        for (peer, addr) in self.peers.lock().iter() {
            f(*peer, *addr);
        }
    }

    fn find_peer(&self, addr: &SocketAddr) -> Option<PeerId> {
        self.peers
            .lock()
            .iter()
            .find(|(_, a)| *a == addr)
            .map(|(p, _)| *p)
    }

    fn add_pending_peer(&self, addr: SocketAddr) {
        self.pending_peers.lock().insert(addr);
    }

    fn is_connected_or_pending(&self, _addr: &SocketAddr) -> bool {
        false
    }

    fn misbehaving(&self, peer: PeerId, score: i32) {
        *self.misbehavior.lock().entry(peer).or_insert(0) += score;
    }

    fn add_address(&self, addr: SocketAddr, source: SocketAddr) {
        self.addresses.lock().push((addr, source));
    }

    fn probe_connect(&self, addr: &SocketAddr) -> bool {
        !self.unreachable.lock().contains(addr)
    }
}

pub struct MockSync {
    pub blockchain: AtomicBool,
    pub list: AtomicBool,
    pub winners: AtomicBool,
    pub full: AtomicBool,
    pub bumps: Mutex<Vec<String>>,
}

impl Default for MockSync {
    fn default() -> Self {
        Self {
            blockchain: AtomicBool::new(true),
            list: AtomicBool::new(true),
            winners: AtomicBool::new(true),
            full: AtomicBool::new(true),
            bumps: Mutex::new(Vec::new()),
        }
    }
}

impl SyncOps for MockSync {
    fn is_blockchain_synced(&self) -> bool {
        self.blockchain.load(Ordering::SeqCst)
    }

    fn is_list_synced(&self) -> bool {
        self.list.load(Ordering::SeqCst)
    }

    fn is_winners_synced(&self) -> bool {
        self.winners.load(Ordering::SeqCst)
    }

    fn is_fully_synced(&self) -> bool {
        self.full.load(Ordering::SeqCst)
    }

    fn bump_asset_last_time(&self, tag: &str) {
        self.bumps.lock().push(tag.to_string());
    }
}

pub struct MockPayments {
    pub min_protocol: u32,
    pub scheduled: Mutex<HashSet<OutPoint>>,
    pub last_paid: Mutex<HashMap<OutPoint, (u64, i64)>>,
}

impl Default for MockPayments {
    fn default() -> Self {
        Self {
            min_protocol: 70_208,
            scheduled: Mutex::new(HashSet::new()),
            last_paid: Mutex::new(HashMap::new()),
        }
    }
}

impl PaymentOps for MockPayments {
    fn is_scheduled(&self, outpoint: &OutPoint, _height: u64) -> bool {
        self.scheduled.lock().contains(outpoint)
    }

    fn min_protocol_version(&self) -> u32 {
        self.min_protocol
    }

    fn storage_limit(&self) -> u64 {
        5_000
    }

    fn last_paid_at(
        &self,
        outpoint: &OutPoint,
        _height: u64,
        _scan_back: u64,
    ) -> Option<(u64, i64)> {
        self.last_paid.lock().get(outpoint).copied()
    }
}

#[derive(Default)]
pub struct MockGovernance {
    pub added: AtomicU64,
    pub removed: AtomicU64,
    pub dirty_seen: Mutex<Vec<Hash256>>,
}

impl GovernanceOps for MockGovernance {
    fn entries_added(&self) {
        self.added.fetch_add(1, Ordering::SeqCst);
    }

    fn entries_removed(&self, dirty_vote_hashes: &[Hash256]) {
        self.removed.fetch_add(1, Ordering::SeqCst);
        self.dirty_seen.lock().extend_from_slice(dirty_vote_hashes);
    }
}

#[derive(Default)]
pub struct MockIdentityHooks {
    pub managed: AtomicU64,
}

impl IdentityOps for MockIdentityHooks {
    fn manage_state(&self) {
        self.managed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub core: RegistryCore,
    pub chain: Arc<MockChain>,
    pub net: Arc<MockNet>,
    pub sync: Arc<MockSync>,
    pub payments: Arc<MockPayments>,
    pub governance: Arc<MockGovernance>,
    pub hooks: Arc<MockIdentityHooks>,
}

pub const BASE_TIME: i64 = 1_700_000_000;
pub const TIP: u64 = 500;

pub fn harness() -> Harness {
    harness_with(RegistryConfig::default())
}

pub fn harness_with(config: RegistryConfig) -> Harness {
    let chain = Arc::new(MockChain::new(TIP, BASE_TIME));
    let net = Arc::new(MockNet::default());
    let sync = Arc::new(MockSync::default());
    let payments = Arc::new(MockPayments::default());
    let governance = Arc::new(MockGovernance::default());
    let hooks = Arc::new(MockIdentityHooks::default());
    let core = RegistryCore::new(
        config,
        chain.clone(),
        net.clone(),
        sync.clone(),
        payments.clone(),
        governance.clone(),
        hooks.clone(),
    );
    Harness {
        core,
        chain,
        net,
        sync,
        payments,
        governance,
        hooks,
    }
}

/// Key material and identity of one simulated service entry.
pub struct TestEntry {
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
    pub collateral: Keypair,
    pub service: Keypair,
}

impl TestEntry {
    pub fn new(index: u8) -> Self {
        let mut txid = [0u8; 32];
        txid[0] = index;
        txid[31] = 0xA5;
        Self {
            outpoint: OutPoint::new(txid, 0),
            addr: format!("203.0.113.{index}:10001").parse().expect("addr"),
            collateral: generate_keypair(),
            service: generate_keypair(),
        }
    }

    /// Operator identity for this entry; rebuilds the service keypair so
    /// the test keeps its own copy.
    pub fn identity(&self) -> ActiveIdentity {
        let secret =
            SecretKey::from_bytes(&self.service.secret.to_bytes()).expect("service key bytes");
        let keypair = Keypair {
            secret,
            public: self.service.public,
        };
        ActiveIdentity::new(self.outpoint, self.addr, Arc::new(keypair))
    }

    pub fn ping(&self, chain: &MockChain, sig_time: i64) -> Ping {
        let mut ping = Ping {
            outpoint: self.outpoint,
            block_hash: chain
                .block_hash_at(chain.current_tip_height())
                .expect("tip hash"),
            sig_time,
            sentinel_is_current: false,
            daemon_version: 120_300,
            sig: Vec::new(),
        };
        ping.sign(&self.service, SignatureScheme::Hash);
        ping
    }

    pub fn broadcast(&self, chain: &MockChain, sig_time: i64, ping_time: i64) -> Broadcast {
        let mut broadcast = Broadcast {
            outpoint: self.outpoint,
            addr: self.addr,
            pubkey_collateral: self.collateral.public.to_bytes(),
            pubkey_service: self.service.public.to_bytes(),
            sig: Vec::new(),
            sig_time,
            protocol_version: 70_208,
            last_ping: Some(self.ping(chain, ping_time)),
            f_recovery: false,
        };
        broadcast.sign(&self.collateral, SignatureScheme::Hash);
        broadcast
    }
}

/// Announce an entry whose ping is already mature, then run the state
/// machine so it lands in `ENABLED`.
pub fn register_enabled(harness: &Harness, entry: &TestEntry, peer: PeerId) {
    let now = harness.chain.now();
    let broadcast = entry.broadcast(&harness.chain, now - 7_000, now - 120);
    harness
        .core
        .check_and_update_broadcast(Some((peer, entry.addr)), broadcast)
        .expect("announcement accepted");
    harness.core.check();
}
