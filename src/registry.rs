//! The registry core: authoritative local state about every known service
//! entry, deterministic ranking and payment selection, and the
//! housekeeping loop that drives eviction and recovery.
//!
//! Locking: `state` is the registry lock (`L_reg`); `pending_verifications`
//! is a leaf lock. Chain access goes through [`ChainOps`], which holds the
//! chain lock internally and is ordered before `L_reg`: every chain fact
//! an operation needs (block hashes, collateral confirmations, adjusted
//! time) is resolved before `state` is locked, never while holding it.
//! Registry code prepares outbound work under `L_reg` and performs sends
//! after release wherever a send could block.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::caches::{squash_addr, GossipCaches, RecoveryRequest};
use crate::config::RegistryConfig;
use crate::entry::{CheckContext, Entry, EntrySnapshot, EntryState};
use crate::errors::{RegistryError, RegistryResult, Rejection};
use crate::interfaces::{
    ActiveIdentity, ChainOps, GovernanceOps, IdentityOps, NetOps, PaymentOps, PeerId, SyncOps,
};
use crate::messages::{
    Broadcast, Inv, InvKind, Ping, UpdateOutcome, Verification, WireMessage,
};
use crate::types::{Hash256, OutPoint, Score};

/// Everything guarded by the registry lock.
#[derive(Default)]
pub(crate) struct RegistryState {
    pub entries: BTreeMap<OutPoint, Entry>,
    pub caches: GossipCaches,
    pub dirty_governance_hashes: Vec<Hash256>,
    pub entries_added: bool,
    pub entries_removed: bool,
    pub last_sentinel_ping_time: i64,
    pub dsq_count: u64,
    pub last_paid_scan_height: u64,
    pub warned_daemon_updates: bool,
}

/// Persisted view of the registry state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub entries: BTreeMap<OutPoint, Entry>,
    pub caches: GossipCaches,
    pub dsq_count: u64,
    pub last_sentinel_ping_time: i64,
}

pub struct RegistryCore {
    pub(crate) config: RegistryConfig,
    pub(crate) chain: Arc<dyn ChainOps>,
    pub(crate) net: Arc<dyn NetOps>,
    pub(crate) sync: Arc<dyn SyncOps>,
    pub(crate) payments: Arc<dyn PaymentOps>,
    pub(crate) governance: Arc<dyn GovernanceOps>,
    pub(crate) identity_hooks: Arc<dyn IdentityOps>,
    pub(crate) state: Mutex<RegistryState>,
    /// Leaf lock; never acquired while holding `state`.
    pub(crate) pending_verifications: Mutex<BTreeMap<SocketAddr, (i64, Verification)>>,
    pub(crate) identity: RwLock<Option<ActiveIdentity>>,
    cached_tip: AtomicU64,
}

impl RegistryCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RegistryConfig,
        chain: Arc<dyn ChainOps>,
        net: Arc<dyn NetOps>,
        sync: Arc<dyn SyncOps>,
        payments: Arc<dyn PaymentOps>,
        governance: Arc<dyn GovernanceOps>,
        identity_hooks: Arc<dyn IdentityOps>,
    ) -> Self {
        let tip = chain.current_tip_height();
        Self {
            config,
            chain,
            net,
            sync,
            payments,
            governance,
            identity_hooks,
            state: Mutex::new(RegistryState::default()),
            pending_verifications: Mutex::new(BTreeMap::new()),
            identity: RwLock::new(None),
            cached_tip: AtomicU64::new(tip),
        }
    }

    pub fn set_active_identity(&self, identity: Option<ActiveIdentity>) {
        *self.identity.write() = identity;
    }

    pub fn active_identity(&self) -> Option<ActiveIdentity> {
        self.identity.read().clone()
    }

    pub(crate) fn tip_height(&self) -> u64 {
        self.cached_tip.load(Ordering::Relaxed)
    }

    // ---- store ----------------------------------------------------------

    pub(crate) fn add_locked(state: &mut RegistryState, entry: Entry) -> RegistryResult<()> {
        if state.entries.contains_key(&entry.outpoint) {
            return Err(RegistryError::DuplicateOutpoint);
        }
        if state.entries.values().any(|e| e.addr == entry.addr) {
            return Err(RegistryError::DuplicateAddr);
        }
        info!(
            entry = %entry.outpoint,
            addr = %entry.addr,
            total = state.entries.len() + 1,
            "adding new registry entry"
        );
        state.entries.insert(entry.outpoint, entry);
        state.entries_added = true;
        Ok(())
    }

    /// Insert a fully validated entry. Fails when either its outpoint or
    /// its address is already taken.
    pub fn add(&self, entry: Entry) -> RegistryResult<()> {
        let mut state = self.state.lock();
        Self::add_locked(&mut state, entry)
    }

    pub fn has(&self, outpoint: &OutPoint) -> bool {
        self.state.lock().entries.contains_key(outpoint)
    }

    pub fn has_addr(&self, addr: &SocketAddr) -> bool {
        self.state.lock().entries.values().any(|e| e.addr == *addr)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<EntrySnapshot> {
        self.state
            .lock()
            .entries
            .get(outpoint)
            .map(Entry::snapshot)
    }

    pub fn find_by_service_key(&self, pubkey_service: &[u8; 32]) -> Option<EntrySnapshot> {
        self.state
            .lock()
            .entries
            .values()
            .find(|e| e.pubkey_service == *pubkey_service)
            .map(Entry::snapshot)
    }

    pub fn size(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn count(&self, min_protocol: Option<u32>) -> usize {
        let min_protocol = min_protocol.unwrap_or_else(|| self.payments.min_protocol_version());
        let state = self.state.lock();
        Self::count_locked(&state, min_protocol)
    }

    fn count_locked(state: &RegistryState, min_protocol: u32) -> usize {
        state
            .entries
            .values()
            .filter(|e| e.protocol_version >= min_protocol)
            .count()
    }

    pub fn count_enabled(&self, min_protocol: Option<u32>) -> usize {
        let min_protocol = min_protocol.unwrap_or_else(|| self.payments.min_protocol_version());
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.protocol_version >= min_protocol && e.is_enabled())
            .count()
    }

    pub fn count_by_net_class(&self, ipv6: bool) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.addr.is_ipv6() == ipv6)
            .count()
    }

    pub fn for_each<F: FnMut(&EntrySnapshot)>(&self, mut f: F) {
        let state = self.state.lock();
        for entry in state.entries.values() {
            f(&entry.snapshot());
        }
    }

    pub fn for_each_mut<F: FnMut(&mut Entry)>(&self, mut f: F) {
        let mut state = self.state.lock();
        for entry in state.entries.values_mut() {
            f(entry);
        }
    }

    /// Remove an entry outright, keeping the caches coherent and flagging
    /// its governance items dirty.
    pub fn remove(&self, outpoint: &OutPoint) {
        let mut state = self.state.lock();
        let Some(mut entry) = state.entries.remove(outpoint) else {
            return;
        };
        info!(entry = %outpoint, addr = %entry.addr, total = state.entries.len(), "removing registry entry");
        let hash = Broadcast::from_entry(&entry).hash();
        state.caches.seen_broadcasts.remove(&hash);
        state.caches.we_asked_for_entry.remove(outpoint);
        let mut dirty = entry.flag_governance_dirty();
        state.dirty_governance_hashes.append(&mut dirty);
        state.entries_removed = true;
    }

    pub fn dsq_count(&self) -> u64 {
        self.state.lock().dsq_count
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.caches.clear();
        state.dsq_count = 0;
        state.last_sentinel_ping_time = 0;
    }

    // ---- mixing and governance hooks ------------------------------------

    pub fn allow_mixing(&self, outpoint: &OutPoint) -> bool {
        let mut state = self.state.lock();
        state.dsq_count += 1;
        let dsq = state.dsq_count;
        match state.entries.get_mut(outpoint) {
            Some(entry) => {
                entry.last_dsq = dsq;
                entry.allow_mixing_tx = true;
                true
            }
            None => {
                state.dsq_count -= 1;
                false
            }
        }
    }

    pub fn disallow_mixing(&self, outpoint: &OutPoint) -> bool {
        let mut state = self.state.lock();
        match state.entries.get_mut(outpoint) {
            Some(entry) => {
                entry.allow_mixing_tx = false;
                true
            }
            None => false,
        }
    }

    pub fn add_governance_vote(&self, outpoint: &OutPoint, vote_hash: Hash256) -> bool {
        let mut state = self.state.lock();
        match state.entries.get_mut(outpoint) {
            Some(entry) => {
                entry.add_governance_vote(vote_hash);
                true
            }
            None => false,
        }
    }

    pub fn remove_governance_object(&self, object_hash: &Hash256) {
        let mut state = self.state.lock();
        for entry in state.entries.values_mut() {
            entry.remove_governance_object(object_hash);
        }
    }

    // ---- PoSe score mutation --------------------------------------------

    fn is_our_outpoint(&self, outpoint: &OutPoint) -> bool {
        self.identity
            .read()
            .as_ref()
            .map(|id| id.outpoint == *outpoint)
            .unwrap_or(false)
    }

    fn is_our_addr(&self, addr: &SocketAddr) -> bool {
        self.identity
            .read()
            .as_ref()
            .map(|id| id.service_addr == *addr)
            .unwrap_or(false)
    }

    pub fn increase_pose_ban_score(&self, outpoint: &OutPoint) -> bool {
        if self.is_our_outpoint(outpoint) {
            return false;
        }
        let max = self.config.pose_ban_max_score;
        let mut state = self.state.lock();
        match state.entries.get_mut(outpoint) {
            Some(entry) => {
                entry.increase_pose_ban_score(max);
                true
            }
            None => false,
        }
    }

    pub fn decrease_pose_ban_score(&self, outpoint: &OutPoint) -> bool {
        if self.is_our_outpoint(outpoint) {
            return false;
        }
        let max = self.config.pose_ban_max_score;
        let mut state = self.state.lock();
        match state.entries.get_mut(outpoint) {
            Some(entry) => {
                entry.decrease_pose_ban_score();
                true
            }
            None => false,
        }
    }

    pub fn pose_ban(&self, outpoint: &OutPoint) -> bool {
        if self.is_our_outpoint(outpoint) {
            return false;
        }
        let max = self.config.pose_ban_max_score;
        let mut state = self.state.lock();
        match state.entries.get_mut(outpoint) {
            Some(entry) => {
                entry.pose_ban(max);
                true
            }
            None => false,
        }
    }

    pub fn increase_pose_ban_score_by_addr(&self, addr: &SocketAddr) -> bool {
        if self.is_our_addr(addr) {
            return false;
        }
        let outpoint = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .find(|e| e.addr == *addr)
                .map(|e| e.outpoint)
        };
        outpoint
            .map(|outpoint| self.increase_pose_ban_score(&outpoint))
            .unwrap_or(false)
    }

    // ---- state machine --------------------------------------------------

    /// Collateral depth of every known entry, resolved without holding the
    /// registry lock so chain access stays ordered before it.
    fn collateral_status(&self) -> HashMap<OutPoint, Option<i64>> {
        let outpoints: Vec<OutPoint> = {
            let state = self.state.lock();
            state.entries.keys().copied().collect()
        };
        outpoints
            .into_iter()
            .map(|outpoint| (outpoint, self.chain.utxo_confirmations(&outpoint)))
            .collect()
    }

    pub(crate) fn base_check_context(&self, state: &RegistryState, now: i64) -> CheckContext {
        let identity = self.identity.read();
        CheckContext {
            now,
            min_protocol: self.payments.min_protocol_version(),
            client_protocol: self.config.client_protocol,
            our_service_pubkey: identity.as_ref().map(ActiveIdentity::service_pubkey),
            service_mode: self.config.service_mode,
            sentinel_active: self.sync.is_fully_synced()
                && now - state.last_sentinel_ping_time <= self.config.sentinel_ping_max_seconds,
            collateral_confirmations: None,
            min_ping_seconds: self.config.min_ping_seconds,
            expiration_seconds: self.config.expiration_seconds,
            new_start_required_seconds: self.config.new_start_required_seconds,
            sentinel_ping_max_seconds: self.config.sentinel_ping_max_seconds,
            pose_ban_max_score: self.config.pose_ban_max_score,
        }
    }

    fn check_locked(
        &self,
        state: &mut RegistryState,
        confirmations: &HashMap<OutPoint, Option<i64>>,
        now: i64,
        force: bool,
    ) {
        let base = self.base_check_context(state, now);
        let outpoints: Vec<OutPoint> = state.entries.keys().copied().collect();
        for outpoint in outpoints {
            // entries announced after the collateral snapshot was taken
            // keep their state until the next pass
            let Some(depth) = confirmations.get(&outpoint) else {
                continue;
            };
            if let Some(entry) = state.entries.get_mut(&outpoint) {
                let ctx = CheckContext {
                    collateral_confirmations: *depth,
                    ..base.clone()
                };
                entry.check(&ctx, force);
            }
        }
    }

    /// Run the per-entry state machine over the whole registry.
    pub fn check(&self) {
        let now = self.chain.adjusted_time();
        let confirmations = self.collateral_status();
        let mut state = self.state.lock();
        debug!(
            sentinel_ping_time = state.last_sentinel_ping_time,
            "checking all registry entries"
        );
        self.check_locked(&mut state, &confirmations, now, false);
    }

    pub fn check_entry_by_service_key(&self, pubkey_service: &[u8; 32], force: bool) {
        let now = self.chain.adjusted_time();
        let outpoint = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .find(|e| e.pubkey_service == *pubkey_service)
                .map(|e| e.outpoint)
        };
        let Some(outpoint) = outpoint else {
            return;
        };
        let confirmations = self.chain.utxo_confirmations(&outpoint);
        let mut state = self.state.lock();
        let base = self.base_check_context(&state, now);
        if let Some(entry) = state.entries.get_mut(&outpoint) {
            // the entry may have been replaced between the two lock scopes
            if entry.pubkey_service == *pubkey_service {
                let ctx = CheckContext {
                    collateral_confirmations: confirmations,
                    ..base
                };
                entry.check(&ctx, force);
            }
        }
    }

    // ---- housekeeping ---------------------------------------------------

    /// The housekeeping pass: evict terminal entries, orchestrate recovery
    /// requests, settle recovery replies, then sweep every TTL table.
    pub fn check_and_remove(&self) {
        if !self.sync.is_list_synced() {
            return;
        }
        info!("housekeeping pass");

        let now = self.chain.adjusted_time();
        let tip = self.tip_height();

        // chain data used below, all resolved before the registry lock
        let random_height = if tip > 0 {
            rand::thread_rng().gen_range(0, tip)
        } else {
            0
        };
        let random_block_hash = self.chain.block_hash_at(random_height);
        let confirmations = self.collateral_status();

        let mut reprocess: Vec<Broadcast> = Vec::new();
        {
            let mut state = self.state.lock();
            self.check_locked(&mut state, &confirmations, now, false);

            // removals precede recovery scheduling
            let mut recovery_asks_left = self.config.recovery_max_ask_entries;
            let mut rank_list: Option<Vec<(u32, EntrySnapshot)>> = None;
            let outpoints: Vec<OutPoint> = state.entries.keys().copied().collect();
            for outpoint in outpoints {
                let (evict, hash, new_start_required) = match state.entries.get(&outpoint) {
                    Some(entry) => (
                        matches!(
                            entry.state,
                            EntryState::OutpointSpent
                                | EntryState::UpdateRequired
                                | EntryState::PoseBanned
                        ),
                        Broadcast::from_entry(entry).hash(),
                        entry.is_new_start_required(),
                    ),
                    None => continue,
                };

                if evict {
                    let entry = state.entries.remove(&outpoint).expect("entry present");
                    info!(
                        entry = %outpoint,
                        addr = %entry.addr,
                        state = %entry.state,
                        total = state.entries.len(),
                        "removing registry entry"
                    );
                    state.caches.seen_broadcasts.remove(&hash);
                    state.caches.we_asked_for_entry.remove(&outpoint);
                    let mut entry = entry;
                    let mut dirty = entry.flag_governance_dirty();
                    state.dirty_governance_hashes.append(&mut dirty);
                    state.entries_removed = true;
                    continue;
                }

                let ask = recovery_asks_left > 0
                    && self.sync.is_fully_synced()
                    && new_start_required
                    && !state.caches.is_recovery_requested(&hash)
                    && !self.config.connect_only;
                if !ask {
                    continue;
                }

                if rank_list.is_none() {
                    let ranks = match random_block_hash {
                        Some(block_hash) => {
                            let min_protocol = self.payments.min_protocol_version();
                            let scores =
                                Self::scores_locked(&state, &block_hash, min_protocol);
                            scores
                                .into_iter()
                                .enumerate()
                                .filter_map(|(i, (_, op))| {
                                    state
                                        .entries
                                        .get(&op)
                                        .map(|e| (i as u32 + 1, e.snapshot()))
                                })
                                .collect()
                        }
                        None => Vec::new(),
                    };
                    rank_list = Some(ranks);
                }

                let mut requested = std::collections::HashSet::new();
                for (_, candidate) in rank_list.as_ref().expect("rank list computed") {
                    if requested.len() >= self.config.recovery_quorum_total {
                        break;
                    }
                    let squashed =
                        squash_addr(&candidate.addr, self.config.allow_multiple_ports);
                    let recently_asked = state
                        .caches
                        .we_asked_for_entry
                        .get(&outpoint)
                        .map(|peers| peers.contains_key(&squashed))
                        .unwrap_or(false);
                    if recently_asked {
                        continue;
                    }
                    requested.insert(candidate.addr);
                    state.caches.scheduled_recovery.push((candidate.addr, hash));
                }
                if !requested.is_empty() {
                    debug!(entry = %outpoint, peers = requested.len(), "recovery initiated");
                    recovery_asks_left -= 1;
                }
                state.caches.recovery_requests.insert(
                    hash,
                    RecoveryRequest {
                        deadline: now + self.config.recovery_wait_seconds,
                        peers: requested,
                    },
                );
            }

            // settle recovery replies whose window has closed
            let due: Vec<Hash256> = state
                .caches
                .recovery_good_replies
                .keys()
                .filter(|hash| {
                    state
                        .caches
                        .recovery_requests
                        .get(hash)
                        .map(|request| request.deadline < now)
                        .unwrap_or(true)
                })
                .copied()
                .collect();
            for hash in due {
                if let Some(replies) = state.caches.recovery_good_replies.remove(&hash) {
                    if replies.len() >= self.config.recovery_quorum_required {
                        let newest = replies
                            .into_iter()
                            .max_by_key(|b| b.last_ping.as_ref().map(|p| p.sig_time).unwrap_or(0));
                        if let Some(mut broadcast) = newest {
                            debug!(entry = %broadcast.outpoint, "reprocessing recovered announcement");
                            broadcast.f_recovery = true;
                            reprocess.push(broadcast);
                        }
                    }
                }
            }

            // expiry sweeps come last
            state.caches.sweep(
                now,
                tip,
                self.config.max_pose_blocks,
                self.config.recovery_retry_seconds,
            );
            state
                .caches
                .sweep_seen_pings(now, self.config.new_start_required_seconds);

            info!(summary = %Self::summary_locked(&state), "housekeeping complete");
        }

        for broadcast in reprocess {
            if let Err(rejection) = self.check_and_update_broadcast(None, broadcast) {
                debug!(error = %rejection.error, "recovered announcement rejected");
            }
        }

        self.notify_entry_updates();
    }

    // ---- announcements (the key write path) -----------------------------

    /// Validate an announcement and fold it into the registry. Returns
    /// `Ok(true)` when the announcement produced or refreshed an entry,
    /// `Ok(false)` when it was a known duplicate.
    pub fn check_and_update_broadcast(
        &self,
        from: Option<(PeerId, SocketAddr)>,
        broadcast: Broadcast,
    ) -> Result<bool, Rejection> {
        let now = self.chain.adjusted_time();
        let scheme = self.chain.signature_scheme();
        let confirmations = self.chain.utxo_confirmations(&broadcast.outpoint);
        let min_protocol = self.payments.min_protocol_version();
        let hash = broadcast.hash();
        let identity = self.active_identity();

        let mut relay = false;
        let mut manage_identity = false;
        {
            let mut state = self.state.lock();

            let seen = state
                .caches
                .seen_broadcasts
                .get(&hash)
                .map(|(seen_at, seen)| {
                    let ping_time = seen.last_ping.as_ref().map(|p| p.sig_time).unwrap_or(0);
                    (*seen_at, ping_time)
                });
            if let Some((seen_at, seen_ping_time)) = seen {
                if !broadcast.f_recovery {
                    debug!(entry = %broadcast.outpoint, "announcement seen");
                    // close to the non-recoverable horizon: refresh the
                    // timestamp so the sync timeout stays alive
                    if now - seen_at
                        > self.config.new_start_required_seconds - self.config.min_ping_seconds * 2
                    {
                        if let Some(stored) = state.caches.seen_broadcasts.get_mut(&hash) {
                            stored.0 = now;
                        }
                        self.sync.bump_asset_last_time("registry::announce-seen");
                    }
                    if let Some((_, peer_addr)) = from {
                        self.record_recovery_reply(
                            &mut state,
                            &broadcast,
                            hash,
                            peer_addr,
                            seen_ping_time,
                            confirmations,
                            now,
                        );
                    }
                    return Ok(false);
                }
            }
            state
                .caches
                .seen_broadcasts
                .insert(hash, (now, broadcast.clone()));
            debug!(entry = %broadcast.outpoint, "announcement is new");

            broadcast.simple_check(&self.config, min_protocol, now, scheme)?;

            if let Some(entry) = state.entries.get(&broadcast.outpoint) {
                let old_hash = Broadcast::from_entry(entry).hash();
                let outpoint = broadcast.outpoint;
                let entry = state.entries.get_mut(&outpoint).expect("entry present");
                let outcome = broadcast.update_entry(
                    entry,
                    now,
                    scheme,
                    self.config.service_mode,
                    identity.as_ref().map(ActiveIdentity::service_pubkey),
                )?;
                match outcome {
                    UpdateOutcome::Duplicate => return Ok(false),
                    UpdateOutcome::Throttled => {
                        self.sync.bump_asset_last_time("registry::announce-update");
                        return Ok(true);
                    }
                    UpdateOutcome::Updated => {
                        let base = self.base_check_context(&state, now);
                        let entry =
                            state.entries.get_mut(&outpoint).expect("entry present");
                        let ctx = CheckContext {
                            collateral_confirmations: confirmations,
                            ..base
                        };
                        entry.check(&ctx, true);
                        if old_hash != hash {
                            state.caches.seen_broadcasts.remove(&old_hash);
                        }
                        self.sync.bump_asset_last_time("registry::announce-update");
                        relay = true;
                    }
                }
            } else {
                broadcast
                    .check_outpoint(confirmations, self.config.min_collateral_confirmations)?;
                broadcast.check_addr(&self.config)?;

                let mut entry = Entry::from_broadcast(&broadcast);
                let ours = self.config.service_mode
                    && identity
                        .as_ref()
                        .map(|id| id.service_pubkey() == broadcast.pubkey_service)
                        .unwrap_or(false);
                if ours {
                    entry.pose_ban_score = -self.config.pose_ban_max_score;
                    if broadcast.protocol_version == self.config.client_protocol {
                        info!(
                            entry = %broadcast.outpoint,
                            addr = %broadcast.addr,
                            "received our own announcement, re-arming identity"
                        );
                        manage_identity = true;
                    } else {
                        // a stale announcement of ourselves must not enter
                        // the registry or be relayed
                        return Err(Rejection::silent(RegistryError::Rejected(format!(
                            "own announcement carries protocol {} instead of {}",
                            broadcast.protocol_version, self.config.client_protocol
                        ))));
                    }
                }
                Self::add_locked(&mut state, entry).map_err(|err| {
                    warn!(entry = %broadcast.outpoint, addr = %broadcast.addr, error = %err, "announcement rejected");
                    Rejection::silent(err)
                })?;
                self.sync.bump_asset_last_time("registry::announce-new");
                relay = true;
            }
        }

        if manage_identity {
            self.identity_hooks.manage_state();
        }
        if relay {
            self.net.relay(&WireMessage::Announce(broadcast));
        }
        Ok(true)
    }

    /// A duplicate announcement arriving while its hash is under recovery:
    /// count the sender's reply, keeping only projected auto-start states.
    #[allow(clippy::too_many_arguments)]
    fn record_recovery_reply(
        &self,
        state: &mut RegistryState,
        broadcast: &Broadcast,
        hash: Hash256,
        peer_addr: SocketAddr,
        seen_ping_time: i64,
        collateral_confirmations: Option<i64>,
        now: i64,
    ) {
        let Some(request) = state.caches.recovery_requests.get_mut(&hash) else {
            return;
        };
        if request.deadline <= now || !request.peers.remove(&peer_addr) {
            return;
        }
        let ping_time = broadcast
            .last_ping
            .as_ref()
            .map(|p| p.sig_time)
            .unwrap_or(0);
        if ping_time <= seen_ping_time {
            return;
        }
        // project the state this announcement would produce
        let mut projected = Entry::from_broadcast(broadcast);
        let base = self.base_check_context(state, now);
        let ctx = CheckContext {
            collateral_confirmations,
            ..base
        };
        projected.check(&ctx, true);
        if Entry::is_valid_state_for_auto_start(projected.state) {
            debug!(entry = %broadcast.outpoint, peer = %peer_addr, "good recovery reply");
            state
                .caches
                .recovery_good_replies
                .entry(hash)
                .or_default()
                .push(broadcast.clone());
        }
    }

    // ---- scheduled recovery draining ------------------------------------

    /// Drain at most one peer's scheduled recovery batch and time out
    /// stale pending batches.
    pub fn process_pending_recovery_requests(&self) {
        let now = self.chain.adjusted_time();
        let timeout = self.config.pending_request_timeout_seconds;
        let mut to_send: Vec<(PeerId, Vec<Inv>)> = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some((peer, hashes)) = state.caches.pop_scheduled_recovery() {
                if self.net.is_connected_or_pending(&peer) {
                    return;
                }
                state.caches.pending_recovery.insert(peer, (now, hashes));
                self.net.add_pending_peer(peer);
            }

            let net = &self.net;
            state.caches.pending_recovery.retain(|addr, (enqueued, hashes)| {
                if let Some(peer) = net.find_peer(addr) {
                    let invs: Vec<Inv> = hashes
                        .iter()
                        .filter(|hash| **hash != Hash256::zero())
                        .map(|hash| Inv {
                            kind: InvKind::Announce,
                            hash: *hash,
                        })
                        .collect();
                    to_send.push((peer, invs));
                    false
                } else if now - *enqueued > timeout {
                    warn!(peer = %addr, error = %RegistryError::Timeout, "recovery request connection timed out");
                    false
                } else {
                    true
                }
            });
            debug!(pending = state.caches.pending_recovery.len(), "pending recovery batches");
        }

        for (peer, invs) in to_send {
            self.net.push_message(peer, WireMessage::GetData(invs));
        }
    }

    // ---- scoring, ranking and payment selection -------------------------

    pub(crate) fn scores_locked(
        state: &RegistryState,
        block_hash: &Hash256,
        min_protocol: u32,
    ) -> Vec<(Score, OutPoint)> {
        let mut scores: Vec<(Score, OutPoint)> = state
            .entries
            .values()
            .filter(|e| e.protocol_version >= min_protocol)
            .map(|e| (e.calculate_score(block_hash), e.outpoint))
            .collect();
        scores.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scores
    }

    /// Score-ordered view of the registry for an explicit block hash,
    /// highest score first.
    pub fn scores_at(
        &self,
        block_hash: &Hash256,
        min_protocol: u32,
    ) -> RegistryResult<Vec<(Score, OutPoint)>> {
        if !self.sync.is_list_synced() {
            return Err(RegistryError::NotSynced("list"));
        }
        let state = self.state.lock();
        Ok(Self::scores_locked(&state, block_hash, min_protocol))
    }

    /// 1-based position of the entry in the descending score order at
    /// `height`.
    pub fn rank_of(
        &self,
        outpoint: &OutPoint,
        height: u64,
        min_protocol: u32,
    ) -> RegistryResult<u32> {
        if !self.sync.is_list_synced() {
            return Err(RegistryError::NotSynced("list"));
        }
        let block_hash = self
            .chain
            .block_hash_at(height)
            .ok_or(RegistryError::BlockHashUnavailable(height))?;
        let state = self.state.lock();
        let scores = Self::scores_locked(&state, &block_hash, min_protocol);
        scores
            .iter()
            .position(|(_, op)| op == outpoint)
            .map(|i| i as u32 + 1)
            .ok_or(RegistryError::UnknownOutpoint)
    }

    /// Full score-ordered ranking at `height`.
    pub fn ranks_at(
        &self,
        height: u64,
        min_protocol: u32,
    ) -> RegistryResult<Vec<(u32, EntrySnapshot)>> {
        if !self.sync.is_list_synced() {
            return Err(RegistryError::NotSynced("list"));
        }
        let block_hash = self
            .chain
            .block_hash_at(height)
            .ok_or(RegistryError::BlockHashUnavailable(height))?;
        let state = self.state.lock();
        let scores = Self::scores_locked(&state, &block_hash, min_protocol);
        Ok(scores
            .into_iter()
            .enumerate()
            .filter_map(|(i, (_, op))| {
                state.entries.get(&op).map(|e| (i as u32 + 1, e.snapshot()))
            })
            .collect())
    }

    /// Deterministically select the next entry to be paid at `height`.
    /// Returns the number of payment candidates considered and the winner.
    pub fn next_for_payment(
        &self,
        height: u64,
        filter_sig_time: bool,
    ) -> RegistryResult<(usize, Option<EntrySnapshot>)> {
        if !self.sync.is_winners_synced() {
            return Err(RegistryError::NotSynced("winners"));
        }
        let score_height = height
            .checked_sub(101)
            .ok_or(RegistryError::BlockHashUnavailable(0))?;
        let block_hash = self
            .chain
            .block_hash_at(score_height)
            .ok_or(RegistryError::BlockHashUnavailable(score_height))?;
        let min_protocol = self.payments.min_protocol_version();
        let now = self.chain.adjusted_time();
        let confirmations = self.collateral_status();

        let state = self.state.lock();
        let total = Self::count_locked(&state, min_protocol);

        let collect = |filter: bool| -> Vec<(u64, OutPoint)> {
            state
                .entries
                .values()
                .filter(|e| {
                    e.is_valid_for_payment()
                        && e.protocol_version >= min_protocol
                        && !self.payments.is_scheduled(&e.outpoint, height)
                        && !(filter
                            && e.sig_time
                                + total as i64 * self.config.sig_time_slack_per_entry()
                                >= now)
                        && confirmations
                            .get(&e.outpoint)
                            .copied()
                            .flatten()
                            .map(|depth| depth >= total as i64)
                            .unwrap_or(false)
                })
                .map(|e| (e.last_paid_block, e.outpoint))
                .collect()
        };

        let mut candidates = collect(filter_sig_time);
        // while the network upgrades, do not penalize recently restarted
        // entries: retry without the sig-time filter
        if filter_sig_time && candidates.len() < total / 3 {
            candidates = collect(false);
        }
        let considered = candidates.len();

        candidates.sort();

        let window = std::cmp::max(1, total / 10);
        let mut best: Option<(Score, OutPoint)> = None;
        for (_, outpoint) in candidates.into_iter().take(window) {
            let entry = state.entries.get(&outpoint).expect("candidate present");
            let score = entry.calculate_score(&block_hash);
            let better = match &best {
                Some((best_score, best_outpoint)) => {
                    score > *best_score || (score == *best_score && outpoint < *best_outpoint)
                }
                None => true,
            };
            if better {
                best = Some((score, outpoint));
            }
        }

        let winner = best.and_then(|(_, op)| state.entries.get(&op).map(Entry::snapshot));
        Ok((considered, winner))
    }

    /// Random enabled entry outside the exclusion list; used by the
    /// mixing client to pick a queue host.
    pub fn find_random_not_in(
        &self,
        exclude: &[OutPoint],
        min_protocol: Option<u32>,
    ) -> Option<EntrySnapshot> {
        let min_protocol = min_protocol.unwrap_or_else(|| self.payments.min_protocol_version());
        let state = self.state.lock();

        let enabled = state
            .entries
            .values()
            .filter(|e| e.protocol_version >= min_protocol && e.is_enabled())
            .count();
        if enabled <= exclude.len() {
            return None;
        }

        let mut shuffled: Vec<&Entry> = state.entries.values().collect();
        shuffled.shuffle(&mut rand::thread_rng());
        shuffled
            .into_iter()
            .filter(|e| e.protocol_version >= min_protocol && e.is_enabled())
            .find(|e| !exclude.contains(&e.outpoint))
            .map(|e| e.snapshot())
    }

    // ---- pings ----------------------------------------------------------

    pub fn is_pinged_within(&self, outpoint: &OutPoint, seconds: i64, at: i64) -> bool {
        self.state
            .lock()
            .entries
            .get(outpoint)
            .map(|e| e.is_pinged_within(seconds, at))
            .unwrap_or(false)
    }

    /// Store a ping produced by the local identity and keep the seen
    /// caches coherent with it.
    pub fn set_last_ping(&self, outpoint: &OutPoint, ping: Ping) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(outpoint) else {
            return;
        };
        let sentinel = ping.sentinel_is_current;
        let ping_hash = ping.hash();
        entry.record_ping(ping.clone());
        let broadcast_hash = Broadcast::from_entry(entry).hash();
        if sentinel {
            state.last_sentinel_ping_time = ping.sig_time;
        }
        state.caches.seen_pings.insert(ping_hash, ping.clone());
        if let Some((_, seen)) = state.caches.seen_broadcasts.get_mut(&broadcast_hash) {
            seen.last_ping = Some(ping);
        }
    }

    pub fn update_sentinel_ping_time(&self) {
        let now = self.chain.adjusted_time();
        self.state.lock().last_sentinel_ping_time = now;
    }

    pub fn is_sentinel_ping_active(&self) -> bool {
        let now = self.chain.adjusted_time();
        let state = self.state.lock();
        now - state.last_sentinel_ping_time <= self.config.sentinel_ping_max_seconds
    }

    // ---- last paid ------------------------------------------------------

    /// Refresh per-entry last-paid data from the payment history, scanning
    /// back over the blocks added since the previous run.
    pub fn update_last_paid(&self) {
        if self.config.lite_mode || !self.sync.is_winners_synced() {
            return;
        }
        let tip = self.tip_height();
        let mut state = self.state.lock();
        if state.entries.is_empty() {
            return;
        }
        let scan_back = std::cmp::min(
            std::cmp::max(
                self.config.last_paid_scan_blocks,
                tip.saturating_sub(state.last_paid_scan_height),
            ),
            self.payments.storage_limit(),
        );
        debug!(tip, scan_back, "updating last paid data");
        let outpoints: Vec<OutPoint> = state.entries.keys().copied().collect();
        for outpoint in outpoints {
            if let Some((block, time)) = self.payments.last_paid_at(&outpoint, tip, scan_back) {
                if let Some(entry) = state.entries.get_mut(&outpoint) {
                    entry.last_paid_block = block;
                    entry.last_paid_time = time;
                }
            }
        }
        state.last_paid_scan_height = tip;
    }

    // ---- tip updates and notifications ----------------------------------

    pub fn updated_block_tip(&self, height: u64) {
        self.cached_tip.store(height, Ordering::Relaxed);
        debug!(height, "cached tip updated");

        self.check_same_addr();

        if self.config.service_mode {
            self.update_last_paid();
        }
    }

    /// Post-tick notifier: inform governance about membership changes.
    pub fn notify_entry_updates(&self) {
        let (added, removed, dirty) = {
            let mut state = self.state.lock();
            let added = state.entries_added;
            let removed = state.entries_removed;
            state.entries_added = false;
            state.entries_removed = false;
            let dirty = std::mem::take(&mut state.dirty_governance_hashes);
            (added, removed, dirty)
        };
        if added {
            self.governance.entries_added();
        }
        if removed {
            self.governance.entries_removed(&dirty);
        }
    }

    /// Operator warning once at least half of the known entries run a
    /// newer daemon than this build.
    pub fn warn_about_daemon_updates(&self) -> Option<String> {
        if !self.sync.is_list_synced() {
            return None;
        }
        let mut state = self.state.lock();
        if state.warned_daemon_updates || state.entries.is_empty() {
            return None;
        }
        let total = state.entries.len();
        let updated = state
            .entries
            .values()
            .filter(|e| {
                e.last_ping
                    .as_ref()
                    .map(|p| p.daemon_version > self.config.client_daemon_version)
                    .unwrap_or(false)
            })
            .count();
        if updated < total / 2 {
            return None;
        }
        state.warned_daemon_updates = true;
        let warning = if updated < total {
            format!(
                "Warning: at least {updated} of {total} registry entries are running newer \
                 software; an update is likely available."
            )
        } else {
            format!(
                "Warning: every registry entry (out of {total} known) is running newer \
                 software; this build has probably missed a critical update."
            )
        };
        warn!("{warning}");
        Some(warning)
    }

    fn summary_locked(state: &RegistryState) -> String {
        format!(
            "entries: {}, peers who asked us for the list: {}, peers we asked for the list: {}, \
             entries we asked for: {}, dsq count: {}",
            state.entries.len(),
            state.caches.asked_us_for_list.len(),
            state.caches.we_asked_for_list.len(),
            state.caches.we_asked_for_entry.len(),
            state.dsq_count
        )
    }

    pub fn summary(&self) -> String {
        Self::summary_locked(&self.state.lock())
    }

    // ---- persistence ----------------------------------------------------

    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.lock();
        RegistrySnapshot {
            entries: state.entries.clone(),
            caches: state.caches.clone(),
            dsq_count: state.dsq_count,
            last_sentinel_ping_time: state.last_sentinel_ping_time,
        }
    }

    pub fn restore(&self, snapshot: RegistrySnapshot) {
        let mut state = self.state.lock();
        state.entries = snapshot.entries;
        state.caches = snapshot.caches;
        state.dsq_count = snapshot.dsq_count;
        state.last_sentinel_ping_time = snapshot.last_sentinel_ping_time;
    }
}
