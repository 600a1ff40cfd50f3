//! Inbound gossip dispatch: announcements, pings, list queries and the
//! three verification stages, each gated by the sync state machine.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::caches::squash_addr;
use crate::entry::EntryState;
use crate::interfaces::PeerId;
use crate::messages::{
    Broadcast, Inv, InvKind, Ping, PingCheckContext, WireMessage, SYNC_ASSET_LIST,
};
use crate::registry::RegistryCore;
use crate::types::OutPoint;

/// Addresses we never gossip entries for and never rate-limit.
pub(crate) fn is_local_addr(addr: &SocketAddr) -> bool {
    match addr {
        SocketAddr::V4(v4) => {
            v4.ip().is_loopback() || v4.ip().is_private() || v4.ip().is_unspecified()
        }
        SocketAddr::V6(v6) => v6.ip().is_loopback() || v6.ip().is_unspecified(),
    }
}

impl RegistryCore {
    /// Entry point for every registry message received from a peer.
    pub fn process_message(&self, peer: PeerId, peer_addr: SocketAddr, message: WireMessage) {
        if self.config.lite_mode {
            return;
        }
        match message {
            WireMessage::Announce(broadcast) => self.process_announce(peer, peer_addr, broadcast),
            WireMessage::Ping(ping) => self.process_ping(peer, peer_addr, ping),
            WireMessage::Query(outpoint) => self.process_query(peer, peer_addr, outpoint),
            WireMessage::Verify(verification) => {
                let result = if verification.sig1.is_empty() {
                    // someone asked us to prove we operate our address
                    self.send_verify_reply(peer, peer_addr, verification)
                } else if verification.sig2.is_empty() {
                    self.process_verify_reply(peer, peer_addr, verification)
                } else {
                    self.process_verify_broadcast(peer, peer_addr, verification)
                };
                if let Err(rejection) = result {
                    if rejection.misbehavior > 0 {
                        warn!(
                            peer = %peer_addr,
                            error = %rejection.error,
                            score = rejection.misbehavior,
                            "verification message rejected"
                        );
                        self.net.misbehaving(peer, rejection.misbehavior);
                    } else {
                        debug!(peer = %peer_addr, error = %rejection.error, "verification message dropped");
                    }
                }
            }
            WireMessage::GetData(invs) => self.process_getdata(peer, invs),
            // inventory offers and sync tallies are consumed by the
            // inventory and sync machinery, not by the registry
            WireMessage::Inv(_) | WireMessage::SyncCount { .. } => {}
        }
    }

    fn process_announce(&self, peer: PeerId, peer_addr: SocketAddr, broadcast: Broadcast) {
        self.net.erase_asked(peer, broadcast.hash());
        if !self.sync.is_blockchain_synced() {
            return;
        }
        debug!(entry = %broadcast.outpoint, peer = %peer_addr, "announcement received");

        let announced_addr = broadcast.addr;
        match self.check_and_update_broadcast(Some((peer, peer_addr)), broadcast) {
            Ok(true) => {
                // a usable announcement doubles as an address hint
                self.net.add_address(announced_addr, peer_addr);
            }
            Ok(false) => {}
            Err(rejection) => {
                if rejection.misbehavior > 0 {
                    self.net.misbehaving(peer, rejection.misbehavior);
                }
            }
        }

        self.notify_entry_updates();
    }

    fn process_ping(&self, peer: PeerId, peer_addr: SocketAddr, ping: Ping) {
        let hash = ping.hash();
        self.net.erase_asked(peer, hash);
        if !self.sync.is_blockchain_synced() {
            return;
        }
        debug!(entry = %ping.outpoint, peer = %peer_addr, "ping received");

        let now = self.chain.adjusted_time();
        let confirmations = self.chain.utxo_confirmations(&ping.outpoint);
        let ctx = PingCheckContext {
            now,
            tip_height: self.tip_height(),
            ping_block_height: self.chain.block_height_of(&ping.block_hash),
            scheme: self.chain.signature_scheme(),
            min_ping_seconds: self.config.min_ping_seconds,
            expiration_seconds: self.config.expiration_seconds,
            list_synced: self.sync.is_list_synced(),
        };

        enum Outcome {
            Accepted { relay: bool, bump_sync: bool },
            KnownButStale,
            Punish(i32),
            Unknown,
        }

        let outcome = {
            let mut state = self.state.lock();
            if state.caches.seen_pings.contains_key(&hash) {
                return;
            }
            state.caches.seen_pings.insert(hash, ping.clone());
            debug!(entry = %ping.outpoint, "ping is new");

            let known = state.entries.contains_key(&ping.outpoint);
            if known && ping.sentinel_is_current {
                state.last_sentinel_ping_time = now;
            }
            if known
                && state
                    .entries
                    .get(&ping.outpoint)
                    .map(|e| e.is_new_start_required())
                    .unwrap_or(false)
            {
                // too late, only a fresh announcement can revive it
                return;
            }

            if known {
                let base = self.base_check_context(&state, now);
                let entry = state.entries.get_mut(&ping.outpoint).expect("entry known");
                match ping.check_and_update(entry, false, &ctx) {
                    Ok(bump_sync) => {
                        let check_ctx = crate::entry::CheckContext {
                            collateral_confirmations: confirmations,
                            ..base
                        };
                        entry.check(&check_ctx, true);
                        let relay = matches!(
                            entry.state,
                            EntryState::Enabled
                                | EntryState::Expired
                                | EntryState::SentinelPingExpired
                        );
                        // keep the cached announcement's embedded ping fresh
                        let broadcast_hash = Broadcast::from_entry(entry).hash();
                        if let Some((_, seen)) =
                            state.caches.seen_broadcasts.get_mut(&broadcast_hash)
                        {
                            seen.last_ping = Some(ping.clone());
                        }
                        Outcome::Accepted { relay, bump_sync }
                    }
                    Err(rejection) if rejection.misbehavior > 0 => {
                        Outcome::Punish(rejection.misbehavior)
                    }
                    Err(_) => Outcome::KnownButStale,
                }
            } else {
                Outcome::Unknown
            }
        };

        match outcome {
            Outcome::Accepted { relay, bump_sync } => {
                if bump_sync {
                    self.sync.bump_asset_last_time("registry::ping");
                }
                if relay {
                    self.net.relay(&WireMessage::Ping(ping));
                }
            }
            Outcome::KnownButStale => {}
            Outcome::Punish(score) => {
                self.net.misbehaving(peer, score);
                self.ask_for_entry(peer, peer_addr, &ping.outpoint);
            }
            Outcome::Unknown => {
                // we might have to ask for the entry once
                self.ask_for_entry(peer, peer_addr, &ping.outpoint);
            }
        }
    }

    fn process_query(&self, peer: PeerId, peer_addr: SocketAddr, outpoint: OutPoint) {
        // serving the list is heavy; refuse until fully synced
        if !self.sync.is_fully_synced() {
            return;
        }
        debug!(peer = %peer_addr, entry = %outpoint, "list query");
        if outpoint.is_null() {
            self.sync_all(peer, peer_addr);
        } else {
            self.sync_single(peer, &outpoint);
        }
    }

    /// Offer one entry's announcement and ping to the peer, regardless of
    /// its current state; the peer needs it to validate old votes.
    fn sync_single(&self, peer: PeerId, outpoint: &OutPoint) {
        let now = self.chain.adjusted_time();
        let mut messages = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.entries.get(outpoint) {
                if is_local_addr(&entry.addr) {
                    return;
                }
                let broadcast = Broadcast::from_entry(entry);
                messages.push(Self::entry_invs(&mut state, now, broadcast));
            }
        }
        if messages.is_empty() {
            return;
        }
        for invs in messages {
            self.net.push_message(peer, WireMessage::Inv(invs));
        }
        info!(entry = %outpoint, "sent one entry inv");
    }

    fn sync_all(&self, peer: PeerId, peer_addr: SocketAddr) {
        let is_local = is_local_addr(&peer_addr);
        let squashed = squash_addr(&peer_addr, self.config.allow_multiple_ports);
        let now = self.chain.adjusted_time();

        let mut invs = Vec::new();
        {
            let mut state = self.state.lock();
            if !is_local && self.config.main_network {
                if let Some(expiry) = state.caches.asked_us_for_list.get(&squashed) {
                    if *expiry > now {
                        warn!(peer = %peer_addr, "peer asked for the list again inside cooldown");
                        drop(state);
                        self.net.misbehaving(peer, 34);
                        return;
                    }
                }
                state
                    .caches
                    .asked_us_for_list
                    .insert(squashed, now + self.config.dseg_update_seconds);
            }

            let broadcasts: Vec<Broadcast> = state
                .entries
                .values()
                .filter(|entry| !is_local_addr(&entry.addr))
                .map(Broadcast::from_entry)
                .collect();
            for broadcast in broadcasts {
                invs.push(Self::entry_invs(&mut state, now, broadcast));
            }
        }

        let count = invs.len() as u32;
        for batch in invs {
            self.net.push_message(peer, WireMessage::Inv(batch));
        }
        self.net.push_message(
            peer,
            WireMessage::SyncCount {
                asset: SYNC_ASSET_LIST,
                count,
            },
        );
        info!(peer = %peer_addr, count, "served full list sync");
    }

    /// Register an entry's announcement and ping in the seen caches and
    /// produce the inventory pair offering them.
    fn entry_invs(
        state: &mut crate::registry::RegistryState,
        now: i64,
        broadcast: Broadcast,
    ) -> Vec<Inv> {
        let mut invs = Vec::with_capacity(2);
        let broadcast_hash = broadcast.hash();
        invs.push(Inv {
            kind: InvKind::Announce,
            hash: broadcast_hash,
        });
        if let Some(ping) = broadcast.last_ping.clone() {
            let ping_hash = ping.hash();
            invs.push(Inv {
                kind: InvKind::Ping,
                hash: ping_hash,
            });
            state.caches.seen_pings.insert(ping_hash, ping);
        }
        state
            .caches
            .seen_broadcasts
            .entry(broadcast_hash)
            .or_insert((now, broadcast));
        invs
    }

    /// Serve announcements and pings the peer fetched after our INV offer.
    fn process_getdata(&self, peer: PeerId, invs: Vec<Inv>) {
        let mut messages = Vec::new();
        {
            let state = self.state.lock();
            for inv in invs {
                match inv.kind {
                    InvKind::Announce => {
                        if let Some((_, broadcast)) = state.caches.seen_broadcasts.get(&inv.hash) {
                            messages.push(WireMessage::Announce(broadcast.clone()));
                        }
                    }
                    InvKind::Ping => {
                        if let Some(ping) = state.caches.seen_pings.get(&inv.hash) {
                            messages.push(WireMessage::Ping(ping.clone()));
                        }
                    }
                }
            }
        }
        for message in messages {
            self.net.push_message(peer, message);
        }
    }

    /// Ask a peer for one missing entry, respecting the per-peer cooldown.
    pub fn ask_for_entry(&self, peer: PeerId, peer_addr: SocketAddr, outpoint: &OutPoint) {
        let now = self.chain.adjusted_time();
        let squashed = squash_addr(&peer_addr, self.config.allow_multiple_ports);
        {
            let mut state = self.state.lock();
            let asked = state
                .caches
                .we_asked_for_entry
                .get(outpoint)
                .and_then(|peers| peers.get(&squashed))
                .copied();
            match asked {
                Some(expiry) if now < expiry => {
                    // asking the same peer again this soon could get us banned
                    return;
                }
                Some(_) => {
                    info!(peer = %squashed, entry = %outpoint, "asking same peer for missing entry again")
                }
                None => {
                    info!(peer = %squashed, entry = %outpoint, "asking peer for missing entry")
                }
            }
            state
                .caches
                .we_asked_for_entry
                .entry(*outpoint)
                .or_default()
                .insert(squashed, now + self.config.dseg_update_seconds);
        }
        self.net.push_message(peer, WireMessage::Query(*outpoint));
    }

    /// Ask a peer for the full list, at most once per cooldown window.
    pub fn dseg_update(&self, peer: PeerId, peer_addr: SocketAddr) {
        let now = self.chain.adjusted_time();
        let squashed = squash_addr(&peer_addr, self.config.allow_multiple_ports);
        {
            let mut state = self.state.lock();
            if self.config.main_network && !is_local_addr(&peer_addr) {
                if let Some(expiry) = state.caches.we_asked_for_list.get(&squashed) {
                    if now < *expiry {
                        info!(peer = %peer_addr, "already asked for the list, skipping");
                        return;
                    }
                }
            }
            state
                .caches
                .we_asked_for_list
                .insert(squashed, now + self.config.dseg_update_seconds);
        }
        self.net
            .push_message(peer, WireMessage::Query(OutPoint::null()));
        debug!(peer = %peer_addr, "asked for the full list");
    }

    /// Report the peer serving `addr` for misbehavior, unless it is us.
    pub(crate) fn punish_peer(&self, addr: &SocketAddr, score: i32) {
        if !self.sync.is_fully_synced() {
            return;
        }
        if self
            .active_identity()
            .map(|id| id.service_addr == *addr)
            .unwrap_or(false)
        {
            return;
        }
        if let Some(peer) = self.net.find_peer(addr) {
            info!(peer = %addr, score, "punishing misbehaving peer");
            self.net.misbehaving(peer, score);
        }
    }
}
