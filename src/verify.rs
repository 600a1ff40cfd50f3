//! Pairwise Proof-of-Service verification: outbound challenge rounds,
//! reply serving and processing, relayed attestation handling, and the
//! address sweeps that feed the ban machinery.
//!
//! Outbound work is prepared under the registry lock and performed after
//! release; the pending-verification queue sits behind its own leaf lock.

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::entry::EntryState;
use crate::errors::{RegistryError, Rejection};
use crate::interfaces::PeerId;
use crate::messages::{Verification, VerificationRecord, WireMessage};
use crate::registry::RegistryCore;
use crate::types::OutPoint;

/// Unreachable-service codes (from the address prober) that justify a
/// reputation hit.
const MISSING_SERVICE_CODES: [i32; 3] = [111, 13, 113];

impl RegistryCore {
    /// Queue a direct verification of `addr` outside the regular rank
    /// walk; used after the duplicate-address sweep.
    pub fn ask_for_verification(&self, addr: SocketAddr) {
        let Some(_identity) = self.active_identity() else {
            return;
        };
        if !self.sync.is_fully_synced() {
            return;
        }
        let now = self.chain.adjusted_time();
        let nonce = rand::thread_rng().gen_range(0, 999_999);
        let verification = Verification::new(addr, nonce, self.tip_height().saturating_sub(1));
        info!(peer = %addr, nonce, "scheduling direct verification");
        self.net.add_pending_peer(addr);
        self.pending_verifications
            .lock()
            .insert(addr, (now, verification));
    }

    fn may_probe_family(&self, addr: &SocketAddr) -> bool {
        self.config.ok_dual
            || (self.config.ok_ipv4 && addr.is_ipv4())
            || (self.config.ok_ipv6 && addr.is_ipv6())
    }

    fn verify_request_allowed(&self, addr: &SocketAddr) -> bool {
        // a repeat inside the cooldown is only logged; refusing to
        // re-verify would let a fake entry hide behind the cooldown
        !self.net.is_connected_or_pending(addr)
    }

    /// One outbound verification round. Only runs when we are an active
    /// entry ranked inside the verification window; picks targets by a
    /// strided walk below our own rank.
    pub fn do_full_verification_step(&self) {
        let Some(identity) = self.active_identity() else {
            return;
        };
        if !self.sync.is_fully_synced() {
            return;
        }

        let tip = self.tip_height();
        let min_protocol = self.payments.min_protocol_version();
        let ranks = match self.ranks_at(tip.saturating_sub(1), min_protocol) {
            Ok(ranks) => ranks,
            Err(err) => {
                debug!(error = %err, "verification round skipped, no rank list");
                return;
            }
        };
        let now = self.chain.adjusted_time();
        let max_score = self.config.pose_ban_max_score;

        let mut target_addrs: Vec<SocketAddr> = Vec::new();
        {
            let mut state = self.state.lock();

            let my_rank = ranks
                .iter()
                .find(|(_, snapshot)| snapshot.outpoint == identity.outpoint)
                .map(|(rank, _)| *rank);
            let Some(my_rank) = my_rank else {
                info!("rank list is too short or this entry is not enabled");
                return;
            };
            if my_rank > self.config.max_pose_rank {
                info!(
                    rank = my_rank,
                    max = self.config.max_pose_rank,
                    "not ranked high enough to send verification requests"
                );
                return;
            }
            info!(
                rank = my_rank,
                total = ranks.len(),
                "verifying up to {} entries",
                self.config.max_pose_connections
            );

            let mut offset = (self.config.max_pose_rank + my_rank - 1) as usize;
            let mut picked = 0usize;
            while offset < ranks.len() {
                let candidate = &ranks[offset].1;
                let verified = candidate.pose_ban_score <= -max_score;
                let banned = candidate.state == EntryState::PoseBanned;
                if verified || banned {
                    offset += self.config.max_pose_connections;
                    continue;
                }
                if self.verify_request_allowed(&candidate.addr) {
                    debug!(
                        entry = %candidate.outpoint,
                        rank = ranks[offset].0,
                        addr = %candidate.addr,
                        "verifying entry"
                    );
                    target_addrs.push(candidate.addr);
                    state
                        .caches
                        .should_ask_for_verification
                        .remove(&candidate.outpoint);
                    picked += 1;
                    if picked >= self.config.max_pose_connections {
                        break;
                    }
                }
                offset += self.config.max_pose_connections;
            }

            // append every queued direct ask as well, regardless of the
            // rank walk above
            let queued: Vec<(OutPoint, i64)> = state
                .caches
                .should_ask_for_verification
                .iter()
                .map(|(outpoint, asked_at)| (*outpoint, *asked_at))
                .collect();
            for (outpoint, asked_at) in queued {
                if let Some(entry) = state.entries.get(&outpoint) {
                    info!(
                        entry = %outpoint,
                        addr = %entry.addr,
                        waited = now - asked_at,
                        "verifying queued entry"
                    );
                    target_addrs.push(entry.addr);
                }
                state.caches.should_ask_for_verification.remove(&outpoint);
            }
        }

        let sent = target_addrs.len();
        for addr in target_addrs {
            self.net.add_pending_peer(addr);
            let nonce = rand::thread_rng().gen_range(0, 999_999);
            let verification = Verification::new(addr, nonce, tip.saturating_sub(1));
            debug!(peer = %addr, nonce, "verification pending");
            self.pending_verifications
                .lock()
                .insert(addr, (now, verification));
        }
        info!(sent, "sent verification requests");
    }

    /// Emit queued verification challenges once their peers connect and
    /// punish targets whose connection never materializes.
    pub fn process_pending_verify_requests(&self) {
        let now = self.chain.adjusted_time();
        let timeout = self.config.pending_request_timeout_seconds;
        let scheme = self.chain.signature_scheme();
        let expire = self.config.fulfilled_expire_seconds;

        let pending: Vec<(SocketAddr, i64, Verification)> = {
            let pending = self.pending_verifications.lock();
            pending
                .iter()
                .map(|(addr, (enqueued, verification))| (*addr, *enqueued, verification.clone()))
                .collect()
        };

        let mut to_remove: Vec<SocketAddr> = Vec::new();
        for (addr, enqueued, verification) in pending {
            let peer = self.net.find_peer(&addr);
            let sent = if let Some(peer) = peer {
                {
                    let mut state = self.state.lock();
                    state.caches.fulfillment(addr).requested_until = now + expire;
                    state.caches.we_asked_for_verification.insert(
                        addr,
                        VerificationRecord {
                            verification: verification.clone(),
                            scheme,
                        },
                    );
                }
                debug!(peer = %addr, nonce = verification.nonce, "sending verification challenge");
                self.net
                    .push_message(peer, WireMessage::Verify(verification));
                true
            } else {
                false
            };

            if sent {
                let done = self.state.lock().caches.is_verify_done(&addr, now);
                if done {
                    info!(peer = %addr, elapsed = now - enqueued, "verification complete");
                    to_remove.push(addr);
                } else if now - enqueued > timeout {
                    warn!(
                        peer = %addr,
                        error = %RegistryError::Timeout,
                        "verification went unanswered"
                    );
                    self.increase_pose_ban_score_by_addr(&addr);
                    self.punish_peer(&addr, 20);
                    to_remove.push(addr);
                }
            } else if now - enqueued > timeout {
                warn!(
                    peer = %addr,
                    elapsed = now - enqueued,
                    error = %RegistryError::Timeout,
                    "failed to connect for verification"
                );
                self.increase_pose_ban_score_by_addr(&addr);
                self.punish_peer(&addr, 20);
                to_remove.push(addr);
            }
        }

        let mut pending = self.pending_verifications.lock();
        for addr in to_remove {
            pending.remove(&addr);
        }
        debug!(pending = pending.len(), "pending verifications");
    }

    /// Serve a verification challenge: prove we operate the address the
    /// peer connected to.
    pub(crate) fn send_verify_reply(
        &self,
        peer: PeerId,
        peer_addr: SocketAddr,
        verification: Verification,
    ) -> Result<(), Rejection> {
        if !self.sync.is_list_synced() {
            return Ok(());
        }
        // only entries can sign this; a malicious node may be probing a
        // regular node that shares our IP, so no penalty either way
        if !self.config.service_mode {
            return Ok(());
        }
        let Some(identity) = self.active_identity() else {
            return Ok(());
        };

        let now = self.chain.adjusted_time();
        {
            let state = self.state.lock();
            if state.caches.is_verify_replied(&peer_addr, now) {
                return Err(Rejection::new(RegistryError::AlreadyVerified, 2));
            }
        }

        let Some(block_hash) = self.chain.block_hash_at(verification.block_height) else {
            return Err(Rejection::silent(RegistryError::BlockHashUnavailable(
                verification.block_height,
            )));
        };
        let scheme = self.chain.signature_scheme();

        let mut reply = verification;
        reply.sign_reply(&identity.keypair, &block_hash, scheme);
        reply
            .self_check_reply(&identity.keypair, &block_hash, scheme)
            .map_err(Rejection::silent)?;

        self.net.push_message(peer, WireMessage::Verify(reply));
        let mut state = self.state.lock();
        state.caches.fulfillment(peer_addr).replied_until =
            now + self.config.fulfilled_expire_seconds;
        Ok(())
    }

    /// Process the signed reply to a challenge we issued.
    pub(crate) fn process_verify_reply(
        &self,
        peer: PeerId,
        peer_addr: SocketAddr,
        verification: Verification,
    ) -> Result<(), Rejection> {
        if !self.sync.is_list_synced() {
            return Ok(());
        }
        let now = self.chain.adjusted_time();
        let scheme = self.chain.signature_scheme();

        let requested = {
            let state = self.state.lock();
            state.caches.is_verify_requested(&peer_addr, now)
        };
        if !requested {
            return Err(Rejection::new(
                RegistryError::Rejected(format!(
                    "unsolicited verification reply from {peer_addr}"
                )),
                2,
            ));
        }

        let stored = {
            let state = self.state.lock();
            state.caches.we_asked_for_verification.get(&peer_addr).cloned()
        };
        let Some(record) = stored else {
            return Err(Rejection::new(
                RegistryError::Rejected(format!(
                    "no stored verification for replying peer {peer_addr}"
                )),
                2,
            ));
        };

        if record.verification.nonce != verification.nonce {
            self.increase_pose_ban_score_by_addr(&peer_addr);
            return Err(Rejection::new(
                RegistryError::NonceMismatch {
                    requested: record.verification.nonce,
                    received: verification.nonce,
                },
                20,
            ));
        }
        if record.verification.block_height != verification.block_height {
            self.increase_pose_ban_score_by_addr(&peer_addr);
            return Err(Rejection::new(
                RegistryError::HeightMismatch {
                    requested: record.verification.block_height,
                    received: verification.block_height,
                },
                20,
            ));
        }

        let Some(block_hash) = self.chain.block_hash_at(verification.block_height) else {
            return Err(Rejection::silent(RegistryError::BlockHashUnavailable(
                verification.block_height,
            )));
        };

        if self.state.lock().caches.is_verify_done(&peer_addr, now) {
            warn!(peer = %peer_addr, error = %RegistryError::AlreadyVerified, "duplicate reply");
            self.net.misbehaving(peer, 2);
            // process the reply anyway
        }

        let identity = self.active_identity();
        let max_score = self.config.pose_ban_max_score;
        let expire = self.config.fulfilled_expire_seconds;
        let mut relay: Option<Verification> = None;
        let mut real_found = false;
        {
            let mut state = self.state.lock();
            let matching: Vec<OutPoint> = state
                .entries
                .values()
                .filter(|entry| entry.addr == peer_addr)
                .map(|entry| entry.outpoint)
                .collect();

            let mut to_ban: Vec<OutPoint> = Vec::new();
            for outpoint in matching {
                let entry = state.entries.get_mut(&outpoint).expect("entry present");
                let valid = verification
                    .verify_sig1(&entry.pubkey_service, &block_hash, record.scheme)
                    .is_ok();
                if !valid {
                    to_ban.push(outpoint);
                    continue;
                }
                if real_found {
                    continue;
                }
                real_found = true;
                info!(entry = %outpoint, addr = %peer_addr, "verified real entry");
                if !entry.is_pose_verified(max_score) {
                    entry.decrease_pose_ban_score();
                }
                let entry_addr = entry.addr;
                state.caches.fulfillment(peer_addr).done_until = now + expire;

                // relay a full attestation when we are an active entry
                if let Some(identity) = &identity {
                    let mut attestation = verification.clone();
                    attestation.addr = entry_addr;
                    attestation.outpoint1 = outpoint;
                    attestation.outpoint2 = identity.outpoint;
                    attestation.sign_broadcast(&identity.keypair, &block_hash, scheme);
                    if let Err(err) = attestation.verify_sig2(
                        &identity.service_pubkey(),
                        &block_hash,
                        scheme,
                    ) {
                        warn!(error = %err, "attestation failed self-check");
                        continue;
                    }
                    state.caches.we_asked_for_verification.insert(
                        peer_addr,
                        VerificationRecord {
                            verification: attestation.clone(),
                            scheme,
                        },
                    );
                    state.caches.seen_verifications.insert(
                        attestation.hash(),
                        VerificationRecord {
                            verification: attestation.clone(),
                            scheme,
                        },
                    );
                    relay = Some(attestation);
                }
            }

            let banned = to_ban.len();
            for outpoint in to_ban {
                if let Some(entry) = state.entries.get_mut(&outpoint) {
                    entry.increase_pose_ban_score(max_score);
                    warn!(
                        entry = %outpoint,
                        addr = %peer_addr,
                        score = entry.pose_ban_score,
                        "entry failed verification, score increased"
                    );
                }
            }
            if banned > 0 {
                warn!(count = banned, addr = %peer_addr, "fake entries at verified address");
            }
        }

        if !real_found {
            // nothing at this address could produce the signature; only a
            // node gaming the system gets here
            return Err(Rejection::new(
                RegistryError::Rejected(format!(
                    "no real entry found for verified address {peer_addr}"
                )),
                40,
            ));
        }
        if let Some(attestation) = relay {
            self.net.relay(&WireMessage::Verify(attestation));
        }
        Ok(())
    }

    /// Process a relayed attestation: a third party proved that
    /// `outpoint1` operates `addr`.
    pub(crate) fn process_verify_broadcast(
        &self,
        _peer: PeerId,
        peer_addr: SocketAddr,
        verification: Verification,
    ) -> Result<(), Rejection> {
        if !self.sync.is_list_synced() {
            return Ok(());
        }
        let hash = verification.hash();
        let now_tip = self.tip_height();
        let scheme = self.chain.signature_scheme();

        {
            let mut state = self.state.lock();
            if state.caches.seen_verifications.contains_key(&hash) {
                return Ok(());
            }
            state.caches.seen_verifications.insert(
                hash,
                VerificationRecord {
                    verification: verification.clone(),
                    scheme,
                },
            );
        }

        if verification.block_height < now_tip.saturating_sub(self.config.max_pose_blocks) {
            return Err(Rejection::silent(RegistryError::StaleHeight {
                height: verification.block_height,
                tip: now_tip,
            }));
        }

        if verification.outpoint1 == verification.outpoint2 {
            warn!(
                entry = %verification.outpoint1,
                peer = %peer_addr,
                "verification broadcast names the same entry twice"
            );
            // cheating by verifying yourself costs the relaying peer dearly
            return Err(Rejection::new(RegistryError::SelfVerify, 100));
        }

        let Some(block_hash) = self.chain.block_hash_at(verification.block_height) else {
            return Err(Rejection::silent(RegistryError::BlockHashUnavailable(
                verification.block_height,
            )));
        };

        let min_protocol = self.payments.min_protocol_version();
        let rank = self
            .rank_of(
                &verification.outpoint2,
                verification.block_height,
                min_protocol,
            )
            .map_err(Rejection::silent)?;
        if rank > self.config.max_pose_rank {
            return Err(Rejection::silent(RegistryError::RankTooLow {
                rank,
                max: self.config.max_pose_rank,
            }));
        }

        let max_score = self.config.pose_ban_max_score;
        let mut relay = false;
        {
            let mut state = self.state.lock();

            let Some((addr1, pubkey1)) = state
                .entries
                .get(&verification.outpoint1)
                .map(|e| (e.addr, e.pubkey_service))
            else {
                warn!(entry = %verification.outpoint1, "verified entry unknown");
                return Err(Rejection::silent(RegistryError::UnknownOutpoint));
            };
            let Some(pubkey2) = state
                .entries
                .get(&verification.outpoint2)
                .map(|e| e.pubkey_service)
            else {
                warn!(entry = %verification.outpoint2, "verifier entry unknown");
                return Err(Rejection::silent(RegistryError::UnknownOutpoint));
            };

            if addr1 != verification.addr {
                return Err(Rejection::new(
                    RegistryError::Rejected(format!(
                        "verification claims {} but entry {} serves {}",
                        verification.addr, verification.outpoint1, addr1
                    )),
                    20,
                ));
            }

            verification
                .verify_sig1(&pubkey1, &block_hash, scheme)
                .map_err(Rejection::silent)?;
            verification
                .verify_sig2(&pubkey2, &block_hash, scheme)
                .map_err(Rejection::silent)?;

            if let Some(entry1) = state.entries.get_mut(&verification.outpoint1) {
                if !entry1.is_pose_verified(max_score) {
                    entry1.decrease_pose_ban_score();
                }
            }
            relay = true;
            info!(
                entry = %verification.outpoint1,
                addr = %verification.addr,
                "entry verified by broadcast"
            );

            // everyone else claiming this address is provably fake
            let others: Vec<OutPoint> = state
                .entries
                .values()
                .filter(|e| e.addr == verification.addr && e.outpoint != verification.outpoint1)
                .map(|e| e.outpoint)
                .collect();
            let count = others.len();
            for outpoint in others {
                if let Some(entry) = state.entries.get_mut(&outpoint) {
                    entry.increase_pose_ban_score(max_score);
                    warn!(
                        entry = %outpoint,
                        addr = %verification.addr,
                        score = entry.pose_ban_score,
                        "score increased for fake entry"
                    );
                }
            }
            if count > 0 {
                warn!(count, addr = %verification.addr, "fake entries at verified address");
            }
        }

        if relay {
            self.net.relay(&WireMessage::Verify(verification));
        }
        Ok(())
    }

    /// Duplicate-address sweep, run on every tip update: within each group
    /// of entries sharing an IP, keep the one with the lowest PoSe score,
    /// ban the rest and queue a verification ask for the survivor.
    pub fn check_same_addr(&self) {
        if !self.sync.is_fully_synced() {
            return;
        }
        let identity = self.active_identity();
        let max_score = self.config.pose_ban_max_score;
        let now = self.chain.adjusted_time();

        let mut probes: Vec<(OutPoint, SocketAddr)> = Vec::new();
        {
            let mut state = self.state.lock();
            if state.entries.is_empty() {
                return;
            }

            let mut sorted_by_addr: Vec<(SocketAddr, OutPoint, i32)> = Vec::new();
            let mut ban_immediately: Vec<OutPoint> = Vec::new();
            for entry in state.entries.values() {
                if let Some(identity) = &identity {
                    if entry.outpoint == identity.outpoint {
                        continue;
                    }
                    if entry.addr == identity.service_addr {
                        // someone else is squatting on our address
                        warn!(entry = %entry.outpoint, addr = %entry.addr, "entry uses our address, banning");
                        ban_immediately.push(entry.outpoint);
                        continue;
                    }
                }
                if matches!(
                    entry.state,
                    EntryState::OutpointSpent | EntryState::UpdateRequired | EntryState::PoseBanned
                ) {
                    continue;
                }
                sorted_by_addr.push((entry.addr, entry.outpoint, entry.pose_ban_score));
            }
            sorted_by_addr.sort_by_key(|(addr, outpoint, _)| (*addr, *outpoint));

            // position in the score ordering decides the survivor; ties
            // fall back to the sort position itself
            let mut by_score: Vec<(i32, OutPoint)> = sorted_by_addr
                .iter()
                .map(|(_, outpoint, score)| (*score, *outpoint))
                .collect();
            by_score.sort_by_key(|(score, _)| *score);
            let score_position: HashMap<OutPoint, usize> = by_score
                .iter()
                .enumerate()
                .map(|(i, (_, outpoint))| (*outpoint, i))
                .collect();

            let mut to_ban: Vec<OutPoint> = Vec::new();
            let mut index = 0usize;
            while index < sorted_by_addr.len() {
                let ip = sorted_by_addr[index].0.ip();
                let mut run_end = index + 1;
                while run_end < sorted_by_addr.len() && sorted_by_addr[run_end].0.ip() == ip {
                    run_end += 1;
                }
                if run_end - index > 1 {
                    let survivor = sorted_by_addr[index..run_end]
                        .iter()
                        .min_by_key(|(_, outpoint, _)| score_position[outpoint])
                        .map(|(addr, outpoint, _)| (*outpoint, *addr))
                        .expect("run is non-empty");
                    for (_, outpoint, _) in &sorted_by_addr[index..run_end] {
                        if *outpoint != survivor.0 {
                            to_ban.push(*outpoint);
                        }
                    }
                    probes.push(survivor);
                }
                index = run_end;
            }

            info!(
                banned = to_ban.len() + ban_immediately.len(),
                groups = probes.len(),
                total = sorted_by_addr.len(),
                "duplicate-address sweep"
            );
            for outpoint in ban_immediately.into_iter().chain(to_ban) {
                if let Some(entry) = state.entries.get_mut(&outpoint) {
                    warn!(entry = %outpoint, "banned for duplicate address");
                    entry.pose_ban(max_score);
                }
            }
        }

        // survivors prove themselves via the verification protocol; the
        // probe tells us whether a challenge can reach them at all
        for (outpoint, addr) in probes {
            if self.may_probe_family(&addr) && self.net.probe_connect(&addr) {
                debug!(entry = %outpoint, addr = %addr, "queueing verification for survivor");
                self.state
                    .lock()
                    .caches
                    .should_ask_for_verification
                    .insert(outpoint, now);
            } else {
                debug!(entry = %outpoint, addr = %addr, "survivor unreachable, score increased");
                self.increase_pose_ban_score(&outpoint);
            }
        }
    }

    /// Consume the caller-supplied table of unreachable service addresses
    /// and charge the affected entries.
    pub fn check_missing_entries(&self, missing: &mut HashMap<SocketAddr, i32>) {
        if !self.sync.is_fully_synced() {
            return;
        }
        let identity = self.active_identity();
        let max_score = self.config.pose_ban_max_score;

        let mut state = self.state.lock();
        if state.entries.is_empty() {
            return;
        }

        let mut to_charge: Vec<OutPoint> = Vec::new();
        let mut ban_immediately: Vec<OutPoint> = Vec::new();
        for entry in state.entries.values() {
            if let Some(identity) = &identity {
                if entry.outpoint == identity.outpoint {
                    continue;
                }
                if entry.addr == identity.service_addr {
                    ban_immediately.push(entry.outpoint);
                    continue;
                }
            }
            if matches!(
                entry.state,
                EntryState::OutpointSpent | EntryState::UpdateRequired | EntryState::PoseBanned
            ) {
                continue;
            }
            let Some(&code) = missing.get(&entry.addr) else {
                continue;
            };
            if MISSING_SERVICE_CODES.contains(&code)
                && !crate::dispatch::is_local_addr(&entry.addr)
                && self.may_probe_family(&entry.addr)
            {
                to_charge.push(entry.outpoint);
                missing.remove(&entry.addr);
            }
        }

        info!(charged = to_charge.len(), "missing-service sweep");
        for outpoint in ban_immediately {
            if let Some(entry) = state.entries.get_mut(&outpoint) {
                entry.pose_ban(max_score);
            }
        }
        for outpoint in to_charge {
            if let Some(entry) = state.entries.get_mut(&outpoint) {
                entry.increase_pose_ban_score(max_score);
                warn!(entry = %outpoint, score = entry.pose_ban_score, "score increased for missing service");
            }
        }
    }
}
