use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::crypto::sha256d;
use crate::messages::{Broadcast, Ping};
use crate::types::{BlockHash, Hash256, OutPoint, Score};

/// Re-running the state machine more often than this is pointless; `check`
/// is throttled unless forced.
pub const CHECK_SECONDS: i64 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    PreEnabled,
    Enabled,
    Expired,
    OutpointSpent,
    UpdateRequired,
    SentinelPingExpired,
    NewStartRequired,
    PoseBanned,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryState::PreEnabled => "PRE_ENABLED",
            EntryState::Enabled => "ENABLED",
            EntryState::Expired => "EXPIRED",
            EntryState::OutpointSpent => "OUTPOINT_SPENT",
            EntryState::UpdateRequired => "UPDATE_REQUIRED",
            EntryState::SentinelPingExpired => "SENTINEL_PING_EXPIRED",
            EntryState::NewStartRequired => "NEW_START_REQUIRED",
            EntryState::PoseBanned => "POSE_BANNED",
        };
        write!(f, "{name}")
    }
}

/// Everything the state machine needs from outside the entry. Built once
/// per pass by the registry so individual checks stay cheap.
#[derive(Clone, Debug)]
pub struct CheckContext {
    pub now: i64,
    pub min_protocol: u32,
    pub client_protocol: u32,
    /// Our own service key when running in service mode.
    pub our_service_pubkey: Option<[u8; 32]>,
    pub service_mode: bool,
    /// Whether the network-wide sentinel ping is considered active.
    pub sentinel_active: bool,
    /// Confirmation depth of this entry's collateral; `None` means spent.
    pub collateral_confirmations: Option<i64>,
    pub min_ping_seconds: i64,
    pub expiration_seconds: i64,
    pub new_start_required_seconds: i64,
    pub sentinel_ping_max_seconds: i64,
    pub pose_ban_max_score: i32,
}

/// A registered service node. Owned exclusively by the registry map; all
/// observers get [`EntrySnapshot`] copies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
    pub pubkey_collateral: [u8; 32],
    pub pubkey_service: [u8; 32],
    pub sig: Vec<u8>,
    pub sig_time: i64,
    pub protocol_version: u32,
    pub last_ping: Option<Ping>,
    pub last_paid_block: u64,
    pub last_paid_time: i64,
    /// Clamped to `[-max, max]`; `-max` marks our own verified identity,
    /// `max` triggers the ban.
    pub pose_ban_score: i32,
    pub state: EntryState,
    pub allow_mixing_tx: bool,
    pub last_dsq: u64,
    pub governance_votes: BTreeSet<Hash256>,
    pub dirty_governance: bool,
    /// Last time a sentinel-current ping landed.
    pub sentinel_ping_time: i64,
    time_last_checked: i64,
}

impl Entry {
    pub fn new(
        outpoint: OutPoint,
        addr: SocketAddr,
        pubkey_collateral: [u8; 32],
        pubkey_service: [u8; 32],
        sig: Vec<u8>,
        sig_time: i64,
        protocol_version: u32,
        last_ping: Option<Ping>,
    ) -> Self {
        let sentinel_ping_time = last_ping
            .as_ref()
            .filter(|ping| ping.sentinel_is_current)
            .map(|ping| ping.sig_time)
            .unwrap_or(0);
        Self {
            outpoint,
            addr,
            pubkey_collateral,
            pubkey_service,
            sig,
            sig_time,
            protocol_version,
            last_ping,
            last_paid_block: 0,
            last_paid_time: 0,
            pose_ban_score: 0,
            state: EntryState::PreEnabled,
            allow_mixing_tx: false,
            last_dsq: 0,
            governance_votes: BTreeSet::new(),
            dirty_governance: false,
            sentinel_ping_time,
            time_last_checked: 0,
        }
    }

    pub fn from_broadcast(broadcast: &Broadcast) -> Self {
        Self::new(
            broadcast.outpoint,
            broadcast.addr,
            broadcast.pubkey_collateral,
            broadcast.pubkey_service,
            broadcast.sig.clone(),
            broadcast.sig_time,
            broadcast.protocol_version,
            broadcast.last_ping.clone(),
        )
    }

    /// Deterministic score of this entry for the given block hash,
    /// interpreted as a 256-bit big-endian integer.
    pub fn calculate_score(&self, block_hash: &BlockHash) -> Score {
        calculate_score(&self.outpoint, &self.pubkey_collateral, block_hash)
    }

    pub fn ping_time(&self) -> i64 {
        self.last_ping
            .as_ref()
            .map(|ping| ping.sig_time)
            .unwrap_or(self.sig_time)
    }

    pub fn is_pinged_within(&self, seconds: i64, at: i64) -> bool {
        at - self.ping_time() < seconds
    }

    pub fn is_enabled(&self) -> bool {
        self.state == EntryState::Enabled
    }

    pub fn is_pose_banned(&self) -> bool {
        self.state == EntryState::PoseBanned
    }

    pub fn is_new_start_required(&self) -> bool {
        self.state == EntryState::NewStartRequired
    }

    /// An entry that answered enough verifications sits at the negative
    /// clamp and is skipped by further outbound verification rounds.
    pub fn is_pose_verified(&self, max_score: i32) -> bool {
        self.pose_ban_score <= -max_score
    }

    pub fn is_valid_for_payment(&self) -> bool {
        matches!(
            self.state,
            EntryState::Enabled | EntryState::SentinelPingExpired
        )
    }

    /// States a recovered announcement may legitimately restart from.
    pub fn is_valid_state_for_auto_start(state: EntryState) -> bool {
        matches!(
            state,
            EntryState::PreEnabled
                | EntryState::Enabled
                | EntryState::Expired
                | EntryState::SentinelPingExpired
        )
    }

    pub fn increase_pose_ban_score(&mut self, max_score: i32) {
        if self.pose_ban_score < max_score {
            self.pose_ban_score += 1;
        }
    }

    pub fn decrease_pose_ban_score(&mut self) {
        // a banned entry stays banned; its score no longer moves down.
        // zero is the floor: only the local identity fast-path may hold a
        // negative (verified) score.
        if self.is_pose_banned() {
            return;
        }
        if self.pose_ban_score > 0 {
            self.pose_ban_score -= 1;
        }
    }

    pub fn pose_ban(&mut self, max_score: i32) {
        self.pose_ban_score = max_score;
        self.state = EntryState::PoseBanned;
    }

    pub fn record_ping(&mut self, ping: Ping) {
        if ping.sentinel_is_current {
            self.sentinel_ping_time = ping.sig_time;
        }
        self.last_ping = Some(ping);
    }

    pub fn add_governance_vote(&mut self, hash: Hash256) {
        self.governance_votes.insert(hash);
    }

    pub fn remove_governance_object(&mut self, hash: &Hash256) {
        self.governance_votes.remove(hash);
    }

    pub fn flag_governance_dirty(&mut self) -> Vec<Hash256> {
        self.dirty_governance = true;
        self.governance_votes.iter().copied().collect()
    }

    /// Drive the state machine. Throttled to once per [`CHECK_SECONDS`]
    /// unless `force` is set.
    pub fn check(&mut self, ctx: &CheckContext, force: bool) {
        if !force && ctx.now - self.time_last_checked < CHECK_SECONDS {
            return;
        }
        self.time_last_checked = ctx.now;

        if self.state == EntryState::OutpointSpent {
            return;
        }
        if ctx.collateral_confirmations.is_none() {
            self.state = EntryState::OutpointSpent;
            return;
        }

        // the ban is terminal; eviction happens in the housekeeping pass
        if self.is_pose_banned() {
            return;
        }
        if self.pose_ban_score >= ctx.pose_ban_max_score {
            self.state = EntryState::PoseBanned;
            return;
        }

        let ours = ctx.service_mode
            && ctx
                .our_service_pubkey
                .map(|key| key == self.pubkey_service)
                .unwrap_or(false);

        let requires_update = self.protocol_version < ctx.min_protocol
            || (ours && self.protocol_version < ctx.client_protocol);
        if requires_update {
            self.state = EntryState::UpdateRequired;
            return;
        }

        // observers give recently paid entries a grace period before
        // expiring them; our own entry is always held to the full rules
        let wait_for_ping =
            !ctx.service_mode && ctx.now - self.last_paid_time < ctx.min_ping_seconds;

        if !wait_for_ping || ours {
            if !self.is_pinged_within(ctx.new_start_required_seconds, ctx.now) {
                self.state = EntryState::NewStartRequired;
                return;
            }

            let sentinel_expired = ctx.sentinel_active
                && ctx.now - self.sentinel_ping_time > ctx.sentinel_ping_max_seconds;
            if sentinel_expired {
                self.state = EntryState::SentinelPingExpired;
                return;
            }

            if !self.is_pinged_within(ctx.expiration_seconds, ctx.now) {
                self.state = EntryState::Expired;
                return;
            }

            if self.ping_time() - self.sig_time < ctx.min_ping_seconds {
                self.state = EntryState::PreEnabled;
                return;
            }
        }

        self.state = EntryState::Enabled;
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            outpoint: self.outpoint,
            addr: self.addr,
            pubkey_collateral: self.pubkey_collateral,
            pubkey_service: self.pubkey_service,
            sig_time: self.sig_time,
            protocol_version: self.protocol_version,
            last_ping_time: self.ping_time(),
            last_paid_block: self.last_paid_block,
            last_paid_time: self.last_paid_time,
            pose_ban_score: self.pose_ban_score,
            state: self.state,
            allow_mixing_tx: self.allow_mixing_tx,
            last_dsq: self.last_dsq,
        }
    }
}

/// Score of an entry for a block hash. The preimage is the canonical
/// encoding of the outpoint followed by the raw collateral key and the
/// block hash; the digest is compared as a big-endian 256-bit integer.
pub fn calculate_score(
    outpoint: &OutPoint,
    pubkey_collateral: &[u8; 32],
    block_hash: &BlockHash,
) -> Score {
    let mut preimage = Vec::with_capacity(36 + 32 + 32);
    preimage.extend_from_slice(&bincode::serialize(outpoint).expect("outpoint encodes"));
    preimage.extend_from_slice(pubkey_collateral);
    preimage.extend_from_slice(block_hash.as_bytes());
    sha256d(&preimage)
}

/// Value-type view of an entry handed across the registry lock boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
    pub pubkey_collateral: [u8; 32],
    pub pubkey_service: [u8; 32],
    pub sig_time: i64,
    pub protocol_version: u32,
    pub last_ping_time: i64,
    pub last_paid_block: u64,
    pub last_paid_time: i64,
    pub pose_ban_score: i32,
    pub state: EntryState,
    pub allow_mixing_tx: bool,
    pub last_dsq: u64,
}

impl EntrySnapshot {
    pub fn calculate_score(&self, block_hash: &BlockHash) -> Score {
        calculate_score(&self.outpoint, &self.pubkey_collateral, block_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(now: i64) -> CheckContext {
        CheckContext {
            now,
            min_protocol: 70_208,
            client_protocol: 70_208,
            our_service_pubkey: None,
            service_mode: false,
            sentinel_active: false,
            collateral_confirmations: Some(100),
            min_ping_seconds: 600,
            expiration_seconds: 3_900,
            new_start_required_seconds: 10_800,
            sentinel_ping_max_seconds: 7_200,
            pose_ban_max_score: 5,
        }
    }

    fn entry_at(sig_time: i64) -> Entry {
        Entry::new(
            OutPoint::new([0x11; 32], 0),
            "10.0.0.1:10001".parse().expect("addr"),
            [0x22; 32],
            [0x33; 32],
            vec![0u8; 64],
            sig_time,
            70_208,
            None,
        )
    }

    fn ping_at(outpoint: OutPoint, sig_time: i64, sentinel: bool) -> Ping {
        Ping {
            outpoint,
            block_hash: Hash256::zero(),
            sig_time,
            sentinel_is_current: sentinel,
            daemon_version: 120_300,
            sig: vec![0u8; 64],
        }
    }

    #[test]
    fn fresh_entry_is_pre_enabled_until_a_ping_matures() {
        let mut entry = entry_at(1_000);
        let mut ctx = context(1_100);
        entry.check(&ctx, true);
        assert_eq!(entry.state, EntryState::PreEnabled);

        entry.record_ping(ping_at(entry.outpoint, 1_700, false));
        ctx.now = 1_800;
        entry.check(&ctx, true);
        assert_eq!(entry.state, EntryState::Enabled);
    }

    #[test]
    fn missing_pings_walk_through_expiry_states() {
        let mut entry = entry_at(1_000);
        entry.record_ping(ping_at(entry.outpoint, 1_700, false));

        let mut ctx = context(1_700 + 3_901);
        entry.check(&ctx, true);
        assert_eq!(entry.state, EntryState::Expired);

        ctx.now = 1_700 + 10_801;
        entry.check(&ctx, true);
        assert_eq!(entry.state, EntryState::NewStartRequired);
    }

    #[test]
    fn spent_collateral_is_terminal() {
        let mut entry = entry_at(1_000);
        let mut ctx = context(1_100);
        ctx.collateral_confirmations = None;
        entry.check(&ctx, true);
        assert_eq!(entry.state, EntryState::OutpointSpent);

        ctx.collateral_confirmations = Some(100);
        ctx.now += 100;
        entry.check(&ctx, true);
        assert_eq!(entry.state, EntryState::OutpointSpent);
    }

    #[test]
    fn ban_score_is_clamped_and_bans_at_max() {
        let mut entry = entry_at(1_000);
        for _ in 0..10 {
            entry.increase_pose_ban_score(5);
        }
        assert_eq!(entry.pose_ban_score, 5);

        let ctx = context(1_100);
        entry.check(&ctx, true);
        assert_eq!(entry.state, EntryState::PoseBanned);

        // no operation on a banned entry may lower the score
        entry.decrease_pose_ban_score();
        assert_eq!(entry.pose_ban_score, 5);
    }

    #[test]
    fn sentinel_staleness_has_its_own_state() {
        let mut entry = entry_at(1_000);
        entry.record_ping(ping_at(entry.outpoint, 1_700, true));
        let mut ctx = context(1_800);
        ctx.sentinel_active = true;
        entry.check(&ctx, true);
        assert_eq!(entry.state, EntryState::Enabled);

        ctx.now = 1_700 + 7_201;
        entry.check(&ctx, true);
        assert_eq!(entry.state, EntryState::SentinelPingExpired);
    }

    #[test]
    fn score_depends_on_block_hash_and_outpoint() {
        let entry_a = entry_at(1_000);
        let mut entry_b = entry_at(1_000);
        entry_b.outpoint = OutPoint::new([0x22; 32], 0);

        let hash = Hash256([0xDE; 32]);
        let score_a = entry_a.calculate_score(&hash);
        let score_b = entry_b.calculate_score(&hash);
        assert_ne!(score_a, score_b);
        assert_eq!(score_a, entry_a.calculate_score(&hash));

        let other = Hash256([0xBE; 32]);
        assert_ne!(score_a, entry_a.calculate_score(&other));
    }
}
