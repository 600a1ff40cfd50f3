//! Bounded-by-policy gossip caches and ask-tables. Everything here lives
//! under the registry lock and is swept by the housekeeping pass; nothing
//! holds an owning reference to a registry entry.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::messages::{Broadcast, Ping, VerificationRecord};
use crate::types::{Hash256, OutPoint};

/// Collapse the port unless the chain allows several entries per IP, so
/// cooldowns apply per host rather than per socket.
pub fn squash_addr(addr: &SocketAddr, allow_multiple_ports: bool) -> SocketAddr {
    if allow_multiple_ports {
        *addr
    } else {
        let mut squashed = *addr;
        squashed.set_port(0);
        squashed
    }
}

/// Outstanding quorum request for a recovery re-announcement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryRequest {
    /// When the reply window closes; replies are settled after this.
    pub deadline: i64,
    /// Peers we asked and that have not answered yet.
    pub peers: HashSet<SocketAddr>,
}

/// Per-peer verification exchange substate: which phase of the challenge
/// protocol this peer has fulfilled, and until when that counts.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct VerifyFulfillment {
    pub requested_until: i64,
    pub replied_until: i64,
    pub done_until: i64,
}

impl VerifyFulfillment {
    fn is_spent(&self, now: i64) -> bool {
        self.requested_until <= now && self.replied_until <= now && self.done_until <= now
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GossipCaches {
    /// hash → (first/last seen time, broadcast); erased on entry removal,
    /// timestamp bumped when a duplicate arrives near the expiry horizon.
    pub seen_broadcasts: HashMap<Hash256, (i64, Broadcast)>,
    pub seen_pings: HashMap<Hash256, Ping>,
    pub seen_verifications: HashMap<Hash256, VerificationRecord>,

    pub asked_us_for_list: HashMap<SocketAddr, i64>,
    pub we_asked_for_list: HashMap<SocketAddr, i64>,
    pub we_asked_for_entry: HashMap<OutPoint, HashMap<SocketAddr, i64>>,
    pub we_asked_for_verification: HashMap<SocketAddr, VerificationRecord>,

    pub recovery_requests: HashMap<Hash256, RecoveryRequest>,
    pub recovery_good_replies: HashMap<Hash256, Vec<Broadcast>>,
    /// (peer, broadcast hash) pairs waiting for an outbound connection.
    pub scheduled_recovery: Vec<(SocketAddr, Hash256)>,
    /// peer → (enqueued at, hashes) batches already handed to the
    /// connection manager.
    pub pending_recovery: HashMap<SocketAddr, (i64, BTreeSet<Hash256>)>,

    /// Survivors of the duplicate-address sweep we still owe a
    /// verification challenge.
    pub should_ask_for_verification: BTreeMap<OutPoint, i64>,

    pub verify_fulfillment: HashMap<SocketAddr, VerifyFulfillment>,
}

impl GossipCaches {
    pub fn fulfillment(&mut self, addr: SocketAddr) -> &mut VerifyFulfillment {
        self.verify_fulfillment.entry(addr).or_default()
    }

    pub fn is_verify_requested(&self, addr: &SocketAddr, now: i64) -> bool {
        self.verify_fulfillment
            .get(addr)
            .map(|f| f.requested_until > now)
            .unwrap_or(false)
    }

    pub fn is_verify_replied(&self, addr: &SocketAddr, now: i64) -> bool {
        self.verify_fulfillment
            .get(addr)
            .map(|f| f.replied_until > now)
            .unwrap_or(false)
    }

    pub fn is_verify_done(&self, addr: &SocketAddr, now: i64) -> bool {
        self.verify_fulfillment
            .get(addr)
            .map(|f| f.done_until > now)
            .unwrap_or(false)
    }

    pub fn is_recovery_requested(&self, hash: &Hash256) -> bool {
        self.recovery_requests.contains_key(hash)
    }

    /// Pop one peer's scheduled recovery batch: sort, take the first
    /// peer, and coalesce every hash scheduled for it into one set.
    pub fn pop_scheduled_recovery(&mut self) -> Option<(SocketAddr, BTreeSet<Hash256>)> {
        if self.scheduled_recovery.is_empty() {
            return None;
        }
        self.scheduled_recovery.sort();
        let peer = self.scheduled_recovery[0].0;
        let mut hashes = BTreeSet::new();
        self.scheduled_recovery.retain(|(addr, hash)| {
            if *addr == peer {
                hashes.insert(*hash);
                false
            } else {
                true
            }
        });
        Some((peer, hashes))
    }

    /// TTL sweeps run from the housekeeping pass. Seen broadcasts are
    /// deliberately not expired here; they are erased on entry updates
    /// and removals.
    pub fn sweep(&mut self, now: i64, tip_height: u64, max_pose_blocks: u64, retry_seconds: i64) {
        self.recovery_requests
            .retain(|_, request| now - request.deadline <= retry_seconds);

        self.asked_us_for_list.retain(|_, expiry| *expiry >= now);
        self.we_asked_for_list.retain(|_, expiry| *expiry >= now);

        self.we_asked_for_entry.retain(|_, peers| {
            peers.retain(|_, expiry| *expiry >= now);
            !peers.is_empty()
        });

        let height_floor = tip_height.saturating_sub(max_pose_blocks);
        self.we_asked_for_verification
            .retain(|_, record| record.verification.block_height >= height_floor);
        self.seen_verifications
            .retain(|_, record| record.verification.block_height >= height_floor);

        self.verify_fulfillment.retain(|_, f| !f.is_spent(now));
    }

    pub fn sweep_seen_pings(&mut self, now: i64, window: i64) {
        self.seen_pings.retain(|_, ping| !ping.is_expired(now, window));
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
