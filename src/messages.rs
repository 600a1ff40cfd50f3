//! Wire payloads gossiped between nodes: entry announcements, liveness
//! pings and pairwise verifications, plus the envelope enum the dispatcher
//! consumes. Hashes are double-SHA256 over the canonical bincode encoding
//! of the identifying fields, so equal payloads dedupe to equal hashes on
//! every node.

use std::net::SocketAddr;

use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::config::RegistryConfig;
use crate::crypto::{
    hash_payload, sign_hash, sign_message, verify_hash, verify_message, SignatureScheme,
};
use crate::entry::{Entry, EntryState};
use crate::errors::{RegistryError, Rejection};
use crate::types::{BlockHash, Hash256, OutPoint};

/// A re-announcement inside this window is accepted but does not rewrite
/// the entry, except for our own identity.
pub const MIN_BROADCAST_SECONDS: i64 = 5 * 60;

/// Announcements claiming a sig-time further in the future than this are
/// charged as misbehavior.
pub const MAX_FUTURE_SIG_TIME_SECONDS: i64 = 60 * 60;

/// Pings referencing blocks deeper than this below the tip are dropped.
pub const MAX_PING_BLOCK_DEPTH: u64 = 24;

/// Sync asset identifier reported after serving a full list sync.
pub const SYNC_ASSET_LIST: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvKind {
    Announce,
    Ping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: Hash256,
}

/// Envelope for every registry message on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireMessage {
    Announce(Broadcast),
    Ping(Ping),
    /// Null outpoint requests the full list.
    Query(OutPoint),
    Verify(Verification),
    SyncCount { asset: u32, count: u32 },
    Inv(Vec<Inv>),
    GetData(Vec<Inv>),
}

/// Periodic signed liveness heartbeat of an entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub outpoint: OutPoint,
    pub block_hash: BlockHash,
    pub sig_time: i64,
    pub sentinel_is_current: bool,
    pub daemon_version: u32,
    pub sig: Vec<u8>,
}

impl Ping {
    pub fn hash(&self) -> Hash256 {
        hash_payload(&(self.outpoint, self.sig_time)).expect("ping identity encodes")
    }

    fn signature_hash(&self) -> Hash256 {
        hash_payload(&(
            self.outpoint,
            self.block_hash,
            self.sig_time,
            self.sentinel_is_current,
            self.daemon_version,
        ))
        .expect("ping preimage encodes")
    }

    fn legacy_message(&self) -> String {
        format!("{}{}{}", self.outpoint.short(), self.block_hash, self.sig_time)
    }

    pub fn sign(&mut self, service_key: &Keypair, scheme: SignatureScheme) {
        self.sig = match scheme {
            SignatureScheme::Hash => sign_hash(service_key, &self.signature_hash()),
            SignatureScheme::Message => sign_message(service_key, &self.legacy_message()),
        };
    }

    pub fn verify(
        &self,
        pubkey_service: &[u8; 32],
        scheme: SignatureScheme,
    ) -> Result<(), RegistryError> {
        match scheme {
            SignatureScheme::Hash => verify_hash(pubkey_service, &self.signature_hash(), &self.sig),
            SignatureScheme::Message => {
                verify_message(pubkey_service, &self.legacy_message(), &self.sig)
            }
        }
    }

    /// Syntactic checks that need no chain access.
    pub fn simple_check(&self, now: i64) -> Result<(), Rejection> {
        if self.sig_time > now + MAX_FUTURE_SIG_TIME_SECONDS {
            return Err(Rejection::new(
                RegistryError::Rejected(format!(
                    "ping signature time {} too far in the future",
                    self.sig_time
                )),
                1,
            ));
        }
        Ok(())
    }

    pub fn is_expired(&self, now: i64, window: i64) -> bool {
        now - self.sig_time > window
    }

    /// Validate this ping against its entry and record it on success.
    /// Returns whether the caller should keep the sync timeout alive. The
    /// caller re-runs the entry state machine and derives the relay
    /// decision from the resulting state.
    pub fn check_and_update(
        &self,
        entry: &mut Entry,
        from_new_broadcast: bool,
        ctx: &PingCheckContext,
    ) -> Result<bool, Rejection> {
        self.simple_check(ctx.now)?;

        if !from_new_broadcast
            && matches!(
                entry.state,
                EntryState::UpdateRequired | EntryState::NewStartRequired
            )
        {
            return Err(Rejection::silent(RegistryError::Rejected(format!(
                "entry {} cannot accept pings in state {}",
                entry.outpoint, entry.state
            ))));
        }

        match ctx.ping_block_height {
            None => {
                return Err(Rejection::silent(RegistryError::Rejected(format!(
                    "ping references unknown block {}",
                    self.block_hash
                ))));
            }
            Some(height) if height + MAX_PING_BLOCK_DEPTH < ctx.tip_height => {
                return Err(Rejection::silent(RegistryError::Rejected(format!(
                    "ping references block at height {height}, too far below tip {}",
                    ctx.tip_height
                ))));
            }
            Some(_) => {}
        }

        self.verify(&entry.pubkey_service, ctx.scheme)
            .map_err(|err| Rejection::new(err, 33))?;

        // a fresh ping must actually be newer than the stored one, with a
        // minute of slack for clock drift between announcers
        if entry.is_pinged_within(ctx.min_ping_seconds - 60, self.sig_time) {
            return Err(Rejection::silent(RegistryError::Rejected(format!(
                "ping for {} arrived too early",
                entry.outpoint
            ))));
        }

        let bump_sync =
            !ctx.list_synced && !entry.is_pinged_within(ctx.expiration_seconds / 2, ctx.now);
        entry.record_ping(self.clone());
        Ok(bump_sync)
    }
}

/// Chain and sync facts needed to judge a ping.
#[derive(Clone, Copy, Debug)]
pub struct PingCheckContext {
    pub now: i64,
    pub tip_height: u64,
    /// Height of the block the ping commits to; `None` when unknown.
    pub ping_block_height: Option<u64>,
    pub scheme: SignatureScheme,
    pub min_ping_seconds: i64,
    pub expiration_seconds: i64,
    pub list_synced: bool,
}

/// The signed record that introduces or refreshes a registry entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Broadcast {
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
    pub pubkey_collateral: [u8; 32],
    pub pubkey_service: [u8; 32],
    pub sig: Vec<u8>,
    pub sig_time: i64,
    pub protocol_version: u32,
    pub last_ping: Option<Ping>,
    /// Set when this broadcast answers a recovery request; bypasses the
    /// seen-cache short-circuit. Never serialized.
    #[serde(skip)]
    pub f_recovery: bool,
}

impl Broadcast {
    /// Identity of the announcement: same collateral and sig-time dedupe
    /// to the same hash, a re-announcement gets a fresh one.
    pub fn hash(&self) -> Hash256 {
        hash_payload(&(self.outpoint, self.pubkey_collateral, self.sig_time))
            .expect("broadcast identity encodes")
    }

    fn signature_hash(&self) -> Hash256 {
        hash_payload(&(
            self.outpoint,
            self.addr,
            self.pubkey_collateral,
            self.pubkey_service,
            self.sig_time,
            self.protocol_version,
        ))
        .expect("broadcast preimage encodes")
    }

    fn legacy_message(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.addr,
            self.sig_time,
            hex::encode(self.pubkey_collateral),
            hex::encode(self.pubkey_service),
            self.protocol_version
        )
    }

    pub fn sign(&mut self, collateral_key: &Keypair, scheme: SignatureScheme) {
        self.sig = match scheme {
            SignatureScheme::Hash => sign_hash(collateral_key, &self.signature_hash()),
            SignatureScheme::Message => sign_message(collateral_key, &self.legacy_message()),
        };
    }

    pub fn verify_signature(&self, scheme: SignatureScheme) -> Result<(), RegistryError> {
        match scheme {
            SignatureScheme::Hash => {
                verify_hash(&self.pubkey_collateral, &self.signature_hash(), &self.sig)
            }
            SignatureScheme::Message => {
                verify_message(&self.pubkey_collateral, &self.legacy_message(), &self.sig)
            }
        }
    }

    /// Syntactic and signature validation; no chain or registry access.
    pub fn simple_check(
        &self,
        config: &RegistryConfig,
        min_protocol: u32,
        now: i64,
        scheme: SignatureScheme,
    ) -> Result<(), Rejection> {
        if self.sig_time > now + MAX_FUTURE_SIG_TIME_SECONDS {
            return Err(Rejection::new(
                RegistryError::Rejected(format!(
                    "announcement signature time {} too far in the future",
                    self.sig_time
                )),
                1,
            ));
        }

        if let Some(ping) = &self.last_ping {
            ping.simple_check(now)?;
            if ping.outpoint != self.outpoint {
                return Err(Rejection::new(
                    RegistryError::Rejected("announcement ping names a different entry".into()),
                    33,
                ));
            }
        }

        if self.protocol_version < min_protocol {
            return Err(Rejection::silent(RegistryError::Rejected(format!(
                "obsolete protocol version {}",
                self.protocol_version
            ))));
        }

        if config.main_network
            && !config.allow_multiple_ports
            && self.addr.port() != config.default_port
        {
            return Err(Rejection::silent(RegistryError::Rejected(format!(
                "wrong service port {}",
                self.addr.port()
            ))));
        }

        self.verify_signature(scheme)
            .map_err(|err| Rejection::new(err, 100))?;

        Ok(())
    }

    /// Network-class policy for the announced address. Main-net style
    /// networks additionally demand a routable address.
    pub fn check_addr(&self, config: &RegistryConfig) -> Result<(), Rejection> {
        let class_ok = match self.addr {
            SocketAddr::V4(_) => config.ok_ipv4 || config.ok_dual,
            SocketAddr::V6(_) => config.ok_ipv6 || config.ok_dual,
        };
        let routable_ok = !config.main_network
            || match self.addr {
                SocketAddr::V4(v4) => {
                    !v4.ip().is_loopback() && !v4.ip().is_private() && !v4.ip().is_unspecified()
                }
                SocketAddr::V6(v6) => !v6.ip().is_loopback() && !v6.ip().is_unspecified(),
            };
        if class_ok && routable_ok {
            Ok(())
        } else {
            Err(Rejection::silent(RegistryError::Rejected(format!(
                "service address {} not allowed on this network",
                self.addr
            ))))
        }
    }

    /// Collateral policy: the funding UTXO must be unspent and buried.
    pub fn check_outpoint(
        &self,
        confirmations: Option<i64>,
        min_confirmations: i64,
    ) -> Result<(), Rejection> {
        match confirmations {
            None => Err(Rejection::silent(RegistryError::Rejected(format!(
                "collateral {} unavailable or spent",
                self.outpoint
            )))),
            Some(depth) if depth < min_confirmations => {
                Err(Rejection::silent(RegistryError::Rejected(format!(
                    "collateral {} has {depth} of {min_confirmations} confirmations",
                    self.outpoint
                ))))
            }
            Some(_) => Ok(()),
        }
    }
}

/// Result of folding an announcement into an existing entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Same sig-time we already hold; nothing to do.
    Duplicate,
    /// Valid but inside the re-announcement window; accepted without
    /// rewriting the entry.
    Throttled,
    Updated,
}

impl Broadcast {
    pub fn from_entry(entry: &Entry) -> Self {
        Self {
            outpoint: entry.outpoint,
            addr: entry.addr,
            pubkey_collateral: entry.pubkey_collateral,
            pubkey_service: entry.pubkey_service,
            sig: entry.sig.clone(),
            sig_time: entry.sig_time,
            protocol_version: entry.protocol_version,
            last_ping: entry.last_ping.clone(),
            f_recovery: false,
        }
    }

    /// Fold this announcement into the entry it refreshes.
    pub fn update_entry(
        &self,
        entry: &mut Entry,
        now: i64,
        scheme: SignatureScheme,
        service_mode: bool,
        our_service_pubkey: Option<[u8; 32]>,
    ) -> Result<UpdateOutcome, Rejection> {
        if entry.sig_time == self.sig_time && !self.f_recovery {
            return Ok(UpdateOutcome::Duplicate);
        }
        if entry.sig_time > self.sig_time {
            return Err(Rejection::silent(RegistryError::Rejected(format!(
                "announcement for {} is older than the one we hold",
                self.outpoint
            ))));
        }
        if entry.is_pose_banned() {
            return Err(Rejection::silent(RegistryError::Rejected(format!(
                "entry {} is banned",
                self.outpoint
            ))));
        }
        if entry.pubkey_collateral != self.pubkey_collateral {
            return Err(Rejection::new(
                RegistryError::Rejected(format!(
                    "announcement for {} carries a different collateral key",
                    self.outpoint
                )),
                33,
            ));
        }
        self.verify_signature(scheme)
            .map_err(|err| Rejection::new(err, 100))?;

        let ours = service_mode
            && our_service_pubkey
                .map(|key| key == self.pubkey_service)
                .unwrap_or(false);
        if now - entry.sig_time < MIN_BROADCAST_SECONDS && !ours {
            return Ok(UpdateOutcome::Throttled);
        }

        entry.addr = self.addr;
        entry.pubkey_service = self.pubkey_service;
        entry.sig = self.sig.clone();
        entry.sig_time = self.sig_time;
        entry.protocol_version = self.protocol_version;
        if let Some(ping) = &self.last_ping {
            entry.record_ping(ping.clone());
        }
        Ok(UpdateOutcome::Updated)
    }
}

/// Three-phase pairwise verification. The populated signatures tell the
/// receiver which stage it is looking at: none = challenge, `sig1` =
/// reply, both = relayed attestation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub addr: SocketAddr,
    pub nonce: u32,
    pub block_height: u64,
    pub sig1: Vec<u8>,
    pub sig2: Vec<u8>,
    pub outpoint1: OutPoint,
    pub outpoint2: OutPoint,
}

impl Verification {
    pub fn new(addr: SocketAddr, nonce: u32, block_height: u64) -> Self {
        Self {
            addr,
            nonce,
            block_height,
            sig1: Vec::new(),
            sig2: Vec::new(),
            outpoint1: OutPoint::null(),
            outpoint2: OutPoint::null(),
        }
    }

    pub fn hash(&self) -> Hash256 {
        hash_payload(&(self.addr, self.nonce, self.block_height))
            .expect("verification identity encodes")
    }

    pub fn signature_hash1(&self, block_hash: &BlockHash) -> Hash256 {
        hash_payload(&(self.addr, self.nonce, *block_hash)).expect("verification preimage encodes")
    }

    pub fn signature_hash2(&self, block_hash: &BlockHash) -> Hash256 {
        hash_payload(&(
            self.addr,
            self.nonce,
            *block_hash,
            self.outpoint1,
            self.outpoint2,
        ))
        .expect("verification preimage encodes")
    }

    pub fn legacy_message1(&self, block_hash: &BlockHash) -> String {
        format!("{}{}{}", self.addr, self.nonce, block_hash)
    }

    pub fn legacy_message2(&self, block_hash: &BlockHash) -> String {
        format!(
            "{}{}{}",
            self.legacy_message1(block_hash),
            self.outpoint1.short(),
            self.outpoint2.short()
        )
    }

    pub fn sign_reply(&mut self, service_key: &Keypair, block_hash: &BlockHash, scheme: SignatureScheme) {
        self.sig1 = match scheme {
            SignatureScheme::Hash => sign_hash(service_key, &self.signature_hash1(block_hash)),
            SignatureScheme::Message => {
                sign_message(service_key, &self.legacy_message1(block_hash))
            }
        };
    }

    pub fn sign_broadcast(
        &mut self,
        service_key: &Keypair,
        block_hash: &BlockHash,
        scheme: SignatureScheme,
    ) {
        self.sig2 = match scheme {
            SignatureScheme::Hash => sign_hash(service_key, &self.signature_hash2(block_hash)),
            SignatureScheme::Message => {
                sign_message(service_key, &self.legacy_message2(block_hash))
            }
        };
    }

    pub fn verify_sig1(
        &self,
        pubkey_service: &[u8; 32],
        block_hash: &BlockHash,
        scheme: SignatureScheme,
    ) -> Result<(), RegistryError> {
        match scheme {
            SignatureScheme::Hash => {
                verify_hash(pubkey_service, &self.signature_hash1(block_hash), &self.sig1)
            }
            SignatureScheme::Message => {
                verify_message(pubkey_service, &self.legacy_message1(block_hash), &self.sig1)
            }
        }
    }

    pub fn verify_sig2(
        &self,
        pubkey_service: &[u8; 32],
        block_hash: &BlockHash,
        scheme: SignatureScheme,
    ) -> Result<(), RegistryError> {
        match scheme {
            SignatureScheme::Hash => {
                verify_hash(pubkey_service, &self.signature_hash2(block_hash), &self.sig2)
            }
            SignatureScheme::Message => {
                verify_message(pubkey_service, &self.legacy_message2(block_hash), &self.sig2)
            }
        }
    }

    /// Self-signature sanity check after signing, mirroring the sign path.
    pub fn self_check_reply(
        &self,
        service_key: &Keypair,
        block_hash: &BlockHash,
        scheme: SignatureScheme,
    ) -> Result<(), RegistryError> {
        self.verify_sig1(&service_key.public.to_bytes(), block_hash, scheme)
    }
}

/// Cached verification together with the signature scheme it was produced
/// under, so later replays verify against the same preimage rules.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub verification: Verification,
    pub scheme: SignatureScheme,
}
