use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{RegistryError, RegistryResult};

/// Runtime configuration of the registry engine. Defaults mirror main-net
/// chain parameters; tests and alternate networks override individual
/// fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Disables every registry function; the node runs as a thin client.
    #[serde(default)]
    pub lite_mode: bool,
    /// This node operates a registered service entry and answers
    /// verification challenges.
    #[serde(default)]
    pub service_mode: bool,
    /// Allow several entries to share an IP on distinct ports; also keeps
    /// ports significant in ask-table keys.
    #[serde(default)]
    pub allow_multiple_ports: bool,
    #[serde(default = "default_true")]
    pub ok_ipv4: bool,
    #[serde(default)]
    pub ok_ipv6: bool,
    /// Probe both address families regardless of the per-family flags.
    #[serde(default)]
    pub ok_dual: bool,
    /// Node was started with a fixed connection set; recovery requests to
    /// arbitrary peers are suppressed.
    #[serde(default)]
    pub connect_only: bool,
    /// Entries on the main network must announce this port.
    #[serde(default = "default_port")]
    pub default_port: u16,
    /// Enforce main-net address rules (port pinning, list-query cooldown
    /// misbehavior).
    #[serde(default = "default_true")]
    pub main_network: bool,

    #[serde(default = "default_dseg_update_seconds")]
    pub dseg_update_seconds: i64,
    #[serde(default = "default_recovery_quorum_total")]
    pub recovery_quorum_total: usize,
    #[serde(default = "default_recovery_quorum_required")]
    pub recovery_quorum_required: usize,
    #[serde(default = "default_recovery_max_ask_entries")]
    pub recovery_max_ask_entries: usize,
    #[serde(default = "default_recovery_wait_seconds")]
    pub recovery_wait_seconds: i64,
    #[serde(default = "default_recovery_retry_seconds")]
    pub recovery_retry_seconds: i64,
    #[serde(default = "default_max_pose_rank")]
    pub max_pose_rank: u32,
    #[serde(default = "default_max_pose_connections")]
    pub max_pose_connections: usize,
    #[serde(default = "default_max_pose_blocks")]
    pub max_pose_blocks: u64,
    #[serde(default = "default_min_ping_seconds")]
    pub min_ping_seconds: i64,
    #[serde(default = "default_expiration_seconds")]
    pub expiration_seconds: i64,
    #[serde(default = "default_new_start_required_seconds")]
    pub new_start_required_seconds: i64,
    #[serde(default = "default_sentinel_ping_max_seconds")]
    pub sentinel_ping_max_seconds: i64,
    #[serde(default = "default_pose_ban_max_score")]
    pub pose_ban_max_score: i32,
    #[serde(default = "default_last_paid_scan_blocks")]
    pub last_paid_scan_blocks: u64,
    #[serde(default = "default_min_collateral_confirmations")]
    pub min_collateral_confirmations: i64,
    #[serde(default = "default_fulfilled_expire_seconds")]
    pub fulfilled_expire_seconds: i64,
    #[serde(default = "default_pending_request_timeout_seconds")]
    pub pending_request_timeout_seconds: i64,
    /// Protocol version this build speaks; announcements from our own
    /// identity must match it exactly.
    #[serde(default = "default_client_protocol")]
    pub client_protocol: u32,
    /// Daemon version this build reports in pings.
    #[serde(default = "default_client_daemon_version")]
    pub client_daemon_version: u32,
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    10_001
}

fn default_dseg_update_seconds() -> i64 {
    3 * 60 * 60
}

fn default_recovery_quorum_total() -> usize {
    10
}

fn default_recovery_quorum_required() -> usize {
    6
}

fn default_recovery_max_ask_entries() -> usize {
    10
}

fn default_recovery_wait_seconds() -> i64 {
    60
}

fn default_recovery_retry_seconds() -> i64 {
    3 * 60 * 60
}

fn default_max_pose_rank() -> u32 {
    10
}

fn default_max_pose_connections() -> usize {
    10
}

fn default_max_pose_blocks() -> u64 {
    10
}

fn default_min_ping_seconds() -> i64 {
    10 * 60
}

fn default_expiration_seconds() -> i64 {
    65 * 60
}

fn default_new_start_required_seconds() -> i64 {
    180 * 60
}

fn default_sentinel_ping_max_seconds() -> i64 {
    120 * 60
}

fn default_pose_ban_max_score() -> i32 {
    5
}

fn default_last_paid_scan_blocks() -> u64 {
    100
}

fn default_min_collateral_confirmations() -> i64 {
    15
}

fn default_fulfilled_expire_seconds() -> i64 {
    60 * 60
}

fn default_pending_request_timeout_seconds() -> i64 {
    15
}

fn default_client_protocol() -> u32 {
    70_208
}

fn default_client_daemon_version() -> u32 {
    120_300
}

impl RegistryConfig {
    pub fn load(path: &Path) -> RegistryResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| RegistryError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> RegistryResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| RegistryError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    /// Seconds a freshly announced entry must wait before the sig-time
    /// payment filter stops skipping it, per known entry.
    pub fn sig_time_slack_per_entry(&self) -> i64 {
        156
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lite_mode: false,
            service_mode: false,
            allow_multiple_ports: false,
            ok_ipv4: true,
            ok_ipv6: false,
            ok_dual: false,
            connect_only: false,
            default_port: default_port(),
            main_network: true,
            dseg_update_seconds: default_dseg_update_seconds(),
            recovery_quorum_total: default_recovery_quorum_total(),
            recovery_quorum_required: default_recovery_quorum_required(),
            recovery_max_ask_entries: default_recovery_max_ask_entries(),
            recovery_wait_seconds: default_recovery_wait_seconds(),
            recovery_retry_seconds: default_recovery_retry_seconds(),
            max_pose_rank: default_max_pose_rank(),
            max_pose_connections: default_max_pose_connections(),
            max_pose_blocks: default_max_pose_blocks(),
            min_ping_seconds: default_min_ping_seconds(),
            expiration_seconds: default_expiration_seconds(),
            new_start_required_seconds: default_new_start_required_seconds(),
            sentinel_ping_max_seconds: default_sentinel_ping_max_seconds(),
            pose_ban_max_score: default_pose_ban_max_score(),
            last_paid_scan_blocks: default_last_paid_scan_blocks(),
            min_collateral_confirmations: default_min_collateral_confirmations(),
            fulfilled_expire_seconds: default_fulfilled_expire_seconds(),
            pending_request_timeout_seconds: default_pending_request_timeout_seconds(),
            client_protocol: default_client_protocol(),
            client_daemon_version: default_client_daemon_version(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_round_trip_through_toml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("registry.toml");
        let config = RegistryConfig::default();
        config.save(&path).expect("save");
        let loaded = RegistryConfig::load(&path).expect("load");
        assert_eq!(loaded.dseg_update_seconds, config.dseg_update_seconds);
        assert_eq!(loaded.pose_ban_max_score, 5);
        assert_eq!(loaded.recovery_quorum_required, 6);
        assert!(!loaded.lite_mode);
    }
}
