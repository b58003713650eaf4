//! Node configuration (SPEC_FULL.md §6, §7.1).
//!
//! Every field has a default, and `cli` overlays a TOML file on top via
//! `confy`. Kept here rather than in
//! `cli` so that `store`/`consensus`/`storage` can all take a `NodeConfig`
//! without depending on the binary crate.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageEngine {
    Memory,
    Lsm,
}

impl Default for StorageEngine {
    fn default() -> Self {
        StorageEngine::Memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub engine: StorageEngine,
    /// Directory for the LSM store (when `engine == Lsm`) or the WAL
    /// (when `engine == Memory`).
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            engine: StorageEngine::default(),
            data_dir: "data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    pub tick_interval_millis: u64,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub max_size_per_msg: u64,
    pub max_inflight_msgs: usize,
    pub pre_vote: bool,
    pub check_quorum: bool,
    pub snapshot_count: u64,
    pub snapshot_catchup_entries: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            tick_interval_millis: 100,
            election_tick: 10,
            heartbeat_tick: 3,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            pre_vote: true,
            check_quorum: true,
            snapshot_count: 10_000,
            snapshot_catchup_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposerConfig {
    pub enabled: bool,
    pub batch_max_size: usize,
    pub batch_max_wait_millis: u64,
    pub send_timeout_secs: u64,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        ProposerConfig {
            enabled: true,
            batch_max_size: 100,
            batch_max_wait_millis: 1,
            send_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_connections: u64,
    pub max_in_flight_requests: u64,
    pub max_watch_count: u64,
    pub max_lease_count: u64,
    pub max_request_bytes: u64,
    pub max_response_bytes: u64,
    /// Bounded per-stream watch event buffer (SPEC_FULL.md §5).
    pub watch_buffer_size: usize,
    /// Deadline for a blocked send into a full watch buffer before the
    /// stream is cancelled (SPEC_FULL.md §9, backpressure semantics).
    pub watch_send_deadline_millis: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_connections: 10_000,
            max_in_flight_requests: 10_000,
            max_watch_count: 10_000,
            max_lease_count: 10_000,
            max_request_bytes: 1536 * 1024,
            max_response_bytes: 40 * 1024 * 1024,
            watch_buffer_size: 1024,
            watch_send_deadline_millis: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    pub snapshot_chunk_size: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        MaintenanceConfig {
            snapshot_chunk_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            dir: None,
        }
    }
}

/// Top-level node configuration, loaded by `cli` via `confy` and threaded
/// into `store`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub storage: StorageConfig,
    pub raft: RaftConfig,
    pub proposer: ProposerConfig,
    pub limits: LimitsConfig,
    pub maintenance: MaintenanceConfig,
    pub log: LogConfig,
}

impl NodeConfig {
    /// Raft requires `pre_vote` and `check_quorum` (SPEC_FULL.md §6); this
    /// corrects a loaded config rather than rejecting it outright.
    pub fn fix_settings(&mut self) {
        self.raft.pre_vote = true;
        self.raft.check_quorum = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_fix_settings_unchanged() {
        let mut cfg = NodeConfig::default();
        cfg.fix_settings();
        assert!(cfg.raft.pre_vote);
        assert!(cfg.raft.check_quorum);
    }
}
