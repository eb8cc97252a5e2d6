// Copyright (c) 2025 Kestrel Foundation

//! Node configuration.
//!
//! Every recognised option has a production default; tests override the
//! handful they need (typically `validator_cycle` and the timings).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pre-image chain length used on production networks.
pub const PRODUCTION_CYCLE: u32 = 1008;

/// Minimum amount a freeze output must carry to back an enrollment.
pub const MIN_FREEZE_AMOUNT: u64 = 40_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Target seconds between blocks.
    #[serde(default = "default_block_interval_sec")]
    pub block_interval_sec: u64,

    /// Hard cap on the nominated tx-set size. Zero means unlimited.
    #[serde(default = "default_txs_to_nominate")]
    pub txs_to_nominate: usize,

    /// Pre-image chain length `N`; one enrollment is valid for N blocks.
    #[serde(default = "default_validator_cycle")]
    pub validator_cycle: u32,

    /// Largest quorum group before the constructor starts partitioning.
    #[serde(default = "default_max_quorum_nodes")]
    pub max_quorum_nodes: usize,

    /// Quorum threshold, in percent of each group.
    #[serde(default = "default_quorum_threshold")]
    pub quorum_threshold: u8,

    /// Blocks between quorum re-derivations.
    #[serde(default = "default_quorum_shuffle_interval")]
    pub quorum_shuffle_interval: u64,

    /// Stake deduction per missed reveal, settled at cycle end.
    #[serde(default = "default_slash_penalty_amount")]
    pub slash_penalty_amount: u64,

    /// Minimum fee per transaction.
    #[serde(default = "default_min_fee")]
    pub min_fee: u64,

    /// Blocks between validator fee payouts.
    #[serde(default = "default_payout_period")]
    pub payout_period: u64,

    /// Percentage of pooled fees paid out to validators.
    #[serde(default = "default_validator_tx_fee_cut")]
    pub validator_tx_fee_cut: u8,

    /// Automatically re-enroll when our cycle ends.
    #[serde(default = "default_true")]
    pub recurring_enrollment: bool,

    /// Cap on enrollments admitted into one block header.
    #[serde(default = "default_max_enrollments_per_block")]
    pub max_enrollments_per_block: usize,

    /// Delay between retries of a failed peer call.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Retries before a peer call counts as failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-call peer RPC timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Failed requests before a peer is banned.
    #[serde(default = "default_max_failed_requests")]
    pub max_failed_requests: u32,

    /// How long a ban lasts.
    #[serde(default = "default_ban_duration_sec")]
    pub ban_duration_sec: u64,

    /// Seconds between catchup probes past our tip.
    #[serde(default = "default_block_catchup_interval_sec")]
    pub block_catchup_interval_sec: u64,

    /// Gossip pacing: max transactions relayed per interval.
    #[serde(default = "default_relay_tx_max_num")]
    pub relay_tx_max_num: usize,

    /// Gossip pacing: seconds between relay batches.
    #[serde(default = "default_relay_tx_interval_sec")]
    pub relay_tx_interval_sec: u64,

    /// Gossip pacing: do not relay transactions under this fee.
    #[serde(default = "default_relay_tx_min_fee")]
    pub relay_tx_min_fee: u64,

    /// Gossip pacing: seconds a relayed hash stays in the dedup cache.
    #[serde(default = "default_relay_tx_cache_exp_sec")]
    pub relay_tx_cache_exp_sec: u64,
}

fn default_block_interval_sec() -> u64 {
    10
}
fn default_txs_to_nominate() -> usize {
    8
}
fn default_validator_cycle() -> u32 {
    PRODUCTION_CYCLE
}
fn default_max_quorum_nodes() -> usize {
    7
}
fn default_quorum_threshold() -> u8 {
    80
}
fn default_quorum_shuffle_interval() -> u64 {
    30
}
fn default_slash_penalty_amount() -> u64 {
    10_000
}
fn default_min_fee() -> u64 {
    700
}
fn default_payout_period() -> u64 {
    144
}
fn default_validator_tx_fee_cut() -> u8 {
    70
}
fn default_true() -> bool {
    true
}
fn default_max_enrollments_per_block() -> usize {
    5
}
fn default_retry_delay_ms() -> u64 {
    250
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_ms() -> u64 {
    5_000
}
fn default_max_failed_requests() -> u32 {
    100
}
fn default_ban_duration_sec() -> u64 {
    60 * 60 * 24
}
fn default_block_catchup_interval_sec() -> u64 {
    20
}
fn default_relay_tx_max_num() -> usize {
    100
}
fn default_relay_tx_interval_sec() -> u64 {
    15
}
fn default_relay_tx_min_fee() -> u64 {
    0
}
fn default_relay_tx_cache_exp_sec() -> u64 {
    1200
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_interval_sec: default_block_interval_sec(),
            txs_to_nominate: default_txs_to_nominate(),
            validator_cycle: default_validator_cycle(),
            max_quorum_nodes: default_max_quorum_nodes(),
            quorum_threshold: default_quorum_threshold(),
            quorum_shuffle_interval: default_quorum_shuffle_interval(),
            slash_penalty_amount: default_slash_penalty_amount(),
            min_fee: default_min_fee(),
            payout_period: default_payout_period(),
            validator_tx_fee_cut: default_validator_tx_fee_cut(),
            recurring_enrollment: default_true(),
            max_enrollments_per_block: default_max_enrollments_per_block(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retries: default_max_retries(),
            timeout_ms: default_timeout_ms(),
            max_failed_requests: default_max_failed_requests(),
            ban_duration_sec: default_ban_duration_sec(),
            block_catchup_interval_sec: default_block_catchup_interval_sec(),
            relay_tx_max_num: default_relay_tx_max_num(),
            relay_tx_interval_sec: default_relay_tx_interval_sec(),
            relay_tx_min_fee: default_relay_tx_min_fee(),
            relay_tx_cache_exp_sec: default_relay_tx_cache_exp_sec(),
        }
    }
}

impl Config {
    /// Settings used by the in-process scenario tests: a short cycle
    /// and one-second blocks.
    pub fn test_config() -> Self {
        Self {
            block_interval_sec: 1,
            validator_cycle: 20,
            quorum_shuffle_interval: 1,
            block_catchup_interval_sec: 1,
            max_enrollments_per_block: 8,
            ..Self::default()
        }
    }

    pub fn block_interval(&self) -> Duration {
        Duration::from_secs(self.block_interval_sec)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_sec)
    }

    pub fn catchup_interval(&self) -> Duration {
        Duration::from_secs(self.block_catchup_interval_sec)
    }
}
