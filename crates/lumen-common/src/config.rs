//! Node configuration.
//!
//! Configuration is loaded from a TOML file. Every herder knob has a default
//! matching stellar-core, so a minimal file only names the network and, for a
//! validator, the node seed and quorum set.
//!
//! ```toml
//! [network]
//! passphrase = "Lumen Test Network"
//!
//! [node]
//! seed = "SBX..."
//! is_validator = true
//!
//! [node.quorum_set]
//! threshold = 2
//! validators = ["GA...", "GB...", "GC..."]
//!
//! [herder]
//! ledger_close_time_secs = 5
//! max_pending_envelopes = 2000
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Log levels for filtering log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub node: NodeConfig,
    pub herder: HerderSettings,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and parse a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.network.passphrase.is_empty() {
            return Err(Error::Config("network.passphrase must not be empty".into()));
        }
        if self.node.is_validator && self.node.seed.is_none() {
            return Err(Error::Config("a validator needs node.seed".into()));
        }
        if self.herder.ledger_close_time_secs == 0 {
            return Err(Error::Config(
                "herder.ledger_close_time_secs must be positive".into(),
            ));
        }
        if self.herder.max_slots_to_remember == 0 {
            return Err(Error::Config(
                "herder.max_slots_to_remember must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Network identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Passphrase the network id is derived from.
    pub passphrase: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            passphrase: "Lumen Standalone Network".to_string(),
        }
    }
}

/// Local node identity and trust.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Secret seed (S...). Watchers may omit it.
    pub seed: Option<String>,
    /// Whether this node emits consensus statements.
    pub is_validator: bool,
    /// Local quorum set.
    pub quorum_set: QuorumSetConfig,
}

/// Quorum set as written in configuration, validators in strkey form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumSetConfig {
    pub threshold: u32,
    pub validators: Vec<String>,
    pub inner_sets: Vec<QuorumSetConfig>,
}

/// Herder timing and capacity knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HerderSettings {
    /// Expected time between ledger closes.
    pub ledger_close_time_secs: u64,
    /// Heartbeat window after which the node considers itself out of sync.
    pub consensus_stuck_timeout_secs: u64,
    /// Fixed interval between rebroadcasts of our latest envelope.
    pub rebroadcast_interval_ms: u64,
    /// How far into the future a proposed close time may be.
    pub max_time_slip_secs: u64,
    /// Base fee this node proposes and accepts within a factor of two.
    pub desired_base_fee: u32,
    /// Maximum number of transactions in a proposed set.
    pub max_tx_set_size: usize,
    /// Cap on envelopes parked waiting for dependencies.
    pub max_pending_envelopes: usize,
    /// Slots kept behind the current one.
    pub max_slots_to_remember: u32,
    /// Slots accepted ahead of the current one while tracking.
    pub ledger_validity_bracket: u32,
    /// How long to wait for a peer to answer a fetch.
    pub fetch_reply_timeout_ms: u64,
    /// Cached transaction sets.
    pub tx_set_cache_size: usize,
    /// Cached quorum sets.
    pub qset_cache_size: usize,
}

impl Default for HerderSettings {
    fn default() -> Self {
        Self {
            ledger_close_time_secs: 5,
            consensus_stuck_timeout_secs: 35,
            rebroadcast_interval_ms: 2000,
            max_time_slip_secs: 60,
            desired_base_fee: 100,
            max_tx_set_size: 1000,
            max_pending_envelopes: 2000,
            max_slots_to_remember: 12,
            ledger_validity_bracket: 100,
            fetch_reply_timeout_ms: 1500,
            tx_set_cache_size: 100,
            qset_cache_size: 1000,
        }
    }
}

/// Logging section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Per-partition overrides, e.g. `Herder = "trace"`.
    pub partitions: std::collections::BTreeMap<String, LogLevel>,
}
