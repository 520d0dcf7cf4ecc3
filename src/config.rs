//! Glacier configuration file handling
//!
//! Configuration files are TOML. Every field has a default matching a
//! 7-fragment / 3-survivor deployment, so an empty file is a valid config.
//! Durations are written in human-readable form (`"10m"`, `"20s"`).

use crate::directory::ExpiryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlacierConfig {
    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coding parameters and per-cycle bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub num_fragments: usize,
    pub num_survivors: usize,
    /// Insert hand-shake rounds before giving up.
    pub insert_attempts: u32,
    /// Status-casts a holder may miss before it is resynchronised.
    pub num_include_previous_status_casts: i64,
    pub max_concurrent_audits: usize,
    pub max_concurrent_restores: usize,
    /// Collection attempts per restore job, as a multiple of `num_fragments`.
    pub max_restore_attempt_factor: f64,
    /// Fragment fetch attempts, as a multiple of `num_survivors`.
    pub max_restore_from_fragment_factor: f64,
    /// Primary-store probes before falling back to fragments.
    pub max_audit_attempts: u32,
    /// Audit cycles a relayed status-cast is kept for.
    pub sticky_packet_lifetime: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            num_fragments: 7,
            num_survivors: 3,
            insert_attempts: 2,
            num_include_previous_status_casts: 1,
            max_concurrent_audits: 3,
            max_concurrent_restores: 100,
            max_restore_attempt_factor: 2.0,
            max_restore_from_fragment_factor: 2.0,
            max_audit_attempts: 2,
            sticky_packet_lifetime: 3,
        }
    }
}

impl ProtocolConfig {
    /// Fragments placed by the initial insert.
    pub fn num_initial_fragments(&self) -> usize {
        2 * self.num_survivors
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    #[serde(with = "human_duration")]
    pub insert_timeout: Duration,
    #[serde(with = "human_duration")]
    pub status_cast_interval: Duration,
    #[serde(with = "human_duration")]
    pub status_cast_min_delay: Duration,
    #[serde(with = "human_duration")]
    pub status_cast_jitter: Duration,
    #[serde(with = "human_duration")]
    pub audit_timeout: Duration,
    #[serde(with = "human_duration")]
    pub restore_cycle: Duration,
    #[serde(with = "human_duration")]
    pub handoff_timeout: Duration,
    #[serde(with = "human_duration")]
    pub dead_holder_entry_timeout: Duration,
    #[serde(with = "human_duration")]
    pub uncertain_holder_entry_timeout: Duration,
    #[serde(with = "human_duration")]
    pub certain_holder_entry_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            insert_timeout: Duration::from_secs(30),
            status_cast_interval: Duration::from_secs(10 * 60),
            status_cast_min_delay: Duration::from_secs(3 * 60),
            status_cast_jitter: Duration::from_secs(60),
            audit_timeout: Duration::from_secs(20),
            restore_cycle: Duration::from_secs(20),
            handoff_timeout: Duration::from_secs(20),
            // 1.2x, 3.2x and 4.2x the status-cast interval
            dead_holder_entry_timeout: Duration::from_secs(12 * 60),
            uncertain_holder_entry_timeout: Duration::from_secs(32 * 60),
            certain_holder_entry_timeout: Duration::from_secs(42 * 60),
        }
    }
}

impl TimingConfig {
    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            dead_ms: self.dead_holder_entry_timeout.as_millis() as u64,
            uncertain_ms: self.uncertain_holder_entry_timeout.as_millis() as u64,
            certain_ms: self.certain_holder_entry_timeout.as_millis() as u64,
        }
    }
}

/// Where the directory is persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// CBOR snapshot of the directory (optional, nothing persisted if unset)
    pub snapshot_path: Option<PathBuf>,

    /// Human-readable dump written next to each snapshot (optional)
    pub dump_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl GlacierConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: GlacierConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(path, contents).map_err(write_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.protocol;
        if p.num_survivors == 0 {
            return Err(ConfigError::Invalid("num_survivors must be at least 1".into()));
        }
        if p.num_initial_fragments() > p.num_fragments {
            return Err(ConfigError::Invalid(format!(
                "2 * num_survivors ({}) exceeds num_fragments ({})",
                p.num_initial_fragments(),
                p.num_fragments
            )));
        }
        if p.num_fragments > crate::erasure::reed_solomon::MAX_FRAGMENTS {
            return Err(ConfigError::Invalid(format!(
                "num_fragments ({}) exceeds {}",
                p.num_fragments,
                crate::erasure::reed_solomon::MAX_FRAGMENTS
            )));
        }
        let t = &self.timing;
        if t.dead_holder_entry_timeout > t.uncertain_holder_entry_timeout
            || t.uncertain_holder_entry_timeout > t.certain_holder_entry_timeout
        {
            return Err(ConfigError::Invalid(
                "holder entry timeouts must satisfy dead <= uncertain <= certain".into(),
            ));
        }
        if t.status_cast_interval.is_zero() {
            return Err(ConfigError::Invalid("status_cast_interval must be non-zero".into()));
        }
        Ok(())
    }

    /// Generate default configuration content as a string with comments
    pub fn generate_default_toml() -> String {
        r#"# Glacier Configuration
#
# Every setting below is optional; the values shown are the defaults.

[protocol]
# Erasure coding: any num_survivors of num_fragments rebuild an object
num_fragments = 7
num_survivors = 3

# Insert hand-shake rounds before an insert is reported as failed
insert_attempts = 2

# Missed status-casts tolerated before a holder is resynchronised
num_include_previous_status_casts = 1

max_concurrent_audits = 3
max_concurrent_restores = 100
max_restore_attempt_factor = 2.0
max_restore_from_fragment_factor = 2.0
max_audit_attempts = 2

# Audit cycles a relayed status-cast is kept for an unreachable node
sticky_packet_lifetime = 3

[timing]
insert_timeout = "30s"
status_cast_interval = "10m"
status_cast_min_delay = "3m"
status_cast_jitter = "1m"
audit_timeout = "20s"
restore_cycle = "20s"
handoff_timeout = "20s"
dead_holder_entry_timeout = "12m"
uncertain_holder_entry_timeout = "32m"
certain_holder_entry_timeout = "42m"

[storage]
# snapshot_path = "/var/lib/glacier/directory.cbor"
# dump_path = "/var/lib/glacier/directory.txt"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (optional, logs to stderr if not specified)
# file = "/var/log/glacier/glacier.log"
"#
        .to_string()
    }
}

mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
