use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where to find the relay process and its log.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TailerConfig {
    /// Process name handed to `pgrep`.
    pub process_name: String,
    /// Added to the pid reported by `pgrep` before building the log name.
    ///
    /// Relays started through a wrapper log under the pid one below the one
    /// `pgrep` reports; those deployments set `-1`.
    pub pid_offset: i64,
    /// Directory holding the `turn_<pid>*.log` files.
    pub log_dir: PathBuf,
    /// Explicit log file; skips process and file discovery when set.
    pub log_file: Option<PathBuf>,
    /// Fallback polling period in case watcher notifications are missed.
    pub poll_interval_ms: u64,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            process_name: String::from("turnserver"),
            pid_offset: 0,
            log_dir: PathBuf::from("/var/log"),
            log_file: None,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// How long a closed connection stays revivable by late usage lines.
    pub dead_connection_ttl_secs: u64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            dead_connection_ttl_secs: 600,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub turnadmin_path: String,
    /// Pause enforced between two consecutive `turnadmin` invocations.
    pub job_delay_ms: u64,
    /// Attempts per job when the tool reports a retryable failure.
    pub max_attempts: u32,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            turnadmin_path: String::from("turnadmin"),
            job_delay_ms: 1000,
            max_attempts: 1,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub iptables_path: String,
    pub chain: String,
    pub ban_duration_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            iptables_path: String::from("iptables"),
            chain: String::from("INPUT"),
            ban_duration_secs: 120,
            sweep_interval_secs: 10,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Delete a relay user as soon as its first allocation succeeds.
    pub revoke_on_connect: bool,
    /// Print every client event to stdout as a JSON line.
    pub emit_json: bool,
    /// Ban a connection once its relayed bytes (`rb + sb`) reach this
    /// amount. 0 disables the check.
    pub boot_after_bytes: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            revoke_on_connect: true,
            emit_json: false,
            boot_after_bytes: 0,
        }
    }
}
