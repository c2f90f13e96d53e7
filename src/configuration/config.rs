use super::types::*;
use crate::error_handling::types::ConfigError;
use clap::Parser;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration structure that defines all runtime parameters.
///
/// The configuration is read from a TOML file where every section is optional
/// and falls back to the defaults coturn deployments use. A handful of values can
/// then be overridden from the command line through [`CliArgs`].
///
/// # Examples
///
/// ```
/// use turnwatch::configuration::config::Config;
///
/// let config = Config::from_toml_str("[firewall]\nban_duration_secs = 60\n").unwrap();
/// assert_eq!(config.firewall.ban_duration_secs, 60);
/// assert_eq!(config.firewall.sweep_interval_secs, 10);
/// ```
///
/// # Fields Overview
///
/// - `tailer`: how to find the relay process and its log file
/// - `correlator`: retention of closed connections
/// - `admin`: the `turnadmin` tool and the pacing of the command queue
/// - `firewall`: the `iptables` tool and the ban lifetime
/// - `policy`: what to do with client events
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tailer: TailerConfig,
    pub correlator: CorrelatorConfig,
    pub admin: AdminConfig,
    pub firewall: FirewallConfig,
    pub policy: PolicyConfig,
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "turnwatch")]
#[command(version)]
#[command(about = "Follows a coturn log, tracks relay sessions and administers relay users")]
pub struct CliArgs {
    /// Path to the TOML configuration file
    ///
    /// When omitted every value takes its default.
    #[arg(short, long, env = "TURNWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Follow this log file instead of discovering it from the relay pid
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Directory searched for `turn_<pid>*.log`
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Keep relay credentials alive after their first connection
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub no_revoke: bool,

    /// Print client events to stdout as JSON lines
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub emit_json: bool,

    /// Raise the default log level to debug
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl Config {
    /// Reads and validates the configuration at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Reading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        debug!("Parsed configuration: {:?}", config);
        Ok(config)
    }

    /// Loads the file named by `args` (or defaults) and applies the CLI overrides.
    pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => {
                info!("No configuration file given, using defaults");
                Config::default()
            }
        };

        if let Some(log_file) = &args.log_file {
            config.tailer.log_file = Some(log_file.clone());
        }
        if let Some(log_dir) = &args.log_dir {
            config.tailer.log_dir = log_dir.clone();
        }
        if args.no_revoke {
            config.policy.revoke_on_connect = false;
        }
        if args.emit_json {
            config.policy.emit_json = true;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects values the subsystems cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tailer.log_file.is_none() && self.tailer.process_name.trim().is_empty() {
            return Err(ConfigError::EmptyValue(
                "tailer.process_name is required when tailer.log_file is not set".to_string(),
            ));
        }
        if self.tailer.poll_interval_ms == 0 {
            return Err(ConfigError::NotInRange(
                "tailer.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.admin.turnadmin_path.trim().is_empty() {
            return Err(ConfigError::EmptyValue("admin.turnadmin_path".to_string()));
        }
        if self.admin.max_attempts == 0 {
            return Err(ConfigError::NotInRange(
                "admin.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.firewall.iptables_path.trim().is_empty() {
            return Err(ConfigError::EmptyValue("firewall.iptables_path".to_string()));
        }
        if self.firewall.chain.trim().is_empty() {
            return Err(ConfigError::EmptyValue("firewall.chain".to_string()));
        }
        if self.firewall.ban_duration_secs == 0 || self.firewall.sweep_interval_secs == 0 {
            return Err(ConfigError::NotInRange(
                "firewall durations must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.tailer.poll_interval_ms)
    }

    pub fn dead_connection_ttl(&self) -> Duration {
        Duration::from_secs(self.correlator.dead_connection_ttl_secs)
    }

    pub fn job_delay(&self) -> Duration {
        Duration::from_millis(self.admin.job_delay_ms)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.firewall.ban_duration_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.firewall.sweep_interval_secs)
    }
}
