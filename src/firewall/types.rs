//! Core types used by the firewall subsystem.

use tokio::time::Instant;
use uuid::Uuid;

use crate::command_queue::CommandSpec;

/// Builds the `iptables` invocations for a UDP drop rule scoped to one source.
#[derive(Debug, Clone)]
pub struct DropRule {
    /// Path or name of the `iptables` binary.
    pub iptables: String,
    /// Chain the rule lives in, normally `INPUT`.
    pub chain: String,
}

impl DropRule {
    pub fn new(iptables: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            iptables: iptables.into(),
            chain: chain.into(),
        }
    }

    pub fn insert(&self, ip: &str) -> CommandSpec {
        self.command("-A", ip)
    }

    pub fn remove(&self, ip: &str) -> CommandSpec {
        self.command("-D", ip)
    }

    fn command(&self, action: &str, ip: &str) -> CommandSpec {
        CommandSpec::new(&self.iptables).args([
            action,
            self.chain.as_str(),
            "-p",
            "udp",
            "-s",
            ip,
            "-j",
            "DROP",
        ])
    }
}

impl Default for DropRule {
    fn default() -> Self {
        Self::new("iptables", "INPUT")
    }
}

/// A scheduled removal of an applied ban.
#[derive(Debug, Clone)]
pub struct BootEntry {
    /// Unique identifier, several bans may target the same ip.
    pub id: Uuid,
    /// Banned source address.
    pub ip: String,
    /// When the sweeper should lift the ban.
    pub expires_at: Instant,
    /// Command that lifts the ban.
    pub cleanup: CommandSpec,
    /// Set once the drop rule is in place. Until then the booting call owns
    /// the cleanup.
    pub applied: bool,
}

/// Counters describing the scheduler's activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BanStats {
    pub outstanding: usize,
    pub total_applied: u64,
    pub total_cleared: u64,
    pub failed_cleanups: u64,
}
