//! Typed events recognised in the relay log.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error_handling::types::CorrelationError;

/// Traffic counters reported by a relay `usage:` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    /// Received packets.
    pub rp: u64,
    /// Received bytes.
    pub rb: u64,
    /// Sent packets.
    pub sp: u64,
    /// Sent bytes.
    pub sb: u64,
}

/// One recognised log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum LogEvent {
    /// A client reached the relay and was challenged (401) within `realm`.
    Client { realm: String, ip: String },
    /// An allocation succeeded for `user` in `realm`.
    Allocate { realm: String, user: String },
    /// Periodic traffic report for an allocation.
    Usage {
        realm: String,
        user: String,
        counters: UsageCounters,
    },
    /// The relay closed a session.
    Disconnect {
        user: String,
        realm: String,
        origin: String,
        ip: String,
        reason: String,
    },
}

impl LogEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LogEvent::Client { .. } => EventKind::Client,
            LogEvent::Allocate { .. } => EventKind::Allocate,
            LogEvent::Usage { .. } => EventKind::Usage,
            LogEvent::Disconnect { .. } => EventKind::Disconnect,
        }
    }
}

/// Discriminant of [`LogEvent`], usable where kinds arrive as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Client,
    Allocate,
    Usage,
    Disconnect,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Client,
        EventKind::Allocate,
        EventKind::Usage,
        EventKind::Disconnect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Client => "client",
            EventKind::Allocate => "allocate",
            EventKind::Usage => "usage",
            EventKind::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = CorrelationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CorrelationError::UnknownEvent(s.to_string()))
    }
}

/// A recognised event together with the text it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub raw: String,
    #[serde(flatten)]
    pub event: LogEvent,
}
