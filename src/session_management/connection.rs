use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::log_parsing::UsageCounters;

/// Identity of a relay session: one user within one realm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub user: String,
    pub realm: String,
}

impl ConnectionKey {
    pub fn new(user: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            realm: realm.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user, self.realm)
    }
}

/// Last traffic report seen for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub rp: u64,
    pub rb: u64,
    pub sp: u64,
    pub sb: u64,
    pub time: DateTime<Utc>,
}

impl UsageSnapshot {
    pub fn new(counters: UsageCounters, time: DateTime<Utc>) -> Self {
        Self {
            rp: counters.rp,
            rb: counters.rb,
            sp: counters.sp,
            sb: counters.sb,
            time,
        }
    }
}

/// Where a connection currently sits in the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Live,
    Dead,
}

/// One relay session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub user: String,
    pub realm: String,
    pub ip: String,
    pub connected_at: DateTime<Utc>,
    pub last_usage: Option<UsageSnapshot>,
    /// Set while the connection sits in the dead set.
    pub closed_at: Option<DateTime<Utc>>,
}

impl Connection {
    pub fn new(
        user: impl Into<String>,
        realm: impl Into<String>,
        ip: impl Into<String>,
        connected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user: user.into(),
            realm: realm.into(),
            ip: ip.into(),
            connected_at,
            last_usage: None,
            closed_at: None,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.user.clone(), self.realm.clone())
    }

    pub fn state(&self) -> ConnectionState {
        if self.closed_at.is_some() {
            ConnectionState::Dead
        } else {
            ConnectionState::Live
        }
    }
}

/// Domain event emitted by the correlator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ClientEvent {
    Connect {
        connection: Connection,
    },
    Usage {
        connection: Connection,
        usage: UsageSnapshot,
    },
    Disconnect {
        connection: Connection,
        reason: String,
    },
}

impl ClientEvent {
    pub fn connection(&self) -> &Connection {
        match self {
            ClientEvent::Connect { connection }
            | ClientEvent::Usage { connection, .. }
            | ClientEvent::Disconnect { connection, .. } => connection,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Connect { .. } => "connect",
            ClientEvent::Usage { .. } => "usage",
            ClientEvent::Disconnect { .. } => "disconnect",
        }
    }
}
