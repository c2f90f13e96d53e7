use chrono::{DateTime, Utc};
use log::{debug, info, trace};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};

use super::connection::{ClientEvent, Connection, ConnectionKey, UsageSnapshot};
use crate::error_handling::types::CorrelationError;
use crate::log_parsing::{LogEvent, LogRecord, UsageCounters};

/// Folds relay log events into connection state.
///
/// The relay writes the lines belonging to one session independently of each
/// other, so the correlator has to stitch them together:
///
/// - a `client` line (the 401 challenge) remembers the ip for a realm,
/// - the following `allocate` line for that realm creates a [`Connection`],
/// - `usage` lines update its last traffic snapshot,
/// - a `disconnect` line moves it to the dead set.
///
/// A usage line can still show up after the disconnect; the dead connection
/// is then moved back to the live set instead of being duplicated. Dead
/// connections are forgotten once they have been closed for longer than
/// `dead_ttl`.
///
/// # Fields Overview
///
/// - `pending_clients`: realm to ip of clients awaiting their allocation
/// - `live`: open connections
/// - `dead`: recently closed connections, still revivable
/// - `dead_ttl`: retention of the dead set
pub struct SessionCorrelator {
    pending_clients: HashMap<String, String>,
    live: HashMap<ConnectionKey, Connection>,
    dead: HashMap<ConnectionKey, Connection>,
    dead_ttl: chrono::Duration,
}

impl SessionCorrelator {
    pub fn new(dead_ttl: Duration) -> Self {
        Self {
            pending_clients: HashMap::new(),
            live: HashMap::new(),
            dead: HashMap::new(),
            dead_ttl: chrono::Duration::from_std(dead_ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn consume(&mut self, event: LogEvent) -> Option<ClientEvent> {
        self.consume_at(event, Utc::now())
    }

    /// Applies `event` as if it was observed at `now`.
    pub fn consume_at(&mut self, event: LogEvent, now: DateTime<Utc>) -> Option<ClientEvent> {
        self.evict_dead(now);

        match event {
            LogEvent::Client { realm, ip } => {
                self.on_client(realm, ip);
                None
            }
            LogEvent::Allocate { realm, user } => self.on_allocate(realm, user, now),
            LogEvent::Usage {
                realm,
                user,
                counters,
            } => self.on_usage(ConnectionKey::new(user, realm), counters, now),
            LogEvent::Disconnect {
                user,
                realm,
                reason,
                ..
            } => self.on_disconnect(ConnectionKey::new(user, realm), reason, now),
        }
    }

    /// Consumes records until the sender side closes.
    pub async fn run(
        &mut self,
        mut records: Receiver<LogRecord>,
        events: Sender<ClientEvent>,
    ) -> Result<(), CorrelationError> {
        info!("Session correlator started");
        while let Some(record) = records.recv().await {
            trace!("Consuming {} record: {}", record.event.kind(), record.raw);
            if let Some(event) = self.consume(record.event) {
                events
                    .send(event)
                    .await
                    .map_err(|_| CorrelationError::ChannelClosed)?;
            }
        }
        info!(
            "Session correlator stopped (live={}, dead={})",
            self.live.len(),
            self.dead.len()
        );
        Ok(())
    }

    pub fn connection(&self, key: &ConnectionKey) -> Option<&Connection> {
        self.live.get(key).or_else(|| self.dead.get(key))
    }

    pub fn live_connections(&self) -> impl Iterator<Item = &Connection> {
        self.live.values()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn dead_count(&self) -> usize {
        self.dead.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_clients.len()
    }

    fn on_client(&mut self, realm: String, ip: String) {
        if let Some(previous) = self.pending_clients.insert(realm.clone(), ip.clone()) {
            debug!(
                "Pending client for realm {} replaced ({} -> {})",
                realm, previous, ip
            );
        } else {
            debug!("Pending client {} for realm {}", ip, realm);
        }
    }

    fn on_allocate(
        &mut self,
        realm: String,
        user: String,
        now: DateTime<Utc>,
    ) -> Option<ClientEvent> {
        let Some(ip) = self.pending_clients.remove(&realm) else {
            debug!(
                "Ignoring allocation for {}:{} without a pending client",
                user, realm
            );
            return None;
        };

        let connection = Connection::new(user, realm, ip, now);
        let key = connection.key();
        info!("Connection {} established from {}", key, connection.ip);

        self.dead.remove(&key);
        self.live.insert(key, connection.clone());
        Some(ClientEvent::Connect { connection })
    }

    fn on_usage(
        &mut self,
        key: ConnectionKey,
        counters: UsageCounters,
        now: DateTime<Utc>,
    ) -> Option<ClientEvent> {
        if !self.live.contains_key(&key) {
            let Some(mut connection) = self.dead.remove(&key) else {
                debug!("Ignoring usage for unknown connection {}", key);
                return None;
            };
            info!("Reviving dead connection {}", key);
            connection.closed_at = None;
            self.live.insert(key.clone(), connection);
        }

        let connection = self.live.get_mut(&key)?;
        let usage = UsageSnapshot::new(counters, now);
        connection.last_usage = Some(usage);
        trace!(
            "Usage for {}: rp={} rb={} sp={} sb={}",
            key,
            usage.rp,
            usage.rb,
            usage.sp,
            usage.sb
        );

        Some(ClientEvent::Usage {
            connection: connection.clone(),
            usage,
        })
    }

    fn on_disconnect(
        &mut self,
        key: ConnectionKey,
        reason: String,
        now: DateTime<Utc>,
    ) -> Option<ClientEvent> {
        let Some(mut connection) = self.live.remove(&key) else {
            debug!("Ignoring disconnect for unknown connection {}", key);
            return None;
        };

        info!("Connection {} closed: {}", key, reason);
        connection.closed_at = Some(now);
        self.dead.insert(key, connection.clone());
        Some(ClientEvent::Disconnect { connection, reason })
    }

    fn evict_dead(&mut self, now: DateTime<Utc>) {
        let ttl = self.dead_ttl;
        let before = self.dead.len();
        self.dead.retain(|_, connection| match connection.closed_at {
            Some(closed_at) => now.signed_duration_since(closed_at) < ttl,
            None => true,
        });

        let evicted = before - self.dead.len();
        if evicted > 0 {
            debug!("Evicted {} dead connection(s)", evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_parsing::LogParser;
    use crate::session_management::ConnectionState;
    use tokio::sync::mpsc;

    fn correlator() -> SessionCorrelator {
        SessionCorrelator::new(Duration::from_secs(600))
    }

    fn client(realm: &str, ip: &str) -> LogEvent {
        LogEvent::Client {
            realm: realm.to_string(),
            ip: ip.to_string(),
        }
    }

    fn allocate(realm: &str, user: &str) -> LogEvent {
        LogEvent::Allocate {
            realm: realm.to_string(),
            user: user.to_string(),
        }
    }

    fn usage(realm: &str, user: &str, sb: u64) -> LogEvent {
        LogEvent::Usage {
            realm: realm.to_string(),
            user: user.to_string(),
            counters: UsageCounters {
                rp: 1,
                rb: 2,
                sp: 3,
                sb,
            },
        }
    }

    fn disconnect(realm: &str, user: &str) -> LogEvent {
        LogEvent::Disconnect {
            user: user.to_string(),
            realm: realm.to_string(),
            origin: String::new(),
            ip: "203.0.113.5".to_string(),
            reason: "allocation timeout".to_string(),
        }
    }

    #[test]
    fn test_client_then_allocate_emits_one_connect() {
        let mut c = correlator();

        assert_eq!(c.consume(client("testrealm", "203.0.113.5")), None);
        let event = c.consume(allocate("testrealm", "alice")).unwrap();

        match event {
            ClientEvent::Connect { connection } => {
                assert_eq!(connection.user, "alice");
                assert_eq!(connection.realm, "testrealm");
                assert_eq!(connection.ip, "203.0.113.5");
                assert_eq!(connection.last_usage, None);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(c.pending_count(), 0);
        assert_eq!(c.live_count(), 1);

        // the pending entry was consumed
        assert_eq!(c.consume(allocate("testrealm", "alice")), None);
        assert_eq!(c.live_count(), 1);
    }

    #[test]
    fn test_later_client_for_same_realm_wins() {
        let mut c = correlator();
        c.consume(client("testrealm", "198.51.100.1"));
        c.consume(client("testrealm", "198.51.100.2"));

        let event = c.consume(allocate("testrealm", "bob")).unwrap();
        assert_eq!(event.connection().ip, "198.51.100.2");
    }

    #[test]
    fn test_allocate_without_pending_client_is_ignored() {
        let mut c = correlator();
        c.consume(client("otherrealm", "198.51.100.1"));

        assert_eq!(c.consume(allocate("testrealm", "alice")), None);
        assert_eq!(c.live_count(), 0);
        assert_eq!(c.pending_count(), 1);
    }

    #[test]
    fn test_usage_without_connect_is_dropped() {
        let mut c = correlator();

        assert_eq!(c.consume(usage("testrealm", "alice", 10)), None);
        assert_eq!(c.live_count(), 0);
        assert_eq!(c.dead_count(), 0);
    }

    #[test]
    fn test_usage_updates_live_connection() {
        let mut c = correlator();
        c.consume(client("testrealm", "203.0.113.5"));
        c.consume(allocate("testrealm", "alice"));

        let event = c.consume(usage("testrealm", "alice", 960)).unwrap();

        match event {
            ClientEvent::Usage { connection, usage } => {
                assert_eq!(usage.sb, 960);
                assert_eq!(connection.last_usage, Some(usage));
            }
            other => panic!("unexpected event {:?}", other),
        }
        let key = ConnectionKey::new("alice", "testrealm");
        assert_eq!(c.connection(&key).unwrap().last_usage.unwrap().sb, 960);
    }

    #[test]
    fn test_disconnect_moves_connection_to_dead_set() {
        let mut c = correlator();
        c.consume(client("testrealm", "203.0.113.5"));
        c.consume(allocate("testrealm", "alice"));

        let event = c.consume(disconnect("testrealm", "alice")).unwrap();

        match event {
            ClientEvent::Disconnect { connection, reason } => {
                assert_eq!(reason, "allocation timeout");
                assert_eq!(connection.state(), ConnectionState::Dead);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(c.live_count(), 0);
        assert_eq!(c.dead_count(), 1);

        // a second disconnect has nothing to close
        assert_eq!(c.consume(disconnect("testrealm", "alice")), None);
    }

    #[test]
    fn test_late_usage_revives_the_same_connection() {
        let mut c = correlator();
        let key = ConnectionKey::new("alice", "testrealm");
        c.consume(client("testrealm", "203.0.113.5"));
        c.consume(allocate("testrealm", "alice"));
        let connected_at = c.connection(&key).unwrap().connected_at;
        c.consume(disconnect("testrealm", "alice"));

        let revived = c.consume(usage("testrealm", "alice", 5)).unwrap();

        assert_eq!(revived.connection().connected_at, connected_at);
        assert_eq!(revived.connection().state(), ConnectionState::Live);
        assert_eq!(c.live_count(), 1);
        assert_eq!(c.dead_count(), 0);

        c.consume(usage("testrealm", "alice", 7));
        let stored = c.connection(&key).unwrap();
        assert_eq!(stored.connected_at, connected_at);
        assert_eq!(stored.last_usage.unwrap().sb, 7);
        assert_eq!(c.live_count(), 1);
    }

    #[test]
    fn test_dead_connections_expire() {
        let mut c = SessionCorrelator::new(Duration::from_secs(60));
        let start = Utc::now();
        c.consume_at(client("testrealm", "203.0.113.5"), start);
        c.consume_at(allocate("testrealm", "alice"), start);
        c.consume_at(disconnect("testrealm", "alice"), start);
        assert_eq!(c.dead_count(), 1);

        let later = start + chrono::Duration::seconds(61);
        assert_eq!(c.consume_at(usage("testrealm", "alice", 1), later), None);
        assert_eq!(c.dead_count(), 0);
        assert_eq!(c.live_count(), 0);
    }

    #[test]
    fn test_parsed_log_snippet_produces_connect() {
        let parser = LogParser::new().unwrap();
        let mut c = correlator();
        let client_record = "New UDP endpoint: local addr 10.0.0.1:3478, remote addr 203.0.113.5:54321\n\
            session 001: realm <testrealm> user <>: incoming packet message processed, error 401: Unauthorized";
        let allocate_record = "session 001: Local relay addr: 10.0.0.1:61000\n\
            session 001: new, realm=<testrealm>, username=<alice>, lifetime=600\n\
            session 001: realm <testrealm> user <alice>: incoming packet ALLOCATE processed, success";

        assert_eq!(c.consume(parser.parse(client_record).unwrap()), None);
        let event = c.consume(parser.parse(allocate_record).unwrap()).unwrap();

        assert_eq!(event.name(), "connect");
        assert_eq!(event.connection().user, "alice");
        assert_eq!(event.connection().realm, "testrealm");
        assert_eq!(event.connection().ip, "203.0.113.5");
    }

    #[tokio::test]
    async fn test_run_forwards_emitted_events_only() {
        let (record_tx, record_rx) = mpsc::channel(8);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let mut c = correlator();

        for event in [
            client("testrealm", "203.0.113.5"),
            allocate("testrealm", "alice"),
            usage("nowhere", "nobody", 1),
            disconnect("testrealm", "alice"),
        ] {
            record_tx
                .send(LogRecord {
                    raw: String::new(),
                    event,
                })
                .await
                .unwrap();
        }
        drop(record_tx);

        c.run(record_rx, event_tx).await.unwrap();

        let names: Vec<_> = std::iter::from_fn(|| event_rx.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(names, vec!["connect", "disconnect"]);
    }

    #[tokio::test]
    async fn test_run_fails_when_consumer_is_gone() {
        let (record_tx, record_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(8);
        drop(event_rx);
        let mut c = correlator();

        record_tx
            .send(LogRecord {
                raw: String::new(),
                event: client("testrealm", "203.0.113.5"),
            })
            .await
            .unwrap();
        record_tx
            .send(LogRecord {
                raw: String::new(),
                event: allocate("testrealm", "alice"),
            })
            .await
            .unwrap();
        drop(record_tx);

        assert_eq!(
            c.run(record_rx, event_tx).await,
            Err(CorrelationError::ChannelClosed)
        );
    }
}
