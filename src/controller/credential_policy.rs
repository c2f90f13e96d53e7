use log::{debug, error, info, trace, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

use crate::command_queue::TurnAdmin;
use crate::configuration::types::PolicyConfig;
use crate::error_handling::types::{CommandError, FirewallError};
use crate::firewall::BanScheduler;
use crate::session_management::{ClientEvent, Connection, ConnectionKey, UsageSnapshot};

/// Reacts to client events on behalf of the relay operator.
///
/// Relay credentials are handed out for a single session: once a user's
/// first allocation succeeds the user is deleted from the relay, so the
/// credentials cannot be reused.
///
/// Connections can also be booted, which drops their traffic at the
/// firewall for the configured ban duration. The pipeline boots a connection
/// on its own when `boot_after_bytes` is set and a usage report crosses it;
/// any other reason to boot (billing, operator action) belongs to the
/// library caller through [`CredentialPolicy::boot`].
pub struct CredentialPolicy {
    admin: TurnAdmin,
    bans: Arc<BanScheduler>,
    revoke_on_connect: bool,
    emit_json: bool,
    boot_after_bytes: u64,
    /// Connections already booted for exceeding `boot_after_bytes`.
    booted: Mutex<HashSet<ConnectionKey>>,
}

impl CredentialPolicy {
    pub fn new(admin: TurnAdmin, bans: Arc<BanScheduler>, config: &PolicyConfig) -> Self {
        Self {
            admin,
            bans,
            revoke_on_connect: config.revoke_on_connect,
            emit_json: config.emit_json,
            boot_after_bytes: config.boot_after_bytes,
            booted: Mutex::new(HashSet::new()),
        }
    }

    pub async fn handle(&self, event: &ClientEvent) -> Result<(), CommandError> {
        if self.emit_json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Unable to serialize {} event: {}", event.name(), e),
            }
        }

        match event {
            ClientEvent::Connect { connection } => {
                info!(
                    "{} connected from {} (realm {})",
                    connection.user, connection.ip, connection.realm
                );
                if self.revoke_on_connect {
                    self.admin
                        .delete_user(&connection.user, &connection.realm)
                        .await?;
                }
            }
            ClientEvent::Usage { connection, usage } => {
                trace!(
                    "{} usage: rp={} rb={} sp={} sb={}",
                    connection.key(),
                    usage.rp,
                    usage.rb,
                    usage.sp,
                    usage.sb
                );
                self.enforce_quota(connection, usage).await;
            }
            ClientEvent::Disconnect { connection, reason } => {
                info!("{} disconnected: {}", connection.key(), reason);
                self.lock_booted().remove(&connection.key());
            }
        }
        Ok(())
    }

    /// Drops the connection's traffic until its ban expires.
    pub async fn boot(&self, connection: &Connection) -> Result<Uuid, FirewallError> {
        self.bans.boot_connection(connection).await
    }

    async fn enforce_quota(&self, connection: &Connection, usage: &UsageSnapshot) {
        if self.boot_after_bytes == 0 {
            return;
        }
        let relayed = usage.rb.saturating_add(usage.sb);
        if relayed < self.boot_after_bytes {
            return;
        }
        let key = connection.key();
        if !self.lock_booted().insert(key.clone()) {
            return;
        }

        warn!(
            "{} relayed {} bytes (limit {}), booting {}",
            key, relayed, self.boot_after_bytes, connection.ip
        );
        if let Err(e) = self.boot(connection).await {
            error!("Booting {} failed: {}", key, e);
            // a later usage report tries again
            self.lock_booted().remove(&key);
        }
    }

    fn lock_booted(&self) -> MutexGuard<'_, HashSet<ConnectionKey>> {
        self.booted.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handles events until the sender side closes. Failures are logged and
    /// the loop moves on to the next event.
    pub async fn run(&self, mut events: Receiver<ClientEvent>) {
        info!("Credential policy started");
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(&event).await {
                error!(
                    "Handling {} for {} failed: {}",
                    event.name(),
                    event.connection().key(),
                    e
                );
            }
        }
        debug!("Credential policy stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_queue::runner::testing::RecordingRunner;
    use crate::command_queue::{CommandQueue, NeverRetry};
    use crate::firewall::DropRule;
    use crate::log_parsing::UsageCounters;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    fn policy_with(runner: Arc<RecordingRunner>, revoke_on_connect: bool) -> CredentialPolicy {
        policy_with_config(
            runner,
            PolicyConfig {
                revoke_on_connect,
                ..PolicyConfig::default()
            },
        )
    }

    fn policy_with_config(runner: Arc<RecordingRunner>, config: PolicyConfig) -> CredentialPolicy {
        let (queue, _worker) = CommandQueue::start(runner.clone(), Arc::new(NeverRetry), Duration::ZERO);
        let admin = TurnAdmin::new(queue, "turnadmin");
        let bans = Arc::new(BanScheduler::new(
            runner,
            DropRule::default(),
            Duration::from_secs(120),
        ));
        CredentialPolicy::new(admin, bans, &config)
    }

    fn usage_event(rb: u64, sb: u64) -> ClientEvent {
        ClientEvent::Usage {
            connection: alice(),
            usage: UsageSnapshot::new(
                UsageCounters {
                    rp: 1,
                    rb,
                    sp: 1,
                    sb,
                },
                Utc::now(),
            ),
        }
    }

    fn alice() -> Connection {
        Connection::new("alice", "testrealm", "203.0.113.5", Utc::now())
    }

    #[tokio::test]
    async fn test_connect_revokes_user() {
        let runner = Arc::new(RecordingRunner::new());
        let policy = policy_with(runner.clone(), true);

        assert_ok!(policy.handle(&ClientEvent::Connect { connection: alice() }).await);

        assert_eq!(
            runner.executed(),
            vec!["turnadmin -d -u alice -r testrealm".to_string()]
        );
    }

    #[tokio::test]
    async fn test_connect_without_revocation_runs_nothing() {
        let runner = Arc::new(RecordingRunner::new());
        let policy = policy_with(runner.clone(), false);

        assert_ok!(policy.handle(&ClientEvent::Connect { connection: alice() }).await);

        assert!(runner.executed().is_empty());
    }

    #[tokio::test]
    async fn test_usage_and_disconnect_run_nothing() {
        let runner = Arc::new(RecordingRunner::new());
        let policy = policy_with(runner.clone(), true);
        let usage = UsageSnapshot::new(
            UsageCounters {
                rp: 1,
                rb: 2,
                sp: 3,
                sb: 4,
            },
            Utc::now(),
        );

        policy
            .handle(&ClientEvent::Usage {
                connection: alice(),
                usage,
            })
            .await
            .unwrap();
        policy
            .handle(&ClientEvent::Disconnect {
                connection: alice(),
                reason: "allocation timeout".into(),
            })
            .await
            .unwrap();

        assert!(runner.executed().is_empty());
    }

    #[tokio::test]
    async fn test_boot_applies_drop_rule() {
        let runner = Arc::new(RecordingRunner::new());
        let policy = policy_with(runner.clone(), true);

        assert_ok!(policy.boot(&alice()).await);

        assert_eq!(
            runner.executed(),
            vec!["iptables -A INPUT -p udp -s 203.0.113.5 -j DROP".to_string()]
        );
        assert_eq!(policy.bans.outstanding(), 1);
        policy.bans.clear_all().await;
    }

    #[tokio::test]
    async fn test_usage_over_threshold_boots_once() {
        let runner = Arc::new(RecordingRunner::new());
        let policy = policy_with_config(
            runner.clone(),
            PolicyConfig {
                boot_after_bytes: 1000,
                ..PolicyConfig::default()
            },
        );

        assert_ok!(policy.handle(&usage_event(400, 500)).await);
        assert!(runner.executed().is_empty());

        assert_ok!(policy.handle(&usage_event(600, 500)).await);
        assert_ok!(policy.handle(&usage_event(900, 900)).await);

        assert_eq!(
            runner.executed(),
            vec!["iptables -A INPUT -p udp -s 203.0.113.5 -j DROP".to_string()]
        );
        assert_eq!(policy.bans.outstanding(), 1);
        policy.bans.clear_all().await;
    }

    #[tokio::test]
    async fn test_threshold_disabled_never_boots() {
        let runner = Arc::new(RecordingRunner::new());
        let policy = policy_with(runner.clone(), true);

        assert_ok!(policy.handle(&usage_event(u64::MAX, u64::MAX)).await);

        assert!(runner.executed().is_empty());
    }

    #[tokio::test]
    async fn test_failed_boot_is_retried_on_next_report() {
        let runner = Arc::new(RecordingRunner::with_responder(|_| {
            Err(CommandError::NonZeroExit {
                status: Some(4),
                stderr: "Permission denied".into(),
            })
        }));
        let policy = policy_with_config(
            runner.clone(),
            PolicyConfig {
                boot_after_bytes: 10,
                ..PolicyConfig::default()
            },
        );

        assert_ok!(policy.handle(&usage_event(10, 10)).await);
        assert_ok!(policy.handle(&usage_event(20, 20)).await);

        assert_eq!(runner.executed().len(), 2);
        assert_eq!(policy.bans.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_run_survives_failed_revocation() {
        let runner = Arc::new(RecordingRunner::with_responder(|c| {
            if c.args.contains(&"mallory".to_string()) {
                Err(CommandError::NonZeroExit {
                    status: Some(1),
                    stderr: "no such user".into(),
                })
            } else {
                Ok(Default::default())
            }
        }));
        let policy = policy_with(runner.clone(), true);
        let (tx, rx) = mpsc::channel(4);

        let mallory = Connection::new("mallory", "testrealm", "198.51.100.7", Utc::now());
        tx.send(ClientEvent::Connect { connection: mallory }).await.unwrap();
        tx.send(ClientEvent::Connect { connection: alice() }).await.unwrap();
        drop(tx);
        policy.run(rx).await;

        assert_eq!(
            runner.executed(),
            vec![
                "turnadmin -d -u mallory -r testrealm".to_string(),
                "turnadmin -d -u alice -r testrealm".to_string(),
            ]
        );
    }
}
