use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::exec_queue::CommandQueue;
use super::runner::CommandSpec;
use crate::error_handling::types::CommandError;

/// A user registered with the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayUser {
    pub user: String,
    pub realm: String,
}

/// Outcome of [`TurnAdmin::sync_credentials`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub removed: Vec<RelayUser>,
}

/// Relay user administration through the `turnadmin` tool.
///
/// Every invocation goes through the shared [`CommandQueue`]; nothing else
/// may run the tool directly.
#[derive(Clone)]
pub struct TurnAdmin {
    queue: CommandQueue,
    program: String,
}

impl TurnAdmin {
    pub fn new(queue: CommandQueue, program: impl Into<String>) -> Self {
        Self {
            queue,
            program: program.into(),
        }
    }

    pub async fn add_user(&self, user: &str, password: &str, realm: &str) -> Result<(), CommandError> {
        let command = CommandSpec::new(&self.program)
            .args(["-a", "-u", user, "-p"])
            .secret_arg(password)
            .args(["-r", realm]);

        let output = self.queue.enqueue(command).await?;
        info!("Added relay user {} in realm {}", user, realm);
        debug!("turnadmin stdout: {}", output.stdout.trim());
        if !output.stderr.trim().is_empty() {
            warn!("turnadmin stderr: {}", output.stderr.trim());
        }
        Ok(())
    }

    pub async fn delete_user(&self, user: &str, realm: &str) -> Result<(), CommandError> {
        let command = CommandSpec::new(&self.program).args(["-d", "-u", user, "-r", realm]);

        let output = self.queue.enqueue(command).await?;
        info!("Deleted relay user {} in realm {}", user, realm);
        debug!("turnadmin stdout: {}", output.stdout.trim());
        if !output.stderr.trim().is_empty() {
            warn!("turnadmin stderr: {}", output.stderr.trim());
        }
        Ok(())
    }

    pub async fn list_users(&self) -> Result<Vec<RelayUser>, CommandError> {
        let output = self
            .queue
            .enqueue(CommandSpec::new(&self.program).arg("-l"))
            .await?;
        let users = parse_user_list(&output.stdout);
        debug!("Relay has {} registered user(s)", users.len());
        Ok(users)
    }

    /// Makes the relay's user table match `desired` (user to password) for `realm`.
    ///
    /// Every desired user is (re)added, then any listed user that belongs to
    /// another realm or is not desired is deleted.
    pub async fn sync_credentials(
        &self,
        realm: &str,
        desired: &HashMap<String, String>,
    ) -> Result<SyncReport, CommandError> {
        let mut report = SyncReport::default();

        let mut users: Vec<_> = desired.iter().collect();
        users.sort();
        for (user, password) in users {
            self.add_user(user, password, realm).await?;
            report.added.push(user.clone());
        }

        for relay_user in self.list_users().await? {
            if relay_user.realm != realm || !desired.contains_key(&relay_user.user) {
                self.delete_user(&relay_user.user, &relay_user.realm).await?;
                report.removed.push(relay_user);
            }
        }

        info!(
            "Credentials synced for realm {}: {} added, {} removed",
            realm,
            report.added.len(),
            report.removed.len()
        );
        Ok(report)
    }
}

/// Parses `turnadmin -l` output, one `user[realm` (or `user[realm]`) per line.
pub fn parse_user_list(stdout: &str) -> Vec<RelayUser> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let line = line.strip_suffix(']').unwrap_or(line);
            match line.split_once('[') {
                Some((user, realm)) => Some(RelayUser {
                    user: user.to_string(),
                    realm: realm.to_string(),
                }),
                None => {
                    debug!("Skipping unrecognised user list line: {}", line);
                    None
                }
            }
        })
        .collect()
}
