use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use super::types::{BanStats, BootEntry, DropRule};
use crate::command_queue::CommandRunner;
use crate::error_handling::types::FirewallError;
use crate::session_management::Connection;

/// Applies temporary firewall bans and guarantees they are lifted.
///
/// A ban inserts a UDP drop rule for the connection's ip and records a
/// [`BootEntry`] that expires after `ban_duration`. A periodic sweep lifts
/// expired bans; [`BanScheduler::clear_all`] lifts everything at shutdown and
/// `Drop` lifts whatever is still left, blocking.
///
/// An entry always leaves the map before its cleanup command runs, so the
/// sweep and the shutdown path never lift the same ban twice.
pub struct BanScheduler {
    runner: Arc<dyn CommandRunner>,
    rule: DropRule,
    ban_duration: Duration,
    entries: Mutex<HashMap<Uuid, BootEntry>>,
    stats: Mutex<BanStats>,
}

impl BanScheduler {
    pub fn new(runner: Arc<dyn CommandRunner>, rule: DropRule, ban_duration: Duration) -> Self {
        info!(
            "Ban scheduler initialized ({} {}, bans last {:?})",
            rule.iptables, rule.chain, ban_duration
        );
        Self {
            runner,
            rule,
            ban_duration,
            entries: Mutex::new(HashMap::new()),
            stats: Mutex::new(BanStats::default()),
        }
    }

    /// Bans the connection's source address.
    pub async fn boot_connection(&self, connection: &Connection) -> Result<Uuid, FirewallError> {
        info!(
            "Booting connection {}:{} from {}",
            connection.user, connection.realm, connection.ip
        );
        self.boot_ip(&connection.ip).await
    }

    /// Bans `ip` for `ban_duration`.
    ///
    /// The entry is recorded before the rule is applied so that a shutdown
    /// racing with this call still lifts the ban. An entry that is still
    /// being applied is never lifted by the sweep or by
    /// [`BanScheduler::clear_all`]; when `clear_all` takes it in the meantime
    /// this call runs the removal itself once the insert has finished.
    pub async fn boot_ip(&self, ip: &str) -> Result<Uuid, FirewallError> {
        let entry = BootEntry {
            id: Uuid::new_v4(),
            ip: ip.to_string(),
            expires_at: Instant::now() + self.ban_duration,
            cleanup: self.rule.remove(ip),
            applied: false,
        };
        let id = entry.id;
        let cleanup = entry.clone();
        self.lock_entries().insert(id, entry);

        if let Err(e) = self.runner.run(&self.rule.insert(ip)).await {
            error!("Failed to ban {}: {}", ip, e);
            self.lock_entries().remove(&id);
            return Err(FirewallError::RuleInsertFailed(e));
        }

        self.lock_stats().total_applied += 1;
        let cleared_meanwhile = match self.lock_entries().get_mut(&id) {
            Some(entry) => {
                entry.applied = true;
                false
            }
            None => true,
        };

        if cleared_meanwhile {
            warn!("Bans on {} were cleared while it was being applied", ip);
            self.lift(BootEntry {
                applied: true,
                ..cleanup
            })
            .await;
        } else {
            info!("Banned {} for {:?} (entry {})", ip, self.ban_duration, id);
        }
        Ok(id)
    }

    /// Lifts every ban that expired by now.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    pub async fn sweep_at(&self, now: Instant) -> usize {
        let expired: Vec<BootEntry> = {
            let mut entries = self.lock_entries();
            let ids: Vec<Uuid> = entries
                .values()
                .filter(|entry| entry.applied && entry.expires_at <= now)
                .map(|entry| entry.id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id))
                .collect()
        };

        let count = expired.len();
        for entry in expired {
            self.lift(entry).await;
        }
        if count > 0 {
            debug!("Sweep lifted {} ban(s)", count);
        }
        count
    }

    /// Sweeps every `interval` until `shutdown` flips to true.
    pub async fn run_sweeper(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Ban sweeper started (every {:?})", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Ban sweeper stopped");
    }

    /// Lifts every outstanding ban, waiting for each command to finish.
    ///
    /// Bans whose rule is still being inserted are handed back to their
    /// [`BanScheduler::boot_ip`] call, which lifts them once the insert
    /// returns. They are included in the returned count.
    pub async fn clear_all(&self) -> usize {
        let (applied, in_flight) = self.take_all();
        let count = applied.len() + in_flight;
        if count > 0 {
            info!("Clearing {} remaining ban(s)", count);
        }
        for entry in applied {
            self.lift(entry).await;
        }
        count
    }

    /// Blocking variant of [`BanScheduler::clear_all`] for contexts without a runtime.
    pub fn clear_all_blocking(&self) -> usize {
        let (applied, in_flight) = self.take_all();
        let count = applied.len() + in_flight;
        for entry in applied {
            match self.runner.run_blocking(&entry.cleanup) {
                Ok(_) => self.lock_stats().total_cleared += 1,
                Err(e) => {
                    error!("Failed to lift ban on {}: {}", entry.ip, e);
                    self.lock_stats().failed_cleanups += 1;
                }
            }
        }
        count
    }

    pub fn outstanding(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn stats(&self) -> BanStats {
        let mut stats = self.lock_stats().clone();
        stats.outstanding = self.outstanding();
        stats
    }

    async fn lift(&self, entry: BootEntry) {
        debug!("Lifting ban {} on {}", entry.id, entry.ip);
        match self.runner.run(&entry.cleanup).await {
            Ok(_) => {
                info!("Lifted ban on {}", entry.ip);
                self.lock_stats().total_cleared += 1;
            }
            Err(e) => {
                error!("{}", FirewallError::RuleRemoveFailed(e));
                warn!("Ban on {} may still be in place", entry.ip);
                self.lock_stats().failed_cleanups += 1;
            }
        }
    }

    /// Empties the map. Returns the applied entries and how many were still
    /// being inserted.
    fn take_all(&self) -> (Vec<BootEntry>, usize) {
        let (applied, in_flight): (Vec<BootEntry>, Vec<BootEntry>) = self
            .lock_entries()
            .drain()
            .map(|(_, entry)| entry)
            .partition(|entry| entry.applied);
        if !in_flight.is_empty() {
            debug!("{} ban(s) still being applied, left to their boot call", in_flight.len());
        }
        (applied, in_flight.len())
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<Uuid, BootEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_stats(&self) -> MutexGuard<'_, BanStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for BanScheduler {
    fn drop(&mut self) {
        let remaining = self.outstanding();
        if remaining > 0 {
            warn!(
                "BanScheduler dropped with {} outstanding ban(s), lifting them now",
                remaining
            );
            self.clear_all_blocking();
        } else {
            debug!("BanScheduler dropped cleanly with no outstanding bans");
        }
    }
}
