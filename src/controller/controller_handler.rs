use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::credential_policy::CredentialPolicy;
use crate::command_queue::{
    CommandQueue, CommandRunner, NeverRetry, ProcessRunner, RetryPolicy, RetryTransient, TurnAdmin,
};
use crate::configuration::config::Config;
use crate::error_handling::types::*;
use crate::firewall::{BanScheduler, DropRule};
use crate::log_parsing::LogParser;
use crate::log_tailer::{LogTailer, ProcessLocator};
use crate::session_management::SessionCorrelator;

/// Capacity of the record and event channels between pipeline stages.
const CHANNEL_CAPACITY: usize = 256;

/// stderr fragments of `turnadmin` failures worth another attempt.
const TRANSIENT_MARKERS: [&str; 2] = ["database is locked", "resource busy"];

/// Wires the pipeline together and owns its lifetime.
///
/// ```text
/// LogTailer -> SessionCorrelator -> CredentialPolicy -> CommandQueue (turnadmin)
///                                         \-> BanScheduler (iptables)
/// ```
///
/// Every stage runs as its own task. The controller stops on ctrl-c,
/// SIGTERM, a shutdown trigger or a tailer failure, then lifts every
/// outstanding ban before returning.
pub struct Controller {
    pub config: Config,
    runner: Arc<dyn CommandRunner>,
    shutdown: Arc<watch::Sender<bool>>,
    bans: Option<Arc<BanScheduler>>,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        Self::with_runner(config, Arc::new(ProcessRunner))
    }

    /// Controller that runs its external commands through `runner`.
    pub fn with_runner(config: Config, runner: Arc<dyn CommandRunner>) -> Result<Self, ControllerError> {
        config.validate().map_err(|e| {
            error!("Invalid configuration: {}", e);
            ControllerError::ConfigurationError(e)
        })?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            runner,
            shutdown: Arc::new(shutdown),
            bans: None,
        })
    }

    /// Sender that stops [`Controller::run`] when `true` is sent.
    pub fn shutdown_trigger(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown.clone()
    }

    pub async fn run(&mut self) -> Result<(), ControllerError> {
        info!("Starting controller");

        let log_path = self.resolve_log_path().await?;
        let parser = LogParser::new()
            .map_err(|e| ControllerError::InitializationFailed(format!("log patterns: {}", e)))?;
        let tailer = LogTailer::open(log_path, parser)?;

        let (queue, queue_worker) = CommandQueue::start(
            self.runner.clone(),
            self.retry_policy(),
            self.config.job_delay(),
        );
        let admin = TurnAdmin::new(queue, self.config.admin.turnadmin_path.clone());

        let bans = Arc::new(BanScheduler::new(
            self.runner.clone(),
            DropRule::new(
                self.config.firewall.iptables_path.clone(),
                self.config.firewall.chain.clone(),
            ),
            self.config.ban_duration(),
        ));
        self.bans = Some(bans.clone());

        let (records_tx, records_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut shutdown_rx = self.shutdown.subscribe();

        let sweeper = {
            let bans = bans.clone();
            let interval = self.config.sweep_interval();
            let shutdown_rx = self.shutdown.subscribe();
            tokio::spawn(async move { bans.run_sweeper(interval, shutdown_rx).await })
        };

        let mut tailer_task = tokio::spawn(tailer.run(
            records_tx,
            self.config.poll_interval(),
            self.shutdown.subscribe(),
        ));

        let correlator_task = {
            let ttl = self.config.dead_connection_ttl();
            tokio::spawn(async move {
                let mut correlator = SessionCorrelator::new(ttl);
                correlator.run(records_rx, events_tx).await
            })
        };

        let policy = CredentialPolicy::new(admin, bans, &self.config.policy);
        let policy_task = tokio::spawn(async move { policy.run(events_rx).await });

        info!("Controller running");
        let mut tailer_result = None;
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => info!("Interrupt received"),
                Err(e) => error!("Unable to listen for ctrl-c: {}", e),
            },
            _ = terminate_signal() => info!("Termination signal received"),
            _ = shutdown_rx.wait_for(|stop| *stop) => info!("Shutdown requested"),
            res = &mut tailer_task => tailer_result = Some(res),
        }

        // stops the tailer and the sweeper, the rest of the pipeline drains behind them
        self.shutdown.send_replace(true);
        let tailer_result = match tailer_result {
            Some(res) => res,
            None => tailer_task.await,
        };

        match Self::join("session correlator", correlator_task).await {
            Ok(Err(e)) => warn!("Session correlator stopped early: {}", e),
            Err(e) => warn!("{}", e),
            Ok(Ok(())) => {}
        }
        if let Err(e) = Self::join("credential policy", policy_task).await {
            warn!("{}", e);
        }
        if let Err(e) = Self::join("command queue", queue_worker).await {
            warn!("{}", e);
        }
        if let Err(e) = Self::join("ban sweeper", sweeper).await {
            warn!("{}", e);
        }

        self.shutdown().await;

        match tailer_result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Log tailer failed: {}", e);
                Err(ControllerError::TailError(e))
            }
            Err(e) => Err(ControllerError::TaskFailed(format!("log tailer: {}", e))),
        }
    }

    /// Stops every task and lifts the outstanding bans. Returns how many bans
    /// were lifted.
    pub async fn shutdown(&mut self) -> usize {
        info!("Shutting down controller");
        self.shutdown.send_replace(true);

        match self.bans.take() {
            Some(bans) => {
                let lifted = bans.clear_all().await;
                info!("Controller stopped, {} ban(s) lifted", lifted);
                lifted
            }
            None => 0,
        }
    }

    async fn resolve_log_path(&self) -> Result<PathBuf, ControllerError> {
        if let Some(path) = &self.config.tailer.log_file {
            debug!("Using configured log file {}", path.display());
            return Ok(path.clone());
        }
        let locator = ProcessLocator::from_config(&self.config.tailer);
        Ok(locator.locate(self.runner.as_ref()).await?)
    }

    fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        if self.config.admin.max_attempts > 1 {
            Arc::new(RetryTransient {
                max_attempts: self.config.admin.max_attempts,
                markers: TRANSIENT_MARKERS.iter().map(|m| m.to_string()).collect(),
            })
        } else {
            Arc::new(NeverRetry)
        }
    }

    async fn join<T>(name: &str, handle: JoinHandle<T>) -> Result<T, ControllerError> {
        handle
            .await
            .map_err(|e| ControllerError::TaskFailed(format!("{}: {}", name, e)))
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Unable to listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
