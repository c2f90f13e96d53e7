use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::error_handling::types::CommandError;

/// Decides whether a failed job goes back into the queue.
pub trait RetryPolicy: Send + Sync {
    /// `attempts` counts executions so far, including the one that failed.
    fn should_retry(&self, error: &CommandError, attempts: u32) -> bool;
}

/// Every failure is final.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl RetryPolicy for NeverRetry {
    fn should_retry(&self, _error: &CommandError, _attempts: u32) -> bool {
        false
    }
}

/// Retries transient failures up to `max_attempts` executions.
///
/// A failure is transient when it is [`CommandError::Retryable`] or when the
/// tool's stderr contains one of `markers` (e.g. "resource busy").
#[derive(Debug, Clone, Default)]
pub struct RetryTransient {
    pub max_attempts: u32,
    pub markers: Vec<String>,
}

impl RetryPolicy for RetryTransient {
    fn should_retry(&self, error: &CommandError, attempts: u32) -> bool {
        if attempts >= self.max_attempts {
            return false;
        }
        match error {
            CommandError::Retryable(_) => true,
            CommandError::NonZeroExit { stderr, .. } => {
                self.markers.iter().any(|m| stderr.contains(m.as_str()))
            }
            _ => false,
        }
    }
}

struct ExecJob {
    command: CommandSpec,
    attempts: u32,
    responder: oneshot::Sender<Result<CommandOutput, CommandError>>,
}

/// FIFO queue in front of an external tool that does not tolerate
/// concurrent invocations.
///
/// A single worker task owns the receiving end, so at most one command runs
/// at any time and jobs execute in submission order. After each execution the
/// worker pauses for `delay` before picking the next job. A failure is handed
/// to the job's caller only; the queue moves on.
///
/// Handles are cheap to clone. The worker exits once every handle has been
/// dropped and the backlog is empty.
#[derive(Clone)]
pub struct CommandQueue {
    jobs: mpsc::UnboundedSender<ExecJob>,
}

impl CommandQueue {
    pub fn start(
        runner: Arc<dyn CommandRunner>,
        policy: Arc<dyn RetryPolicy>,
        delay: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::drain(rx, runner, policy, delay));
        info!("Command queue started (delay between jobs: {:?})", delay);
        (Self { jobs: tx }, worker)
    }

    /// Queues `command` and waits for its execution.
    pub async fn enqueue(&self, command: CommandSpec) -> Result<CommandOutput, CommandError> {
        let (responder, response) = oneshot::channel();
        debug!("Queueing `{}`", command);
        self.jobs
            .send(ExecJob {
                command,
                attempts: 0,
                responder,
            })
            .map_err(|_| CommandError::QueueClosed)?;

        response.await.map_err(|_| CommandError::QueueClosed)?
    }

    async fn drain(
        mut rx: mpsc::UnboundedReceiver<ExecJob>,
        runner: Arc<dyn CommandRunner>,
        policy: Arc<dyn RetryPolicy>,
        delay: Duration,
    ) {
        let mut backlog: VecDeque<ExecJob> = VecDeque::new();

        loop {
            if backlog.is_empty() {
                match rx.recv().await {
                    Some(job) => backlog.push_back(job),
                    None => break,
                }
            }
            while let Ok(job) = rx.try_recv() {
                backlog.push_back(job);
            }

            let Some(mut job) = backlog.pop_front() else {
                continue;
            };

            job.attempts += 1;
            debug!("Executing `{}` (attempt {})", job.command, job.attempts);
            let result = runner.run(&job.command).await;

            match result {
                Err(e) if policy.should_retry(&e, job.attempts) => {
                    warn!("`{}` failed transiently, requeueing: {}", job.command, e);
                    while let Ok(next) = rx.try_recv() {
                        backlog.push_back(next);
                    }
                    backlog.push_back(job);
                }
                result => {
                    if let Err(e) = &result {
                        error!("`{}` failed: {}", job.command, e);
                    }
                    if job.responder.send(result).is_err() {
                        debug!("Caller of `{}` is no longer waiting", job.command);
                    }
                }
            }

            tokio::time::sleep(delay).await;
        }

        info!("Command queue drained and closed");
    }
}
