//! External process execution.

use async_trait::async_trait;
use log::{debug, warn};
use std::fmt;
use std::process::{Output, Stdio};

use crate::error_handling::types::CommandError;

/// A program invocation, without any shell in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Positions in `args` that are masked when the command is displayed.
    secret_args: Vec<usize>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            secret_args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an argument that must not show up in logs.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secret_args.push(self.args.len());
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for (i, arg) in self.args.iter().enumerate() {
            if self.secret_args.contains(&i) {
                f.write_str(" ***")?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured output of a successful command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external commands.
///
/// `run` is used by the queue and the ban sweeper; `run_blocking` exists for
/// the shutdown path, where an async runtime may no longer be driving tasks.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, CommandError>;

    fn run_blocking(&self, command: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// [`CommandRunner`] backed by real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    fn into_result(command: &CommandSpec, output: Output) -> Result<CommandOutput, CommandError> {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            debug!("`{}` succeeded", command);
            Ok(CommandOutput { stdout, stderr })
        } else {
            warn!("`{}` failed with {}", command, output.status);
            Err(CommandError::NonZeroExit {
                status: output.status.code(),
                stderr,
            })
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!("Running `{}`", command);
        let output = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CommandError::SpawnFailed(format!("{}: {}", command.program, e)))?;

        Self::into_result(command, output)
    }

    fn run_blocking(&self, command: &CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!("Running `{}` (blocking)", command);
        let output = std::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| CommandError::SpawnFailed(format!("{}: {}", command.program, e)))?;

        Self::into_result(command, output)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type Responder = dyn Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync;

    /// What the recording runner saw, in order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Started(String),
        Finished(String),
        Blocking(String),
    }

    /// Runner that records invocations instead of spawning processes.
    pub struct RecordingRunner {
        calls: Mutex<Vec<Call>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        latency: Duration,
        responder: Box<Responder>,
    }

    impl RecordingRunner {
        pub fn new() -> Self {
            Self::with_responder(|_| Ok(CommandOutput::default()))
        }

        pub fn with_responder<F>(responder: F) -> Self
        where
            F: Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync + 'static,
        {
            Self {
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                latency: Duration::ZERO,
                responder: Box::new(responder),
            }
        }

        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        /// Command lines that ran to completion, async or blocking.
        pub fn executed(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Finished(c) | Call::Blocking(c) => Some(c),
                    Call::Started(_) => None,
                })
                .collect()
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        fn line(command: &CommandSpec) -> String {
            std::iter::once(command.program.as_str())
                .chain(command.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ")
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, CommandError> {
            let line = Self::line(command);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push(Call::Started(line.clone()));

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            self.calls.lock().unwrap().push(Call::Finished(line));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            (self.responder)(command)
        }

        fn run_blocking(&self, command: &CommandSpec) -> Result<CommandOutput, CommandError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Blocking(Self::line(command)));
            (self.responder)(command)
        }
    }
}
