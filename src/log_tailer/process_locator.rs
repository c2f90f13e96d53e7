use log::{debug, info};
use std::path::{Path, PathBuf};

use crate::command_queue::{CommandRunner, CommandSpec};
use crate::configuration::types::TailerConfig;
use crate::error_handling::types::{CommandError, TailError};

/// Finds the running relay and the log file it is writing.
///
/// coturn names its log `turn_<pid>_<date>.log`, so the file is located by
/// asking `pgrep` for the relay pid and picking the newest matching name in
/// the log directory.
#[derive(Debug, Clone)]
pub struct ProcessLocator {
    process_name: String,
    pid_offset: i64,
    log_dir: PathBuf,
}

impl ProcessLocator {
    pub fn new(process_name: impl Into<String>, pid_offset: i64, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            process_name: process_name.into(),
            pid_offset,
            log_dir: log_dir.into(),
        }
    }

    pub fn from_config(config: &TailerConfig) -> Self {
        Self::new(
            config.process_name.clone(),
            config.pid_offset,
            config.log_dir.clone(),
        )
    }

    /// Pid used in the log file name of the running relay.
    pub async fn find_pid(&self, runner: &dyn CommandRunner) -> Result<u32, TailError> {
        let command = CommandSpec::new("pgrep").arg(&self.process_name);
        let output = runner.run(&command).await.map_err(|e| match e {
            // pgrep exits with 1 when nothing matched
            CommandError::NonZeroExit { .. } => {
                TailError::ProcessNotFound(format!("no process named {}", self.process_name))
            }
            other => TailError::ProcessNotFound(other.to_string()),
        })?;

        let pid: i64 = output
            .stdout
            .lines()
            .next()
            .map(str::trim)
            .and_then(|line| line.parse().ok())
            .ok_or_else(|| {
                TailError::ProcessNotFound(format!(
                    "unexpected pgrep output: {:?}",
                    output.stdout
                ))
            })?;

        let adjusted = pid + self.pid_offset;
        u32::try_from(adjusted)
            .ok()
            .filter(|pid| *pid > 0)
            .map(|pid| {
                debug!("{} runs as pid {} (log pid {})", self.process_name, pid, adjusted);
                pid
            })
            .ok_or_else(|| TailError::ProcessNotFound(format!("invalid pid {}", adjusted)))
    }

    /// Newest `turn_<pid>*.log` file in the log directory.
    pub fn find_log_file(&self, pid: u32) -> Result<PathBuf, TailError> {
        let prefix = format!("turn_{}", pid);
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&self.log_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && Self::matches(path, &prefix))
            .collect();
        candidates.sort();

        candidates.pop().ok_or_else(|| {
            TailError::LogFileNotFound(format!(
                "no {}*.log in {}",
                prefix,
                self.log_dir.display()
            ))
        })
    }

    pub async fn locate(&self, runner: &dyn CommandRunner) -> Result<PathBuf, TailError> {
        let pid = self.find_pid(runner).await?;
        let path = self.find_log_file(pid)?;
        info!("Relay log file: {}", path.display());
        Ok(path)
    }

    fn matches(path: &Path, prefix: &str) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let Some(rest) = name.strip_prefix(prefix) else {
            return false;
        };
        // turn_12 must not pick up turn_123
        name.ends_with(".log") && !rest.starts_with(|c: char| c.is_ascii_digit())
    }
}
