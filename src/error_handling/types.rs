use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    EmptyValue(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::EmptyValue(e) => write!(f, "Missing value: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::TomlError(err.to_string())
    }
}

#[derive(Debug, PartialEq)]
pub enum CorrelationError {
    /// An event kind the correlator has no transition for.
    UnknownEvent(String),
    /// The downstream consumer of client events went away.
    ChannelClosed,
}

impl fmt::Display for CorrelationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationError::UnknownEvent(kind) => write!(f, "Unknown log event '{}'", kind),
            CorrelationError::ChannelClosed => write!(f, "Client event channel closed"),
        }
    }
}

impl std::error::Error for CorrelationError {}

#[derive(Debug)]
pub enum TailError {
    ProcessNotFound(String),
    LogFileNotFound(String),
    FileUnavailable(PathBuf),
    IoError(std::io::Error),
    WatchError(String),
    ChannelClosed,
}

impl fmt::Display for TailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TailError::ProcessNotFound(e) => write!(f, "Relay process not found: {}", e),
            TailError::LogFileNotFound(e) => write!(f, "Relay log file not found: {}", e),
            TailError::FileUnavailable(p) => {
                write!(f, "Log file {} is no longer available", p.display())
            }
            TailError::IoError(e) => write!(f, "Tailer IO error: {}", e),
            TailError::WatchError(e) => write!(f, "File watcher error: {}", e),
            TailError::ChannelClosed => write!(f, "Log record channel closed"),
        }
    }
}

impl std::error::Error for TailError {}

impl From<std::io::Error> for TailError {
    fn from(err: std::io::Error) -> Self {
        TailError::IoError(err)
    }
}

impl From<notify::Error> for TailError {
    fn from(err: notify::Error) -> Self {
        TailError::WatchError(err.to_string())
    }
}

#[derive(Debug)]
pub enum CommandError {
    SpawnFailed(String),
    NonZeroExit { status: Option<i32>, stderr: String },
    /// The tool reported a condition worth trying again later.
    Retryable(String),
    QueueClosed,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::SpawnFailed(e) => write!(f, "Command spawn failed: {}", e),
            CommandError::NonZeroExit { status, stderr } => match status {
                Some(code) => write!(f, "Command exited with status {}: {}", code, stderr.trim()),
                None => write!(f, "Command terminated by signal: {}", stderr.trim()),
            },
            CommandError::Retryable(e) => write!(f, "Command failed transiently: {}", e),
            CommandError::QueueClosed => write!(f, "Command queue is closed"),
        }
    }
}

impl std::error::Error for CommandError {}

#[derive(Debug)]
pub enum FirewallError {
    RuleInsertFailed(CommandError),
    RuleRemoveFailed(CommandError),
}

impl fmt::Display for FirewallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallError::RuleInsertFailed(e) => write!(f, "Firewall rule insert failed: {}", e),
            FirewallError::RuleRemoveFailed(e) => write!(f, "Firewall rule removal failed: {}", e),
        }
    }
}

impl std::error::Error for FirewallError {}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    TailError(TailError),
    CorrelationError(CorrelationError),
    CommandError(CommandError),
    FirewallError(FirewallError),
    InitializationFailed(String),
    TaskFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::TailError(e) => write!(f, "Tailer error: {}", e),
            ControllerError::CorrelationError(e) => write!(f, "Correlation error: {}", e),
            ControllerError::CommandError(e) => write!(f, "Command error: {}", e),
            ControllerError::FirewallError(e) => write!(f, "Firewall error: {}", e),
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
            ControllerError::TaskFailed(e) => write!(f, "Task failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::ConfigurationError(err)
    }
}

impl From<TailError> for ControllerError {
    fn from(err: TailError) -> Self {
        ControllerError::TailError(err)
    }
}

impl From<CorrelationError> for ControllerError {
    fn from(err: CorrelationError) -> Self {
        ControllerError::CorrelationError(err)
    }
}

impl From<CommandError> for ControllerError {
    fn from(err: CommandError) -> Self {
        ControllerError::CommandError(err)
    }
}

impl From<FirewallError> for ControllerError {
    fn from(err: FirewallError) -> Self {
        ControllerError::FirewallError(err)
    }
}
