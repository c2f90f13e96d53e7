//! Serialized execution of administrative commands.
//!
//! Re-exports:
//! - [`CommandQueue`]: single-worker FIFO in front of an external tool.
//! - [`TurnAdmin`]: relay user administration built on the queue.
//! - [`CommandRunner`], [`ProcessRunner`]: how commands are actually run.

pub mod exec_queue;
pub mod runner;
pub mod turn_admin;

pub use exec_queue::{CommandQueue, NeverRetry, RetryPolicy, RetryTransient};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use turn_admin::{parse_user_list, RelayUser, SyncReport, TurnAdmin};
