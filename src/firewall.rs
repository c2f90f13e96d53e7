//! Temporary firewall bans for abusive relay clients.
//!
//! Re-exports:
//! - [`BanScheduler`]: applies bans and lifts them after a timeout or at shutdown.
//! - [`DropRule`], [`BootEntry`], [`BanStats`]: core types.

pub mod ban_scheduler;
pub mod types;

pub use ban_scheduler::BanScheduler;
pub use types::{BanStats, BootEntry, DropRule};
