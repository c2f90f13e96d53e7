//! Relay log parsing.
//!
//! Turns raw coturn log lines into [`LogEvent`]s. Parsing is stateless apart
//! from the [`LineWindow`] that stitches multi-line records together.

pub mod line_window;
pub mod parser;
pub mod types;

pub use line_window::LineWindow;
pub use parser::LogParser;
pub use types::{EventKind, LogEvent, LogRecord, UsageCounters};
