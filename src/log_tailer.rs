//! Following the relay's log file.
//!
//! [`ProcessLocator`] finds the file the running relay writes to and
//! [`LogTailer`] turns the lines appended to it into parsed records.

pub mod process_locator;
pub mod tailer;

pub use process_locator::ProcessLocator;
pub use tailer::LogTailer;
