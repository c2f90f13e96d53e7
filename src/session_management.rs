//! Session management core module.
//!
//! This module provides the relay session types and the correlator that
//! derives them from relay log events.

/// Submodule for connection data structures and client events.
pub mod connection;
/// Submodule for the log event correlator.
pub mod correlator;

pub use connection::{
    ClientEvent, Connection, ConnectionKey, ConnectionState, UsageSnapshot,
};
pub use correlator::SessionCorrelator;
