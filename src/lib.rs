pub mod command_queue;
pub mod configuration;
pub mod controller;
pub mod error_handling;
pub mod firewall;
pub mod log_parsing;
pub mod log_tailer;
pub mod session_management;

pub use controller::Controller;
