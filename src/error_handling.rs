//! Error types shared across the subsystems.
//!
//! Each subsystem owns one enum in [`types`]; the controller folds them into
//! [`types::ControllerError`] through `From` conversions.

pub mod types;
