//! Top-level orchestration of the pipeline.

pub mod controller_handler;
pub mod credential_policy;

pub use controller_handler::Controller;
pub use credential_policy::CredentialPolicy;
