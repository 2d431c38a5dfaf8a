//! Shared types for the provisioner

pub mod error;

pub use error::{ProvisionerError, Result};
