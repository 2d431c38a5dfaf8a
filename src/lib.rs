//! Choria Provisioner
//!
//! Bootstraps fleet nodes that boot into provisioning mode: nodes are
//! discovered over NATS, walked through certificate and JWT trust
//! bootstrap, configured from an external helper and restarted into
//! service. Multiple instances coordinate through leader election so that
//! only one drives the fleet at a time.
//!
//! ## Components
//!
//! - **Host**: per-node provisioning state machine
//! - **Fleet**: registry, work queue, workers and the finisher
//! - **Discovery**: broadcast discovery and lifecycle event listeners
//! - **Election**: JetStream backed leader election
//! - **Pause gate**: process-wide switch checked by every outward action

pub mod agent;
pub mod config;
pub mod discovery;
pub mod election;
pub mod events;
pub mod fleet;
pub mod host;
pub mod metrics;
pub mod nats;
pub mod pause;
pub mod retry;
pub mod types;

pub use config::{Args, ProvisionerConfig};
pub use fleet::Provisioner;
pub use types::{ProvisionerError, Result};
