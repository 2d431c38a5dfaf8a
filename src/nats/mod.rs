//! NATS messaging layer
//!
//! The client wrapper plus the wire types spoken with provisioning-mode
//! nodes.

pub mod client;
pub mod messages;

pub use client::{Collect, NatsClient};
pub use messages::{
    LifecycleEvent, LifecycleKind, RegistrationData, RequestFilter, RpcReply, RpcRequest,
};
