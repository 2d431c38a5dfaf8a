//! Error types for the provisioner
//!
//! Most variants carry a preformatted message. The two structured variants,
//! `Exhausted` and `Step`, wrap an inner error so that callers can still ask
//! whether the root cause was a pause or a deferral.

/// Main error type for provisioner operations
#[derive(Debug, thiserror::Error)]
pub enum ProvisionerError {
    #[error("provisioning is paused, cannot perform {0}")]
    Paused(String),

    #[error("{0}")]
    Rpc(String),

    #[error("{0}")]
    Helper(String),

    #[error("{0}")]
    Validation(String),

    #[error("configuration defered: {0}")]
    Deferred(String),

    #[error("work queue is full with {0} entries")]
    Capacity(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("JWT error: {0}")]
    Jwt(String),

    #[error("{0} was cancelled")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("maximum tries ({tries}) reached for {action}: {source}")]
    Exhausted {
        action: String,
        tries: u32,
        #[source]
        source: Box<ProvisionerError>,
    },

    #[error("could not {step} for {identity}: {source}")]
    Step {
        step: &'static str,
        identity: String,
        #[source]
        source: Box<ProvisionerError>,
    },
}

impl ProvisionerError {
    /// Wrap an error with the provisioning step and node it belongs to
    pub fn step(step: &'static str, identity: &str, source: ProvisionerError) -> Self {
        Self::Step {
            step,
            identity: identity.to_string(),
            source: Box::new(source),
        }
    }

    /// The innermost error, looking through retry and step wrappers
    pub fn root(&self) -> &ProvisionerError {
        match self {
            Self::Exhausted { source, .. } | Self::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the failure was caused by the pause gate
    pub fn is_paused(&self) -> bool {
        matches!(self.root(), Self::Paused(_))
    }

    /// True when the helper asked for the node to be deferred
    pub fn is_deferred(&self) -> bool {
        matches!(self.root(), Self::Deferred(_))
    }

    /// True when the failure was caused by shutdown
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled(_))
    }
}

impl From<std::io::Error> for ProvisionerError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ProvisionerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ProvisionerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(format!("YAML error: {}", err))
    }
}

impl From<async_nats::Error> for ProvisionerError {
    fn from(err: async_nats::Error) -> Self {
        Self::Nats(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for ProvisionerError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Jwt(err.to_string())
    }
}

/// Result type alias for provisioner operations
pub type Result<T> = std::result::Result<T, ProvisionerError>;
