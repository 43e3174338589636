//! Error types for the relay

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Lock conflict in the durable store that outlived the retry budget
    #[error("Durable store contention: gave up after {attempts} attempts")]
    StoreContention { attempts: u32 },

    /// No collector agent could be connected
    #[error("No collector agents are available ({agents})")]
    AgentsUnavailable { agents: String },

    /// Transport failure while sending to a connected agent
    #[error("Unable to deliver to {agent}: {message}")]
    DeliveryFailure { agent: String, message: String },

    /// Cipher or key failure
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// One or more resources failed to close on shutdown
    #[error("Failed to close resources: {}", resources.join(", "))]
    ResourceClose { resources: Vec<String> },

    /// Durable store engine error
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Durable store already closed
    #[error("Durable store is closed")]
    StoreClosed,

    /// Data directory held by another store
    #[error("Data directory '{path}' is locked by another relay")]
    StoreLocked { path: String },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON configuration error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed persisted frame
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid configuration with details
    #[error("Invalid configuration for {component}: {message}")]
    InvalidConfiguration { component: String, message: String },

    /// A context key listed as required was absent
    #[error("Required key {key} is missing from the context")]
    MissingContext { key: String },

    /// Manager not running
    #[error("Relay manager is stopped")]
    ManagerStopped,

    /// Store write worker went away
    #[error("Store writer worker is unavailable")]
    WorkerUnavailable,
}

impl RelayError {
    /// Create a store contention error
    pub fn contention(attempts: u32) -> Self {
        RelayError::StoreContention { attempts }
    }

    /// Create an agents unavailable error listing the configured agents
    pub fn agents_unavailable(agents: impl Into<String>) -> Self {
        RelayError::AgentsUnavailable {
            agents: agents.into(),
        }
    }

    /// Create a delivery failure for a specific agent
    pub fn delivery(agent: impl Into<String>, message: impl Into<String>) -> Self {
        RelayError::DeliveryFailure {
            agent: agent.into(),
            message: message.into(),
        }
    }

    /// Create an encryption error
    pub fn encryption<S: Into<String>>(msg: S) -> Self {
        RelayError::Encryption(msg.into())
    }

    /// Create a codec error
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        RelayError::Codec(msg.into())
    }

    /// Create an invalid configuration error
    pub fn config(component: impl Into<String>, message: impl Into<String>) -> Self {
        RelayError::InvalidConfiguration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a data directory lock error
    pub fn store_locked(path: impl Into<String>) -> Self {
        RelayError::StoreLocked { path: path.into() }
    }

    /// Create a missing context key error
    pub fn missing_context(key: impl Into<String>) -> Self {
        RelayError::MissingContext { key: key.into() }
    }

    /// Whether this error is a transient remote delivery problem
    ///
    /// Delivery errors are absorbed by the writer thread on the durable
    /// path; everything else is a local failure.
    pub fn is_delivery(&self) -> bool {
        matches!(
            self,
            RelayError::AgentsUnavailable { .. } | RelayError::DeliveryFailure { .. }
        )
    }
}
