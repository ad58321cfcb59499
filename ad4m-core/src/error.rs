//! Error types for the engine

use ad4m_types::{Address, AddressError};
use thiserror::Error;

/// Boxed adapter-local failure.
pub type AdapterError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum CoreError {
    /// No adapter registered for the language id
    #[error("no language adapter registered for '{0}'")]
    AdapterNotFound(String),

    /// Adapter replacement refused while operations still hold the old instance
    #[error("language '{0}' has in-flight operations")]
    AdapterBusy(String),

    /// Content or perspective absent
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("invalid link: {0}")]
    InvalidLink(String),

    /// Wrong passphrase or tampered key blob
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("agent is locked")]
    AgentLocked,

    #[error("agent is not initialized")]
    AgentNotInitialized,

    #[error("agent is already initialized")]
    AgentAlreadyInitialized,

    /// Capability check failed
    #[error("unauthorized: {action} on {domain}/{pointer}")]
    Unauthorized {
        domain: String,
        pointer: String,
        action: String,
    },

    /// Token could not be decoded or verified
    #[error("invalid capability token: {0}")]
    InvalidToken(String),

    #[error("pairing code already used")]
    CodeAlreadyUsed,

    #[error("pairing code expired")]
    CodeExpired,

    /// Every pairing code is held by a live request
    #[error("no pairing codes left")]
    PairingCodesExhausted,

    /// Pairing request not in the state the operation needs
    #[error("pairing request {0} is not pending")]
    RequestNotPending(String),

    /// Subscriber queue filled up and was disconnected
    #[error("subscriber overflowed its queue and was disconnected")]
    SubscriberOverflow,

    /// Adapter-local failure, wrapped with the address being served
    #[error("language adapter failed for {address}: {source}")]
    AdapterFailure {
        address: String,
        #[source]
        source: AdapterError,
    },

    #[error("perspective {0} is already shared")]
    AlreadyShared(String),

    /// A link language carries one neighbourhood per agent
    #[error("link language '{language}' already carries perspective {perspective}")]
    LinkLanguageInUse { language: String, perspective: String },

    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl CoreError {
    pub fn adapter(address: &Address, source: impl Into<AdapterError>) -> Self {
        CoreError::AdapterFailure {
            address: address.to_string(),
            source: source.into(),
        }
    }

    /// Adapter failure for an operation that has no address yet (e.g. a put).
    pub fn adapter_for_language(language: &str, source: impl Into<AdapterError>) -> Self {
        CoreError::AdapterFailure {
            address: format!("{language}://"),
            source: source.into(),
        }
    }

    pub fn unauthorized(domain: &str, pointer: &str, action: &str) -> Self {
        CoreError::Unauthorized {
            domain: domain.to_string(),
            pointer: pointer.to_string(),
            action: action.to_string(),
        }
    }
}

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;
