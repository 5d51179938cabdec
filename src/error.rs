use thiserror::Error;

use crate::TypeTag;

/// Errors that can occur while registering, dispatching or correlating
/// bus messages.
#[derive(Error, Debug)]
pub enum BusError {
    /// A handler is already bound to this type tag on the bus.
    #[error("`{0}` has been already registered")]
    AlreadyRegistered(TypeTag),

    /// No handler is registered for the type tag.
    #[error("no handler has been found for `{0}`")]
    HandlerNotFound(TypeTag),

    /// The wire payload is not a valid envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The envelope names a type that is not present in the type registry.
    #[error("unknown type tag: `{0}`")]
    UnknownType(TypeTag),

    /// A reconstructed value did not have the type the caller expected.
    #[error("type mismatch: expected `{expected}`, found `{found}`")]
    TypeMismatch { expected: TypeTag, found: TypeTag },

    /// A message could not be flattened into, or rebuilt from, a parameter map.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// A broker operation was attempted before a successful `connect`.
    #[error("broker not connected")]
    BrokerNotConnected,

    /// The broker session has been closed and cannot be reused.
    #[error("broker closed")]
    BrokerClosed,

    /// Handlers cannot be registered once the bus is listening.
    #[error("handler registry is sealed: bus is already listening")]
    RegistrySealed,

    /// `listen` was called on a bus that is already listening.
    #[error("bus is already listening")]
    AlreadyListening,

    /// The operation observed a shutdown signal and unwound.
    #[error("operation cancelled")]
    Cancelled,

    /// The optional reply timeout elapsed before a matching reply arrived.
    #[error("timed out waiting for reply")]
    Timeout,

    /// A handler returned an application error.
    #[error("handler failed: {0}")]
    Handler(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The underlying broker client reported a failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl BusError {
    /// Build a handler error from any displayable application error.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        Self::Handler(err.to_string())
    }

    /// True when this error is the cancellation signal rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;
