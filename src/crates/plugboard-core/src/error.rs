//! Error types for graph construction, execution, and serialization
//!
//! All fallible operations in this crate return [`Result`]. Authoring errors
//! (unknown handlers, malformed projections) surface synchronously at the
//! point of misuse; handler failures surface as [`GraphError::NodeFailed`]
//! with the failing node's id and, when the handler supplied one, a
//! machine-readable cause that [`Board::run_once`](crate::Board::run_once)
//! converts into a soft `$error` output instead of a hard failure.

use serde_json::Value;
use thiserror::Error;

/// Convenience result type using [`GraphError`].
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors produced by graph authoring, scheduling, and serialization.
#[derive(Error, Debug)]
pub enum GraphError {
    /// No handler registered under this name in the scope chain.
    #[error("handler '{0}' not found")]
    UnknownHandler(String),

    /// A reserved node type (`input`, `output`) was fired through the eager
    /// traversal. These types only carry meaning in step-wise execution and
    /// serialization.
    #[error("reserved node type '{0}' cannot be fired directly")]
    ReservedType(String),

    /// A value projection was used in a way its keymap does not allow, e.g.
    /// resolving a multi-key projection as a scalar.
    #[error("invalid projection: {0}")]
    Projection(String),

    /// A node's handler failed during firing.
    ///
    /// The original error message is preserved in `message`; `cause` carries
    /// the machine-readable payload if the handler raised one via
    /// [`GraphError::caused`].
    #[error("node '{node}' execution failed: {message}")]
    NodeFailed {
        /// Id of the node that failed
        node: String,
        /// Error message from the handler
        message: String,
        /// Machine-readable cause, if the handler supplied one
        cause: Option<Value>,
    },

    /// A handler-raised error carrying a machine-readable cause.
    ///
    /// Raised inside handlers; the scheduler wraps it into
    /// [`GraphError::NodeFailed`] with the cause preserved.
    #[error("{message}")]
    Caused {
        /// Human-readable message
        message: String,
        /// Machine-readable payload
        cause: Value,
    },

    /// The scheduler's bookkeeping was violated (a popped worklist node was
    /// not ready). This is a bug in the engine, not a recoverable runtime
    /// condition; the traversal aborts.
    #[error("internal scheduler invariant violated: {0}")]
    Internal(String),

    /// A node or value was resolved inside a serializing scope.
    ///
    /// Not user-facing: the serializer catches this signal during closure
    /// dry-runs and falls back to source-text serialization.
    #[error("value resolved while serializing")]
    SerializeSuspend,

    /// The serializer could not compile a node, e.g. an inline closure with
    /// no declared source, or source text matching no recognized shape.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A graph descriptor failed structural validation.
    #[error("descriptor validation failed: {0}")]
    Validation(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error while reading or writing a descriptor file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraphError {
    /// Create a handler error carrying a machine-readable cause.
    ///
    /// When a firing fails with this error, the run-once driver reports
    /// `{"$error": cause}` as a soft output instead of failing the run.
    pub fn caused(message: impl Into<String>, cause: Value) -> Self {
        Self::Caused {
            message: message.into(),
            cause,
        }
    }

    /// The machine-readable cause attached to this error, if any.
    pub fn cause(&self) -> Option<&Value> {
        match self {
            Self::Caused { cause, .. } => Some(cause),
            Self::NodeFailed { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }
}

/// A cloneable record of a failed firing, stored in the node's settle-once
/// channel so every observer sees the first failure.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    /// Id of the node that failed
    pub node: String,
    /// Error message from the handler
    pub message: String,
    /// Machine-readable cause, if the handler supplied one
    pub cause: Option<Value>,
}

impl From<NodeFailure> for GraphError {
    fn from(failure: NodeFailure) -> Self {
        GraphError::NodeFailed {
            node: failure.node,
            message: failure.message,
            cause: failure.cause,
        }
    }
}
