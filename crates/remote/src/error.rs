//! Error types for the remote cache client

use crate::merkle::Digest;
use miette::Diagnostic;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors surfaced by the remote cache client
///
/// `NotFound` is the only variant that means "definitely absent"; every other
/// variant must not be treated as a cache miss.
#[derive(Error, Debug, Diagnostic)]
pub enum RemoteError {
    /// A requested digest is absent from the remote store
    #[error("blob {digest} not found in remote cache")]
    #[diagnostic(code(remote_cache::not_found))]
    NotFound {
        /// The digest that was missing
        digest: Digest,
    },

    /// The reply stream did not have the expected structure
    #[error("protocol violation: {message}")]
    #[diagnostic(code(remote_cache::protocol_violation))]
    ProtocolViolation {
        /// What was wrong with the stream
        message: String,
    },

    /// The server reported a failure status
    #[error("remote {operation} failed: {detail}")]
    #[diagnostic(code(remote_cache::remote_failure))]
    RemoteFailure {
        /// The remote call that failed
        operation: String,
        /// Server-reported error detail
        detail: String,
    },

    /// A single reply buffer would exceed the memory ceiling
    #[error("blob {digest} exceeds the {limit} byte download limit")]
    #[diagnostic(
        code(remote_cache::resource_exceeded),
        help("blobs this large must be streamed to disk instead of buffered")
    )]
    ResourceExceeded {
        /// The oversized digest
        digest: Digest,
        /// The ceiling in bytes
        limit: i64,
    },

    /// The operation is not supported by this client
    #[error("unsupported operation: {operation}")]
    #[diagnostic(code(remote_cache::unsupported))]
    Unsupported {
        /// Description of the unsupported operation
        operation: String,
    },

    /// Local filesystem failure
    #[error("I/O error during {operation} on {}: {source}", path.display())]
    #[diagnostic(code(remote_cache::io))]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// The path involved
        path: PathBuf,
        /// Description of the failed operation
        operation: String,
    },

    /// Waiting for remote completion timed out
    #[error("{operation} timed out after {seconds}s")]
    #[diagnostic(code(remote_cache::timeout))]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// Configured timeout in seconds
        seconds: u64,
    },

    /// Transport-level gRPC failure
    #[error("gRPC error in {operation}: {source}")]
    #[diagnostic(code(remote_cache::grpc))]
    Grpc {
        /// The RPC that failed
        operation: String,
        /// The gRPC status
        #[source]
        source: tonic::Status,
    },

    /// Could not connect to the cache endpoint
    #[error("failed to connect to {endpoint}: {message}")]
    #[diagnostic(code(remote_cache::connection_failed))]
    ConnectionFailed {
        /// The endpoint that was dialed
        endpoint: String,
        /// Error message from the transport
        message: String,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    #[diagnostic(code(remote_cache::config))]
    Config(String),

    /// A digest could not be parsed or is malformed
    #[error("invalid digest: {0}")]
    #[diagnostic(code(remote_cache::invalid_digest))]
    InvalidDigest(String),

    /// The tree repository was used inconsistently
    #[error("merkle tree error: {message}")]
    #[diagnostic(code(remote_cache::merkle))]
    Merkle {
        /// What went wrong
        message: String,
    },

    /// All retry attempts failed
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    #[diagnostic(code(remote_cache::retry_exhausted))]
    RetryExhausted {
        /// The retried operation
        operation: String,
        /// Number of attempts made
        attempts: usize,
        /// The error from the final attempt
        last_error: String,
    },
}

impl RemoteError {
    /// Create a not-found error for a digest
    pub fn not_found(digest: Digest) -> Self {
        Self::NotFound { digest }
    }

    /// Create a protocol violation error
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Create a remote failure error from a server-reported detail
    pub fn remote_failure(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::RemoteFailure {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Create a resource exceeded error
    pub fn resource_exceeded(digest: Digest, limit: i64) -> Self {
        Self::ResourceExceeded { digest, limit }
    }

    /// Create an unsupported operation error
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Create an I/O error with path context
    pub fn io(operation: impl Into<String>, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            source,
            path: path.as_ref().to_path_buf(),
            operation: operation.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Create a gRPC error
    pub fn grpc(operation: impl Into<String>, source: tonic::Status) -> Self {
        Self::Grpc {
            operation: operation.into(),
            source,
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid digest error
    pub fn invalid_digest(message: impl Into<String>) -> Self {
        Self::InvalidDigest(message.into())
    }

    /// Create a merkle tree error
    pub fn merkle_error(message: impl Into<String>) -> Self {
        Self::Merkle {
            message: message.into(),
        }
    }

    /// Create a retry exhausted error
    pub fn retry_exhausted(
        operation: impl Into<String>,
        attempts: usize,
        last_error: impl Into<String>,
    ) -> Self {
        Self::RetryExhausted {
            operation: operation.into(),
            attempts,
            last_error: last_error.into(),
        }
    }

    /// Whether this error proves the content is absent, so callers may treat
    /// it as a cache miss
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for remote cache operations
pub type Result<T> = std::result::Result<T, RemoteError>;
