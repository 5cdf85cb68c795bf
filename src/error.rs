//! # Error Types
//!
//! Error handling for every layer of the peer transport.
//!
//! ## Error Categories
//! - **I/O Errors**: transport failures, always fatal to the connection
//! - **Conversion Errors**: unknown type tags, truncated buffers, field-contract
//!   mismatches; reported to the caller, the connection keeps running
//! - **Garbled Messages**: translator bookkeeping ran past the buffer; fatal
//! - **Flow Errors**: queue full, timeouts, operations on closed connections
//! - **Invocation Errors**: failures raised by a remote implementation
//!
//! ## Example Usage
//! ```rust
//! use peerlink::error::{ProtocolError, Result};
//!
//! fn check_capacity(pending: usize, capacity: usize) -> Result<()> {
//!     if pending >= capacity {
//!         return Err(ProtocolError::QueueFull { capacity });
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_capacity(3, 10).is_ok());
//! assert!(matches!(
//!     check_capacity(10, 10),
//!     Err(ProtocolError::QueueFull { capacity: 10 })
//! ));
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Registry errors
    pub const ERR_REGISTRY_FROZEN: &str = "Type registry is frozen after first use by a connection";
    pub const ERR_REGISTRY_LOCK: &str = "Failed to acquire lock on type registry";
    pub const ERR_LISTENER_LOCK: &str = "Failed to acquire lock on listener list";

    /// Conversion errors
    pub const ERR_TRUNCATED: &str = "Buffer shorter than descriptor demands";
    pub const ERR_UNKNOWN_KIND: &str = "Unknown value kind byte";
    pub const ERR_INVALID_UTF8: &str = "String field is not valid UTF-8";
    pub const ERR_INVALID_CHAR: &str = "Char field is not a valid scalar value";
    pub const ERR_WRONG_TYPE: &str = "Value type does not match registered type";
    pub const ERR_NESTING: &str = "Lists nested deeper than the supported limit";

    /// Translator errors
    pub const ERR_CHUNK_OVERRUN: &str = "Chunk length runs past end of buffer";
    pub const ERR_CHUNK_OPEN: &str = "Chunk failed authentication";
    pub const ERR_CHUNK_SALT: &str = "Chunk shorter than its salt";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_CONNECTION_TIMEOUT: &str = "Connection timed out (no activity)";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
}

/// ProtocolError is the primary error type for all peer operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Frame encoding error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Frame(#[from] bincode::Error),

    /// Unknown type tag, truncated buffer or field-contract mismatch.
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Translator bookkeeping overran the payload. Fatal for the connection.
    #[error("Garbled message: {0}")]
    Garbled(String),

    #[error("Outbound queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Disconnected")]
    Disconnected,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection timed out (no activity)")]
    ConnectionTimeout,

    #[error("Invalid protocol header")]
    InvalidHeader,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    /// Raised by a remote implementation or by signature checks on the host.
    #[error("Remote invocation failed: {0}")]
    Invocation(String),

    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Not registered: {0}")]
    NotRegistered(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error must close the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_) | ProtocolError::Garbled(_) | ProtocolError::ConnectionTimeout
        )
    }

    pub(crate) fn conversion(msg: impl Into<String>) -> Self {
        ProtocolError::Conversion(msg.into())
    }
}

// `Value` fields convert to themselves through the blanket `TryFrom`.
impl From<std::convert::Infallible> for ProtocolError {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::Garbled("x".into()).is_fatal());
        assert!(ProtocolError::Io(io::Error::other("boom")).is_fatal());
        assert!(!ProtocolError::QueueFull { capacity: 1 }.is_fatal());
        assert!(!ProtocolError::Conversion("x".into()).is_fatal());
        assert!(!ProtocolError::Timeout.is_fatal());
    }

    #[test]
    fn test_display_messages() {
        let err = ProtocolError::QueueFull { capacity: 10 };
        assert_eq!(err.to_string(), "Outbound queue full (capacity 10)");
        assert_eq!(ProtocolError::Disconnected.to_string(), "Disconnected");
    }
}
