//! Error types for dbus-client-core
//!
//! One taxonomy covers the whole crate: wire-level decode failures,
//! signature problems, caller mistakes during marshalling, unknown
//! declarations, connection lifecycle failures and remote D-Bus errors.
//!
//! Remote `ERROR` messages carry a D-Bus error name string;
//! [`from_error_name`] translates the well-known
//! `org.freedesktop.DBus.Error.*` names into local kinds so callers can match
//! on `DBusError::UnknownMethod` instead of string-comparing error names.
//! Unmapped names fall back to [`DBusError::Remote`] carrying the raw name.

use std::io;
use thiserror::Error;

/// Result type alias using DBusError
pub type Result<T> = std::result::Result<T, DBusError>;

/// All errors that can occur in the D-Bus client implementation.
#[derive(Debug, Error)]
pub enum DBusError {
    /// I/O error from the underlying transport
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed header or body, unsupported protocol version or message type
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Malformed signature, or a received body signature does not match the
    /// signature the caller expected
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// A supplied value does not match the declared signature
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Interface was never registered, or a remote peer reported it unknown
    #[error("Unknown interface: {0}")]
    UnknownInterface(String),

    /// Method not declared on the interface, or reported unknown by the peer
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// Property not declared on the interface, or reported unknown by the peer
    #[error("Unknown property: {0}")]
    UnknownProperty(String),

    /// Signal not declared on the interface
    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    /// Sending without a live transport
    #[error("No connection")]
    NoConnection,

    /// The transport died, taking every pending invocation with it
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Invocation or authentication timeout
    #[error("Operation timed out")]
    Timeout,

    /// Authentication handshake rejected by the bus
    #[error("Authorization failure: {0}")]
    AuthorizationFailure(String),

    /// Remote D-Bus error with a name this taxonomy does not map
    #[error("Remote error {name}: {message}")]
    Remote { name: String, message: String },
}

impl DBusError {
    /// Create an InvalidPacket error
    pub fn invalid_packet(msg: impl Into<String>) -> Self {
        Self::InvalidPacket(msg.into())
    }

    /// Create an InvalidSignature error
    pub fn invalid_signature(msg: impl Into<String>) -> Self {
        Self::InvalidSignature(msg.into())
    }

    /// Create an InvalidArgument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a Disconnected error
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }
}

/// Translate a remote D-Bus error name into the local taxonomy.
///
/// Names outside the mapped set become [`DBusError::Remote`] with the raw
/// name and message preserved.
pub fn from_error_name(name: &str, message: &str) -> DBusError {
    match name {
        "org.freedesktop.DBus.Error.UnknownInterface" => {
            DBusError::UnknownInterface(message.to_string())
        }
        "org.freedesktop.DBus.Error.UnknownMethod" => {
            DBusError::UnknownMethod(message.to_string())
        }
        "org.freedesktop.DBus.Error.UnknownProperty" => {
            DBusError::UnknownProperty(message.to_string())
        }
        "org.freedesktop.DBus.Error.InvalidArgs" => {
            DBusError::InvalidArgument(message.to_string())
        }
        "org.freedesktop.DBus.Error.InvalidSignature" => {
            DBusError::InvalidSignature(message.to_string())
        }
        "org.freedesktop.DBus.Error.NoReply" | "org.freedesktop.DBus.Error.Timeout" => {
            DBusError::Timeout
        }
        "org.freedesktop.DBus.Error.Disconnected" => {
            DBusError::Disconnected(message.to_string())
        }
        "org.freedesktop.DBus.Error.AccessDenied"
        | "org.freedesktop.DBus.Error.AuthFailed" => {
            DBusError::AuthorizationFailure(message.to_string())
        }
        _ => DBusError::Remote {
            name: name.to_string(),
            message: message.to_string(),
        },
    }
}
