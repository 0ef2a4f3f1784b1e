//! dbus-client-core
//!
//! From-scratch implementation of the D-Bus message-bus wire protocol:
//! binary message framing, the structural signature/type system, a
//! declarative interface registry, and an async connection engine that turns
//! raw bytes into correlated method calls, signals and property access.
//!
//! Works over any byte-stream transport (TCP, WebSocket, tunneled
//! messaging) through the [`transport::Transport`] trait — no native D-Bus
//! daemon library involved.
//!
//! ## Modules
//!
//! - `types`: signature classification and single-complete-type scanning
//! - `codec`: marshal/unmarshal of the D-Bus wire format
//! - `interface`: declarative method/signal/property registry
//! - `message`: 16-byte preamble + header fields + body framing
//! - `connection`: handshake, serial correlation, subscriptions, properties
//! - `transport`: the byte-stream contract the engine drives
//! - `error`: one taxonomy for wire, caller and connection failures
//!
//! ## Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use dbus_client_core::codec::{self, Endian, Value};
//!
//! // Marshal a string and an int32, then read them back
//! let mut buf = BytesMut::new();
//! codec::append(&mut buf, "si", &[Value::Str("hello".into()), Value::F64(42.0)]).unwrap();
//! let values = codec::get(&buf, Endian::Little, "si").unwrap();
//! assert_eq!(values[1], Value::F64(42.0));
//! ```
//!
//! ## Scope
//!
//! This is a client: it calls methods, observes signals and accesses
//! properties, but hosts no objects of its own and routes nothing between
//! peers. 64-bit integers and unix-fd passing are intentionally unsupported
//! (all numbers ride as IEEE-754 doubles).

// Re-export commonly used types
pub use codec::{Endian, Value, Variant};
pub use connection::{AuthMethod, BusConnection, SignalHandle};
pub use error::{DBusError, Result};
pub use message::Message;

// Public modules
pub mod codec;
pub mod connection;
pub mod error;
pub mod interface;
pub mod message;
pub mod transport;
pub mod types;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub use message::PROTOCOL_VERSION;
