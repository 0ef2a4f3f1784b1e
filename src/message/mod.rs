//! D-Bus message framing
//!
//! The wire unit is a 16-byte fixed preamble `(endian, type, flags,
//! protocol_version, body_length: u32, serial: u32)`, followed by an array of
//! `(field_code: u8, variant)` header fields, padded to an 8-byte boundary,
//! followed by the body encoded per the SIGNATURE header field.
//!
//! [`required_length`] computes the total frame length from the first 16
//! bytes, which is what lets the connection engine accumulate exactly one
//! message off an arbitrarily-chunked byte stream before attempting a full
//! [`Message::from_bytes`] parse.

use bytes::{BufMut, BytesMut};
use tracing::warn;

use crate::codec::{self, Endian, Value};
use crate::error::{DBusError, Result};

/// D-Bus protocol version spoken and accepted.
pub const PROTOCOL_VERSION: u8 = 1;

/// Well-known name, path and interface of the message bus itself.
pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Standard interfaces every peer speaks.
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// Error names this client emits.
pub const ERROR_NOT_SUPPORTED: &str = "org.freedesktop.DBus.Error.NotSupported";

/// Signature of the header-fields block within the full header.
const HEADER_SIGNATURE: &str = "yyyyuua(yv)";

// Header field codes
const FIELD_PATH: f64 = 1.0;
const FIELD_INTERFACE: f64 = 2.0;
const FIELD_MEMBER: f64 = 3.0;
const FIELD_ERROR_NAME: f64 = 4.0;
const FIELD_REPLY_SERIAL: f64 = 5.0;
const FIELD_DESTINATION: f64 = 6.0;
const FIELD_SENDER: f64 = 7.0;
const FIELD_SIGNATURE: f64 = 8.0;

// Message flags
const FLAG_NO_REPLY_EXPECTED: u8 = 0x01;

/// The four wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    fn from_wire(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::MethodCall),
            2 => Ok(MessageType::MethodReturn),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::Signal),
            other => Err(DBusError::invalid_packet(format!(
                "unsupported message type {other}"
            ))),
        }
    }
}

/// Reply correlation carried by METHOD_RETURN and ERROR messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Serial number of the call being answered
    pub serial: u32,
    /// Error name, present on ERROR only
    pub error_name: Option<String>,
}

/// One D-Bus message, parsed or under construction.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,
    pub endian: Endian,
    pub no_reply_expected: bool,
    /// Assigned at send time by the connection; 0 until then
    pub serial: u32,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub reply: Option<Reply>,
    /// Body signature ("" for an empty body)
    pub signature: String,
    /// Raw body bytes, already marshalled
    pub body: Vec<u8>,
}

impl Message {
    fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            endian: Endian::Little,
            no_reply_expected: false,
            serial: 0,
            path: None,
            interface: None,
            member: None,
            destination: None,
            sender: None,
            reply: None,
            signature: String::new(),
            body: Vec::new(),
        }
    }

    /// A METHOD_CALL addressed to `path`/`interface`/`member`.
    pub fn method_call(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        let mut msg = Self::empty(MessageType::MethodCall);
        msg.path = Some(path.into());
        msg.interface = Some(interface.into());
        msg.member = Some(member.into());
        msg
    }

    /// A SIGNAL emitted from `path` on `interface`.
    pub fn signal(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        let mut msg = Self::empty(MessageType::Signal);
        msg.path = Some(path.into());
        msg.interface = Some(interface.into());
        msg.member = Some(member.into());
        msg
    }

    /// A METHOD_RETURN answering `call`.
    pub fn method_return(call: &Message) -> Self {
        let mut msg = Self::empty(MessageType::MethodReturn);
        msg.reply = Some(Reply {
            serial: call.serial,
            error_name: None,
        });
        msg.destination = call.sender.clone();
        msg
    }

    /// An ERROR answering `call` with the given D-Bus error name.
    pub fn error_reply(call: &Message, error_name: impl Into<String>) -> Self {
        let mut msg = Self::empty(MessageType::Error);
        msg.reply = Some(Reply {
            serial: call.serial,
            error_name: Some(error_name.into()),
        });
        msg.destination = call.sender.clone();
        msg
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Mark the call fire-and-forget; no reply will be delivered.
    pub fn with_no_reply(mut self) -> Self {
        self.no_reply_expected = true;
        self
    }

    /// Marshal `args` against `signature` into the body.
    pub fn with_body(mut self, signature: impl Into<String>, args: &[Value]) -> Result<Self> {
        let signature = signature.into();
        let mut buf = BytesMut::new();
        codec::append(&mut buf, &signature, args)?;
        self.signature = signature;
        self.body = buf.to_vec();
        Ok(self)
    }

    /// Decode the body against the message's own signature.
    pub fn args(&self) -> Result<Vec<Value>> {
        codec::get(&self.body, self.endian, &self.signature)
    }

    /// Serialize the full frame with the given serial number.
    ///
    /// Output is always little-endian regardless of `self.endian` (which
    /// records how an *inbound* message was encoded).
    pub fn to_bytes(&self, serial: u32) -> Result<Vec<u8>> {
        let mut fields: Vec<Value> = Vec::new();
        let mut push = |code: f64, variant: Value| {
            fields.push(Value::Struct(vec![Value::F64(code), variant]));
        };
        if let Some(path) = &self.path {
            push(
                FIELD_PATH,
                Value::variant("o", Value::ObjectPath(path.clone())),
            );
        }
        if let Some(interface) = &self.interface {
            push(
                FIELD_INTERFACE,
                Value::variant("s", Value::Str(interface.clone())),
            );
        }
        if let Some(member) = &self.member {
            push(
                FIELD_MEMBER,
                Value::variant("s", Value::Str(member.clone())),
            );
        }
        if let Some(reply) = &self.reply {
            if let Some(error_name) = &reply.error_name {
                push(
                    FIELD_ERROR_NAME,
                    Value::variant("s", Value::Str(error_name.clone())),
                );
            }
            push(
                FIELD_REPLY_SERIAL,
                Value::variant("u", Value::F64(reply.serial as f64)),
            );
        }
        if let Some(destination) = &self.destination {
            push(
                FIELD_DESTINATION,
                Value::variant("s", Value::Str(destination.clone())),
            );
        }
        if let Some(sender) = &self.sender {
            push(
                FIELD_SENDER,
                Value::variant("s", Value::Str(sender.clone())),
            );
        }
        if !self.signature.is_empty() {
            push(
                FIELD_SIGNATURE,
                Value::variant("g", Value::Signature(self.signature.clone())),
            );
        }

        let mut buf = BytesMut::new();
        codec::append(
            &mut buf,
            HEADER_SIGNATURE,
            &[
                Value::F64(Endian::Little.flag() as f64),
                Value::F64(self.message_type as u8 as f64),
                Value::F64(if self.no_reply_expected {
                    FLAG_NO_REPLY_EXPECTED
                } else {
                    0
                } as f64),
                Value::F64(PROTOCOL_VERSION as f64),
                Value::F64(self.body.len() as f64),
                Value::F64(serial as f64),
                Value::Array(fields),
            ],
        )?;
        // header block pads to 8 before the body starts
        while buf.len() % 8 != 0 {
            buf.put_u8(0);
        }
        buf.extend_from_slice(&self.body);
        Ok(buf.to_vec())
    }

    /// Parse one complete frame.
    ///
    /// `data` must hold exactly the frame: feed it the number of bytes
    /// [`required_length`] reported.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let total = required_length(data)?.ok_or_else(|| {
            DBusError::invalid_packet("frame shorter than the 16-byte preamble".to_string())
        })?;
        if data.len() != total {
            return Err(DBusError::invalid_packet(format!(
                "frame is {} bytes, header says {total}",
                data.len()
            )));
        }
        let endian = Endian::from_flag(data[0])?;
        if data[3] != PROTOCOL_VERSION {
            return Err(DBusError::invalid_packet(format!(
                "unsupported protocol version {}",
                data[3]
            )));
        }
        let message_type = MessageType::from_wire(data[1])?;
        let flags = data[2];

        let fields_len = read_u32_at(data, 12, endian) as usize;
        let header_end = 16 + fields_len;
        let header = codec::get(&data[..header_end], endian, HEADER_SIGNATURE)?;
        // preamble scalars were read manually above; index 4/5/6 are
        // body_length, serial and the field array
        let body_length = header[4].as_f64().unwrap_or(0.0) as usize;
        let serial = header[5].as_f64().unwrap_or(0.0) as u32;

        let mut msg = Self::empty(message_type);
        msg.endian = endian;
        msg.serial = serial;
        msg.no_reply_expected = flags & FLAG_NO_REPLY_EXPECTED != 0;

        let mut reply_serial = None;
        let mut error_name = None;
        let Some(field_structs) = header[6].as_array() else {
            return Err(DBusError::invalid_packet(
                "header field block is not an array".to_string(),
            ));
        };
        for field in field_structs {
            let Value::Struct(pair) = field else {
                return Err(DBusError::invalid_packet(
                    "header field is not a (code, variant) struct".to_string(),
                ));
            };
            if pair.len() != 2 {
                return Err(DBusError::invalid_packet(
                    "header field struct is not a pair".to_string(),
                ));
            }
            let (Some(code), Some(variant)) = (pair[0].as_f64(), pair[1].as_variant()) else {
                return Err(DBusError::invalid_packet(
                    "malformed header field".to_string(),
                ));
            };
            let string = || variant.value.as_str().map(str::to_string);
            if code == FIELD_PATH {
                msg.path = string();
            } else if code == FIELD_INTERFACE {
                msg.interface = string();
            } else if code == FIELD_MEMBER {
                msg.member = string();
            } else if code == FIELD_ERROR_NAME {
                error_name = string();
            } else if code == FIELD_REPLY_SERIAL {
                reply_serial = variant.value.as_f64().map(|v| v as u32);
            } else if code == FIELD_DESTINATION {
                msg.destination = string();
            } else if code == FIELD_SENDER {
                msg.sender = string();
            } else if code == FIELD_SIGNATURE {
                msg.signature = string().unwrap_or_default();
            } else {
                // unknown fields must be ignored, not rejected
                warn!(code, "ignoring unknown header field");
            }
        }

        if matches!(
            message_type,
            MessageType::MethodReturn | MessageType::Error
        ) {
            let serial = reply_serial.ok_or_else(|| {
                DBusError::invalid_packet("reply without a reply-serial field".to_string())
            })?;
            msg.reply = Some(Reply { serial, error_name });
        }

        let body_start = (header_end + 7) & !7;
        if body_start + body_length != data.len() {
            return Err(DBusError::invalid_packet(format!(
                "body length {body_length} does not match frame"
            )));
        }
        if body_length > 0 && msg.signature.is_empty() {
            return Err(DBusError::invalid_packet(
                "non-empty body without a signature field".to_string(),
            ));
        }
        msg.body = data[body_start..].to_vec();
        Ok(msg)
    }
}

/// Total frame length (preamble + padded header fields + body) from the
/// first bytes of a stream.
///
/// Returns `Ok(None)` until 16 bytes are available. Fails only when the
/// endianness flag itself is invalid, which is unrecoverable for the stream.
pub fn required_length(data: &[u8]) -> Result<Option<usize>> {
    if data.len() < 16 {
        return Ok(None);
    }
    let endian = Endian::from_flag(data[0])?;
    let body_length = read_u32_at(data, 4, endian) as usize;
    let fields_len = read_u32_at(data, 12, endian) as usize;
    let body_start = (16 + fields_len + 7) & !7;
    Ok(Some(body_start + body_length))
}

fn read_u32_at(data: &[u8], offset: usize, endian: Endian) -> u32 {
    let bytes: [u8; 4] = data[offset..offset + 4]
        .try_into()
        .expect("caller checked length");
    match endian {
        Endian::Little => u32::from_le_bytes(bytes),
        Endian::Big => u32::from_be_bytes(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_call_roundtrip() {
        let msg = Message::method_call("/org/example/Obj", "org.example.Iface", "DoThing")
            .with_destination("org.example.Service")
            .with_body("si", &[Value::Str("hello".to_string()), Value::F64(42.0)])
            .unwrap();
        let bytes = msg.to_bytes(7).unwrap();

        assert_eq!(required_length(&bytes).unwrap(), Some(bytes.len()));

        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.message_type, MessageType::MethodCall);
        assert_eq!(parsed.serial, 7);
        assert_eq!(parsed.path.as_deref(), Some("/org/example/Obj"));
        assert_eq!(parsed.interface.as_deref(), Some("org.example.Iface"));
        assert_eq!(parsed.member.as_deref(), Some("DoThing"));
        assert_eq!(parsed.destination.as_deref(), Some("org.example.Service"));
        assert_eq!(parsed.signature, "si");
        assert_eq!(
            parsed.args().unwrap(),
            vec![Value::Str("hello".to_string()), Value::F64(42.0)]
        );
    }

    #[test]
    fn test_error_reply_roundtrip() {
        let mut call = Message::method_call("/x", "org.example.I", "M");
        call.serial = 11;
        call.sender = Some(":1.5".to_string());
        let reply = Message::error_reply(&call, "org.freedesktop.DBus.Error.UnknownMethod")
            .with_body("s", &[Value::Str("no such method".to_string())])
            .unwrap();
        let parsed = Message::from_bytes(&reply.to_bytes(12).unwrap()).unwrap();
        assert_eq!(parsed.message_type, MessageType::Error);
        assert_eq!(
            parsed.reply,
            Some(Reply {
                serial: 11,
                error_name: Some("org.freedesktop.DBus.Error.UnknownMethod".to_string()),
            })
        );
        assert_eq!(parsed.destination.as_deref(), Some(":1.5"));
    }

    #[test]
    fn test_empty_body_roundtrip() {
        let msg = Message::method_call(BUS_PATH, BUS_INTERFACE, "Hello")
            .with_destination(BUS_NAME);
        let parsed = Message::from_bytes(&msg.to_bytes(1).unwrap()).unwrap();
        assert_eq!(parsed.signature, "");
        assert!(parsed.body.is_empty());
        assert_eq!(parsed.args().unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn test_no_reply_flag_survives() {
        let msg = Message::method_call("/p", "org.example.I", "Fire").with_no_reply();
        let parsed = Message::from_bytes(&msg.to_bytes(3).unwrap()).unwrap();
        assert!(parsed.no_reply_expected);
    }

    #[test]
    fn test_required_length_incomplete() {
        let msg = Message::signal("/p", "org.example.I", "S");
        let bytes = msg.to_bytes(9).unwrap();
        assert_eq!(required_length(&bytes[..15]).unwrap(), None);
        assert_eq!(required_length(&bytes[..16]).unwrap(), Some(bytes.len()));
    }

    #[test]
    fn test_bad_endian_flag_fatal() {
        let mut bytes = Message::signal("/p", "org.example.I", "S")
            .to_bytes(1)
            .unwrap();
        bytes[0] = b'x';
        assert!(matches!(
            required_length(&bytes),
            Err(DBusError::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut bytes = Message::signal("/p", "org.example.I", "S")
            .to_bytes(1)
            .unwrap();
        bytes[3] = 2;
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(DBusError::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let mut bytes = Message::signal("/p", "org.example.I", "S")
            .to_bytes(1)
            .unwrap();
        bytes[1] = 9;
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(DBusError::InvalidPacket(_))
        ));
    }
}
