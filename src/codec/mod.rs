//! D-Bus wire codec
//!
//! Marshals typed argument lists into the D-Bus binary format and back.
//!
//! ## Alignment rules
//!
//! Every value is preceded by zero padding up to its type's alignment
//! (1/2/4/8, see [`crate::types::alignment_of`]): struct and dict-entry
//! containers align to 8 regardless of their first member, array length
//! fields align to 4, and array *elements* follow their own rule (with an
//! extra 8-byte pre-alignment per element for arrays of structs or dict
//! entries). Alignment is measured from the start of the message body; the
//! framing layer guarantees the body itself starts on an 8-byte boundary.
//!
//! ## Value model
//!
//! All integer wire types of width one to four bytes ride as [`Value::F64`].
//! 64-bit integers (`x`, `t`) and unix fds (`h`) are intentionally
//! unsupported: an IEEE-754 double cannot carry them without precision loss,
//! so the codec rejects those signatures outright rather than corrupting
//! values silently.
//!
//! ## Rollback
//!
//! [`append`] either writes a complete, well-formed encoding or leaves the
//! buffer untouched. Callers bank on this: a failed marshal must never leave
//! half a value in an outgoing message.

use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::error::{DBusError, Result};
use crate::types::{
    alignment_of, fixed_int_size, is_signed_int, is_single_complete_type,
    is_string_like_type, split_signature,
};

/// Byte order of a message, from its endianness flag (`l` or `B`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Parse the endianness flag byte of a message preamble.
    pub fn from_flag(flag: u8) -> Result<Self> {
        match flag {
            b'l' => Ok(Endian::Little),
            b'B' => Ok(Endian::Big),
            other => Err(DBusError::invalid_packet(format!(
                "unknown endianness flag 0x{other:02x}"
            ))),
        }
    }

    /// The flag byte for this byte order.
    pub fn flag(self) -> u8 {
        match self {
            Endian::Little => b'l',
            Endian::Big => b'B',
        }
    }
}

/// A self-describing (signature, value) pair.
///
/// The signature must be a single complete type; [`append`] enforces this
/// when the variant is marshalled.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub signature: String,
    pub value: Value,
}

impl Variant {
    pub fn new(signature: impl Into<String>, value: Value) -> Self {
        Self {
            signature: signature.into(),
            value,
        }
    }
}

/// A decoded D-Bus value.
///
/// Dictionaries keep insertion order as (key, value) pairs rather than using
/// a map type, so round-trips are byte-order stable. Arrays of bytes (`ay`)
/// decode into [`Value::Bytes`] as a fast path instead of a `Vec` of `F64`s.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Any integer type of width <= 4, and `d` (double)
    F64(f64),
    Bool(bool),
    Str(String),
    ObjectPath(String),
    Signature(String),
    /// Byte-array fast path (`ay`)
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Variant(Box<Variant>),
}

impl Value {
    /// Wrap a value in a variant with the given signature.
    pub fn variant(signature: impl Into<String>, value: Value) -> Self {
        Value::Variant(Box::new(Variant::new(signature, value)))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Dict(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&Variant> {
        match self {
            Value::Variant(v) => Some(v),
            _ => None,
        }
    }

    /// Short shape name used in mismatch diagnostics.
    fn shape(&self) -> &'static str {
        match self {
            Value::F64(_) => "number",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::ObjectPath(_) => "object path",
            Value::Signature(_) => "signature",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Dict(_) => "dict",
            Value::Variant(_) => "variant",
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::F64(v as f64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::F64(v as f64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Marshal `args` against `signature` onto the end of `buf`.
///
/// One argument is consumed per top-level complete type. On any error the
/// buffer is truncated back to its pre-call length.
///
/// # Errors
///
/// - `InvalidSignature` - malformed signature, or a 64-bit/fd type
/// - `InvalidArgument` - arity mismatch, or a value whose shape does not
///   match its declared type
pub fn append(buf: &mut BytesMut, signature: &str, args: &[Value]) -> Result<()> {
    let rollback = buf.len();
    let result = append_inner(buf, signature, args);
    if result.is_err() {
        buf.truncate(rollback);
    }
    result
}

fn append_inner(buf: &mut BytesMut, signature: &str, args: &[Value]) -> Result<()> {
    let parts = split_signature(signature).ok_or_else(|| {
        DBusError::invalid_signature(format!("malformed signature {signature:?}"))
    })?;
    if parts.len() != args.len() {
        return Err(DBusError::invalid_argument(format!(
            "signature {signature:?} takes {} arguments, {} supplied",
            parts.len(),
            args.len()
        )));
    }
    for (part, arg) in parts.iter().zip(args) {
        append_one(buf, part, arg)?;
    }
    Ok(())
}

fn append_one(buf: &mut BytesMut, sig: &str, value: &Value) -> Result<()> {
    let c = sig.as_bytes()[0];
    match c {
        b'x' | b't' | b'h' => Err(unsupported_type(c)),
        b'b' => {
            let v = value.as_bool().ok_or_else(|| shape_error(sig, value))?;
            pad_to(buf, 4);
            buf.put_u32_le(v as u32);
            Ok(())
        }
        b'd' => {
            let v = value.as_f64().ok_or_else(|| shape_error(sig, value))?;
            pad_to(buf, 8);
            buf.put_f64_le(v);
            Ok(())
        }
        _ if fixed_int_size(c).is_some() => {
            let v = value.as_f64().ok_or_else(|| shape_error(sig, value))?;
            let width = fixed_int_size(c).unwrap();
            append_int(buf, v, width, is_signed_int(c))
        }
        _ if is_string_like_type(c) => {
            let s = value.as_str().ok_or_else(|| shape_error(sig, value))?;
            if c == b'g' {
                if s.len() > u8::MAX as usize {
                    return Err(DBusError::invalid_argument(
                        "signature string longer than 255 bytes".to_string(),
                    ));
                }
                buf.put_u8(s.len() as u8);
            } else {
                pad_to(buf, 4);
                buf.put_u32_le(s.len() as u32);
            }
            buf.put_slice(s.as_bytes());
            buf.put_u8(0);
            Ok(())
        }
        b'a' => append_array(buf, &sig[1..], value),
        b'(' => {
            let fields = match value {
                Value::Struct(fields) => fields,
                _ => return Err(shape_error(sig, value)),
            };
            pad_to(buf, 8);
            let inner = &sig[1..sig.len() - 1];
            append_inner(buf, inner, fields)
        }
        b'{' => {
            // outside an array frame a dict entry is a single pair
            let entries = value.as_dict().ok_or_else(|| shape_error(sig, value))?;
            if entries.len() != 1 {
                return Err(DBusError::invalid_argument(format!(
                    "bare dict entry {sig:?} takes exactly one pair, {} supplied",
                    entries.len()
                )));
            }
            append_dict_entries(buf, sig, value)
        }
        b'v' => {
            let var = value.as_variant().ok_or_else(|| shape_error(sig, value))?;
            if !is_single_complete_type(&var.signature) {
                return Err(DBusError::invalid_signature(format!(
                    "variant signature {:?} is not a single complete type",
                    var.signature
                )));
            }
            append_one(buf, "g", &Value::Signature(var.signature.clone()))?;
            append_one(buf, &var.signature, &var.value)
        }
        other => Err(DBusError::invalid_signature(format!(
            "unknown type character {:?}",
            other as char
        ))),
    }
}

fn append_array(buf: &mut BytesMut, elem_sig: &str, value: &Value) -> Result<()> {
    pad_to(buf, 4);
    let len_pos = buf.len();
    buf.put_u32_le(0); // backpatched below
    pad_to(buf, alignment_of(elem_sig.as_bytes()[0]));
    let start = buf.len();

    match (elem_sig.as_bytes()[0], value) {
        // byte-array fast path
        (b'y', Value::Bytes(bytes)) => buf.put_slice(bytes),
        (b'{', Value::Dict(_)) => append_dict_entries(buf, elem_sig, value)?,
        (_, Value::Array(elems)) => {
            for elem in elems {
                append_one(buf, elem_sig, elem)?;
            }
        }
        _ => return Err(shape_error(elem_sig, value)),
    }

    let measured = (buf.len() - start) as u32;
    buf[len_pos..len_pos + 4].copy_from_slice(&measured.to_le_bytes());
    Ok(())
}

/// Write dict entries without an enclosing array frame; the caller supplies
/// the `a` frame (or deliberately omits it for a bare `{kv}` signature).
fn append_dict_entries(buf: &mut BytesMut, entry_sig: &str, value: &Value) -> Result<()> {
    let entries = value.as_dict().ok_or_else(|| shape_error(entry_sig, value))?;
    let inner = &entry_sig[1..entry_sig.len() - 1];
    let key_end = crate::types::next_single_complete_type_idx(inner, 0);
    if key_end == crate::types::INVALID_TYPE_IDX {
        return Err(DBusError::invalid_signature(format!(
            "malformed dict entry {entry_sig:?}"
        )));
    }
    let (key_sig, val_sig) = inner.split_at(key_end);
    if !crate::types::is_basic_type(key_sig.as_bytes()[0]) || key_sig.len() != 1 {
        return Err(DBusError::invalid_signature(format!(
            "dict key {key_sig:?} is not a basic type"
        )));
    }
    for (k, v) in entries {
        pad_to(buf, 8);
        append_one(buf, key_sig, k)?;
        append_one(buf, val_sig, v)?;
    }
    Ok(())
}

fn append_int(buf: &mut BytesMut, value: f64, width: usize, signed: bool) -> Result<()> {
    if width > 4 {
        return Err(DBusError::invalid_signature(
            "64-bit integers are not supported".to_string(),
        ));
    }
    let bits = width as u32 * 8;
    if signed {
        let (min, max) = (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1);
        let v = value as i64;
        if value.fract() != 0.0 || v < min || v > max {
            return Err(DBusError::invalid_argument(format!(
                "{value} out of range for {width}-byte signed integer"
            )));
        }
        pad_to(buf, width);
        // two's complement for the given width
        let raw = (v as u64) & (u64::MAX >> (64 - bits));
        buf.put_slice(&raw.to_le_bytes()[..width]);
    } else {
        let max = (1u64 << bits) - 1;
        let v = value as u64;
        if value.fract() != 0.0 || value < 0.0 || v > max {
            return Err(DBusError::invalid_argument(format!(
                "{value} out of range for {width}-byte unsigned integer"
            )));
        }
        pad_to(buf, width);
        buf.put_slice(&v.to_le_bytes()[..width]);
    }
    Ok(())
}

fn pad_to(buf: &mut BytesMut, align: usize) {
    while buf.len() % align != 0 {
        buf.put_u8(0);
    }
}

fn shape_error(sig: &str, value: &Value) -> DBusError {
    DBusError::invalid_argument(format!(
        "cannot marshal {} as {sig:?}",
        value.shape()
    ))
}

fn unsupported_type(c: u8) -> DBusError {
    DBusError::invalid_signature(format!(
        "type {:?} is not supported (64-bit integers / fd passing)",
        c as char
    ))
}

/// Unmarshal `signature` from `data`.
///
/// Returns one decoded value per top-level complete type, in order. The body
/// must be consumed exactly; trailing bytes mean the signature and body
/// disagree and the frame is rejected.
pub fn get(data: &[u8], endian: Endian, signature: &str) -> Result<Vec<Value>> {
    let mut reader = Reader {
        data,
        pos: 0,
        endian,
    };
    let parts = split_signature(signature).ok_or_else(|| {
        DBusError::invalid_signature(format!("malformed signature {signature:?}"))
    })?;
    let mut values = Vec::with_capacity(parts.len());
    for part in parts {
        values.push(reader.read_one(part)?);
    }
    if reader.pos != data.len() {
        return Err(DBusError::invalid_packet(format!(
            "{} trailing bytes after decoding {signature:?}",
            data.len() - reader.pos
        )));
    }
    Ok(values)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl Reader<'_> {
    fn align(&mut self, align: usize) -> Result<()> {
        while self.pos % align != 0 {
            self.take(1)?;
        }
        Ok(())
    }

    fn take(&mut self, count: usize) -> Result<&[u8]> {
        if self.pos + count > self.data.len() {
            return Err(DBusError::invalid_packet(format!(
                "body truncated at offset {}",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    /// Assemble an unsigned integer of `width` bytes in the message's byte
    /// order, then reconstruct the signed value via two's complement on the
    /// assembled word when `signed` is set.
    fn read_int(&mut self, width: usize, signed: bool) -> Result<f64> {
        self.align(width)?;
        let endian = self.endian;
        let bytes = self.take(width)?;
        let mut raw: u64 = 0;
        match endian {
            Endian::Little => {
                for (i, &b) in bytes.iter().enumerate() {
                    raw |= (b as u64) << (8 * i);
                }
            }
            Endian::Big => {
                for &b in bytes {
                    raw = (raw << 8) | b as u64;
                }
            }
        }
        if signed {
            let bits = width as u32 * 8;
            let sign_bit = 1u64 << (bits - 1);
            let value = if raw & sign_bit != 0 {
                raw as i64 - (1i64 << bits)
            } else {
                raw as i64
            };
            Ok(value as f64)
        } else {
            Ok(raw as f64)
        }
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_int(4, false)? as u32)
    }

    fn read_string(&mut self, len_width: usize) -> Result<String> {
        let len = if len_width == 1 {
            self.take(1)?[0] as usize
        } else {
            self.align(4)?;
            self.read_u32()? as usize
        };
        let bytes = self.take(len)?.to_vec();
        let nul = self.take(1)?[0];
        if nul != 0 {
            return Err(DBusError::invalid_packet(
                "string missing nul terminator".to_string(),
            ));
        }
        String::from_utf8(bytes)
            .map_err(|_| DBusError::invalid_packet("string is not valid UTF-8".to_string()))
    }

    fn read_one(&mut self, sig: &str) -> Result<Value> {
        let c = sig.as_bytes()[0];
        match c {
            b'x' | b't' | b'h' => Err(unsupported_type(c)),
            b'b' => {
                self.align(4)?;
                Ok(Value::Bool(self.read_u32()? != 0))
            }
            b'd' => {
                self.align(8)?;
                let bytes = self.take(8)?;
                let arr: [u8; 8] = bytes.try_into().expect("take returned 8 bytes");
                let v = match self.endian {
                    Endian::Little => f64::from_le_bytes(arr),
                    Endian::Big => f64::from_be_bytes(arr),
                };
                Ok(Value::F64(v))
            }
            _ if fixed_int_size(c).is_some() => {
                let width = fixed_int_size(c).unwrap();
                if width > 4 {
                    return Err(unsupported_type(c));
                }
                Ok(Value::F64(self.read_int(width, is_signed_int(c))?))
            }
            b's' => Ok(Value::Str(self.read_string(4)?)),
            b'o' => Ok(Value::ObjectPath(self.read_string(4)?)),
            b'g' => Ok(Value::Signature(self.read_string(1)?)),
            b'a' => self.read_array(&sig[1..]),
            b'(' => {
                self.align(8)?;
                let inner = &sig[1..sig.len() - 1];
                let parts = split_signature(inner).ok_or_else(|| {
                    DBusError::invalid_signature(format!("malformed struct {sig:?}"))
                })?;
                let mut fields = Vec::with_capacity(parts.len());
                for part in parts {
                    fields.push(self.read_one(part)?);
                }
                Ok(Value::Struct(fields))
            }
            b'{' => {
                let (key_sig, val_sig) = dict_entry_sigs(sig)?;
                self.align(8)?;
                let key = self.read_one(key_sig)?;
                let val = self.read_one(val_sig)?;
                Ok(Value::Dict(vec![(key, val)]))
            }
            b'v' => {
                let var_sig = self.read_string(1)?;
                if !is_single_complete_type(&var_sig) {
                    return Err(DBusError::invalid_signature(format!(
                        "variant signature {var_sig:?} is not a single complete type"
                    )));
                }
                let value = self.read_one(&var_sig)?;
                Ok(Value::variant(var_sig, value))
            }
            other => Err(DBusError::invalid_signature(format!(
                "unknown type character {:?}",
                other as char
            ))),
        }
    }

    fn read_array(&mut self, elem_sig: &str) -> Result<Value> {
        self.align(4)?;
        let byte_len = self.read_u32()? as usize;
        self.align(alignment_of(elem_sig.as_bytes()[0]))?;
        let end = self.pos + byte_len;
        if end > self.data.len() {
            return Err(DBusError::invalid_packet(format!(
                "array length {byte_len} exceeds body at offset {}",
                self.pos
            )));
        }

        // byte-array fast path: one flat buffer, not a list of numbers
        if elem_sig == "y" {
            let bytes = self.take(byte_len)?.to_vec();
            return Ok(Value::Bytes(bytes));
        }

        if elem_sig.as_bytes()[0] == b'{' {
            let (key_sig, val_sig) = dict_entry_sigs(elem_sig)?;
            let mut entries = Vec::new();
            while self.pos < end {
                self.align(8)?;
                let key = self.read_one(key_sig)?;
                let val = self.read_one(val_sig)?;
                entries.push((key, val));
            }
            if self.pos != end {
                return Err(array_overrun(elem_sig, self.pos, end));
            }
            return Ok(Value::Dict(entries));
        }

        let mut elems = Vec::new();
        while self.pos < end {
            elems.push(self.read_one(elem_sig)?);
        }
        if self.pos != end {
            return Err(array_overrun(elem_sig, self.pos, end));
        }
        trace!(elements = elems.len(), sig = elem_sig, "decoded array");
        Ok(Value::Array(elems))
    }
}

fn dict_entry_sigs(sig: &str) -> Result<(&str, &str)> {
    let inner = &sig[1..sig.len() - 1];
    let key_end = crate::types::next_single_complete_type_idx(inner, 0);
    if key_end == crate::types::INVALID_TYPE_IDX || key_end >= inner.len() {
        return Err(DBusError::invalid_signature(format!(
            "malformed dict entry {sig:?}"
        )));
    }
    let (key_sig, val_sig) = inner.split_at(key_end);
    if !crate::types::is_basic_type(key_sig.as_bytes()[0]) {
        return Err(DBusError::invalid_signature(format!(
            "dict key {key_sig:?} is not a basic type"
        )));
    }
    Ok((key_sig, val_sig))
}

fn array_overrun(elem_sig: &str, pos: usize, end: usize) -> DBusError {
    DBusError::invalid_packet(format!(
        "array of {elem_sig:?} overran its length field (pos {pos}, end {end})"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(sig: &str, values: Vec<Value>) {
        let mut buf = BytesMut::new();
        append(&mut buf, sig, &values).unwrap();
        let decoded = get(&buf, Endian::Little, sig).unwrap();
        assert_eq!(decoded, values, "round-trip failed for {sig:?}");
    }

    #[test]
    fn test_roundtrip_basic_scalars() {
        roundtrip("y", vec![Value::F64(200.0)]);
        roundtrip("n", vec![Value::F64(-1234.0)]);
        roundtrip("q", vec![Value::F64(65535.0)]);
        roundtrip("i", vec![Value::F64(-42.0)]);
        roundtrip("u", vec![Value::F64(4000000000.0)]);
        roundtrip("d", vec![Value::F64(3.25)]);
        roundtrip("b", vec![Value::Bool(true), ]);
    }

    #[test]
    fn test_roundtrip_strings() {
        roundtrip("s", vec![Value::Str("hello world".to_string())]);
        roundtrip("o", vec![Value::ObjectPath("/org/example/Obj".to_string())]);
        roundtrip("g", vec![Value::Signature("a{sv}".to_string())]);
        roundtrip("s", vec![Value::Str(String::new())]);
    }

    #[test]
    fn test_roundtrip_string_int_pair() {
        roundtrip(
            "si",
            vec![Value::Str("hello".to_string()), Value::F64(42.0)],
        );
    }

    #[test]
    fn test_roundtrip_containers() {
        roundtrip(
            "ai",
            vec![Value::Array(vec![
                Value::F64(1.0),
                Value::F64(-2.0),
                Value::F64(3.0),
            ])],
        );
        roundtrip(
            "aai",
            vec![Value::Array(vec![
                Value::Array(vec![Value::F64(1.0)]),
                Value::Array(vec![]),
            ])],
        );
        roundtrip(
            "(sib)",
            vec![Value::Struct(vec![
                Value::Str("x".to_string()),
                Value::F64(7.0),
                Value::Bool(false),
            ])],
        );
        roundtrip(
            "a(su)",
            vec![Value::Array(vec![
                Value::Struct(vec![Value::Str("a".to_string()), Value::F64(1.0)]),
                Value::Struct(vec![Value::Str("bb".to_string()), Value::F64(2.0)]),
            ])],
        );
    }

    #[test]
    fn test_roundtrip_dict_of_variants() {
        roundtrip(
            "a{sv}",
            vec![Value::Dict(vec![
                (
                    Value::Str("Name".to_string()),
                    Value::variant("s", Value::Str("Device".to_string())),
                ),
                (
                    Value::Str("RSSI".to_string()),
                    Value::variant("i", Value::F64(-67.0)),
                ),
                (
                    Value::Str("Connected".to_string()),
                    Value::variant("b", Value::Bool(true)),
                ),
            ])],
        );
    }

    #[test]
    fn test_bare_dict_entry_is_a_single_pair() {
        roundtrip(
            "{ss}",
            vec![Value::Dict(vec![(
                Value::Str("key".to_string()),
                Value::Str("value".to_string()),
            )])],
        );
        // multiple pairs only make sense inside an array frame
        let mut buf = BytesMut::new();
        let err = append(
            &mut buf,
            "{ss}",
            &[Value::Dict(vec![
                (Value::Str("a".to_string()), Value::Str("1".to_string())),
                (Value::Str("b".to_string()), Value::Str("2".to_string())),
            ])],
        )
        .unwrap_err();
        assert!(matches!(err, DBusError::InvalidArgument(_)));
        assert!(buf.is_empty(), "rejected append left bytes behind");
    }

    #[test]
    fn test_roundtrip_byte_array_fast_path() {
        let mut buf = BytesMut::new();
        append(&mut buf, "ay", &[Value::Bytes(vec![1, 2, 3, 255])]).unwrap();
        let decoded = get(&buf, Endian::Little, "ay").unwrap();
        assert_eq!(decoded, vec![Value::Bytes(vec![1, 2, 3, 255])]);
    }

    #[test]
    fn test_alignment_of_basic_types() {
        // after appending a basic type of width N the cursor is a multiple of N
        for (sig, value, width) in [
            ("y", Value::F64(1.0), 1),
            ("n", Value::F64(1.0), 2),
            ("u", Value::F64(1.0), 4),
            ("d", Value::F64(1.0), 8),
        ] {
            let mut buf = BytesMut::new();
            buf.put_u8(0xAA); // start misaligned
            append(&mut buf, sig, &[value]).unwrap();
            assert_eq!(buf.len() % width, 0, "cursor misaligned after {sig}");
        }
    }

    #[test]
    fn test_struct_starts_at_eight_byte_boundary() {
        let mut buf = BytesMut::new();
        append(&mut buf, "y(yy)", &[
            Value::F64(1.0),
            Value::Struct(vec![Value::F64(2.0), Value::F64(3.0)]),
        ])
        .unwrap();
        // byte at 0, struct padded to offset 8
        assert_eq!(buf.len(), 10);
        assert_eq!(&buf[..], &[1, 0, 0, 0, 0, 0, 0, 0, 2, 3]);
    }

    #[test]
    fn test_int64_rejected() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            append(&mut buf, "x", &[Value::F64(1.0)]),
            Err(DBusError::InvalidSignature(_))
        ));
        assert!(matches!(
            append(&mut buf, "t", &[Value::F64(1.0)]),
            Err(DBusError::InvalidSignature(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_rollback_on_shape_mismatch() {
        let mut buf = BytesMut::new();
        append(&mut buf, "u", &[Value::F64(5.0)]).unwrap();
        let len = buf.len();
        // second argument has the wrong shape; first must not leak out
        let err = append(
            &mut buf,
            "us",
            &[Value::F64(1.0), Value::Bool(true)],
        )
        .unwrap_err();
        assert!(matches!(err, DBusError::InvalidArgument(_)));
        assert_eq!(buf.len(), len);
    }

    #[test]
    fn test_rollback_on_arity_mismatch() {
        let mut buf = BytesMut::new();
        let err = append(&mut buf, "ss", &[Value::Str("one".to_string())]).unwrap_err();
        assert!(matches!(err, DBusError::InvalidArgument(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_out_of_range_int_rejected() {
        let mut buf = BytesMut::new();
        assert!(append(&mut buf, "y", &[Value::F64(300.0)]).is_err());
        assert!(append(&mut buf, "n", &[Value::F64(40000.0)]).is_err());
        assert!(append(&mut buf, "u", &[Value::F64(-1.0)]).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_signed_reconstruction_big_endian() {
        // -2 as a big-endian i16
        let data = [0xFF, 0xFE];
        let values = get(&data, Endian::Big, "n").unwrap();
        assert_eq!(values, vec![Value::F64(-2.0)]);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buf = BytesMut::new();
        append(&mut buf, "u", &[Value::F64(9.0)]).unwrap();
        buf.put_u8(0);
        assert!(matches!(
            get(&buf, Endian::Little, "u"),
            Err(DBusError::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let mut buf = BytesMut::new();
        append(&mut buf, "s", &[Value::Str("hello".to_string())]).unwrap();
        assert!(matches!(
            get(&buf[..buf.len() - 2], Endian::Little, "s"),
            Err(DBusError::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_variant_requires_single_complete_signature() {
        let mut buf = BytesMut::new();
        let err = append(
            &mut buf,
            "v",
            &[Value::variant("ii", Value::Struct(vec![]))],
        )
        .unwrap_err();
        assert!(matches!(err, DBusError::InvalidSignature(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_dict_key_must_be_basic() {
        let mut buf = BytesMut::new();
        let err = append(&mut buf, "a{vs}", &[Value::Dict(vec![])]).unwrap_err();
        assert!(matches!(err, DBusError::InvalidSignature(_)));
    }
}
