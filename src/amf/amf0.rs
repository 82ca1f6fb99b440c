//! AMF0 encoder and decoder
//!
//! Reference: AMF0 File Format Specification
//!
//! Type markers handled here:
//! ```text
//! 0x00 Number      0x01 Boolean     0x02 String       0x03 Object
//! 0x05 Null        0x06 Undefined   0x07 Reference    0x08 ECMA Array
//! 0x09 Object End  0x0A Strict Arr  0x0B Date         0x0C Long String
//! 0x0D Unsupported 0x0F XML         0x10 Typed Object
//! ```
//!
//! The decoder only ever sees server replies (`_result`, `onStatus`, ...),
//! so it is lenient: unknown markers decode as `Undefined` and a missing
//! object-end marker at the end of the buffer is tolerated.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::AmfValue;
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_REFERENCE: u8 = 0x07;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;
const MARKER_UNSUPPORTED: u8 = 0x0D;
const MARKER_XML_DOCUMENT: u8 = 0x0F;
const MARKER_TYPED_OBJECT: u8 = 0x10;

/// Guard against hostile payloads blowing the stack
const MAX_NESTING_DEPTH: usize = 64;

/// AMF0 decoder
pub struct Amf0Decoder {
    references: Vec<AmfValue>,
    lenient: bool,
    depth: usize,
}

impl Amf0Decoder {
    pub fn new() -> Self {
        Self::with_lenient(true)
    }

    pub fn with_lenient(lenient: bool) -> Self {
        Self {
            references: Vec::new(),
            lenient,
            depth: 0,
        }
    }

    /// Decode one value
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if !buf.has_remaining() {
            return Err(AmfError::UnexpectedEof);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(AmfError::NestingTooDeep);
        }

        let marker = buf.get_u8();
        let result = self.decode_value(marker, buf);
        self.depth -= 1;
        result
    }

    /// Decode values until the buffer is exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => {
                ensure(buf, 8)?;
                Ok(AmfValue::Number(buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                ensure(buf, 1)?;
                Ok(AmfValue::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => Ok(AmfValue::String(read_utf8(buf)?)),
            MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(buf)?)),
            MARKER_XML_DOCUMENT => Ok(AmfValue::String(read_utf8_long(buf)?)),
            MARKER_OBJECT => {
                let slot = self.reserve_reference();
                let props = self.decode_properties(buf)?;
                Ok(self.fill_reference(slot, AmfValue::Object(props)))
            }
            MARKER_TYPED_OBJECT => {
                let _class_name = read_utf8(buf)?;
                let slot = self.reserve_reference();
                let props = self.decode_properties(buf)?;
                Ok(self.fill_reference(slot, AmfValue::Object(props)))
            }
            MARKER_ECMA_ARRAY => {
                ensure(buf, 4)?;
                // Count is only a hint; the end marker terminates
                let _count = buf.get_u32();
                let slot = self.reserve_reference();
                let props = self.decode_properties(buf)?;
                Ok(self.fill_reference(slot, AmfValue::EcmaArray(props)))
            }
            MARKER_STRICT_ARRAY => {
                ensure(buf, 4)?;
                let count = buf.get_u32() as usize;
                let slot = self.reserve_reference();
                let mut elements = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    elements.push(self.decode(buf)?);
                }
                Ok(self.fill_reference(slot, AmfValue::StrictArray(elements)))
            }
            MARKER_DATE => {
                ensure(buf, 10)?;
                let millis = buf.get_f64();
                let _timezone = buf.get_i16();
                Ok(AmfValue::Date(millis))
            }
            MARKER_REFERENCE => {
                ensure(buf, 2)?;
                let index = buf.get_u16();
                self.references
                    .get(index as usize)
                    .cloned()
                    .ok_or(AmfError::InvalidReference(index))
            }
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED | MARKER_UNSUPPORTED => Ok(AmfValue::Undefined),
            other if self.lenient => {
                tracing::debug!(marker = other, "Skipping unknown AMF0 marker");
                Ok(AmfValue::Undefined)
            }
            other => Err(AmfError::UnknownMarker(other)),
        }
    }

    fn decode_properties(
        &mut self,
        buf: &mut Bytes,
    ) -> Result<Vec<(String, AmfValue)>, AmfError> {
        let mut props = Vec::new();
        loop {
            if self.lenient && !buf.has_remaining() {
                // Some servers truncate the trailing 0x00 0x00 0x09
                break;
            }
            let key = read_utf8(buf)?;
            if key.is_empty() {
                if !buf.has_remaining() {
                    if self.lenient {
                        break;
                    }
                    return Err(AmfError::UnexpectedEof);
                }
                let end = buf.get_u8();
                if end != MARKER_OBJECT_END && !self.lenient {
                    return Err(AmfError::InvalidObjectEnd);
                }
                break;
            }
            let value = self.decode(buf)?;
            props.push((key, value));
        }
        Ok(props)
    }

    fn reserve_reference(&mut self) -> usize {
        self.references.push(AmfValue::Null);
        self.references.len() - 1
    }

    fn fill_reference(&mut self, slot: usize, value: AmfValue) -> AmfValue {
        self.references[slot] = value.clone();
        value
    }
}

impl Default for Amf0Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure(buf: &Bytes, n: usize) -> Result<(), AmfError> {
    if buf.remaining() < n {
        Err(AmfError::UnexpectedEof)
    } else {
        Ok(())
    }
}

fn read_utf8(buf: &mut Bytes) -> Result<String, AmfError> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    ensure(buf, len)?;
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

fn read_utf8_long(buf: &mut Bytes) -> Result<String, AmfError> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len)?;
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// AMF0 encoder
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Take the encoded bytes, leaving the encoder empty for reuse
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(u8::from(*b));
            }
            AmfValue::String(s) if s.len() > 0xFFFF => {
                self.buf.put_u8(MARKER_LONG_STRING);
                self.buf.put_u32(s.len() as u32);
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::String(s) => {
                self.buf.put_u8(MARKER_STRING);
                self.write_utf8(s);
            }
            AmfValue::Object(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.write_properties(props);
            }
            AmfValue::Null => self.buf.put_u8(MARKER_NULL),
            AmfValue::Undefined => self.buf.put_u8(MARKER_UNDEFINED),
            AmfValue::EcmaArray(props) => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(props.len() as u32);
                self.write_properties(props);
            }
            AmfValue::StrictArray(elements) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(elements.len() as u32);
                for element in elements {
                    self.encode(element);
                }
            }
            AmfValue::Date(millis) => {
                self.buf.put_u8(MARKER_DATE);
                self.buf.put_f64(*millis);
                self.buf.put_i16(0);
            }
        }
    }

    pub fn encode_all(&mut self, values: &[AmfValue]) {
        for value in values {
            self.encode(value);
        }
    }

    fn write_properties(&mut self, props: &[(String, AmfValue)]) {
        for (key, value) in props {
            self.write_utf8(key);
            self.encode(value);
        }
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }

    /// Short string body without a marker; keys longer than 64K are truncated
    fn write_utf8(&mut self, s: &str) {
        let len = s.len().min(0xFFFF);
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&s.as_bytes()[..len]);
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a sequence of values into one buffer
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values);
    encoder.finish()
}

/// Decode every value in `data`
pub fn decode_all(data: Bytes) -> Result<Vec<AmfValue>, AmfError> {
    let mut buf = data;
    Amf0Decoder::new().decode_all(&mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_command_layout() {
        let cmd = vec![
            AmfValue::from("connect"),
            AmfValue::from(1.0),
            AmfValue::object([("app", "live")]),
        ];
        let encoded = encode_all(&cmd);

        // "connect" string marker + length
        assert_eq!(&encoded[..3], &[MARKER_STRING, 0x00, 0x07]);
        assert_eq!(&encoded[3..10], b"connect");
        // Number marker for the transaction id
        assert_eq!(encoded[10], MARKER_NUMBER);
        // Object ends with 00 00 09
        assert_eq!(&encoded[encoded.len() - 3..], &[0x00, 0x00, MARKER_OBJECT_END]);

        assert_eq!(decode_all(encoded).unwrap(), cmd);
    }

    #[test]
    fn test_on_status_reply_decodes() {
        let reply = vec![
            AmfValue::from("onStatus"),
            AmfValue::from(0.0),
            AmfValue::Null,
            AmfValue::object([
                ("level", "status"),
                ("code", "NetStream.Publish.Start"),
                ("description", "Start publishing"),
            ]),
        ];
        let decoded = decode_all(encode_all(&reply)).unwrap();
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[3].get_string("code"), Some("NetStream.Publish.Start"));
    }

    #[test]
    fn test_metadata_ecma_array() {
        let meta = AmfValue::ecma_array([
            ("width", AmfValue::from(1280.0)),
            ("height", AmfValue::from(720.0)),
            ("encoder", AmfValue::from("rtmp-screencast")),
        ]);
        let encoded = encode_all(std::slice::from_ref(&meta));
        assert_eq!(encoded[0], MARKER_ECMA_ARRAY);
        // Count hint
        assert_eq!(&encoded[1..5], &[0, 0, 0, 3]);
        assert_eq!(decode_all(encoded).unwrap(), vec![meta]);
    }

    #[test]
    fn test_long_string_uses_long_marker() {
        let long = "x".repeat(70_000);
        let encoded = encode_all(&[AmfValue::String(long.clone())]);
        assert_eq!(encoded[0], MARKER_LONG_STRING);
        assert_eq!(decode_all(encoded).unwrap(), vec![AmfValue::String(long)]);
    }

    #[test]
    fn test_typed_object_decodes_as_object() {
        let mut raw = BytesMut::new();
        raw.put_u8(MARKER_TYPED_OBJECT);
        raw.put_u16(5);
        raw.put_slice(b"Point");
        raw.put_u16(1);
        raw.put_slice(b"x");
        raw.put_u8(MARKER_NUMBER);
        raw.put_f64(3.0);
        raw.put_u16(0);
        raw.put_u8(MARKER_OBJECT_END);

        let decoded = decode_all(raw.freeze()).unwrap();
        assert_eq!(decoded[0].get_number("x"), Some(3.0));
    }

    #[test]
    fn test_missing_object_end_is_tolerated() {
        let mut raw = BytesMut::new();
        raw.put_u8(MARKER_OBJECT);
        raw.put_u16(4);
        raw.put_slice(b"code");
        raw.put_u8(MARKER_STRING);
        raw.put_u16(2);
        raw.put_slice(b"ok");

        let decoded = decode_all(raw.freeze()).unwrap();
        assert_eq!(decoded[0].get_string("code"), Some("ok"));
    }

    #[test]
    fn test_reference_resolves_earlier_object() {
        let mut raw = BytesMut::new();
        raw.put_u8(MARKER_OBJECT);
        raw.put_u16(1);
        raw.put_slice(b"a");
        raw.put_u8(MARKER_BOOLEAN);
        raw.put_u8(1);
        raw.put_u16(0);
        raw.put_u8(MARKER_OBJECT_END);
        raw.put_u8(MARKER_REFERENCE);
        raw.put_u16(0);

        let decoded = decode_all(raw.freeze()).unwrap();
        assert_eq!(decoded[0], decoded[1]);
    }

    #[test]
    fn test_truncated_number_errors() {
        let result = decode_all(Bytes::from_static(&[MARKER_NUMBER, 0x40, 0x45]));
        assert_eq!(result, Err(AmfError::UnexpectedEof));
    }

    #[test]
    fn test_unknown_marker_strict_vs_lenient() {
        assert_eq!(
            decode_all(Bytes::from_static(&[0xEE])).unwrap(),
            vec![AmfValue::Undefined]
        );

        let mut strict = Amf0Decoder::with_lenient(false);
        let mut buf = Bytes::from_static(&[0xEE]);
        assert_eq!(strict.decode(&mut buf), Err(AmfError::UnknownMarker(0xEE)));
    }

    #[test]
    fn test_nesting_limit() {
        let mut value = AmfValue::object(Vec::<(String, AmfValue)>::new());
        for _ in 0..70 {
            value = AmfValue::object([("nested", value)]);
        }
        let result = decode_all(encode_all(&[value]));
        assert_eq!(result, Err(AmfError::NestingTooDeep));
    }

    #[test]
    fn test_encoder_finish_resets() {
        let mut encoder = Amf0Encoder::new();
        assert!(encoder.is_empty());
        encoder.encode(&AmfValue::Null);
        assert_eq!(encoder.len(), 1);
        let out = encoder.finish();
        assert_eq!(&out[..], &[MARKER_NULL]);
        assert!(encoder.is_empty());
    }
}
