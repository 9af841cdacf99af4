//! AMF0 values, as used by RTMP commands and FLV script tags.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read};

const NUMBER: u8 = 0x00;
const BOOLEAN: u8 = 0x01;
const STRING: u8 = 0x02;
const OBJECT: u8 = 0x03;
const NULL: u8 = 0x05;
const UNDEFINED: u8 = 0x06;
const ECMA_ARRAY: u8 = 0x08;
const OBJECT_END: u8 = 0x09;

#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    EcmaArray(Vec<(String, Amf0Value)>),
    Null,
    Undefined,
}

impl Amf0Value {
    pub fn string(s: impl Into<String>) -> Self {
        Amf0Value::String(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Amf0Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Property lookup on objects and ECMA arrays.
    pub fn get(&self, key: &str) -> Option<&Amf0Value> {
        match self {
            Amf0Value::Object(props) | Amf0Value::EcmaArray(props) => {
                props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }
}

pub fn encode_value(out: &mut Vec<u8>, value: &Amf0Value) {
    // Writes into a Vec cannot fail.
    match value {
        Amf0Value::Number(n) => {
            out.push(NUMBER);
            let _ = out.write_f64::<BigEndian>(*n);
        }
        Amf0Value::Boolean(b) => {
            out.push(BOOLEAN);
            out.push(u8::from(*b));
        }
        Amf0Value::String(s) => {
            out.push(STRING);
            write_utf8(out, s);
        }
        Amf0Value::Object(props) => {
            out.push(OBJECT);
            write_properties(out, props);
        }
        Amf0Value::EcmaArray(props) => {
            out.push(ECMA_ARRAY);
            let _ = out.write_u32::<BigEndian>(props.len() as u32);
            write_properties(out, props);
        }
        Amf0Value::Null => out.push(NULL),
        Amf0Value::Undefined => out.push(UNDEFINED),
    }
}

pub fn encode_all(values: &[Amf0Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        encode_value(&mut out, v);
    }
    out
}

fn write_utf8(out: &mut Vec<u8>, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(u16::MAX as usize)];
    let _ = out.write_u16::<BigEndian>(bytes.len() as u16);
    out.extend_from_slice(bytes);
}

fn write_properties(out: &mut Vec<u8>, props: &[(String, Amf0Value)]) {
    for (key, value) in props {
        write_utf8(out, key);
        encode_value(out, value);
    }
    out.extend_from_slice(&[0, 0, OBJECT_END]);
}

/// Decode every value in `bytes`.
pub fn decode_all(bytes: &[u8]) -> io::Result<Vec<Amf0Value>> {
    let mut cursor = Cursor::new(bytes);
    let mut values = Vec::new();
    while (cursor.position() as usize) < bytes.len() {
        values.push(decode_value(&mut cursor)?);
    }
    Ok(values)
}

fn decode_value(cursor: &mut Cursor<&[u8]>) -> io::Result<Amf0Value> {
    match cursor.read_u8()? {
        NUMBER => Ok(Amf0Value::Number(cursor.read_f64::<BigEndian>()?)),
        BOOLEAN => Ok(Amf0Value::Boolean(cursor.read_u8()? != 0)),
        STRING => Ok(Amf0Value::String(read_utf8(cursor)?)),
        OBJECT => Ok(Amf0Value::Object(read_properties(cursor)?)),
        ECMA_ARRAY => {
            let _count = cursor.read_u32::<BigEndian>()?;
            Ok(Amf0Value::EcmaArray(read_properties(cursor)?))
        }
        NULL => Ok(Amf0Value::Null),
        UNDEFINED => Ok(Amf0Value::Undefined),
        marker => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported AMF0 marker 0x{marker:02x}"),
        )),
    }
}

fn read_utf8(cursor: &mut Cursor<&[u8]>) -> io::Result<String> {
    let len = cursor.read_u16::<BigEndian>()? as usize;
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "AMF0 string truncated"));
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn read_properties(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec<(String, Amf0Value)>> {
    let mut props = Vec::new();
    loop {
        let key = read_utf8(cursor)?;
        if key.is_empty() {
            let marker = cursor.read_u8()?;
            if marker == OBJECT_END {
                return Ok(props);
            }
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "empty AMF0 property name",
            ));
        }
        props.push((key, decode_value(cursor)?));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_connect_style_command() {
        let bytes = encode_all(&[
            Amf0Value::string("connect"),
            Amf0Value::Number(1.0),
        ]);
        assert_eq!(&bytes[..3], &[STRING, 0x00, 0x07]);
        assert_eq!(&bytes[3..10], b"connect");
        assert_eq!(bytes[10], NUMBER);
        assert_eq!(&bytes[11..19], &1.0f64.to_be_bytes());
    }

    #[test]
    fn decodes_status_object() {
        let values = vec![
            Amf0Value::string("onStatus"),
            Amf0Value::Number(0.0),
            Amf0Value::Null,
            Amf0Value::Object(vec![
                ("level".into(), Amf0Value::string("status")),
                ("code".into(), Amf0Value::string("NetStream.Publish.Start")),
            ]),
        ];
        let decoded = decode_all(&encode_all(&values)).unwrap();
        assert_eq!(decoded, values);
        assert_eq!(
            decoded[3].get("code").and_then(Amf0Value::as_str),
            Some("NetStream.Publish.Start")
        );
    }

    #[test]
    fn ecma_array_carries_its_count() {
        let mut out = Vec::new();
        encode_value(
            &mut out,
            &Amf0Value::EcmaArray(vec![("duration".into(), Amf0Value::Number(0.0))]),
        );
        assert_eq!(&out[..5], &[ECMA_ARRAY, 0, 0, 0, 1]);
        assert_eq!(&out[out.len() - 3..], &[0, 0, OBJECT_END]);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let bytes = encode_all(&[Amf0Value::string("publish")]);
        assert!(decode_all(&bytes[..bytes.len() - 2]).is_err());
        assert!(decode_all(&[0x11]).is_err());
    }
}
