//! Binary External Term Format encoding
//!
//! Compact binary alternative to JSON frames. Decoding canonicalizes every
//! integer stored under an `id` or `*_id` key to its decimal string so that
//! 64-bit snowflakes survive any downstream numeric representation.

use crate::error::CodecError;
use crate::gateway::codec::Codec;
use flate2::read::ZlibDecoder;
use serde_json::{Map, Number, Value};
use std::io::Read;
use tokio_tungstenite::tungstenite::Message;

const FORMAT_VERSION: u8 = 131;

const NEW_FLOAT_EXT: u8 = 70;
const COMPRESSED: u8 = 80;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const FLOAT_EXT: u8 = 99;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const LARGE_BIG_EXT: u8 = 111;
const SMALL_ATOM_EXT: u8 = 115;
const MAP_EXT: u8 = 116;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

/// Nesting limit for decoded terms
const MAX_DEPTH: usize = 256;

/// Upper bound for the declared size of a compressed term
const MAX_INFLATED_TERM_BYTES: usize = 64 << 20;

/// External Term Format codec
#[derive(Debug, Clone, Copy, Default)]
pub struct EtfCodec;

impl EtfCodec {
    pub const NAME: &'static str = "etf";

    pub fn new() -> Self {
        Self
    }

    /// Probe whether this target can carry 64-bit ids natively
    pub fn supported() -> Result<(), CodecError> {
        if usize::BITS < 64 {
            return Err(CodecError::Unsupported {
                name: Self::NAME,
                reason: format!("requires a 64-bit target, found {}-bit", usize::BITS),
            });
        }
        Ok(())
    }
}

impl Codec for EtfCodec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn decode(&self, data: &[u8]) -> Result<Value, CodecError> {
        let mut reader = Reader::new(data);
        let version = reader.u8()?;
        if version != FORMAT_VERSION {
            return Err(CodecError::decode(
                Self::NAME,
                format!("unexpected format version {version}"),
            ));
        }
        let value = reader.term(0)?;
        if !reader.is_empty() {
            return Err(CodecError::decode(
                Self::NAME,
                format!("{} trailing bytes after term", reader.remaining()),
            ));
        }
        Ok(value)
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(64);
        out.push(FORMAT_VERSION);
        encode_term(value, &mut out)?;
        Ok(out)
    }

    fn frame(&self, value: &Value) -> Result<Message, CodecError> {
        Ok(Message::Binary(self.encode(value)?))
    }
}

fn is_id_key(key: &str) -> bool {
    key == "id" || key.ends_with("_id")
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::decode(
                EtfCodec::NAME,
                format!("unexpected end of data at offset {}", self.pos),
            ));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn utf8(&mut self, len: usize) -> Result<String, CodecError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CodecError::decode(EtfCodec::NAME, format!("invalid utf-8: {e}")))
    }

    fn latin1(&mut self, len: usize) -> Result<String, CodecError> {
        Ok(self.take(len)?.iter().map(|&b| char::from(b)).collect())
    }

    fn term(&mut self, depth: usize) -> Result<Value, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::decode(EtfCodec::NAME, "term nesting too deep"));
        }

        let tag = self.u8()?;
        match tag {
            SMALL_INTEGER_EXT => Ok(Value::from(self.u8()?)),
            INTEGER_EXT => {
                let b = self.take(4)?;
                Ok(Value::from(i32::from_be_bytes([b[0], b[1], b[2], b[3]])))
            }
            NEW_FLOAT_EXT => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok(Value::from(f64::from_be_bytes(raw)))
            }
            FLOAT_EXT => {
                let raw = self.latin1(31)?;
                let parsed: f64 = raw
                    .trim_end_matches('\0')
                    .trim()
                    .parse()
                    .map_err(|_| CodecError::decode(EtfCodec::NAME, "invalid float string"))?;
                Ok(Value::from(parsed))
            }
            ATOM_EXT => {
                let len = self.u16()? as usize;
                let atom = self.latin1(len)?;
                Ok(atom_value(atom))
            }
            SMALL_ATOM_EXT => {
                let len = self.u8()? as usize;
                let atom = self.latin1(len)?;
                Ok(atom_value(atom))
            }
            ATOM_UTF8_EXT => {
                let len = self.u16()? as usize;
                let atom = self.utf8(len)?;
                Ok(atom_value(atom))
            }
            SMALL_ATOM_UTF8_EXT => {
                let len = self.u8()? as usize;
                let atom = self.utf8(len)?;
                Ok(atom_value(atom))
            }
            SMALL_TUPLE_EXT => {
                let arity = self.u8()? as usize;
                Ok(Value::Array(self.elements(arity, depth)?))
            }
            LARGE_TUPLE_EXT => {
                let arity = self.u32()? as usize;
                Ok(Value::Array(self.elements(arity, depth)?))
            }
            NIL_EXT => Ok(Value::Array(Vec::new())),
            STRING_EXT => {
                let len = self.u16()? as usize;
                let bytes = self.take(len)?;
                Ok(Value::Array(bytes.iter().map(|&b| Value::from(b)).collect()))
            }
            LIST_EXT => {
                let len = self.u32()? as usize;
                let mut items = self.elements(len, depth)?;
                // Proper lists end in NIL; an improper tail is kept as a last element.
                match self.term(depth + 1)? {
                    Value::Array(tail) if tail.is_empty() => {}
                    tail => items.push(tail),
                }
                Ok(Value::Array(items))
            }
            BINARY_EXT => {
                let len = self.u32()? as usize;
                Ok(Value::String(self.utf8(len)?))
            }
            SMALL_BIG_EXT => {
                let n = self.u8()? as usize;
                self.big(n)
            }
            LARGE_BIG_EXT => {
                let n = self.u32()? as usize;
                self.big(n)
            }
            MAP_EXT => {
                let arity = self.u32()? as usize;
                let mut map = Map::new();
                for _ in 0..arity {
                    let key = match self.term(depth + 1)? {
                        Value::String(s) => s,
                        Value::Number(n) => n.to_string(),
                        other => {
                            return Err(CodecError::decode(
                                EtfCodec::NAME,
                                format!("unsupported map key {other}"),
                            ))
                        }
                    };
                    let mut value = self.term(depth + 1)?;
                    if is_id_key(&key) {
                        if let Value::Number(ref n) = value {
                            if n.is_i64() || n.is_u64() {
                                value = Value::String(n.to_string());
                            }
                        }
                    }
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
            COMPRESSED => {
                let size = self.u32()? as usize;
                if size > MAX_INFLATED_TERM_BYTES {
                    return Err(CodecError::decode(
                        EtfCodec::NAME,
                        format!("compressed term too large ({size} bytes)"),
                    ));
                }
                let rest = self.take(self.remaining())?;
                let mut inflated = Vec::with_capacity(size);
                ZlibDecoder::new(rest)
                    .take(size as u64)
                    .read_to_end(&mut inflated)
                    .map_err(|e| CodecError::Decompress {
                        compression: "etf-zlib",
                        reason: e.to_string(),
                    })?;
                let mut inner = Reader::new(&inflated);
                let value = inner.term(depth + 1)?;
                Ok(value)
            }
            other => Err(CodecError::decode(
                EtfCodec::NAME,
                format!("unsupported term tag {other}"),
            )),
        }
    }

    fn elements(&mut self, count: usize, depth: usize) -> Result<Vec<Value>, CodecError> {
        // Each element takes at least one byte; reject counts the buffer cannot hold.
        if count > self.remaining() {
            return Err(CodecError::decode(
                EtfCodec::NAME,
                format!("declared {count} elements with {} bytes left", self.remaining()),
            ));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.term(depth + 1)?);
        }
        Ok(items)
    }

    /// Arbitrary-size integer: sign byte followed by little-endian digits.
    fn big(&mut self, n: usize) -> Result<Value, CodecError> {
        let negative = self.u8()? != 0;
        let digits = self.take(n)?;

        if n <= 8 {
            let mut magnitude: u64 = 0;
            for (i, &b) in digits.iter().enumerate() {
                magnitude |= u64::from(b) << (8 * i);
            }
            if !negative {
                return Ok(Value::Number(Number::from(magnitude)));
            }
            if magnitude <= i64::MAX as u64 + 1 {
                let signed = (-(i128::from(magnitude))) as i64;
                return Ok(Value::Number(Number::from(signed)));
            }
        }

        // Wider than 64 bits: keep every digit as a decimal string.
        let decimal = big_to_decimal(digits);
        Ok(Value::String(if negative {
            format!("-{decimal}")
        } else {
            decimal
        }))
    }
}

fn atom_value(atom: String) -> Value {
    match atom.as_str() {
        "nil" | "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(atom),
    }
}

/// Convert little-endian base-256 digits to a base-10 string.
fn big_to_decimal(digits: &[u8]) -> String {
    let mut limbs: Vec<u32> = digits.iter().rev().map(|&b| u32::from(b)).collect();
    let mut out = Vec::new();

    while limbs.iter().any(|&l| l != 0) {
        let mut rem = 0u32;
        for limb in &mut limbs {
            let acc = (rem << 8) | *limb;
            *limb = acc / 10;
            rem = acc % 10;
        }
        out.push(b'0' + rem as u8);
    }

    if out.is_empty() {
        return "0".to_string();
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn encode_atom(atom: &str, out: &mut Vec<u8>) {
    out.push(SMALL_ATOM_UTF8_EXT);
    out.push(atom.len() as u8);
    out.extend_from_slice(atom.as_bytes());
}

fn encode_binary(s: &str, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let len = u32::try_from(s.len())
        .map_err(|_| CodecError::encode(EtfCodec::NAME, "binary longer than u32::MAX"))?;
    out.push(BINARY_EXT);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn encode_small_big(negative: bool, magnitude: u64, out: &mut Vec<u8>) {
    let bytes = magnitude.to_le_bytes();
    let len = bytes.iter().rposition(|&b| b != 0).map_or(1, |i| i + 1);
    out.push(SMALL_BIG_EXT);
    out.push(len as u8);
    out.push(u8::from(negative));
    out.extend_from_slice(&bytes[..len]);
}

fn encode_term(value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match value {
        Value::Null => encode_atom("nil", out),
        Value::Bool(b) => encode_atom(if *b { "true" } else { "false" }, out),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                if let Ok(small) = u8::try_from(u) {
                    out.push(SMALL_INTEGER_EXT);
                    out.push(small);
                } else if let Ok(int) = i32::try_from(u) {
                    out.push(INTEGER_EXT);
                    out.extend_from_slice(&int.to_be_bytes());
                } else {
                    encode_small_big(false, u, out);
                }
            } else if let Some(i) = n.as_i64() {
                if let Ok(int) = i32::try_from(i) {
                    out.push(INTEGER_EXT);
                    out.extend_from_slice(&int.to_be_bytes());
                } else {
                    encode_small_big(i < 0, i.unsigned_abs(), out);
                }
            } else if let Some(f) = n.as_f64() {
                out.push(NEW_FLOAT_EXT);
                out.extend_from_slice(&f.to_be_bytes());
            } else {
                return Err(CodecError::encode(EtfCodec::NAME, format!("unrepresentable number {n}")));
            }
        }
        Value::String(s) => encode_binary(s, out)?,
        Value::Array(items) => {
            if items.is_empty() {
                out.push(NIL_EXT);
            } else {
                let len = u32::try_from(items.len())
                    .map_err(|_| CodecError::encode(EtfCodec::NAME, "list longer than u32::MAX"))?;
                out.push(LIST_EXT);
                out.extend_from_slice(&len.to_be_bytes());
                for item in items {
                    encode_term(item, out)?;
                }
                out.push(NIL_EXT);
            }
        }
        Value::Object(map) => {
            let len = u32::try_from(map.len())
                .map_err(|_| CodecError::encode(EtfCodec::NAME, "map larger than u32::MAX"))?;
            out.push(MAP_EXT);
            out.extend_from_slice(&len.to_be_bytes());
            for (key, item) in map {
                encode_binary(key, out)?;
                encode_term(item, out)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;

    fn small_big(negative: bool, digits: &[u8]) -> Vec<u8> {
        let mut out = vec![SMALL_BIG_EXT, digits.len() as u8, u8::from(negative)];
        out.extend_from_slice(digits);
        out
    }

    fn map_with(key: &str, value_term: &[u8]) -> Vec<u8> {
        let mut out = vec![FORMAT_VERSION, MAP_EXT, 0, 0, 0, 1];
        encode_binary(key, &mut out).unwrap();
        out.extend_from_slice(value_term);
        out
    }

    #[test]
    fn test_round_trip_nested_structures() {
        let codec = EtfCodec::new();
        let message = json!({
            "op": 0,
            "s": 1234567,
            "t": "GUILD_CREATE",
            "d": {
                "name": "Test Guild",
                "member_count": 42,
                "afk_timeout": -300,
                "ratio": 0.75,
                "large": true,
                "icon": null,
                "features": [],
                "roles": [{"name": "everyone", "position": 0, "color": 16711680}],
                "big": 9007199254740993_u64,
                "negative_big": -9007199254740993_i64
            }
        });
        let bytes = codec.encode(&message).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_max_u64_id_decodes_to_exact_string() {
        let term = small_big(false, &u64::MAX.to_le_bytes());
        let data = map_with("id", &term);
        let decoded = EtfCodec.decode(&data).unwrap();
        assert_eq!(decoded, json!({"id": "18446744073709551615"}));
    }

    #[test]
    fn test_suffix_id_keys_are_stringified_at_any_depth() {
        let codec = EtfCodec::new();
        let encoded = codec
            .encode(&json!({
                "d": {
                    "guild_id": 81384788765712384_u64,
                    "members": [{"user": {"id": 80351110224678912_u64}}],
                    "count": 5,
                    "hidden": 3
                }
            }))
            .unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded["d"]["guild_id"], json!("81384788765712384"));
        assert_eq!(decoded["d"]["members"][0]["user"]["id"], json!("80351110224678912"));
        assert_eq!(decoded["d"]["count"], json!(5));
    }

    #[test]
    fn test_small_ints_under_id_key_become_strings() {
        let data = map_with("channel_id", &[SMALL_INTEGER_EXT, 7]);
        assert_eq!(EtfCodec.decode(&data).unwrap(), json!({"channel_id": "7"}));
    }

    #[test]
    fn test_wider_than_64_bit_integer_keeps_digits() {
        // 2^72
        let mut digits = vec![0u8; 9];
        digits[8] = 1;
        let data = map_with("value", &small_big(false, &digits));
        assert_eq!(
            EtfCodec.decode(&data).unwrap(),
            json!({"value": "4722366482869645213696"})
        );
    }

    #[test]
    fn test_atoms_map_to_literals() {
        let mut data = vec![FORMAT_VERSION, ATOM_EXT, 0, 3];
        data.extend_from_slice(b"nil");
        assert_eq!(EtfCodec.decode(&data).unwrap(), Value::Null);

        let mut data = vec![FORMAT_VERSION, SMALL_ATOM_EXT, 5];
        data.extend_from_slice(b"READY");
        assert_eq!(EtfCodec.decode(&data).unwrap(), json!("READY"));
    }

    #[test]
    fn test_compressed_term() {
        let inner = EtfCodec.encode(&json!({"t": "READY"})).unwrap();
        let body = &inner[1..];
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut data = vec![FORMAT_VERSION, COMPRESSED];
        data.extend_from_slice(&(body.len() as u32).to_be_bytes());
        data.extend_from_slice(&compressed);
        assert_eq!(EtfCodec.decode(&data).unwrap(), json!({"t": "READY"}));
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        assert!(EtfCodec.decode(&[]).is_err());
        assert!(EtfCodec.decode(&[130, SMALL_INTEGER_EXT, 1]).is_err());
        assert!(EtfCodec.decode(&[FORMAT_VERSION, BINARY_EXT, 0, 0, 0, 9, b'a']).is_err());
        assert!(EtfCodec.decode(&[FORMAT_VERSION, 42]).is_err());
        assert!(EtfCodec
            .decode(&[FORMAT_VERSION, LIST_EXT, 0xff, 0xff, 0xff, 0xff])
            .is_err());
    }

    #[test]
    fn test_supported_on_64_bit() {
        assert!(EtfCodec::supported().is_ok());
        assert!(matches!(EtfCodec.frame(&json!({})).unwrap(), Message::Binary(_)));
    }
}
