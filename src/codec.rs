use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{format_addr, FiveTuple};

const IPV6_BYTES: usize = 16;
const PORT_BYTES: usize = 2;
const PROTO_BYTES: usize = 1;

/// Largest possible key: SrcIP(16) + DstIP(16) + SrcPort(2) + DstPort(2) + Protocol(1).
pub const MAX_KEY_LEN: usize = 37;

/// A 5-tuple field selectable as part of a flow or element key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    SrcIp,
    DstIp,
    SrcPort,
    DstPort,
    Protocol,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "SrcIP" => Some(Self::SrcIp),
            "DstIP" => Some(Self::DstIp),
            "SrcPort" => Some(Self::SrcPort),
            "DstPort" => Some(Self::DstPort),
            "Protocol" => Some(Self::Protocol),
            _ => None,
        }
    }

    /// Configuration-facing name of the field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SrcIp => "SrcIP",
            Self::DstIp => "DstIP",
            Self::SrcPort => "SrcPort",
            Self::DstPort => "DstPort",
            Self::Protocol => "Protocol",
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            Self::SrcIp | Self::DstIp => IPV6_BYTES,
            Self::SrcPort | Self::DstPort => PORT_BYTES,
            Self::Protocol => PROTO_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown key field: {0}")]
    UnknownField(String),
    #[error("empty field list")]
    Empty,
}

/// Packs an ordered subset of 5-tuple fields into a fixed-width big-endian
/// byte key and decodes keys back to a printable form. The key width is fixed
/// at construction; sketches use it to size fingerprint storage.
#[derive(Debug, Clone)]
pub struct FieldCodec {
    fields: Vec<Field>,
    key_len: usize,
}

impl FieldCodec {
    pub fn new(names: &[String]) -> Result<Self, CodecError> {
        if names.is_empty() {
            return Err(CodecError::Empty);
        }

        let mut fields = Vec::with_capacity(names.len());
        for name in names {
            let field = Field::parse(name).ok_or_else(|| CodecError::UnknownField(name.clone()))?;
            fields.push(field);
        }

        let key_len = fields.iter().map(Field::byte_len).sum();
        Ok(Self { fields, key_len })
    }

    /// Encoded key width in bytes.
    pub fn key_len(&self) -> usize {
        self.key_len
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Encodes the selected fields of `ft` into `buf`, which must hold at
    /// least `key_len()` bytes. Returns the number of bytes written.
    pub fn encode(&self, ft: &FiveTuple, buf: &mut [u8]) -> usize {
        let mut offset = 0;
        for field in &self.fields {
            match field {
                Field::SrcIp => {
                    buf[offset..offset + IPV6_BYTES].copy_from_slice(&ft.src_ip);
                    offset += IPV6_BYTES;
                }
                Field::DstIp => {
                    buf[offset..offset + IPV6_BYTES].copy_from_slice(&ft.dst_ip);
                    offset += IPV6_BYTES;
                }
                Field::SrcPort => {
                    buf[offset..offset + PORT_BYTES].copy_from_slice(&ft.src_port.to_be_bytes());
                    offset += PORT_BYTES;
                }
                Field::DstPort => {
                    buf[offset..offset + PORT_BYTES].copy_from_slice(&ft.dst_port.to_be_bytes());
                    offset += PORT_BYTES;
                }
                Field::Protocol => {
                    buf[offset] = ft.protocol;
                    offset += PROTO_BYTES;
                }
            }
        }
        offset
    }

    /// Encodes into a freshly allocated key.
    pub fn encode_vec(&self, ft: &FiveTuple) -> Vec<u8> {
        let mut buf = vec![0u8; self.key_len];
        self.encode(ft, &mut buf);
        buf
    }

    /// Decodes each field of an encoded key into its printable value, in
    /// field order. Short keys yield only the fields that fit.
    pub fn decode_parts(&self, key: &[u8]) -> Vec<String> {
        let mut parts = Vec::with_capacity(self.fields.len());
        let mut offset = 0;

        for field in &self.fields {
            let end = offset + field.byte_len();
            if end > key.len() {
                break;
            }
            let part = match field {
                Field::SrcIp | Field::DstIp => {
                    let mut addr = [0u8; 16];
                    addr.copy_from_slice(&key[offset..end]);
                    format_addr(&addr)
                }
                Field::SrcPort | Field::DstPort => {
                    u16::from_be_bytes([key[offset], key[offset + 1]]).to_string()
                }
                Field::Protocol => key[offset].to_string(),
            };
            parts.push(part);
            offset = end;
        }

        parts
    }

    /// Decodes an encoded key to a space-joined printable representation.
    pub fn decode(&self, key: &[u8]) -> String {
        self.decode_parts(key).join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::normalize_addr;

    fn tuple() -> FiveTuple {
        FiveTuple {
            src_ip: normalize_addr(&[10, 0, 0, 1]).unwrap(),
            dst_ip: normalize_addr(&[8, 8, 8, 8]).unwrap(),
            src_port: 12345,
            dst_port: 53,
            protocol: 17,
        }
    }

    fn codec(names: &[&str]) -> FieldCodec {
        let owned: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        FieldCodec::new(&owned).expect("valid fields")
    }

    #[test]
    fn test_key_len_per_field() {
        assert_eq!(codec(&["SrcIP"]).key_len(), 16);
        assert_eq!(codec(&["SrcPort", "DstPort"]).key_len(), 4);
        assert_eq!(
            codec(&["SrcIP", "DstIP", "SrcPort", "DstPort", "Protocol"]).key_len(),
            MAX_KEY_LEN
        );
    }

    #[test]
    fn test_unknown_field_is_error() {
        let err = FieldCodec::new(&["TTL".to_string()]).unwrap_err();
        assert!(matches!(err, CodecError::UnknownField(f) if f == "TTL"));
    }

    #[test]
    fn test_ports_are_big_endian() {
        let c = codec(&["SrcPort", "DstPort", "Protocol"]);
        let key = c.encode_vec(&tuple());
        assert_eq!(key, vec![0x30, 0x39, 0x00, 0x35, 17]);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let c = codec(&["SrcIP", "DstPort", "Protocol"]);
        let key = c.encode_vec(&tuple());
        assert_eq!(key.len(), c.key_len());
        assert_eq!(c.decode(&key), "10.0.0.1 53 17");
    }

    #[test]
    fn test_key_determinism() {
        let c = codec(&["SrcIP"]);
        let a = c.encode_vec(&tuple());

        let mut other = tuple();
        other.dst_port = 9999;
        // Differs only outside the key field subset.
        assert_eq!(a, c.encode_vec(&other));

        other.src_ip = normalize_addr(&[10, 0, 0, 2]).unwrap();
        assert_ne!(a, c.encode_vec(&other));
    }

    #[test]
    fn test_decode_parts_order_matches_fields() {
        let c = codec(&["Protocol", "SrcIP"]);
        let key = c.encode_vec(&tuple());
        assert_eq!(c.decode_parts(&key), vec!["17", "10.0.0.1"]);
    }
}
