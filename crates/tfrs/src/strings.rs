//! Byte layout of string tensors.
//!
//! A string tensor of `n` elements is laid out as:
//!
//! ```text
//! [u64 offset; n] | varint len_0, bytes_0 | varint len_1, bytes_1 | ...
//! ```
//!
//! Offsets are native-endian and relative to the end of the offset table. Each
//! element starts with its byte length as a base-128 varint. A scalar holding a
//! string shorter than 128 bytes therefore carries a 9-byte prefix: one 8-byte
//! offset and a single varint byte.

use crate::error::{Error, Result};

/// How an engine stores the elements of a string tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringLayout {
    /// Offset table followed by varint-prefixed bytes, handled by this module.
    OffsetTable,
    /// Fixed-size inline string records owned by the engine; not readable here.
    TString,
}

impl StringLayout {
    pub fn is_supported(self) -> bool {
        self == StringLayout::OffsetTable
    }

    /// Fails with `UnsupportedDtype` when string tensors cannot be marshaled.
    pub(crate) fn require_supported(self) -> Result<()> {
        match self {
            StringLayout::OffsetTable => Ok(()),
            StringLayout::TString => Err(Error::UnsupportedDtype {
                dtype: "string (tstring layout)".to_string(),
                tensor: None,
            }),
        }
    }
}

const OFFSET_SIZE: usize = std::mem::size_of::<u64>();

/// Longest varint accepted for a u64 length.
const MAX_VARINT_LEN: usize = 10;

/// Encodes `values` into the engine's string tensor layout.
pub fn encode(values: &[String]) -> Vec<u8> {
    let table_len = values.len() * OFFSET_SIZE;
    let mut out = Vec::with_capacity(encoded_len(values));
    out.resize(table_len, 0);
    for (index, value) in values.iter().enumerate() {
        let offset = (out.len() - table_len) as u64;
        out[index * OFFSET_SIZE..(index + 1) * OFFSET_SIZE].copy_from_slice(&offset.to_ne_bytes());
        write_varint(value.len() as u64, &mut out);
        out.extend_from_slice(value.as_bytes());
    }
    out
}

/// Returns the byte length `encode` would produce for `values`.
pub fn encoded_len(values: &[String]) -> usize {
    values
        .iter()
        .map(|value| OFFSET_SIZE + varint_len(value.len() as u64) + value.len())
        .sum()
}

/// Decodes `count` strings from a buffer in the engine's string tensor layout.
pub fn decode(bytes: &[u8], count: usize) -> Result<Vec<String>> {
    let table_len = count
        .checked_mul(OFFSET_SIZE)
        .ok_or_else(|| Error::decode("string offset table overflows usize"))?;
    if bytes.len() < table_len {
        return Err(Error::decode(format!(
            "string buffer of {} bytes cannot hold {count} offsets",
            bytes.len()
        )));
    }
    let (table, payload) = bytes.split_at(table_len);

    let mut values = Vec::with_capacity(count);
    for (index, entry) in table.chunks_exact(OFFSET_SIZE).enumerate() {
        let mut raw = [0u8; OFFSET_SIZE];
        raw.copy_from_slice(entry);
        let offset = usize::try_from(u64::from_ne_bytes(raw))
            .ok()
            .filter(|offset| *offset < payload.len())
            .ok_or_else(|| {
                Error::decode(format!("string element {index} offset is out of bounds"))
            })?;
        let (len, header) = read_varint(&payload[offset..])
            .ok_or_else(|| Error::decode(format!("string element {index} has a bad length")))?;
        let start = offset + header;
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| start.checked_add(len))
            .filter(|end| *end <= payload.len())
            .ok_or_else(|| Error::decode(format!("string element {index} overruns the buffer")))?;
        let text = std::str::from_utf8(&payload[start..end]).map_err(|err| {
            Error::decode(format!("string element {index} is not valid UTF-8: {err}"))
        })?;
        values.push(text.to_string());
    }
    Ok(values)
}

fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Returns the decoded value and the number of bytes consumed.
fn read_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (index, byte) in bytes.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            return Some((value, index + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_scalar_has_nine_byte_prefix() {
        let bytes = encode(&["hello".to_string()]);
        assert_eq!(bytes.len(), 9 + 5);
        assert_eq!(&bytes[..8], &0u64.to_ne_bytes());
        assert_eq!(bytes[8], 5);
        assert_eq!(&bytes[9..], b"hello");
    }

    #[test]
    fn long_strings_use_multibyte_lengths() {
        let long = "x".repeat(300);
        let bytes = encode(&[long.clone()]);
        assert_eq!(bytes.len(), encoded_len(&[long.clone()]));
        assert_eq!(&bytes[8..10], &[0xac, 0x02]);
        assert_eq!(decode(&bytes, 1).unwrap(), vec![long]);
    }

    #[test]
    fn decodes_each_element_through_its_offset() {
        let values = vec!["a".to_string(), String::new(), "grüße".to_string()];
        let bytes = encode(&values);
        assert_eq!(decode(&bytes, 3).unwrap(), values);
    }

    #[test]
    fn rejects_truncated_payloads() {
        let mut bytes = encode(&["truncate me".to_string()]);
        bytes.truncate(12);
        assert!(matches!(decode(&bytes, 1), Err(Error::Decode { .. })));
        assert!(matches!(decode(&bytes[..4], 1), Err(Error::Decode { .. })));
    }

    #[test]
    fn rejects_invalid_utf8() {
        let mut bytes = 0u64.to_ne_bytes().to_vec();
        bytes.extend_from_slice(&[2, 0xff, 0xfe]);
        assert!(matches!(decode(&bytes, 1), Err(Error::Decode { .. })));
    }
}
