//! Text encodings for stream payloads.
//!
//! A stream configured with [`Encoding`] delivers decoded text instead of
//! raw slices, and `write_str` encodes through the shared read pool when
//! the encoded form fits.

use bytes::{Bytes, BytesMut};

/// Text encoding tag for data delivery and string writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// UTF-8. Decoding is lossy on invalid sequences.
    Utf8,
    /// 7-bit ASCII. High bits are masked off in both directions.
    Ascii,
    /// Latin-1: one byte per code point, truncated at 0xFF.
    Latin1,
}

impl Encoding {
    /// Exact number of bytes `encode_into` will append for `s`.
    pub fn byte_length(&self, s: &str) -> usize {
        match self {
            Encoding::Utf8 => s.len(),
            Encoding::Ascii | Encoding::Latin1 => s.chars().count(),
        }
    }

    /// Append the encoded form of `s` to `out`.
    pub fn encode_into(&self, s: &str, out: &mut BytesMut) {
        match self {
            Encoding::Utf8 => out.extend_from_slice(s.as_bytes()),
            Encoding::Ascii => {
                out.extend(s.chars().map(|c| (c as u32 & 0x7f) as u8));
            }
            Encoding::Latin1 => {
                out.extend(s.chars().map(|c| (c as u32 & 0xff) as u8));
            }
        }
    }

    /// Encode `s` into a freshly sized private buffer.
    pub fn encode(&self, s: &str) -> Bytes {
        let mut out = BytesMut::with_capacity(self.byte_length(s));
        self.encode_into(s, &mut out);
        out.freeze()
    }

    /// Decode inbound bytes for a `data` delivery.
    pub fn decode(&self, data: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(data).into_owned(),
            Encoding::Ascii => data.iter().map(|&b| (b & 0x7f) as char).collect(),
            Encoding::Latin1 => data.iter().map(|&b| b as char).collect(),
        }
    }
}
