//! RFC 7541 §6 encoder: picks the cheapest representation for each header
//! field and keeps a dynamic table mirroring what the peer decoder holds.

use super::huffman;
use super::integer::encode_integer;
use super::table::{lookup, DynamicTable, Match};
use crate::headers::HeaderList;
use bytes::Bytes;

/// Headers this client never inserts into the dynamic table, encoded instead
/// as "literal, never indexed" (RFC 7541 §6.2.3) so that a strict
/// intermediary is told not to retransmit them in cleartext either.
fn is_sensitive(name: &str) -> bool {
    matches!(name, "authorization" | "cookie" | "set-cookie" | "proxy-authorization")
}

/// Stateful per-connection HPACK encoder.
pub struct Encoder {
    dynamic: DynamicTable,
    pending_size_update: Option<usize>,
}

impl Encoder {
    #[must_use]
    pub fn new(max_dynamic_size: usize) -> Self {
        Self { dynamic: DynamicTable::new(max_dynamic_size), pending_size_update: None }
    }

    /// Queue a dynamic table size change (driven by the peer's
    /// `SETTINGS_HEADER_TABLE_SIZE`), emitted as the first representation of
    /// the next header block encoded.
    pub fn set_max_dynamic_size(&mut self, max_size: usize) {
        self.pending_size_update = Some(max_size);
    }

    /// Encode `headers` into a single HPACK block. The caller is responsible
    /// for splitting the result across HEADERS/CONTINUATION frames.
    pub fn encode(&mut self, headers: &HeaderList) -> Bytes {
        let mut buf = Vec::new();

        if let Some(max_size) = self.pending_size_update.take() {
            self.dynamic.set_max_size(max_size);
            encode_integer(&mut buf, max_size as u32, 5, 0b0010_0000);
        }

        for (name, value) in headers.iter() {
            self.encode_field(&mut buf, name, value);
        }

        Bytes::from(buf)
    }

    fn encode_field(&mut self, buf: &mut Vec<u8>, name: &str, value: &str) {
        match lookup(&self.dynamic, name, value) {
            Match::Full(index) => {
                encode_integer(buf, index as u32, 7, 0b1000_0000);
            }
            Match::NameOnly(index) if is_sensitive(name) => {
                encode_integer(buf, index as u32, 4, 0b0001_0000);
                encode_string(buf, value);
            }
            Match::NameOnly(index) => {
                encode_integer(buf, index as u32, 6, 0b0100_0000);
                encode_string(buf, value);
                self.dynamic.insert(name.to_string(), value.to_string());
            }
            Match::None if is_sensitive(name) => {
                buf.push(0b0001_0000);
                encode_string(buf, name);
                encode_string(buf, value);
            }
            Match::None => {
                buf.push(0b0100_0000);
                encode_string(buf, name);
                encode_string(buf, value);
                self.dynamic.insert(name.to_string(), value.to_string());
            }
        }
    }
}

/// Encode a string literal (RFC 7541 §5.2), using Huffman coding whenever it
/// is not larger than the literal encoding.
fn encode_string(buf: &mut Vec<u8>, s: &str) {
    let huffman_len = huffman::encoded_len(s.as_bytes());
    if huffman_len < s.len() {
        encode_integer(buf, huffman_len as u32, 7, 0b1000_0000);
        buf.extend_from_slice(&huffman::encode(s.as_bytes()));
    } else {
        encode_integer(buf, s.len() as u32, 7, 0);
        buf.extend_from_slice(s.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hpack::decoder::Decoder;

    fn sample_headers() -> HeaderList {
        let mut h = HeaderList::new();
        h.push(":method", "GET");
        h.push(":path", "/index.html");
        h.push(":authority", "example.com");
        h.push("x-custom", "value");
        h
    }

    #[test]
    fn round_trips_through_decoder() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096);
        let encoded = encoder.encode(&sample_headers());
        let decoded = decoder.decode(&encoded).unwrap();
        let expected: Vec<_> = sample_headers().iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let got: Vec<_> = decoded.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn repeated_header_reuses_dynamic_entry() {
        let mut encoder = Encoder::new(4096);
        let first = encoder.encode(&sample_headers());
        let second = encoder.encode(&sample_headers());
        // Everything is now a full dynamic/static index hit, so the second
        // block is tiny compared to the first.
        assert!(second.len() < first.len());
    }

    #[test]
    fn sensitive_header_is_never_indexed() {
        let mut encoder = Encoder::new(4096);
        let mut h = HeaderList::new();
        h.push("authorization", "Bearer secret");
        let encoded = encoder.encode(&h);
        assert_eq!(encoded[0] & 0b1111_0000, 0b0001_0000);
    }

    #[test]
    fn dynamic_size_update_is_prefixed() {
        let mut encoder = Encoder::new(4096);
        encoder.set_max_dynamic_size(0);
        let encoded = encoder.encode(&sample_headers());
        assert_eq!(encoded[0] & 0b1110_0000, 0b0010_0000);
    }
}
