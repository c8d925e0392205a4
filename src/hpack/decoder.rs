//! RFC 7541 §6 decoder: parses a header block against the shared
//! representation grammar, folding per-block failures into
//! [`CompressionError`].

use super::huffman;
use super::integer::decode_integer;
use super::table::{resolve, DynamicTable};
use crate::error::CompressionError;
use crate::headers::HeaderList;

const DEFAULT_MAX_DECODED_BYTES: usize = 128 * 1024;

/// Stateful per-connection HPACK decoder.
pub struct Decoder {
    dynamic: DynamicTable,
    max_decoded_bytes: usize,
    /// The `SETTINGS_HEADER_TABLE_SIZE` we advertise: the ceiling the peer's
    /// encoder-issued size-update representations must never exceed.
    advertised_cap: usize,
    /// Set whenever the owner lowers `advertised_cap`; per RFC 7541 §4.2 the
    /// peer's encoder must echo the new cap as the first representation of
    /// its next header block, or that block is a COMPRESSION_ERROR.
    size_update_required: bool,
}

impl Decoder {
    #[must_use]
    pub fn new(max_dynamic_size: usize) -> Self {
        Self {
            dynamic: DynamicTable::new(max_dynamic_size),
            max_decoded_bytes: DEFAULT_MAX_DECODED_BYTES,
            advertised_cap: max_dynamic_size,
            size_update_required: false,
        }
    }

    /// Override the decompression-bomb cap (the engine wires this to
    /// `Options::max_decoded_header_bytes`).
    pub fn set_max_decoded_bytes(&mut self, limit: usize) {
        self.max_decoded_bytes = limit;
    }

    /// Lower (or otherwise change) the `SETTINGS_HEADER_TABLE_SIZE` we
    /// advertise. Arms the size-update-expected check for the next block.
    pub fn set_max_dynamic_size(&mut self, max_size: usize) {
        self.advertised_cap = max_size;
        self.size_update_required = true;
    }

    /// Decode a complete header block (already reassembled across any
    /// CONTINUATION frames) into an ordered header list.
    pub fn decode(&mut self, block: &[u8]) -> Result<HeaderList, CompressionError> {
        if self.size_update_required && !block.is_empty() {
            let is_size_update = block[0] & 0b1110_0000 == 0b0010_0000;
            if !is_size_update {
                return Err(CompressionError::SizeUpdateOutOfOrder);
            }
        }

        let mut headers = HeaderList::new();
        let mut decoded_bytes = 0usize;
        let mut cursor = 0usize;
        let mut size_update_allowed = true;

        while cursor < block.len() {
            let first = block[cursor];
            if first & 0b1000_0000 != 0 {
                size_update_allowed = false;
                let index = decode_integer(block, &mut cursor, 7)?;
                let (name, value) = resolve(&self.dynamic, index as usize)
                    .ok_or(CompressionError::InvalidIndex(index as usize))?;
                decoded_bytes += name.len() + value.len();
                self.check_budget(decoded_bytes)?;
                headers.push(name, value);
            } else if first & 0b0100_0000 != 0 {
                size_update_allowed = false;
                let index = decode_integer(block, &mut cursor, 6)?;
                let (name, value) = self.decode_literal(block, &mut cursor, index)?;
                decoded_bytes += name.len() + value.len();
                self.check_budget(decoded_bytes)?;
                self.dynamic.insert(name.clone(), value.clone());
                headers.push(name, value);
            } else if first & 0b0010_0000 != 0 {
                if !size_update_allowed {
                    return Err(CompressionError::SizeUpdateOutOfOrder);
                }
                let max_size = decode_integer(block, &mut cursor, 5)? as usize;
                if max_size > self.advertised_cap {
                    return Err(CompressionError::SizeUpdateTooLarge);
                }
                self.dynamic.set_max_size(max_size);
                self.size_update_required = false;
            } else if first & 0b0001_0000 != 0 {
                size_update_allowed = false;
                let index = decode_integer(block, &mut cursor, 4)?;
                let (name, value) = self.decode_literal(block, &mut cursor, index)?;
                decoded_bytes += name.len() + value.len();
                self.check_budget(decoded_bytes)?;
                headers.push(name, value);
            } else {
                size_update_allowed = false;
                let index = decode_integer(block, &mut cursor, 4)?;
                let (name, value) = self.decode_literal(block, &mut cursor, index)?;
                decoded_bytes += name.len() + value.len();
                self.check_budget(decoded_bytes)?;
                headers.push(name, value);
            }
        }

        Ok(headers)
    }

    fn check_budget(&self, decoded_bytes: usize) -> Result<(), CompressionError> {
        if decoded_bytes > self.max_decoded_bytes {
            Err(CompressionError::BlockTooLarge { limit: self.max_decoded_bytes })
        } else {
            Ok(())
        }
    }

    /// Decode the (name, value) pair of a literal representation whose
    /// prefix integer `index` has already been consumed. `index == 0` means
    /// the name itself is a literal; otherwise it names a table entry.
    fn decode_literal(
        &self,
        block: &[u8],
        cursor: &mut usize,
        index: u32,
    ) -> Result<(String, String), CompressionError> {
        let name = if index == 0 {
            decode_string(block, cursor)?
        } else {
            resolve(&self.dynamic, index as usize)
                .ok_or(CompressionError::InvalidIndex(index as usize))?
                .0
        };
        let value = decode_string(block, cursor)?;
        Ok((name, value))
    }
}

fn decode_string(block: &[u8], cursor: &mut usize) -> Result<String, CompressionError> {
    if *cursor >= block.len() {
        return Err(CompressionError::Truncated);
    }
    let huffman_coded = block[*cursor] & 0b1000_0000 != 0;
    let len = decode_integer(block, cursor, 7)? as usize;
    let end = cursor.checked_add(len).ok_or(CompressionError::Truncated)?;
    if end > block.len() {
        return Err(CompressionError::Truncated);
    }
    let raw = &block[*cursor..end];
    *cursor = end;
    let bytes = if huffman_coded { huffman::decode(raw)? } else { raw.to_vec() };
    String::from_utf8(bytes).map_err(|_| CompressionError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hpack::encoder::Encoder;
    use super::integer::encode_integer;

    fn size_update(max_size: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_integer(&mut buf, max_size, 5, 0b0010_0000);
        buf
    }

    #[test]
    fn rejects_truncated_block() {
        let mut decoder = Decoder::new(4096);
        assert!(decoder.decode(&[0x40]).is_err());
    }

    #[test]
    fn rejects_size_update_after_other_representation() {
        let mut encoder = Encoder::new(4096);
        let mut h = HeaderList::new();
        h.push(":method", "GET");
        let mut block = encoder.encode(&h).to_vec();
        block.push(0b0010_0000); // size update tacked on at the end
        let mut decoder = Decoder::new(4096);
        assert!(decoder.decode(&block).is_err());
    }

    #[test]
    fn enforces_decompression_budget() {
        let mut encoder = Encoder::new(4096);
        let mut h = HeaderList::new();
        h.push("x-big", "a".repeat(1000));
        let block = encoder.encode(&h);
        let mut decoder = Decoder::new(4096);
        decoder.set_max_decoded_bytes(10);
        assert!(matches!(
            decoder.decode(&block),
            Err(CompressionError::BlockTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_index() {
        let mut decoder = Decoder::new(4096);
        // Indexed representation pointing at index 200, which exists in
        // neither table.
        assert!(decoder.decode(&[0b1111_1111, 0b1000_1001, 0b0000_0001]).is_err());
    }

    #[test]
    fn rejects_size_update_beyond_advertised_cap() {
        let mut decoder = Decoder::new(100);
        assert!(matches!(
            decoder.decode(&size_update(200)),
            Err(CompressionError::SizeUpdateTooLarge)
        ));
    }

    #[test]
    fn accepts_size_update_within_advertised_cap() {
        let mut decoder = Decoder::new(4096);
        assert!(decoder.decode(&size_update(100)).is_ok());
    }

    #[test]
    fn requires_size_update_as_first_representation_after_owner_lowers_cap() {
        let mut encoder = Encoder::new(4096);
        let mut h = HeaderList::new();
        h.push(":method", "GET");
        let block = encoder.encode(&h).to_vec();

        let mut decoder = Decoder::new(4096);
        decoder.set_max_dynamic_size(100);
        assert!(matches!(
            decoder.decode(&block),
            Err(CompressionError::SizeUpdateOutOfOrder)
        ));
    }

    #[test]
    fn size_update_satisfies_the_owner_requirement() {
        let mut decoder = Decoder::new(4096);
        decoder.set_max_dynamic_size(100);
        let mut block = size_update(100);
        let mut encoder = Encoder::new(4096);
        let mut h = HeaderList::new();
        h.push(":method", "GET");
        block.extend(encoder.encode(&h));
        assert!(decoder.decode(&block).is_ok());
    }
}
