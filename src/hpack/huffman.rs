//! RFC 7541 §5.2 / Appendix B canonical Huffman coding.

use super::huffman_table::{CODES, EOS_CODE, EOS_LEN, LENGTHS};
use crate::error::CompressionError;
use bytes::Bytes;
use std::sync::OnceLock;

const EOS_SYMBOL: u16 = 256;

struct Node {
    zero: Option<Box<Node>>,
    one: Option<Box<Node>>,
    symbol: Option<u16>,
}

impl Node {
    fn leaf() -> Self {
        Self { zero: None, one: None, symbol: None }
    }

    fn insert(&mut self, code: u32, len: u8, symbol: u16) {
        let mut node = self;
        for i in (0..len).rev() {
            let bit = (code >> i) & 1;
            let slot = if bit == 0 { &mut node.zero } else { &mut node.one };
            node = slot.get_or_insert_with(|| Box::new(Node::leaf()));
        }
        node.symbol = Some(symbol);
    }
}

fn tree() -> &'static Node {
    static TREE: OnceLock<Node> = OnceLock::new();
    TREE.get_or_init(|| {
        let mut root = Node::leaf();
        for symbol in 0..256usize {
            root.insert(CODES[symbol], LENGTHS[symbol], symbol as u16);
        }
        root.insert(EOS_CODE, EOS_LEN, EOS_SYMBOL);
        root
    })
}

/// Encode `input` as a Huffman-coded byte string, MSB-first, padded with up
/// to 7 one-bits (the EOS code's prefix) to the next byte boundary.
#[must_use]
pub fn encode(input: &[u8]) -> Bytes {
    let mut bitbuf: u64 = 0;
    let mut bits: u32 = 0;
    let mut out = Vec::with_capacity(input.len());
    for &byte in input {
        let code = u64::from(CODES[byte as usize]);
        let len = u32::from(LENGTHS[byte as usize]);
        bitbuf = (bitbuf << len) | code;
        bits += len;
        while bits >= 8 {
            bits -= 8;
            out.push(((bitbuf >> bits) & 0xff) as u8);
        }
    }
    if bits > 0 {
        let pad_len = 8 - bits;
        let pad = (1u64 << pad_len) - 1;
        bitbuf = (bitbuf << pad_len) | pad;
        out.push((bitbuf & 0xff) as u8);
    }
    Bytes::from(out)
}

/// Exact encoded length in bytes, without materializing the output —
/// `ceil(total_bits / 8)`.
#[must_use]
pub fn encoded_len(input: &[u8]) -> usize {
    let total_bits: u64 = input
        .iter()
        .map(|&b| u64::from(LENGTHS[b as usize]))
        .sum();
    ((total_bits + 7) / 8) as usize
}

/// Decode a Huffman-coded byte string. Validates that trailing padding bits
/// (at most 7) are all ones and that no codepath decodes the EOS symbol.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let root = tree();
    let mut out = Vec::with_capacity(input.len() * 2);
    let mut node = root;
    let mut pending_count: u8 = 0;
    let mut pending_all_ones = true;

    let last_bit_index = input.len() * 8;
    for (bit_no, byte) in input.iter().enumerate().flat_map(|(i, &b)| {
        (0..8).rev().map(move |shift| (i * 8 + (7 - shift), (b >> shift) & 1))
    }) {
        let is_last_bit = bit_no + 1 == last_bit_index;
        let child = if byte == 0 { node.zero.as_deref() } else { node.one.as_deref() };
        match child {
            Some(next) => {
                pending_count += 1;
                if byte == 0 {
                    pending_all_ones = false;
                }
                if let Some(symbol) = next.symbol {
                    if symbol == EOS_SYMBOL {
                        return Err(CompressionError::InvalidHuffman);
                    }
                    out.push(symbol as u8);
                    node = root;
                    pending_count = 0;
                    pending_all_ones = true;
                } else {
                    node = next;
                }
            }
            None => {
                if !is_last_bit {
                    return Err(CompressionError::InvalidHuffman);
                }
                pending_count += 1;
                if byte == 0 {
                    pending_all_ones = false;
                }
                return if pending_count > 7 || !pending_all_ones {
                    Err(CompressionError::InvalidHuffman)
                } else {
                    Ok(out)
                };
            }
        }
    }

    if std::ptr::eq(node, root) {
        Ok(out)
    } else if pending_count > 7 || !pending_all_ones {
        Err(CompressionError::InvalidHuffman)
    } else {
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ascii() {
        for sample in [&b""[..], b"www.example.com", b"\x00\xff", b"a", b"no-cache"] {
            let encoded = encode(sample);
            assert_eq!(encoded.len(), encoded_len(sample));
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded, sample);
        }
    }

    #[test]
    fn rejects_eos_symbol() {
        // EOS is 30 ones; feed exactly that as a 4-byte all-ones sequence.
        let all_ones = [0xff, 0xff, 0xff, 0xff];
        assert!(decode(&all_ones).is_err());
    }

    #[test]
    fn rejects_non_one_padding() {
        // First 5 bits (00000) decode to '0'; the trailing 000 is padding
        // that is not all-ones, which RFC 7541 §5.2 requires it to be.
        let bad = [0b0000_0000u8];
        assert!(decode(&bad).is_err());
    }

    #[test]
    fn empty_round_trips() {
        assert_eq!(decode(&encode(b"")).unwrap(), Vec::<u8>::new());
    }
}
