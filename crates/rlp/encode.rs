use bytes::BufMut;
use ethereum_types::H256;

use super::constants::{RLP_EMPTY_LIST, RLP_NULL};

/// Serialization to RLP.
///
/// Implementors provide [`encode`](RLPEncode::encode); the default `length`
/// counts the encoded bytes by running the encoder against a throwaway
/// buffer, so cheap overrides are worthwhile for hot types.
pub trait RLPEncode {
    fn encode(&self, buf: &mut dyn BufMut);

    fn length(&self) -> usize {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf.len()
    }

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.length());
        self.encode(&mut buf);
        buf
    }
}

/// Writes the prefix for an item whose payload spans `payload_length` bytes.
/// `short_base` and `long_base` select between the string and list ranges.
fn prefix(buf: &mut dyn BufMut, short_base: u8, long_base: u8, payload_length: usize) {
    if payload_length < 56 {
        buf.put_u8(short_base + payload_length as u8);
    } else {
        let be = payload_length.to_be_bytes();
        let first = be.iter().position(|byte| *byte != 0).unwrap_or(be.len());
        buf.put_u8(long_base + (be.len() - first) as u8);
        buf.put_slice(&be[first..]);
    }
}

/// Number of bytes the prefix for a `payload_length`-byte payload takes.
fn prefix_length(payload_length: usize) -> usize {
    if payload_length < 56 {
        1
    } else {
        let be = payload_length.to_be_bytes();
        let first = be.iter().position(|byte| *byte != 0).unwrap_or(be.len());
        1 + (be.len() - first)
    }
}

/// Writes the list prefix for a payload of `payload_length` bytes.
/// The payload itself is written by the caller.
pub fn encode_length(payload_length: usize, buf: &mut dyn BufMut) {
    prefix(buf, RLP_EMPTY_LIST, 0xf7, payload_length);
}

/// Total encoded size of a list whose payload spans `payload_length` bytes.
pub fn list_length(payload_length: usize) -> usize {
    prefix_length(payload_length) + payload_length
}

impl RLPEncode for [u8] {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            // A lone byte below 0x80 is its own encoding
            [byte] if *byte < RLP_NULL => buf.put_u8(*byte),
            _ => {
                prefix(buf, RLP_NULL, 0xb7, self.len());
                buf.put_slice(self);
            }
        }
    }

    fn length(&self) -> usize {
        match self {
            [byte] if *byte < RLP_NULL => 1,
            _ => prefix_length(self.len()) + self.len(),
        }
    }
}

impl<const N: usize> RLPEncode for [u8; N] {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_slice().encode(buf);
    }

    fn length(&self) -> usize {
        self.as_slice().length()
    }
}

// Byte strings, not lists of integers.
impl RLPEncode for Vec<u8> {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_slice().encode(buf);
    }

    fn length(&self) -> usize {
        self.as_slice().length()
    }
}

impl RLPEncode for H256 {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.0.encode(buf);
    }

    fn length(&self) -> usize {
        self.0.length()
    }
}
