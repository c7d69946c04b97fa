//! RLP codec for trie nodes. The encoding doubles as the hashing preimage
//! and the on-disk blob format, so it must match Ethereum's MPT bit for bit.

use std::array;

use paratrie_rlp::{
    decode::{RLPDecode, decode_bytes},
    encode::{RLPEncode, list_length},
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};

use crate::node::{BranchNode, ExtensionNode, LeafNode, Node};
use crate::{Nibbles, NodeHash};

// A branch is a 17-item list: sixteen child references and the value.
// Child references splice in raw: a 32-byte hash string, the child's own
// encoding when it is inline, or the empty string for a vacant slot.
impl RLPEncode for BranchNode {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        let mut encoder = Encoder::new(buf);
        for child in &self.choices {
            encoder = child.compute_hash_ref().encode(encoder);
        }
        encoder.encode_bytes(&self.value).finish();
    }

    fn length(&self) -> usize {
        let children: usize = self
            .choices
            .iter()
            .map(|child| child.compute_hash_ref().length())
            .sum();
        list_length(children + self.value.length())
    }
}

// A two-item list: the compact-encoded prefix and the child reference.
impl RLPEncode for ExtensionNode {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        let encoder = Encoder::new(buf).encode_bytes(&self.prefix.encode_compact());
        self.child.compute_hash_ref().encode(encoder).finish();
    }

    fn length(&self) -> usize {
        list_length(self.prefix.compact_encoded_length() + self.child.compute_hash_ref().length())
    }
}

// A two-item list: the compact-encoded partial path (leaf-flagged) and the value.
impl RLPEncode for LeafNode {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        Encoder::new(buf)
            .encode_bytes(&self.partial.encode_compact())
            .encode_bytes(&self.value)
            .finish();
    }

    fn length(&self) -> usize {
        list_length(self.partial.compact_encoded_length() + self.value.length())
    }
}

impl RLPEncode for Node {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        match self {
            Node::Branch(n) => n.encode(buf),
            Node::Extension(n) => n.encode(buf),
            Node::Leaf(n) => n.encode(buf),
        }
    }

    fn length(&self) -> usize {
        match self {
            Node::Branch(n) => n.length(),
            Node::Extension(n) => n.length(),
            Node::Leaf(n) => n.length(),
        }
    }
}

impl RLPDecode for Node {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let mut decoder = Decoder::new(rlp)?;
        let mut items: Vec<&[u8]> = Vec::with_capacity(17);
        while !decoder.is_done() {
            let item;
            (item, decoder) = decoder.get_encoded_item_ref()?;
            items.push(item);
            if items.len() > 17 {
                return Err(RLPDecodeError::Custom(
                    "trie node holds more than 17 items".to_string(),
                ));
            }
        }

        // The item count tells the node type apart: two items are a leaf or
        // extension (the compact prefix's flag settles which), seventeen a branch.
        let node: Node = match items.as_slice() {
            [compact, second] => {
                let (compact, _) = decode_bytes(compact)?;
                let path = Nibbles::decode_compact(compact);
                if path.is_leaf() {
                    let (value, _) = decode_bytes(second)?;
                    LeafNode {
                        partial: path,
                        value: value.to_vec(),
                    }
                    .into()
                } else {
                    ExtensionNode {
                        prefix: path,
                        child: decode_child(second).into(),
                    }
                    .into()
                }
            }
            [children @ .., value] if children.len() == 16 => {
                let choices = array::from_fn(|i| decode_child(children[i]).into());
                let (value, _) = decode_bytes(value)?;
                BranchNode {
                    choices,
                    value: value.to_vec(),
                }
                .into()
            }
            items => {
                return Err(RLPDecodeError::Custom(format!(
                    "trie node must hold 2 or 17 items, got {}",
                    items.len()
                )));
            }
        };
        Ok((node, decoder.finish()?))
    }
}

/// A child slot is either a 32-byte hash string, the empty string for a
/// vacant slot, or an embedded node kept as its raw encoding.
fn decode_child(rlp: &[u8]) -> NodeHash {
    match decode_bytes(rlp) {
        Ok((hash, &[])) if hash.len() == 32 => NodeHash::from_slice(hash),
        Ok((&[], &[])) => NodeHash::default(),
        _ => NodeHash::from_slice(rlp),
    }
}
