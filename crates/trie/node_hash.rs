use ethereum_types::H256;
use paratrie_rlp::{constants::RLP_NULL, encode::RLPEncode, structs::Encoder};
use sha3::{Digest, Keccak256};

/// Computes the keccak256 hash of the given data
pub fn keccak(data: impl AsRef<[u8]>) -> H256 {
    H256(Keccak256::new_with_prefix(data).finalize().into())
}

/// Struct representing a trie node hash.
/// If the encoded node is less than 32 bits, contains the encoded node itself
// Hashed variant is stored as a fixed size array instead of a Vec
// to avoid indirection and allow implementing Copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeHash {
    Hashed(H256),
    // The `len` field indicates how many bytes of `data` are actually used.
    Inline(([u8; 31], u8)),
}

impl NodeHash {
    /// Returns the hash of an encoded node: the node itself if it fits
    /// inline (under 32 bytes), otherwise its keccak hash.
    pub fn from_encoded_raw(encoded: &[u8]) -> NodeHash {
        if encoded.len() >= 32 {
            NodeHash::Hashed(keccak(encoded))
        } else {
            NodeHash::from_slice(encoded)
        }
    }

    /// Builds an inline hash from raw bytes. Takes the keccak route when
    /// given a full 32-byte hash.
    pub fn from_slice(slice: &[u8]) -> NodeHash {
        match slice.len() {
            32 => NodeHash::Hashed(H256::from_slice(slice)),
            len => {
                let mut data = [0; 31];
                data[..len].copy_from_slice(slice);
                NodeHash::Inline((data, len as u8))
            }
        }
    }

    /// Converts a node hash into H256, hashing the encoded node if it was inlined.
    pub fn finalize(self) -> H256 {
        match self {
            NodeHash::Hashed(hash) => hash,
            NodeHash::Inline((data, len)) => keccak(&data[..len as usize]),
        }
    }

    /// Returns true if the hash is valid.
    /// The hash will only be considered invalid if it is empty.
    /// Aka if it has a default value instead of being a product of hash computation.
    pub fn is_valid(&self) -> bool {
        !matches!(self, NodeHash::Inline((_, 0)))
    }

    /// Encodes this hash as a struct field using the given encoder.
    pub fn encode<'a>(&self, encoder: Encoder<'a>) -> Encoder<'a> {
        match self {
            NodeHash::Hashed(hash) => encoder.encode_bytes(&hash.0),
            NodeHash::Inline((data, len)) if *len > 0 => {
                // the node is already encoded, splice it in raw
                encoder.encode_raw(&data[..*len as usize])
            }
            NodeHash::Inline(_) => encoder.encode_bytes(&[]),
        }
    }

    pub fn as_ref(&self) -> &[u8] {
        match self {
            NodeHash::Hashed(hash) => hash.as_bytes(),
            NodeHash::Inline((data, len)) => &data[..*len as usize],
        }
    }
}

impl From<H256> for NodeHash {
    fn from(value: H256) -> Self {
        NodeHash::Hashed(value)
    }
}

impl From<NodeHash> for Vec<u8> {
    fn from(value: NodeHash) -> Self {
        value.as_ref().to_vec()
    }
}

impl Default for NodeHash {
    fn default() -> Self {
        NodeHash::Inline(([0; 31], 0))
    }
}

impl RLPEncode for NodeHash {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        match self {
            NodeHash::Hashed(hash) => hash.0.encode(buf),
            NodeHash::Inline((data, len)) if *len > 0 => buf.put_slice(&data[..*len as usize]),
            NodeHash::Inline(_) => buf.put_u8(RLP_NULL),
        }
    }

    fn length(&self) -> usize {
        match self {
            NodeHash::Hashed(_) => 33,
            NodeHash::Inline((_, 0)) => 1,
            NodeHash::Inline((_, len)) => *len as usize,
        }
    }
}
