use ethereum_types::H256;

use super::error::RLPDecodeError;

/// Upper bound on a single item's payload. Anything larger than this is a
/// corrupted or hostile length prefix, not real data.
const MAX_RLP_BYTES: usize = 1024 * 1024 * 1024;

/// Deserialization from RLP.
///
/// Implementors provide [`decode_unfinished`](RLPDecode::decode_unfinished),
/// which also returns the bytes trailing the item; [`decode`](RLPDecode::decode)
/// additionally requires the input to hold exactly one item.
pub trait RLPDecode: Sized {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError>;

    fn decode(rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        let (decoded, remaining) = Self::decode_unfinished(rlp)?;
        if !remaining.is_empty() {
            return Err(RLPDecodeError::InvalidLength);
        }
        Ok(decoded)
    }
}

/// The first item of an input slice, split out of it.
struct Item<'a> {
    is_list: bool,
    /// Payload without the prefix.
    payload: &'a [u8],
    /// Payload including its prefix.
    prefixed: &'a [u8],
    /// Bytes after the item.
    rest: &'a [u8],
}

/// Reads a big-endian payload length from the `count` bytes after the prefix
/// byte. Lengths below 56 belong in a short prefix, so a leading zero or a
/// value this small is non-canonical.
fn long_payload_length(data: &[u8], count: usize) -> Result<usize, RLPDecodeError> {
    let bytes = data
        .get(1..1 + count)
        .ok_or(RLPDecodeError::InvalidLength)?;
    if bytes.first() == Some(&0) || bytes.len() > size_of::<usize>() {
        return Err(RLPDecodeError::MalformedData);
    }
    let mut length = 0usize;
    for byte in bytes {
        length = (length << 8) | *byte as usize;
    }
    if length < 56 {
        return Err(RLPDecodeError::MalformedData);
    }
    Ok(length)
}

fn split_item(data: &[u8]) -> Result<Item<'_>, RLPDecodeError> {
    let first = *data.first().ok_or(RLPDecodeError::InvalidLength)?;
    let (is_list, prefix_len, payload_len) = match first {
        // A single byte is its own payload
        0x00..=0x7f => (false, 0, 1),
        0x80..=0xb7 => (false, 1, (first - 0x80) as usize),
        0xb8..=0xbf => {
            let count = (first - 0xb7) as usize;
            (false, 1 + count, long_payload_length(data, count)?)
        }
        0xc0..=0xf7 => (true, 1, (first - 0xc0) as usize),
        0xf8..=0xff => {
            let count = (first - 0xf7) as usize;
            (true, 1 + count, long_payload_length(data, count)?)
        }
    };
    if payload_len > MAX_RLP_BYTES {
        return Err(RLPDecodeError::InvalidLength);
    }
    let total = prefix_len + payload_len;
    if data.len() < total {
        return Err(RLPDecodeError::InvalidLength);
    }
    Ok(Item {
        is_list,
        payload: &data[prefix_len..total],
        prefixed: &data[..total],
        rest: &data[total..],
    })
}

/// Splits the first RLP item off a slice, returning whether it is a list,
/// its payload without the prefix, and the bytes after the item.
pub fn decode_rlp_item(data: &[u8]) -> Result<(bool, &[u8], &[u8]), RLPDecodeError> {
    let item = split_item(data)?;
    Ok((item.is_list, item.payload, item.rest))
}

/// Splits the first RLP item off a slice keeping its prefix, returning it
/// and the bytes after the item.
pub fn get_item_with_prefix(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let item = split_item(data)?;
    Ok((item.prefixed, item.rest))
}

/// Splits the first RLP item off a slice, requiring it to be a string.
/// Returns its payload and the bytes after the item.
pub fn decode_bytes(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let item = split_item(data)?;
    if item.is_list {
        return Err(RLPDecodeError::UnexpectedList);
    }
    Ok((item.payload, item.rest))
}

// Byte strings, not lists of integers.
impl RLPDecode for Vec<u8> {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(rlp)?;
        Ok((payload.to_vec(), rest))
    }
}

impl<const N: usize> RLPDecode for [u8; N] {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(rlp)?;
        let value = payload
            .try_into()
            .map_err(|_| RLPDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl RLPDecode for H256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = RLPDecode::decode_unfinished(rlp)?;
        Ok((H256(value), rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_strings() {
        let (payload, rest) = decode_bytes(&[0x83, b'd', b'o', b'g']).unwrap();
        assert_eq!(payload, b"dog");
        assert!(rest.is_empty());

        assert_eq!(Vec::<u8>::decode(&[0x80]).unwrap(), Vec::<u8>::new());
        assert_eq!(Vec::<u8>::decode(&[0x05]).unwrap(), vec![0x05]);
    }

    #[test]
    fn decode_splits_lists() {
        // ["cat", "dog"]
        let data = [0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g'];
        let (is_list, payload, rest) = decode_rlp_item(&data).unwrap();
        assert!(is_list);
        assert_eq!(payload.len(), 8);
        assert!(rest.is_empty());

        let (cat, after) = get_item_with_prefix(payload).unwrap();
        assert_eq!(cat, &[0x83, b'c', b'a', b't']);
        assert_eq!(after.len(), 4);
    }

    #[test]
    fn decode_rejects_lists_as_bytes() {
        assert_eq!(
            decode_bytes(&[0xc1, 0x01]),
            Err(RLPDecodeError::UnexpectedList)
        );
    }

    #[test]
    fn decode_rejects_truncated_input() {
        assert_eq!(
            decode_bytes(&[0x83, b'd', b'o']),
            Err(RLPDecodeError::InvalidLength)
        );
        assert_eq!(decode_bytes(&[]), Err(RLPDecodeError::InvalidLength));
    }

    #[test]
    fn decode_rejects_non_canonical_long_lengths() {
        // long-string prefix carrying a length that fits a short prefix
        assert_eq!(
            split_item(&[0xb8, 0x02, 0x00, 0x00]).map(|_| ()),
            Err(RLPDecodeError::MalformedData)
        );
        // leading zero in the length bytes
        assert_eq!(
            split_item(&[0xb9, 0x00, 0x38]).map(|_| ()),
            Err(RLPDecodeError::MalformedData)
        );
    }

    #[test]
    fn decode_trailing_bytes_fail_strict_decode() {
        assert!(Vec::<u8>::decode(&[0x05, 0x06]).is_err());
        assert_eq!(
            Vec::<u8>::decode_unfinished(&[0x05, 0x06]).unwrap(),
            (vec![0x05], &[0x06u8][..])
        );
    }

    #[test]
    fn decode_fixed_arrays() {
        let mut data = vec![0xa0];
        data.extend_from_slice(&[0x11; 32]);
        let value: [u8; 32] = RLPDecode::decode(&data).unwrap();
        assert_eq!(value, [0x11; 32]);
        assert_eq!(H256::decode(&data).unwrap(), H256([0x11; 32]));
        assert!(<[u8; 16]>::decode(&data).is_err());
    }
}
