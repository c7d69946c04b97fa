use bytes::BufMut;

use super::{
    decode::{RLPDecode, decode_rlp_item, get_item_with_prefix},
    encode::{RLPEncode, encode_length},
    error::RLPDecodeError,
};

/// Walks the fields of an RLP list item.
///
/// [`new`](Decoder::new) splits the list open; each call consumes one field,
/// either decoded ([`decode_field`](Decoder::decode_field)) or as raw
/// prefixed bytes ([`get_encoded_item_ref`](Decoder::get_encoded_item_ref)).
/// [`finish`](Decoder::finish) asserts the list was fully consumed and
/// returns whatever follows it.
#[derive(Debug)]
#[must_use = "a Decoder must be consumed with `finish` to check for leftover fields"]
pub struct Decoder<'a> {
    payload: &'a [u8],
    remaining: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self, RLPDecodeError> {
        match decode_rlp_item(buf)? {
            (true, payload, remaining) => Ok(Self { payload, remaining }),
            (false, _, _) => Err(RLPDecodeError::UnexpectedString),
        }
    }

    pub fn decode_field<T: RLPDecode>(self, name: &str) -> Result<(T, Self), RLPDecodeError> {
        let (field, rest) = T::decode_unfinished(self.payload).map_err(|err| {
            RLPDecodeError::Custom(format!("field '{name}' failed to decode: {err}"))
        })?;
        Ok((field, Self { payload: rest, ..self }))
    }

    /// Returns the next field as its raw encoding, prefix included.
    pub fn get_encoded_item_ref(self) -> Result<(&'a [u8], Self), RLPDecodeError> {
        let (field, rest) = get_item_with_prefix(self.payload)?;
        Ok((field, Self { payload: rest, ..self }))
    }

    /// True once every field of the list has been consumed.
    pub const fn is_done(&self) -> bool {
        self.payload.is_empty()
    }

    /// Requires the list to be fully consumed and returns the bytes after it.
    pub fn finish(self) -> Result<&'a [u8], RLPDecodeError> {
        if self.payload.is_empty() {
            Ok(self.remaining)
        } else {
            Err(RLPDecodeError::MalformedData)
        }
    }
}

/// Builds an RLP list item field by field.
///
/// Fields are staged in a scratch buffer so the list prefix, which depends
/// on the total payload size, can be written first on
/// [`finish`](Encoder::finish).
#[must_use = "an Encoder must be consumed with `finish` to write the staged fields"]
pub struct Encoder<'a> {
    buf: &'a mut dyn BufMut,
    staged: Vec<u8>,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut dyn BufMut) -> Self {
        Self {
            buf,
            staged: Vec::new(),
        }
    }

    /// Stages a field.
    pub fn encode_field<T: RLPEncode>(mut self, value: &T) -> Self {
        value.encode(&mut self.staged);
        self
    }

    /// Stages a byte-string field.
    pub fn encode_bytes(mut self, value: &[u8]) -> Self {
        value.encode(&mut self.staged);
        self
    }

    /// Stages pre-encoded bytes verbatim, without wrapping them in a prefix.
    pub fn encode_raw(mut self, value: &[u8]) -> Self {
        self.staged.put_slice(value);
        self
    }

    /// Writes the list prefix followed by the staged fields.
    pub fn finish(self) {
        encode_length(self.staged.len(), self.buf);
        self.buf.put_slice(&self.staged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        left: Vec<u8>,
        right: Vec<u8>,
    }

    impl RLPEncode for Pair {
        fn encode(&self, buf: &mut dyn BufMut) {
            Encoder::new(buf)
                .encode_bytes(&self.left)
                .encode_bytes(&self.right)
                .finish();
        }
    }

    impl RLPDecode for Pair {
        fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
            let decoder = Decoder::new(rlp)?;
            let (left, decoder) = decoder.decode_field("left")?;
            let (right, decoder) = decoder.decode_field("right")?;
            Ok((Pair { left, right }, decoder.finish()?))
        }
    }

    #[test]
    fn encoder_and_decoder_agree() {
        let pair = Pair {
            left: b"cat".to_vec(),
            right: b"dog".to_vec(),
        };
        let encoded = pair.encode_to_vec();
        assert_eq!(
            encoded,
            vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']
        );

        let decoded = Pair::decode(&encoded).unwrap();
        assert_eq!(decoded.left, pair.left);
        assert_eq!(decoded.right, pair.right);
    }

    #[test]
    fn finish_rejects_extra_fields() {
        // a three-element list fed to a two-field struct
        let data = [0xc3, 0x01, 0x02, 0x03];
        assert!(Pair::decode(&data).is_err());
    }

    #[test]
    fn encode_raw_bypasses_prefixing() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .encode_bytes(&[0x01, 0x02])
            .encode_raw(&[0xc0])
            .finish();
        assert_eq!(buf, vec![0xc4, 0x82, 0x01, 0x02, 0xc0]);
    }

    #[test]
    fn raw_items_round_trip_through_the_decoder() {
        let pair = Pair {
            left: vec![0xAA; 40],
            right: vec![],
        };
        let encoded = pair.encode_to_vec();
        let decoder = Decoder::new(&encoded).unwrap();
        let (raw_left, decoder) = decoder.get_encoded_item_ref().unwrap();
        assert!(!decoder.is_done());
        assert_eq!(Vec::<u8>::decode(raw_left).unwrap(), pair.left);
        let (raw_right, decoder) = decoder.get_encoded_item_ref().unwrap();
        assert_eq!(raw_right, &[0x80]);
        assert!(decoder.is_done());
        assert!(decoder.finish().unwrap().is_empty());
    }
}
