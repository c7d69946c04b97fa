use std::cmp;

/// Nibble sequence for trie traversal.
///
/// Layout: `buf[0..start]` is the already-consumed prefix (for path tracking),
/// and `buf[start..]` is the remaining data. This makes `next()` and
/// `skip_prefix()` O(1) by advancing `start` instead of shifting the Vec.
#[derive(Debug, Clone, Default)]
pub struct Nibbles {
    buf: Vec<u8>,
    /// Index where remaining data begins.
    start: usize,
}

// NOTE: custom impls to ignore the already-consumed portion

impl PartialEq for Nibbles {
    fn eq(&self, other: &Nibbles) -> bool {
        self.data() == other.data()
    }
}

impl Eq for Nibbles {}

impl PartialOrd for Nibbles {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Nibbles {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.data().cmp(other.data())
    }
}

impl std::hash::Hash for Nibbles {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.data().hash(state);
    }
}

impl Nibbles {
    /// Returns the remaining data as a slice.
    #[inline]
    fn data(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    /// Create `Nibbles` from hex-encoded nibbles
    pub fn from_hex(hex: Vec<u8>) -> Self {
        Self { buf: hex, start: 0 }
    }

    /// Create `Nibbles` from a nibble slice
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            buf: data.to_vec(),
            start: 0,
        }
    }

    /// Splits incoming bytes into nibbles and appends the leaf flag (a 16 nibble at the end)
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_raw(bytes, true)
    }

    /// Splits incoming bytes into nibbles and appends the leaf flag (a 16 nibble at the end) if is_leaf is true
    pub fn from_raw(bytes: &[u8], is_leaf: bool) -> Self {
        let mut buf = Vec::with_capacity(bytes.len() * 2 + 1);
        for byte in bytes {
            buf.push(byte >> 4 & 0x0F);
            buf.push(byte & 0x0F);
        }
        if is_leaf {
            buf.push(16);
        }
        Self { buf, start: 0 }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data().to_vec()
    }

    /// Returns the amount of remaining nibbles
    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Returns true if there are no remaining nibbles
    pub fn is_empty(&self) -> bool {
        self.start == self.buf.len()
    }

    /// If `prefix` is a prefix of self, move the offset after
    /// the prefix and return true, otherwise return false.
    pub fn skip_prefix(&mut self, prefix: &Nibbles) -> bool {
        let prefix_len = prefix.len();
        if self.len() >= prefix_len && &self.data()[..prefix_len] == prefix.data() {
            self.start += prefix_len;
            true
        } else {
            false
        }
    }

    /// Compares self to another and returns the shared nibble count (amount of nibbles that are equal, from the start)
    pub fn count_prefix(&self, other: &Nibbles) -> usize {
        self.data()
            .iter()
            .zip(other.data().iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Removes and returns the first nibble
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<u8> {
        if self.is_empty() {
            None
        } else {
            let nibble = self.buf[self.start];
            self.start += 1;
            Some(nibble)
        }
    }

    /// Removes and returns the first nibble if it is a suitable choice index (aka < 16)
    pub fn next_choice(&mut self) -> Option<usize> {
        self.next().filter(|choice| *choice < 16).map(usize::from)
    }

    /// Returns the first remaining nibble without consuming it, if it is a choice index
    pub fn first_choice(&self) -> Option<usize> {
        self.data()
            .first()
            .filter(|nibble| **nibble < 16)
            .map(|nibble| *nibble as usize)
    }

    /// Returns the nibbles after the given offset
    pub fn offset(&self, offset: usize) -> Nibbles {
        debug_assert!(offset <= self.len());
        Nibbles {
            buf: self.buf.clone(),
            start: self.start + offset,
        }
    }

    /// Returns the nibbles between the start and end indexes
    pub fn slice(&self, start: usize, end: usize) -> Nibbles {
        Nibbles::from_slice(&self.data()[start..end])
    }

    /// Extends the nibbles with another list of nibbles
    pub fn extend(&mut self, other: &Nibbles) {
        self.buf.extend_from_slice(other.data());
    }

    /// Return the nibble at the given index, will panic if the index is out of range
    pub fn at(&self, i: usize) -> usize {
        self.data()[i] as usize
    }

    /// Inserts a nibble at the start
    pub fn prepend(&mut self, nibble: u8) {
        self.buf.insert(self.start, nibble);
    }

    /// Inserts a nibble at the end
    pub fn append(&mut self, nibble: u8) {
        self.buf.push(nibble);
    }

    /// Encodes the nibbles in compact (hex-prefix) form
    pub fn encode_compact(&self) -> Vec<u8> {
        let mut compact = vec![];
        let is_leaf = self.is_leaf();
        let data = self.data();
        let mut hex = if is_leaf {
            &data[..data.len() - 1]
        } else {
            data
        };
        // node type    path length    |    prefix    hexchar
        // --------------------------------------------------
        // extension    even           |    0000      0x0
        // extension    odd            |    0001      0x1
        // leaf         even           |    0010      0x2
        // leaf         odd            |    0011      0x3
        let v = if hex.len() % 2 == 1 {
            let v = 0x10 + hex[0];
            hex = &hex[1..];
            v
        } else {
            0x00
        };

        compact.push(v + if is_leaf { 0x20 } else { 0x00 });
        for i in 0..(hex.len() / 2) {
            compact.push((hex[i * 2] * 16) + (hex[i * 2 + 1]));
        }

        compact
    }

    /// RLP-encoded length of the compact form, without materializing it
    pub fn compact_encoded_length(&self) -> usize {
        let hex_len = self.len() - usize::from(self.is_leaf());
        let compact_len = 1 + hex_len / 2;
        if compact_len == 1 {
            // the flag byte is always below 0x80, it encodes as itself
            1
        } else if compact_len < 56 {
            1 + compact_len
        } else {
            2 + compact_len
        }
    }

    /// Decodes nibbles from compact (hex-prefix) form
    pub fn decode_compact(compact: &[u8]) -> Self {
        Self::from_hex(compact_to_hex(compact))
    }

    /// Returns true if the nibbles contain the leaf flag (16) at the end
    pub fn is_leaf(&self) -> bool {
        match self.buf.last() {
            Some(nibble) if !self.is_empty() => *nibble == 16,
            _ => false,
        }
    }

    /// Combines the nibbles into bytes, trimming the leaf flag if necessary
    pub fn to_bytes(&self) -> Vec<u8> {
        let data = self.data();
        // Trim leaf flag
        let trimmed = if self.is_leaf() {
            &data[..data.len() - 1]
        } else {
            data
        };
        // Combine nibbles into bytes
        trimmed
            .chunks(2)
            .map(|chunk| match chunk.len() {
                1 => chunk[0] << 4,
                _ => chunk[0] << 4 | chunk[1],
            })
            .collect::<Vec<_>>()
    }

    /// Concatenates self and another Nibbles returning a new Nibbles
    pub fn concat(&self, other: &Nibbles) -> Nibbles {
        let mut buf = self.buf.clone();
        buf.extend_from_slice(other.data());
        Nibbles {
            buf,
            start: self.start,
        }
    }

    /// Returns a copy of self with the nibble added at the end
    pub fn append_new(&self, nibble: u8) -> Nibbles {
        let mut buf = self.buf.clone();
        buf.push(nibble);
        Nibbles {
            buf,
            start: self.start,
        }
    }

    /// Return already consumed part of the path
    pub fn current(&self) -> Nibbles {
        Nibbles::from_slice(&self.buf[..self.start])
    }
}

impl AsRef<[u8]> for Nibbles {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

// Ported from go-ethereum's trie/encoding.go
fn compact_to_hex(compact: &[u8]) -> Vec<u8> {
    if compact.is_empty() {
        return vec![];
    }
    let mut base = keybytes_to_hex(compact);
    // delete terminator flag
    if base[0] < 2 {
        base = base[..base.len() - 1].to_vec();
    }
    // apply odd flag
    let chop = 2 - (base[0] & 1) as usize;
    base[chop..].to_vec()
}

fn keybytes_to_hex(keybytes: &[u8]) -> Vec<u8> {
    let l = keybytes.len() * 2 + 1;
    let mut nibbles = vec![0; l];
    for (i, b) in keybytes.iter().enumerate() {
        nibbles[i * 2] = b / 16;
        nibbles[i * 2 + 1] = b % 16;
    }
    nibbles[l - 1] = 16;
    nibbles
}
