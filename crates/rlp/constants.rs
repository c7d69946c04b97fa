/// Encoding of the empty string. Also the short-string prefix base.
pub const RLP_NULL: u8 = 0x80;
/// Encoding of the empty list. Also the short-list prefix base.
pub const RLP_EMPTY_LIST: u8 = 0xc0;
