use thiserror::Error;

/// Errors raised while decoding RLP items.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RLPDecodeError {
    #[error("item is truncated or its length prefix is inconsistent")]
    InvalidLength,
    #[error("payload is not canonical RLP")]
    MalformedData,
    #[error("expected a string item, found a list")]
    UnexpectedList,
    #[error("expected a list item, found a string")]
    UnexpectedString,
    #[error("{0}")]
    Custom(String),
}
