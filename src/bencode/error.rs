use thiserror::Error;

/// Decode failures. On the datagram path every one of these means "drop the
/// packet"; the detail only matters at debug log level.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    /// The buffer ended inside a value.
    #[error("input truncated at byte {0}")]
    Truncated(usize),

    /// Malformed integer literal: empty, redundant leading zero, negative
    /// zero, or out of the i64 range.
    #[error("malformed integer")]
    BadInteger,

    /// Malformed or missing string length prefix.
    #[error("malformed length prefix")]
    BadLength,

    /// A byte that cannot start a value.
    #[error("unexpected byte {byte:#04x} at offset {at}")]
    UnexpectedByte { byte: u8, at: usize },

    /// Data left over after the outermost value.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// Nesting beyond the supported depth.
    #[error("nested deeper than {0} levels")]
    TooDeep(usize),

    /// Dictionary key that is not a byte string.
    #[error("dictionary key is not a byte string")]
    NonStringKey,
}
