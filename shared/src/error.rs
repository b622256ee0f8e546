use thiserror::Error;

/// Failures raised while encoding or decoding wire messages.
///
/// Every decode failure is a protocol violation from the remote side's point
/// of view; the receiver drops the connection instead of retrying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of buffer")]
    UnexpectedEnd,

    #[error("compressed integer does not fit in {bits} bits")]
    VarintOverflow { bits: u32 },

    #[error("length {len} exceeds maximum {max}")]
    LengthExceeded { len: usize, max: usize },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u64 },

    #[error("unknown or disabled command {0}")]
    UnknownCommand(u8),

    #[error("message {expected} expected, found discriminant {found}")]
    UnexpectedCommand { expected: u8, found: u8 },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}
