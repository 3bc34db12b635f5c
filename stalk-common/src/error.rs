//! Validation errors for values built on the caller's side of the wire.

use thiserror::Error;

use crate::types::MAX_TUBE_NAME_LEN;

/// Result alias for name validation.
pub type NameResult<T> = Result<T, NameError>;

/// Reasons a tube name is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NameError {
    /// The name has no characters.
    #[error("name is empty")]
    Empty,
    /// The name is longer than the server accepts.
    #[error("name is {len} bytes, the limit is {}", MAX_TUBE_NAME_LEN)]
    TooLong { len: usize },
    /// The name contains whitespace or a control character.
    #[error("name contains invalid character {ch:?}")]
    BadChar { ch: char },
}
