//! Error types for the cbv format

use thiserror::Error;

/// cbv error types
#[derive(Debug, Error)]
pub enum CbvError {
    #[error("builder output is not sealed")]
    BuilderNotSealed,
    #[error("operation needs an open object")]
    BuilderNeedOpenObject,
    #[error("operation needs an open array")]
    BuilderNeedOpenArray,
    #[error("no array or object is currently open")]
    BuilderNeedOpenCompound,
    #[error("object key has already been written")]
    BuilderKeyAlreadyWritten,
    #[error("object key must be a string")]
    BuilderKeyMustBeString,
    #[error("external values are disallowed")]
    BuilderExternalsDisallowed,
    #[error("BCD values are disallowed")]
    BuilderBcdDisallowed,
    #[error("duplicate attribute name: {0}")]
    DuplicateAttributeName(String),
    #[error("unexpected value type: {0}")]
    BuilderUnexpectedType(String),
    #[error("number out of range: {0}")]
    NumberOutOfRange(String),
    #[error("invalid value type: {0}")]
    InvalidValueType(String),
    #[error("index out of bounds")]
    IndexOutOfBounds,
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CbvError>;
