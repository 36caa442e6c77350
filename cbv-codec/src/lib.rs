//! cbv codec - Builder and slice engines
//!
//! This crate provides the encoding and decoding engines for the cbv
//! compact binary value format:
//!
//! - A growable byte buffer with rollback
//! - Value descriptors consumed by the builder
//! - The incremental builder with open/close container frames
//! - The non-owning slice reader with random access into containers
//! - Collection helpers and a hex-dump formatter layered on top
//!
//! The builder materializes a sequence of typed values into a contiguous
//! byte buffer; a slice traverses that buffer without parsing it into an
//! intermediate representation.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod builder;
pub mod collection;
pub mod hexdump;
pub mod options;
pub mod slice;
pub mod translator;
pub mod value;

// Re-export commonly used types
pub use cbv_format::{CbvError, Result, ValueType};

pub use buffer::Buffer;
pub use builder::{ArrayGuard, Builder, ObjectGuard};
pub use hexdump::HexDump;
pub use options::{BuilderOptions, PaddingBehavior};
pub use slice::{ArrayIter, Bcd, ObjectIter, Slice};
pub use translator::AttributeTranslator;
pub use value::Value;
