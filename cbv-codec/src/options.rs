//! Builder configuration

use std::sync::Arc;

use crate::translator::AttributeTranslator;

/// Controls the zero padding left behind when a container header shrinks
/// below its reserved nine bytes on close.
///
/// Padding bytes are always zero and count towards the container's byte
/// length; readers skip them when locating the first child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingBehavior {
    /// Move the body down for 1- and 2-byte headers; keep the zero gap
    /// where the reserved header already accommodates the final layout.
    #[default]
    Flexible,
    /// Always move the body down to the exact header size.
    NoPadding,
    /// Never move the body; unused reserved bytes stay as zero padding.
    UsePadding,
}

/// Builder configuration
#[derive(Debug, Clone, Default)]
pub struct BuilderOptions {
    /// Arrays opened without an explicit form close in the compact encoding
    pub build_unindexed_arrays: bool,
    /// Objects opened without an explicit form close in the compact encoding
    pub build_unindexed_objects: bool,
    /// Suppress the key sort when closing indexed objects
    pub build_unsorted_objects: bool,
    /// Fail the close of an object carrying duplicate keys
    pub check_attribute_uniqueness: bool,
    /// Refuse external values
    pub disallow_externals: bool,
    /// Refuse BCD values
    pub disallow_bcd: bool,
    /// Padding strategy applied when container headers shrink on close
    pub padding_behavior: PaddingBehavior,
    /// Name-to-token table consulted when writing and sorting object keys
    pub attribute_translator: Option<Arc<AttributeTranslator>>,
}

impl BuilderOptions {
    /// Whether a translator is configured.
    pub(crate) fn translator_active(&self) -> bool {
        self.attribute_translator.is_some()
    }
}
