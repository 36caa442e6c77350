//! Attribute name to token translation
//!
//! A translator substitutes short byte tokens (SmallInt/UInt values) for
//! common key strings. The builder copies the pre-encoded token bytes
//! verbatim in place of the key; a reader holding the same table resolves
//! tokens back to names. Unknown keys fall through to normal string
//! encoding, so readers without the table still decode structure.

use std::collections::HashMap;

use cbv_format::error::{CbvError, Result};
use cbv_format::tags::{HEAD_SMALL_INT_BASE, HEAD_UINT_BASE};

/// Bidirectional key-name to token table. Shared read-only once built.
#[derive(Debug, Default)]
pub struct AttributeTranslator {
    to_token: HashMap<String, Vec<u8>>,
    from_token: HashMap<u64, String>,
}

impl AttributeTranslator {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` under the token `id`. Both directions must be
    /// unique.
    pub fn add(&mut self, name: &str, id: u64) -> Result<()> {
        if self.to_token.contains_key(name) {
            return Err(CbvError::Internal(format!(
                "duplicate translated attribute name: {}",
                name
            )));
        }
        if self.from_token.contains_key(&id) {
            return Err(CbvError::Internal(format!(
                "duplicate translated attribute id: {}",
                id
            )));
        }

        self.to_token.insert(name.to_string(), encode_token(id));
        self.from_token.insert(id, name.to_string());
        Ok(())
    }

    /// Pre-encoded token bytes for `name`, if registered.
    pub fn translate(&self, name: &str) -> Option<&[u8]> {
        self.to_token.get(name).map(Vec::as_slice)
    }

    /// Resolve a token id back to its name.
    pub fn reverse(&self, id: u64) -> Option<&str> {
        self.from_token.get(&id).map(String::as_str)
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.to_token.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.to_token.is_empty()
    }
}

/// Encode a token id exactly as the builder encodes an unsigned integer
/// value, so translated keys are indistinguishable from hand-added ones.
fn encode_token(id: u64) -> Vec<u8> {
    if id <= 9 {
        return vec![HEAD_SMALL_INT_BASE + id as u8];
    }

    let mut size = 1u8;
    let mut x = id >> 8;
    while x != 0 {
        size += 1;
        x >>= 8;
    }

    let mut bytes = Vec::with_capacity(1 + size as usize);
    bytes.push(HEAD_UINT_BASE - 1 + size);
    let mut v = id;
    for _ in 0..size {
        bytes.push(v as u8);
        v >>= 8;
    }
    bytes
}
