//! Algorithms over encoded arrays and objects
//!
//! These helpers touch the core only through the public builder and
//! slice operations; results come back as fresh, sealed builders.

use cbv_format::error::Result;

use crate::builder::Builder;
use crate::slice::{ArrayIter, ObjectIter, Slice};
use crate::value::Value;

/// Invoke `cb` for each array item with its position; stop early when it
/// returns false.
pub fn for_each(slice: Slice<'_>, mut cb: impl FnMut(Slice<'_>, usize) -> bool) -> Result<()> {
    for (index, item) in ArrayIter::new(slice)?.enumerate() {
        if !cb(item, index) {
            // abort
            return Ok(());
        }
    }
    Ok(())
}

/// Collect the items matching `cb` into a new sealed array.
pub fn filter(slice: Slice<'_>, mut cb: impl FnMut(Slice<'_>, usize) -> bool) -> Result<Builder> {
    let mut builder = Builder::new();
    builder.add(Value::array())?;
    for (index, item) in ArrayIter::new(slice)?.enumerate() {
        if cb(item, index) {
            builder.add_slice(item)?;
        }
    }
    builder.close()?;
    Ok(builder)
}

/// Map each item through `cb` into a new sealed array.
pub fn map<'a, F>(slice: Slice<'a>, mut cb: F) -> Result<Builder>
where
    F: FnMut(Slice<'a>, usize) -> Value<'a>,
{
    let mut builder = Builder::new();
    builder.add(Value::array())?;
    for (index, item) in ArrayIter::new(slice)?.enumerate() {
        let value = cb(item, index);
        builder.add(value)?;
    }
    builder.close()?;
    Ok(builder)
}

/// Collect the keys of an object in iteration order.
pub fn keys(slice: Slice<'_>) -> Result<Vec<String>> {
    let mut result = Vec::new();
    keys_into(slice, &mut result)?;
    Ok(result)
}

/// Append the keys of an object to an existing vector. Keys must be
/// plain strings; token keys need the read side's translator instead.
pub fn keys_into(slice: Slice<'_>, result: &mut Vec<String>) -> Result<()> {
    let iter = ObjectIter::new(slice)?;
    result.reserve(iter.len());
    for (key, _) in iter {
        result.push(key.get_string()?.to_string());
    }
    Ok(())
}

/// Collect the values of an object, in key iteration order, into a new
/// sealed array.
pub fn values(slice: Slice<'_>) -> Result<Builder> {
    let mut builder = Builder::new();
    builder.add(Value::array())?;
    for (_, value) in ObjectIter::new(slice)? {
        builder.add_slice(value)?;
    }
    builder.close()?;
    Ok(builder)
}
