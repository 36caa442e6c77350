//! Incremental encoder materializing values into a contiguous buffer
//!
//! The mechanics of the building process: every value is appended at the
//! buffer's cursor. Opening an array or object reserves a nine-byte
//! header (head plus eight zero bytes) and pushes a frame onto the stack;
//! the offsets of the frame's children collect in a flat index vector.
//! `close` seals the innermost frame: it picks the smallest offset width
//! that fits the container, rewrites the header, emits the index table
//! and pops the frame. While the stack is empty the buffer holds a
//! sequence of complete top-level values and `slice`, `data` and `size`
//! may observe it.

use std::borrow::{Borrow, BorrowMut};
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};

use smallvec::SmallVec;

use cbv_format::error::{CbvError, Result};
use cbv_format::tags::{
    HEAD_ARRAY_COMPACT, HEAD_ARRAY_INDEXED, HEAD_ARRAY_PLAIN, HEAD_BCD_NEGATIVE,
    HEAD_BCD_POSITIVE, HEAD_BINARY_BASE, HEAD_DOUBLE, HEAD_EMPTY_ARRAY, HEAD_EMPTY_OBJECT,
    HEAD_EXTERNAL, HEAD_FALSE, HEAD_INT_BASE, HEAD_MAX_KEY, HEAD_MIN_KEY, HEAD_NULL,
    HEAD_OBJECT_COMPACT, HEAD_OBJECT_INDEXED, HEAD_SMALL_INT_BASE, HEAD_STRING_BASE,
    HEAD_STRING_LONG, HEAD_TAGGED_LONG, HEAD_TAGGED_SHORT, HEAD_TRUE, HEAD_UINT_BASE,
    HEAD_UTC_DATE, MAX_SHORT_STRING_LEN,
};
use cbv_format::varint::{encode_varint, encode_varint_reversed, varint_length};

use crate::buffer::Buffer;
use crate::options::{BuilderOptions, PaddingBehavior};
use crate::slice::{resolve_key_bytes, Slice};
use crate::value::Value;

/// Objects up to this many entries sort with insertion sort.
const INSERTION_SORT_THRESHOLD: usize = 32;

/// Bookkeeping for one currently open array or object.
#[derive(Debug, Clone, Copy)]
struct Frame {
    /// Offset of the container's head byte in the buffer
    start_pos: usize,
    /// First entry in the index vector belonging to this frame
    index_start: usize,
}

/// Incremental encoder for the cbv format.
///
/// The buffer is either owned (`Builder<Buffer>`, the default) or
/// borrowed from the caller (`Builder<&mut Buffer>`); the mode is fixed
/// at construction. A builder is a single-owner mutable object: no
/// operation suspends, blocks or performs I/O.
pub struct Builder<B: BorrowMut<Buffer> = Buffer> {
    buffer: B,
    stack: SmallVec<[Frame; 16]>,
    indexes: Vec<usize>,
    key_written: bool,
    /// Configuration consulted on every add and close.
    pub options: BuilderOptions,
}

impl Builder<Buffer> {
    /// Create an empty builder with default options.
    pub fn new() -> Self {
        Self::with_options(BuilderOptions::default())
    }

    /// Create an empty builder with the given options.
    pub fn with_options(options: BuilderOptions) -> Self {
        Self::from_buffer_with_options(Buffer::new(), options)
    }

    /// Transfer the buffer to the caller and reset the builder to empty.
    pub fn steal(&mut self) -> Buffer {
        let buffer = std::mem::take(&mut self.buffer);
        self.clear();
        buffer
    }

    /// Consume the builder, yielding the sealed bytes.
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        if !self.is_closed() {
            return Err(CbvError::BuilderNotSealed);
        }
        Ok(self.steal().into_vec())
    }
}

impl Default for Builder<Buffer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: BorrowMut<Buffer>> Builder<B> {
    /// Build into an existing buffer, appending after its content.
    pub fn from_buffer(buffer: B) -> Self {
        Self::from_buffer_with_options(buffer, BuilderOptions::default())
    }

    /// Build into an existing buffer with the given options.
    pub fn from_buffer_with_options(buffer: B, options: BuilderOptions) -> Self {
        Self {
            buffer,
            stack: SmallVec::new(),
            indexes: Vec::new(),
            key_written: false,
            options,
        }
    }

    /// The backing buffer.
    pub fn buffer(&self) -> &Buffer {
        <B as Borrow<Buffer>>::borrow(&self.buffer)
    }

    /// Ensure room for at least `len` more bytes.
    pub fn reserve(&mut self, len: usize) {
        self.buf().reserve(len);
    }

    /// Discard all state and start from scratch.
    pub fn clear(&mut self) {
        self.buf().reset();
        self.stack.clear();
        self.indexes.clear();
        self.key_written = false;
    }

    /// Whether nothing has been emitted yet.
    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    /// Whether no array or object is currently open.
    pub fn is_closed(&self) -> bool {
        self.stack.is_empty()
    }

    /// Whether the innermost open container is an array.
    pub fn is_open_array(&self) -> bool {
        self.open_head()
            .is_some_and(|head| head == HEAD_ARRAY_INDEXED || head == HEAD_ARRAY_COMPACT)
    }

    /// Whether the innermost open container is an object.
    pub fn is_open_object(&self) -> bool {
        self.open_head()
            .is_some_and(|head| head == HEAD_OBJECT_INDEXED || head == HEAD_OBJECT_COMPACT)
    }

    /// Total number of emitted bytes. Legal only when sealed.
    pub fn size(&self) -> Result<usize> {
        if !self.is_closed() {
            return Err(CbvError::BuilderNotSealed);
        }
        Ok(self.buffer().len())
    }

    /// The emitted bytes. Legal only when sealed.
    pub fn data(&self) -> Result<&[u8]> {
        if !self.is_closed() {
            return Err(CbvError::BuilderNotSealed);
        }
        Ok(self.buffer().as_slice())
    }

    /// A view of the first emitted top-level value. Legal only when
    /// sealed.
    pub fn slice(&self) -> Result<Slice<'_>> {
        let data = self.data()?;
        if data.is_empty() {
            return Ok(Slice::none());
        }
        Ok(Slice::new(data))
    }

    /// Open an array. Inside an object a pending key must have been
    /// written first.
    pub fn open_array(&mut self, unindexed: bool) -> Result<&mut Self> {
        self.open_compound(if unindexed {
            HEAD_ARRAY_COMPACT
        } else {
            HEAD_ARRAY_INDEXED
        })?;
        Ok(self)
    }

    /// Open an object.
    pub fn open_object(&mut self, unindexed: bool) -> Result<&mut Self> {
        self.open_compound(if unindexed {
            HEAD_OBJECT_COMPACT
        } else {
            HEAD_OBJECT_INDEXED
        })?;
        Ok(self)
    }

    /// Add a value to the current container, or as a top-level value when
    /// nothing is open. Returns the buffer offset of the written head.
    pub fn add(&mut self, value: Value<'_>) -> Result<usize> {
        self.add_internal(move |b| b.set(&value))
    }

    /// Add a pre-encoded value, copied verbatim.
    pub fn add_slice(&mut self, slice: Slice<'_>) -> Result<usize> {
        self.add_internal(move |b| b.set_slice(slice))
    }

    /// Add a key and value to the innermost open object.
    pub fn add_key_value(&mut self, key: &str, value: Value<'_>) -> Result<usize> {
        self.require_open_object()?;
        self.add_internal(move |b| {
            b.write_key(key);
            b.key_written = true;
            b.set(&value)
        })
    }

    /// Add a key and a pre-encoded value to the innermost open object.
    pub fn add_key_slice(&mut self, key: &str, slice: Slice<'_>) -> Result<usize> {
        self.require_open_object()?;
        self.add_internal(move |b| {
            b.write_key(key);
            b.key_written = true;
            b.set_slice(slice)
        })
    }

    /// Add a value wrapped in a tag prefix; `tag == 0` adds the bare
    /// value. Returns the offset of the wrapped value's head.
    pub fn add_tagged(&mut self, tag: u64, value: Value<'_>) -> Result<usize> {
        self.add_internal(move |b| {
            if tag != 0 {
                b.append_tag(tag);
            }
            b.set(&value)
        })
    }

    /// Add a key and a tagged value to the innermost open object.
    pub fn add_key_value_tagged(&mut self, key: &str, tag: u64, value: Value<'_>) -> Result<usize> {
        self.require_open_object()?;
        self.add_internal(move |b| {
            b.write_key(key);
            b.key_written = true;
            if tag != 0 {
                b.append_tag(tag);
            }
            b.set(&value)
        })
    }

    /// Add an external value: head byte plus the raw machine address.
    pub fn add_external(&mut self, value: *const u8) -> Result<usize> {
        self.add(Value::External(value))
    }

    /// Run a serializer callback against this builder. The callback is
    /// expected to append exactly one value through the regular add
    /// operations; on error everything it wrote is rolled back.
    pub fn add_with<T>(
        &mut self,
        serializer: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let pos = self.buffer().len();
        let index_len = self.indexes.len();
        let key_written = self.key_written;
        match serializer(self) {
            Ok(value) => Ok(value),
            Err(error) => {
                self.buf().reset_to(pos);
                self.indexes.truncate(index_len);
                self.key_written = key_written;
                Err(error)
            }
        }
    }

    /// Seal the innermost open array or object.
    pub fn close(&mut self) -> Result<&mut Self> {
        let frame = match self.stack.last() {
            Some(frame) => *frame,
            None => return Err(CbvError::BuilderNeedOpenCompound),
        };
        let head = self.bytes()[frame.start_pos];
        debug_assert!(matches!(
            head,
            HEAD_ARRAY_INDEXED | HEAD_OBJECT_INDEXED | HEAD_ARRAY_COMPACT | HEAD_OBJECT_COMPACT
        ));
        let is_array = head == HEAD_ARRAY_INDEXED || head == HEAD_ARRAY_COMPACT;
        let n = self.indexes.len() - frame.index_start;

        if n == 0 {
            return self.close_empty(frame, is_array);
        }

        if head == HEAD_ARRAY_COMPACT
            || head == HEAD_OBJECT_COMPACT
            || (head == HEAD_ARRAY_INDEXED && self.options.build_unindexed_arrays)
            || (head == HEAD_OBJECT_INDEXED && self.options.build_unindexed_objects)
        {
            if self.close_compact(frame, is_array, n)? {
                return Ok(self);
            }
        }

        if is_array {
            self.close_array(frame, n);
        } else {
            self.close_object(frame, n)?;
        }
        Ok(self)
    }

    /// Whether the innermost open object already carries `key`.
    pub fn has_key(&self, key: &str) -> Result<bool> {
        Ok(self.get_key(key)?.is_some())
    }

    /// The value already written under `key` in the innermost open
    /// object.
    pub fn get_key(&self, key: &str) -> Result<Option<Slice<'_>>> {
        let frame = match self.stack.last() {
            Some(frame) => *frame,
            None => return Err(CbvError::BuilderNeedOpenObject),
        };
        let data = self.bytes();
        let head = data[frame.start_pos];
        if head != HEAD_OBJECT_INDEXED && head != HEAD_OBJECT_COMPACT {
            return Err(CbvError::BuilderNeedOpenObject);
        }
        if self.key_written {
            return Err(CbvError::BuilderKeyAlreadyWritten);
        }

        let translator = self.options.attribute_translator.as_deref();
        for &offset in &self.indexes[frame.index_start..] {
            let entry = Slice::new(&data[frame.start_pos + offset..]);
            if let Ok(entry_key) = resolve_key_bytes(&entry, translator) {
                if entry_key == key.as_bytes() {
                    let position = frame.start_pos + offset + entry.byte_size();
                    return Ok(Some(Slice::new(&data[position..])));
                }
            }
        }
        Ok(None)
    }

    fn buf(&mut self) -> &mut Buffer {
        <B as BorrowMut<Buffer>>::borrow_mut(&mut self.buffer)
    }

    fn bytes(&self) -> &[u8] {
        self.buffer().as_slice()
    }

    fn open_head(&self) -> Option<u8> {
        self.stack
            .last()
            .map(|frame| self.bytes()[frame.start_pos])
    }

    /// Report-then-compensate wrapper: records the child's offset before
    /// writing it and restores cursor, index tail and key state on any
    /// failure inside `write`.
    fn add_internal<T>(&mut self, write: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let pos = self.buffer().len();
        let index_len = self.indexes.len();
        let key_written = self.key_written;

        if let Some(frame) = self.stack.last() {
            if !key_written {
                let base = frame.start_pos;
                self.indexes.push(pos - base);
            }
        }

        match write(self) {
            Ok(value) => Ok(value),
            Err(error) => {
                self.buf().reset_to(pos);
                self.indexes.truncate(index_len);
                self.key_written = key_written;
                Err(error)
            }
        }
    }

    fn require_open_object(&self) -> Result<()> {
        let frame = match self.stack.last() {
            Some(frame) => frame,
            None => return Err(CbvError::BuilderNeedOpenObject),
        };
        let head = self.bytes()[frame.start_pos];
        if head != HEAD_OBJECT_INDEXED && head != HEAD_OBJECT_COMPACT {
            return Err(CbvError::BuilderNeedOpenObject);
        }
        if self.key_written {
            return Err(CbvError::BuilderKeyAlreadyWritten);
        }
        Ok(())
    }

    /// Inside an object, a pending key slot only accepts key-shaped
    /// values; the flag flips between key and value positions.
    fn check_key(&mut self, valid_key: bool) -> Result<()> {
        if let Some(frame) = self.stack.last() {
            let head = self.bytes()[frame.start_pos];
            if head == HEAD_OBJECT_INDEXED || head == HEAD_OBJECT_COMPACT {
                if !self.key_written && !valid_key {
                    return Err(CbvError::BuilderKeyMustBeString);
                }
                self.key_written = !self.key_written;
            }
        }
        Ok(())
    }

    fn set(&mut self, item: &Value<'_>) -> Result<usize> {
        let old_pos = self.buffer().len();
        self.check_key(item.is_valid_key(self.options.translator_active()))?;
        match *item {
            Value::Null => self.buf().push(HEAD_NULL),
            Value::Bool(false) => self.buf().push(HEAD_FALSE),
            Value::Bool(true) => self.buf().push(HEAD_TRUE),
            Value::Double(v) => {
                let buf = self.buf();
                buf.reserve(9);
                buf.push(HEAD_DOUBLE);
                buf.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Value::Int(v) => self.write_int(v),
            Value::UInt(v) => self.write_uint(v),
            Value::UtcDate(v) => {
                let buf = self.buf();
                buf.reserve(9);
                buf.push(HEAD_UTC_DATE);
                buf.extend_from_slice(&(v as u64).to_le_bytes());
            }
            Value::String(s) => self.write_string(s.as_bytes()),
            Value::Binary(b) => self.write_binary(b),
            Value::External(p) => self.write_external(p)?,
            Value::Bcd {
                negative,
                exponent,
                digits,
            } => self.write_bcd(negative, exponent, digits)?,
            Value::MinKey => self.buf().push(HEAD_MIN_KEY),
            Value::MaxKey => self.buf().push(HEAD_MAX_KEY),
            Value::Array { unindexed } => self.add_compound(if unindexed {
                HEAD_ARRAY_COMPACT
            } else {
                HEAD_ARRAY_INDEXED
            }),
            Value::Object { unindexed } => self.add_compound(if unindexed {
                HEAD_OBJECT_COMPACT
            } else {
                HEAD_OBJECT_INDEXED
            }),
        }
        Ok(old_pos)
    }

    fn set_slice(&mut self, slice: Slice<'_>) -> Result<usize> {
        let old_pos = self.buffer().len();
        let valid_key = slice.is_string()
            || (self.options.translator_active() && (slice.is_small_int() || slice.is_uint()));
        self.check_key(valid_key)?;
        let bytes = slice.as_bytes();
        self.buf().extend_from_slice(bytes);
        Ok(old_pos)
    }

    fn write_key(&mut self, key: &str) {
        let translator = self.options.attribute_translator.clone();
        if let Some(table) = translator.as_deref() {
            if let Some(token) = table.translate(key) {
                self.buf().extend_from_slice(token);
                return;
            }
            // unknown key, fall through to regular string encoding
        }
        self.write_string(key.as_bytes());
    }

    fn write_int(&mut self, v: i64) {
        if (0..=9).contains(&v) {
            self.buf().push(HEAD_SMALL_INT_BASE + v as u8);
        } else if (-6..=-1).contains(&v) {
            self.buf().push((0x40 + v) as u8);
        } else {
            self.append_int(v, HEAD_INT_BASE - 1);
        }
    }

    fn write_uint(&mut self, v: u64) {
        if v <= 9 {
            self.buf().push(HEAD_SMALL_INT_BASE + v as u8);
        } else {
            self.append_uint(v, HEAD_UINT_BASE - 1);
        }
    }

    fn append_int(&mut self, v: i64, base: u8) {
        let size = int_length(v);
        // truncating to `size` bytes keeps the two's complement value
        let mut x = v as u64;
        let buf = self.buf();
        buf.reserve(1 + size as usize);
        buf.push(base + size);
        for _ in 0..size {
            buf.push(x as u8);
            x >>= 8;
        }
    }

    fn append_uint(&mut self, v: u64, base: u8) {
        let mut size = 1u8;
        let mut x = v >> 8;
        while x != 0 {
            size += 1;
            x >>= 8;
        }
        let buf = self.buf();
        buf.reserve(1 + size as usize);
        buf.push(base + size);
        let mut v = v;
        for _ in 0..size {
            buf.push(v as u8);
            v >>= 8;
        }
    }

    fn write_string(&mut self, bytes: &[u8]) {
        let buf = self.buf();
        if bytes.len() > MAX_SHORT_STRING_LEN {
            buf.reserve(9 + bytes.len());
            buf.push(HEAD_STRING_LONG);
            buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        } else {
            buf.reserve(1 + bytes.len());
            buf.push(HEAD_STRING_BASE + bytes.len() as u8);
        }
        buf.extend_from_slice(bytes);
    }

    fn write_binary(&mut self, bytes: &[u8]) {
        let mut size = 1u8;
        let mut x = bytes.len() >> 8;
        while x != 0 {
            size += 1;
            x >>= 8;
        }
        let buf = self.buf();
        buf.reserve(1 + size as usize + bytes.len());
        buf.push(HEAD_BINARY_BASE + size - 1);
        let mut len = bytes.len() as u64;
        for _ in 0..size {
            buf.push(len as u8);
            len >>= 8;
        }
        buf.extend_from_slice(bytes);
    }

    fn write_external(&mut self, value: *const u8) -> Result<()> {
        if self.options.disallow_externals {
            return Err(CbvError::BuilderExternalsDisallowed);
        }
        let buf = self.buf();
        buf.reserve(1 + std::mem::size_of::<usize>());
        buf.push(HEAD_EXTERNAL);
        // raw machine address, not portable across processes
        buf.extend_from_slice(&(value as usize).to_ne_bytes());
        Ok(())
    }

    fn write_bcd(&mut self, negative: bool, exponent: i32, digits: &[u8]) -> Result<()> {
        if self.options.disallow_bcd {
            return Err(CbvError::BuilderBcdDisallowed);
        }
        if digits.is_empty() {
            return Err(CbvError::NumberOutOfRange("BCD mantissa is empty".to_string()));
        }
        if let Some(&digit) = digits.iter().find(|&&digit| digit > 9) {
            return Err(CbvError::NumberOutOfRange(format!(
                "BCD digit {} exceeds 9",
                digit
            )));
        }

        let is_odd = digits.len() % 2 != 0;
        let byte_len = digits.len() / 2 + usize::from(is_odd);
        let mut n = 0u8;
        let mut x = byte_len;
        while x != 0 {
            n += 1;
            x >>= 8;
        }

        let head_base = if negative {
            HEAD_BCD_NEGATIVE
        } else {
            HEAD_BCD_POSITIVE
        };
        let buf = self.buf();
        buf.reserve(1 + n as usize + 4 + byte_len);
        buf.push(head_base + n - 1);
        let mut v = byte_len as u64;
        for _ in 0..n {
            buf.push(v as u8);
            v >>= 8;
        }
        buf.extend_from_slice(&exponent.to_le_bytes());

        let mut i = 0;
        if is_odd {
            buf.push(digits[0]);
            i = 1;
        }
        while i < digits.len() {
            buf.push((digits[i] << 4) | digits[i + 1]);
            i += 2;
        }
        Ok(())
    }

    fn append_tag(&mut self, tag: u64) {
        let buf = self.buf();
        if tag <= 0xff {
            buf.reserve(2);
            buf.push(HEAD_TAGGED_SHORT);
            buf.push(tag as u8);
        } else {
            buf.reserve(9);
            buf.push(HEAD_TAGGED_LONG);
            buf.extend_from_slice(&tag.to_le_bytes());
        }
    }

    fn open_compound(&mut self, head: u8) -> Result<()> {
        match self.stack.last().copied() {
            None => self.add_compound(head),
            Some(_) if self.key_written => {
                self.key_written = false;
                self.add_compound(head);
            }
            Some(frame) => {
                let top_head = self.bytes()[frame.start_pos];
                if top_head != HEAD_ARRAY_INDEXED && top_head != HEAD_ARRAY_COMPACT {
                    return Err(CbvError::BuilderNeedOpenArray);
                }
                self.indexes.push(self.buffer().len() - frame.start_pos);
                self.add_compound(head);
            }
        }
        Ok(())
    }

    fn add_compound(&mut self, head: u8) {
        let pos = self.buffer().len();
        self.stack.push(Frame {
            start_pos: pos,
            index_start: self.indexes.len(),
        });
        let buf = self.buf();
        buf.reserve(9);
        buf.push(head);
        // filled on close with byte length and item count
        buf.extend_from_slice(&[0u8; 8]);
    }

    fn pop_frame(&mut self, frame: Frame) {
        self.stack.pop();
        self.indexes.truncate(frame.index_start);
    }

    fn close_empty(&mut self, frame: Frame, is_array: bool) -> Result<&mut Self> {
        let pos = frame.start_pos;
        let buf = self.buf();
        buf.as_mut_slice()[pos] = if is_array {
            HEAD_EMPTY_ARRAY
        } else {
            HEAD_EMPTY_OBJECT
        };
        buf.reset_to(pos + 1);
        self.pop_frame(frame);
        Ok(self)
    }

    /// Compact close: varint byte length after the head, reversed varint
    /// item count at the tail, no index table. Gives up (returning false)
    /// when the byte length does not fit an eight-byte varint.
    fn close_compact(&mut self, frame: Frame, is_array: bool, n: usize) -> Result<bool> {
        let pos = frame.start_pos;
        let end = self.buffer().len();
        let body = end - (pos + 9);

        let count_len = varint_length(n as u64);
        let mut byte_size = 1 + body + count_len;
        let mut length_len = varint_length(byte_size as u64);
        byte_size += length_len;
        if varint_length(byte_size as u64) != length_len {
            byte_size += 1;
            length_len += 1;
        }
        if length_len > 8 {
            return Ok(false);
        }

        if !is_array && self.options.check_attribute_uniqueness && n > 1 {
            self.check_unique_unsorted(pos, frame.index_start, n)?;
        }

        let target = pos + 1 + length_len;
        let buf = self.buf();
        if body > 0 && target != pos + 9 {
            buf.copy_within(pos + 9..end, target);
        }
        buf.reset_to(target + body);

        let data = buf.as_mut_slice();
        data[pos] = if is_array {
            HEAD_ARRAY_COMPACT
        } else {
            HEAD_OBJECT_COMPACT
        };
        let length_bytes = encode_varint(byte_size as u64);
        data[pos + 1..pos + 1 + length_len].copy_from_slice(&length_bytes);

        let count_bytes = encode_varint_reversed(n as u64);
        buf.extend_from_slice(&count_bytes);

        self.pop_frame(frame);
        Ok(true)
    }

    fn close_array(&mut self, frame: Frame, n: usize) {
        let pos = frame.start_pos;
        let end = self.buffer().len();
        let distance = end - pos;
        let body = distance - 9;

        // single-element arrays and equal-size runs drop the index table
        // and the count field; the count is then derived by division
        let mut need_index_table = true;
        if n == 1 {
            need_index_table = false;
        } else {
            let index = &self.indexes[frame.index_start..];
            let sub_len = index[1] - index[0];
            if distance - index[0] == n * sub_len
                && distance - index[n - 1] == sub_len
                && index.windows(2).all(|pair| pair[1] - pair[0] == sub_len)
            {
                need_index_table = false;
            }
        }
        let need_nr_subs = need_index_table;

        let offset_size = self.pick_offset_size(body, n, need_index_table, need_nr_subs);
        self.shift_body_down(frame, offset_size, need_nr_subs, need_index_table, body, end);

        if need_index_table {
            self.write_index_table(frame.index_start, n, offset_size);
        }
        if need_nr_subs && offset_size == 8 {
            self.buf().extend_from_slice(&(n as u64).to_le_bytes());
        }

        let total = self.buffer().len() - pos;
        let data = self.buf().as_mut_slice();
        let base = if need_index_table {
            HEAD_ARRAY_INDEXED
        } else {
            HEAD_ARRAY_PLAIN
        };
        data[pos] = base + width_log2(offset_size);
        write_le(data, pos + 1, offset_size, total as u64);
        if need_nr_subs && offset_size < 8 {
            write_le(data, pos + 1 + offset_size, offset_size, n as u64);
        }

        self.pop_frame(frame);
    }

    fn close_object(&mut self, frame: Frame, n: usize) -> Result<()> {
        let pos = frame.start_pos;
        let end = self.buffer().len();
        let body = end - pos - 9;

        let sorted = n >= 2 && !self.options.build_unsorted_objects;
        if sorted {
            self.sort_object_index(
                pos,
                frame.index_start,
                n,
                self.options.check_attribute_uniqueness,
            )?;
        } else if self.options.check_attribute_uniqueness && n > 1 {
            self.check_unique_unsorted(pos, frame.index_start, n)?;
        }

        let offset_size = self.pick_offset_size(body, n, true, true);
        self.shift_body_down(frame, offset_size, true, true, body, end);

        self.write_index_table(frame.index_start, n, offset_size);
        if offset_size == 8 {
            self.buf().extend_from_slice(&(n as u64).to_le_bytes());
        }

        let total = self.buffer().len() - pos;
        let data = self.buf().as_mut_slice();
        data[pos] = HEAD_OBJECT_INDEXED + width_log2(offset_size);
        write_le(data, pos + 1, offset_size, total as u64);
        if offset_size < 8 {
            write_le(data, pos + 1 + offset_size, offset_size, n as u64);
        }

        self.pop_frame(frame);
        Ok(())
    }

    /// Smallest offset width whose final byte length fits the width's
    /// length field. Child offsets are below the byte length, so they fit
    /// whenever the length does.
    fn pick_offset_size(
        &self,
        body: usize,
        n: usize,
        need_index_table: bool,
        need_nr_subs: bool,
    ) -> usize {
        for width in [1usize, 2, 4] {
            let total = self.header_size(width, need_nr_subs)
                + body
                + if need_index_table { n * width } else { 0 };
            if total as u64 <= max_container_length(width) {
                return width;
            }
        }
        8
    }

    /// Final header size (head byte through the last fixed field) for a
    /// container closed at `width`, honoring the padding mode.
    fn header_size(&self, width: usize, need_nr_subs: bool) -> usize {
        match (width, self.options.padding_behavior) {
            (8, _) => 9,
            (_, PaddingBehavior::UsePadding) => 9,
            (4, PaddingBehavior::Flexible) => 9,
            (width, _) => 1 + width + if need_nr_subs { width } else { 0 },
        }
    }

    /// Move the body down over the unused part of the reserved header and
    /// adjust the frame's child offsets.
    fn shift_body_down(
        &mut self,
        frame: Frame,
        offset_size: usize,
        need_nr_subs: bool,
        need_index_table: bool,
        body: usize,
        end: usize,
    ) {
        let pos = frame.start_pos;
        let header = self.header_size(offset_size, need_nr_subs);
        let diff = 9 - header;
        if diff == 0 {
            return;
        }
        let buf = self.buf();
        if body > 0 {
            buf.copy_within(pos + 9..end, pos + header);
        }
        buf.rollback(diff);
        if need_index_table {
            for offset in &mut self.indexes[frame.index_start..] {
                *offset -= diff;
            }
        }
    }

    fn write_index_table(&mut self, index_start: usize, n: usize, offset_size: usize) {
        self.buf().reserve(n * offset_size);
        for i in 0..n {
            let mut x = self.indexes[index_start + i] as u64;
            let buf = self.buf();
            for _ in 0..offset_size {
                buf.push(x as u8);
                x >>= 8;
            }
        }
    }

    /// Sort the frame's index entries by the byte order of the key each
    /// one points to; optionally fail on adjacent duplicates.
    fn sort_object_index(
        &mut self,
        object_pos: usize,
        index_start: usize,
        n: usize,
        check_unique: bool,
    ) -> Result<()> {
        let translator = self.options.attribute_translator.clone();
        let data = <B as Borrow<Buffer>>::borrow(&self.buffer).as_slice();

        let mut entries: Vec<(&[u8], usize)> = Vec::with_capacity(n);
        for &offset in &self.indexes[index_start..index_start + n] {
            let key = Slice::new(&data[object_pos + offset..]);
            entries.push((resolve_key_bytes(&key, translator.as_deref())?, offset));
        }

        if n <= INSERTION_SORT_THRESHOLD {
            insertion_sort(&mut entries);
        } else {
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        }

        if check_unique {
            for pair in entries.windows(2) {
                if pair[0].0 == pair[1].0 {
                    return Err(CbvError::DuplicateAttributeName(
                        String::from_utf8_lossy(pair[0].0).into_owned(),
                    ));
                }
            }
        }

        for (slot, entry) in self.indexes[index_start..].iter_mut().zip(&entries) {
            *slot = entry.1;
        }
        Ok(())
    }

    fn check_unique_unsorted(&self, object_pos: usize, index_start: usize, n: usize) -> Result<()> {
        let translator = self.options.attribute_translator.as_deref();
        let data = self.bytes();
        let mut seen = HashSet::with_capacity(n);
        for &offset in &self.indexes[index_start..index_start + n] {
            let key = Slice::new(&data[object_pos + offset..]);
            let key_bytes = resolve_key_bytes(&key, translator)?;
            if !seen.insert(key_bytes) {
                return Err(CbvError::DuplicateAttributeName(
                    String::from_utf8_lossy(key_bytes).into_owned(),
                ));
            }
        }
        Ok(())
    }
}

/// Number of bytes needed to store `value` in two's complement.
fn int_length(value: i64) -> u8 {
    if (-0x80..=0x7f).contains(&value) {
        return 1;
    }
    let mut x = if value >= 0 {
        value as u64
    } else {
        (-(value + 1)) as u64
    };
    let mut size = 1u8;
    loop {
        x >>= 8;
        size += 1;
        if x < 0x80 {
            break;
        }
    }
    size
}

fn width_log2(width: usize) -> u8 {
    match width {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => 3,
    }
}

fn max_container_length(width: usize) -> u64 {
    match width {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

fn write_le(data: &mut [u8], offset: usize, len: usize, value: u64) {
    let mut x = value;
    for i in 0..len {
        data[offset + i] = x as u8;
        x >>= 8;
    }
}

fn insertion_sort(entries: &mut [(&[u8], usize)]) {
    for i in 1..entries.len() {
        let mut j = i;
        while j > 0 && entries[j - 1].0 > entries[j].0 {
            entries.swap(j - 1, j);
            j -= 1;
        }
    }
}

/// Scope guard that opens an array on construction and closes it when
/// dropped, on success and failure paths alike. Nested guards close in
/// reverse order of opening.
pub struct ArrayGuard<'b, B: BorrowMut<Buffer> = Buffer> {
    builder: &'b mut Builder<B>,
    depth: usize,
}

impl<'b, B: BorrowMut<Buffer>> ArrayGuard<'b, B> {
    /// Open an array on `builder`.
    pub fn new(builder: &'b mut Builder<B>, unindexed: bool) -> Result<Self> {
        builder.open_array(unindexed)?;
        let depth = builder.stack.len();
        Ok(Self { builder, depth })
    }

    /// Open an array as the value of `key` in the enclosing object.
    pub fn new_with_key(builder: &'b mut Builder<B>, key: &str, unindexed: bool) -> Result<Self> {
        builder.add_key_value(key, Value::Array { unindexed })?;
        let depth = builder.stack.len();
        Ok(Self { builder, depth })
    }

    /// Close eagerly, surfacing errors a drop would swallow.
    pub fn close(self) -> Result<()> {
        let mut guard = std::mem::ManuallyDrop::new(self);
        guard.builder.close().map(|_| ())
    }
}

impl<B: BorrowMut<Buffer>> Drop for ArrayGuard<'_, B> {
    fn drop(&mut self) {
        while self.builder.stack.len() >= self.depth {
            if self.builder.close().is_err() {
                break;
            }
        }
    }
}

impl<B: BorrowMut<Buffer>> Deref for ArrayGuard<'_, B> {
    type Target = Builder<B>;

    fn deref(&self) -> &Self::Target {
        self.builder
    }
}

impl<B: BorrowMut<Buffer>> DerefMut for ArrayGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.builder
    }
}

/// Scope guard that opens an object on construction and closes it when
/// dropped.
pub struct ObjectGuard<'b, B: BorrowMut<Buffer> = Buffer> {
    builder: &'b mut Builder<B>,
    depth: usize,
}

impl<'b, B: BorrowMut<Buffer>> ObjectGuard<'b, B> {
    /// Open an object on `builder`.
    pub fn new(builder: &'b mut Builder<B>, unindexed: bool) -> Result<Self> {
        builder.open_object(unindexed)?;
        let depth = builder.stack.len();
        Ok(Self { builder, depth })
    }

    /// Open an object as the value of `key` in the enclosing object.
    pub fn new_with_key(builder: &'b mut Builder<B>, key: &str, unindexed: bool) -> Result<Self> {
        builder.add_key_value(key, Value::Object { unindexed })?;
        let depth = builder.stack.len();
        Ok(Self { builder, depth })
    }

    /// Close eagerly, surfacing errors a drop would swallow.
    pub fn close(self) -> Result<()> {
        let mut guard = std::mem::ManuallyDrop::new(self);
        guard.builder.close().map(|_| ())
    }
}

impl<B: BorrowMut<Buffer>> Drop for ObjectGuard<'_, B> {
    fn drop(&mut self) {
        while self.builder.stack.len() >= self.depth {
            if self.builder.close().is_err() {
                break;
            }
        }
    }
}

impl<B: BorrowMut<Buffer>> Deref for ObjectGuard<'_, B> {
    type Target = Builder<B>;

    fn deref(&self) -> &Self::Target {
        self.builder
    }
}

impl<B: BorrowMut<Buffer>> DerefMut for ObjectGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.builder
    }
}
