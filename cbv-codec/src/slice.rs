//! Non-owning view over an encoded value
//!
//! A slice points at the head byte of one encoded value and decodes head
//! and payload on demand. Containers support random access through their
//! index tables without touching sibling values. Slices assume input that
//! a builder produced; malformed bytes may panic but never read out of
//! bounds unchecked.

use cbv_format::error::{CbvError, Result};
use cbv_format::tags::{self, ValueType};
use cbv_format::varint::{decode_varint, decode_varint_reversed};

use crate::translator::AttributeTranslator;

/// Objects with at least this many entries use binary search in `get`.
const SORTED_SEARCH_THRESHOLD: usize = 4;

static NONE_SLICE: [u8; 1] = [tags::HEAD_NONE];

/// A non-owning view positioned at the head byte of an encoded value.
///
/// The underlying byte range may extend past the value; all accessors
/// limit themselves to `byte_size` bytes.
#[derive(Clone, Copy)]
pub struct Slice<'a> {
    data: &'a [u8],
}

/// Decoded parts of a BCD number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bcd<'a> {
    /// Sign of the number
    pub negative: bool,
    /// Base-10 exponent
    pub exponent: i32,
    /// Packed mantissa, two digits per byte, most significant first
    pub mantissa: &'a [u8],
}

impl<'a> Slice<'a> {
    /// View a byte range whose first byte is a value head.
    pub fn new(data: &'a [u8]) -> Self {
        debug_assert!(!data.is_empty());
        Self { data }
    }

    /// The none sentinel slice.
    pub fn none() -> Slice<'static> {
        Slice { data: &NONE_SLICE }
    }

    /// The head byte.
    pub fn head(&self) -> u8 {
        self.data[0]
    }

    /// Classification of the head byte.
    pub fn value_type(&self) -> ValueType {
        tags::value_type(self.head())
    }

    /// Whether this is the none sentinel.
    pub fn is_none(&self) -> bool {
        self.head() == tags::HEAD_NONE
    }

    /// Whether this is a null value.
    pub fn is_null(&self) -> bool {
        self.head() == tags::HEAD_NULL
    }

    /// Whether this is a boolean.
    pub fn is_bool(&self) -> bool {
        self.value_type() == ValueType::Bool
    }

    /// Whether this is an array in any encoding.
    pub fn is_array(&self) -> bool {
        self.value_type() == ValueType::Array
    }

    /// Whether this is an object in any encoding.
    pub fn is_object(&self) -> bool {
        self.value_type() == ValueType::Object
    }

    /// Whether this is a double.
    pub fn is_double(&self) -> bool {
        self.value_type() == ValueType::Double
    }

    /// Whether this is a UTC date.
    pub fn is_utc_date(&self) -> bool {
        self.value_type() == ValueType::UtcDate
    }

    /// Whether this is an external.
    pub fn is_external(&self) -> bool {
        self.value_type() == ValueType::External
    }

    /// Whether this is a signed integer with explicit payload.
    pub fn is_int(&self) -> bool {
        self.value_type() == ValueType::Int
    }

    /// Whether this is an unsigned integer with explicit payload.
    pub fn is_uint(&self) -> bool {
        self.value_type() == ValueType::UInt
    }

    /// Whether this is an inline small integer.
    pub fn is_small_int(&self) -> bool {
        self.value_type() == ValueType::SmallInt
    }

    /// Whether this is any integer form.
    pub fn is_integer(&self) -> bool {
        matches!(
            self.value_type(),
            ValueType::Int | ValueType::UInt | ValueType::SmallInt
        )
    }

    /// Whether this is a string.
    pub fn is_string(&self) -> bool {
        self.value_type() == ValueType::String
    }

    /// Whether this is a binary blob.
    pub fn is_binary(&self) -> bool {
        self.value_type() == ValueType::Binary
    }

    /// Whether this is a BCD number.
    pub fn is_bcd(&self) -> bool {
        self.value_type() == ValueType::Bcd
    }

    /// Whether this is a tagged value.
    pub fn is_tagged(&self) -> bool {
        self.value_type() == ValueType::Tagged
    }

    /// Total size of this value in bytes, including head and payload.
    /// Tagged values include their tag prefix.
    pub fn byte_size(&self) -> usize {
        let head = self.head();
        match head {
            0x00 | 0x01 | 0x0a | 0x17..=0x1a | 0x1e | 0x1f | 0x30..=0x3f => 1,
            0x02..=0x05 => self.read_le(1, 1 << (head - 0x02)) as usize,
            0x06..=0x09 => self.read_le(1, 1 << (head - 0x06)) as usize,
            0x0b..=0x0e => self.read_le(1, 1 << (head - 0x0b)) as usize,
            0x13 | 0x14 => match decode_varint(&self.data[1..]) {
                Ok((length, _)) => length as usize,
                Err(_) => panic!("malformed compact container length"),
            },
            0x1b | 0x1c => 9,
            0x1d => 1 + std::mem::size_of::<usize>(),
            0x20..=0x27 => 1 + (head - 0x1f) as usize,
            0x28..=0x2f => 1 + (head - 0x27) as usize,
            0x40..=0xbe => 1 + (head - 0x40) as usize,
            0xbf => 9 + self.read_le(1, 8) as usize,
            0xc0..=0xc7 => {
                let n = (head - 0xc0 + 1) as usize;
                1 + n + 4 + self.read_le(1, n) as usize
            }
            0xc8..=0xcf => {
                let n = (head - 0xc7) as usize;
                1 + n + self.read_le(1, n) as usize
            }
            0xd0..=0xd7 => {
                let n = (head - 0xd0 + 1) as usize;
                1 + n + 4 + self.read_le(1, n) as usize
            }
            0xee => 2 + Slice::new(&self.data[2..]).byte_size(),
            0xef => 9 + Slice::new(&self.data[9..]).byte_size(),
            _ => 1,
        }
    }

    /// Exactly the bytes of this value.
    pub fn as_bytes(&self) -> &'a [u8] {
        &self.data[..self.byte_size()]
    }

    /// Boolean payload.
    pub fn get_bool(&self) -> Result<bool> {
        match self.head() {
            tags::HEAD_FALSE => Ok(false),
            tags::HEAD_TRUE => Ok(true),
            _ => Err(self.type_error("bool")),
        }
    }

    /// Double payload.
    pub fn get_double(&self) -> Result<f64> {
        if self.head() != tags::HEAD_DOUBLE {
            return Err(self.type_error("double"));
        }
        Ok(f64::from_bits(self.read_le(1, 8)))
    }

    /// UTC date payload in signed milliseconds.
    pub fn get_utc_date(&self) -> Result<i64> {
        if self.head() != tags::HEAD_UTC_DATE {
            return Err(self.type_error("utc-date"));
        }
        Ok(self.read_le(1, 8) as i64)
    }

    /// Signed integer value of any integer form.
    pub fn get_int(&self) -> Result<i64> {
        let head = self.head();
        match head {
            0x20..=0x27 => {
                let len = (head - 0x1f) as usize;
                let mut x = self.read_le(1, len);
                if len < 8 && (x >> (8 * len - 1)) & 1 == 1 {
                    x |= u64::MAX << (8 * len);
                }
                Ok(x as i64)
            }
            0x28..=0x2f => {
                let x = self.read_le(1, (head - 0x27) as usize);
                i64::try_from(x).map_err(|_| {
                    CbvError::NumberOutOfRange(format!("uint {} overflows i64", x))
                })
            }
            0x30..=0x39 => Ok((head - 0x30) as i64),
            0x3a..=0x3f => Ok((head - 0x3a) as i64 - 6),
            _ => Err(self.type_error("integer")),
        }
    }

    /// Unsigned integer value of any non-negative integer form.
    pub fn get_uint(&self) -> Result<u64> {
        let head = self.head();
        match head {
            0x28..=0x2f => Ok(self.read_le(1, (head - 0x27) as usize)),
            0x20..=0x27 | 0x3a..=0x3f => {
                let v = self.get_int()?;
                u64::try_from(v).map_err(|_| {
                    CbvError::NumberOutOfRange(format!("int {} is negative", v))
                })
            }
            0x30..=0x39 => Ok((head - 0x30) as u64),
            _ => Err(self.type_error("unsigned integer")),
        }
    }

    /// Inline small integer value.
    pub fn get_smallint(&self) -> Result<i64> {
        match self.head() {
            0x30..=0x3f => self.get_int(),
            _ => Err(self.type_error("smallint")),
        }
    }

    /// Raw string payload bytes.
    pub fn string_bytes(&self) -> Result<&'a [u8]> {
        let head = self.head();
        match head {
            0x40..=0xbe => {
                let len = (head - 0x40) as usize;
                Ok(&self.data[1..1 + len])
            }
            0xbf => {
                let len = self.read_le(1, 8) as usize;
                Ok(&self.data[9..9 + len])
            }
            _ => Err(self.type_error("string")),
        }
    }

    /// String payload.
    pub fn get_string(&self) -> Result<&'a str> {
        let bytes = self.string_bytes()?;
        std::str::from_utf8(bytes)
            .map_err(|_| CbvError::Internal("string payload is not valid UTF-8".to_string()))
    }

    /// Binary blob payload.
    pub fn get_binary(&self) -> Result<&'a [u8]> {
        let head = self.head();
        match head {
            0xc8..=0xcf => {
                let n = (head - 0xc7) as usize;
                let len = self.read_le(1, n) as usize;
                Ok(&self.data[1 + n..1 + n + len])
            }
            _ => Err(self.type_error("binary")),
        }
    }

    /// Machine address stored in an external value.
    pub fn external(&self) -> Result<*const u8> {
        if self.head() != tags::HEAD_EXTERNAL {
            return Err(self.type_error("external"));
        }
        let width = std::mem::size_of::<usize>();
        let mut bytes = [0u8; std::mem::size_of::<usize>()];
        bytes.copy_from_slice(&self.data[1..1 + width]);
        Ok(usize::from_ne_bytes(bytes) as *const u8)
    }

    /// Decoded parts of a BCD number.
    pub fn get_bcd(&self) -> Result<Bcd<'a>> {
        let head = self.head();
        let (negative, n) = match head {
            0xc0..=0xc7 => (false, (head - 0xc0 + 1) as usize),
            0xd0..=0xd7 => (true, (head - 0xd0 + 1) as usize),
            _ => return Err(self.type_error("bcd")),
        };
        let mantissa_len = self.read_le(1, n) as usize;
        let exponent = self.read_le(1 + n, 4) as u32 as i32;
        let start = 1 + n + 4;
        Ok(Bcd {
            negative,
            exponent,
            mantissa: &self.data[start..start + mantissa_len],
        })
    }

    /// Tag carried by a tagged value.
    pub fn tag(&self) -> Result<u64> {
        match self.head() {
            tags::HEAD_TAGGED_SHORT => Ok(self.data[1] as u64),
            tags::HEAD_TAGGED_LONG => Ok(self.read_le(1, 8)),
            _ => Err(self.type_error("tagged")),
        }
    }

    /// The value behind a tag prefix; non-tagged slices return themselves.
    pub fn tagged_value(&self) -> Slice<'a> {
        match self.head() {
            tags::HEAD_TAGGED_SHORT => Slice::new(&self.data[2..]),
            tags::HEAD_TAGGED_LONG => Slice::new(&self.data[9..]),
            _ => *self,
        }
    }

    /// Number of items in an array, or key-value pairs in an object.
    pub fn length(&self) -> Result<usize> {
        let head = self.head();
        match head {
            0x01 | 0x0a => Ok(0),
            0x02..=0x05 => {
                let total = self.byte_size();
                let data_offset = self.data_offset();
                let item_size = Slice::new(&self.data[data_offset..]).byte_size();
                Ok((total - data_offset) / item_size)
            }
            0x06..=0x09 | 0x0b..=0x0e => {
                let width = index_width(head);
                if width == 8 {
                    Ok(self.read_le(self.byte_size() - 8, 8) as usize)
                } else {
                    Ok(self.read_le(1 + width, width) as usize)
                }
            }
            0x13 | 0x14 => {
                let total = self.byte_size();
                let (count, _) = decode_varint_reversed(&self.data[..total])?;
                Ok(count as usize)
            }
            _ => Err(self.type_error("array or object")),
        }
    }

    /// Item of an array by position.
    pub fn at(&self, index: usize) -> Result<Slice<'a>> {
        let head = self.head();
        match head {
            0x01 => Err(CbvError::IndexOutOfBounds),
            0x02..=0x05 => {
                let length = self.length()?;
                if index >= length {
                    return Err(CbvError::IndexOutOfBounds);
                }
                let data_offset = self.data_offset();
                let item_size = Slice::new(&self.data[data_offset..]).byte_size();
                Ok(Slice::new(&self.data[data_offset + index * item_size..]))
            }
            0x06..=0x09 => {
                let length = self.length()?;
                if index >= length {
                    return Err(CbvError::IndexOutOfBounds);
                }
                let offset = self.index_entry(head, length, index);
                Ok(Slice::new(&self.data[offset..]))
            }
            0x13 => {
                let length = self.length()?;
                if index >= length {
                    return Err(CbvError::IndexOutOfBounds);
                }
                let mut cursor = self.compact_data_offset()?;
                for _ in 0..index {
                    cursor += Slice::new(&self.data[cursor..]).byte_size();
                }
                Ok(Slice::new(&self.data[cursor..]))
            }
            _ => Err(self.type_error("array")),
        }
    }

    /// Key slice of an object entry by position. The key may be a string
    /// or a SmallInt/UInt token.
    pub fn key_at(&self, index: usize) -> Result<Slice<'a>> {
        let position = self.key_position(index)?;
        Ok(Slice::new(&self.data[position..]))
    }

    /// Value slice of an object entry by position.
    pub fn value_at(&self, index: usize) -> Result<Slice<'a>> {
        let position = self.key_position(index)?;
        let key = Slice::new(&self.data[position..]);
        Ok(Slice::new(&self.data[position + key.byte_size()..]))
    }

    /// Look up a key in an object. Sorted indexed objects with at least
    /// four entries use binary search.
    pub fn get(&self, key: &str) -> Result<Option<Slice<'a>>> {
        self.get_with_translator(key, None)
    }

    /// Look up a key, resolving token keys through `translator`.
    pub fn get_with_translator(
        &self,
        key: &str,
        translator: Option<&AttributeTranslator>,
    ) -> Result<Option<Slice<'a>>> {
        let head = self.head();
        match head {
            0x0a => Ok(None),
            0x0b..=0x0e => {
                let length = self.length()?;
                if length >= SORTED_SEARCH_THRESHOLD {
                    match self.get_sorted(key, length, translator) {
                        Ok(found) => Ok(found),
                        // token keys without a table break the ordering scan
                        Err(_) => self.get_linear(key, length, translator),
                    }
                } else {
                    self.get_linear(key, length, translator)
                }
            }
            0x14 => {
                let length = self.length()?;
                self.get_linear(key, length, translator)
            }
            _ => Err(self.type_error("object")),
        }
    }

    /// Iterate the items of an array.
    pub fn array_iter(&self) -> Result<ArrayIter<'a>> {
        ArrayIter::new(*self)
    }

    /// Iterate the key-value pairs of an object.
    pub fn object_iter(&self) -> Result<ObjectIter<'a>> {
        ObjectIter::new(*self)
    }

    /// Byte-wise equality of the encoded values.
    pub fn binary_equals(&self, other: &Slice<'_>) -> bool {
        self.as_bytes() == other.as_bytes()
    }

    fn get_sorted(
        &self,
        key: &str,
        length: usize,
        translator: Option<&AttributeTranslator>,
    ) -> Result<Option<Slice<'a>>> {
        let head = self.head();
        let target = key.as_bytes();
        let mut low = 0usize;
        let mut high = length;

        while low < high {
            let mid = low + (high - low) / 2;
            let position = self.index_entry(head, length, mid);
            let entry = Slice::new(&self.data[position..]);
            let entry_key = resolve_key_bytes(&entry, translator)?;
            match entry_key.cmp(target) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => {
                    return Ok(Some(Slice::new(
                        &self.data[position + entry.byte_size()..],
                    )));
                }
            }
        }
        Ok(None)
    }

    fn get_linear(
        &self,
        key: &str,
        length: usize,
        translator: Option<&AttributeTranslator>,
    ) -> Result<Option<Slice<'a>>> {
        let target = key.as_bytes();
        for index in 0..length {
            let position = self.key_position_unchecked(index, length)?;
            let entry = Slice::new(&self.data[position..]);
            if let Ok(entry_key) = resolve_key_bytes(&entry, translator) {
                if entry_key == target {
                    return Ok(Some(Slice::new(
                        &self.data[position + entry.byte_size()..],
                    )));
                }
            }
        }
        Ok(None)
    }

    fn key_position(&self, index: usize) -> Result<usize> {
        let head = self.head();
        if !matches!(head, 0x0a..=0x0e | 0x14) {
            return Err(self.type_error("object"));
        }
        let length = self.length()?;
        if index >= length {
            return Err(CbvError::IndexOutOfBounds);
        }
        self.key_position_unchecked(index, length)
    }

    fn key_position_unchecked(&self, index: usize, length: usize) -> Result<usize> {
        let head = self.head();
        match head {
            0x0b..=0x0e => Ok(self.index_entry(head, length, index)),
            0x14 => {
                let mut cursor = self.compact_data_offset()?;
                for _ in 0..index {
                    // skip one key-value pair
                    cursor += Slice::new(&self.data[cursor..]).byte_size();
                    cursor += Slice::new(&self.data[cursor..]).byte_size();
                }
                Ok(cursor)
            }
            _ => Err(self.type_error("object")),
        }
    }

    /// Position of entry `index` in the index table, as an offset from
    /// this container's head byte.
    fn index_entry(&self, head: u8, length: usize, index: usize) -> usize {
        let width = index_width(head);
        let total = self.byte_size();
        let trailing_count = if width == 8 { 8 } else { 0 };
        let table = total - trailing_count - length * width;
        self.read_le(table + index * width, width) as usize
    }

    /// Offset of the first child of a fixed-header container, skipping
    /// any zero padding left by the builder.
    fn data_offset(&self) -> usize {
        let minimum = first_child_minimum(self.head());
        if minimum <= 2 && self.data[2] != 0 {
            return 2;
        }
        if minimum <= 3 && self.data[3] != 0 {
            return 3;
        }
        if minimum <= 5 && self.data[5] != 0 {
            return 5;
        }
        9
    }

    /// Offset of the first child of a compact container.
    fn compact_data_offset(&self) -> Result<usize> {
        let (_, varint_len) = decode_varint(&self.data[1..])?;
        Ok(1 + varint_len)
    }

    fn read_le(&self, offset: usize, len: usize) -> u64 {
        let mut value = 0u64;
        for i in (0..len).rev() {
            value = (value << 8) | self.data[offset + i] as u64;
        }
        value
    }

    fn type_error(&self, expected: &str) -> CbvError {
        CbvError::InvalidValueType(format!(
            "expecting {}, found {}",
            expected,
            self.value_type()
        ))
    }
}

/// Resolve an object key slice to comparable bytes: string payloads
/// directly, token keys through the translator.
pub(crate) fn resolve_key_bytes<'b>(
    key: &Slice<'b>,
    translator: Option<&'b AttributeTranslator>,
) -> Result<&'b [u8]> {
    if key.is_string() {
        return key.string_bytes();
    }
    if key.is_small_int() || key.is_uint() {
        let id = key.get_uint()?;
        if let Some(table) = translator {
            if let Some(name) = table.reverse(id) {
                return Ok(name.as_bytes());
            }
        }
        return Err(CbvError::Internal(format!(
            "no translation for object key token {}",
            id
        )));
    }
    Err(CbvError::InvalidValueType(format!(
        "object key is {}, not a string or token",
        key.value_type()
    )))
}

/// Byte width of index-table entries and the length field for `head`.
fn index_width(head: u8) -> usize {
    match head {
        0x06..=0x09 => 1 << (head - 0x06),
        0x0b..=0x0e => 1 << (head - 0x0b),
        _ => 0,
    }
}

/// Smallest possible offset of the first child, before padding probing.
fn first_child_minimum(head: u8) -> usize {
    match head {
        0x02 => 2,
        0x03 | 0x06 | 0x0b => 3,
        0x04 | 0x07 | 0x0c => 5,
        _ => 9,
    }
}

impl std::fmt::Debug for Slice<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slice")
            .field("type", &self.value_type())
            .field("head", &format_args!("0x{:02x}", self.head()))
            .finish()
    }
}

impl PartialEq for Slice<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.binary_equals(other)
    }
}

/// Iterator over the items of an encoded array, in insertion order.
pub struct ArrayIter<'a> {
    slice: Slice<'a>,
    length: usize,
    position: usize,
    cursor: usize,
}

impl<'a> ArrayIter<'a> {
    /// Start iterating `slice`, which must be an array.
    pub fn new(slice: Slice<'a>) -> Result<Self> {
        if !slice.is_array() {
            return Err(CbvError::InvalidValueType(format!(
                "expecting array, found {}",
                slice.value_type()
            )));
        }
        let length = slice.length()?;
        let cursor = if length == 0 {
            0
        } else if slice.head() == tags::HEAD_ARRAY_COMPACT {
            slice.compact_data_offset()?
        } else {
            slice.data_offset()
        };
        Ok(Self {
            slice,
            length,
            position: 0,
            cursor,
        })
    }

    /// Total number of items.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the array has no items.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl<'a> Iterator for ArrayIter<'a> {
    type Item = Slice<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.length {
            return None;
        }
        let item = Slice::new(&self.slice.data[self.cursor..]);
        self.cursor += item.byte_size();
        self.position += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.length - self.position;
        (remaining, Some(remaining))
    }
}

/// Iterator over the key-value pairs of an encoded object.
///
/// Indexed objects iterate in index-table order (lexicographic when the
/// builder sorted them); compact objects iterate in insertion order.
pub struct ObjectIter<'a> {
    slice: Slice<'a>,
    length: usize,
    position: usize,
    /// sequential cursor, used for compact objects only
    cursor: usize,
}

impl<'a> ObjectIter<'a> {
    /// Start iterating `slice`, which must be an object.
    pub fn new(slice: Slice<'a>) -> Result<Self> {
        if !slice.is_object() {
            return Err(CbvError::InvalidValueType(format!(
                "expecting object, found {}",
                slice.value_type()
            )));
        }
        let length = slice.length()?;
        let cursor = if length > 0 && slice.head() == tags::HEAD_OBJECT_COMPACT {
            slice.compact_data_offset()?
        } else {
            0
        };
        Ok(Self {
            slice,
            length,
            position: 0,
            cursor,
        })
    }

    /// Total number of pairs.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the object has no pairs.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl<'a> Iterator for ObjectIter<'a> {
    type Item = (Slice<'a>, Slice<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.length {
            return None;
        }
        let pair = if self.slice.head() == tags::HEAD_OBJECT_COMPACT {
            let key = Slice::new(&self.slice.data[self.cursor..]);
            let value_pos = self.cursor + key.byte_size();
            let value = Slice::new(&self.slice.data[value_pos..]);
            self.cursor = value_pos + value.byte_size();
            (key, value)
        } else {
            let position = self
                .slice
                .index_entry(self.slice.head(), self.length, self.position);
            let key = Slice::new(&self.slice.data[position..]);
            let value = Slice::new(&self.slice.data[position + key.byte_size()..]);
            (key, value)
        };
        self.position += 1;
        Some(pair)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.length - self.position;
        (remaining, Some(remaining))
    }
}
