//! Hex dump formatting for encoded byte ranges

use std::fmt;

use crate::slice::Slice;

/// Formats a byte range as hex values, a fixed number per line.
///
/// ```
/// use cbv_codec::{Builder, HexDump, Value};
///
/// let mut builder = Builder::new();
/// builder.add(Value::Bool(true)).unwrap();
/// let dump = format!("{}", HexDump::new(builder.slice().unwrap()));
/// assert_eq!(dump, "0x1a");
/// ```
pub struct HexDump<'a> {
    data: &'a [u8],
    values_per_line: usize,
    separator: &'a str,
    header: &'a str,
}

impl<'a> HexDump<'a> {
    /// Dump one encoded value, 16 bytes per line.
    pub fn new(slice: Slice<'a>) -> Self {
        Self::with_layout(slice.as_bytes(), 16, " ", "0x")
    }

    /// Dump a raw byte range, 16 bytes per line.
    pub fn from_bytes(data: &'a [u8]) -> Self {
        Self::with_layout(data, 16, " ", "0x")
    }

    /// Dump with explicit line width, separator and per-value prefix.
    pub fn with_layout(
        data: &'a [u8],
        values_per_line: usize,
        separator: &'a str,
        header: &'a str,
    ) -> Self {
        Self {
            data,
            values_per_line: values_per_line.max(1),
            separator,
            header,
        }
    }
}

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, byte) in self.data.iter().enumerate() {
            if index > 0 {
                if index % self.values_per_line == 0 {
                    writeln!(f)?;
                } else {
                    f.write_str(self.separator)?;
                }
            }
            write!(f, "{}{:02x}", self.header, byte)?;
        }
        Ok(())
    }
}
