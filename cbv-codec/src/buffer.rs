//! Growable byte buffer backing the builder

/// An owned, growable byte array with an append cursor.
///
/// The cursor always equals the number of committed bytes; `rollback`
/// and `reset_to` truncate back to an earlier cursor position. The
/// builder relies on truncation never shrinking capacity, so a cleared
/// buffer can be reused without reallocating.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Create an empty buffer with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Number of committed bytes (the append cursor).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no bytes have been committed.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current allocation size in bytes.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Ensure room for at least `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// Append a single byte.
    pub fn push(&mut self, byte: u8) {
        self.data.push(byte);
    }

    /// Append a byte run.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Move the cursor `count` bytes back, discarding the tail.
    pub fn rollback(&mut self, count: usize) {
        debug_assert!(count <= self.data.len());
        let new_len = self.data.len().saturating_sub(count);
        self.data.truncate(new_len);
    }

    /// Truncate to an absolute cursor position.
    pub fn reset_to(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.data.truncate(len);
    }

    /// Discard all committed bytes, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.clear();
    }

    /// Copy `src` onto the range starting at `dest` (ranges may overlap).
    pub fn copy_within(&mut self, src: std::ops::Range<usize>, dest: usize) {
        self.data.copy_within(src, dest);
    }

    /// The committed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the committed bytes, used for header backpatching.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consume the buffer, yielding the committed bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_rollback() {
        let mut buffer = Buffer::new();
        buffer.push(0x01);
        buffer.extend_from_slice(&[0x02, 0x03, 0x04]);
        assert_eq!(buffer.len(), 4);

        buffer.rollback(2);
        assert_eq!(buffer.as_slice(), &[0x01, 0x02]);

        buffer.reset_to(1);
        assert_eq!(buffer.as_slice(), &[0x01]);

        buffer.reset();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_copy_within_closes_gap() {
        let mut buffer = Buffer::new();
        buffer.extend_from_slice(&[0xaa, 0, 0, 0, 0xbb, 0xcc]);
        buffer.copy_within(4..6, 1);
        buffer.reset_to(3);
        assert_eq!(buffer.as_slice(), &[0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut buffer = Buffer::with_capacity(64);
        buffer.extend_from_slice(&[0u8; 48]);
        let capacity = buffer.capacity();
        buffer.reset();
        assert_eq!(buffer.capacity(), capacity);
    }
}
