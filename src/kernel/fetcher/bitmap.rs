//! Missing-fragment bitmap
//!
//! Bit `i` lives in byte `i / 8` at mask `1 << (i % 8)`; a set bit means the
//! fragment is still missing. The byte form is what request packets carry.

/// Largest bitmap a request packet can carry
pub const MAX_BITMAP_BYTES: usize = u8::MAX as usize;

/// Largest number of fragments one fetch can track
pub const MAX_FRAGMENTS: usize = MAX_BITMAP_BYTES * 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentBitmap {
    bits: Vec<u8>,
    len: usize,
}

impl FragmentBitmap {
    /// Every one of `len` fragments missing
    pub fn all_missing(len: usize) -> Self {
        let mut bits = vec![0xFF; len.div_ceil(8)];
        // Padding bits past `len` stay clear so completion is `all zero`
        if len % 8 != 0
            && let Some(last) = bits.last_mut()
        {
            *last = (1u8 << (len % 8)) - 1;
        }
        Self { bits, len }
    }

    /// Bitmap as received in a request, limited to `len` fragments
    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        let mut bitmap = Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        };
        for i in 0..len.min(bytes.len() * 8) {
            if bytes[i / 8] & (1 << (i % 8)) != 0 {
                bitmap.bits[i / 8] |= 1 << (i % 8);
            }
        }
        bitmap
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_missing(&self, index: usize) -> bool {
        index < self.len && self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    /// Mark a fragment received. Returns false if it already was.
    pub fn clear(&mut self, index: usize) -> bool {
        if !self.is_missing(index) {
            return false;
        }
        self.bits[index / 8] &= !(1 << (index % 8));
        true
    }

    pub fn missing_count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Indexes of missing fragments, ascending
    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&i| self.is_missing(i))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}
