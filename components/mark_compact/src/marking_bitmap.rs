//! Per-page mark bits.
//!
//! One bit per [`OBJECT_ALIGNMENT`] granule of the page, indexed by the
//! byte offset from the page start. Setting a bit is a single `fetch_or`,
//! so several markers can race on the same object and exactly one of them
//! observes the transition.

use core_types::OBJECT_ALIGNMENT;
use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: usize = 64;
const LOG2_BITS_PER_WORD: u32 = 6;
const BIT_INDEX_MASK: usize = BITS_PER_WORD - 1;
const GRANULE_SHIFT: u32 = OBJECT_ALIGNMENT.trailing_zeros();

/// Mark bits covering one page.
pub struct MarkingBitmap {
    words: Box<[AtomicU64]>,
}

impl MarkingBitmap {
    /// Creates a cleared bitmap for `size` bytes.
    pub fn new(size: usize) -> Self {
        let granules = size >> GRANULE_SHIFT;
        let word_count = (granules + BITS_PER_WORD - 1) >> LOG2_BITS_PER_WORD;
        MarkingBitmap {
            words: (0..word_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn position(offset: usize) -> (usize, u64) {
        let index = offset >> GRANULE_SHIFT;
        (index >> LOG2_BITS_PER_WORD, 1u64 << (index & BIT_INDEX_MASK))
    }

    /// Sets the bit for `offset`. Returns true if this call set it.
    #[inline]
    pub fn set(&self, offset: usize) -> bool {
        let (word, mask) = Self::position(offset);
        match self.words.get(word) {
            Some(w) => w.fetch_or(mask, Ordering::AcqRel) & mask == 0,
            None => false,
        }
    }

    /// Sets the bit for `offset` without a read-modify-write.
    ///
    /// Only valid while no other thread touches the same word.
    #[inline]
    pub fn set_non_atomic(&self, offset: usize) -> bool {
        let (word, mask) = Self::position(offset);
        match self.words.get(word) {
            Some(w) => {
                let old = w.load(Ordering::Relaxed);
                w.store(old | mask, Ordering::Relaxed);
                old & mask == 0
            }
            None => false,
        }
    }

    /// Returns true if the bit for `offset` is set.
    #[inline]
    pub fn is_set(&self, offset: usize) -> bool {
        let (word, mask) = Self::position(offset);
        self.words
            .get(word)
            .is_some_and(|w| w.load(Ordering::Acquire) & mask != 0)
    }

    /// Clears the bit for `offset`.
    pub fn clear(&self, offset: usize) {
        let (word, mask) = Self::position(offset);
        if let Some(w) = self.words.get(word) {
            w.fetch_and(!mask, Ordering::AcqRel);
        }
    }

    /// Clears every bit in `[start, end)`.
    pub fn clear_range(&self, start: usize, end: usize) {
        let mut offset = start;
        while offset < end {
            let (word, _) = Self::position(offset);
            let first_bit = (offset >> GRANULE_SHIFT) & BIT_INDEX_MASK;
            let bits_left = ((end - offset) >> GRANULE_SHIFT).max(1);
            if first_bit == 0 && bits_left >= BITS_PER_WORD {
                if let Some(w) = self.words.get(word) {
                    w.store(0, Ordering::Relaxed);
                }
                offset += BITS_PER_WORD << GRANULE_SHIFT;
            } else {
                self.clear(offset);
                offset += OBJECT_ALIGNMENT;
            }
        }
    }

    /// Clears every bit.
    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Returns true if no bit is set.
    pub fn is_clean(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Relaxed) == 0)
    }
}
