use std::alloc::Layout;
use std::num::NonZero;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64};

use crate::{BucketValue, Error};

/// Layout calculations for the single memory block that backs a reserved table.
///
/// The block starts with a header made of three per-slot arrays (presence flags, lock words and
/// slot keys), followed by the value region that holds `capacity` vectors of `dimension`
/// values each. Every region is aligned for its element type, so the whole block can be
/// zero-filled to reach the initial state.
///
/// ```text
/// | flags: [AtomicBool; N] | locks: [AtomicU8; N] | pad | keys: [AtomicU64; N] | pad | values: [V; N * D] |
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TableLayout {
    capacity: NonZero<usize>,
    dimension: NonZero<usize>,

    /// Byte offset from the start of the block to the first lock word.
    locks_offset: usize,

    /// Byte offset from the start of the block to the first slot key.
    keys_offset: usize,

    /// Byte offset from the start of the block to the first value of slot 0.
    /// This is also the total size of the header including padding.
    values_offset: usize,

    /// Layout of the entire block, padded to its own alignment.
    block_layout: Layout,
}

impl TableLayout {
    /// Calculates the block layout for a table with the given geometry and value type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LayoutOverflow`] if the block would not fit in the address space.
    pub(crate) fn calculate<V: BucketValue>(
        capacity: NonZero<usize>,
        dimension: NonZero<usize>,
    ) -> crate::Result<Self> {
        let overflow = || Error::LayoutOverflow {
            capacity: capacity.get(),
            dimension: dimension.get(),
        };

        let flags_layout = Layout::array::<AtomicBool>(capacity.get())
            .ok()
            .ok_or_else(overflow)?;
        let locks_layout = Layout::array::<AtomicU8>(capacity.get())
            .ok()
            .ok_or_else(overflow)?;
        let keys_layout = Layout::array::<AtomicU64>(capacity.get())
            .ok()
            .ok_or_else(overflow)?;

        let value_count = capacity
            .get()
            .checked_mul(dimension.get())
            .ok_or_else(overflow)?;
        let values_layout = Layout::array::<V>(value_count).ok().ok_or_else(overflow)?;

        // The flags array sits at offset zero, so it needs no offset of its own.
        let (header_layout, locks_offset) =
            flags_layout.extend(locks_layout).ok().ok_or_else(overflow)?;
        let (header_layout, keys_offset) =
            header_layout.extend(keys_layout).ok().ok_or_else(overflow)?;
        let (block_layout, values_offset) =
            header_layout.extend(values_layout).ok().ok_or_else(overflow)?;

        Ok(Self {
            capacity,
            dimension,
            locks_offset,
            keys_offset,
            values_offset,
            block_layout: block_layout.pad_to_align(),
        })
    }

    #[must_use]
    pub(crate) fn capacity(&self) -> NonZero<usize> {
        self.capacity
    }

    #[must_use]
    pub(crate) fn dimension(&self) -> NonZero<usize> {
        self.dimension
    }

    #[must_use]
    pub(crate) fn locks_offset(&self) -> usize {
        self.locks_offset
    }

    #[must_use]
    pub(crate) fn keys_offset(&self) -> usize {
        self.keys_offset
    }

    /// Size of the header region, in bytes, including the padding before the value region.
    #[must_use]
    pub(crate) fn header_size(&self) -> usize {
        self.values_offset
    }

    #[must_use]
    pub(crate) fn block_layout(&self) -> Layout {
        self.block_layout
    }

    /// Maps a key to the slot that owns it.
    ///
    /// This is a projection, not a hash: the reserved keys differ only in their low bits, so
    /// taking the key modulo the capacity gives each of them its own stable slot.
    #[must_use]
    #[inline]
    pub(crate) fn slot_index(&self, key: u64) -> usize {
        // usize is at most 64 bits wide on every supported target.
        let capacity = self.capacity.get() as u64;

        let index = if capacity.is_power_of_two() {
            // Cannot underflow because capacity is non-zero.
            key & capacity.wrapping_sub(1)
        } else {
            #[allow(
                clippy::arithmetic_side_effects,
                clippy::modulo_arithmetic,
                reason = "unsigned operands and a non-zero divisor"
            )]
            let index = key % capacity;
            index
        };

        #[expect(
            clippy::cast_possible_truncation,
            reason = "index is less than capacity, which is a usize"
        )]
        let index = index as usize;
        index
    }

    /// Byte offset from the start of the block to the first value of the given slot.
    #[must_use]
    pub(crate) fn values_offset_of<V>(&self, index: usize) -> usize {
        debug_assert!(index < self.capacity.get());

        // Cannot overflow because calculate() verified that capacity * dimension values fit
        // after the header.
        let element_index = index.wrapping_mul(self.dimension.get());
        self.values_offset
            .wrapping_add(element_index.wrapping_mul(size_of::<V>()))
    }
}
