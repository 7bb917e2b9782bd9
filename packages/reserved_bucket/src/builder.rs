use std::marker::PhantomData;
use std::num::NonZero;

use new_zealand::nz;

use crate::{Allocator, BucketValue, MemoryKind, ReservedTable};

/// Builder for creating an instance of [`ReservedTable`].
///
/// The dimension (number of values per slot) is mandatory, whereas other settings are
/// optional. By default the table has [`DEFAULT_CAPACITY`][Self::DEFAULT_CAPACITY] slots, one
/// per reserved key, and is placed in [`MemoryKind::Device`] memory.
///
/// # Examples
///
/// ```
/// use reserved_bucket::{MemoryKind, ReservedTable};
///
/// let table = ReservedTable::<f32>::builder()
///     .dimension(16)
///     .memory_kind(MemoryKind::Managed)
///     .build()
///     .unwrap();
///
/// assert_eq!(table.capacity(), 4);
/// assert_eq!(table.dimension(), 16);
/// ```
#[derive(Debug)]
#[must_use]
pub struct ReservedTableBuilder<V: BucketValue, A: Allocator> {
    capacity: NonZero<usize>,
    dimension: Option<NonZero<usize>>,
    memory_kind: MemoryKind,
    allocator: A,

    _values: PhantomData<fn() -> V>,
}

impl<V: BucketValue, A: Allocator> ReservedTableBuilder<V, A> {
    /// Number of slots in a table unless configured otherwise. Each reserved key maps to its
    /// own slot at this capacity.
    pub const DEFAULT_CAPACITY: NonZero<usize> = nz!(4);

    #[inline]
    pub(crate) fn new(allocator: A) -> Self {
        Self {
            capacity: Self::DEFAULT_CAPACITY,
            dimension: None,
            memory_kind: MemoryKind::default(),
            allocator,
            _values: PhantomData,
        }
    }

    /// Sets the number of slots in the table.
    ///
    /// Keys map to slots by taking the key modulo the capacity. A power of two lets the table
    /// use a bit mask instead of a division.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[inline]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity =
            NonZero::new(capacity).expect("ReservedTable must have a non-zero capacity");
        self
    }

    /// Sets the number of values stored per slot.
    ///
    /// # Panics
    ///
    /// Panics if `dimension` is zero.
    #[inline]
    pub fn dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(
            NonZero::new(dimension).expect("ReservedTable must have a non-zero dimension"),
        );
        self
    }

    /// Sets the kind of memory requested from the allocator.
    ///
    /// # Examples
    ///
    /// ```
    /// use reserved_bucket::{MemoryKind, ReservedTable};
    ///
    /// let table = ReservedTable::<u64>::builder()
    ///     .dimension(2)
    ///     .memory_kind(MemoryKind::HostPinned)
    ///     .build()
    ///     .unwrap();
    ///
    /// assert_eq!(table.memory_kind(), MemoryKind::HostPinned);
    /// ```
    #[inline]
    pub fn memory_kind(mut self, memory_kind: MemoryKind) -> Self {
        self.memory_kind = memory_kind;
        self
    }

    /// Allocates and zero-fills the table's backing block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`][crate::Error::Allocation] if the allocator cannot provide
    /// the block, or [`Error::LayoutOverflow`][crate::Error::LayoutOverflow] if the block
    /// would not fit in the address space.
    ///
    /// # Panics
    ///
    /// Panics if no dimension has been set using [`dimension`](Self::dimension).
    pub fn build(self) -> crate::Result<ReservedTable<V, A>> {
        let dimension = self
            .dimension
            .expect("dimension must be set using .dimension() before calling .build()");

        ReservedTable::new_inner(self.capacity, dimension, self.memory_kind, self.allocator)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::SystemAllocator;

    assert_impl_all!(ReservedTableBuilder<f32, SystemAllocator>: Send, Sync, Debug);

    #[test]
    fn new_has_defaults() {
        let builder = ReservedTableBuilder::<f32, _>::new(SystemAllocator);

        assert_eq!(builder.capacity.get(), 4);
        assert!(builder.dimension.is_none());
        assert_eq!(builder.memory_kind, MemoryKind::Device);
    }

    #[test]
    fn setters_store_values() {
        let builder = ReservedTableBuilder::<f64, _>::new(SystemAllocator)
            .capacity(8)
            .dimension(3)
            .memory_kind(MemoryKind::Host);

        assert_eq!(builder.capacity.get(), 8);
        assert_eq!(builder.dimension.map(NonZero::get), Some(3));
        assert_eq!(builder.memory_kind, MemoryKind::Host);
    }

    #[test]
    #[should_panic]
    fn zero_capacity_panics() {
        let _builder = ReservedTableBuilder::<f32, _>::new(SystemAllocator).capacity(0);
    }

    #[test]
    #[should_panic]
    fn zero_dimension_panics() {
        let _builder = ReservedTableBuilder::<f32, _>::new(SystemAllocator).dimension(0);
    }

    #[test]
    #[should_panic]
    fn build_without_dimension_panics() {
        let _table = ReservedTableBuilder::<f32, _>::new(SystemAllocator).build();
    }

    #[test]
    fn build_uses_configuration() {
        let table = ReservedTableBuilder::<i32, _>::new(SystemAllocator)
            .capacity(6)
            .dimension(5)
            .memory_kind(MemoryKind::Managed)
            .build()
            .unwrap();

        assert_eq!(table.capacity(), 6);
        assert_eq!(table.dimension(), 5);
        assert_eq!(table.memory_kind(), MemoryKind::Managed);
    }
}
