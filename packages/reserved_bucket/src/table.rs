use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZero;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::{
    Allocator, BucketValue, MemoryKind, ReservedTableBuilder, SlotLock, SlotLockGuard, SlotVector,
    SystemAllocator, TableLayout,
};

/// A fixed-capacity table that stores one value vector per reserved key.
///
/// The table lives in a single memory block obtained from an [`Allocator`]. The block holds a
/// presence flag, a lock word and a key word for every slot, followed by `capacity` vectors of
/// `dimension` values. A key is mapped to its slot by taking it modulo the capacity, so the
/// table never hashes and never grows.
///
/// The reserved keys ([`RESERVED_KEYS`][crate::RESERVED_KEYS]) differ only in their two lowest
/// bits, so at the default capacity of 4 each of them owns a distinct slot. Any other key is
/// accepted as well and shares a slot with every key that is congruent to it.
///
/// # Thread safety
///
/// All operations except [`clear()`](Self::clear) take `&self` and may be called from any
/// number of threads at the same time. Each operation locks the slot it touches for the
/// duration of its read-modify-write sequence, so concurrent operations on the same key are
/// serialized and operations on different slots proceed independently. [`clear()`](Self::clear)
/// takes `&mut self` and therefore cannot overlap with any other operation.
///
/// # Examples
///
/// ```
/// use reserved_bucket::{LOCKED_KEY, ReservedTable};
///
/// let table = ReservedTable::<f32>::builder().dimension(4).build().unwrap();
///
/// table.accum_or_assign(LOCKED_KEY, false, &[1.0, 2.0, 3.0, 4.0]);
/// table.accum_or_assign(LOCKED_KEY, true, &[1.0, 1.0, 1.0, 1.0]);
///
/// let values = table.find(LOCKED_KEY).unwrap();
/// assert_eq!(*values, [2.0, 3.0, 4.0, 5.0]);
/// drop(values);
///
/// assert_eq!(table.size(), 1);
/// ```
pub struct ReservedTable<V: BucketValue, A: Allocator = SystemAllocator> {
    /// Start of the block described by `layout`. Owned by this table and returned to
    /// `allocator` when the table is dropped.
    block: NonNull<u8>,

    layout: TableLayout,
    memory_kind: MemoryKind,
    allocator: A,

    _values: PhantomData<V>,
}

/// Pointers to the parts of one slot, resolved from the block.
struct Slot<'a, V> {
    present: &'a AtomicBool,
    key: &'a AtomicU64,
    lock: &'a SlotLock,
    values: NonNull<V>,
}

impl<V: BucketValue> ReservedTable<V> {
    /// Creates a builder for a table that obtains its memory from the global heap.
    ///
    /// # Examples
    ///
    /// ```
    /// use reserved_bucket::ReservedTable;
    ///
    /// let table = ReservedTable::<f64>::builder().dimension(32).build().unwrap();
    /// assert_eq!(table.size(), 0);
    /// ```
    pub fn builder() -> ReservedTableBuilder<V, SystemAllocator> {
        ReservedTableBuilder::new(SystemAllocator)
    }
}

impl<V: BucketValue, A: Allocator> ReservedTable<V, A> {
    /// Creates a builder for a table that obtains its memory from the given allocator.
    pub fn builder_in(allocator: A) -> ReservedTableBuilder<V, A> {
        ReservedTableBuilder::new(allocator)
    }

    pub(crate) fn new_inner(
        capacity: NonZero<usize>,
        dimension: NonZero<usize>,
        memory_kind: MemoryKind,
        allocator: A,
    ) -> crate::Result<Self> {
        let layout = TableLayout::calculate::<V>(capacity, dimension)?;
        let block_layout = layout.block_layout();

        let block = allocator.allocate(memory_kind, block_layout)?;

        // SAFETY: The allocator returned a block of block_layout.size() bytes, which we now own.
        // Zero is a valid initial state for every field in the block: unset presence flags,
        // unlocked slot locks, zero keys and BucketValue::ZERO values.
        unsafe {
            ptr::write_bytes(block.as_ptr(), 0, block_layout.size());
        }

        debug!(
            capacity = capacity.get(),
            dimension = dimension.get(),
            %memory_kind,
            size = block_layout.size(),
            value_type = type_name::<V>(),
            "reserved table created"
        );

        Ok(Self {
            block,
            layout,
            memory_kind,
            allocator,
            _values: PhantomData,
        })
    }

    /// Number of slots in the table.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.capacity().get()
    }

    /// Number of values in the vector of every slot.
    #[must_use]
    #[inline]
    pub fn dimension(&self) -> usize {
        self.layout.dimension().get()
    }

    /// The kind of memory the table's block was requested as.
    #[must_use]
    #[inline]
    pub fn memory_kind(&self) -> MemoryKind {
        self.memory_kind
    }

    /// Total size of the table's backing block, in bytes.
    #[must_use]
    #[inline]
    pub fn memory_bytes(&self) -> usize {
        self.layout.block_layout().size()
    }

    /// Size of the per-slot metadata at the start of the block, in bytes.
    #[must_use]
    #[inline]
    pub fn header_bytes(&self) -> usize {
        self.layout.header_size()
    }

    /// Returns the index of the slot that owns `key`. Always less than the capacity.
    ///
    /// # Examples
    ///
    /// ```
    /// use reserved_bucket::{EMPTY_KEY, RESERVED_KEY_MASK, ReservedTable};
    ///
    /// let table = ReservedTable::<f32>::builder().dimension(1).build().unwrap();
    ///
    /// assert_eq!(table.slot_index(RESERVED_KEY_MASK), 0);
    /// assert_eq!(table.slot_index(EMPTY_KEY), 3);
    /// ```
    #[must_use]
    #[inline]
    pub fn slot_index(&self, key: u64) -> usize {
        self.layout.slot_index(key)
    }

    /// Returns `true` if the slot that owns `key` holds a value.
    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        self.slot(key).present.load(Ordering::Acquire)
    }

    /// Returns locked access to the vector of the slot that owns `key`, whether or not the slot
    /// holds a value. An empty slot reads as zeroes.
    ///
    /// An absent slot becomes present once the view is borrowed mutably. See [`SlotVector`] for
    /// the locking rules that apply while the view exists.
    pub fn get_vector(&self, key: u64) -> SlotVector<'_, V> {
        let slot = self.slot(key);
        let guard = slot.lock.lock();

        // SAFETY: The guard was just taken from this slot's lock.
        unsafe { Self::view(guard, &slot, key, self.dimension()) }
    }

    /// Overwrites the vector of the slot that owns `key` and marks the slot as present.
    ///
    /// # Panics
    ///
    /// Panics if `values.len()` is not equal to the table's dimension.
    pub fn write_vector(&self, key: u64, values: &[V]) {
        self.assert_dimension(values.len());

        let slot = self.slot(key);
        let _guard = slot.lock.lock();

        // SAFETY: We hold the slot lock.
        unsafe { Self::values_mut(&slot, self.dimension()) }.copy_from_slice(values);
        Self::mark_present(&slot, key);
    }

    /// Copies the vector of the slot that owns `key` into `out`, whether or not the slot holds
    /// a value.
    ///
    /// # Panics
    ///
    /// Panics if `out.len()` is not equal to the table's dimension.
    pub fn read_vector(&self, key: u64, out: &mut [V]) {
        self.assert_dimension(out.len());

        let slot = self.slot(key);
        let _guard = slot.lock.lock();

        // SAFETY: We hold the slot lock.
        out.copy_from_slice(unsafe { Self::values_mut(&slot, self.dimension()) });
    }

    /// Marks the slot that owns `key` as absent and zeroes its vector.
    ///
    /// Erasing an absent slot has no effect.
    pub fn erase(&self, key: u64) {
        let slot = self.slot(key);
        let _guard = slot.lock.lock();

        // SAFETY: We hold the slot lock.
        unsafe { Self::values_mut(&slot, self.dimension()) }.fill(V::ZERO);
        slot.key.store(0, Ordering::Relaxed);
        slot.present.store(false, Ordering::Release);
    }

    /// Returns locked access to the vector of the slot that owns `key` if the slot holds a
    /// value, or `None` if it does not.
    ///
    /// See [`SlotVector`] for the locking rules that apply while the view exists.
    pub fn find(&self, key: u64) -> Option<SlotVector<'_, V>> {
        let slot = self.slot(key);
        let guard = slot.lock.lock();

        if !slot.present.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: The guard was just taken from this slot's lock.
        Some(unsafe { Self::view(guard, &slot, key, self.dimension()) })
    }

    /// Returns the vector of the slot that owns `key`, first storing `values` in it if the slot
    /// is absent.
    ///
    /// The returned flag is `true` if the slot already held a value, in which case the stored
    /// vector is left unchanged and `values` is ignored.
    ///
    /// # Panics
    ///
    /// Panics if `values.len()` is not equal to the table's dimension.
    ///
    /// # Examples
    ///
    /// ```
    /// use reserved_bucket::{RECLAIM_KEY, ReservedTable};
    ///
    /// let table = ReservedTable::<i64>::builder().dimension(2).build().unwrap();
    ///
    /// let (was_present, values) = table.find_or_insert(RECLAIM_KEY, &[7, 8]);
    /// assert!(!was_present);
    /// assert_eq!(*values, [7, 8]);
    /// drop(values);
    ///
    /// let (was_present, values) = table.find_or_insert(RECLAIM_KEY, &[0, 0]);
    /// assert!(was_present);
    /// assert_eq!(*values, [7, 8]);
    /// ```
    pub fn find_or_insert(&self, key: u64, values: &[V]) -> (bool, SlotVector<'_, V>) {
        self.assert_dimension(values.len());

        let slot = self.slot(key);
        let guard = slot.lock.lock();

        let was_present = slot.present.load(Ordering::Acquire);

        if !was_present {
            // SAFETY: We hold the slot lock.
            unsafe { Self::values_mut(&slot, self.dimension()) }.copy_from_slice(values);
            Self::mark_present(&slot, key);
        }

        // SAFETY: The guard was just taken from this slot's lock.
        let view = unsafe { Self::view(guard, &slot, key, self.dimension()) };

        (was_present, view)
    }

    /// Adds `values` element-wise onto the vector of the slot that owns `key` if `is_accum` is
    /// `true`, or overwrites the vector with `values` otherwise. The slot is marked as present
    /// either way.
    ///
    /// Accumulating onto an absent slot adds onto zeroes.
    ///
    /// # Panics
    ///
    /// Panics if `values.len()` is not equal to the table's dimension.
    pub fn accum_or_assign(&self, key: u64, is_accum: bool, values: &[V]) {
        self.assert_dimension(values.len());

        let slot = self.slot(key);
        let _guard = slot.lock.lock();

        // SAFETY: We hold the slot lock.
        let stored = unsafe { Self::values_mut(&slot, self.dimension()) };

        if is_accum {
            for (stored, value) in stored.iter_mut().zip(values) {
                stored.accumulate(*value);
            }
        } else {
            stored.copy_from_slice(values);
        }

        Self::mark_present(&slot, key);
    }

    /// Overwrites the vector of the slot that owns `key` and marks the slot as present.
    ///
    /// Returns `true` if the slot already held a value before the call.
    ///
    /// # Panics
    ///
    /// Panics if `values.len()` is not equal to the table's dimension.
    pub fn insert_or_assign(&self, key: u64, values: &[V]) -> bool {
        self.assert_dimension(values.len());

        let slot = self.slot(key);
        let _guard = slot.lock.lock();

        let was_present = slot.present.load(Ordering::Acquire);

        // SAFETY: We hold the slot lock.
        unsafe { Self::values_mut(&slot, self.dimension()) }.copy_from_slice(values);
        Self::mark_present(&slot, key);

        was_present
    }

    /// Overwrites the vector of the slot that owns `key` only if the slot already holds a
    /// value. An absent slot stays absent.
    ///
    /// Returns `true` if the vector was overwritten.
    ///
    /// # Panics
    ///
    /// Panics if `values.len()` is not equal to the table's dimension.
    pub fn assign(&self, key: u64, values: &[V]) -> bool {
        self.assert_dimension(values.len());

        let slot = self.slot(key);
        let _guard = slot.lock.lock();

        if !slot.present.load(Ordering::Acquire) {
            return false;
        }

        // SAFETY: We hold the slot lock.
        unsafe { Self::values_mut(&slot, self.dimension()) }.copy_from_slice(values);

        true
    }

    /// Copies present entries into the output buffers, scanning slots in index order starting
    /// at slot `offset`.
    ///
    /// Entry `i` of the batch is written to `out_keys[i]` and to
    /// `out_values[i * dimension..(i + 1) * dimension]`. The scan stops after `max_n` entries
    /// or at the end of the table, whichever comes first. Returns the number of entries
    /// written.
    ///
    /// If `offset` is not less than [`size()`](Self::size), nothing is copied and zero is
    /// returned.
    ///
    /// # Panics
    ///
    /// Panics if `out_keys` has room for fewer than `max_n` keys or `out_values` has room for
    /// fewer than `max_n` vectors.
    ///
    /// # Examples
    ///
    /// ```
    /// use reserved_bucket::{EMPTY_KEY, LOCKED_KEY, ReservedTable};
    ///
    /// let table = ReservedTable::<u32>::builder().dimension(2).build().unwrap();
    /// table.write_vector(EMPTY_KEY, &[1, 2]);
    /// table.write_vector(LOCKED_KEY, &[3, 4]);
    ///
    /// let mut keys = [0; 4];
    /// let mut values = [0; 8];
    /// let count = table.export_batch(4, 0, &mut keys, &mut values);
    ///
    /// assert_eq!(count, 2);
    /// assert_eq!(keys[..2], [LOCKED_KEY, EMPTY_KEY]);
    /// assert_eq!(values[..4], [3, 4, 1, 2]);
    /// ```
    pub fn export_batch(
        &self,
        max_n: usize,
        offset: usize,
        out_keys: &mut [u64],
        out_values: &mut [V],
    ) -> usize {
        let dimension = self.dimension();

        assert!(
            out_keys.len() >= max_n,
            "export of up to {max_n} entries needs room for {max_n} keys but got {}",
            out_keys.len()
        );
        assert!(
            max_n
                .checked_mul(dimension)
                .is_some_and(|required| out_values.len() >= required),
            "export of up to {max_n} entries of dimension {dimension} does not fit in {} values",
            out_values.len()
        );

        if offset >= self.size() {
            return 0;
        }

        let mut destinations = out_keys
            .iter_mut()
            .zip(out_values.chunks_exact_mut(dimension))
            .take(max_n);

        let mut count: usize = 0;

        for index in offset..self.capacity() {
            if count == max_n {
                break;
            }

            let slot = self.slot_at(index);
            let _guard = slot.lock.lock();

            if !slot.present.load(Ordering::Acquire) {
                continue;
            }

            let Some((key_out, values_out)) = destinations.next() else {
                break;
            };

            *key_out = slot.key.load(Ordering::Relaxed);
            // SAFETY: We hold the slot lock.
            values_out.copy_from_slice(unsafe { Self::values_mut(&slot, dimension) });

            // Cannot overflow because count is bounded by max_n.
            count = count.wrapping_add(1);
        }

        count
    }

    /// Returns the number of slots that hold a value.
    #[must_use]
    pub fn size(&self) -> usize {
        (0..self.capacity())
            .filter(|&index| self.slot_at(index).present.load(Ordering::Acquire))
            .count()
    }

    /// Returns `true` if no slot holds a value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Zero-fills the entire block, leaving every slot absent with a zeroed vector.
    ///
    /// This takes `&mut self` because it rewrites every slot, including their locks, and must
    /// not run concurrently with any other operation.
    pub fn clear(&mut self) {
        let size = self.memory_bytes();

        // SAFETY: The block is owned by us and is size bytes long. We hold an exclusive
        // reference to the table, so no slot is locked and no view into the block exists.
        unsafe {
            ptr::write_bytes(self.block.as_ptr(), 0, size);
        }

        debug!(capacity = self.capacity(), size, "reserved table cleared");
    }

    fn slot(&self, key: u64) -> Slot<'_, V> {
        self.slot_at(self.layout.slot_index(key))
    }

    fn slot_at(&self, index: usize) -> Slot<'_, V> {
        assert!(
            index < self.capacity(),
            "slot {index} index out of bounds in reserved table of capacity {}",
            self.capacity()
        );

        // Offsets cannot overflow because TableLayout::calculate() verified that every region
        // fits in the block.
        let key_offset = self
            .layout
            .keys_offset()
            .wrapping_add(index.wrapping_mul(size_of::<AtomicU64>()));
        let lock_offset = self.layout.locks_offset().wrapping_add(index);

        // SAFETY for all four blocks below: every offset is within the block and aligned for
        // its type, as computed by TableLayout. The header fields are atomics and were
        // zero-initialized, so shared references to them stay valid for as long as we are
        // borrowed. clear() is the only non-atomic writer and it requires &mut self.
        let present = unsafe { self.block.byte_add(index).cast::<AtomicBool>().as_ref() };
        // SAFETY: See above.
        let key = unsafe { self.block.byte_add(key_offset).cast::<AtomicU64>().as_ref() };
        // SAFETY: See above. SlotLock is a transparent wrapper over an atomic byte.
        let lock = unsafe { self.block.byte_add(lock_offset).cast::<SlotLock>().as_ref() };
        // SAFETY: See above.
        let values = unsafe {
            self.block
                .byte_add(self.layout.values_offset_of::<V>(index))
                .cast::<V>()
        };

        Slot {
            present,
            key,
            lock,
            values,
        }
    }

    /// # Safety
    ///
    /// The caller must hold the slot's lock for as long as the returned slice is used.
    #[expect(
        clippy::mut_from_ref,
        reason = "the slot lock provides the exclusivity that &mut requires"
    )]
    unsafe fn values_mut<'s>(slot: &Slot<'s, V>, dimension: usize) -> &'s mut [V] {
        // SAFETY: The pointer addresses dimension initialized values of this slot, and the
        // caller guarantees exclusive access by holding the slot lock.
        unsafe { slice::from_raw_parts_mut(slot.values.as_ptr(), dimension) }
    }

    /// # Safety
    ///
    /// `guard` must be the guard of `slot`'s lock.
    unsafe fn view<'s>(
        guard: SlotLockGuard<'s>,
        slot: &Slot<'s, V>,
        key: u64,
        dimension: usize,
    ) -> SlotVector<'s, V> {
        // SAFETY: The pointer addresses dimension initialized values of this slot, the header
        // fields belong to the same slot and the caller guarantees we hold its lock.
        unsafe { SlotVector::new(guard, slot.present, slot.key, key, slot.values, dimension) }
    }

    fn mark_present(slot: &Slot<'_, V>, key: u64) {
        slot.key.store(key, Ordering::Relaxed);
        slot.present.store(true, Ordering::Release);
    }

    fn assert_dimension(&self, len: usize) {
        assert!(
            len == self.dimension(),
            "vector of length {len} does not match reserved table dimension {}",
            self.dimension()
        );
    }
}

impl<V: BucketValue, A: Allocator> Drop for ReservedTable<V, A> {
    fn drop(&mut self) {
        // SAFETY: The block was allocated by this allocator with this kind and layout in
        // new_inner() and has not been returned yet. We hold &mut self, so no views exist.
        unsafe {
            self.allocator.deallocate(
                self.memory_kind,
                self.block,
                self.layout.block_layout(),
            );
        }

        trace!(
            capacity = self.capacity(),
            memory_kind = %self.memory_kind,
            "reserved table released"
        );
    }
}

impl<V: BucketValue, A: Allocator> fmt::Debug for ReservedTable<V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("capacity", &self.capacity())
            .field("dimension", &self.dimension())
            .field("memory_kind", &self.memory_kind)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

// SAFETY: The table owns its block exclusively, so moving the table moves the block with it.
// The values in the block are Send because BucketValue requires it.
unsafe impl<V: BucketValue, A: Allocator + Send> Send for ReservedTable<V, A> {}

// SAFETY: Through &self, header fields are only accessed as atomics and a slot's values are
// only accessed while holding that slot's lock. The one operation that writes the block
// non-atomically, clear(), requires &mut self.
unsafe impl<V: BucketValue, A: Allocator + Sync> Sync for ReservedTable<V, A> {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::indexing_slicing,
    clippy::float_cmp,
    reason = "test code compares exact small values and may panic"
)]
mod tests {
    use std::alloc::Layout;
    use std::cell::RefCell;
    use std::sync::Arc;
    use std::thread;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::{EMPTY_KEY, Error, LOCKED_KEY, RECLAIM_KEY, RESERVED_KEY_MASK, RESERVED_KEYS};

    assert_impl_all!(ReservedTable<f32>: Send, Sync, fmt::Debug);
    assert_not_impl_any!(ReservedTable<f32, LocalAllocator>: Sync);

    /// Records every block it hands out and takes back, to verify that tables release exactly
    /// what they acquired.
    #[derive(Debug, Default)]
    struct LocalAllocator {
        events: RefCell<Vec<(&'static str, MemoryKind, Layout)>>,
    }

    impl Allocator for LocalAllocator {
        fn allocate(&self, memory_kind: MemoryKind, layout: Layout) -> crate::Result<NonNull<u8>> {
            self.events
                .borrow_mut()
                .push(("allocate", memory_kind, layout));
            SystemAllocator.allocate(memory_kind, layout)
        }

        unsafe fn deallocate(&self, memory_kind: MemoryKind, ptr: NonNull<u8>, layout: Layout) {
            self.events
                .borrow_mut()
                .push(("deallocate", memory_kind, layout));
            // SAFETY: Forwarding to the allocator that produced the block.
            unsafe {
                SystemAllocator.deallocate(memory_kind, ptr, layout);
            }
        }
    }

    impl Allocator for &LocalAllocator {
        fn allocate(&self, memory_kind: MemoryKind, layout: Layout) -> crate::Result<NonNull<u8>> {
            (**self).allocate(memory_kind, layout)
        }

        unsafe fn deallocate(&self, memory_kind: MemoryKind, ptr: NonNull<u8>, layout: Layout) {
            // SAFETY: Forwarding safety requirements to the caller.
            unsafe {
                (**self).deallocate(memory_kind, ptr, layout);
            }
        }
    }

    #[derive(Debug)]
    struct FailingAllocator;

    impl Allocator for FailingAllocator {
        fn allocate(&self, memory_kind: MemoryKind, layout: Layout) -> crate::Result<NonNull<u8>> {
            Err(Error::Allocation {
                memory_kind,
                size: layout.size(),
            })
        }

        unsafe fn deallocate(&self, _memory_kind: MemoryKind, _ptr: NonNull<u8>, _layout: Layout) {
            panic!("nothing was allocated");
        }
    }

    fn table(dimension: usize) -> ReservedTable<f32> {
        ReservedTable::builder()
            .dimension(dimension)
            .build()
            .unwrap()
    }

    fn sequence(dimension: usize) -> Vec<f32> {
        (0..dimension).map(|i| i as f32).collect()
    }

    fn block_bytes<V: BucketValue, A: Allocator>(table: &ReservedTable<V, A>) -> &[u8] {
        // SAFETY: The block is initialized (zero-filled at creation) and no slot is locked by
        // the single-threaded tests that call this.
        unsafe { slice::from_raw_parts(table.block.as_ptr(), table.memory_bytes()) }
    }

    #[test]
    fn new_table_is_zeroed() {
        let table = table(10);

        assert_eq!(table.size(), 0);
        assert!(table.is_empty());
        assert!(block_bytes(&table).iter().all(|&b| b == 0));

        for key in RESERVED_KEYS {
            assert!(!table.contains(key));
            assert!(table.find(key).is_none());
        }
    }

    #[test]
    fn memory_bytes_is_header_plus_values() {
        let table = table(10);

        assert_eq!(table.header_bytes(), 40);
        assert_eq!(table.memory_bytes(), 40 + 4 * 10 * size_of::<f32>());
    }

    #[test]
    fn write_then_read_round_trip() {
        let table = table(10);
        let values = sequence(10);

        table.write_vector(EMPTY_KEY, &values);

        let mut out = vec![0.0; 10];
        table.read_vector(EMPTY_KEY, &mut out);

        assert_eq!(out, values);
        assert!(table.contains(EMPTY_KEY));
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn read_absent_slot_yields_zeroes() {
        let table = table(3);

        let mut out = vec![9.0; 3];
        table.read_vector(LOCKED_KEY, &mut out);

        assert_eq!(out, [0.0; 3]);
    }

    #[test]
    fn distinct_slots_do_not_interfere() {
        let table = table(2);

        table.write_vector(RESERVED_KEY_MASK, &[1.0, 2.0]);
        table.write_vector(LOCKED_KEY, &[3.0, 4.0]);
        table.write_vector(RECLAIM_KEY, &[5.0, 6.0]);
        table.erase(LOCKED_KEY);

        assert_eq!(*table.get_vector(RESERVED_KEY_MASK), [1.0, 2.0]);
        assert_eq!(*table.get_vector(LOCKED_KEY), [0.0, 0.0]);
        assert_eq!(*table.get_vector(RECLAIM_KEY), [5.0, 6.0]);
        assert!(!table.contains(EMPTY_KEY));
        assert_eq!(table.size(), 2);
    }

    #[test]
    fn erase_is_idempotent() {
        let table = table(4);

        table.write_vector(EMPTY_KEY, &[1.0; 4]);
        table.write_vector(RECLAIM_KEY, &[2.0; 4]);

        table.erase(EMPTY_KEY);
        assert_eq!(table.size(), 1);

        table.erase(EMPTY_KEY);
        assert_eq!(table.size(), 1);
        assert!(!table.contains(EMPTY_KEY));
        assert_eq!(*table.get_vector(EMPTY_KEY), [0.0; 4]);
    }

    #[test]
    fn find_or_insert_miss_then_hit() {
        let table = table(3);

        let (was_present, values) = table.find_or_insert(RECLAIM_KEY, &[1.0, 2.0, 3.0]);
        assert!(!was_present);
        assert_eq!(*values, [1.0, 2.0, 3.0]);
        drop(values);

        let (was_present, values) = table.find_or_insert(RECLAIM_KEY, &[9.0, 9.0, 9.0]);
        assert!(was_present);
        assert_eq!(*values, [1.0, 2.0, 3.0]);
        drop(values);

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn accum_or_assign_assigns_then_accumulates() {
        let table = table(10);
        let values = sequence(10);

        table.accum_or_assign(EMPTY_KEY, false, &values);
        assert_eq!(*table.get_vector(EMPTY_KEY), *values);

        table.accum_or_assign(EMPTY_KEY, true, &values);
        let doubled = values.iter().map(|v| v * 2.0).collect::<Vec<_>>();
        assert_eq!(*table.get_vector(EMPTY_KEY), *doubled);

        table.accum_or_assign(EMPTY_KEY, false, &values);
        assert_eq!(*table.get_vector(EMPTY_KEY), *values);
    }

    #[test]
    fn accumulate_onto_absent_slot_adds_to_zero() {
        let table = table(2);

        table.accum_or_assign(LOCKED_KEY, true, &[1.5, -2.0]);

        assert!(table.contains(LOCKED_KEY));
        assert_eq!(*table.get_vector(LOCKED_KEY), [1.5, -2.0]);
    }

    #[test]
    fn insert_or_assign_reports_prior_state() {
        let table = table(1);

        assert!(!table.insert_or_assign(EMPTY_KEY, &[1.0]));
        assert!(table.insert_or_assign(EMPTY_KEY, &[2.0]));
        assert_eq!(*table.get_vector(EMPTY_KEY), [2.0]);
    }

    #[test]
    fn assign_only_touches_present_slots() {
        let table = table(1);

        assert!(!table.assign(EMPTY_KEY, &[1.0]));
        assert!(!table.contains(EMPTY_KEY));
        assert_eq!(*table.get_vector(EMPTY_KEY), [0.0]);

        table.write_vector(EMPTY_KEY, &[2.0]);
        assert!(table.assign(EMPTY_KEY, &[3.0]));
        assert_eq!(*table.get_vector(EMPTY_KEY), [3.0]);
    }

    #[test]
    fn writes_through_view_mark_slot_present() {
        let table = table(2);

        table.get_vector(EMPTY_KEY).copy_from_slice(&[5.0, 5.0]);

        assert!(table.contains(EMPTY_KEY));
        assert_eq!(table.size(), 1);

        let mut keys = [0; 4];
        let mut values = [0.0; 8];
        assert_eq!(table.export_batch(4, 0, &mut keys, &mut values), 1);
        assert_eq!(keys[0], EMPTY_KEY);
        assert_eq!(values[..2], [5.0, 5.0]);

        table.accum_or_assign(EMPTY_KEY, true, &[1.0, 1.0]);
        assert_eq!(*table.get_vector(EMPTY_KEY), [6.0, 6.0]);
    }

    #[test]
    fn reading_through_view_leaves_slot_absent() {
        let table = table(2);

        assert_eq!(*table.get_vector(EMPTY_KEY), [0.0, 0.0]);
        assert!(!table.contains(EMPTY_KEY));

        table.accum_or_assign(EMPTY_KEY, true, &[1.0, 1.0]);
        assert_eq!(*table.get_vector(EMPTY_KEY), [1.0, 1.0]);
    }

    #[test]
    fn clear_resets_everything() {
        let mut table = table(5);

        for key in RESERVED_KEYS {
            table.write_vector(key, &[7.0; 5]);
        }
        assert_eq!(table.size(), 4);

        table.clear();

        assert_eq!(table.size(), 0);
        assert!(block_bytes(&table).iter().all(|&b| b == 0));

        // The table remains usable after clearing.
        table.write_vector(EMPTY_KEY, &[1.0; 5]);
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn export_copies_present_slots_in_order() {
        let table = ReservedTable::<u32>::builder().dimension(2).build().unwrap();

        table.write_vector(EMPTY_KEY, &[30, 31]);
        table.write_vector(RESERVED_KEY_MASK, &[0, 1]);
        table.write_vector(RECLAIM_KEY, &[20, 21]);

        let mut keys = [0; 4];
        let mut values = [0; 8];
        let count = table.export_batch(4, 0, &mut keys, &mut values);

        assert_eq!(count, 3);
        assert_eq!(keys[..3], [RESERVED_KEY_MASK, RECLAIM_KEY, EMPTY_KEY]);
        assert_eq!(values[..6], [0, 1, 20, 21, 30, 31]);
        assert_eq!(values[6..], [0, 0]);
    }

    #[test]
    fn export_respects_max_n() {
        let table = ReservedTable::<u32>::builder().dimension(1).build().unwrap();

        for (value, key) in (0_u32..).zip(RESERVED_KEYS) {
            table.write_vector(key, &[value]);
        }

        let mut keys = [0; 2];
        let mut values = [0; 2];
        let count = table.export_batch(2, 0, &mut keys, &mut values);

        assert_eq!(count, 2);
        assert_eq!(keys, [RESERVED_KEY_MASK, LOCKED_KEY]);
        assert_eq!(values, [0, 1]);
    }

    #[test]
    fn export_starts_at_offset() {
        let table = ReservedTable::<u32>::builder().dimension(1).build().unwrap();

        for (value, key) in (0_u32..).zip(RESERVED_KEYS) {
            table.write_vector(key, &[value]);
        }

        let mut keys = [0; 4];
        let mut values = [0; 4];
        let count = table.export_batch(4, 2, &mut keys, &mut values);

        assert_eq!(count, 2);
        assert_eq!(keys[..2], [RECLAIM_KEY, EMPTY_KEY]);
        assert_eq!(values[..2], [2, 3]);
    }

    #[test]
    fn export_with_offset_past_size_is_noop() {
        let table = ReservedTable::<u32>::builder().dimension(1).build().unwrap();
        table.write_vector(EMPTY_KEY, &[5]);

        let mut keys = [0; 4];
        let mut values = [0; 4];

        assert_eq!(table.export_batch(4, 1, &mut keys, &mut values), 0);
        assert_eq!(table.export_batch(4, 100, &mut keys, &mut values), 0);
        assert_eq!(keys, [0; 4]);
    }

    #[test]
    fn export_of_nothing_needs_no_buffers() {
        let table = table(3);
        table.write_vector(EMPTY_KEY, &[1.0; 3]);

        assert_eq!(table.export_batch(0, 0, &mut [], &mut []), 0);
    }

    #[test]
    fn export_reports_stored_key_for_any_capacity() {
        let table = ReservedTable::<i32>::builder()
            .capacity(3)
            .dimension(1)
            .build()
            .unwrap();

        table.write_vector(10, &[-1]);

        let mut keys = [0; 3];
        let mut values = [0; 3];
        let count = table.export_batch(3, 0, &mut keys, &mut values);

        assert_eq!(count, 1);
        assert_eq!(keys[0], 10);
        assert_eq!(values[0], -1);
    }

    #[test]
    #[should_panic]
    fn export_with_short_key_buffer_panics() {
        let table = table(1);
        let _count = table.export_batch(2, 0, &mut [0; 1], &mut [0.0; 2]);
    }

    #[test]
    #[should_panic]
    fn export_with_short_value_buffer_panics() {
        let table = table(2);
        let _count = table.export_batch(2, 0, &mut [0; 2], &mut [0.0; 3]);
    }

    #[test]
    #[should_panic]
    fn write_with_wrong_dimension_panics() {
        let table = table(3);
        table.write_vector(EMPTY_KEY, &[1.0, 2.0]);
    }

    #[test]
    #[should_panic]
    fn read_with_wrong_dimension_panics() {
        let table = table(3);
        let mut out = [0.0; 4];
        table.read_vector(EMPTY_KEY, &mut out);
    }

    #[test]
    fn keys_sharing_a_slot_share_state() {
        let table = ReservedTable::<u64>::builder().dimension(1).build().unwrap();

        table.write_vector(1, &[11]);

        assert!(table.contains(5));
        assert_eq!(*table.get_vector(5), [11]);
    }

    #[test]
    fn allocation_failure_propagates() {
        let result = ReservedTable::<f32, _>::builder_in(FailingAllocator)
            .dimension(10)
            .build();

        assert!(matches!(
            result,
            Err(Error::Allocation {
                memory_kind: MemoryKind::Device,
                size: 200
            })
        ));
    }

    #[test]
    fn drop_returns_block_to_allocator() {
        let allocator = LocalAllocator::default();

        {
            let table = ReservedTable::<f64, _>::builder_in(&allocator)
                .dimension(3)
                .memory_kind(MemoryKind::Managed)
                .build()
                .unwrap();
            table.write_vector(EMPTY_KEY, &[1.0, 2.0, 3.0]);
        }

        let events = allocator.events.borrow();
        assert_eq!(events.len(), 2);

        let (first, first_kind, first_layout) = events[0];
        let (second, second_kind, second_layout) = events[1];

        assert_eq!(first, "allocate");
        assert_eq!(second, "deallocate");
        assert_eq!(first_kind, MemoryKind::Managed);
        assert_eq!(second_kind, MemoryKind::Managed);
        assert_eq!(first_layout, second_layout);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Too slow under Miri.
    fn concurrent_accumulation_is_exact() {
        let table = Arc::new(
            ReservedTable::<u64>::builder()
                .dimension(8)
                .build()
                .unwrap(),
        );

        let handles = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..500 {
                        table.accum_or_assign(EMPTY_KEY, true, &[1; 8]);
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*table.get_vector(EMPTY_KEY), [4000; 8]);
    }

    #[test]
    fn debug_output_names_geometry() {
        let table = table(6);
        let output = format!("{table:?}");

        assert!(output.contains("capacity: 4"));
        assert!(output.contains("dimension: 6"));
    }
}
