use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{BucketValue, SlotLockGuard};

/// Locked access to the value vector of one slot in a [`ReservedTable`][crate::ReservedTable].
///
/// Returned by [`get_vector()`][crate::ReservedTable::get_vector],
/// [`find()`][crate::ReservedTable::find] and
/// [`find_or_insert()`][crate::ReservedTable::find_or_insert]. The slot stays locked for as long
/// as the view exists, so other execution contexts that touch the same slot wait until it is
/// dropped. Other slots are not affected.
///
/// Taking mutable access through the view marks the slot as present under the view's key, the
/// same as [`write_vector()`][crate::ReservedTable::write_vector] would. An absent slot that is
/// only read through the view stays absent.
///
/// # Deadlocks
///
/// Calling another operation on the same slot while holding its view on the same thread
/// deadlocks. Drop the view first.
///
/// # Examples
///
/// ```
/// use reserved_bucket::{EMPTY_KEY, ReservedTable};
///
/// let table = ReservedTable::<f32>::builder().dimension(3).build().unwrap();
/// table.write_vector(EMPTY_KEY, &[1.0, 2.0, 3.0]);
///
/// {
///     let mut values = table.find(EMPTY_KEY).unwrap();
///     values[1] = 20.0;
/// }
///
/// let mut out = [0.0; 3];
/// table.read_vector(EMPTY_KEY, &mut out);
/// assert_eq!(out, [1.0, 20.0, 3.0]);
/// ```
#[must_use = "the slot is unlocked as soon as the view is dropped"]
pub struct SlotVector<'a, V: BucketValue> {
    _guard: SlotLockGuard<'a>,
    present: &'a AtomicBool,
    key_word: &'a AtomicU64,
    key: u64,
    values: NonNull<V>,
    len: usize,
    _borrow: PhantomData<&'a mut [V]>,
}

impl<'a, V: BucketValue> SlotVector<'a, V> {
    /// # Safety
    ///
    /// The caller must ensure that `values` points to `len` initialized values that belong to
    /// the slot guarded by `guard` and stay valid for `'a`, and that `present` and `key_word`
    /// are the header fields of that same slot.
    pub(crate) unsafe fn new(
        guard: SlotLockGuard<'a>,
        present: &'a AtomicBool,
        key_word: &'a AtomicU64,
        key: u64,
        values: NonNull<V>,
        len: usize,
    ) -> Self {
        Self {
            _guard: guard,
            present,
            key_word,
            key,
            values,
            len,
            _borrow: PhantomData,
        }
    }
}

impl<V: BucketValue> Deref for SlotVector<'_, V> {
    type Target = [V];

    fn deref(&self) -> &[V] {
        // SAFETY: The constructor guarantees the pointer and length describe the slot's values,
        // and we hold the slot lock, so no other context accesses them while we are alive.
        unsafe { slice::from_raw_parts(self.values.as_ptr(), self.len) }
    }
}

impl<V: BucketValue> DerefMut for SlotVector<'_, V> {
    fn deref_mut(&mut self) -> &mut [V] {
        // Anything written from here on is table data, so the slot cannot stay absent.
        if !self.present.load(Ordering::Relaxed) {
            self.key_word.store(self.key, Ordering::Relaxed);
            self.present.store(true, Ordering::Release);
        }

        // SAFETY: As in deref(). Exclusive access to the view gives exclusive access to the
        // values because the slot lock admits only one view at a time.
        unsafe { slice::from_raw_parts_mut(self.values.as_ptr(), self.len) }
    }
}

impl<V: BucketValue> fmt::Debug for SlotVector<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<V: BucketValue> PartialEq<[V]> for SlotVector<'_, V> {
    fn eq(&self, other: &[V]) -> bool {
        **self == *other
    }
}
