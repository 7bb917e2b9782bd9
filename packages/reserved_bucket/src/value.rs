use std::fmt::Debug;

/// An element type that can be stored in the value vectors of a
/// [`ReservedTable`][crate::ReservedTable].
///
/// The table zero-fills its backing block on creation, on erase and on clear, and reads the
/// zeroed memory back as values. Implementations therefore promise that the all-zero bit
/// pattern is a valid value of the type and that it means zero.
///
/// # Safety
///
/// Implementors must guarantee that a value whose every byte is zero is a valid, initialized
/// instance of the type and that it represents the additive identity.
pub unsafe trait BucketValue: Copy + Debug + PartialEq + Send + Sync + 'static {
    /// The additive identity, bit-identical to zero-filled memory.
    const ZERO: Self;

    /// Adds `other` onto `self` in place, as used by accumulating writes.
    ///
    /// Integer implementations wrap on overflow so that concurrent accumulation never panics
    /// while a slot lock is held.
    fn accumulate(&mut self, other: Self);
}

macro_rules! impl_float_value {
    ($($ty:ty),*) => {
        $(
            // SAFETY: IEEE 754 positive zero is the all-zero bit pattern.
            unsafe impl BucketValue for $ty {
                const ZERO: Self = 0.0;

                #[inline]
                fn accumulate(&mut self, other: Self) {
                    *self += other;
                }
            }
        )*
    };
}

macro_rules! impl_integer_value {
    ($($ty:ty),*) => {
        $(
            // SAFETY: The integer zero is the all-zero bit pattern.
            unsafe impl BucketValue for $ty {
                const ZERO: Self = 0;

                #[inline]
                fn accumulate(&mut self, other: Self) {
                    *self = self.wrapping_add(other);
                }
            }
        )*
    };
}

impl_float_value!(f32, f64);
impl_integer_value!(i32, i64, u32, u64);

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::mem::{self, MaybeUninit};
    use std::ptr;

    use super::*;

    fn zeroed<V: BucketValue>() -> V {
        let mut slot = MaybeUninit::<V>::uninit();

        // SAFETY: The pointer comes from a live MaybeUninit of the right size.
        unsafe {
            ptr::write_bytes(slot.as_mut_ptr().cast::<u8>(), 0, mem::size_of::<V>());
        }

        // SAFETY: BucketValue guarantees that all-zero memory is a valid value.
        unsafe { slot.assume_init() }
    }

    #[test]
    fn zero_constant_matches_zeroed_memory() {
        assert_eq!(zeroed::<f32>().to_bits(), f32::ZERO.to_bits());
        assert_eq!(zeroed::<f64>().to_bits(), f64::ZERO.to_bits());
        assert_eq!(zeroed::<i32>(), i32::ZERO);
        assert_eq!(zeroed::<i64>(), i64::ZERO);
        assert_eq!(zeroed::<u32>(), u32::ZERO);
        assert_eq!(zeroed::<u64>(), u64::ZERO);
    }

    #[test]
    fn float_accumulate_adds() {
        let mut value = 1.5_f32;
        value.accumulate(2.25);
        assert_eq!(value.to_bits(), 3.75_f32.to_bits());
    }

    #[test]
    fn integer_accumulate_wraps() {
        let mut value = u32::MAX;
        value.accumulate(2);
        assert_eq!(value, 1);

        let mut value = i64::MIN;
        value.accumulate(-1);
        assert_eq!(value, i64::MAX);
    }
}
