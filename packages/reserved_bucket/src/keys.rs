//! The sentinel keys that a hash table reserves for its own control states.
//!
//! A hash table that marks slots as empty, reclaimed or locked by writing special key values
//! into them cannot also store those values as user keys. Such keys are routed to a
//! [`ReservedTable`][crate::ReservedTable] instead.

/// Key value that marks an empty slot in the main table.
pub const EMPTY_KEY: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Key value that marks a slot whose entry is being reclaimed in the main table.
pub const RECLAIM_KEY: u64 = 0xFFFF_FFFF_FFFF_FFFE;

/// Key value that marks a slot locked by an in-flight writer in the main table.
pub const LOCKED_KEY: u64 = 0xFFFF_FFFF_FFFF_FFFD;

/// Mask shared by all reserved keys. It is itself a reserved key.
pub const RESERVED_KEY_MASK: u64 = 0xFFFF_FFFF_FFFF_FFFC;

/// All reserved keys, in slot order for a table of the default capacity.
pub const RESERVED_KEYS: [u64; 4] = [RESERVED_KEY_MASK, LOCKED_KEY, RECLAIM_KEY, EMPTY_KEY];

/// Returns `true` if `key` is one of the reserved sentinel keys and must therefore be stored
/// in a [`ReservedTable`][crate::ReservedTable] rather than in the main table.
///
/// # Examples
///
/// ```
/// use reserved_bucket::{EMPTY_KEY, is_reserved_key};
///
/// assert!(is_reserved_key(EMPTY_KEY));
/// assert!(!is_reserved_key(42));
/// ```
#[must_use]
#[inline]
pub fn is_reserved_key(key: u64) -> bool {
    key & RESERVED_KEY_MASK == RESERVED_KEY_MASK
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(clippy::indexing_slicing, reason = "panic is fine in tests")]
mod tests {
    use super::*;

    #[test]
    fn every_sentinel_is_reserved() {
        for key in RESERVED_KEYS {
            assert!(is_reserved_key(key), "{key:#x} should be reserved");
        }
    }

    #[test]
    fn ordinary_keys_are_not_reserved() {
        assert!(!is_reserved_key(0));
        assert!(!is_reserved_key(1));
        assert!(!is_reserved_key(RESERVED_KEY_MASK - 1));
        assert!(!is_reserved_key(0x7FFF_FFFF_FFFF_FFFF));
    }

    #[test]
    fn sentinels_are_distinct_modulo_default_capacity() {
        let mut seen = [false; 4];

        for key in RESERVED_KEYS {
            #[expect(
                clippy::cast_possible_truncation,
                reason = "value is masked down to two bits"
            )]
            let index = (key & 3) as usize;
            assert!(!seen[index], "two sentinels share slot {index}");
            seen[index] = true;
        }
    }

    #[test]
    fn reserved_keys_listed_in_slot_order() {
        for (index, key) in RESERVED_KEYS.into_iter().enumerate() {
            assert_eq!(key & 3, index as u64);
        }
    }
}
