use thiserror::Error;

use crate::MemoryKind;

/// Errors that can occur when creating a [`ReservedTable`][crate::ReservedTable].
///
/// Once a table exists, none of its operations fail with an error. Caller contract
/// violations (such as passing a vector of the wrong dimension) are reported by panicking.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The allocator could not provide the backing block for the table.
    #[error("failed to allocate {size} bytes of {memory_kind} memory for reserved table")]
    Allocation {
        /// The kind of memory that was requested.
        memory_kind: MemoryKind,

        /// The size of the requested block, in bytes.
        size: usize,
    },

    /// The requested table geometry does not fit in the address space.
    #[error(
        "reserved table with capacity {capacity} and dimension {dimension} exceeds the addressable size"
    )]
    LayoutOverflow {
        /// The requested number of slots.
        capacity: usize,

        /// The requested number of values per slot.
        dimension: usize,
    },
}

/// A specialized `Result` type for reserved table operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn allocation_message_names_kind_and_size() {
        let error = Error::Allocation {
            memory_kind: MemoryKind::Device,
            size: 4096,
        };

        assert_eq!(
            error.to_string(),
            "failed to allocate 4096 bytes of device memory for reserved table"
        );
    }

    #[test]
    fn layout_overflow_message_names_geometry() {
        let error = Error::LayoutOverflow {
            capacity: 4,
            dimension: usize::MAX,
        };

        let message = error.to_string();
        assert!(message.contains("capacity 4"));
        assert!(message.contains(&format!("dimension {}", usize::MAX)));
    }
}
