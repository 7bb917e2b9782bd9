use std::alloc::{Layout, alloc, dealloc};
use std::fmt;
use std::ptr::NonNull;

use crate::Error;

/// Where the backing block of a [`ReservedTable`][crate::ReservedTable] is placed.
///
/// The kind is passed through to the [`Allocator`] unchanged. It is up to the allocator to
/// decide what each kind means on the current platform.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum MemoryKind {
    /// Memory local to the accelerator that executes table operations. This is the default.
    #[default]
    Device,

    /// Page-locked host memory that the accelerator can access directly.
    HostPinned,

    /// Memory that migrates between host and accelerator on demand.
    Managed,

    /// Ordinary pageable host memory.
    Host,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Device => "device",
            Self::HostPinned => "host-pinned",
            Self::Managed => "managed",
            Self::Host => "host",
        };

        f.write_str(name)
    }
}

/// Supplies the single memory block that backs a [`ReservedTable`][crate::ReservedTable].
///
/// The table requests exactly one block when it is created and returns it when it is dropped.
/// The allocator does not need to zero the block; the table does that itself.
///
/// # Examples
///
/// An allocator that refuses every request, which makes table creation fail:
///
/// ```
/// use std::alloc::Layout;
/// use std::ptr::NonNull;
///
/// use reserved_bucket::{Allocator, Error, MemoryKind, ReservedTable};
///
/// #[derive(Debug)]
/// struct Exhausted;
///
/// impl Allocator for Exhausted {
///     fn allocate(&self, memory_kind: MemoryKind, layout: Layout) -> Result<NonNull<u8>, Error> {
///         Err(Error::Allocation {
///             memory_kind,
///             size: layout.size(),
///         })
///     }
///
///     unsafe fn deallocate(&self, _memory_kind: MemoryKind, _ptr: NonNull<u8>, _layout: Layout) {
///         unreachable!("nothing was ever allocated");
///     }
/// }
///
/// let result = ReservedTable::<f32, _>::builder_in(Exhausted)
///     .dimension(8)
///     .build();
///
/// assert!(matches!(result, Err(Error::Allocation { .. })));
/// ```
pub trait Allocator {
    /// Allocates a block that satisfies `layout` in memory of the given kind.
    ///
    /// The contents of the returned block may be uninitialized.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if the request cannot be satisfied.
    fn allocate(&self, memory_kind: MemoryKind, layout: Layout) -> crate::Result<NonNull<u8>>;

    /// Returns a block to the allocator.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` was returned by [`allocate()`](Self::allocate) on this
    /// allocator with the same `memory_kind` and `layout`, and that it has not already been
    /// returned.
    unsafe fn deallocate(&self, memory_kind: MemoryKind, ptr: NonNull<u8>, layout: Layout);
}

/// An [`Allocator`] that serves every [`MemoryKind`] from the global heap.
///
/// This lets a reserved table run on hosts without an accelerator, with the host threads that
/// call table operations taking the role of device execution contexts.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn allocate(&self, memory_kind: MemoryKind, layout: Layout) -> crate::Result<NonNull<u8>> {
        if layout.size() == 0 {
            return Err(Error::Allocation {
                memory_kind,
                size: 0,
            });
        }

        // SAFETY: We checked above that the layout is not zero-sized.
        let ptr = unsafe { alloc(layout) };

        NonNull::new(ptr).ok_or(Error::Allocation {
            memory_kind,
            size: layout.size(),
        })
    }

    unsafe fn deallocate(&self, _memory_kind: MemoryKind, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding safety requirements to the caller, who guarantees that the block
        // came from allocate() with this layout, which obtained it from the global allocator.
        unsafe {
            dealloc(ptr.as_ptr(), layout);
        }
    }
}
