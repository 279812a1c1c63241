//! # Platform Capabilities
//!
//! What the loader needs from the surrounding kernel, expressed as one
//! capability trait. The production implementation wires these to the host
//! kernel's primitives; tests substitute an in-memory fake.

use core::fmt;

use driver_vmem::addresses::{PhysicalAddress, VirtualAddress, VirtualRange};

/// An address in the calling process' user space. Never dereferenced
/// directly; only ever handed to [`Platform::copy_from_user`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct UserAddress(u64);

impl UserAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for UserAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UserAddress({:#x})", self.0)
    }
}

impl fmt::Display for UserAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A user-memory copy faulted (unmapped source, permission, ...).
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("user memory fault")]
pub struct UserCopyError;

/// Kernel services the image loader is parameterized over.
pub trait Platform {
    /// Copy `dst.len()` bytes from user memory at `src` into `dst`.
    ///
    /// # Errors
    /// [`UserCopyError`] if any part of the source range faults.
    fn copy_from_user(&self, dst: &mut [u8], src: UserAddress) -> Result<(), UserCopyError>;

    /// Physical address of kernel-owned staging memory at `ptr`. The caller
    /// guarantees the memory is physically contiguous and pinned for as long
    /// as the address is in use.
    fn staging_phys(&self, ptr: *const u8) -> PhysicalAddress;

    /// Reserve an unused, page-aligned virtual interval of exactly `len`
    /// bytes for a temporary alias. `None` means the alias space is
    /// exhausted.
    fn reserve_alias(&self, len: u64) -> Option<VirtualRange>;

    /// Return a previously reserved alias interval. Page-table entries
    /// populated inside it are torn down here as well.
    fn release_alias(&self, range: VirtualRange);

    /// Raw pointer for stores through a reserved alias.
    ///
    /// # Safety
    /// `va` must lie in a currently reserved alias range whose page tables
    /// have been populated; the pointer is valid until the range is
    /// released.
    unsafe fn alias_ptr(&self, va: VirtualAddress) -> *mut u8;

    /// Instruction-cache maintenance after new code was written at `va`.
    /// A no-op on architectures with coherent instruction fetch.
    fn flush_icache(&self, va: VirtualAddress, len: u64);

    /// Data-cache clean for architectures whose guests start with caches
    /// disabled. Most platforms leave the default no-op.
    fn flush_dcache(&self, va: VirtualAddress, len: u64) {
        let _ = (va, len);
    }
}
