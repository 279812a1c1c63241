//! # Typed Memory Addresses
//!
//! Zero-cost `u64` newtypes that keep virtual and physical addresses apart at
//! compile time, plus page-size markers for the x86-64 translation levels.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | An address subject to page-table translation. |
//! | [`PhysicalAddress`] | An address in physical memory or MMIO space. |
//! | [`PhysicalPage<S>`] | A physical page base, aligned to size `S`. |
//! | [`VirtualRange`] | A half-open, page-aligned virtual interval. |
//!
//! Page sizes are marker types implementing [`PageSize`]: [`Size4K`],
//! [`Size2M`], [`Size1G`], and [`Size512G`] (the span one root-level entry
//! covers; never a leaf size on 4-level hardware).

use core::fmt;
use core::hash::Hash;
use core::marker::PhantomData;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the per-level translation granularities.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;

    fn as_str() -> &'static str;
}

/// 4 KiB page (base granularity; PT leaf).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;

    fn as_str() -> &'static str {
        "4K"
    }
}

/// 2 MiB huge page (PD leaf).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;
impl sealed::Sealed for Size2M {}
impl PageSize for Size2M {
    const SIZE: u64 = 2 * 1024 * 1024;
    const SHIFT: u32 = 21;

    fn as_str() -> &'static str {
        "2M"
    }
}

/// 1 GiB huge page (PDPT leaf).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size1G;
impl sealed::Sealed for Size1G {}
impl PageSize for Size1G {
    const SIZE: u64 = 1024 * 1024 * 1024;
    const SHIFT: u32 = 30;

    fn as_str() -> &'static str {
        "1G"
    }
}

/// Span of a single PML4 entry (512 GiB). Not a leaf size on 4-level
/// hardware; exists so the root level walks with the same machinery.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size512G;
impl sealed::Sealed for Size512G {}
impl PageSize for Size512G {
    const SIZE: u64 = 512 * 1024 * 1024 * 1024;
    const SHIFT: u32 = 39;

    fn as_str() -> &'static str {
        "512G"
    }
}

impl fmt::Debug for Size4K {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Debug for Size2M {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Debug for Size1G {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Debug for Size512G {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

/// A virtual (page-table translated) address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
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

    /// Offset within a page of size `S`.
    #[inline]
    #[must_use]
    pub const fn offset_in<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    /// `true` if the address lies on an `S` boundary.
    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.offset_in::<S>() == 0
    }

    /// The address advanced by `bytes`.
    #[inline]
    #[must_use]
    pub const fn add(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VirtualAddress({:#x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A physical memory address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
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

    /// Offset within a page of size `S`.
    #[inline]
    #[must_use]
    pub const fn offset_in<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    /// `true` if the address lies on an `S` boundary.
    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.offset_in::<S>() == 0
    }

    /// The address advanced by `bytes`.
    #[inline]
    #[must_use]
    pub const fn add(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PhysicalAddress({:#x})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A physical page base aligned to size `S`.
#[repr(transparent)]
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: PhysicalAddress,
    _size: PhantomData<S>,
}

impl<S: PageSize> Copy for PhysicalPage<S> {}

impl<S: PageSize> Clone for PhysicalPage<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: PageSize> PhysicalPage<S> {
    /// Wrap an `S`-aligned physical address as a page base.
    ///
    /// Alignment is asserted in debug builds.
    #[inline]
    #[must_use]
    pub const fn from_addr(base: PhysicalAddress) -> Self {
        debug_assert!(base.as_u64() & (S::SIZE - 1) == 0);
        Self {
            base,
            _size: PhantomData,
        }
    }

    /// The page containing `at` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(at: PhysicalAddress) -> Self {
        Self {
            base: PhysicalAddress::new(at.as_u64() & !(S::SIZE - 1)),
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.base
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PhysicalPage<{}>({:#x})", S::as_str(), self.base.as_u64())
    }
}

/// A half-open, page-aligned virtual interval `[start, end)`.
///
/// The range is reserved and later released by the caller; the mapping
/// engine only populates entries inside it. Construction asserts base-page
/// alignment and a non-empty span; a violated precondition here is a caller
/// bug, not a runtime condition.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct VirtualRange {
    start: VirtualAddress,
    end: VirtualAddress,
}

impl VirtualRange {
    /// Build a range from its page-aligned endpoints.
    ///
    /// # Panics
    /// If `start >= end` or either endpoint is not 4 KiB-aligned.
    #[must_use]
    pub fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        assert!(start < end, "empty or inverted virtual range");
        assert!(
            start.is_aligned::<Size4K>() && end.is_aligned::<Size4K>(),
            "virtual range endpoints must be page-aligned"
        );
        Self { start, end }
    }

    #[inline]
    #[must_use]
    pub const fn start(self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(self) -> VirtualAddress {
        self.end
    }

    /// Length in bytes.
    #[inline]
    #[must_use]
    pub const fn len(self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        false // construction rejects empty ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_containing_aligns_down() {
        let at = PhysicalAddress::new(0x30_1234);
        let page = PhysicalPage::<Size4K>::containing(at);
        assert_eq!(page.base().as_u64(), 0x30_1000);
    }

    #[test]
    fn range_endpoints_and_len() {
        let r = VirtualRange::new(
            VirtualAddress::new(0xffff_8000_0000_0000),
            VirtualAddress::new(0xffff_8000_0000_3000),
        );
        assert_eq!(r.len(), 3 * Size4K::SIZE);
    }

    #[test]
    #[should_panic(expected = "empty or inverted")]
    fn inverted_range_rejected() {
        let _ = VirtualRange::new(
            VirtualAddress::new(0x2000),
            VirtualAddress::new(0x1000),
        );
    }

    #[test]
    #[should_panic(expected = "page-aligned")]
    fn unaligned_range_rejected() {
        let _ = VirtualRange::new(VirtualAddress::new(0x800), VirtualAddress::new(0x2000));
    }
}
