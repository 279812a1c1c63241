//! # Page Table Frame
//!
//! One 4 KiB-aligned table of 512 [`PageEntry`] values. The same in-memory
//! shape backs every level of the hierarchy; which level a table belongs to
//! is tracked by the walker, not by the type.

use crate::addresses::VirtualAddress;
use crate::entry::PageEntry;

/// Number of entries per table (one 4 KiB frame of 8-byte entries).
pub const ENTRIES_PER_TABLE: u16 = 512;

/// Index into a page table, any level. Range `0..512`, checked in debug.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Construct from a raw value; asserts `v < 512` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < ENTRIES_PER_TABLE);
        Self(v)
    }

    /// Extract the table index for a level whose entries each cover
    /// `1 << shift` bytes (shift 39/30/21/12 for PML4/PDPT/PD/PT).
    #[inline]
    #[must_use]
    pub const fn of(va: VirtualAddress, shift: u32) -> Self {
        Self::new(((va.as_u64() >> shift) & 0x1FF) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A page table: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; 512],
}

impl PageTable {
    /// A fully zeroed table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntry::new(); 512],
        }
    }

    /// Reset every entry to non-present.
    #[inline]
    pub const fn zero(&mut self) {
        self.entries = [PageEntry::new(); 512];
    }

    /// Read the entry at `i`. Plain load; no TLB semantics implied.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Changing an entry of the active hierarchy requires the appropriate
    /// TLB maintenance afterwards; that is the caller's concern.
    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageEntry) {
        self.entries[i.as_usize()] = e;
    }
}
