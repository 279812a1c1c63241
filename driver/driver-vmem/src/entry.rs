//! # Page-Table Entry
//!
//! A single 64-bit x86-64 paging entry in its raw bitfield form, modeling the
//! common superset of fields shared by all four levels (PML4E, PDPTE, PDE,
//! PTE). An entry is either
//!
//! - **empty** (not present),
//! - a **pointer to the next-level table** (present, `PS=0`, intermediate
//!   levels), or
//! - a **leaf** terminating translation at a physical frame (`PS=1` at the
//!   PDPT/PD levels for 1 GiB / 2 MiB pages; every present PT entry).
//!
//! At the PT level bit 7 is architecturally PAT, not PS; the typed
//! constructors force it clear there, and [`PageEntry::kind`] is only
//! meaningful at intermediate levels.

use crate::addresses::{PhysicalAddress, PhysicalPage, Size4K};
use bitfield_struct::bitfield;

/// Raw 64-bit page-table entry, any level.
///
/// Also used as the *protection attribute* descriptor for mapping calls: the
/// caller builds the permission/cacheability bits once and the engine stamps
/// base address, `present`, and `PS` per installed entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    /// Present (P, bit 0). Valid entry if set.
    pub present: bool,

    /// Writable (RW, bit 1). Clear means read-only.
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Set allows CPL 3 access.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6). Leaf only; set by the CPU on first write.
    pub dirty: bool,

    /// Page Size (PS, bit 7). Intermediate levels only: set marks the entry
    /// as a huge leaf instead of a next-table pointer.
    pub huge: bool,

    /// Global (G, bit 8). Leaf only; survives CR3 reloads when CR4.PGE.
    pub global: bool,

    /// Bits 9-11, available to the OS.
    #[bits(3)]
    pub os_low: u8,

    /// Physical frame bits [51:12].
    #[bits(40)]
    frame: u64,

    /// Bits 52-62, available to the OS / protection keys.
    #[bits(11)]
    pub os_high: u16,

    /// No-Execute (NX, bit 63), honored when EFER.NXE is set.
    pub no_execute: bool,
}

/// Decoded view of an entry at an **intermediate** level (PML4/PDPT/PD).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryKind {
    /// Not present.
    Empty,
    /// Present, `PS=0`: points at the next-level table frame.
    Table(PhysicalPage<Size4K>),
    /// Present, `PS=1`: a huge leaf mapping starting at this physical base.
    Leaf(PhysicalAddress),
}

impl PageEntry {
    /// Physical base address carried by the entry.
    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    /// Stamp the physical base address (must be 4 KiB-aligned).
    #[inline]
    pub const fn set_physical_address(&mut self, pa: PhysicalAddress) {
        debug_assert!(pa.as_u64() & 0xFFF == 0);
        self.set_frame(pa.as_u64() >> 12);
    }

    /// Builder-style [`set_physical_address`](Self::set_physical_address).
    #[inline]
    #[must_use]
    pub const fn with_physical_address(mut self, pa: PhysicalAddress) -> Self {
        self.set_physical_address(pa);
        self
    }

    /// Create a pointer to a next-level table with the given link flags.
    ///
    /// Forces `present=1` and `PS=0`; the table frame must be 4 KiB-aligned.
    #[inline]
    #[must_use]
    pub const fn make_table(table: PhysicalPage<Size4K>, mut link_flags: Self) -> Self {
        link_flags.set_present(true);
        link_flags.set_huge(false);
        link_flags.set_physical_address(table.base());
        link_flags
    }

    /// Create a leaf from protection attributes.
    ///
    /// Sets `present=1`, forces `PS` to `huge` (true for 1 GiB / 2 MiB
    /// leaves, false for a 4 KiB PTE), and stamps the physical base.
    #[inline]
    #[must_use]
    pub const fn make_leaf(pa: PhysicalAddress, mut attrs: Self, huge: bool) -> Self {
        attrs.set_present(true);
        attrs.set_huge(huge);
        attrs.set_physical_address(pa);
        attrs
    }

    /// Decode an intermediate-level entry.
    #[inline]
    #[must_use]
    pub fn kind(self) -> EntryKind {
        if !self.present() {
            EntryKind::Empty
        } else if self.huge() {
            EntryKind::Leaf(self.physical_address())
        } else {
            EntryKind::Table(PhysicalPage::from_addr(self.physical_address()))
        }
    }

    /// Raw 64-bit value (flags + address).
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.into_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trip() {
        let attrs = PageEntry::new().with_writable(true).with_no_execute(true);
        let e = PageEntry::make_leaf(PhysicalAddress::new(0x5555_0000), attrs, false);
        assert!(e.present());
        assert!(e.writable());
        assert!(e.no_execute());
        assert!(!e.huge());
        assert_eq!(e.physical_address().as_u64(), 0x5555_0000);
    }

    #[test]
    fn table_link_forces_ps_clear() {
        let page = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x1000));
        let e = PageEntry::make_table(page, PageEntry::new().with_writable(true).with_huge(true));
        assert_eq!(e.kind(), EntryKind::Table(page));
    }

    #[test]
    fn kind_decodes_huge_leaf() {
        let attrs = PageEntry::new().with_writable(true);
        let e = PageEntry::make_leaf(PhysicalAddress::new(0x4000_0000), attrs, true);
        assert_eq!(e.kind(), EntryKind::Leaf(PhysicalAddress::new(0x4000_0000)));
        assert_eq!(PageEntry::new().kind(), EntryKind::Empty);
    }
}
