//! # On-Demand Physical Range Mapping
//!
//! Page-table plumbing for a hypervisor control driver: establish, on demand,
//! a temporary virtual alias for an arbitrary physical range so the driver
//! can move guest-image bytes into hypervisor-designated physical memory
//! with ordinary loads and stores. The destination is chosen by the
//! hypervisor and lies outside every existing mapping, so there is no
//! higher-level allocator to lean on; this crate walks and populates the
//! active paging hierarchy directly.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The fields index four levels of tables of 512 eight-byte entries each.
//! Translation ends at the first **leaf**: every present PT entry (4 KiB), a
//! PD entry with `PS=1` (2 MiB), or a PDPT entry with `PS=1` (1 GiB).
//!
//! ## What you get
//!
//! - [`AddressSpace`]: a hierarchy root plus the means to reach its tables
//!   ([`from_root`](AddressSpace::from_root) for a configured root,
//!   [`from_current`](AddressSpace::from_current) for the root the executing
//!   processor has installed).
//! - [`AddressSpace::map_range`]: the range walker. It descends the hierarchy
//!   top-down in address order, allocates intermediate tables on first use,
//!   installs huge leaves where span and alignment permit, fatally rejects
//!   occupied slots, and accumulates a [`walk::ModMask`] that drives the
//!   post-walk synchronization.
//! - The capability seams the engine is parameterized over: [`FrameAlloc`],
//!   [`PhysMapper`], [`walk::HugeSupport`], [`walk::TableSync`], and the
//!   structured [`observer::WalkObserver`].
//!
//! ## Contract
//!
//! The caller reserves the destination virtual range beforehand, owns it
//! exclusively for the duration of the call, and releases it afterwards.
//! The engine takes no locks of its own and never rolls back: on failure
//! some prefix of the range may already be populated and the whole range
//! must be treated as unusable until torn down elsewhere. Table frames,
//! once linked, belong to the surrounding address-space subsystem. Content
//! cache maintenance (I-cache vs D-cache) is the caller's job after the
//! bytes are written; it depends on what was copied, not on how the mapping
//! was built.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod addresses;
pub mod entry;
pub mod observer;
pub mod table;
pub mod walk;

use crate::addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
pub use crate::entry::PageEntry;
pub use crate::table::PageTable;
pub use crate::walk::{MapPolicy, MapRangeError, ModMask, WalkEnv};

/// Allocator for **physical** 4 KiB table frames.
///
/// The implementation decides where frames come from; returned frames must
/// be 4 KiB-aligned. The call may block, so mapping must never run on a
/// context that forbids blocking. `None` means resource exhaustion and is
/// surfaced unchanged to the mapping caller.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;
}

/// Converts physical table frames to usable references in the current
/// virtual address space (identity map, higher-half direct map, ...).
///
/// # Safety
/// - `pa` must be mapped writable in the current page tables for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa`.
pub trait PhysMapper {
    /// Convert a physical address to a mutable reference.
    ///
    /// # Safety
    /// See the trait-level contract.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// The root page of a paging hierarchy.
pub type RootPage = PhysicalPage<Size4K>;

/// Handle to a single, concrete address space: the hierarchy root plus the
/// mapper used to reach its tables.
///
/// The root is resolved exactly once, at construction, and used consistently
/// for the whole lifetime of the handle; nothing re-resolves mid-walk.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: RootPage,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Use an explicitly chosen root frame (e.g. the default kernel root
    /// handed over by the embedding address-space subsystem).
    #[inline]
    pub const fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self { root, mapper }
    }

    /// View the address space **currently active on this processor** by
    /// reading the hardware table-base register.
    ///
    /// This is the strategy the image loader ships with: its stores through
    /// the fresh alias must be visible through whatever hierarchy the
    /// processor has installed at call time.
    ///
    /// # Safety
    /// - Must run at CPL0 with paging enabled.
    /// - Assumes CR3 points at a valid root frame reachable via `mapper`.
    #[cfg(target_arch = "x86_64")]
    #[inline]
    pub unsafe fn from_current(mapper: &'m M) -> Self {
        let cr3: u64;
        // SAFETY: reading CR3 has no side effects; CPL0 is required by the
        // function contract.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        // Strip PWT/PCD and reserved bits; bits [51:12] hold the root frame.
        let root_pa = PhysicalAddress::new(cr3 & 0x000F_FFFF_FFFF_F000);
        Self {
            root: RootPage::from_addr(root_pa),
            mapper,
        }
    }

    /// Physical page of the hierarchy root.
    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    /// Borrow the table stored in `page`.
    #[inline]
    pub(crate) fn table_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        // SAFETY: the PhysMapper contract guarantees table frames are
        // reachable and writable; `page` is 4 KiB-aligned by type.
        unsafe { self.mapper.phys_to_mut::<PageTable>(page.base()) }
    }

    /// Zero a freshly allocated table frame before linking it.
    #[inline]
    pub(crate) fn zero_table(&self, page: PhysicalPage<Size4K>) {
        self.table_mut(page).zero();
    }

    /// Translate a virtual address if mapped, at any leaf size.
    ///
    /// Adds the in-page offset for 1 GiB and 2 MiB leaves.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        use crate::addresses::{Size1G, Size2M};
        use crate::entry::EntryKind;
        use crate::table::TableIndex;

        let root = self.table_mut(self.root);
        let e4 = root.get(TableIndex::of(va, 39));
        let EntryKind::Table(pdpt_page) = e4.kind() else {
            return None;
        };

        let pdpt = self.table_mut(pdpt_page);
        let pd_page = match pdpt.get(TableIndex::of(va, Size1G::SHIFT)).kind() {
            EntryKind::Empty => return None,
            EntryKind::Leaf(base) => return Some(base.add(va.offset_in::<Size1G>())),
            EntryKind::Table(p) => p,
        };

        let pd = self.table_mut(pd_page);
        let pt_page = match pd.get(TableIndex::of(va, Size2M::SHIFT)).kind() {
            EntryKind::Empty => return None,
            EntryKind::Leaf(base) => return Some(base.add(va.offset_in::<Size2M>())),
            EntryKind::Table(p) => p,
        };

        let pt = self.table_mut(pt_page);
        let e1 = pt.get(TableIndex::of(va, Size4K::SHIFT));
        if !e1.present() {
            return None;
        }
        Some(e1.physical_address().add(va.offset_in::<Size4K>()))
    }
}

/// Align `x` down to the nearest multiple of `a` (`a` a power of two).
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a` (`a` a power of two).
///
/// `x + (a - 1)` must not overflow.
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::addresses::{Size2M, VirtualRange};
    use crate::observer::NullObserver;
    use crate::walk::{NoSync, X86HugeSupport};

    fn env() -> WalkEnv<X86HugeSupport, NoSync, NullObserver> {
        WalkEnv {
            policy: MapPolicy::x86_64_kernel(),
            huge: X86HugeSupport::default(),
            sync: NoSync,
            observer: NullObserver,
        }
    }

    #[test]
    fn query_resolves_base_and_huge_leaves() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = fresh_space(&phys, &mut alloc);
        let env = env();

        let attrs = PageEntry::new().with_writable(true);

        // One 4 KiB page.
        let va = VirtualAddress::new(0xffff_8000_0000_0000);
        let range = VirtualRange::new(va, va.add(4096));
        aspace
            .map_range(&mut alloc, &env, range, PhysicalAddress::new(0x30_0000), attrs)
            .expect("map 4k");
        assert_eq!(
            aspace.query(va.add(0x123)),
            Some(PhysicalAddress::new(0x30_0123))
        );

        // One 2 MiB leaf; query must add the in-page offset.
        let va2 = VirtualAddress::new(0xffff_8000_2000_0000);
        let range2 = VirtualRange::new(va2, va2.add(Size2M::SIZE));
        aspace
            .map_range(
                &mut alloc,
                &env,
                range2,
                PhysicalAddress::new(0x0400_0000),
                attrs,
            )
            .expect("map 2m");
        assert_eq!(
            aspace.query(va2.add(0x1_0042)),
            Some(PhysicalAddress::new(0x0401_0042))
        );

        // Unmapped addresses resolve to nothing.
        assert_eq!(aspace.query(VirtualAddress::new(0xffff_9000_0000_0000)), None);
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align_down(0x12345, 4096), 0x12000);
        assert_eq!(align_up(0x12345, 4096), 0x13000);
        assert_eq!(align_up(0x12000, 4096), 0x12000);
    }
}
