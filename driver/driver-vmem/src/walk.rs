//! # The Range Walk
//!
//! The mapping engine proper: descend the hierarchy root → PDPT → PD → PT,
//! left to right in address order, allocating intermediate tables on first
//! use. At every intermediate slot a single promotion policy decides whether
//! a huge leaf can terminate the walk early; otherwise the walk recurses for
//! exactly that slot's span. The PT level installs base-page leaves and
//! performs the fatal occupied-slot check. A [`ModMask`] accumulates which
//! levels had entries written; after full success the finalizer propagates
//! structural changes across processors when the policy requires it.
//!
//! ## Ordering and failure
//!
//! - Levels populate strictly top-down; within a level, slots populate in
//!   ascending address order with monotonic cursor advance.
//! - Failures bubble unmodified; nothing rolls back. A failed call leaves
//!   some prefix possibly populated and the range unusable until torn down
//!   by the surrounding subsystem.
//! - An occupied slot is a caller precondition violation, not an error: the
//!   walk halts with a diagnostic naming the conflicting physical frame.

use crate::addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, Size512G, VirtualAddress,
    VirtualRange,
};
use crate::entry::{EntryKind, PageEntry};
use crate::observer::{WalkEvent, WalkObserver};
use crate::table::TableIndex;
use crate::{AddressSpace, FrameAlloc, PhysMapper};

bitflags::bitflags! {
    /// Which hierarchy levels had a table entry written during a walk.
    ///
    /// A level's bit covers both leaf installs and links to newly allocated
    /// child tables; it is set at most once per call by construction.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct ModMask: u8 {
        const PML4 = 1 << 0;
        const PDPT = 1 << 1;
        const PD = 1 << 2;
        const PT = 1 << 3;
    }
}

/// A level of the 4-level hierarchy, root first.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    /// The [`ModMask`] bit recording a write into a table at this level.
    #[inline]
    #[must_use]
    pub const fn modified_bit(self) -> ModMask {
        match self {
            Self::Pml4 => ModMask::PML4,
            Self::Pdpt => ModMask::PDPT,
            Self::Pd => ModMask::PD,
            Self::Pt => ModMask::PT,
        }
    }
}

/// Per-call mapping policy, fixed by configuration.
#[derive(Copy, Clone, Debug)]
pub struct MapPolicy {
    /// Largest permitted leaf size, as a page shift. `12` restricts the
    /// walk to base pages; `30` admits every x86-64 huge size.
    pub max_page_shift: u32,
    /// Levels whose structural modification requires cross-processor
    /// propagation through [`TableSync`] after the walk.
    pub sync_levels: ModMask,
}

impl MapPolicy {
    /// Kernel-space defaults: huge leaves up to 1 GiB; root-level changes
    /// must be propagated to the other processors' cached hierarchies.
    #[inline]
    #[must_use]
    pub const fn x86_64_kernel() -> Self {
        Self {
            max_page_shift: Size1G::SHIFT,
            sync_levels: ModMask::PML4,
        }
    }

    /// Base pages only; promotion is never eligible.
    #[inline]
    #[must_use]
    pub const fn base_pages_only() -> Self {
        Self {
            max_page_shift: Size4K::SHIFT,
            sync_levels: ModMask::PML4,
        }
    }
}

/// Platform eligibility for huge leaves, per level and attribute set.
///
/// Consulted uniformly at every intermediate level; a platform that cannot
/// terminate translation at some level simply reports the level's shift as
/// unsupported and the walk descends.
pub trait HugeSupport {
    fn supports(&self, shift: u32, attrs: PageEntry) -> bool;
}

/// x86-64 huge-leaf support: 2 MiB always, 1 GiB iff the processor
/// advertises it (CPUID `pdpe1gb`), independent of the attributes.
#[derive(Copy, Clone, Debug)]
pub struct X86HugeSupport {
    pub gigabyte_pages: bool,
}

impl Default for X86HugeSupport {
    fn default() -> Self {
        Self {
            gigabyte_pages: true,
        }
    }
}

impl HugeSupport for X86HugeSupport {
    fn supports(&self, shift: u32, _attrs: PageEntry) -> bool {
        match shift {
            Size2M::SHIFT => true,
            Size1G::SHIFT => self.gigabyte_pages,
            _ => false,
        }
    }
}

/// Cross-processor propagation of structural table changes.
///
/// Invoked by the finalizer over exactly the requested range when the
/// accumulated [`ModMask`] intersects [`MapPolicy::sync_levels`], e.g. new
/// root entries that other processors' cached hierarchies have not seen.
pub trait TableSync {
    fn sync_mappings(&self, range: VirtualRange);
}

/// No propagation needed (single-processor or shared-root deployments).
#[derive(Copy, Clone, Default)]
pub struct NoSync;

impl TableSync for NoSync {
    fn sync_mappings(&self, _range: VirtualRange) {}
}

/// The capability set a mapping call runs against, bundled so the engine's
/// collaborators are fixed in one place at configuration time.
pub struct WalkEnv<H: HugeSupport, S: TableSync, O: WalkObserver> {
    pub policy: MapPolicy,
    pub huge: H,
    pub sync: S,
    pub observer: O,
}

/// The one recoverable mapping failure: an intermediate table frame could
/// not be allocated. Bubbles unmodified from any depth; entries already
/// installed above the failing level stay in place.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapRangeError {
    #[error("out of memory allocating {0:?} table")]
    TableAlloc(Level),
}

/// An intermediate hierarchy level, identified by the span one of its
/// entries covers. Drives the single generic walker below; `descend` is the
/// only per-level difference.
pub(crate) trait WalkLevel: PageSize {
    /// Level of the tables indexed at this stage.
    const LEVEL: Level;
    /// Level of the child tables this stage's entries link to.
    const CHILD: Level;

    fn descend<M: PhysMapper, A: FrameAlloc, H: HugeSupport, S: TableSync, O: WalkObserver>(
        walk: &mut Walk<'_, M, A, H, S, O>,
        child: PhysicalPage<Size4K>,
        addr: VirtualAddress,
        end: VirtualAddress,
        pa: PhysicalAddress,
    ) -> Result<(), MapRangeError>;
}

impl WalkLevel for Size512G {
    const LEVEL: Level = Level::Pml4;
    const CHILD: Level = Level::Pdpt;

    fn descend<M: PhysMapper, A: FrameAlloc, H: HugeSupport, S: TableSync, O: WalkObserver>(
        walk: &mut Walk<'_, M, A, H, S, O>,
        child: PhysicalPage<Size4K>,
        addr: VirtualAddress,
        end: VirtualAddress,
        pa: PhysicalAddress,
    ) -> Result<(), MapRangeError> {
        walk.level::<Size1G>(child, addr, end, pa)
    }
}

impl WalkLevel for Size1G {
    const LEVEL: Level = Level::Pdpt;
    const CHILD: Level = Level::Pd;

    fn descend<M: PhysMapper, A: FrameAlloc, H: HugeSupport, S: TableSync, O: WalkObserver>(
        walk: &mut Walk<'_, M, A, H, S, O>,
        child: PhysicalPage<Size4K>,
        addr: VirtualAddress,
        end: VirtualAddress,
        pa: PhysicalAddress,
    ) -> Result<(), MapRangeError> {
        walk.level::<Size2M>(child, addr, end, pa)
    }
}

impl WalkLevel for Size2M {
    const LEVEL: Level = Level::Pd;
    const CHILD: Level = Level::Pt;

    fn descend<M: PhysMapper, A: FrameAlloc, H: HugeSupport, S: TableSync, O: WalkObserver>(
        walk: &mut Walk<'_, M, A, H, S, O>,
        child: PhysicalPage<Size4K>,
        addr: VirtualAddress,
        end: VirtualAddress,
        pa: PhysicalAddress,
    ) -> Result<(), MapRangeError> {
        walk.leaf_range(child, addr, end, pa);
        Ok(())
    }
}

/// End of the slot containing `addr` at level `L`, clamped to `end`.
#[inline]
fn slot_end<L: WalkLevel>(addr: VirtualAddress, end: VirtualAddress) -> VirtualAddress {
    let boundary = (addr.as_u64() & !(L::SIZE - 1)).checked_add(L::SIZE);
    match boundary {
        Some(b) if b < end.as_u64() => VirtualAddress::new(b),
        _ => end,
    }
}

/// Non-leaf link flags derived from the leaf attributes: present + writable,
/// plus user when the leaf is user-accessible so the walk stays traversable
/// from CPL 3.
#[inline]
fn link_flags_for(attrs: PageEntry) -> PageEntry {
    PageEntry::new()
        .with_present(true)
        .with_writable(true)
        .with_user_access(attrs.user_access())
}

/// Cursor state of one mapping call.
pub(crate) struct Walk<'w, M: PhysMapper, A: FrameAlloc, H: HugeSupport, S: TableSync, O: WalkObserver>
{
    aspace: &'w AddressSpace<'w, M>,
    alloc: &'w mut A,
    env: &'w WalkEnv<H, S, O>,
    attrs: PageEntry,
    link_flags: PageEntry,
    mask: ModMask,
}

impl<M: PhysMapper, A: FrameAlloc, H: HugeSupport, S: TableSync, O: WalkObserver>
    Walk<'_, M, A, H, S, O>
{
    /// Walk the table at `table_page` (level `L`) across `[addr, end)`,
    /// mapping `pa` onwards with the call's attributes.
    fn level<L: WalkLevel>(
        &mut self,
        table_page: PhysicalPage<Size4K>,
        addr: VirtualAddress,
        end: VirtualAddress,
        pa: PhysicalAddress,
    ) -> Result<(), MapRangeError> {
        let mut addr = addr;
        let mut pa = pa;
        while addr < end {
            let next = slot_end::<L>(addr, end);
            let span = next.as_u64() - addr.as_u64();
            let idx = TableIndex::of(addr, L::SHIFT);
            let entry = self.aspace.table_mut(table_page).get(idx);

            if let Some(leaf) = self.try_promote::<L>(entry, addr, span, pa) {
                self.aspace.table_mut(table_page).set(idx, leaf);
                self.mask |= L::LEVEL.modified_bit();
                self.env.observer.on_event(&WalkEvent::HugeInstalled {
                    level: L::LEVEL,
                    va: addr,
                    pa,
                });
            } else {
                let child = self.obtain_child::<L>(table_page, idx, entry, addr)?;
                L::descend(self, child, addr, next, pa)?;
            }

            pa = pa.add(span);
            addr = next;
        }
        Ok(())
    }

    /// The promotion policy, shared by every intermediate level: a huge
    /// leaf of span `L::SIZE` may end the walk at this slot iff
    ///
    /// - the policy's maximum leaf size admits it,
    /// - the platform supports the size for these attributes,
    /// - the requested span is exactly the slot span,
    /// - virtual and physical cursors are both aligned to it, and
    /// - the slot is empty. An occupied slot is never reclaimed here (table
    ///   frames are owned by the surrounding subsystem once linked), so
    ///   promotion is skipped and the walk descends.
    ///
    /// Ineligibility is not an error; it routes to the finer-grained path.
    fn try_promote<L: WalkLevel>(
        &self,
        entry: PageEntry,
        addr: VirtualAddress,
        span: u64,
        pa: PhysicalAddress,
    ) -> Option<PageEntry> {
        if self.env.policy.max_page_shift < L::SHIFT {
            return None;
        }
        if !self.env.huge.supports(L::SHIFT, self.attrs) {
            return None;
        }
        if span != L::SIZE {
            return None;
        }
        if !addr.is_aligned::<L>() || !pa.is_aligned::<L>() {
            return None;
        }
        if entry.present() {
            return None;
        }
        Some(PageEntry::make_leaf(pa, self.attrs, true))
    }

    /// Obtain the child table for the slot, allocating and linking it on
    /// first use. A slot already holding a leaf means the caller requested a
    /// remap of an occupied virtual range: fatal, never overwritten.
    fn obtain_child<L: WalkLevel>(
        &mut self,
        table_page: PhysicalPage<Size4K>,
        idx: TableIndex,
        entry: PageEntry,
        addr: VirtualAddress,
    ) -> Result<PhysicalPage<Size4K>, MapRangeError> {
        match entry.kind() {
            EntryKind::Table(child) => Ok(child),
            EntryKind::Empty => {
                let frame = self
                    .alloc
                    .alloc_4k()
                    .ok_or(MapRangeError::TableAlloc(L::CHILD))?;
                self.aspace.zero_table(frame);
                self.aspace
                    .table_mut(table_page)
                    .set(idx, PageEntry::make_table(frame, self.link_flags));
                self.mask |= L::LEVEL.modified_bit();
                self.env.observer.on_event(&WalkEvent::TableAllocated {
                    level: L::CHILD,
                    va: addr,
                });
                Ok(frame)
            }
            EntryKind::Leaf(existing) => {
                self.env.observer.on_event(&WalkEvent::Conflict {
                    level: L::LEVEL,
                    va: addr,
                    existing,
                });
                panic!(
                    "remapping already mapped {:?} slot at {addr}: existing mapping to {existing}",
                    L::LEVEL
                );
            }
        }
    }

    /// The leaf populator: install one base-page entry per 4 KiB slot of
    /// `[addr, end)`. Every slot must be empty; an occupied slot halts with
    /// the conflicting physical frame in the diagnostic. The leaf level is
    /// marked modified once per call regardless of the page count.
    fn leaf_range(
        &mut self,
        pt_page: PhysicalPage<Size4K>,
        addr: VirtualAddress,
        end: VirtualAddress,
        pa: PhysicalAddress,
    ) {
        let first_va = addr;
        let first_pa = pa;
        let mut addr = addr;
        let mut pa = pa;
        let mut count = 0u64;
        while addr < end {
            let idx = TableIndex::of(addr, Size4K::SHIFT);
            let pt = self.aspace.table_mut(pt_page);
            let entry = pt.get(idx);
            if entry.present() {
                let existing = entry.physical_address();
                self.env.observer.on_event(&WalkEvent::Conflict {
                    level: Level::Pt,
                    va: addr,
                    existing,
                });
                panic!("remapping already mapped page at {addr}: existing mapping to {existing}");
            }
            pt.set(idx, PageEntry::make_leaf(pa, self.attrs, false));
            count += 1;
            addr = addr.add(Size4K::SIZE);
            pa = pa.add(Size4K::SIZE);
        }
        self.mask |= ModMask::PT;
        self.env.observer.on_event(&WalkEvent::LeavesInstalled {
            va: first_va,
            pa: first_pa,
            count,
        });
    }
}

impl<M: PhysMapper> AddressSpace<'_, M> {
    /// Map `range` 1:1 onto the physical interval starting at `phys`, in
    /// address order, with `attrs` constant for the whole call.
    ///
    /// The caller must have reserved `range` beforehand, own it exclusively
    /// for the duration of the call, and release it later; no entry may
    /// exist anywhere inside it. Intermediate states become visible to
    /// concurrent readers as they are written.
    ///
    /// On success the returned [`ModMask`] tells which levels were written,
    /// after the finalizer has already propagated structural changes where
    /// [`MapPolicy::sync_levels`] required it. Content cache maintenance
    /// remains the caller's responsibility.
    ///
    /// # Errors
    /// [`MapRangeError::TableAlloc`] when an intermediate table frame cannot
    /// be allocated; no partial cleanup is performed.
    ///
    /// # Panics
    /// If `phys` is not base-page aligned, and fatally when a slot inside
    /// `range` is already mapped (a caller precondition violation).
    pub fn map_range<A: FrameAlloc, H: HugeSupport, S: TableSync, O: WalkObserver>(
        &self,
        alloc: &mut A,
        env: &WalkEnv<H, S, O>,
        range: VirtualRange,
        phys: PhysicalAddress,
        attrs: PageEntry,
    ) -> Result<ModMask, MapRangeError> {
        assert!(
            phys.is_aligned::<Size4K>(),
            "physical base must be page-aligned"
        );

        let mut walk = Walk {
            aspace: self,
            alloc,
            env,
            attrs,
            link_flags: link_flags_for(attrs),
            mask: ModMask::empty(),
        };
        walk.level::<Size512G>(self.root, range.start(), range.end(), phys)?;
        let mask = walk.mask;

        if mask.intersects(env.policy.sync_levels) {
            env.sync.sync_mappings(range);
            env.observer.on_event(&WalkEvent::Synced { range });
        }
        Ok(mask)
    }

    /// Map a single page of size `S` at `va`.
    ///
    /// Convenience form of [`map_range`](Self::map_range) over one `S`-sized
    /// interval; the same policy applies, so a huge `S` the platform or
    /// policy declines lands as finer leaves covering the same span.
    ///
    /// # Errors
    /// See [`map_range`](Self::map_range).
    ///
    /// # Panics
    /// If `va` is not aligned to `S`.
    pub fn map_one<S, A, H, Sy, O>(
        &self,
        alloc: &mut A,
        env: &WalkEnv<H, Sy, O>,
        va: VirtualAddress,
        page: PhysicalPage<S>,
        attrs: PageEntry,
    ) -> Result<ModMask, MapRangeError>
    where
        S: PageSize,
        A: FrameAlloc,
        H: HugeSupport,
        Sy: TableSync,
        O: WalkObserver,
    {
        assert!(va.is_aligned::<S>(), "virtual address must be aligned to the page size");
        let range = VirtualRange::new(va, va.add(S::SIZE));
        self.map_range(alloc, env, range, page.base(), attrs)
    }
}
