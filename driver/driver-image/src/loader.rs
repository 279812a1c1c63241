//! # Image Loader
//!
//! Copies one guest image from user memory to a hypervisor-designated
//! physical destination through a short-lived virtual alias.

use driver_vmem::addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use driver_vmem::observer::WalkObserver;
use driver_vmem::walk::{HugeSupport, TableSync};
use driver_vmem::{
    AddressSpace, FrameAlloc, MapRangeError, PageEntry, PhysMapper, WalkEnv, align_up,
};

use crate::platform::{Platform, UserAddress};

/// One image to place into guest memory: user-space source bytes and the
/// physical destination the hypervisor handed back.
#[derive(Copy, Clone, Debug)]
pub struct PreloadImage {
    pub source_address: UserAddress,
    pub size: u64,
    pub target_address: PhysicalAddress,
}

/// Why an image load failed. The destination range itself is never partially
/// written on the mapping paths; a faulted user copy may leave partial bytes,
/// and the caller abandons the VM either way.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LoadImageError {
    /// No alias interval of the required length was available.
    #[error("unable to reserve {0:#x} bytes of alias space")]
    AliasReserve(u64),
    /// Populating page tables for the alias failed.
    #[error("mapping load destination failed: {0}")]
    MapDestination(#[from] MapRangeError),
    /// The user source range faulted.
    #[error("unable to copy image from user address {0}")]
    CopyImage(UserAddress),
}

/// Alias attributes: kernel-only, writable, never executable. The alias
/// exists to store bytes, not to run them.
fn alias_attrs() -> PageEntry {
    PageEntry::new().with_writable(true).with_no_execute(true)
}

/// Load `image` into physical memory.
///
/// The destination may start at any byte offset; the alias maps the
/// surrounding page-aligned superset and the copy lands at the in-page
/// offset. Cache maintenance runs over exactly the copied byte range, and
/// the alias is released on every exit path.
///
/// # Errors
/// See [`LoadImageError`].
pub fn load_image<P, M, A, H, S, O>(
    platform: &P,
    aspace: &AddressSpace<'_, M>,
    alloc: &mut A,
    env: &WalkEnv<H, S, O>,
    image: &PreloadImage,
) -> Result<(), LoadImageError>
where
    P: Platform,
    M: PhysMapper,
    A: FrameAlloc,
    H: HugeSupport,
    S: TableSync,
    O: WalkObserver,
{
    if image.size == 0 {
        return Ok(());
    }

    let phys_start = PhysicalPage::<Size4K>::containing(image.target_address);
    let page_offs = image.target_address.offset_in::<Size4K>();
    let map_len = align_up(image.size + page_offs, Size4K::SIZE);

    let alias = platform
        .reserve_alias(map_len)
        .ok_or(LoadImageError::AliasReserve(map_len))?;
    debug_assert_eq!(alias.len(), map_len);

    log::info!(
        "loading image: {} bytes from user {} to {} via alias {}",
        image.size,
        image.source_address,
        image.target_address,
        alias.start()
    );

    if let Err(err) = aspace.map_range(alloc, env, alias, phys_start.base(), alias_attrs()) {
        log::error!("unable to map guest RAM at {} for image loading", image.target_address);
        platform.release_alias(alias);
        return Err(err.into());
    }

    let copy_va = alias.start().add(page_offs);
    // SAFETY: copy_va lies inside the alias just reserved and mapped above.
    let dst = unsafe {
        core::slice::from_raw_parts_mut(platform.alias_ptr(copy_va), image.size as usize)
    };
    let copied = platform.copy_from_user(dst, image.source_address);

    // New instructions may have landed; flush even on a partial copy since
    // some bytes were already written through the alias.
    platform.flush_icache(copy_va, image.size);
    platform.flush_dcache(copy_va, image.size);
    platform.release_alias(alias);

    match copied {
        Ok(()) => Ok(()),
        Err(_) => {
            log::error!("unable to copy image from user {}", image.source_address);
            Err(LoadImageError::CopyImage(image.source_address))
        }
    }
}

/// The page-aligned alias interval a load of `size` bytes at `target` needs.
/// Exposed for capacity planning by embedders; `load_image` recomputes it.
#[must_use]
pub fn alias_len_for(target: PhysicalAddress, size: u64) -> u64 {
    align_up(size + target.offset_in::<Size4K>(), Size4K::SIZE)
}
