//! # VM Lifecycle
//!
//! The create/boot handshake: stage the configuration in kernel memory,
//! submit the creation descriptor, let the hypervisor choose the load
//! destinations, place the images, and boot.

use alloc::boxed::Box;
use alloc::vec;
use core::cell::UnsafeCell;
use core::fmt;

use driver_hypercall::{Hypercall, HypercallError, HypercallOp};
use driver_vmem::addresses::PhysicalAddress;
use driver_vmem::observer::WalkObserver;
use driver_vmem::walk::{HugeSupport, TableSync};
use driver_vmem::{AddressSpace, FrameAlloc, PhysMapper, WalkEnv};

use crate::loader::{LoadImageError, PreloadImage, load_image};
use crate::platform::{Platform, UserAddress};

/// Sentinel for descriptor fields the hypervisor must overwrite.
const GPA_UNSET: u64 = 0xdead_beef;

/// Identifier of a created VM, assigned by the hypervisor.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct VmId(u64);

impl VmId {
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A VM creation request as submitted by the control interface: user-space
/// locations and sizes of the configuration and the images. `vm_id` is
/// written back on success.
///
/// A kernel image is mandatory; BIOS and ramdisk are optional and skipped
/// when their size is zero.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct CreateVmRequest {
    pub vm_id: u64,
    pub kernel_image_addr: u64,
    pub kernel_image_size: u64,
    pub bios_image_addr: u64,
    pub bios_image_size: u64,
    pub ramdisk_image_addr: u64,
    pub ramdisk_image_size: u64,
    pub config_addr: u64,
    pub config_size: u64,
}

/// The creation descriptor exchanged with the hypervisor. Field order and
/// widths are wire format; the hypervisor reads the first five fields and
/// writes the rest before the creation call returns.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct CreateVmArgs {
    pub cfg_file_gpa: u64,
    pub cfg_file_size: u64,
    pub kernel_image_size: u64,
    pub bios_image_size: u64,
    pub ramdisk_image_size: u64,
    pub vm_id: u64,
    pub kernel_load_gpa: u64,
    pub bios_load_gpa: u64,
    pub ramdisk_load_gpa: u64,
}

/// Which guest image a failure refers to.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ImageKind {
    Kernel,
    Bios,
    Ramdisk,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Kernel => "kernel",
            Self::Bios => "bios",
            Self::Ramdisk => "ramdisk",
        })
    }
}

/// Why VM creation failed. The hypervisor side is not rolled back; a failed
/// creation leaves the VM (if already created) unbooted.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CreateVmError {
    /// The request names no kernel image.
    #[error("VM creation requires a kernel image")]
    MissingKernelImage,
    /// Copying the configuration blob from user memory faulted.
    #[error("copying VM configuration from {0} failed")]
    CopyConfig(UserAddress),
    /// The hypervisor rejected a service call.
    #[error(transparent)]
    Hypercall(#[from] HypercallError),
    /// Loading one of the images failed.
    #[error("loading {0} image failed: {1}")]
    Image(ImageKind, LoadImageError),
}

/// The collaborators a VM lifecycle operation runs against, fixed at
/// construction.
pub struct VmControl<'c, P, T, M, H, S, O>
where
    P: Platform,
    T: Hypercall,
    M: PhysMapper,
    H: HugeSupport,
    S: TableSync,
    O: WalkObserver,
{
    pub platform: &'c P,
    pub transport: &'c T,
    pub aspace: &'c AddressSpace<'c, M>,
    pub env: &'c WalkEnv<H, S, O>,
}

impl<P, T, M, H, S, O> VmControl<'_, P, T, M, H, S, O>
where
    P: Platform,
    T: Hypercall,
    M: PhysMapper,
    H: HugeSupport,
    S: TableSync,
    O: WalkObserver,
{
    /// Create and boot a VM from `request`.
    ///
    /// Stages the configuration blob and the creation descriptor in kernel
    /// memory, passes the descriptor's physical address to the hypervisor,
    /// loads the kernel image (and BIOS/ramdisk when present) to the
    /// hypervisor-chosen destinations, and issues the boot call. On success
    /// `request.vm_id` holds the new identifier.
    ///
    /// # Errors
    /// See [`CreateVmError`]. A missing kernel image is rejected before
    /// anything is submitted to the hypervisor.
    pub fn create_vm<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        request: &mut CreateVmRequest,
    ) -> Result<VmId, CreateVmError> {
        if request.kernel_image_size == 0 {
            log::error!("no kernel image provided");
            return Err(CreateVmError::MissingKernelImage);
        }

        // Stage the configuration where the hypervisor can read it.
        let mut cfg = vec![0u8; request.config_size as usize];
        self.platform
            .copy_from_user(&mut cfg, UserAddress::new(request.config_addr))
            .map_err(|_| CreateVmError::CopyConfig(UserAddress::new(request.config_addr)))?;

        // Boxed so the descriptor has a stable, physically resolvable
        // location; UnsafeCell because the hypervisor writes through its own
        // alias of the same memory during the call.
        let args = Box::new(UnsafeCell::new(CreateVmArgs {
            cfg_file_gpa: self.platform.staging_phys(cfg.as_ptr()).as_u64(),
            cfg_file_size: request.config_size,
            kernel_image_size: request.kernel_image_size,
            bios_image_size: request.bios_image_size,
            ramdisk_image_size: request.ramdisk_image_size,
            vm_id: 0,
            kernel_load_gpa: GPA_UNSET,
            bios_load_gpa: GPA_UNSET,
            ramdisk_load_gpa: GPA_UNSET,
        }));
        let args_pa = self.platform.staging_phys(args.get().cast::<u8>().cast_const());

        self.transport
            .checked(HypercallOp::CreateVmConfig, args_pa.as_u64())?;

        // SAFETY: the creation call has returned; the hypervisor no longer
        // writes the descriptor.
        let filled = unsafe { *args.get() };
        let vm_id = VmId(filled.vm_id);
        log::info!(
            "VM {vm_id} created: kernel at {:#x}, bios at {:#x}, ramdisk at {:#x}",
            filled.kernel_load_gpa,
            filled.bios_load_gpa,
            filled.ramdisk_load_gpa
        );

        self.load(
            alloc,
            ImageKind::Kernel,
            request.kernel_image_addr,
            request.kernel_image_size,
            filled.kernel_load_gpa,
        )?;
        if request.bios_image_size > 0 {
            self.load(
                alloc,
                ImageKind::Bios,
                request.bios_image_addr,
                request.bios_image_size,
                filled.bios_load_gpa,
            )?;
        }
        if request.ramdisk_image_size > 0 {
            self.load(
                alloc,
                ImageKind::Ramdisk,
                request.ramdisk_image_addr,
                request.ramdisk_image_size,
                filled.ramdisk_load_gpa,
            )?;
        }

        log::info!("images loaded, booting VM {vm_id}");
        self.transport.checked(HypercallOp::BootVm, vm_id.as_u64())?;

        request.vm_id = vm_id.as_u64();
        Ok(vm_id)
    }

    fn load<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        kind: ImageKind,
        source: u64,
        size: u64,
        target: u64,
    ) -> Result<(), CreateVmError> {
        let image = PreloadImage {
            source_address: UserAddress::new(source),
            size,
            target_address: PhysicalAddress::new(target),
        };
        load_image(self.platform, self.aspace, alloc, self.env, &image)
            .map_err(|err| CreateVmError::Image(kind, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use std::cell::RefCell;

    /// Plays the hypervisor: records calls, fills the creation descriptor,
    /// and captures the staged configuration bytes.
    struct FakeHypervisor {
        vm_id: u64,
        kernel_load_gpa: u64,
        bios_load_gpa: u64,
        create_result: i64,
        boot_result: i64,
        calls: RefCell<Vec<(HypercallOp, u64)>>,
        seen_cfg: RefCell<Vec<u8>>,
    }

    impl FakeHypervisor {
        fn new() -> Self {
            Self {
                vm_id: 3,
                kernel_load_gpa: 0x7000_0000,
                bios_load_gpa: 0x000f_0123,
                create_result: 0,
                boot_result: 0,
                calls: RefCell::new(Vec::new()),
                seen_cfg: RefCell::new(Vec::new()),
            }
        }
    }

    impl Hypercall for FakeHypervisor {
        fn call_arg1(&self, op: HypercallOp, arg: u64) -> i64 {
            self.calls.borrow_mut().push((op, arg));
            match op {
                HypercallOp::CreateVmConfig => {
                    if self.create_result < 0 {
                        return self.create_result;
                    }
                    // The test platform resolves staging addresses to host
                    // pointers, so the "hypervisor" can reach the block.
                    let args = unsafe { &mut *(arg as usize as *mut CreateVmArgs) };
                    let cfg = unsafe {
                        std::slice::from_raw_parts(
                            args.cfg_file_gpa as usize as *const u8,
                            args.cfg_file_size as usize,
                        )
                    };
                    *self.seen_cfg.borrow_mut() = cfg.to_vec();
                    assert_eq!(args.vm_id, 0);
                    assert_eq!(args.kernel_load_gpa, 0xdead_beef);
                    args.vm_id = self.vm_id;
                    args.kernel_load_gpa = self.kernel_load_gpa;
                    args.bios_load_gpa = self.bios_load_gpa;
                    args.ramdisk_load_gpa = 0x9000_0000;
                    0
                }
                HypercallOp::BootVm => self.boot_result,
            }
        }
    }

    fn request() -> CreateVmRequest {
        CreateVmRequest {
            kernel_image_addr: 0x100,
            kernel_image_size: 0x1800,
            bios_image_addr: 0x2000,
            bios_image_size: 0x200,
            config_addr: 0x3000,
            config_size: 0x40,
            ..CreateVmRequest::default()
        }
    }

    #[test]
    fn create_and_boot_places_images_at_hypervisor_destinations() {
        let fx = Fixture::new(64);
        let mut alloc = fx.alloc();
        let aspace = fx.space(&mut alloc);
        let hv = FakeHypervisor::new();

        let kernel: Vec<u8> = (0u32..0x1800).map(|i| (i % 239) as u8).collect();
        let bios = [0x5Au8; 0x200];
        let cfg = [0xC7u8; 0x40];
        fx.platform.install_user(0x100, &kernel);
        fx.platform.install_user(0x2000, &bios);
        fx.platform.install_user(0x3000, &cfg);

        let control = VmControl {
            platform: &fx.platform,
            transport: &hv,
            aspace: &aspace,
            env: &fx.env,
        };
        let mut req = request();
        let vm_id = control.create_vm(&mut alloc, &mut req).expect("create");

        assert_eq!(vm_id, VmId(3));
        assert_eq!(req.vm_id, 3);
        assert_eq!(*hv.seen_cfg.borrow(), cfg);

        // Creation first, boot last, with the assigned identifier.
        let calls = hv.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, HypercallOp::CreateVmConfig);
        assert_eq!(calls[1], (HypercallOp::BootVm, 3));

        // Kernel landed page-aligned, BIOS at its in-page offset.
        let reservations = fx.platform.reservations.borrow();
        assert_eq!(reservations.len(), 2);
        assert_eq!(fx.platform.arena_slice(reservations[0], 0, 0x1800), &kernel[..]);
        assert_eq!(fx.platform.arena_slice(reservations[1], 0x123, 0x200), &bios[..]);
        assert_eq!(
            aspace.query(reservations[1].start()),
            Some(driver_vmem::addresses::PhysicalAddress::new(0x000f_0000))
        );
    }

    #[test]
    fn missing_kernel_image_is_rejected_before_any_call() {
        let fx = Fixture::new(8);
        let mut alloc = fx.alloc();
        let aspace = fx.space(&mut alloc);
        let hv = FakeHypervisor::new();

        let control = VmControl {
            platform: &fx.platform,
            transport: &hv,
            aspace: &aspace,
            env: &fx.env,
        };
        let mut req = request();
        req.kernel_image_size = 0;
        let err = control
            .create_vm(&mut alloc, &mut req)
            .expect_err("kernel image is mandatory");
        assert_eq!(err, CreateVmError::MissingKernelImage);
        assert!(hv.calls.borrow().is_empty());
    }

    #[test]
    fn rejected_creation_loads_nothing() {
        let fx = Fixture::new(8);
        let mut alloc = fx.alloc();
        let aspace = fx.space(&mut alloc);
        let mut hv = FakeHypervisor::new();
        hv.create_result = -22;

        fx.platform.install_user(0x3000, &[0u8; 0x40]);
        fx.platform.install_user(0x100, &[0u8; 0x1800]);

        let control = VmControl {
            platform: &fx.platform,
            transport: &hv,
            aspace: &aspace,
            env: &fx.env,
        };
        let err = control
            .create_vm(&mut alloc, &mut request())
            .expect_err("creation rejected");
        assert_eq!(
            err,
            CreateVmError::Hypercall(HypercallError {
                op: HypercallOp::CreateVmConfig,
                code: -22
            })
        );
        assert!(fx.platform.reservations.borrow().is_empty());
    }

    #[test]
    fn failed_image_load_skips_boot() {
        let fx = Fixture::new(64);
        let mut alloc = fx.alloc();
        let aspace = fx.space(&mut alloc);
        let hv = FakeHypervisor::new();

        // Config present, kernel source missing: the copy faults.
        fx.platform.install_user(0x3000, &[0u8; 0x40]);

        let control = VmControl {
            platform: &fx.platform,
            transport: &hv,
            aspace: &aspace,
            env: &fx.env,
        };
        let mut req = request();
        let err = control
            .create_vm(&mut alloc, &mut req)
            .expect_err("kernel copy must fault");
        assert!(matches!(
            err,
            CreateVmError::Image(ImageKind::Kernel, LoadImageError::CopyImage(_))
        ));
        assert!(
            !hv.calls
                .borrow()
                .iter()
                .any(|(op, _)| *op == HypercallOp::BootVm)
        );
        assert_eq!(req.vm_id, 0, "identifier is only written back on success");
    }

    #[test]
    fn rejected_boot_surfaces_after_images_are_loaded() {
        let fx = Fixture::new(64);
        let mut alloc = fx.alloc();
        let aspace = fx.space(&mut alloc);
        let mut hv = FakeHypervisor::new();
        hv.boot_result = -5;

        fx.platform.install_user(0x100, &[1u8; 0x1800]);
        fx.platform.install_user(0x2000, &[2u8; 0x200]);
        fx.platform.install_user(0x3000, &[3u8; 0x40]);

        let control = VmControl {
            platform: &fx.platform,
            transport: &hv,
            aspace: &aspace,
            env: &fx.env,
        };
        let err = control
            .create_vm(&mut alloc, &mut request())
            .expect_err("boot rejected");
        assert_eq!(
            err,
            CreateVmError::Hypercall(HypercallError {
                op: HypercallOp::BootVm,
                code: -5
            })
        );
        assert_eq!(fx.platform.reservations.borrow().len(), 2);
    }
}
