//! # Hypervisor Service Calls
//!
//! The control-plane channel between the driver and the hypervisor: a
//! numbered operation plus one register-sized argument, answered by one
//! register-sized result. Arguments that do not fit a register are passed
//! indirectly as the **physical address** of a staging block the hypervisor
//! reads and writes; the caller keeps that block alive and pinned across the
//! call.
//!
//! The transport itself is a seam ([`Hypercall`]) so the orchestration logic
//! runs unmodified against a scripted fake in tests. The real implementation
//! for hardware-virtualized x86-64 is [`VmcallTransport`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

/// Operations the hypervisor exposes to this driver.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(u64)]
pub enum HypercallOp {
    /// Submit a VM creation descriptor. The argument is the physical address
    /// of the descriptor block; the hypervisor fills in the VM identifier
    /// and the load destinations before returning.
    CreateVmConfig = 0x101,
    /// Start a previously created VM. The argument is the VM identifier.
    BootVm = 0x102,
}

impl HypercallOp {
    #[inline]
    #[must_use]
    pub const fn code(self) -> u64 {
        self as u64
    }
}

/// A hypervisor service call failed; negative results are hypervisor error
/// codes, passed through for the caller to interpret.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("hypervisor rejected {op:?} with code {code}")]
pub struct HypercallError {
    pub op: HypercallOp,
    pub code: i64,
}

/// One-argument hypervisor call transport.
pub trait Hypercall {
    /// Issue `op` with a single register argument, returning the raw result
    /// register. Negative values signal failure.
    fn call_arg1(&self, op: HypercallOp, arg: u64) -> i64;

    /// Issue `op` and convert the hypervisor's convention into a `Result`:
    /// negative results become [`HypercallError`], everything else is
    /// returned as-is.
    ///
    /// # Errors
    /// [`HypercallError`] carrying the operation and the hypervisor's code.
    fn checked(&self, op: HypercallOp, arg: u64) -> Result<i64, HypercallError> {
        let ret = self.call_arg1(op, arg);
        if ret < 0 {
            log::warn!("hypercall {op:?} failed with {ret}");
            return Err(HypercallError { op, code: ret });
        }
        Ok(ret)
    }
}

/// The production transport: the x86 hardware-virtualization call
/// instruction, operation in `rax`, argument in `rdi`, result in `rax`.
#[cfg(target_arch = "x86_64")]
#[derive(Copy, Clone, Default)]
pub struct VmcallTransport;

#[cfg(target_arch = "x86_64")]
impl Hypercall for VmcallTransport {
    fn call_arg1(&self, op: HypercallOp, arg: u64) -> i64 {
        let ret: i64;
        // SAFETY: vmcall traps to the hypervisor; register usage is fixed by
        // the call convention above and nothing else is clobbered.
        unsafe {
            core::arch::asm!(
                "vmcall",
                inlateout("rax") op.code() => ret,
                in("rdi") arg,
                options(nostack),
            );
        }
        ret
    }
}
