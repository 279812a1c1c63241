//! # Guest Image Loading and VM Lifecycle
//!
//! The client side of the mapping engine: move guest images from user memory
//! into hypervisor-designated physical destinations, then drive the
//! create/boot handshake over the hypercall channel.
//!
//! Loading works through a temporary virtual alias. The hypervisor picks the
//! destination physical range, which lies outside every existing kernel
//! mapping, so the loader reserves an unused virtual interval, populates page
//! tables for it with [`driver_vmem`], copies the bytes with ordinary stores,
//! performs the instruction-cache maintenance the architecture demands, and
//! releases the alias again. The alias never outlives a single load.
//!
//! All interaction with the surrounding kernel (user-memory copies, alias
//! reservation, physical addresses of staging buffers, cache maintenance)
//! goes through the [`platform::Platform`] capability trait, so the whole
//! orchestration runs against in-memory fakes in tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod loader;
pub mod platform;
pub mod vm;

pub use crate::loader::{LoadImageError, PreloadImage, load_image};
pub use crate::platform::{Platform, UserAddress, UserCopyError};
pub use crate::vm::{CreateVmError, CreateVmRequest, ImageKind, VmControl, VmId};
