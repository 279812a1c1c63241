//! # Walk Observer
//!
//! Structured diagnostics for the mapping walk. The engine reports every
//! structural step through a [`WalkObserver`] injected by the caller, so
//! tests assert on events rather than on log text. [`LogObserver`] forwards
//! the same events to the `log` facade for human consumption.

use crate::addresses::{PhysicalAddress, VirtualAddress, VirtualRange};
use crate::walk::Level;

/// One structural step of a mapping walk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WalkEvent {
    /// A new intermediate table was allocated and linked at `level`,
    /// covering the slot containing `va`.
    TableAllocated {
        level: Level,
        va: VirtualAddress,
    },
    /// A huge leaf was installed at `level`, mapping `va` to `pa`.
    HugeInstalled {
        level: Level,
        va: VirtualAddress,
        pa: PhysicalAddress,
    },
    /// `count` base-page leaves were installed starting at `va`.
    LeavesInstalled {
        va: VirtualAddress,
        pa: PhysicalAddress,
        count: u64,
    },
    /// A slot that had to be empty already holds a mapping to `existing`.
    /// The walk halts fatally right after this event.
    Conflict {
        level: Level,
        va: VirtualAddress,
        existing: PhysicalAddress,
    },
    /// Cross-processor table synchronization ran over `range`.
    Synced {
        range: VirtualRange,
    },
}

/// Event sink for mapping walks.
///
/// The default implementation drops everything, so observers only implement
/// what they care about.
pub trait WalkObserver {
    fn on_event(&self, _event: &WalkEvent) {}
}

/// Discards all events.
#[derive(Copy, Clone, Default)]
pub struct NullObserver;

impl WalkObserver for NullObserver {}

/// Forwards walk events to the `log` facade.
///
/// Conflicts log at error level since the walk is about to halt; everything
/// else is trace noise.
#[derive(Copy, Clone, Default)]
pub struct LogObserver;

impl WalkObserver for LogObserver {
    fn on_event(&self, event: &WalkEvent) {
        match event {
            WalkEvent::TableAllocated { level, va } => {
                log::trace!("allocated {level:?} table for {va}");
            }
            WalkEvent::HugeInstalled { level, va, pa } => {
                log::trace!("huge leaf at {level:?}: {va} -> {pa}");
            }
            WalkEvent::LeavesInstalled { va, pa, count } => {
                log::trace!("{count} base leaves: {va} -> {pa}");
            }
            WalkEvent::Conflict { level, va, existing } => {
                log::error!("remapping already mapped {level:?} slot at {va} (maps {existing})");
            }
            WalkEvent::Synced { range } => {
                log::trace!(
                    "synchronized table roots over {}..{}",
                    range.start(),
                    range.end()
                );
            }
        }
    }
}
