use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;

bitflags! {
    /// Stop mask of a target.
    ///
    /// Exactly one rendezvous-point bit is seeded when the controller is
    /// spawned; the controller clears it (and raises `IDLE`) when the
    /// victim reaches that point. `RESUMING`/`RESUMED` carry the second
    /// phase of the continue handshake. Within an attach phase the bits
    /// only ever move one way: a cleared rendezvous bit is never re-set.
    pub struct StopFlags: u8 {
        /// Victim halted, waiting for the owner's resume().
        const IDLE     = 0x01;
        /// Rendezvous at process exec (spawned victims).
        const CREATE   = 0x02;
        /// Rendezvous at attach (grabbed victims).
        const GRAB     = 0x04;
        /// Rendezvous at the program entry point, before the dynamic
        /// linker has initialised.
        const PREINIT  = 0x08;
        /// Rendezvous after linker initialisation, before main().
        const POSTINIT = 0x10;
        /// Rendezvous at the first instruction of main().
        const MAIN     = 0x20;
        /// Controller woke from rendezvous and is resuming the victim.
        const RESUMING = 0x40;
        /// Resume sequence complete; resume() may return.
        const RESUMED  = 0x80;
    }
}

assert_eq_size!(StopFlags, u8);

bitflags! {
    /// Per-call flags for [`Registry::create`] and [`Registry::grab`].
    ///
    /// [`Registry::create`]: crate::registry::Registry::create
    /// [`Registry::grab`]: crate::registry::Registry::grab
    pub struct ProcFlags: u32 {
        /// Synchronously resume() the victim before returning.
        const WAIT_AT_RENDEZVOUS = 0x01;
    }
}

/// Where a newly controlled victim halts for its first rendezvous.
///
/// Grabbed victims always take their initial rendezvous at the
/// attach-stop regardless of the configured mode; the mode still decides
/// which breakpoints the attach routine plants.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopAt {
    /// Immediately after exec returns, before any user code runs.
    Create,
    /// Immediately after attach.
    Grab,
    /// At the program entry point (`AT_ENTRY`), before the dynamic
    /// linker runs.
    PreInit,
    /// After the dynamic linker has finished, before main().
    PostInit,
    /// At the first instruction of main().
    Main,
}

impl StopAt {
    /// The rendezvous bit a victim in this mode waits on.
    pub fn flag(self) -> StopFlags {
        match self {
            StopAt::Create => StopFlags::CREATE,
            StopAt::Grab => StopFlags::GRAB,
            StopAt::PreInit => StopFlags::PREINIT,
            StopAt::PostInit => StopFlags::POSTINIT,
            StopAt::Main => StopFlags::MAIN,
        }
    }

    /// True when reaching this mode's rendezvous needs a breakpoint
    /// rather than an exec- or attach-stop.
    pub fn needs_breakpoint(self) -> bool {
        match self {
            StopAt::Create | StopAt::Grab => false,
            StopAt::PreInit | StopAt::PostInit | StopAt::Main => true,
        }
    }
}

#[cfg(test)]
#[path = "stop_tests.rs"]
mod tests;
