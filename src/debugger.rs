//! Trait seams for the external collaborators: the low-level debugger
//! library that owns the OS tracing syscalls, its runtime-linker
//! database, and the probe layer above us. This crate drives them; it
//! never issues trace syscalls itself.

use crate::sys;
use libc::{c_int, c_long};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Victim run state as reported by the debugger library.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcState {
    /// Running freely.
    Run,
    /// Stopped on an event we are tracing.
    Stop,
    /// Trace-stopped by some other debugger; nothing we can do.
    TraceStop,
    Dead,
}

/// Auxiliary-vector entries the attach machine consults.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AuxKey {
    /// Program entry point.
    Entry,
    /// Interpreter (dynamic linker) base address.
    Base,
}

/// A raw register/memory poke, passed through to the thread-bound OS
/// primitive unchanged.
#[derive(Clone, Debug)]
pub struct PokeRequest {
    /// Request code in the debugger library's vocabulary.
    pub request: c_int,
    pub pid: Pid,
    pub addr: u64,
    pub data: u64,
}

/// What a breakpoint handler tells the debugger library to do next.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BkptDisposition {
    /// Step the victim past the breakpoint and set it running again.
    Resume,
    /// Leave the victim stopped.
    Hold,
}

/// Breakpoint callback, invoked on the control thread from inside
/// wait-processing with the target's recursive lock held.
pub type BkptHandler = Arc<dyn Fn(u64) -> BkptDisposition + Send + Sync>;

/// Replacement for the library's internal wait path, so callback-time
/// waits re-enter through the marshalling channel.
pub type WaitProxy = Arc<dyn Fn(bool) -> Result<c_long, Errno> + Send + Sync>;

/// Replacement for the library's internal poke path.
pub type PokeProxy = Arc<dyn Fn(&PokeRequest) -> Result<c_long, Errno> + Send + Sync>;

/// Bracketing hook around the library's internal trace windows:
/// called with `true` when a window opens, `false` when it closes.
pub type LockHook = Arc<dyn Fn(bool) + Send + Sync>;

/// Runtime-linker event categories.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RtldEventKind {
    None,
    /// dlopen()/dlclose() activity on the link map.
    DlActivity,
}

/// Link-map state carried by an event.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RtldState {
    /// The link map is consistent; symbol tables may be trusted.
    Consistent,
    /// An object is being added.
    Add,
    /// An object is being deleted.
    Delete,
}

#[derive(Copy, Clone, Debug)]
pub struct RtldEvent {
    pub kind: RtldEventKind,
    pub state: RtldState,
}

pub type RtldEventFn = Arc<dyn Fn(&RtldEvent) + Send + Sync>;

/// The dynamic-linker database attached to one victim.
pub trait RtldDb: Send + Sync {
    /// Subscribe `cb` to link-map changes. Idempotent: re-registering an
    /// active subscription is a cheap no-op, which the controller relies
    /// on by re-calling this every wait cycle.
    fn enable_events(&self, cb: RtldEventFn) -> Result<(), Errno>;
}

/// Entry points of the debugger library itself.
pub trait Debugger: Send + Sync {
    /// Spawn `file` with `argv` under trace, halted at exec.
    fn create(&self, file: &str, argv: &[String]) -> Result<Arc<dyn PsHandle>, Errno>;
    /// Attach to a live pid, halting it.
    fn grab(&self, pid: Pid) -> Result<Arc<dyn PsHandle>, Errno>;
    /// Drop the handle; kill the victim if `kill`, detach otherwise.
    fn release(&self, handle: &Arc<dyn PsHandle>, kill: bool);
}

/// One victim process as seen by the debugger library.
///
/// All of `wait`, `poke` and `resume` are thread-bound: only the thread
/// that created or grabbed the victim may call them. The marshalling
/// layer in this crate enforces that; the proxies installed via
/// `install_wait_proxy`/`install_poke_proxy` are how the library's own
/// internals re-enter it.
pub trait PsHandle: Send + Sync {
    fn pid(&self) -> Pid;

    /// Process pending victim events, running breakpoint handlers as
    /// they are hit. With `block`, waits for an event first. Returns the
    /// number of events processed. Controller thread only.
    fn wait(&self, block: bool) -> Result<c_long, Errno>;

    /// Pass a raw poke through to the OS. Controller thread only.
    fn poke(&self, req: &PokeRequest) -> Result<c_long, Errno>;

    fn state(&self) -> ProcState;

    fn get_auxv(&self, key: AuxKey) -> Option<u64>;

    /// Resolve `name` across the victim's loaded objects, or within
    /// `module` when given.
    fn lookup_symbol(&self, module: Option<&str>, name: &str) -> Option<u64>;

    fn plant_breakpoint(&self, addr: u64, one_shot: bool, handler: BkptHandler)
        -> Result<(), Errno>;

    fn remove_breakpoint(&self, addr: u64);

    fn install_wait_proxy(&self, proxy: WaitProxy);

    fn install_poke_proxy(&self, proxy: PokeProxy);

    fn install_lock_hook(&self, hook: LockHook);

    /// Retirement probe: false once per-process descriptors are closed.
    fn has_fds(&self) -> bool;

    /// Retire: close per-process descriptors, keep the handle.
    fn close_fds(&self);

    /// Un-retire: reopen the descriptors closed by `close_fds`.
    fn reopen(&self) -> Result<(), Errno>;

    /// Refresh symbol tables after link-map activity.
    fn update_symbols(&self);

    /// The linker database, once the victim's link map exists. Static
    /// binaries return None until their first dynamic load.
    fn rtld_db(&self) -> Option<Arc<dyn RtldDb>>;

    /// Whether release() should leave the victim running on its own.
    fn set_detached(&self, detached: bool);

    /// Set the halted victim running. Controller thread only.
    fn resume(&self) -> Result<(), Errno>;

    /// Descriptor that becomes readable on victim state changes. The
    /// default reaches for the OS waitfd primitive.
    fn wait_fd(&self) -> Result<RawFd, Errno> {
        sys::waitfd(self.pid(), sys::WAITFD_EXITED | sys::WAITFD_STOPPED)
    }
}

impl std::fmt::Debug for dyn PsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PsHandle").field("pid", &self.pid()).finish()
    }
}

/// The probe catalogue above this crate: told to (re)create pending
/// probes whenever new modules appear in a victim.
pub trait ProbeLayer: Send + Sync {
    /// Returns the error message on failure; the failure is reported on
    /// the notification bus but never stops the victim's controller.
    fn create_pending_probes(&self, pid: Pid) -> Result<(), String>;
}
