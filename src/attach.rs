//! Attach-time rendezvous machinery: breakpoint planting for the
//! pre-init / post-init / main modes, the standard breakpoint handlers,
//! and the runtime-linker event subscription.

use crate::debugger::{
    AuxKey, BkptDisposition, BkptHandler, ProbeLayer, RtldEvent, RtldEventFn, RtldEventKind,
    RtldState,
};
use crate::registry::RegistryShared;
use crate::stop::{StopAt, StopFlags};
use crate::target::Target;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Everything a breakpoint or linker callback needs to find its way
/// back: weak so that callbacks parked inside a debugger handle never
/// keep the target or the registry alive.
#[derive(Clone)]
pub(crate) struct HandlerCtx {
    pub target: Weak<Target>,
    pub shared: Weak<RegistryShared>,
    pub probes: Option<Arc<dyn ProbeLayer>>,
}

impl HandlerCtx {
    fn mode(&self) -> Option<StopAt> {
        self.shared.upgrade().map(|s| s.mode())
    }
}

/// Possibly arrange to stop the victim, post-attachment, at the right
/// place. Called twice for breakpoint-driven modes: once before the
/// initial resume (in case the linker is already up, as in a static
/// binary), and once more from inside the entry-point breakpoint
/// handler.
///
/// Returns Err when no breakpoint could be planted, in which case the
/// rendezvous has been degraded (mode rewritten, substitute stop bit
/// raised) and the victim is still halted.
pub(crate) fn attach(ctx: &HandlerCtx, before_continue: bool) -> Result<(), ()> {
    let target = match ctx.target.upgrade() {
        Some(t) => t,
        None => return Ok(()),
    };
    subscribe_rtld(ctx, &target);

    let shared = match ctx.shared.upgrade() {
        Some(s) => s,
        None => return Ok(()),
    };
    let mode = shared.mode();

    // Exec- and attach-stops need no breakpoints; and a pre-init
    // breakpoint planted before the resume is all pre-init ever needs.
    match mode {
        StopAt::Create | StopAt::Grab => return Ok(()),
        StopAt::PreInit if !before_continue => return Ok(()),
        _ => {}
    }

    let handle = match target.handle() {
        Some(h) => h,
        None => return Ok(()),
    };

    let (addr, handler): (Option<u64>, BkptHandler) = if before_continue {
        // Pre-init, post-init and main all get a breakpoint on the
        // process entry point; post-init and main use the handler that
        // goes on to locate main().
        let h = match mode {
            StopAt::PostInit | StopAt::Main => drop_main_handler(ctx),
            _ => interesting_handler(ctx),
        };
        (handle.get_auxv(AuxKey::Entry), h)
    } else {
        // The linker is up: post-init and main now get a breakpoint on
        // main() itself.
        (
            handle.lookup_symbol(None, "main"),
            interesting_handler(ctx),
        )
    };

    if let Some(addr) = addr.filter(|a| *a != 0) {
        if handle.plant_breakpoint(addr, true, handler).is_ok() {
            debug!(
                pid = target.pid().as_raw(),
                addr, "attach breakpoint planted"
            );
            return Ok(());
        }
    }

    // Could not plant: degrade to the nearest rendezvous we can still
    // honour and remember the substitution registry-wide.
    let substitute = if before_continue {
        StopAt::Create
    } else {
        StopAt::PreInit
    };
    warn!(
        pid = target.pid().as_raw(),
        "cannot drop breakpoint in victim: acting as if stop-at={:?} were in force", substitute
    );
    target.lock.with(|s| {
        s.stop.remove(mode.flag());
        s.stop.insert(substitute.flag());
    });
    shared.set_mode(substitute);
    Err(())
}

/// One-shot breakpoint at an interesting locus: the victim has reached
/// the configured rendezvous point. Block for the owner's resume(),
/// then drop the breakpoint and let the victim run.
pub(crate) fn interesting_handler(ctx: &HandlerCtx) -> BkptHandler {
    let ctx = ctx.clone();
    Arc::new(move |addr| {
        let target = match ctx.target.upgrade() {
            Some(t) => t,
            None => return BkptDisposition::Resume,
        };
        debug!(
            pid = target.pid().as_raw(),
            addr, "breakpoint on interesting locus"
        );
        let why = ctx.mode().map(StopAt::flag).unwrap_or(StopFlags::PREINIT);
        target.stop(why);
        target.resume_handshake();
        if let Some(h) = target.handle() {
            h.remove_breakpoint(addr);
        }
        BkptDisposition::Resume
    })
}

/// One-shot breakpoint at the entry point, by which time the linker has
/// initialised far enough for reliable symbol lookups: drop the real
/// breakpoint on main(). If main() cannot be found the rendezvous has
/// been degraded to here, so rendezvous in place instead.
pub(crate) fn drop_main_handler(ctx: &HandlerCtx) -> BkptHandler {
    let ctx = ctx.clone();
    Arc::new(move |addr| {
        let target = match ctx.target.upgrade() {
            Some(t) => t,
            None => return BkptDisposition::Resume,
        };
        debug!(pid = target.pid().as_raw(), addr, "breakpoint at entry");
        let planted = attach(&ctx, false);
        if let Some(h) = target.handle() {
            h.remove_breakpoint(addr);
        }
        if planted.is_err() {
            debug!(
                pid = target.pid().as_raw(),
                "main() lookup failed, rendezvous here"
            );
            let why = ctx.mode().map(StopAt::flag).unwrap_or(StopFlags::PREINIT);
            target.stop(why);
            target.resume_handshake();
        }
        BkptDisposition::Resume
    })
}

/// Arrange to hear about changes to the victim's set of shared objects.
/// Re-run on every wait cycle: a statically linked victim only gains a
/// link map on its first dlopen(), and re-registering an active
/// subscription is a cheap no-op.
pub(crate) fn subscribe_rtld(ctx: &HandlerCtx, target: &Arc<Target>) {
    let handle = match target.handle() {
        Some(h) => h,
        None => return,
    };
    let db = match handle.rtld_db() {
        Some(db) => db,
        None => return,
    };
    let cb_ctx = ctx.clone();
    let cb: RtldEventFn = Arc::new(move |ev| rtld_event(&cb_ctx, ev));
    let _ = db.enable_events(cb);
}

/// Link-map event: on a consistent link map, refresh symbols and let the
/// probe layer materialise probes for newly loaded modules. A probe
/// failure is reported on the notification bus; the victim keeps going.
fn rtld_event(ctx: &HandlerCtx, ev: &RtldEvent) {
    let target = match ctx.target.upgrade() {
        Some(t) => t,
        None => return,
    };
    debug!(
        pid = target.pid().as_raw(),
        kind = ?ev.kind,
        state = ?ev.state,
        "rtld event"
    );
    match ev.kind {
        RtldEventKind::DlActivity if ev.state == RtldState::Consistent => {
            if let Some(h) = target.handle() {
                h.update_symbols();
            }
            if let Some(probes) = &ctx.probes {
                if let Err(msg) = probes.create_pending_probes(target.pid()) {
                    target.set_error(msg.clone());
                    if let Some(shared) = ctx.shared.upgrade() {
                        shared.notify(&target, Some(msg));
                    }
                }
            }
        }
        _ => {}
    }
}
