//! The per-victim control thread.
//!
//! Whichever thread creates or grabs a victim is the only thread the OS
//! will ever let stop, wait on, or poke it, so each target gets one
//! dedicated thread that does all of that: it brings the victim up,
//! holds the initial rendezvous, then sits in a poll over the victim's
//! wait descriptor and the marshalling pipe, servicing both until the
//! victim dies or the registry tears the target down.

use crate::attach::{attach, subscribe_rtld, HandlerCtx};
use crate::debugger::{Debugger, ProbeLayer, ProcState};
use crate::error::ProcError;
use crate::registry::RegistryShared;
use crate::stop::StopFlags;
use crate::target::Target;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, warn};

/// Everything the control thread needs, handed over at spawn.
pub(crate) struct ControlCtx {
    pub target: Arc<Target>,
    pub shared: Weak<RegistryShared>,
    pub debugger: Arc<dyn Debugger>,
    pub probes: Option<Arc<dyn ProbeLayer>>,
    /// Executable and argv, only meaningful for created victims.
    pub file: Option<String>,
    pub argv: Vec<String>,
}

impl ControlCtx {
    fn handler_ctx(&self) -> HandlerCtx {
        HandlerCtx {
            target: Arc::downgrade(&self.target),
            shared: self.shared.clone(),
            probes: self.probes.clone(),
        }
    }
}

enum ExitReason {
    /// The victim could never be brought up; the spawning client reads
    /// the error buffer.
    Failed,
    /// destroy() asked us to go.
    Quit,
    VictimDied,
}

/// Seed the stop mask, open the marshalling pipe, start the control
/// thread, and block until it either reaches the first rendezvous or
/// reports failure through the done flag.
pub(crate) fn spawn_controller(ctx: ControlCtx, seed: StopFlags) -> Result<(), ProcError> {
    let target = ctx.target.clone();
    target.lock();
    target.lock.with(|s| s.stop.insert(seed));

    let (rd, wr) = match nix::unistd::pipe() {
        Ok(p) => p,
        Err(e) => {
            target.unlock();
            return Err(ProcError::Pipe(e.as_errno().unwrap_or(Errno::EIO)));
        }
    };
    target.lock.with(|s| {
        s.pipe_rd = Some(rd);
        s.pipe_wr = Some(wr);
    });

    let name = format!("proctl-ctl-{}", target.pid().as_raw());
    if let Err(e) = thread::Builder::new()
        .name(name)
        .spawn(move || control_thread(ctx))
    {
        target.lock.with(|s| {
            s.pipe_rd.take();
            s.pipe_wr.take();
        });
        let _ = nix::unistd::close(rd);
        let _ = nix::unistd::close(wr);
        target.unlock();
        return Err(ProcError::Thread(e));
    }

    // Wait for either done (the victim died or the controller failed)
    // or IDLE (the victim is halted at the rendezvous event). On
    // success the caller gets the process and controller stopped, and
    // applies resume() to set both going.
    target
        .lock
        .wait_while(&target.rendezvous_cv, |s| {
            !s.done && !s.stop.contains(StopFlags::IDLE)
        });
    let failed = target.lock.with(|s| s.done);
    target.unlock();

    if failed {
        let msg = target
            .last_error()
            .unwrap_or_else(|| "control thread exited before rendezvous".to_string());
        Err(ProcError::NoSuchProcess(msg))
    } else {
        Ok(())
    }
}

fn control_thread(ctx: ControlCtx) {
    // Only SIGABRT may interrupt the control thread.
    let mut mask = SigSet::all();
    mask.remove(Signal::SIGABRT);
    let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&mask), None);

    let reason = control_loop(&ctx);

    // If a client is still parked in resume(), let it out before the
    // record goes quiet.
    if !matches!(reason, ExitReason::Failed) {
        ctx.target.resume_handshake();
    }

    let was_retired = cleanup(&ctx);

    if matches!(reason, ExitReason::VictimDied) {
        reap(&ctx, was_retired);
    }
}

/// Body of the control thread, run with the recursive lock held except
/// while blocking in poll. Returns with the lock held at whatever depth
/// the exit path left it; cleanup flattens that.
fn control_loop(ctx: &ControlCtx) -> ExitReason {
    let target = &ctx.target;
    let hctx = ctx.handler_ctx();

    target.lock();
    target.lock.with(|s| s.ctl_tid = Some(thread::current().id()));

    // Either create the victim, or grab it. Whichever, on failure quit
    // and let cleanup signal the client waiting in spawn_controller().
    let handle = if target.created() {
        let file = ctx.file.as_deref().unwrap_or_default();
        match ctx.debugger.create(file, &ctx.argv) {
            Ok(h) => {
                target.set_pid(h.pid());
                h
            }
            Err(e) => {
                target.set_error(format!("failed to execute {}: {}", file, e.desc()));
                return ExitReason::Failed;
            }
        }
    } else {
        match ctx.debugger.grab(target.pid()) {
            Ok(h) => h,
            Err(e) => {
                target.set_error(format!(
                    "failed to grab pid {}: {}",
                    target.pid().as_raw(),
                    e.desc()
                ));
                return ExitReason::Failed;
            }
        }
    };
    target.lock.with(|s| s.handle = Some(handle.clone()));

    // Route the library's own callback-time debug operations back
    // through the marshalling channel.
    target.install_proxies(&handle);

    let wait_fd = match handle.wait_fd() {
        Ok(fd) => fd,
        Err(e) => {
            target.set_error(format!(
                "failed to get waitfd for pid {}: {}",
                target.pid().as_raw(),
                e.desc()
            ));
            return ExitReason::Failed;
        }
    };
    target.lock.with(|s| s.wait_fd = Some(wait_fd));
    let pipe_rd = match target.lock.with(|s| s.pipe_rd) {
        Some(fd) => fd,
        None => return ExitReason::Failed,
    };

    // Plant whatever breakpoints the configured rendezvous needs, while
    // the victim is still halted from creation or attach.
    let _ = attach(&hctx, true);

    // First rendezvous. This covers exec-stops and grabs; the
    // breakpoint-driven modes rendezvous from their handlers, invoked
    // from wait-processing below.
    target.stop(if target.created() {
        StopFlags::CREATE
    } else {
        StopFlags::GRAB
    });
    if quitting(target) {
        return ExitReason::Quit;
    }

    // Set the victim going and let the client out of resume().
    handle.set_detached(target.created());
    if let Err(e) = handle.resume() {
        warn!(
            pid = target.pid().as_raw(),
            "could not resume victim: {}",
            e.desc()
        );
    }
    target.resume_handshake();

    // Sleep with the lock released so the rest of the library can send
    // requests, which is what the lock protects.
    loop {
        target.unlock();
        let (wait_ready, pipe_ready) = wait_readable(wait_fd, pipe_rd);
        target.lock();

        if quitting(target) {
            return ExitReason::Quit;
        }

        // Marshalled request first. One of the possible requests is
        // itself a wait, and the client often unblocks only once that
        // wait has returned; draining the wait descriptor first would
        // let the client observe stale state.
        if pipe_ready {
            let mut byte = [0u8; 1];
            let _ = nix::unistd::read(pipe_rd, &mut byte);
            if quitting(target) {
                return ExitReason::Quit;
            }
            target.service_proxy();
        }

        if wait_ready {
            debug!(pid = target.pid().as_raw(), "victim state change");
            let _ = handle.wait(false);

            // The linker database can take arbitrarily long to come up;
            // keep asking until it does.
            subscribe_rtld(&hctx, target);

            match handle.state() {
                ProcState::Stop => {
                    // Stopped on a traced event: the handlers have run;
                    // nothing more at this layer.
                }
                ProcState::TraceStop => {
                    // Some other debugger owns the victim's trace stop.
                    warn!(
                        pid = target.pid().as_raw(),
                        "victim trace-stopped by another tracer, nothing we can do"
                    );
                }
                ProcState::Dead => {
                    debug!(pid = target.pid().as_raw(), "victim died");
                    return ExitReason::VictimDied;
                }
                ProcState::Run => {}
            }
        }
    }
}

fn quitting(target: &Target) -> bool {
    target.lock.with(|s| s.quit)
}

/// Poll the two descriptors indefinitely, restarting on EINTR.
fn wait_readable(wait_fd: RawFd, pipe_rd: RawFd) -> (bool, bool) {
    let mut fds = [
        PollFd::new(wait_fd, PollFlags::POLLIN),
        PollFd::new(pipe_rd, PollFlags::POLLIN),
    ];
    loop {
        match poll(&mut fds, -1) {
            Ok(_) => break,
            Err(e) if e.as_errno() == Some(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
    let ready = |pfd: &PollFd| {
        pfd.revents()
            .map(|r| !(r & (PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)).is_empty())
            .unwrap_or(false)
    };
    (ready(&fds[0]), ready(&fds[1]))
}

/// Controller teardown, idempotent with respect to lock state: reassert
/// ownership whatever the exit path left behind, fail any parked
/// marshalled request, hand the victim back to the debugger library,
/// close our descriptors, and let every waiter know we are done.
/// Returns whether the target was retired at the time of death, which
/// decides the non-retired-count fixup in reap().
fn cleanup(ctx: &ControlCtx) -> bool {
    let target = &ctx.target;
    target.lock.force_owner();

    target.fail_pending_proxy();
    let was_retired = target.retired();

    if let Some(h) = target.lock.with(|s| s.handle.take()) {
        ctx.debugger.release(&h, target.created());
    }

    // The thread may be quitting before some of these were ever set.
    let (wfd, prd, pwr) = target
        .lock
        .with(|s| (s.wait_fd.take(), s.pipe_rd.take(), s.pipe_wr.take()));
    for fd in [wfd, prd, pwr].iter().flatten() {
        let _ = nix::unistd::close(*fd);
    }

    target.lock.with(|s| {
        s.done = true;
        s.ctl_tid = None;
    });
    target.rendezvous_cv.broadcast();

    // Completely release the lock, no matter what its depth.
    target.lock.force_release();
    was_retired
}

/// Natural-death epilogue: put the record on the notification bus and
/// take it out of the registry. Serialised against explicit teardown by
/// the destroy mutex; if teardown got there first it owns the unlink.
fn reap(ctx: &ControlCtx, was_retired: bool) {
    let shared = match ctx.shared.upgrade() {
        Some(s) => s,
        None => return,
    };
    let _guard = shared.destroy_lock.lock();
    if ctx.target.lock.with_raw(|s| s.quit) {
        return;
    }
    shared.notify(&ctx.target, None);
    shared.unlink(&ctx.target, was_retired);
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
