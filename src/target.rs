//! One record per victim process. Everything mutable lives behind the
//! target's recursive lock; pid and the reference count are atomics so
//! that reference holders can read them without taking it.

use crate::debugger::PsHandle;
use crate::lock::{LockCondvar, ProcLock};
use crate::marshal::ProxySlot;
use crate::stop::StopFlags;
use libc::c_long;
use nix::errno::Errno;
use nix::unistd::Pid;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::debug;

/// State guarded by the recursive lock.
pub(crate) struct TargetState {
    /// Debugger-library handle; filled in by the controller once the
    /// victim exists, cleared again by controller cleanup.
    pub handle: Option<Arc<dyn PsHandle>>,
    pub stop: StopFlags,
    /// Controller has exited (its cleanup has run).
    pub done: bool,
    /// Teardown requested; every controller blocking site observes this.
    pub quit: bool,
    pub ctl_tid: Option<ThreadId>,
    /// Last fatal or degraded-path error, also carried by notifications.
    pub errmsg: Option<String>,
    pub proxy: ProxySlot,
    /// Marshalling pipe, created before the controller is spawned.
    pub pipe_rd: Option<RawFd>,
    pub pipe_wr: Option<RawFd>,
    /// Victim state-change descriptor, owned by the controller.
    pub wait_fd: Option<RawFd>,
}

pub struct Target {
    pid: AtomicI32,
    created: bool,
    refs: AtomicUsize,
    /// Shadow of the handle's descriptor state, so retirement stays
    /// answerable after the controller has released the handle.
    retired: AtomicBool,
    pub(crate) lock: ProcLock<TargetState>,
    /// Rendezvous and lifecycle transitions (startup, stop, quit, done).
    pub(crate) rendezvous_cv: LockCondvar,
    /// Marshalled-request replies.
    pub(crate) reply_cv: LockCondvar,
}

impl Target {
    pub(crate) fn new(pid: Pid, created: bool) -> Target {
        Target {
            pid: AtomicI32::new(pid.as_raw()),
            created,
            refs: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            lock: ProcLock::new(TargetState {
                handle: None,
                stop: StopFlags::empty(),
                done: false,
                quit: false,
                ctl_tid: None,
                errmsg: None,
                proxy: ProxySlot::empty(),
                pipe_rd: None,
                pipe_wr: None,
                wait_fd: None,
            }),
            rendezvous_cv: LockCondvar::new(),
            reply_cv: LockCondvar::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.pid.load(Ordering::SeqCst))
    }

    pub(crate) fn set_pid(&self, pid: Pid) {
        self.pid.store(pid.as_raw(), Ordering::SeqCst);
    }

    /// True if we spawned the victim, false if we attached to it. Also
    /// decides whether release() kills or detaches.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn ref_inc(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn ref_dec(&self) -> usize {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "release of unreferenced target");
        prev - 1
    }

    /// Take the target's recursive lock.
    pub fn lock(&self) {
        self.lock.lock();
    }

    pub fn unlock(&self) {
        self.lock.unlock();
    }

    /// Controller has exited and released the victim.
    pub fn done(&self) -> bool {
        self.lock.with_raw(|s| s.done)
    }

    /// Retired: the debugger handle has closed its per-process
    /// descriptors. The handle's own probe is authoritative while it
    /// exists; afterwards the shadow flag answers.
    pub fn retired(&self) -> bool {
        self.lock.with_raw(|s| match &s.handle {
            Some(h) => !h.has_fds(),
            None => self.retired.load(Ordering::SeqCst),
        })
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock.with_raw(|s| s.errmsg.clone())
    }

    pub(crate) fn handle(&self) -> Option<Arc<dyn PsHandle>> {
        self.lock.with_raw(|s| s.handle.clone())
    }

    pub(crate) fn take_handle(&self) -> Option<Arc<dyn PsHandle>> {
        self.lock.with_raw(|s| s.handle.take())
    }

    /// Record an error for later pickup by create()/grab() or the
    /// notification bus.
    pub(crate) fn set_error(&self, msg: String) {
        tracing::error!(pid = self.pid().as_raw(), "{}", msg);
        self.lock.with_raw(|s| s.errmsg = Some(msg));
    }

    /// Close the debugger handle's per-process descriptors, bounding the
    /// kernel resources of a cached-but-unused target. The record and
    /// its controller stay; the victim runs freely.
    pub(crate) fn retire(&self) {
        debug!(pid = self.pid().as_raw(), "retiring");
        self.retired.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle() {
            h.close_fds();
        }
    }

    /// The cached record is being grabbed again: reopen the handle's
    /// descriptors and clear the shadow flag.
    pub(crate) fn unretire(&self) -> Result<(), Errno> {
        self.retired.store(false, Ordering::SeqCst);
        match self.handle() {
            Some(h) => h.reopen(),
            None => Err(Errno::ESRCH),
        }
    }

    /// Controller side of a rendezvous. If `why` is present in the stop
    /// mask: raise IDLE, clear `why`, wake the client, and sleep until
    /// the client's resume() clears IDLE; then mark the resume sequence
    /// in progress. If `why` is not pending this returns immediately.
    ///
    /// Lock held on entry and exit; the depth is parked during the wait.
    pub(crate) fn stop(&self, why: StopFlags) {
        debug_assert!(!why.contains(StopFlags::IDLE));
        let pending = self.lock.with(|s| {
            if s.stop.intersects(why) {
                s.stop.insert(StopFlags::IDLE);
                s.stop.remove(why);
                true
            } else {
                false
            }
        });
        if !pending {
            return;
        }
        self.rendezvous_cv.broadcast();
        self.lock.wait_while(&self.rendezvous_cv, |s| {
            s.stop.contains(StopFlags::IDLE) && !s.quit
        });
        self.lock.with(|s| s.stop.insert(StopFlags::RESUMING));
        debug!(
            pid = self.pid().as_raw(),
            "rendezvous released, controller waiting to resume"
        );
    }

    /// Second phase of the continue handshake: after the controller has
    /// finished every serial post-rendezvous step (detach marking,
    /// setting the victim running), let the client's resume() return.
    pub(crate) fn resume_handshake(&self) {
        let resumed = self.lock.with(|s| {
            if s.stop.contains(StopFlags::RESUMING) {
                s.stop.remove(StopFlags::RESUMING);
                s.stop.insert(StopFlags::RESUMED);
                true
            } else {
                false
            }
        });
        if resumed {
            debug!(pid = self.pid().as_raw(), "resume handshake complete");
            self.rendezvous_cv.broadcast();
        }
    }

    /// Teardown poke, issued from destroy() without entering the
    /// target's locking protocol (the lock may be held, at any depth, by
    /// the very client being torn down). Sets quit, unblocks a pending
    /// rendezvous, wakes every sleeper, and taps the marshalling pipe so
    /// the controller's poll returns. Returns whether a live controller
    /// was poked.
    pub(crate) fn begin_quit(&self) -> bool {
        let (live, wr) = self.lock.with_raw(|s| {
            s.quit = true;
            if s.stop.contains(StopFlags::IDLE) {
                s.stop.remove(StopFlags::IDLE);
            }
            (s.ctl_tid.is_some() && !s.done, s.pipe_wr)
        });
        self.rendezvous_cv.broadcast();
        self.reply_cv.broadcast();
        if live {
            if let Some(fd) = wr {
                // Best-effort wake-up; the quit flag is authoritative.
                while let Err(e) = nix::unistd::write(fd, b"q") {
                    if e.as_errno() != Some(Errno::EINTR) {
                        break;
                    }
                }
            }
        }
        live
    }

    /// Teardown wait for controller exit, outside the locking protocol.
    pub(crate) fn wait_done(&self) {
        self.lock.wait_while_raw(&self.rendezvous_cv, |s| !s.done);
    }

    /// Store a marshalled result and wake the requesting client.
    pub(crate) fn complete_proxy(&self, res: Result<c_long, Errno>) {
        self.lock.with(|s| {
            match res {
                Ok(v) => {
                    s.proxy.ret = v;
                    s.proxy.err = 0;
                }
                Err(e) => {
                    s.proxy.ret = -1;
                    s.proxy.err = e as i32;
                }
            }
            s.proxy.rq = None;
        });
        self.reply_cv.signal();
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("pid", &self.pid())
            .field("created", &self.created)
            .field("refs", &self.refs())
            .finish()
    }
}
