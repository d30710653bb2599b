//! Cross-thread marshalling of the two thread-bound debug primitives.
//!
//! The OS tracing primitive only answers to the thread that attached,
//! but the library's public surface is called from arbitrary threads, so
//! every wait and poke from a foreign thread is parked in the target's
//! one-slot request channel and executed by the control thread. Both
//! sides run under the target's recursive lock, which is what makes a
//! primitive's effects visible to the client before its wake-up.

use crate::debugger::{PokeRequest, PsHandle};
use crate::target::Target;
use libc::c_long;
use nix::errno::Errno;
use std::sync::Arc;
use std::thread;
use tracing::debug;

/// The marshalled call, parked in the slot until the controller empties
/// it.
#[derive(Clone, Debug)]
pub(crate) enum ProxyRequest {
    Wait { block: bool },
    Poke(PokeRequest),
}

/// One-slot request channel state. At most one request is ever in
/// flight per target; the requesting client owns the slot until the
/// reply condition variable hands it back.
pub(crate) struct ProxySlot {
    pub rq: Option<ProxyRequest>,
    pub ret: c_long,
    pub err: i32,
}

impl ProxySlot {
    pub fn empty() -> ProxySlot {
        ProxySlot {
            rq: None,
            ret: 0,
            err: 0,
        }
    }
}

impl Target {
    /// Proxy for the debugger library's wait primitive.
    pub(crate) fn proxy_wait(self: &Arc<Target>, block: bool) -> Result<c_long, Errno> {
        self.marshal(ProxyRequest::Wait { block })
    }

    /// Proxy for the debugger library's poke primitive.
    pub(crate) fn proxy_poke(self: &Arc<Target>, req: &PokeRequest) -> Result<c_long, Errno> {
        self.marshal(ProxyRequest::Poke(req.clone()))
    }

    fn marshal(self: &Arc<Target>, rq: ProxyRequest) -> Result<c_long, Errno> {
        self.lock();
        let res = self.marshal_locked(rq);
        self.unlock();
        res
    }

    fn marshal_locked(self: &Arc<Target>, rq: ProxyRequest) -> Result<c_long, Errno> {
        let me = thread::current().id();
        let (inline, handle) = self
            .lock
            .with(|s| (s.ctl_tid == Some(me), s.handle.clone()));

        // Already on the control thread (a breakpoint handler calling
        // back into the debugger library): execute directly.
        if inline {
            let handle = handle.ok_or(Errno::ESRCH)?;
            return execute(&*handle, &rq);
        }

        // Park the request and tap the pipe. The slot must be empty:
        // the lock serialises clients, and the controller empties it
        // before signalling the reply.
        let wr = self.lock.with(|s| {
            debug_assert!(s.proxy.rq.is_none(), "marshalling slot already occupied");
            s.proxy.rq = Some(rq);
            s.pipe_wr
        });
        let wr = match wr {
            Some(fd) => fd,
            None => {
                self.lock.with(|s| s.proxy.rq = None);
                return Err(Errno::ESRCH);
            }
        };
        loop {
            match nix::unistd::write(wr, b"m") {
                Ok(_) => break,
                Err(e) if e.as_errno() == Some(Errno::EINTR) => continue,
                Err(e) => {
                    let errno = e.as_errno().unwrap_or(Errno::EIO);
                    self.set_error(format!(
                        "cannot write to marshalling pipe, deadlock is certain: {}",
                        errno.desc()
                    ));
                    self.lock.with(|s| s.proxy.rq = None);
                    return Err(errno);
                }
            }
        }

        debug!(pid = self.pid().as_raw(), "marshalled request parked");
        self.lock.wait_while(&self.reply_cv, |s| s.proxy.rq.is_some());

        let (ret, err) = self.lock.with(|s| (s.proxy.ret, s.proxy.err));
        if ret < 0 && err != 0 {
            Err(Errno::from_i32(err))
        } else {
            Ok(ret)
        }
    }

    /// Controller side: empty the slot, run the primitive, reply. Called
    /// with the recursive lock held after draining one pipe byte.
    pub(crate) fn service_proxy(self: &Arc<Target>) {
        let rq = self.lock.with(|s| s.proxy.rq.clone());
        let rq = match rq {
            Some(rq) => rq,
            // A bare wake-up byte (teardown tap, or a client that bailed
            // after a failed pipe write).
            None => return,
        };
        debug!(pid = self.pid().as_raw(), ?rq, "servicing marshalled request");
        let res = match self.handle() {
            Some(h) => execute(&*h, &rq),
            None => Err(Errno::ESRCH),
        };
        self.complete_proxy(res);
    }

    /// Cleanup path: a client may be parked on the reply condvar while
    /// the controller exits; fail its request rather than strand it.
    pub(crate) fn fail_pending_proxy(&self) {
        let pending = self.lock.with(|s| s.proxy.rq.is_some());
        if pending {
            self.complete_proxy(Err(Errno::ESRCH));
        }
    }

    /// Install the wait/poke proxies and the trace-window lock hook on a
    /// freshly created handle, so that every callback-time debug
    /// operation re-enters through the channel (or runs inline when the
    /// callback is already on the control thread).
    pub(crate) fn install_proxies(self: &Arc<Target>, handle: &Arc<dyn PsHandle>) {
        let t = Arc::downgrade(self);
        handle.install_wait_proxy(Arc::new(move |block| match t.upgrade() {
            Some(t) => t.proxy_wait(block),
            None => Err(Errno::ESRCH),
        }));
        let t = Arc::downgrade(self);
        handle.install_poke_proxy(Arc::new(move |req| match t.upgrade() {
            Some(t) => t.proxy_poke(req),
            None => Err(Errno::ESRCH),
        }));
        let t = Arc::downgrade(self);
        handle.install_lock_hook(Arc::new(move |tracing_window| {
            if let Some(t) = t.upgrade() {
                if tracing_window {
                    t.lock();
                } else {
                    t.unlock();
                }
            }
        }));
    }
}

/// Run a primitive directly against the handle. Control thread only;
/// both the inline path and the slot-service path end up here.
fn execute(handle: &dyn PsHandle, rq: &ProxyRequest) -> Result<c_long, Errno> {
    match rq {
        ProxyRequest::Wait { block } => handle.wait(*block),
        ProxyRequest::Poke(req) => handle.poke(req),
    }
}
