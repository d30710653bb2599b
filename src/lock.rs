//! Reentrant per-target lock with explicit holder and depth tracking.
//!
//! Breakpoint handlers run on the control thread from inside debugger
//! wait-processing, and may themselves issue proxied debugger calls
//! that re-enter the same thread; the lock therefore has to nest. It is
//! layered over a plain mutex: the logical lock is the (holder, depth)
//! pair, and the underlying mutex is only ever held for the duration of
//! a single state access or condition wait.

use crate::flags;
use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};

struct LockInner<T> {
    holder: Option<ThreadId>,
    depth: u32,
    data: T,
}

/// The guarded state plus the logical-lock bookkeeping.
pub struct ProcLock<T> {
    inner: Mutex<LockInner<T>>,
    /// Threads queueing for the logical lock.
    turnstile: Condvar,
}

/// A condition variable usable with [`ProcLock::wait_while`]. One lock
/// may pair with several of these (the target keeps one for rendezvous
/// and one for marshalling replies).
pub struct LockCondvar {
    cv: Condvar,
}

impl LockCondvar {
    pub fn new() -> LockCondvar {
        LockCondvar { cv: Condvar::new() }
    }

    pub fn broadcast(&self) {
        self.cv.notify_all();
    }

    pub fn signal(&self) {
        self.cv.notify_one();
    }
}

impl Default for LockCondvar {
    fn default() -> LockCondvar {
        LockCondvar::new()
    }
}

impl<T> ProcLock<T> {
    pub fn new(data: T) -> ProcLock<T> {
        ProcLock {
            inner: Mutex::new(LockInner {
                holder: None,
                depth: 0,
                data,
            }),
            turnstile: Condvar::new(),
        }
    }

    /// Take the logical lock, blocking while another thread holds it.
    /// Re-entry by the current holder only deepens the nesting.
    pub fn lock(&self) {
        let me = thread::current().id();
        let mut g = self.inner.lock();
        if g.holder == Some(me) {
            g.depth += 1;
            return;
        }
        while g.holder.is_some() {
            self.turnstile.wait(&mut g);
        }
        g.holder = Some(me);
        g.depth = 1;
    }

    /// Drop one level of nesting; the logical lock is released only when
    /// the depth reaches zero. Calling this without holding the lock is
    /// a lock violation.
    pub fn unlock(&self) {
        let me = thread::current().id();
        let mut g = self.inner.lock();
        assert!(
            g.holder == Some(me) && g.depth > 0,
            "lock violation: unlock by non-owner"
        );
        g.depth -= 1;
        if g.depth == 0 {
            g.holder = None;
            self.turnstile.notify_all();
        }
    }

    /// True when the calling thread is the current holder.
    pub fn held(&self) -> bool {
        self.inner.lock().holder == Some(thread::current().id())
    }

    /// Current nesting depth (0 when free).
    pub fn depth(&self) -> u32 {
        self.inner.lock().depth
    }

    /// Access the guarded state. The caller must hold the logical lock;
    /// under `PROCTL_DEBUG=mutexes` that is verified on every access.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.inner.lock();
        if flags::debug_mutexes() {
            assert!(
                g.holder == Some(thread::current().id()),
                "lock violation: state access without lock held"
            );
        }
        f(&mut g.data)
    }

    /// Access the guarded state without an ownership check. Reserved for
    /// teardown and diagnostics, where the caller is deliberately
    /// stepping around the locking protocol.
    pub fn with_raw<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.inner.lock();
        f(&mut g.data)
    }

    /// Block on `cv` until `pred` is false.
    ///
    /// The caller must hold the logical lock. Its depth is saved and
    /// zeroed for the duration of the wait (the underlying mutex can
    /// only be released once), and holder+depth are restored before
    /// returning, after the logical lock has become free again.
    pub fn wait_while(&self, cv: &LockCondvar, mut pred: impl FnMut(&mut T) -> bool) {
        let me = thread::current().id();
        let mut g = self.inner.lock();
        assert!(
            g.holder == Some(me),
            "lock violation: condition wait without lock held"
        );
        let saved = g.depth;
        g.holder = None;
        g.depth = 0;
        self.turnstile.notify_all();

        loop {
            if pred(&mut g.data) {
                cv.cv.wait(&mut g);
            } else if g.holder.is_some() {
                // Condition satisfied but another thread slipped into
                // the logical lock; queue for it before restoring.
                self.turnstile.wait(&mut g);
            } else {
                break;
            }
        }
        g.holder = Some(me);
        g.depth = saved;
    }

    /// Block on `cv` until `pred` is false, without touching the logical
    /// lock. Teardown only: the waiter is outside the target's locking
    /// protocol and must not be granted ownership.
    pub fn wait_while_raw(&self, cv: &LockCondvar, mut pred: impl FnMut(&mut T) -> bool) {
        let mut g = self.inner.lock();
        while pred(&mut g.data) {
            cv.cv.wait(&mut g);
        }
    }

    /// Cleanup-path entry: make the calling thread the holder at depth 1
    /// no matter what the prior state was. If another thread holds the
    /// logical lock, waits for it; if the caller already holds it at any
    /// depth, flattens the nesting (the whole thread is going away, so
    /// nested frames above us no longer matter).
    pub fn force_owner(&self) {
        let me = thread::current().id();
        let mut g = self.inner.lock();
        if g.holder != Some(me) {
            while g.holder.is_some() {
                self.turnstile.wait(&mut g);
            }
            g.holder = Some(me);
        }
        g.depth = 1;
    }

    /// Cleanup-path exit: completely release the logical lock, whatever
    /// its depth. Idempotent.
    pub fn force_release(&self) {
        let mut g = self.inner.lock();
        g.holder = None;
        g.depth = 0;
        self.turnstile.notify_all();
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
