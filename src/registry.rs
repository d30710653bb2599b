//! The target registry: a pid-keyed cache of every victim under
//! control, kept in LRU order so that handles nobody is using can be
//! retired (their descriptors closed) once the cache outgrows its cap,
//! plus the notification bus that tells clients about victim deaths and
//! asynchronous errors.

use crate::config::Config;
use crate::controller::{spawn_controller, ControlCtx};
use crate::debugger::{Debugger, ProbeLayer, PsHandle};
use crate::error::ProcError;
use crate::stop::{ProcFlags, StopAt, StopFlags};
use crate::target::Target;
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// A victim died, or something went wrong asynchronously (for instance
/// probe creation on a dlopen). Drained by clients via
/// [`Registry::drain_notifications`] / [`Registry::wait_notification`].
pub struct Notification {
    pub target: Arc<Target>,
    pub errmsg: Option<String>,
}

pub(crate) struct RegistryInner {
    /// Chained pid hash.
    buckets: Vec<Vec<Arc<Target>>>,
    /// Most recently used at the front.
    lru: VecDeque<Arc<Target>>,
    /// Live targets that have not been retired.
    lru_cnt: usize,
    lru_lim: usize,
    notify: VecDeque<Notification>,
    /// The rendezvous mode; attach-time degradation rewrites it.
    mode: StopAt,
}

impl RegistryInner {
    fn bucket(&self, pid: Pid) -> usize {
        pid.as_raw() as usize % self.buckets.len()
    }

    fn find(&self, pid: Pid) -> Option<Arc<Target>> {
        let b = self.bucket(pid);
        self.buckets[b].iter().find(|t| t.pid() == pid).cloned()
    }

    fn insert(&mut self, target: Arc<Target>) {
        let b = self.bucket(target.pid());
        self.buckets[b].push(target.clone());
        self.lru.push_front(target);
    }

    fn remove_hash(&mut self, pid: Pid) {
        let b = self.bucket(pid);
        self.buckets[b].retain(|t| t.pid() != pid);
    }

    fn remove_lru(&mut self, target: &Arc<Target>) -> bool {
        match self.lru.iter().position(|t| Arc::ptr_eq(t, target)) {
            Some(i) => {
                self.lru.remove(i);
                true
            }
            None => false,
        }
    }

    /// Move to the front of the LRU order.
    fn touch(&mut self, target: &Arc<Target>) {
        if self.remove_lru(target) {
            self.lru.push_front(target.clone());
        }
    }
}

/// State shared with control threads, which outlive any single registry
/// operation and hold this weakly.
pub(crate) struct RegistryShared {
    pub inner: Mutex<RegistryInner>,
    /// Broadcast on every notification enqueue.
    pub notify_cv: Condvar,
    /// Serialises explicit teardown against controller self-removal on
    /// victim death.
    pub destroy_lock: Mutex<()>,
}

impl RegistryShared {
    pub fn mode(&self) -> StopAt {
        self.inner.lock().mode
    }

    pub fn set_mode(&self, mode: StopAt) {
        self.inner.lock().mode = mode;
    }

    pub fn notify(&self, target: &Arc<Target>, errmsg: Option<String>) {
        let mut inner = self.inner.lock();
        inner.notify.push_back(Notification {
            target: target.clone(),
            errmsg,
        });
        self.notify_cv.notify_all();
    }

    /// Take a dead target out of the hash and LRU. `was_retired` is its
    /// retirement state at death, which decides whether it still counts
    /// against the non-retired total.
    pub fn unlink(&self, target: &Arc<Target>, was_retired: bool) {
        let mut inner = self.inner.lock();
        inner.remove_hash(target.pid());
        if inner.remove_lru(target) && !was_retired {
            inner.lru_cnt = inner.lru_cnt.saturating_sub(1);
        }
    }
}

/// The process-handle cache. One per tracing session; all operations
/// are client-side (control threads only re-enter through the shared
/// state above).
pub struct Registry {
    shared: Arc<RegistryShared>,
    debugger: Arc<dyn Debugger>,
    probes: Option<Arc<dyn ProbeLayer>>,
}

impl Registry {
    pub fn new(
        config: Config,
        debugger: Arc<dyn Debugger>,
        probes: Option<Arc<dyn ProbeLayer>>,
    ) -> Registry {
        let buckets = config.pid_buckets.max(1);
        Registry {
            shared: Arc::new(RegistryShared {
                inner: Mutex::new(RegistryInner {
                    buckets: vec![Vec::new(); buckets],
                    lru: VecDeque::new(),
                    lru_cnt: 0,
                    lru_lim: config.cache_cap,
                    notify: VecDeque::new(),
                    mode: config.stop_at,
                }),
                notify_cv: Condvar::new(),
                destroy_lock: Mutex::new(()),
            }),
            debugger,
            probes,
        }
    }

    fn control_ctx(&self, target: Arc<Target>, file: Option<String>, argv: Vec<String>) -> ControlCtx {
        ControlCtx {
            target,
            shared: Arc::downgrade(&self.shared),
            debugger: self.debugger.clone(),
            probes: self.probes.clone(),
            file,
            argv,
        }
    }

    /// Spawn `file` under trace and take control of it. The call blocks
    /// until the victim is halted at the first rendezvous (where it
    /// stays until [`Registry::resume`], unless `WAIT_AT_RENDEZVOUS`
    /// resumes it here and now).
    pub fn create(
        &self,
        file: &str,
        argv: &[String],
        flags: ProcFlags,
    ) -> Result<Arc<dyn PsHandle>, ProcError> {
        let mode = self.shared.mode();
        let target = Arc::new(Target::new(Pid::from_raw(0), true));
        let ctx = self.control_ctx(target.clone(), Some(file.to_string()), argv.to_vec());
        spawn_controller(ctx, mode.flag())?;

        let handle = target.handle().ok_or_else(|| {
            ProcError::NoSuchProcess(target.last_error().unwrap_or_default())
        })?;

        {
            let mut inner = self.shared.inner.lock();
            inner.lru_cnt += 1;
            inner.insert(target.clone());
        }
        target.ref_inc();
        debug!(pid = target.pid().as_raw(), "created");

        if flags.contains(ProcFlags::WAIT_AT_RENDEZVOUS) {
            self.resume_target(&target);
        }
        Ok(handle)
    }

    /// Take control of a live pid. A cached target just gains a
    /// reference (coming out of retirement if need be) and keeps its
    /// identity; otherwise a controller is spawned and the caller blocks
    /// until the attach rendezvous.
    pub fn grab(&self, pid: Pid, flags: ProcFlags) -> Result<Arc<dyn PsHandle>, ProcError> {
        // Already grabbed or created? Boost it to the front and bring it
        // out of retirement aggressively, so the non-retired count and
        // the retirement probe cannot drift apart.
        let cached = {
            let mut inner = self.shared.inner.lock();
            match inner.find(pid) {
                Some(t) => {
                    debug!(pid = pid.as_raw(), "grabbed (cached)");
                    inner.touch(&t);
                    t.ref_inc();
                    if t.retired() {
                        let _ = t.unretire();
                        inner.lru_cnt += 1;
                    }
                    Some(t.handle())
                }
                None => None,
            }
        };
        if let Some(handle) = cached {
            return handle
                .ok_or_else(|| ProcError::NoSuchProcess("target has no handle".to_string()));
        }

        let target = Arc::new(Target::new(pid, false));
        let ctx = self.control_ctx(target.clone(), None, Vec::new());
        spawn_controller(ctx, StopFlags::GRAB)?;

        let handle = target.handle().ok_or_else(|| {
            ProcError::NoSuchProcess(target.last_error().unwrap_or_default())
        })?;

        {
            let mut inner = self.shared.inner.lock();
            inner.lru_cnt += 1;
            inner.insert(target.clone());

            // Over the cap: retire the least-recently-used target that
            // nobody references. That keeps the record (we may yet have
            // to halt it again) but closes its descriptors. The handle
            // being grabbed is safe: its reference count is boosted
            // below only after the scan, but it sits at the LRU front
            // and the scan runs tail-first, never reaching a fresher
            // entry before an older candidate.
            if inner.lru_cnt > inner.lru_lim {
                let victim = inner
                    .lru
                    .iter()
                    .rev()
                    .find(|t| t.refs() == 0 && !t.retired() && !Arc::ptr_eq(t, &target))
                    .cloned();
                if let Some(old) = victim {
                    old.retire();
                    inner.lru_cnt -= 1;
                }
            }
        }
        target.ref_inc();
        debug!(pid = pid.as_raw(), "grabbed");

        if flags.contains(ProcFlags::WAIT_AT_RENDEZVOUS) {
            self.resume_target(&target);
        }
        Ok(handle)
    }

    /// Drop one reference. An unreferenced target is retired once the
    /// cache is at or over its cap.
    pub fn release(&self, handle: &dyn PsHandle) {
        let target = match self.lookup(handle) {
            Some(t) => t,
            None => return,
        };
        if target.ref_dec() == 0 {
            let mut inner = self.shared.inner.lock();
            if inner.lru_cnt >= inner.lru_lim && !target.retired() && target.handle().is_some() {
                target.retire();
                inner.lru_cnt -= 1;
            }
        }
    }

    /// Release the victim from its rendezvous and wait for the
    /// controller to finish setting it running.
    ///
    /// A resume has two phases: clearing IDLE wakes the control thread,
    /// and only its RESUMED broadcast lets us return. Returning as soon
    /// as IDLE cleared would let this thread take the lock back and
    /// issue debug operations before the controller finished its resume
    /// sequence, leaving an unbalanced trace window and the victim
    /// permanently trace-stopped. Once a victim is resumed, it stays
    /// resumed: later calls return immediately.
    pub fn resume(&self, handle: &dyn PsHandle) {
        if let Some(target) = self.lookup(handle) {
            self.resume_target(&target);
        }
    }

    pub(crate) fn resume_target(&self, target: &Arc<Target>) {
        target.lock();
        debug!(pid = target.pid().as_raw(), "resume requested");

        if target.lock.with(|s| s.stop.contains(StopFlags::RESUMED)) {
            debug!(pid = target.pid().as_raw(), "already resumed");
            target.unlock();
            return;
        }

        let idle = target.lock.with(|s| {
            if s.stop.contains(StopFlags::IDLE) {
                s.stop.remove(StopFlags::IDLE);
                true
            } else {
                false
            }
        });
        if idle {
            target.rendezvous_cv.broadcast();
        }

        target.lock.wait_while(&target.rendezvous_cv, |s| {
            !s.stop.contains(StopFlags::RESUMED) && !s.done
        });
        debug!(pid = target.pid().as_raw(), "resumed");
        target.unlock();
    }

    /// The record behind a handle, if the pid is still in the cache.
    pub fn lookup(&self, handle: &dyn PsHandle) -> Option<Arc<Target>> {
        self.lookup_pid(handle.pid())
    }

    pub fn lookup_pid(&self, pid: Pid) -> Option<Arc<Target>> {
        self.shared.inner.lock().find(pid)
    }

    /// Take the target's recursive lock from a client thread.
    pub fn lock(&self, handle: &dyn PsHandle) {
        if let Some(t) = self.lookup(handle) {
            t.lock();
        }
    }

    pub fn unlock(&self, handle: &dyn PsHandle) {
        if let Some(t) = self.lookup(handle) {
            t.unlock();
        }
    }

    /// Everything queued on the notification bus, without blocking.
    pub fn drain_notifications(&self) -> Vec<Notification> {
        let mut inner = self.shared.inner.lock();
        inner.notify.drain(..).collect()
    }

    /// Sleep until a death or error notification arrives.
    pub fn wait_notification(&self) -> Notification {
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(n) = inner.notify.pop_front() {
                return n;
            }
            self.shared.notify_cv.wait(&mut inner);
        }
    }

    /// Number of live, non-retired targets in the cache.
    pub fn non_retired_count(&self) -> usize {
        self.shared.inner.lock().lru_cnt
    }

    /// Undrained entries on the notification bus.
    pub fn pending_notifications(&self) -> usize {
        self.shared.inner.lock().notify.len()
    }

    /// The effective rendezvous mode (degradation may have rewritten
    /// the configured one).
    pub fn mode(&self) -> StopAt {
        self.shared.mode()
    }

    /// Tear down every target, least recently used last. Also run by
    /// Drop, making a created-then-dropped registry a no-op.
    pub fn shutdown(&self) {
        let _guard = self.shared.destroy_lock.lock();
        loop {
            let target = self.shared.inner.lock().lru.front().cloned();
            match target {
                Some(t) => self.destroy_locked(&t),
                None => break,
            }
        }
    }

    /// Destroy one target. Caller holds the destroy mutex.
    fn destroy_locked(&self, target: &Arc<Target>) {
        debug!(
            pid = target.pid().as_raw(),
            "{} victim",
            if target.created() { "killing" } else { "releasing" }
        );

        // Unhash first and drop any notifications still pointing here,
        // so no client resolves this record while it is half dead.
        {
            let mut inner = self.shared.inner.lock();
            inner.remove_hash(target.pid());
            inner
                .notify
                .retain(|n| !Arc::ptr_eq(&n.target, target));
        }

        let was_retired = target.retired();

        // A live controller is poked into quitting and waited for; its
        // cleanup hands the victim back. Without one (the controller
        // already failed and signalled done) the debugger object is
        // released directly.
        if target.begin_quit() {
            target.wait_done();
        } else if let Some(h) = target.take_handle() {
            self.debugger.release(&h, target.created());
        }

        let mut inner = self.shared.inner.lock();
        if inner.remove_lru(target) && !was_retired {
            inner.lru_cnt = inner.lru_cnt.saturating_sub(1);
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
