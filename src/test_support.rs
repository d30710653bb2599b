//! Scripted stand-ins for the external collaborators: an in-memory
//! debugger library whose victims are driven by queued events, a
//! linker database that fires link-map callbacks on demand, and a
//! recording probe layer. Used across the crate's tests.

use crate::debugger::{
    AuxKey, BkptDisposition, BkptHandler, Debugger, LockHook, PokeProxy, PokeRequest, ProbeLayer,
    ProcState, PsHandle, RtldDb, RtldEvent, RtldEventFn, RtldEventKind, RtldState, WaitProxy,
};
use libc::c_long;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::ThreadId;

/// What happens to a scripted victim next.
#[derive(Clone, Debug)]
pub enum FakeEvent {
    /// The victim ran into the breakpoint at this address.
    HitBreakpoint(u64),
    /// The victim stopped on a traced event.
    Stop,
    /// The victim died.
    Die,
    /// The dynamic linker finished a consistent link-map change.
    LinkMapChange,
}

/// Script shared by every handle a [`FakeDebugger`] makes.
#[derive(Clone, Default)]
pub struct FakeScript {
    /// AT_ENTRY value, if the auxv is readable.
    pub entry: Option<u64>,
    /// Symbol table; leave "main" out to emulate a stripped static
    /// binary.
    pub symbols: HashMap<String, u64>,
    /// Whether a linker database exists from the start.
    pub rtld: bool,
    /// Events queued onto the victim the first time it is set running.
    pub on_resume: Vec<FakeEvent>,
    /// Refuse create()/grab() with this errno.
    pub fail_spawn: Option<Errno>,
}

#[derive(Default)]
struct FakeDebuggerInner {
    next_pid: i32,
    handles: Vec<Arc<FakeHandle>>,
    released: Vec<(Pid, bool)>,
}

pub struct FakeDebugger {
    script: Mutex<FakeScript>,
    inner: Mutex<FakeDebuggerInner>,
}

impl FakeDebugger {
    pub fn new(script: FakeScript) -> Arc<FakeDebugger> {
        Arc::new(FakeDebugger {
            script: Mutex::new(script),
            inner: Mutex::new(FakeDebuggerInner {
                next_pid: 4200,
                ..Default::default()
            }),
        })
    }

    pub fn handle_for(&self, pid: Pid) -> Option<Arc<FakeHandle>> {
        self.inner
            .lock()
            .handles
            .iter()
            .find(|h| h.pid() == pid)
            .cloned()
    }

    /// (pid, killed) pairs in release order.
    pub fn released(&self) -> Vec<(Pid, bool)> {
        self.inner.lock().released.clone()
    }

    fn spawn(&self, pid: Pid) -> Result<Arc<dyn PsHandle>, Errno> {
        let script = self.script.lock().clone();
        if let Some(err) = script.fail_spawn {
            return Err(err);
        }
        let handle = FakeHandle::new(pid, script);
        self.inner.lock().handles.push(handle.clone());
        Ok(handle)
    }
}

impl Debugger for FakeDebugger {
    fn create(&self, _file: &str, _argv: &[String]) -> Result<Arc<dyn PsHandle>, Errno> {
        let pid = {
            let mut inner = self.inner.lock();
            inner.next_pid += 1;
            Pid::from_raw(inner.next_pid)
        };
        self.spawn(pid)
    }

    fn grab(&self, pid: Pid) -> Result<Arc<dyn PsHandle>, Errno> {
        self.spawn(pid)
    }

    fn release(&self, handle: &Arc<dyn PsHandle>, kill: bool) {
        self.inner.lock().released.push((handle.pid(), kill));
    }
}

struct Breakpoint {
    one_shot: bool,
    handler: BkptHandler,
}

#[derive(Default)]
struct FakeHandleInner {
    state: Option<ProcState>,
    has_fds: bool,
    detached: Option<bool>,
    resumes: u32,
    breakpoints: HashMap<u64, Breakpoint>,
    planted: Vec<u64>,
    removed: Vec<u64>,
    /// (request, issuing thread) for every poke that reached the OS.
    pokes: Vec<(PokeRequest, ThreadId)>,
    wait_threads: Vec<ThreadId>,
    wait_proxy: Option<WaitProxy>,
    poke_proxy: Option<PokeProxy>,
    lock_hook: Option<LockHook>,
    pending: VecDeque<FakeEvent>,
    on_resume: Vec<FakeEvent>,
    update_symbols_calls: u32,
    reopen_calls: u32,
    rtld: Option<Arc<FakeRtldDb>>,
}

/// One scripted victim. Its wait descriptor is the read end of a pipe;
/// queueing an event writes a byte, and `wait()` drains and processes
/// everything pending, running breakpoint handlers as the real library
/// would: on the calling (control) thread, inside a lock-hook window.
pub struct FakeHandle {
    pid: Pid,
    entry: Option<u64>,
    symbols: HashMap<String, u64>,
    event_rd: RawFd,
    event_wr: RawFd,
    inner: Mutex<FakeHandleInner>,
    pending_cv: Condvar,
}

impl FakeHandle {
    fn new(pid: Pid, script: FakeScript) -> Arc<FakeHandle> {
        let (rd, wr) = nix::unistd::pipe().expect("fake event pipe");
        let _ = fcntl(rd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK));
        Arc::new(FakeHandle {
            pid,
            entry: script.entry,
            symbols: script.symbols,
            event_rd: rd,
            event_wr: wr,
            inner: Mutex::new(FakeHandleInner {
                state: Some(ProcState::Stop),
                has_fds: true,
                on_resume: script.on_resume,
                rtld: if script.rtld {
                    Some(Arc::new(FakeRtldDb::default()))
                } else {
                    None
                },
                ..Default::default()
            }),
            pending_cv: Condvar::new(),
        })
    }

    /// Queue a victim event and make the wait descriptor readable.
    pub fn queue_event(&self, ev: FakeEvent) {
        self.inner.lock().pending.push_back(ev);
        let _ = nix::unistd::write(self.event_wr, b"e");
        self.pending_cv.notify_all();
    }

    /// Late-arriving linker database (static victim doing its first
    /// dlopen).
    pub fn make_rtld_available(&self) {
        let mut inner = self.inner.lock();
        if inner.rtld.is_none() {
            inner.rtld = Some(Arc::new(FakeRtldDb::default()));
        }
    }

    /// Invoke the installed wait proxy the way the library's internals
    /// would from a foreign thread.
    pub fn call_wait_proxy(&self, block: bool) -> Result<c_long, Errno> {
        let proxy = self.inner.lock().wait_proxy.clone();
        match proxy {
            Some(p) => p(block),
            None => Err(Errno::ENOSYS),
        }
    }

    pub fn call_poke_proxy(&self, req: &PokeRequest) -> Result<c_long, Errno> {
        let proxy = self.inner.lock().poke_proxy.clone();
        match proxy {
            Some(p) => p(req),
            None => Err(Errno::ENOSYS),
        }
    }

    pub fn resumes(&self) -> u32 {
        self.inner.lock().resumes
    }

    pub fn detached(&self) -> Option<bool> {
        self.inner.lock().detached
    }

    pub fn planted(&self) -> Vec<u64> {
        self.inner.lock().planted.clone()
    }

    pub fn removed(&self) -> Vec<u64> {
        self.inner.lock().removed.clone()
    }

    pub fn pokes(&self) -> Vec<(PokeRequest, ThreadId)> {
        self.inner.lock().pokes.clone()
    }

    pub fn wait_threads(&self) -> Vec<ThreadId> {
        self.inner.lock().wait_threads.clone()
    }

    pub fn update_symbols_calls(&self) -> u32 {
        self.inner.lock().update_symbols_calls
    }

    pub fn reopen_calls(&self) -> u32 {
        self.inner.lock().reopen_calls
    }

    pub fn rtld(&self) -> Option<Arc<FakeRtldDb>> {
        self.inner.lock().rtld.clone()
    }

    fn hook(&self, open: bool) {
        let hook = self.inner.lock().lock_hook.clone();
        if let Some(h) = hook {
            h(open);
        }
    }

    fn process(&self, ev: FakeEvent) {
        match ev {
            FakeEvent::HitBreakpoint(addr) => {
                let bp = {
                    let inner = self.inner.lock();
                    inner.breakpoints.get(&addr).map(|b| b.handler.clone())
                };
                if let Some(handler) = bp {
                    self.inner.lock().state = Some(ProcState::Stop);
                    // Handlers run inside the library's trace window.
                    self.hook(true);
                    let disposition = handler(addr);
                    self.hook(false);
                    let mut inner = self.inner.lock();
                    if let Some(b) = inner.breakpoints.get(&addr) {
                        if b.one_shot {
                            inner.breakpoints.remove(&addr);
                        }
                    }
                    if disposition == BkptDisposition::Resume {
                        inner.state = Some(ProcState::Run);
                    }
                }
            }
            FakeEvent::Stop => {
                self.inner.lock().state = Some(ProcState::Stop);
            }
            FakeEvent::Die => {
                self.inner.lock().state = Some(ProcState::Dead);
            }
            FakeEvent::LinkMapChange => {
                let rtld = self.inner.lock().rtld.clone();
                if let Some(db) = rtld {
                    db.fire(RtldEvent {
                        kind: RtldEventKind::DlActivity,
                        state: RtldState::Consistent,
                    });
                }
            }
        }
    }
}

impl PsHandle for FakeHandle {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn wait(&self, block: bool) -> Result<c_long, Errno> {
        self.inner.lock().wait_threads.push(std::thread::current().id());

        // Drain the readiness bytes.
        let mut buf = [0u8; 8];
        while let Ok(n) = nix::unistd::read(self.event_rd, &mut buf) {
            if n == 0 {
                break;
            }
        }

        if block {
            let mut inner = self.inner.lock();
            while inner.pending.is_empty() {
                self.pending_cv.wait(&mut inner);
            }
        }

        let mut count = 0;
        loop {
            let ev = self.inner.lock().pending.pop_front();
            match ev {
                Some(ev) => {
                    self.process(ev);
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }

    fn poke(&self, req: &PokeRequest) -> Result<c_long, Errno> {
        self.inner
            .lock()
            .pokes
            .push((req.clone(), std::thread::current().id()));
        Ok(0)
    }

    fn state(&self) -> ProcState {
        self.inner.lock().state.unwrap_or(ProcState::Run)
    }

    fn get_auxv(&self, key: AuxKey) -> Option<u64> {
        match key {
            AuxKey::Entry => self.entry,
            AuxKey::Base => None,
        }
    }

    fn lookup_symbol(&self, _module: Option<&str>, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    fn plant_breakpoint(
        &self,
        addr: u64,
        one_shot: bool,
        handler: BkptHandler,
    ) -> Result<(), Errno> {
        let mut inner = self.inner.lock();
        inner.planted.push(addr);
        inner.breakpoints.insert(addr, Breakpoint { one_shot, handler });
        Ok(())
    }

    fn remove_breakpoint(&self, addr: u64) {
        let mut inner = self.inner.lock();
        inner.removed.push(addr);
        inner.breakpoints.remove(&addr);
    }

    fn install_wait_proxy(&self, proxy: WaitProxy) {
        self.inner.lock().wait_proxy = Some(proxy);
    }

    fn install_poke_proxy(&self, proxy: PokeProxy) {
        self.inner.lock().poke_proxy = Some(proxy);
    }

    fn install_lock_hook(&self, hook: LockHook) {
        self.inner.lock().lock_hook = Some(hook);
    }

    fn has_fds(&self) -> bool {
        self.inner.lock().has_fds
    }

    fn close_fds(&self) {
        self.inner.lock().has_fds = false;
    }

    fn reopen(&self) -> Result<(), Errno> {
        let mut inner = self.inner.lock();
        inner.has_fds = true;
        inner.reopen_calls += 1;
        Ok(())
    }

    fn update_symbols(&self) {
        self.inner.lock().update_symbols_calls += 1;
    }

    fn rtld_db(&self) -> Option<Arc<dyn RtldDb>> {
        self.inner
            .lock()
            .rtld
            .clone()
            .map(|db| db as Arc<dyn RtldDb>)
    }

    fn set_detached(&self, detached: bool) {
        self.inner.lock().detached = Some(detached);
    }

    fn resume(&self) -> Result<(), Errno> {
        let queued: Vec<FakeEvent> = {
            let mut inner = self.inner.lock();
            inner.resumes += 1;
            inner.state = Some(ProcState::Run);
            inner.on_resume.drain(..).collect()
        };
        for ev in queued {
            self.queue_event(ev);
        }
        Ok(())
    }

    fn wait_fd(&self) -> Result<RawFd, Errno> {
        nix::unistd::dup(self.event_rd).map_err(|e| e.as_errno().unwrap_or(Errno::EIO))
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.event_rd);
        let _ = nix::unistd::close(self.event_wr);
    }
}

/// Linker database whose events the test fires by hand (or via
/// [`FakeEvent::LinkMapChange`]).
#[derive(Default)]
pub struct FakeRtldDb {
    callback: Mutex<Option<RtldEventFn>>,
    enables: Mutex<u32>,
}

impl FakeRtldDb {
    pub fn fire(&self, ev: RtldEvent) {
        let cb = self.callback.lock().clone();
        if let Some(cb) = cb {
            cb(&ev);
        }
    }

    pub fn enables(&self) -> u32 {
        *self.enables.lock()
    }
}

impl RtldDb for FakeRtldDb {
    fn enable_events(&self, cb: RtldEventFn) -> Result<(), Errno> {
        *self.enables.lock() += 1;
        *self.callback.lock() = Some(cb);
        Ok(())
    }
}

/// Probe layer that records every request and can be told to fail.
#[derive(Default)]
pub struct RecordingProbes {
    calls: Mutex<Vec<Pid>>,
    fail_with: Mutex<Option<String>>,
}

impl RecordingProbes {
    pub fn new() -> Arc<RecordingProbes> {
        Arc::new(RecordingProbes::default())
    }

    pub fn fail_next(&self, msg: &str) {
        *self.fail_with.lock() = Some(msg.to_string());
    }

    pub fn calls(&self) -> Vec<Pid> {
        self.calls.lock().clone()
    }
}

impl ProbeLayer for RecordingProbes {
    fn create_pending_probes(&self, pid: Pid) -> Result<(), String> {
        self.calls.lock().push(pid);
        match self.fail_with.lock().take() {
            Some(msg) => Err(msg),
            None => Ok(()),
        }
    }
}

/// A registry wired to a fresh scripted debugger.
pub fn registry_with(
    cfg: crate::config::Config,
    script: FakeScript,
    probes: Option<Arc<dyn ProbeLayer>>,
) -> (Arc<crate::registry::Registry>, Arc<FakeDebugger>) {
    let dbg = FakeDebugger::new(script);
    let reg = Arc::new(crate::registry::Registry::new(
        cfg,
        dbg.clone() as Arc<dyn Debugger>,
        probes,
    ));
    (reg, dbg)
}

/// Spin until `cond` holds, for the handful of assertions that trail a
/// controller's own exit path.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    false
}
