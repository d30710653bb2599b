//! The one OS primitive this crate consumes directly: a file descriptor
//! whose readability tracks process-state changes on a pid, so the
//! controller can fold victim events and marshalling traffic into a
//! single poll().

use libc::c_int;
use nix::errno::Errno;
use nix::unistd::Pid;
use std::os::unix::io::RawFd;

/// Report exit events on the descriptor.
pub const WAITFD_EXITED: c_int = libc::WEXITED;
/// Report stop events on the descriptor.
pub const WAITFD_STOPPED: c_int = libc::WSTOPPED;

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
const SYS_WAITFD: libc::c_long = 473;

/// Open a descriptor that becomes readable whenever `pid` changes state.
///
/// Only available where the kernel carries the waitfd syscall; other
/// platforms get ENOSYS and must supply the descriptor through the
/// debugger handle instead.
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub fn waitfd(pid: Pid, flags: c_int) -> Result<RawFd, Errno> {
    let ret = unsafe { libc::syscall(SYS_WAITFD, libc::P_PID as c_int, pid.as_raw(), flags, 0) };
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret as RawFd)
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "aarch64")))]
pub fn waitfd(pid: Pid, flags: c_int) -> Result<RawFd, Errno> {
    let _ = (pid, flags);
    Err(Errno::ENOSYS)
}
