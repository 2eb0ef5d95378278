//! Wait statuses and signal numbers, decoded from the raw values the kernel reports.
//!
//! Real-time signals have no `nix` representation, and a traced program may send or die
//! by any of them, so both are decoded here.

use std::convert::TryFrom;
use std::fmt;

use nix::errno::Errno;
use nix::sys::signal as nix_signal;

use crate::ptracer::Pid;

/// A signal number, standard or real-time.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Signal(i32);

impl Signal {
    pub const SIGHUP: Signal = Signal(libc::SIGHUP);
    pub const SIGINT: Signal = Signal(libc::SIGINT);
    pub const SIGTRAP: Signal = Signal(libc::SIGTRAP);
    pub const SIGKILL: Signal = Signal(libc::SIGKILL);
    pub const SIGUSR1: Signal = Signal(libc::SIGUSR1);
    pub const SIGUSR2: Signal = Signal(libc::SIGUSR2);
    pub const SIGTERM: Signal = Signal(libc::SIGTERM);
    pub const SIGCHLD: Signal = Signal(libc::SIGCHLD);
    pub const SIGSTOP: Signal = Signal(libc::SIGSTOP);

    pub const fn from_raw(signo: i32) -> Self {
        Signal(signo)
    }

    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match nix_signal::Signal::try_from(self.0) {
            Ok(signal) => f.write_str(signal.as_ref()),
            Err(_) => write!(f, "signal {}", self.0),
        }
    }
}

/// A decoded `waitpid(2)` status.
///
/// Tracees are traced with `PTRACE_O_TRACESYSGOOD`, so syscall-stops are told apart
/// from `SIGTRAP` deliveries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitStatus {
    Exited(Pid, i32),

    /// Terminated by a signal. The flag is set if core was dumped.
    Signaled(Pid, Signal, bool),

    /// Signal-delivery-stop or group-stop.
    Stopped(Pid, Signal),

    /// Ptrace-event-stop, with the `PTRACE_EVENT_*` number.
    PtraceEvent(Pid, Signal, i32),

    /// Syscall-entry-stop or syscall-exit-stop.
    PtraceSyscall(Pid),

    Continued(Pid),
}

impl WaitStatus {
    pub fn from_raw(pid: Pid, status: i32) -> Self {
        if libc::WIFEXITED(status) {
            WaitStatus::Exited(pid, libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            let signal = Signal(libc::WTERMSIG(status));
            WaitStatus::Signaled(pid, signal, libc::WCOREDUMP(status))
        } else if libc::WIFSTOPPED(status) {
            let signo = libc::WSTOPSIG(status);
            let event = status >> 16;

            if signo == libc::SIGTRAP | 0x80 {
                WaitStatus::PtraceSyscall(pid)
            } else if event != 0 {
                WaitStatus::PtraceEvent(pid, Signal(signo), event)
            } else {
                WaitStatus::Stopped(pid, Signal(signo))
            }
        } else {
            WaitStatus::Continued(pid)
        }
    }

    pub fn pid(&self) -> Pid {
        match *self {
            WaitStatus::Exited(pid, _) |
            WaitStatus::Signaled(pid, _, _) |
            WaitStatus::Stopped(pid, _) |
            WaitStatus::PtraceEvent(pid, _, _) |
            WaitStatus::PtraceSyscall(pid) |
            WaitStatus::Continued(pid) => pid,
        }
    }
}

/// Call `waitpid(2)` on `pid`, or on any child if `None`.
///
/// Returns `None` if `WNOHANG` is among `flags` and no child has changed state.
pub(crate) fn waitpid(pid: Option<Pid>, flags: libc::c_int) -> nix::Result<Option<WaitStatus>> {
    let mut status = 0;
    let raw = pid.map_or(-1, Pid::as_raw);

    let res = unsafe { libc::waitpid(raw, &mut status, flags) };

    match Errno::result(res)? {
        0 => Ok(None),
        child => Ok(Some(WaitStatus::from_raw(Pid::from_raw(child), status))),
    }
}
