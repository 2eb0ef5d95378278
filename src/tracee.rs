use crate::blocking::BlockingCall;
use crate::process::Shared;
use crate::ptracer::{Pid, Signal};

/// Trace session state of one traced process.
pub(crate) struct Tracee<P> {
    pub pid: Pid,

    /// In a ptrace-stop, and so waiting for the tracer to resume it.
    pub stopped: bool,

    /// Signal to deliver when next resumed.
    pub pending_signal: Option<Signal>,

    /// Syscall between its entry-stop and exit-stop. `None` when idle.
    pub current_syscall: Option<i64>,

    /// A location pseudo-syscall was handled at its entry-stop, so its exit-stop may
    /// show up next.
    pub location_pending: bool,

    pub blocking: Option<BlockingCall>,

    pub process: Shared<P>,
}

impl<P> Tracee<P> {
    /// A tracee which is running, and has yet to report its first stop.
    pub fn new(pid: Pid, process: Shared<P>) -> Self {
        Self {
            pid,
            stopped: false,
            pending_signal: None,
            current_syscall: None,
            location_pending: false,
            blocking: None,
            process,
        }
    }

    /// True if the tracee will not make progress without the tracer: it is stopped, or
    /// it was resumed into a wait call which may be waiting on a stopped tracee.
    pub fn settled(&self) -> bool {
        if self.stopped {
            return true;
        }

        match (&self.blocking, self.current_syscall) {
            (Some(call), Some(syscall)) => call.syscall() == syscall,
            _ => false,
        }
    }
}
