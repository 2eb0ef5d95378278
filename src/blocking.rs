//! Wait calls tracked across their syscall-entry-stop and syscall-exit-stop.
//!
//! To learn which child a wait call reaped, the tracer reads the result the kernel
//! wrote into the tracee. A tracee may pass a null result pointer, in which case the
//! call is redirected to borrowed scratch memory whose contents are restored at exit.

use std::convert::TryInto;
use std::mem;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::process::{Process, WaitTarget};
use crate::ptracer::{Pid, Ptrace};
use crate::syscall;
use crate::tracer::Tracer;

const ERESTARTSYS: i32 = 512;
pub(crate) const ERESTARTNOINTR: i32 = 513;
const ERESTARTNOHAND: i32 = 514;
const ERESTART_RESTARTBLOCK: i32 = 516;

// Kernel-internal errors seen at a syscall-exit-stop, which the kernel will restart.
const RESTART_CODES: &[i32] = &[
    ERESTARTSYS,
    ERESTARTNOINTR,
    ERESTARTNOHAND,
    ERESTART_RESTARTBLOCK,
];

// Byte offsets of the `siginfo_t` fields of a `SIGCHLD`.
const SI_CODE: usize = 8;
const SI_PID: usize = 16;

/// The wait syscalls which are tracked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flavor {
    /// Result is an `int` status, through argument 1.
    Wait4,

    /// Result is a `siginfo_t`, through argument 2. It is zeroed before the call, so a
    /// `WNOHANG` call which found nothing is recognizable.
    WaitId,
}

impl Flavor {
    fn result_arg(self) -> usize {
        match self {
            Flavor::Wait4 => 1,
            Flavor::WaitId => 2,
        }
    }

    fn result_size(self) -> usize {
        match self {
            Flavor::Wait4 => mem::size_of::<libc::c_int>(),
            Flavor::WaitId => mem::size_of::<libc::siginfo_t>(),
        }
    }

    fn zeroes_result(self) -> bool {
        self == Flavor::WaitId
    }
}

/// Outcome of a wait call at its syscall-exit-stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resolution {
    Reaped(Pid),

    /// The call failed with the contained errno.
    Failed(i32),

    /// Returned without reaping anything, e.g. a `WNOHANG` call with no ended child.
    Empty,

    /// Interrupted, and will be restarted by the kernel.
    Restarting,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockingCall {
    flavor: Flavor,

    /// Syscall number at entry, so the call is only finalized at its own exit.
    syscall: i64,

    target: WaitTarget,
    nohang: bool,

    /// Tracee address the kernel writes the result to. `None` if that address turned
    /// out to be bad: the call is degraded, and will fail.
    result: Option<u64>,

    /// Original contents of borrowed scratch memory.
    backup: Option<Vec<u8>>,

    /// `WNOWAIT` leaves the child waitable, so nothing is reaped.
    peek: bool,

    /// A signal handler returned while the call awaited its restart.
    handler_returned: bool,
}

impl BlockingCall {
    pub fn wait4(syscall: i64, pid: i32, status: u64, options: i32) -> Self {
        Self {
            flavor: Flavor::Wait4,
            syscall,
            target: WaitTarget::from_wait4(pid),
            nohang: options & libc::WNOHANG != 0,
            result: Some(status),
            backup: None,
            peek: false,
            handler_returned: false,
        }
    }

    pub fn waitid(syscall: i64, idtype: u32, id: u32, info: u64, options: i32) -> Self {
        Self {
            flavor: Flavor::WaitId,
            syscall,
            target: WaitTarget::from_waitid(idtype, id),
            nohang: options & libc::WNOHANG != 0,
            result: Some(info),
            backup: None,
            peek: options & libc::WNOWAIT != 0,
            handler_returned: false,
        }
    }

    pub(crate) fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub(crate) fn syscall(&self) -> i64 {
        self.syscall
    }

    pub(crate) fn target(&self) -> WaitTarget {
        self.target
    }

    pub(crate) fn nohang(&self) -> bool {
        self.nohang
    }

    /// True if the result address was bad, so the call will fail.
    pub(crate) fn degraded(&self) -> bool {
        self.result.is_none()
    }

    /// Account for a syscall entry of a tracee whose call awaits its restart.
    ///
    /// Returns true if the call will not be restarted: a signal handler has returned,
    /// and the program went on to make some other syscall. The call then failed with
    /// `EINTR`. Syscalls made inside the handler are ignored.
    pub(crate) fn interrupted_by(&mut self, number: i64) -> bool {
        if syscall::is_sigreturn(number) {
            self.handler_returned = true;
            return false;
        }

        self.handler_returned && number != self.syscall && !syscall::is_restart(number)
    }

    /// Set up the call at its syscall-entry-stop, and notify the waiting process.
    pub(crate) fn prepare<P: Process, T: Ptrace>(&mut self, tracer: &mut Tracer<P, T>, pid: Pid) -> Result<()> {
        match self.redirect(tracer.trace_mut(), pid) {
            Err(err) if err.is_fault() => {
                debug!(pid = pid.as_raw(), %err, "wait result address is bad, degrading call");
                self.result = None;
            },
            res => res?,
        }

        let process = tracer.process_of(pid)?;
        process.borrow_mut().notify_waiting(self.target, self.nohang);

        Ok(())
    }

    fn redirect<T: Ptrace>(&mut self, trace: &mut T, pid: Pid) -> Result<()> {
        let size = self.flavor.result_size();

        let addr = match self.result {
            Some(0) => {
                let scratch = trace.scratch_address(pid)?;
                let backup = trace.read_memory(pid, scratch, size)?;

                trace!(pid = pid.as_raw(), scratch, "redirecting wait result to scratch memory");

                self.backup = Some(backup);
                self.result = Some(scratch);
                trace.set_syscall_arg(pid, self.flavor.result_arg(), scratch)?;

                scratch
            },
            Some(addr) => addr,
            None => return Ok(()),
        };

        if self.flavor.zeroes_result() {
            trace.zero_memory(pid, addr, size)?;
        }

        Ok(())
    }

    /// Resolve the call at its syscall-exit-stop, restoring any borrowed memory and
    /// notifying the waiting process.
    ///
    /// A reaped child must be known to the tracer, and is removed from it.
    pub(crate) fn finalize<P: Process, T: Ptrace>(&mut self, tracer: &mut Tracer<P, T>, pid: Pid) -> Result<Resolution> {
        let resolution = match self.result {
            Some(addr) => self.collect(tracer.trace_mut(), pid, addr)?,
            None => Resolution::Failed(libc::EFAULT),
        };

        debug!(pid = pid.as_raw(), ?resolution, waited = %self.target, "wait call returned");

        let process = tracer.process_of(pid)?;

        match resolution {
            Resolution::Reaped(child) => {
                let reaped = match tracer.remove_tracee(child) {
                    Some(reaped) => reaped,
                    None => {
                        let message = format!("reaped unknown child {}", child);
                        return Err(Error::bad_trace(pid, message));
                    },
                };
                process.borrow_mut().notify_reaped(reaped);
            },
            Resolution::Failed(errno) => {
                process.borrow_mut().notify_failed_wait(errno);
            },
            Resolution::Empty | Resolution::Restarting => {},
        }

        Ok(resolution)
    }

    fn collect<T: Ptrace>(&mut self, trace: &mut T, pid: Pid, addr: u64) -> Result<Resolution> {
        let ret = trace.syscall_return(pid)?;

        let payload = match trace.read_memory(pid, addr, self.flavor.result_size()) {
            Ok(payload) => Some(payload),
            Err(err) if err.is_fault() => None,
            Err(err) => return Err(err),
        };

        if let Some(backup) = self.backup.take() {
            trace.write_memory(pid, addr, &backup)?;
            trace.set_syscall_arg(pid, self.flavor.result_arg(), 0)?;
        }

        let payload = match payload {
            Some(payload) => payload,
            None if ret < 0 => return Ok(self.failure(ret)),
            None => return Ok(Resolution::Failed(libc::EFAULT)),
        };

        if ret < 0 {
            return Ok(self.failure(ret));
        }

        let resolution = match self.flavor {
            Flavor::Wait4 => {
                let status = read_i32(&payload, 0);

                if ret > 0 && (libc::WIFEXITED(status) || libc::WIFSIGNALED(status)) {
                    Resolution::Reaped(Pid::from_raw(ret as i32))
                } else {
                    Resolution::Empty
                }
            },
            Flavor::WaitId => {
                let code = read_i32(&payload, SI_CODE);
                let child = read_i32(&payload, SI_PID);
                let ended = matches!(code, libc::CLD_EXITED | libc::CLD_KILLED | libc::CLD_DUMPED);

                if ret == 0 && child != 0 && ended && !self.peek {
                    Resolution::Reaped(Pid::from_raw(child))
                } else {
                    Resolution::Empty
                }
            },
        };

        Ok(resolution)
    }

    fn failure(&self, ret: i64) -> Resolution {
        let errno = ret.wrapping_neg() as i32;

        if RESTART_CODES.contains(&errno) {
            Resolution::Restarting
        } else {
            Resolution::Failed(errno)
        }
    }
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    let raw: [u8; 4] = match bytes.get(offset..offset + 4).and_then(|b| b.try_into().ok()) {
        Some(raw) => raw,
        None => [0; 4],
    };

    i32::from_ne_bytes(raw)
}
