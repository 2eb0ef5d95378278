//! Reports of tracees which were orphaned, then reaped outside of the trace.
//!
//! A tracee whose parent ends first is reparented to the nearest subreaper, or init.
//! The tracer learns its fate from an [`Orphans`] supplier. [`start()`] makes the
//! calling process such a subreaper, and reports every pid it reaps.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
    poll::{poll, PollFd, PollFlags},
    sys::signal::Signal,
    unistd::{self, fork, ForkResult, Pid},
};
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::status::{self, WaitStatus};

const PID_SIZE: usize = std::mem::size_of::<libc::pid_t>();

// How long one call to `ReaperPipe::wait()` blocks, in milliseconds.
const WAIT_TIMEOUT: libc::c_int = 100;

/// Supplier of the pids of orphaned tracees, once reaped.
pub trait Orphans {
    /// Next reported pid, without blocking.
    fn poll(&mut self) -> Option<Pid>;

    /// Next reported pid, blocking for a while if none is ready.
    fn wait(&mut self) -> Option<Pid> {
        self.poll()
    }
}

impl<F> Orphans for F
where
    F: FnMut() -> Option<Pid>,
{
    fn poll(&mut self) -> Option<Pid> {
        self()
    }
}

/// Supplier which never reports an orphan.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOrphans;

impl Orphans for NoOrphans {
    fn poll(&mut self) -> Option<Pid> {
        None
    }
}

/// Read end of the pipe a reaper writes reaped pids to, as native-endian `pid_t`s.
#[derive(Debug)]
pub struct ReaperPipe {
    pipe: File,

    // Bytes of a partially-read pid.
    buf: Vec<u8>,

    closed: bool,
}

impl ReaperPipe {
    /// Take ownership of the read end of a reaper pipe.
    ///
    /// # Safety
    ///
    /// `fd` must be an open file descriptor which is not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;

        let pipe = File::from_raw_fd(fd);

        Ok(Self { pipe, buf: Vec::with_capacity(PID_SIZE), closed: false })
    }

    /// True once the reaper has gone away.
    pub fn closed(&self) -> bool {
        self.closed
    }

    fn read_pid(&mut self) -> io::Result<Option<Pid>> {
        while self.buf.len() < PID_SIZE {
            let mut chunk = [0; PID_SIZE];
            let want = PID_SIZE - self.buf.len();

            match self.pipe.read(&mut chunk[..want]) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(None);
                },
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        let mut raw = [0; PID_SIZE];
        raw.copy_from_slice(&self.buf);
        self.buf.clear();

        Ok(Some(Pid::from_raw(libc::pid_t::from_ne_bytes(raw))))
    }
}

impl Orphans for ReaperPipe {
    fn poll(&mut self) -> Option<Pid> {
        if self.closed {
            return None;
        }

        match self.read_pid() {
            Ok(pid) => pid,
            Err(err) => {
                warn!(%err, "reading from reaper failed");
                self.closed = true;
                None
            },
        }
    }

    fn wait(&mut self) -> Option<Pid> {
        if let Some(pid) = self.poll() {
            return Some(pid);
        }

        if self.closed {
            return None;
        }

        let mut fds = [PollFd::new(self.pipe.as_raw_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, WAIT_TIMEOUT) {
            Ok(0) | Err(Errno::EINTR) => None,
            Ok(_) => self.poll(),
            Err(err) => {
                warn!(%err, "polling reaper failed");
                None
            },
        }
    }
}

/// Split the calling process in two: a subreaper parent, and a child which returns
/// to continue as the tracer.
///
/// The parent never returns. It reaps every descendant orphaned into it, reports
/// their pids to the tracer, and exits with the tracer's exit code once everything is
/// reaped. The tracer is sent `SIGHUP` if the reaper dies.
///
/// Call this early, while the process is single-threaded.
pub fn start() -> Result<ReaperPipe> {
    let res = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    Errno::result(res)?;

    let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC)?;
    let reaper = unistd::getpid();

    // SAFETY: the caller is single-threaded.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            let _ = unistd::close(read);
            let pipe = unsafe { File::from_raw_fd(write) };
            reap(child, pipe)
        },
        ForkResult::Child => {
            unistd::close(write)?;

            let res = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, Signal::SIGHUP as libc::c_ulong, 0, 0, 0) };
            Errno::result(res)?;

            // The reaper may have died before the request took effect.
            if unistd::getppid() != reaper {
                return Err(Errno::ESRCH.into());
            }

            unsafe { ReaperPipe::from_raw_fd(read) }
        },
    }
}

fn reap(tracer: Pid, mut pipe: File) -> ! {
    debug!(tracer = tracer.as_raw(), "reaping orphans");

    let mut code = 0;

    loop {
        // Orphans may be killed by real-time signals, so statuses are decoded by hand.
        let status = match status::waitpid(None, libc::__WALL) {
            Ok(Some(status)) => status,
            Ok(None) | Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(err) => {
                warn!(%err, "reaper failed to wait");
                code = 1;
                break;
            },
        };

        let pid = match status {
            WaitStatus::Exited(pid, exit_code) => {
                if pid == tracer {
                    code = exit_code;
                    continue;
                }
                pid
            },
            WaitStatus::Signaled(pid, signal, _) => {
                if pid == tracer {
                    code = 128 + signal.as_raw();
                    continue;
                }
                pid
            },
            _ => continue,
        };

        trace!(pid = pid.as_raw(), "reaped orphan");

        // The tracer may be gone, so a closed pipe is no reason to stop reaping.
        if let Err(err) = pipe.write_all(&pid.as_raw().to_ne_bytes()) {
            if err.kind() != io::ErrorKind::BrokenPipe {
                warn!(%err, "reporting orphan failed");
            }
        }
    }

    std::process::exit(code)
}
