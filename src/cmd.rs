use std::ffi::CString;

use nix::{
    errno::Errno,
    unistd::{fork, ForkResult, Pid},
};

use crate::error::{Error, Result};

// Exit codes a child uses to report why it could not reach `exec`.
//
// `fork()` leaves us unable to allocate, so the code is the only channel back.
const FAILURE_CODES: &[(Errno, i32)] = &[
    (Errno::EBUSY, 1),
    (Errno::EFAULT, 2),
    (Errno::EINVAL, 3),
    (Errno::EIO, 4),
    (Errno::EPERM, 5),
    (Errno::ESRCH, 6),
];
const UNKNOWN_FAILURE: i32 = 7;

/// Command to spawn as the leader of a traced session.
#[derive(Clone, Debug)]
pub struct Command {
    /// Argument vector to pass to `execvp()`. The first entry names the program.
    argv: Vec<CString>,
}

impl Command {
    pub fn new(program: &str, args: &[String]) -> Result<Self> {
        // Ensure we own NUL-terminated strings for the foreign exec call.
        //
        // We're heap-allocating, so always do this before forking.
        let argv: std::result::Result<Vec<_>, _> = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .map(CString::new)
            .collect();

        let argv = argv.map_err(|_| Error::Spawn {
            program: program.to_owned(),
            source: Errno::EINVAL,
        })?;

        Ok(Self { argv })
    }

    pub fn program(&self) -> String {
        self.argv[0].to_string_lossy().into_owned()
    }

    /// Fork a child which requests `PTRACE_TRACEME` in a new process group, raises
    /// `SIGSTOP`, then execs `self.argv`.
    ///
    /// The parent observes the `SIGSTOP` before the exec, so no event is missed.
    pub fn fork_exec(&self) -> Result<Pid> {
        // Heap-allocates, must occur pre-fork.
        let argv = self.argv();

        // SAFETY: the child only makes async-signal-safe calls before `exec` or `_exit`.
        let res = unsafe { fork() };

        match res.map_err(|source| Error::Spawn { program: self.program(), source })? {
            ForkResult::Child => unsafe { exec_child(&argv) },
            ForkResult::Parent { child } => Ok(child),
        }
    }

    /// Recover the reason a child gave for exiting before it could exec.
    pub fn failure_errno(code: i32) -> Errno {
        FAILURE_CODES
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(errno, _)| *errno)
            .unwrap_or(Errno::UnknownErrno)
    }

    // Construct NUL-terminated arguments for `execvp`. We heap-allocate to return a `Vec`,
    // and so must do this before calling `fork()`.
    fn argv(&self) -> Vec<*const libc::c_char> {
        let mut argv: Vec<_> = self.argv
            .iter()
            .map(|s| s.as_ptr())
            .collect();
        argv.push(std::ptr::null());
        argv
    }
}

// Runs in the forked child. Use raw `libc` calls, because the `nix` wrappers may
// allocate, which is not async-signal-safe.
unsafe fn exec_child(argv: &[*const libc::c_char]) -> ! {
    // The tracer may have blocked signals it waits on. Do not leak that into the tracee.
    let mut mask: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut mask);
    if libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut()) == -1 {
        fail();
    }

    // Lead a new process group, so the whole tree can be killed at once.
    if libc::setpgid(0, 0) == -1 {
        fail();
    }

    if libc::ptrace(libc::PTRACE_TRACEME, 0, 0, 0) == -1 {
        fail();
    }

    if libc::raise(libc::SIGSTOP) != 0 {
        fail();
    }

    libc::execvp(argv[0], argv.as_ptr());

    fail()
}

unsafe fn fail() -> ! {
    let errno = Errno::last();

    let code = FAILURE_CODES
        .iter()
        .find(|(e, _)| *e == errno)
        .map(|(_, code)| *code)
        .unwrap_or(UNKNOWN_FAILURE);

    libc::_exit(code)
}
