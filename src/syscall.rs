//! Classes of syscalls the tracer reacts to.

use std::convert::TryFrom;

use syscalls::Sysno;

use crate::ptracer::SyscallInfo;

/// Number of the pseudo-syscall a traced program makes to report its source location,
/// as `syscall(LOCATION_SYSCALL, line, function, file)`.
///
/// The kernel fails it with `ENOSYS`, so it is harmless when not traced.
pub const LOCATION_SYSCALL: i64 = -2;

/// Number the tracer substitutes for a banned syscall. The kernel fails it with `ENOSYS`.
pub const INVALID_SYSCALL: i64 = -1;

/// A syscall at its entry-stop, with the arguments each class needs.
///
/// Pointers are addresses in the tracee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Syscall {
    /// Would let the tracee escape or break the trace: run an invalid syscall instead.
    Banned,

    /// `fork()`, or a `clone()` which behaves like it.
    Fork,

    /// `execve()` or `execveat()`.
    Exec { path: u64, argv: u64 },

    Wait4 { pid: i32, status: u64, options: i32 },

    WaitId { idtype: u32, id: u32, info: u64, options: i32 },

    Location { line: u32, function: u64, file: u64 },

    /// Everything else runs unmodified.
    Other,
}

impl Syscall {
    pub fn classify(info: &SyscallInfo) -> Self {
        let a = &info.args;

        if info.number == LOCATION_SYSCALL {
            return Syscall::Location { line: a[0] as u32, function: a[1], file: a[2] };
        }

        let sysno = match usize::try_from(info.number).ok().and_then(Sysno::new) {
            Some(sysno) => sysno,
            None => return Syscall::Other,
        };

        match sysno {
            Sysno::ptrace | Sysno::setpgid | Sysno::setsid => Syscall::Banned,

            // glibc falls back to `clone()` when `clone3()` is unavailable.
            Sysno::clone3 => Syscall::Banned,

            #[cfg(target_arch = "x86_64")]
            Sysno::vfork => Syscall::Banned,

            #[cfg(target_arch = "x86_64")]
            Sysno::fork => Syscall::Fork,

            Sysno::clone if is_forklike_clone(a[0]) => Syscall::Fork,
            Sysno::clone => Syscall::Banned,

            Sysno::execve => Syscall::Exec { path: a[0], argv: a[1] },
            Sysno::execveat => Syscall::Exec { path: a[1], argv: a[2] },

            Sysno::wait4 => Syscall::Wait4 {
                pid: a[0] as i32,
                status: a[1],
                options: a[2] as i32,
            },
            Sysno::waitid => Syscall::WaitId {
                idtype: a[0] as u32,
                id: a[1] as u32,
                info: a[2],
                options: a[3] as i32,
            },

            _ => Syscall::Other,
        }
    }
}

/// True if a `clone()` with these flags creates a process like `fork()` does: it
/// reports `SIGCHLD` to its parent and shares nothing with the caller.
pub fn is_forklike_clone(flags: u64) -> bool {
    const SHARING: libc::c_int = libc::CLONE_VM
        | libc::CLONE_THREAD
        | libc::CLONE_PARENT
        | libc::CLONE_VFORK
        | libc::CLONE_SIGHAND;

    let flags = flags as libc::c_int;

    (flags & 0xff) == libc::SIGCHLD && (flags & SHARING) == 0
}

fn is(number: i64, sysno: Sysno) -> bool {
    number == sysno.id() as i64
}

/// True for the syscall a signal handler returns through.
pub fn is_sigreturn(number: i64) -> bool {
    is(number, Sysno::rt_sigreturn)
}

/// True for the syscall the kernel substitutes when restarting an interrupted one.
pub fn is_restart(number: i64) -> bool {
    is(number, Sysno::restart_syscall)
}

/// Human-readable name of a syscall number.
pub fn name(number: i64) -> String {
    if number == LOCATION_SYSCALL {
        return "location".into();
    }

    match usize::try_from(number).ok().and_then(Sysno::new) {
        Some(sysno) => sysno.name().into(),
        None => format!("syscall({})", number),
    }
}
