//! Trace primitives: spawning the session leader, resuming and waiting on tracees, and
//! reading or patching their registers and memory.
//!
//! Every operation acts on a single pid and is atomic from the tracer's point of view.
//! The [`Ptrace`] trait is the seam the [`Tracer`](crate::Tracer) is written against;
//! [`Ptracer`] implements it on top of `ptrace(2)`.

use std::fs;
use std::io;
use std::os::unix::fs::FileExt;

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        signal,
    },
};
use tracing::{debug, trace};

use crate::cmd::Command;
use crate::error::{Error, Result, ResultExt};
use crate::status;

#[cfg(target_arch = "aarch64")]
use crate::aarch64;

#[cfg(target_arch = "x86_64")]
use crate::x86;

pub use nix::unistd::Pid;
pub use nix::sys::ptrace::Options;
pub use crate::status::{Signal, WaitStatus};

/// Register state of a tracee.
#[cfg(target_arch = "aarch64")]
pub type Registers = aarch64::user_pt_regs;

/// Register state of a tracee.
#[cfg(target_arch = "x86_64")]
pub type Registers = libc::user_regs_struct;

/// Options every tracee is traced with.
///
/// - [`PTRACE_O_EXITKILL`](Options::PTRACE_O_EXITKILL): tracees die with the tracer.
/// - [`PTRACE_O_TRACESYSGOOD`](Options::PTRACE_O_TRACESYSGOOD): syscall-stops are not
///   confused with `SIGTRAP` deliveries.
/// - [`PTRACE_O_TRACEEXEC`](Options::PTRACE_O_TRACEEXEC)
/// - [`PTRACE_O_TRACEFORK`](Options::PTRACE_O_TRACEFORK): also covers fork-like `clone()`.
/// - [`PTRACE_O_TRACECLONE`](Options::PTRACE_O_TRACECLONE)
pub const REQUIRED_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_EXITKILL)
    .union(Options::PTRACE_O_TRACESYSGOOD)
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACECLONE);

/// Number of syscall argument registers.
pub const SYSCALL_ARGS: usize = 6;

// Only statuses of children traced by the calling thread are consumed, so independent
// tracers may run on separate threads of one process.
const WAIT_FLAGS: libc::c_int = libc::__WALL | libc::__WNOTHREAD;

// Reads of NUL-terminated strings never cross a chunk boundary, so a string ending
// just before an unmapped page is still readable.
const STRING_CHUNK: u64 = 256;
const MAX_STRING_LEN: usize = 1 << 16;
const MAX_STRING_ARRAY_LEN: usize = 1 << 12;

/// Syscall number and raw arguments, as seen at a syscall-entry-stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyscallInfo {
    pub number: i64,
    pub args: [u64; SYSCALL_ARGS],
}

/// Primitive operations on traced processes.
///
/// Errors distinguish a vanished tracee ([`Error::TraceeDied`]) and a bad address in
/// tracee memory ([`Error::Fault`]) from everything else.
pub trait Ptrace {
    /// Fork and exec `program` as a new traced session leader in its own process group.
    ///
    /// Returns once the child is attached and stopped, before it has exec'd.
    fn spawn(&mut self, program: &str, args: &[String]) -> Result<Pid>;

    /// Resume a stopped tracee until its next syscall-stop, delivering `signal`.
    fn resume(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()>;

    /// Wait for a status change of any tracee. Returns `None` if there is nothing left
    /// to wait on.
    fn wait_any(&mut self) -> Result<Option<WaitStatus>>;

    /// Like [`wait_any`](Ptrace::wait_any), but returns `None` at once if no tracee has
    /// a status change to report.
    fn poll_any(&mut self) -> Result<Option<WaitStatus>>;

    /// Wait for a status change of `pid`.
    fn wait_pid(&mut self, pid: Pid) -> Result<WaitStatus>;

    fn read_memory(&mut self, pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>>;

    fn write_memory(&mut self, pid: Pid, addr: u64, data: &[u8]) -> Result<()>;

    /// Number and arguments of the syscall `pid` is stopped in.
    fn syscall(&mut self, pid: Pid) -> Result<SyscallInfo>;

    fn set_syscall_number(&mut self, pid: Pid, number: i64) -> Result<()>;

    fn set_syscall_arg(&mut self, pid: Pid, index: usize, value: u64) -> Result<()>;

    /// Return value of the syscall, meaningful at a syscall-exit-stop.
    fn syscall_return(&mut self, pid: Pid) -> Result<i64>;

    /// Address of tracee memory that may be borrowed across a syscall, provided its
    /// contents are restored afterwards.
    fn scratch_address(&mut self, pid: Pid) -> Result<u64>;

    /// Message of the last ptrace-event-stop, e.g. the pid of a new child.
    fn event_message(&mut self, pid: Pid) -> Result<u64>;

    /// Sender of the signal `pid` is stopped for. `None` for a group-stop.
    fn signal_sender(&mut self, pid: Pid) -> Result<Option<Pid>>;

    /// Send `SIGKILL` to the process group `pgid`.
    fn kill_group(&mut self, pgid: Pid) -> Result<()>;

    fn zero_memory(&mut self, pid: Pid, addr: u64, len: usize) -> Result<()> {
        self.write_memory(pid, addr, &vec![0; len])
    }

    /// Read a NUL-terminated string. Invalid UTF-8 is replaced, and overlong strings are
    /// truncated.
    fn read_string(&mut self, pid: Pid, addr: u64) -> Result<String> {
        let mut bytes = vec![];
        let mut cursor = addr;

        while bytes.len() < MAX_STRING_LEN {
            let len = STRING_CHUNK - cursor % STRING_CHUNK;
            let chunk = self.read_memory(pid, cursor, len as usize)?;

            if let Some(end) = chunk.iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..end]);
                break;
            }

            bytes.extend_from_slice(&chunk);
            cursor += len;
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read a NULL-terminated array of string pointers, like `argv`.
    fn read_string_array(&mut self, pid: Pid, addr: u64) -> Result<Vec<String>> {
        const WORD: usize = std::mem::size_of::<u64>();

        let mut strings = vec![];
        let mut cursor = addr;

        while strings.len() < MAX_STRING_ARRAY_LEN {
            let word = self.read_memory(pid, cursor, WORD)?;
            let mut raw = [0; WORD];
            raw.copy_from_slice(&word);
            let ptr = u64::from_ne_bytes(raw);

            if ptr == 0 {
                break;
            }

            strings.push(self.read_string(pid, ptr)?);
            cursor += WORD as u64;
        }

        Ok(strings)
    }
}

/// Tracer for a tree of Linux processes, following forks and execs of a spawned leader.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ptracer {
    /// Ptrace options applied to the spawned leader, and inherited by its descendants.
    options: Options,
}

impl Default for Ptracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Ptracer {
    pub fn new() -> Self {
        let options = REQUIRED_OPTIONS;

        Self { options }
    }

    fn proc_mem_path(pid: Pid) -> String {
        format!("/proc/{}/mem", pid.as_raw())
    }

    #[cfg(target_arch = "x86_64")]
    fn registers(&self, pid: Pid) -> Result<Registers> {
        ptrace::getregs(pid).died_if_esrch(pid)
    }

    #[cfg(target_arch = "aarch64")]
    fn registers(&self, pid: Pid) -> Result<Registers> {
        let mut data = std::mem::MaybeUninit::<Registers>::uninit();
        let mut rv = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: std::mem::size_of::<Registers>(),
        };

        let res = unsafe {
            libc::ptrace(
                aarch64::PTRACE_GETREGSET,
                pid.as_raw(),
                aarch64::NT_PRSTATUS,
                &mut rv as *mut _ as *mut libc::c_void,
            )
        };

        Errno::result(res).died_if_esrch(pid)?;

        Ok(unsafe { data.assume_init() })
    }

    #[cfg(target_arch = "aarch64")]
    fn set_registers(&self, pid: Pid, mut regs: Registers) -> Result<()> {
        let mut rv = libc::iovec {
            iov_base: &mut regs as *mut _ as *mut libc::c_void,
            iov_len: std::mem::size_of::<Registers>(),
        };

        let res = unsafe {
            libc::ptrace(
                aarch64::PTRACE_SETREGSET,
                pid.as_raw(),
                aarch64::NT_PRSTATUS,
                &mut rv as *mut _ as *mut libc::c_void,
            )
        };

        Errno::result(res).died_if_esrch(pid)?;

        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    fn poke_user(&self, pid: Pid, off: u64, data: u64) -> Result<()> {
        // SAFETY: `off` does not require validation, because it is not actually used as a
        // pointer offset by the kernel.
        //
        // See: https://github.com/torvalds/linux/blob/v4.9/arch/x86/kernel/ptrace.c#L774-L791
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEUSER,
                pid.as_raw(),
                off,
                data,
            )
        };

        Errno::result(res).died_if_esrch(pid)?;

        Ok(())
    }
}

// Map a `/proc/<pid>/mem` access error onto the tracee's condition.
fn memory_error(pid: Pid, addr: u64, err: io::Error) -> Error {
    match err.raw_os_error() {
        Some(libc::EIO) | Some(libc::EFAULT) =>
            Error::Fault { pid, addr },
        Some(libc::ENOENT) | Some(libc::ESRCH) =>
            Error::TraceeDied { pid, source: Errno::ESRCH },
        _ =>
            err.into(),
    }
}

impl Ptrace for Ptracer {
    fn spawn(&mut self, program: &str, args: &[String]) -> Result<Pid> {
        let cmd = Command::new(program, args)?;
        let pid = cmd.fork_exec()?;

        // The child raises `SIGSTOP` once it has requested `PTRACE_TRACEME`.
        match self.wait_pid(pid)? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {},
            WaitStatus::Exited(_, code) => {
                let source = Command::failure_errno(code);
                return Err(Error::Spawn { program: program.to_owned(), source });
            },
            status => {
                return Err(Error::bad_status(pid, status, "spawned tracee did not stop"));
            },
        }

        ptrace::setoptions(pid, self.options).died_if_esrch(pid)?;
        debug!(pid = pid.as_raw(), program, "spawned tracee");

        Ok(pid)
    }

    fn resume(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        trace!(pid = pid.as_raw(), ?signal, "resuming tracee");

        // Real-time signals have no `nix` representation, so restart by hand.
        let data = signal.map_or(0, Signal::as_raw) as libc::c_long;
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_SYSCALL,
                pid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                data,
            )
        };

        Errno::result(res).map(drop).map_err(|source| Error::Restart { pid, source })
    }

    fn wait_any(&mut self) -> Result<Option<WaitStatus>> {
        loop {
            match status::waitpid(None, WAIT_FLAGS) {
                Ok(status) => return Ok(status),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn poll_any(&mut self) -> Result<Option<WaitStatus>> {
        loop {
            match status::waitpid(None, WAIT_FLAGS | libc::WNOHANG) {
                Ok(status) => return Ok(status),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn wait_pid(&mut self, pid: Pid) -> Result<WaitStatus> {
        loop {
            match status::waitpid(Some(pid), WAIT_FLAGS) {
                Ok(Some(status)) => return Ok(status),
                Ok(None) | Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Err(Error::TraceeDied { pid, source: Errno::ECHILD }),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn read_memory(&mut self, pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mem = fs::File::open(Self::proc_mem_path(pid))
            .map_err(|err| memory_error(pid, addr, err))?;

        let mut data = vec![0; len];
        let mut done = 0;

        while done < len {
            let at = addr + done as u64;

            match mem.read_at(&mut data[done..], at) {
                // The address space is gone.
                Ok(0) => return Err(Error::TraceeDied { pid, source: Errno::ESRCH }),
                Ok(n) => done += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(memory_error(pid, at, err)),
            }
        }

        Ok(data)
    }

    fn write_memory(&mut self, pid: Pid, addr: u64, data: &[u8]) -> Result<()> {
        let mem = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(Self::proc_mem_path(pid))
            .map_err(|err| memory_error(pid, addr, err))?;

        let mut done = 0;

        while done < data.len() {
            let at = addr + done as u64;

            match mem.write_at(&data[done..], at) {
                Ok(0) => return Err(Error::TraceeDied { pid, source: Errno::ESRCH }),
                Ok(n) => done += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(memory_error(pid, at, err)),
            }
        }

        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    fn syscall(&mut self, pid: Pid) -> Result<SyscallInfo> {
        let regs = self.registers(pid)?;
        let number = x86::syscall_number(&regs);
        let args = x86::syscall_args(&regs);

        Ok(SyscallInfo { number, args })
    }

    #[cfg(target_arch = "aarch64")]
    fn syscall(&mut self, pid: Pid) -> Result<SyscallInfo> {
        let regs = self.registers(pid)?;
        let number = aarch64::syscall_number(&regs);
        let args = aarch64::syscall_args(&regs);

        Ok(SyscallInfo { number, args })
    }

    #[cfg(target_arch = "x86_64")]
    fn set_syscall_number(&mut self, pid: Pid, number: i64) -> Result<()> {
        self.poke_user(pid, x86::number_offset(), number as u64)
    }

    #[cfg(target_arch = "aarch64")]
    fn set_syscall_number(&mut self, pid: Pid, number: i64) -> Result<()> {
        // The syscall about to run is read from its own regset, not from `x8`.
        let mut number = number as i32;
        let mut rv = libc::iovec {
            iov_base: &mut number as *mut _ as *mut libc::c_void,
            iov_len: std::mem::size_of::<i32>(),
        };

        let res = unsafe {
            libc::ptrace(
                aarch64::PTRACE_SETREGSET,
                pid.as_raw(),
                aarch64::NT_ARM_SYSTEM_CALL,
                &mut rv as *mut _ as *mut libc::c_void,
            )
        };

        Errno::result(res).died_if_esrch(pid)?;

        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    fn set_syscall_arg(&mut self, pid: Pid, index: usize, value: u64) -> Result<()> {
        match x86::arg_offset(index) {
            Some(off) => self.poke_user(pid, off, value),
            None => internal_error!(format!("no syscall argument at index {}", index)),
        }
    }

    #[cfg(target_arch = "aarch64")]
    fn set_syscall_arg(&mut self, pid: Pid, index: usize, value: u64) -> Result<()> {
        if index >= SYSCALL_ARGS {
            internal_error!(format!("no syscall argument at index {}", index));
        }

        let mut regs = self.registers(pid)?;
        regs.regs[index] = value;
        self.set_registers(pid, regs)
    }

    #[cfg(target_arch = "x86_64")]
    fn syscall_return(&mut self, pid: Pid) -> Result<i64> {
        Ok(x86::return_value(&self.registers(pid)?))
    }

    #[cfg(target_arch = "aarch64")]
    fn syscall_return(&mut self, pid: Pid) -> Result<i64> {
        Ok(aarch64::return_value(&self.registers(pid)?))
    }

    // The stack above the stack pointer is mapped, and the tracee cannot touch it while
    // it is inside a syscall.
    #[cfg(target_arch = "x86_64")]
    fn scratch_address(&mut self, pid: Pid) -> Result<u64> {
        Ok(x86::stack_pointer(&self.registers(pid)?))
    }

    #[cfg(target_arch = "aarch64")]
    fn scratch_address(&mut self, pid: Pid) -> Result<u64> {
        Ok(aarch64::stack_pointer(&self.registers(pid)?))
    }

    fn event_message(&mut self, pid: Pid) -> Result<u64> {
        Ok(ptrace::getevent(pid).died_if_esrch(pid)? as u64)
    }

    fn signal_sender(&mut self, pid: Pid) -> Result<Option<Pid>> {
        // From the manual:
        //
        //     If PTRACE_GETSIGINFO fails with EINVAL, then it is definitely a
        //     group-stop.
        //
        match ptrace::getsiginfo(pid) {
            Ok(info) => {
                let sender = unsafe { info.si_pid() };
                Ok(Some(Pid::from_raw(sender)))
            },
            Err(Errno::EINVAL) => Ok(None),
            Err(err) => Err(err).died_if_esrch(pid),
        }
    }

    fn kill_group(&mut self, pgid: Pid) -> Result<()> {
        debug!(pgid = pgid.as_raw(), "killing process group");

        signal::killpg(pgid, signal::Signal::SIGKILL)?;

        Ok(())
    }
}
