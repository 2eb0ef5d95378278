//! The process model the [`Tracer`](crate::Tracer) reports lifecycle events to.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::ptracer::{Pid, Signal, WaitStatus};

/// Ownership of a process model is shared between the tracer and its callers.
pub type Shared<P> = Rc<RefCell<P>>;

/// How a process ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Exit {
    Code(i32),
    Signal { signal: Signal, core_dumped: bool },
}

impl Exit {
    /// Decode a terminal wait status. `None` if the process has not ended.
    pub fn from_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) =>
                Some(Exit::Code(code)),
            WaitStatus::Signaled(_, signal, core_dumped) =>
                Some(Exit::Signal { signal, core_dumped }),
            _ =>
                None,
        }
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Exit::Code(code) => write!(f, "exited with {}", code),
            Exit::Signal { signal, core_dumped: false } => write!(f, "killed by {}", signal),
            Exit::Signal { signal, core_dumped: true } => write!(f, "killed by {} (core dumped)", signal),
        }
    }
}

/// The set of children a wait call may reap, in the sense of the `pid` argument of
/// `wait4(2)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitTarget {
    Any,
    Pid(Pid),
    Group(Pid),
    /// The caller's own process group.
    OwnGroup,
    /// Arguments the kernel will reject with `EINVAL`.
    Invalid,
}

impl WaitTarget {
    pub fn from_wait4(pid: i32) -> Self {
        match pid {
            -1 => WaitTarget::Any,
            0 => WaitTarget::OwnGroup,
            pid if pid > 0 => WaitTarget::Pid(Pid::from_raw(pid)),
            pgid => match pgid.checked_neg() {
                Some(pgid) => WaitTarget::Group(Pid::from_raw(pgid)),
                None => WaitTarget::Invalid,
            },
        }
    }

    pub fn from_waitid(idtype: u32, id: u32) -> Self {
        match idtype {
            libc::P_ALL => WaitTarget::Any,
            libc::P_PID => WaitTarget::Pid(Pid::from_raw(id as i32)),
            libc::P_PGID if id == 0 => WaitTarget::OwnGroup,
            libc::P_PGID => WaitTarget::Group(Pid::from_raw(id as i32)),
            _ => WaitTarget::Invalid,
        }
    }
}

impl fmt::Display for WaitTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WaitTarget::Any => write!(f, "any child"),
            WaitTarget::Pid(pid) => write!(f, "{}", pid),
            WaitTarget::Group(pgid) => write!(f, "group {}", pgid),
            WaitTarget::OwnGroup => write!(f, "their group"),
            WaitTarget::Invalid => write!(f, "nothing"),
        }
    }
}

/// Where in its source a traced program says it is.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SourceLocation {
    pub line: u32,
    pub function: String,
    pub file: String,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.function, self.line)
    }
}

/// A node of the traced process tree.
///
/// Every notification describes something the process did or had done to it. A
/// process which ended is notified exactly once via [`notify_ended`], and afterwards
/// at most once more, via [`notify_reaped`] on its parent or [`notify_orphaned`] on
/// itself.
///
/// [`notify_ended`]: Process::notify_ended
/// [`notify_reaped`]: Process::notify_reaped
/// [`notify_orphaned`]: Process::notify_orphaned
pub trait Process: Sized {
    /// Model the session leader, before it has exec'd.
    fn spawned(pid: Pid, program: &str, argv: &[String]) -> Self;

    /// Model a new child of `parent`.
    fn forked(pid: Pid, parent: &Shared<Self>) -> Self;

    fn notify_forked(&mut self, child: Shared<Self>);

    /// An exec attempt of `path`. `errno` is zero iff the exec succeeded.
    fn notify_exec(&mut self, path: &str, argv: &[String], errno: i32);

    fn notify_ended(&mut self, exit: Exit);

    /// The process entered a wait call. It is resolved later by [`notify_reaped`] or
    /// [`notify_failed_wait`], or not at all if nothing was reaped.
    ///
    /// [`notify_reaped`]: Process::notify_reaped
    /// [`notify_failed_wait`]: Process::notify_failed_wait
    fn notify_waiting(&mut self, target: WaitTarget, nohang: bool);

    fn notify_reaped(&mut self, child: Shared<Self>);

    fn notify_failed_wait(&mut self, errno: i32);

    fn notify_signaled(&mut self, sender: Pid, signal: Signal);

    /// The process ended after its parent, and was reaped by someone else.
    fn notify_orphaned(&mut self);

    /// Attach a source location to the next event.
    fn update_location(&mut self, location: SourceLocation);

    fn pid(&self) -> Pid;

    fn state(&self) -> &'static str;

    /// Current program and arguments, formatted as `name [ args ]`.
    fn command_line(&self) -> String;
}
