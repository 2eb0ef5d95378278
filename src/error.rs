use std::io;

use nix::errno::Errno;

use crate::ptracer::{Pid, WaitStatus};


pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The tracee produced an event sequence we do not understand.
    ///
    /// This is fatal for the whole [`Tracer`](crate::Tracer). Tracees are spawned with
    /// `PTRACE_O_EXITKILL`, so they die with the tracing process.
    #[error("Bad trace of pid = {pid}{}: {message}", describe_status(.status))]
    BadTrace {
        pid: Pid,
        status: Option<WaitStatus>,
        message: String,
    },

    #[error("Tracee = {pid} died")]
    TraceeDied { pid: Pid, source: nix::Error },

    #[error("Memory fault in tracee = {pid} at address = {addr:#x}")]
    Fault { pid: Pid, addr: u64 },

    #[error("Could not start tracee `{program}`")]
    Spawn { program: String, source: nix::Error },

    #[error("Tracee `{program}` ended before it could exec")]
    NoExec { program: String },

    #[error("Could not restart tracee = {pid}")]
    Restart { pid: Pid, source: nix::Error },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn bad_trace(pid: Pid, message: impl Into<String>) -> Self {
        let message = message.into();
        Error::BadTrace { pid, status: None, message }
    }

    pub(crate) fn bad_status(pid: Pid, status: WaitStatus, message: impl Into<String>) -> Self {
        let message = message.into();
        Error::BadTrace { pid, status: Some(status), message }
    }

    /// True if the error was caused by the tracee no longer existing.
    pub fn tracee_died(&self) -> bool {
        match self {
            Error::TraceeDied { .. } => true,
            Error::Restart { source, .. } => *source == Errno::ESRCH,
            _ => false,
        }
    }

    /// The tracee which vanished, if this error means one did.
    pub fn died_pid(&self) -> Option<Pid> {
        match self {
            Error::TraceeDied { pid, .. } => Some(*pid),
            Error::Restart { pid, source } if *source == Errno::ESRCH => Some(*pid),
            _ => None,
        }
    }

    /// True if a tracee memory access touched an unmapped or protected address.
    pub fn is_fault(&self) -> bool {
        matches!(self, Error::Fault { .. })
    }
}

fn describe_status(status: &Option<WaitStatus>) -> String {
    match status {
        Some(status) => format!(", status = {:?}", status),
        None => String::new(),
    }
}

pub(crate) trait ResultExt<T> {
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, nix::Error> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|source| {
            if source == Errno::ESRCH {
                Error::TraceeDied { pid, source }
            } else {
                Error::OS(source)
            }
        })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}
