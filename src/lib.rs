#[macro_use]
mod error;

#[cfg(target_arch = "aarch64")]
mod aarch64;

#[cfg(target_arch = "x86_64")]
mod x86;

mod blocking;
mod cmd;
mod status;
mod syscall;
mod tracee;

pub mod process;
pub mod ptracer;
pub mod reaper;
pub mod tracer;
pub mod tree;

pub use error::{Error, Result};
pub use process::{Exit, Process, Shared, SourceLocation, WaitTarget};
pub use ptracer::{Pid, Ptrace, Ptracer, Registers, Signal, SyscallInfo, REQUIRED_OPTIONS};
pub use reaper::{NoOrphans, Orphans, ReaperPipe};
pub use syscall::{LOCATION_SYSCALL, Syscall};
pub use tracer::Tracer;
pub use tree::Node;
