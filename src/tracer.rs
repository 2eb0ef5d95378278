//! The event loop which drives a traced process tree and reports it to a process model.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use nix::errno::Errno;
use tracing::{debug, error, info, trace, warn};

use crate::blocking::{BlockingCall, Resolution, ERESTARTNOINTR};
use crate::error::{Error, Result};
use crate::process::{Exit, Process, Shared, SourceLocation};
use crate::ptracer::{Pid, Ptrace, Ptracer, Signal, WaitStatus};
use crate::reaper::Orphans;
use crate::syscall::{self, Syscall, INVALID_SYSCALL, LOCATION_SYSCALL};
use crate::tracee::Tracee;

const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(1);

// Once backing off while waiting on orphan reports would sleep longer than this, the
// remaining tracees are considered lost.
const MAX_POLL_DELAY: Duration = Duration::from_secs(2);

/// Tracer of a process tree, rooted at a spawned session leader.
///
/// Traced processes may fork, exec and wait as they like. Thread creation, `vfork()`
/// and leaving the leader's process group are refused with `ENOSYS`.
///
/// The tracer is driven by [`step()`](Tracer::step), which advances every tracee to its
/// next event of interest.
pub struct Tracer<P: Process, T: Ptrace = Ptracer> {
    trace: T,

    /// Live tracees.
    tracees: BTreeMap<Pid, Tracee<P>>,

    /// Tracees which ended, and may yet be reaped by a traced parent.
    zombies: BTreeMap<Pid, Shared<P>>,

    leader: Option<Pid>,

    /// The leader has made its first successful exec.
    execed: bool,

    /// Pids reused by a new tracee before the old one was reported orphaned.
    retired: Vec<Pid>,

    orphans: Box<dyn Orphans>,

    /// Initial delay when backing off while waiting on orphan reports.
    poll_delay: Duration,
}

impl<P: Process> Tracer<P> {
    pub fn new(orphans: impl Orphans + 'static) -> Self {
        Self::with_ptrace(Ptracer::new(), orphans)
    }
}

impl<P: Process, T: Ptrace> Tracer<P, T> {
    pub fn with_ptrace(trace: T, orphans: impl Orphans + 'static) -> Self {
        Self {
            trace,
            tracees: BTreeMap::new(),
            zombies: BTreeMap::new(),
            leader: None,
            execed: false,
            retired: vec![],
            orphans: Box::new(orphans),
            poll_delay: DEFAULT_POLL_DELAY,
        }
    }

    /// Return the initial orphan poll delay.
    pub fn poll_delay(&self) -> Duration {
        self.poll_delay
    }

    /// Set the initial orphan poll delay.
    pub fn set_poll_delay(&mut self, poll_delay: Duration) {
        self.poll_delay = poll_delay;
    }

    /// Spawn `program` as the leader of a new session, and trace it until it has exec'd.
    ///
    /// Returns `None` if a session is still active.
    pub fn start(&mut self, program: &str, args: &[String]) -> Result<Option<Shared<P>>> {
        if self.tracees_alive() {
            return Ok(None);
        }

        self.zombies.clear();
        self.retired.clear();
        self.execed = false;

        let pid = self.trace.spawn(program, args)?;

        let argv: Vec<String> = std::iter::once(program.to_owned())
            .chain(args.iter().cloned())
            .collect();
        let process = Rc::new(RefCell::new(P::spawned(pid, program, &argv)));

        // Stopped by its own `SIGSTOP`.
        let mut tracee = Tracee::new(pid, process.clone());
        tracee.stopped = true;
        self.add_tracee(tracee);
        self.leader = Some(pid);

        info!(pid = pid.as_raw(), program, "started session");

        while !self.execed {
            if !self.tracees.contains_key(&pid) {
                return Err(Error::NoExec { program: program.to_owned() });
            }

            self.resume(pid)?;

            if !self.tracees.contains_key(&pid) {
                continue;
            }

            let status = self.trace.wait_pid(pid)?;
            self.handle_status(status)?;
        }

        Ok(Some(process))
    }

    /// Advance every tracee until all of them are settled again: stopped at an event,
    /// or blocked in a wait call.
    ///
    /// A tracee stopped at an event stays stopped until the next step. So that nothing
    /// waits on it forever, the step also returns early once no other tracee has a
    /// status to report.
    ///
    /// Returns `false` once the session is over.
    pub fn step(&mut self) -> Result<bool> {
        let pids: Vec<Pid> = self.tracees.keys().copied().collect();

        for pid in pids {
            self.resume(pid)?;
        }

        self.collect_orphans()?;

        while !self.tracees.is_empty() {
            let holding = self.tracees.values().any(|tracee| tracee.stopped);

            let status = if holding {
                self.trace.poll_any()?
            } else {
                self.trace.wait_any()?
            };

            match status {
                Some(status) => {
                    self.handle_status(status)?;
                    self.collect_orphans()?;

                    if !self.tracees.is_empty() && self.tracees.values().all(Tracee::settled) {
                        return Ok(true);
                    }
                },
                None if holding => {
                    trace!("nothing to report while tracees are stopped");
                    return Ok(true);
                },
                None => {
                    self.drain_orphans()?;
                },
            }
        }

        debug!("no tracees left");
        self.zombies.clear();

        Ok(false)
    }

    /// Find the process model of a live or ended tracee.
    pub fn find(&self, pid: Pid) -> Option<Shared<P>> {
        self.tracees
            .get(&pid)
            .map(|tracee| tracee.process.clone())
            .or_else(|| self.zombies.get(&pid).cloned())
    }

    /// Kill every tracee, by sending `SIGKILL` to the leader's process group.
    ///
    /// The deaths are observed by subsequent steps.
    pub fn nuke(&mut self) -> Result<()> {
        let leader = match self.leader {
            Some(leader) if self.tracees_alive() => leader,
            _ => return Ok(()),
        };

        warn!(leader = leader.as_raw(), tracees = self.tracees.len(), "killing all tracees");

        match self.trace.kill_group(leader) {
            Err(Error::OS(Errno::ESRCH)) => Ok(()),
            res => res,
        }
    }

    pub fn tracees_alive(&self) -> bool {
        !self.tracees.is_empty()
    }

    pub fn tracee_count(&self) -> usize {
        self.tracees.len()
    }

    pub fn leader(&self) -> Option<Pid> {
        self.leader
    }

    /// Log every live tracee.
    pub fn print_list(&self) {
        for (pid, tracee) in &self.tracees {
            let process = tracee.process.borrow();

            info!(
                pid = pid.as_raw(),
                state = process.state(),
                command = %process.command_line(),
                stopped = tracee.stopped,
            );
        }

        info!(total = self.tracees.len(), "tracees");
    }

    /// Account for every orphan reported so far.
    pub fn check_orphans(&mut self) -> Result<()> {
        self.collect_orphans()
    }

    pub(crate) fn trace_mut(&mut self) -> &mut T {
        &mut self.trace
    }

    pub(crate) fn process_of(&self, pid: Pid) -> Result<Shared<P>> {
        match self.tracees.get(&pid) {
            Some(tracee) => Ok(tracee.process.clone()),
            None => internal_error!(format!("no tracee with pid {}", pid)),
        }
    }

    /// Forget a reaped tracee, live or ended, returning its process model.
    pub(crate) fn remove_tracee(&mut self, pid: Pid) -> Option<Shared<P>> {
        debug!(pid = pid.as_raw(), "removing tracee");

        self.tracees
            .remove(&pid)
            .map(|tracee| tracee.process)
            .or_else(|| self.zombies.remove(&pid))
    }

    fn tracee_mut(&mut self, pid: Pid) -> Result<&mut Tracee<P>> {
        match self.tracees.get_mut(&pid) {
            Some(tracee) => Ok(tracee),
            None => internal_error!(format!("no tracee with pid {}", pid)),
        }
    }

    fn add_tracee(&mut self, tracee: Tracee<P>) {
        let pid = tracee.pid;

        if self.tracees.insert(pid, tracee).is_some() {
            // We never saw the old tracee end. Its orphan report is still to come.
            warn!(pid = pid.as_raw(), "new tracee reuses the pid of a live tracee");
            self.retired.push(pid);
        } else if let Some(old) = self.zombies.remove(&pid) {
            // The pid was recycled, so someone outside the trace reaped the old tracee.
            debug!(pid = pid.as_raw(), "new tracee reuses the pid of an ended tracee");
            old.borrow_mut().notify_orphaned();
            self.retired.push(pid);
        }
    }

    fn handle_status(&mut self, status: WaitStatus) -> Result<()> {
        let pid = status.pid();

        if !self.tracees.contains_key(&pid) {
            warn!(pid = pid.as_raw(), ?status, "wait status for unknown tracee");
            return Ok(());
        }

        let res = self.dispatch(pid, status);
        self.recover(res)
    }

    // Route a tracee which vanished mid-operation into the end-of-process path.
    fn recover(&mut self, res: Result<()>) -> Result<()> {
        match res {
            Err(err) => match err.died_pid() {
                Some(pid) => {
                    debug!(pid = pid.as_raw(), %err, "tracee vanished");
                    self.expect_ended(pid)
                },
                None => Err(err),
            },
            ok => ok,
        }
    }

    fn dispatch(&mut self, pid: Pid, status: WaitStatus) -> Result<()> {
        if let Some(exit) = Exit::from_status(status) {
            self.handle_end(pid, exit);
            return Ok(());
        }

        self.tracee_mut(pid)?.stopped = true;

        match status {
            WaitStatus::PtraceSyscall(_) => {
                match self.tracee_mut(pid)?.current_syscall {
                    None => self.handle_syscall_entry(pid),
                    Some(number) => self.handle_syscall_exit(pid, number),
                }
            },
            WaitStatus::Stopped(_, signal) => {
                self.handle_signal_stop(pid, signal, status)
            },
            // Fork and exec events are consumed by their sub-protocols.
            WaitStatus::PtraceEvent(..) => {
                Err(Error::bad_status(pid, status, "ptrace event outside of fork or exec"))
            },
            _ => {
                Err(Error::bad_status(pid, status, "unexpected wait status"))
            },
        }
    }

    fn handle_end(&mut self, pid: Pid, exit: Exit) {
        let tracee = match self.tracees.remove(&pid) {
            Some(tracee) => tracee,
            None => return,
        };

        debug!(pid = pid.as_raw(), %exit, "tracee ended");
        tracee.process.borrow_mut().notify_ended(exit);

        // The leader is our own child, so nobody traced will reap it.
        if Some(pid) != self.leader {
            self.zombies.insert(pid, tracee.process);
        }
    }

    /// Wait for a tracee which could not be operated on to report its end.
    fn expect_ended(&mut self, pid: Pid) -> Result<()> {
        if !self.tracees.contains_key(&pid) {
            return Ok(());
        }

        let status = match self.trace.wait_pid(pid) {
            Ok(status) => status,
            Err(err) if err.tracee_died() => {
                warn!(pid = pid.as_raw(), "tracee vanished without an exit status");
                self.tracees.remove(&pid);
                return Ok(());
            },
            Err(err) => return Err(err),
        };

        match Exit::from_status(status) {
            Some(exit) => {
                self.handle_end(pid, exit);
                Ok(())
            },
            None => Err(Error::bad_status(pid, status, "expected tracee to have ended")),
        }
    }

    /// Wait for the tracee to stop. If it ends instead, that is handled, and `None` is
    /// returned.
    fn wait_for_stop(&mut self, pid: Pid) -> Result<Option<WaitStatus>> {
        let status = self.trace.wait_pid(pid)?;

        if let Some(exit) = Exit::from_status(status) {
            self.handle_end(pid, exit);
            return Ok(None);
        }

        self.tracee_mut(pid)?.stopped = true;

        Ok(Some(status))
    }

    // Resume a stopped tracee, delivering its pending signal.
    fn resume(&mut self, pid: Pid) -> Result<()> {
        let tracee = match self.tracees.get_mut(&pid) {
            Some(tracee) => tracee,
            None => return Ok(()),
        };

        if !tracee.stopped {
            trace!(pid = pid.as_raw(), "not stopped, not resuming");
            return Ok(());
        }

        let signal = tracee.pending_signal.take();
        tracee.stopped = false;

        match self.trace.resume(pid, signal) {
            Err(err) if err.tracee_died() => self.expect_ended(pid),
            res => res,
        }
    }

    // Resume a tracee which should be in the middle of a syscall, and wait for its next
    // stop. `None` if it ended.
    fn resume_in_syscall(&mut self, pid: Pid) -> Result<Option<WaitStatus>> {
        self.resume(pid)?;

        if !self.tracees.contains_key(&pid) {
            return Ok(None);
        }

        self.wait_for_stop(pid)
    }

    fn handle_syscall_entry(&mut self, pid: Pid) -> Result<()> {
        let info = self.trace.syscall(pid)?;
        let tracee = self.tracee_mut(pid)?;

        if std::mem::take(&mut tracee.location_pending) && info.number == LOCATION_SYSCALL {
            // The exit-stop of the location pseudo-syscall.
            return self.resume(pid);
        }

        // A wait awaiting its restart which is not reentered failed with `EINTR`.
        if let Some(call) = tracee.blocking.as_mut() {
            if call.interrupted_by(info.number) {
                debug!(pid = pid.as_raw(), waited = %call.target(), "wait interrupted by a signal handler");
                tracee.blocking = None;
                tracee.process.borrow_mut().notify_failed_wait(libc::EINTR);
            }
        }

        tracee.current_syscall = Some(info.number);

        trace!(pid = pid.as_raw(), syscall = %syscall::name(info.number), "syscall entry");

        match Syscall::classify(&info) {
            Syscall::Banned => {
                debug!(pid = pid.as_raw(), syscall = %syscall::name(info.number), "refusing syscall");
                self.trace.set_syscall_number(pid, INVALID_SYSCALL)?;
                self.resume(pid)
            },
            Syscall::Fork => {
                self.handle_fork(pid)
            },
            Syscall::Exec { path, argv } => {
                self.handle_exec(pid, path, argv)
            },
            Syscall::Wait4 { pid: waited, status, options } => {
                let call = BlockingCall::wait4(info.number, waited, status, options);
                self.initiate_wait(pid, call)
            },
            Syscall::WaitId { idtype, id, info: infop, options } => {
                let call = BlockingCall::waitid(info.number, idtype, id, infop, options);
                self.initiate_wait(pid, call)
            },
            Syscall::Location { line, function, file } => {
                self.handle_location(pid, line, function, file)
            },
            Syscall::Other => {
                self.resume(pid)
            },
        }
    }

    fn handle_syscall_exit(&mut self, pid: Pid, number: i64) -> Result<()> {
        let tracee = self.tracee_mut(pid)?;
        tracee.current_syscall = None;

        let mut call = match tracee.blocking.take() {
            Some(call) if call.syscall() == number => call,
            other => {
                tracee.blocking = other;
                return self.resume(pid);
            },
        };

        // Left stopped, so the reap is seen before anything the waiter does next.
        if call.finalize(self, pid)? == Resolution::Restarting {
            self.tracee_mut(pid)?.blocking = Some(call);
        }

        Ok(())
    }

    fn handle_signal_stop(&mut self, pid: Pid, signal: Signal, status: WaitStatus) -> Result<()> {
        if self.tracee_mut(pid)?.pending_signal.is_some() {
            return Err(Error::bad_status(pid, status, "signal stop with a signal already pending"));
        }

        match self.trace.signal_sender(pid)? {
            Some(sender) => {
                debug!(pid = pid.as_raw(), %signal, sender = sender.as_raw(), "signal delivery");

                let tracee = self.tracee_mut(pid)?;
                tracee.pending_signal = Some(signal);
                tracee.process.borrow_mut().notify_signaled(sender, signal);
            },
            None => {
                debug!(pid = pid.as_raw(), %signal, "group-stop");
            },
        }

        Ok(())
    }

    fn initiate_wait(&mut self, pid: Pid, mut call: BlockingCall) -> Result<()> {
        call.prepare(self, pid)?;

        // Any unresolved call is replaced. The waiter blocks in the kernel, where its
        // children and signals can reach it.
        self.tracee_mut(pid)?.blocking = Some(call);

        self.resume(pid)
    }

    fn handle_fork(&mut self, pid: Pid) -> Result<()> {
        let status = match self.resume_in_syscall(pid)? {
            Some(status) => status,
            None => return Ok(()),
        };

        match status {
            WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_FORK) |
            WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_CLONE) => {},
            WaitStatus::PtraceSyscall(_) => {
                return self.handle_failed_fork(pid);
            },
            _ => {
                return Err(Error::bad_status(pid, status, "expected a fork event"));
            },
        }

        let child = Pid::from_raw(self.trace.event_message(pid)? as i32);
        let parent = self.process_of(pid)?;
        let process = Rc::new(RefCell::new(P::forked(child, &parent)));

        self.add_tracee(Tracee::new(child, process.clone()));
        parent.borrow_mut().notify_forked(process);

        debug!(pid = pid.as_raw(), child = child.as_raw(), "forked");

        // The child's first stop is the `SIGSTOP` of its auto-attach, which is not
        // delivered.
        match self.wait_for_stop(child)? {
            Some(WaitStatus::Stopped(_, Signal::SIGSTOP)) | None => {},
            Some(status) => {
                return Err(Error::bad_status(child, status, "expected new child to stop"));
            },
        }

        match self.resume_in_syscall(pid)? {
            Some(WaitStatus::PtraceSyscall(_)) => {
                self.tracee_mut(pid)?.current_syscall = None;
                Ok(())
            },
            Some(status) => Err(Error::bad_status(pid, status, "expected fork to return")),
            None => Ok(()),
        }
    }

    // At the syscall-exit-stop of a fork which created nothing.
    fn handle_failed_fork(&mut self, pid: Pid) -> Result<()> {
        self.tracee_mut(pid)?.current_syscall = None;

        let ret = self.trace.syscall_return(pid)?;

        if ret == -(ERESTARTNOINTR as i64) {
            debug!(pid = pid.as_raw(), "fork interrupted, will be restarted");
            return self.resume(pid);
        }

        // Refuse to trace a fork bomb to its end.
        error!(pid = pid.as_raw(), errno = %Errno::from_i32(ret.wrapping_neg() as i32), "fork failed");

        self.nuke()
    }

    fn handle_exec(&mut self, pid: Pid, path: u64, argv: u64) -> Result<()> {
        // Snapshot arguments now, since a successful exec replaces the address space.
        let path = tolerate_fault(self.trace.read_string(pid, path))?;
        let argv = tolerate_fault(self.trace.read_string_array(pid, argv))?;

        let status = match self.resume_in_syscall(pid)? {
            Some(status) => status,
            None => return Ok(()),
        };

        let process = self.process_of(pid)?;

        match status {
            WaitStatus::PtraceSyscall(_) => {
                self.tracee_mut(pid)?.current_syscall = None;

                let errno = self.trace.syscall_return(pid)?.wrapping_neg() as i32;
                debug!(pid = pid.as_raw(), path = %path, errno = %Errno::from_i32(errno), "exec failed");

                process.borrow_mut().notify_exec(&path, &argv, errno);

                Ok(())
            },
            WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_EXEC) => {
                debug!(pid = pid.as_raw(), path = %path, "exec");

                process.borrow_mut().notify_exec(&path, &argv, 0);

                if Some(pid) == self.leader {
                    self.execed = true;
                }

                match self.resume_in_syscall(pid)? {
                    Some(WaitStatus::PtraceSyscall(_)) => {
                        self.tracee_mut(pid)?.current_syscall = None;
                        Ok(())
                    },
                    Some(status) => Err(Error::bad_status(pid, status, "expected exec to return")),
                    None => Ok(()),
                }
            },
            _ => {
                Err(Error::bad_status(pid, status, "expected exec to return or an exec event"))
            },
        }
    }

    fn handle_location(&mut self, pid: Pid, line: u32, function: u64, file: u64) -> Result<()> {
        let function = tolerate_fault(self.trace.read_string(pid, function))?;
        let file = tolerate_fault(self.trace.read_string(pid, file))?;
        let location = SourceLocation { line, function, file };

        trace!(pid = pid.as_raw(), %location, "location update");

        let tracee = self.tracee_mut(pid)?;
        tracee.current_syscall = None;
        tracee.location_pending = true;
        tracee.process.borrow_mut().update_location(location);

        self.resume(pid)
    }

    fn collect_orphans(&mut self) -> Result<()> {
        while let Some(pid) = self.orphans.poll() {
            self.reconcile_orphan(pid);
        }

        Ok(())
    }

    // Nothing is left to wait on, but tracees remain. They must have been orphaned, so
    // wait for their reports.
    fn drain_orphans(&mut self) -> Result<()> {
        let mut poll_delay = self.poll_delay;

        while !self.tracees.is_empty() {
            match self.orphans.wait() {
                Some(pid) => {
                    self.reconcile_orphan(pid);
                    poll_delay = self.poll_delay;
                },
                None if poll_delay <= MAX_POLL_DELAY => {
                    trace!(tracees = self.tracees.len(), ?poll_delay, "no orphan reports, backing off");

                    std::thread::sleep(poll_delay);
                    poll_delay *= 2;
                },
                None => {
                    let pid = self.tracees.keys().next().copied().unwrap_or_else(|| Pid::from_raw(0));
                    let message = format!("{} tracees vanished without an orphan report", self.tracees.len());
                    return Err(Error::bad_trace(pid, message));
                },
            }
        }

        Ok(())
    }

    fn reconcile_orphan(&mut self, pid: Pid) {
        if let Some(index) = self.retired.iter().position(|retired| *retired == pid) {
            debug!(pid = pid.as_raw(), "orphan report for a retired pid");
            self.retired.swap_remove(index);
            return;
        }

        let process = self.tracees
            .remove(&pid)
            .map(|tracee| tracee.process)
            .or_else(|| self.zombies.remove(&pid));

        match process {
            Some(process) => {
                debug!(pid = pid.as_raw(), "tracee orphaned");
                process.borrow_mut().notify_orphaned();
            },
            None => {
                // The reaper can report an orphan whose end was never traced, e.g. the
                // leader of an earlier session.
                warn!(pid = pid.as_raw(), "orphan is not a known tracee");
            },
        }
    }
}

// A bad pointer passed by the tracee yields an empty value.
fn tolerate_fault<V: Default>(res: Result<V>) -> Result<V> {
    match res {
        Err(err) if err.is_fault() => Ok(V::default()),
        res => res,
    }
}
