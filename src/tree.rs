//! A [`Process`] model which records the lifecycle of every traced process, and renders
//! the resulting tree as indented text.

use std::cell::RefCell;
use std::fmt::Write;
use std::rc::{Rc, Weak};

use nix::errno::Errno;
use tracing::{debug, warn};

use crate::process::{Exit, Process, Shared, SourceLocation, WaitTarget};
use crate::ptracer::{Pid, Signal};

const INDENT: &str = "  ";

/// One attempt of a merged exec event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecCall {
    pub path: String,
    pub errno: i32,
}

#[derive(Clone, Debug)]
pub enum WaitOutcome {
    /// Still waiting, or returned without reaping anything.
    Waiting,
    Failed(i32),
    Reaped(Shared<Node>),
}

#[derive(Clone, Debug)]
pub enum Event {
    Forked { child: Shared<Node> },

    /// Consecutive failed execs of the same program and arguments are merged into one
    /// event, since that is how a C library searches `$PATH`.
    Exec { calls: Vec<ExecCall>, argv: Vec<String> },

    Wait { target: WaitTarget, nohang: bool, outcome: WaitOutcome },

    /// A signal delivery. `killed` if it ended the process.
    Signaled { sender: Option<Pid>, signal: Signal, killed: bool },

    Exited { code: i32 },
}

impl Event {
    fn succeeded_exec(&self) -> Option<(&ExecCall, &[String])> {
        match self {
            Event::Exec { calls, argv } => match calls.last() {
                Some(call) if call.errno == 0 => Some((call, argv)),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Record {
    pub event: Event,
    pub location: Option<SourceLocation>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Alive,
    Zombie,
    Reaped,
    Orphaned,
}

/// A traced process and everything it did.
#[derive(Debug)]
pub struct Node {
    pid: Pid,
    parent: Option<Weak<RefCell<Node>>>,

    /// Program and arguments before any exec.
    initial_name: String,
    initial_argv: Vec<String>,

    events: Vec<Record>,
    location: Option<SourceLocation>,
    state: State,
    exit: Option<Exit>,
}

impl Node {
    pub fn events(&self) -> &[Record] {
        &self.events
    }

    pub fn parent(&self) -> Option<Shared<Node>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn process_state(&self) -> State {
        self.state
    }

    pub fn exit(&self) -> Option<Exit> {
        self.exit
    }

    /// Children in the order they were forked.
    pub fn children(&self) -> Vec<Shared<Node>> {
        self.events
            .iter()
            .filter_map(|record| match &record.event {
                Event::Forked { child } => Some(child.clone()),
                _ => None,
            })
            .collect()
    }

    /// Render this process and its descendants, one event per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = INDENT.repeat(depth);
        let _ = writeln!(out, "{}process {}", indent, self.pid);

        for record in &self.events {
            let _ = write!(out, "{}{}{}", indent, INDENT, self.describe(&record.event));

            if let Some(location) = &record.location {
                let _ = write!(out, " @ {}", location);
            }

            out.push('\n');

            if let Event::Forked { child } = &record.event {
                child.borrow().render_into(out, depth + 2);
            }
        }
    }

    fn describe(&self, event: &Event) -> String {
        let pid = self.pid;

        match event {
            Event::Forked { child } => {
                format!("{} forked {}", pid, child.borrow().pid)
            },
            Event::Exec { calls, argv } => {
                let tries = calls.len();
                let last = match calls.last() {
                    Some(last) => last,
                    None => return format!("{} exec", pid),
                };

                let attempts = if tries > 1 {
                    format!(" ({} attempts)", tries)
                } else {
                    String::new()
                };

                if last.errno == 0 {
                    format!("{} execed {}{}", pid, format_command(&last.path, argv), attempts)
                } else {
                    let errno = Errno::from_i32(last.errno);
                    format!("{} failed to exec {} {{{}}}{}", pid, format_command(&last.path, argv), errno, attempts)
                }
            },
            Event::Wait { target, nohang, outcome } => {
                let nohang = if *nohang { " (WNOHANG)" } else { "" };

                match outcome {
                    WaitOutcome::Waiting if nohang.is_empty() => {
                        format!("{} started waiting for {}", pid, target)
                    },
                    WaitOutcome::Waiting => {
                        format!("{} waited for {}{} {{returned 0}}", pid, target, nohang)
                    },
                    WaitOutcome::Failed(errno) => {
                        let errno = Errno::from_i32(*errno);
                        format!("{} waited for {}{} {{failed: {}}}", pid, target, nohang, errno)
                    },
                    WaitOutcome::Reaped(child) => {
                        let child = child.borrow();
                        let death = match child.exit {
                            Some(exit) => exit.to_string(),
                            None => "ended".into(),
                        };
                        format!("{} reaped {} ({}) {{waited for {}{}}}", pid, child.pid, death, target, nohang)
                    },
                }
            },
            Event::Signaled { sender, signal, killed } => {
                let verb = if *killed { "killed by" } else { "received" };

                match sender {
                    Some(sender) => format!("{} {} {} from {}", pid, verb, signal, sender),
                    None => format!("{} {} {}", pid, verb, signal),
                }
            },
            Event::Exited { code } => {
                format!("{} exited with {}", pid, code)
            },
        }
    }

    fn add_event(&mut self, event: Event, consume_location: bool) {
        if self.state != State::Alive {
            warn!(pid = self.pid.as_raw(), state = self.state(), "event for a process which ended");
        }

        let location = if consume_location {
            self.location.take()
        } else {
            None
        };

        let record = Record { event, location };
        debug!(pid = self.pid.as_raw(), "{}", self.describe(&record.event));

        self.events.push(record);
    }

    fn last_exec(&self) -> Option<(&ExecCall, &[String])> {
        self.events
            .iter()
            .rev()
            .find_map(|record| record.event.succeeded_exec())
    }

    fn current_command(&self) -> (String, Vec<String>) {
        match self.last_exec() {
            Some((call, argv)) => (call.path.clone(), argv.to_vec()),
            None => (self.initial_name.clone(), self.initial_argv.clone()),
        }
    }

    // The most recent wait event which has not yet resolved.
    fn open_wait(&mut self) -> Option<&mut WaitOutcome> {
        self.events.iter_mut().rev().find_map(|record| match &mut record.event {
            Event::Wait { outcome: outcome @ WaitOutcome::Waiting, .. } => Some(outcome),
            _ => None,
        })
    }
}

fn format_command(name: &str, argv: &[String]) -> String {
    let mut line = format!("{} [ ", name);

    for arg in argv {
        line.push_str(arg);
        line.push(' ');
    }

    line.push(']');
    line
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl Process for Node {
    fn spawned(pid: Pid, program: &str, argv: &[String]) -> Self {
        Self {
            pid,
            parent: None,
            initial_name: program.to_owned(),
            initial_argv: argv.to_vec(),
            events: vec![],
            location: None,
            state: State::Alive,
            exit: None,
        }
    }

    fn forked(pid: Pid, parent: &Shared<Self>) -> Self {
        let (initial_name, initial_argv) = parent.borrow().current_command();

        Self {
            pid,
            parent: Some(Rc::downgrade(parent)),
            initial_name,
            initial_argv,
            events: vec![],
            location: None,
            state: State::Alive,
            exit: None,
        }
    }

    fn notify_forked(&mut self, child: Shared<Self>) {
        self.add_event(Event::Forked { child }, true);
    }

    fn notify_exec(&mut self, path: &str, argv: &[String], errno: i32) {
        let call = ExecCall { path: path.to_owned(), errno };

        if let Some(Record { event: Event::Exec { calls, argv: last_argv }, .. }) = self.events.last_mut() {
            let retry = match calls.last() {
                Some(last) => last.errno != 0 && base_name(&last.path) == base_name(path),
                None => false,
            };

            if retry && last_argv.as_slice() == argv {
                calls.push(call);
                return;
            }
        }

        let event = Event::Exec { calls: vec![call], argv: argv.to_vec() };
        self.add_event(event, true);
    }

    fn notify_ended(&mut self, exit: Exit) {
        match exit {
            Exit::Code(code) => {
                self.add_event(Event::Exited { code }, false);
            },
            Exit::Signal { signal, .. } => {
                // A delivered signal which then kills the process is one event.
                let promoted = match self.events.last_mut() {
                    Some(Record { event: Event::Signaled { signal: last, killed, .. }, .. })
                        if *last == signal && !*killed =>
                    {
                        *killed = true;
                        true
                    },
                    _ => false,
                };

                if !promoted {
                    let event = Event::Signaled { sender: None, signal, killed: true };
                    self.add_event(event, false);
                }
            },
        }

        self.state = State::Zombie;
        self.exit = Some(exit);
    }

    fn notify_waiting(&mut self, target: WaitTarget, nohang: bool) {
        // A restarted blocking wait continues the open one.
        if !nohang {
            if let Some(Record { event: Event::Wait { target: last, nohang: false, outcome: WaitOutcome::Waiting }, .. }) = self.events.last() {
                if *last == target {
                    return;
                }
            }
        }

        let event = Event::Wait { target, nohang, outcome: WaitOutcome::Waiting };
        self.add_event(event, true);
    }

    fn notify_reaped(&mut self, child: Shared<Self>) {
        child.borrow_mut().state = State::Reaped;

        match self.open_wait() {
            Some(outcome) => *outcome = WaitOutcome::Reaped(child),
            None => {
                warn!(pid = self.pid.as_raw(), "reap without a wait");
                let outcome = WaitOutcome::Reaped(child);
                let event = Event::Wait { target: WaitTarget::Any, nohang: false, outcome };
                self.add_event(event, true);
            },
        }
    }

    fn notify_failed_wait(&mut self, errno: i32) {
        match self.open_wait() {
            Some(outcome) => *outcome = WaitOutcome::Failed(errno),
            None => warn!(pid = self.pid.as_raw(), errno, "failed wait without a wait"),
        }
    }

    fn notify_signaled(&mut self, sender: Pid, signal: Signal) {
        let event = Event::Signaled { sender: Some(sender), signal, killed: false };
        self.add_event(event, false);
    }

    fn notify_orphaned(&mut self) {
        self.state = State::Orphaned;
    }

    fn update_location(&mut self, location: SourceLocation) {
        self.location = Some(location);
    }

    fn pid(&self) -> Pid {
        self.pid
    }

    fn state(&self) -> &'static str {
        match self.state {
            State::Alive => "alive",
            State::Zombie => "zombie",
            State::Reaped => "reaped",
            State::Orphaned => "orphaned",
        }
    }

    fn command_line(&self) -> String {
        let (name, argv) = self.current_command();
        format_command(&name, &argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn spawn() -> Shared<Node> {
        Rc::new(RefCell::new(Node::spawned(pid(10), "sh", &argv(&["sh", "-c", "true"]))))
    }

    #[test]
    fn test_command_line_follows_exec() {
        let leader = spawn();
        assert_eq!(leader.borrow().command_line(), "sh [ sh -c true ]");

        leader.borrow_mut().notify_exec("/bin/true", &argv(&["true"]), libc::ENOENT);
        assert_eq!(leader.borrow().command_line(), "sh [ sh -c true ]");

        leader.borrow_mut().notify_exec("/usr/bin/true", &argv(&["true"]), 0);
        assert_eq!(leader.borrow().command_line(), "/usr/bin/true [ true ]");

        // `$PATH` search attempts are one event.
        assert_eq!(leader.borrow().events().len(), 1);

        let child = Rc::new(RefCell::new(Node::forked(pid(11), &leader)));
        assert_eq!(child.borrow().command_line(), "/usr/bin/true [ true ]");
        assert_eq!(child.borrow().parent().map(|p| p.borrow().pid()), Some(pid(10)));
    }

    #[test]
    fn test_reap_resolves_wait() {
        let leader = spawn();
        let child = Rc::new(RefCell::new(Node::forked(pid(11), &leader)));

        leader.borrow_mut().notify_forked(child.clone());
        leader.borrow_mut().notify_waiting(WaitTarget::Any, false);
        // Restarted after a signal.
        leader.borrow_mut().notify_waiting(WaitTarget::Any, false);

        child.borrow_mut().notify_ended(Exit::Code(3));
        assert_eq!(child.borrow().process_state(), State::Zombie);

        leader.borrow_mut().notify_reaped(child.clone());
        assert_eq!(child.borrow().process_state(), State::Reaped);

        let leader = leader.borrow();
        assert_eq!(leader.events().len(), 2);
        assert!(matches!(
            &leader.events()[1].event,
            Event::Wait { outcome: WaitOutcome::Reaped(_), .. }
        ));
        assert_eq!(leader.children().len(), 1);
    }

    #[test]
    fn test_killing_signal_is_promoted() {
        let leader = spawn();

        leader.borrow_mut().notify_signaled(pid(1), Signal::SIGTERM);
        leader.borrow_mut().notify_ended(Exit::Signal { signal: Signal::SIGTERM, core_dumped: false });

        let leader = leader.borrow();
        assert_eq!(leader.events().len(), 1);
        assert!(matches!(leader.events()[0].event, Event::Signaled { killed: true, .. }));
        assert_eq!(leader.state(), "zombie");
    }

    #[test]
    fn test_location_attaches_to_next_event() {
        let leader = spawn();
        let location = SourceLocation { line: 7, function: "main".into(), file: "a.c".into() };

        leader.borrow_mut().update_location(location.clone());
        leader.borrow_mut().notify_signaled(pid(1), Signal::SIGUSR1);
        leader.borrow_mut().notify_waiting(WaitTarget::Pid(pid(11)), true);
        leader.borrow_mut().notify_failed_wait(libc::ECHILD);

        let leader = leader.borrow();
        assert_eq!(leader.events()[0].location, None);
        assert_eq!(leader.events()[1].location, Some(location));
    }

    #[test]
    fn test_render() {
        let leader = spawn();
        let child = Rc::new(RefCell::new(Node::forked(pid(11), &leader)));

        leader.borrow_mut().notify_forked(child.clone());
        child.borrow_mut().notify_exec("/bin/echo", &argv(&["echo", "hi"]), 0);
        child.borrow_mut().notify_ended(Exit::Code(0));
        leader.borrow_mut().notify_waiting(WaitTarget::Pid(pid(11)), false);
        leader.borrow_mut().notify_reaped(child);
        leader.borrow_mut().notify_ended(Exit::Code(0));

        let expected = "\
process 10
  10 forked 11
    process 11
      11 execed /bin/echo [ echo hi ]
      11 exited with 0
  10 reaped 11 (exited with 0) {waited for 11}
  10 exited with 0
";

        assert_eq!(leader.borrow().render(), expected);
    }
}
