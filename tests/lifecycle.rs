use std::time::{Duration, Instant};

use anyhow::Result;
use forktrace::{
    tree::{Event, State, WaitOutcome},
    Exit, Process, Signal,
};
use ntest::timeout;
use pretty_assertions::assert_eq;

mod support;
use support::*;

#[test]
#[timeout(5000)]
fn test_leader_exit_code() -> Result<()> {
    let leader = trace("exit 3")?;
    let leader = leader.borrow();

    assert_eq!(leader.exit(), Some(Exit::Code(3)));
    assert_eq!(leader.process_state(), State::Zombie);
    assert!(leader.children().is_empty());
    assert!(leader.command_line().starts_with(BASH));

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_fork_exec_reap() -> Result<()> {
    let leader = trace("/bin/true; exit 0")?;
    let child = only_child(&leader);

    assert_eq!(execs(&child), vec!["/bin/true".to_owned()]);
    assert_eq!(child.borrow().command_line(), "/bin/true [ /bin/true ]");
    assert_eq!(child.borrow().exit(), Some(Exit::Code(0)));
    assert_eq!(child.borrow().process_state(), State::Reaped);

    let child_pid = child.borrow().pid();
    let reaped = leader.borrow().events().iter().any(|record| match &record.event {
        Event::Wait { outcome: WaitOutcome::Reaped(reaped), .. } => reaped.borrow().pid() == child_pid,
        _ => false,
    });
    assert!(reaped);

    assert_eq!(leader.borrow().exit(), Some(Exit::Code(0)));

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_grandchild() -> Result<()> {
    let leader = trace("bash -c '/bin/true; exit 0'; exit 0")?;
    let child = only_child(&leader);
    let grandchild = only_child(&child);

    assert_eq!(execs(&grandchild), vec!["/bin/true".to_owned()]);
    assert_eq!(grandchild.borrow().process_state(), State::Reaped);
    assert_eq!(child.borrow().process_state(), State::Reaped);

    let parent = grandchild.borrow().parent().map(|p| p.borrow().pid());
    assert_eq!(parent, Some(child.borrow().pid()));

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_killed_by_signal() -> Result<()> {
    let leader = trace("kill -TERM $$")?;
    let leader = leader.borrow();
    let pid = leader.pid();

    assert_eq!(leader.exit(), Some(Exit::Signal { signal: Signal::SIGTERM, core_dumped: false }));

    match leader.events().last().map(|record| &record.event) {
        Some(Event::Signaled { sender, signal, killed }) => {
            assert_eq!(*sender, Some(pid));
            assert_eq!(*signal, Signal::SIGTERM);
            assert!(*killed);
        },
        other => panic!("expected a killing signal, got {:?}", other),
    }

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_realtime_signal_is_forwarded() -> Result<()> {
    let leader = trace("trap 'true' 40; kill -40 $$; exit 0")?;
    let leader = leader.borrow();
    let pid = leader.pid();

    assert_eq!(leader.exit(), Some(Exit::Code(0)));

    let delivered = leader.events().iter().any(|record| match &record.event {
        Event::Signaled { sender, signal, killed } =>
            *sender == Some(pid) && *signal == Signal::from_raw(40) && !*killed,
        _ => false,
    });
    assert!(delivered);

    Ok(())
}

// Untraced, the trap runs as soon as the signal arrives, while the shell blocks in
// `wait`. The background job would keep it waiting for seconds otherwise.
#[test]
#[timeout(5000)]
fn test_trap_interrupts_wait() -> Result<()> {
    let started = Instant::now();
    let leader = trace("trap 'kill $!; exit 7' USR1; (sleep 0.2; kill -USR1 $$; exec sleep 3) & wait; exit 3")?;

    assert!(started.elapsed() < Duration::from_secs(2));

    let leader = leader.borrow();
    assert_eq!(leader.exit(), Some(Exit::Code(7)));

    let delivered = leader.events().iter().any(|record| {
        matches!(record.event, Event::Signaled { signal: Signal::SIGUSR1, killed: false, .. })
    });
    assert!(delivered);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_path_search_is_one_event() -> Result<()> {
    let leader = trace("env forktrace-missing-program 2>/dev/null; exit 0")?;
    let child = only_child(&leader);
    let child = child.borrow();

    let failed: Vec<_> = child
        .events()
        .iter()
        .filter_map(|record| match &record.event {
            Event::Exec { calls, argv } if calls.iter().all(|c| c.errno != 0) => Some((calls, argv)),
            _ => None,
        })
        .collect();

    assert_eq!(failed.len(), 1);

    let (calls, argv) = failed[0];
    assert_eq!(argv, &vec!["forktrace-missing-program".to_owned()]);
    assert!(calls.iter().all(|c| c.path.ends_with("/forktrace-missing-program")));
    assert!(calls.iter().all(|c| c.errno == libc::ENOENT));

    assert_eq!(child.exit(), Some(Exit::Code(127)));

    Ok(())
}
