use anyhow::Result;
use forktrace::{Error, Node, NoOrphans, Tracer};
use ntest::timeout;

mod support;

#[test]
#[timeout(5000)]
fn test_spawn_missing_program() -> Result<()> {
    support::init_logging();

    let mut tracer: Tracer<Node> = Tracer::new(NoOrphans);
    let res = tracer.start("/nonexistent/forktrace-leader", &[]);

    assert!(matches!(res, Err(Error::NoExec { .. })), "{:?}", res.map(|_| ()));
    assert!(!tracer.tracees_alive());

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_session_can_restart() -> Result<()> {
    support::init_logging();

    let mut tracer: Tracer<Node> = Tracer::new(NoOrphans);

    for code in 1..3 {
        let script = format!("exit {}", code);
        let leader = tracer.start(support::BASH, &["-c".to_owned(), script])?;
        assert!(leader.is_some());

        while tracer.step()? {}

        assert!(!tracer.tracees_alive());
    }

    Ok(())
}
