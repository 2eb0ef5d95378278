use anyhow::{anyhow, Result};
use forktrace::{process::Shared, tree::Event, Node, NoOrphans, Process, Tracer};

pub const BASH: &str = "/bin/bash";

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[allow(unused)]
/// Trace `bash -c <script>` to completion, returning the leader.
pub fn trace(script: &str) -> Result<Shared<Node>> {
    init_logging();

    let mut tracer: Tracer<Node> = Tracer::new(NoOrphans);
    let args = vec!["-c".to_owned(), script.to_owned()];

    let leader = tracer
        .start(BASH, &args)?
        .ok_or_else(|| anyhow!("session already active"))?;

    while tracer.step()? {}

    assert!(!tracer.tracees_alive());
    eprintln!("{}", leader.borrow().render());

    Ok(leader)
}

/// Paths of every successful exec of `node`.
#[allow(unused)]
pub fn execs(node: &Shared<Node>) -> Vec<String> {
    node.borrow()
        .events()
        .iter()
        .filter_map(|record| match &record.event {
            Event::Exec { calls, .. } => calls.last().filter(|c| c.errno == 0).map(|c| c.path.clone()),
            _ => None,
        })
        .collect()
}

#[allow(unused)]
pub fn only_child(node: &Shared<Node>) -> Shared<Node> {
    let children = node.borrow().children();
    assert_eq!(children.len(), 1, "{} has {} children", node.borrow().pid(), children.len());
    children[0].clone()
}
