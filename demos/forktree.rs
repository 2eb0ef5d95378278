use std::time::Duration;

use anyhow::{anyhow, Result};
use forktrace::{reaper, Exit, Node, NoOrphans, Orphans, Process, Tracer};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

#[derive(StructOpt, Debug)]
struct Opt {
    /// Only print the exit status of the leader.
    #[structopt(short, long)]
    quiet: bool,

    /// Log the live tracees after every step.
    #[structopt(short, long)]
    list: bool,

    /// Do not fork a reaper for orphaned tracees.
    #[structopt(long)]
    no_reaper: bool,

    /// Initial delay, in milliseconds, when waiting on orphan reports.
    #[structopt(long, parse(try_from_str = parse_millis))]
    poll_delay: Option<Duration>,

    #[structopt(min_values = 1)]
    argv: Vec<String>,
}

fn parse_millis(s: &str) -> Result<Duration> {
    Ok(Duration::from_millis(s.parse()?))
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Fork the reaper while still single-threaded.
    let code = if opt.no_reaper {
        run(&opt, NoOrphans)?
    } else {
        run(&opt, reaper::start()?)?
    };

    std::process::exit(code)
}

fn run(opt: &Opt, orphans: impl Orphans + 'static) -> Result<i32> {
    let mut tracer: Tracer<Node> = Tracer::new(orphans);

    if let Some(poll_delay) = opt.poll_delay {
        tracer.set_poll_delay(poll_delay);
    }

    let leader = tracer
        .start(&opt.argv[0], &opt.argv[1..])?
        .ok_or_else(|| anyhow!("a session is already active"))?;

    while tracer.step()? {
        if opt.list {
            tracer.print_list();
        }
    }

    let leader = leader.borrow();

    if !opt.quiet {
        print!("{}", leader.render());
    }

    eprintln!("{} {}", leader.command_line(), leader.state());

    let code = match leader.exit() {
        Some(Exit::Code(code)) => code,
        Some(Exit::Signal { signal, .. }) => 128 + signal.as_raw(),
        None => 1,
    };

    Ok(code)
}
