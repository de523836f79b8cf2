mod args;

use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, Level};

use crate::args::Args;
use distmaster::transport::{protocol_init, Config};
use distmaster::{CommandLog, LogSink};

/// How long `get_replies` waits, once at least one reply has arrived,
/// before giving up on the stragglers for a single driven command.
const REPLY_DEADLINE: Duration = Duration::from_secs(5);

fn main() -> ExitCode {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt().with_max_level(Level::TRACE).init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        }
    }
}

/// Drives the protocol core from stdin: each line is published as a fresh
/// command (`word` is the first whitespace-separated token, the rest is
/// `args`), the move number is simply the input line's index. This is a
/// minimal stand-in for the application logic that decides which commands
/// to issue, which is out of scope for this crate.
fn run(args: Args) -> Result<()> {
    let log_state = Arc::new(CommandLog::default());
    let log = Arc::new(LogSink::stderr(args.debug_level));

    let config = Config {
        listen: args.listen,
        slave_port: args.slave_port,
        proxy_port: args.proxy_port,
        max_slaves: args.max_slaves,
    };
    let pool = protocol_init(config, Arc::clone(&log_state), Arc::clone(&log))?;
    info!(
        slave_workers = pool.slave_workers.len(),
        proxy_workers = pool.proxy_workers.len(),
        "protocol core running"
    );

    let stdin = io::stdin();
    for (moves, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));

        let mut guard = log_state.protocol_lock();
        guard.new_cmd(word, rest, moves as i64);
        let deadline = Instant::now() + REPLY_DEADLINE;
        let collected = guard.get_replies(deadline, &log, None);
        let replies: Vec<Vec<u8>> = guard.replies().to_vec();
        guard.unlock();

        let stdout = io::stdout();
        let mut out = stdout.lock();
        let _ = writeln!(out, "-- {collected} replies to {word} --");
        for reply in &replies {
            let _ = out.write_all(reply);
        }
    }

    Ok(())
}
