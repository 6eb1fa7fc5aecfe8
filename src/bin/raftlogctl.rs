//! Offline inspection and maintenance tool for a raftlog directory.
//!
//! `compact` runs against a trivial always-keep filter: it is a mechanism
//! demonstration, not a substitute for compacting through a live runtime,
//! which is the only place the real user state machine's filter semantics
//! are available.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use raftlog::config::Config;
use raftlog::error::Result;
use raftlog::raft::compactor::Compactor;
use raftlog::raft::log::Log;
use raftlog::raft::session::SessionId;
use raftlog::raft::state_machine::{ApplyContext, Commit, CompactionPolicy, Envelope, FilterContext, Runtime, StateMachine};

#[derive(Parser)]
#[command(name = "raftlogctl", about = "Inspect and maintain a raftlog directory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print firstIndex, lastIndex, commitIndex, and segment count.
    Status { dir: PathBuf },
    /// Print decoded entries in a range.
    Dump {
        dir: PathBuf,
        #[arg(long)]
        from: Option<u64>,
        #[arg(long)]
        to: Option<u64>,
    },
    /// Run one minor compaction pass with an always-keep filter.
    Compact { dir: PathBuf },
}

/// Keeps every entry it sees. Used only by `compact`, which has no live
/// user state machine to consult for real filter decisions.
struct AlwaysKeep;

impl StateMachine for AlwaysKeep {
    fn register(&mut self, _session: SessionId) {}
    fn expire(&mut self, _session: SessionId) {}
    fn close(&mut self, _session: SessionId) {}

    fn apply(&mut self, _commit: &Commit, _ctx: &ApplyContext, _body: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn filter(&self, _commit: &Commit, _ctx: &FilterContext, _body: &[u8]) -> Result<bool> {
        Ok(true)
    }

    fn policy(&self, _body: &[u8]) -> CompactionPolicy {
        CompactionPolicy::Minor
    }
}

fn main() {
    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
    .expect("failed to initialize logger");

    if let Err(err) = run(Cli::parse()) {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Status { dir } => status(&dir),
        Command::Dump { dir, from, to } => dump(&dir, from, to),
        Command::Compact { dir } => compact(&dir),
    }
}

fn status(dir: &std::path::Path) -> Result<()> {
    let config = Config { storage_dir: dir.to_path_buf(), ..Config::default() };
    let log = Log::open(dir, &config)?;
    println!("firstIndex:  {}", log.first_index());
    println!("lastIndex:   {}", log.last_index());
    println!("commitIndex: {}", log.commit_index());
    Ok(())
}

fn dump(dir: &std::path::Path, from: Option<u64>, to: Option<u64>) -> Result<()> {
    let config = Config { storage_dir: dir.to_path_buf(), ..Config::default() };
    let log = Log::open(dir, &config)?;
    let from = from.unwrap_or_else(|| log.first_index());
    let to = to.unwrap_or_else(|| log.last_index());

    for index in from..=to {
        match log.get(index) {
            Ok(entry) => match raftlog::encoding::bincode::deserialize::<Envelope>(&entry.payload) {
                Ok(envelope) => println!(
                    "{:>8}  term={:<6} ts={:<14} session={:<8} body_len={}",
                    entry.index,
                    entry.term,
                    entry.timestamp,
                    envelope.session.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                    envelope.body.len(),
                ),
                Err(_) => println!(
                    "{:>8}  term={:<6} ts={:<14} payload_len={}",
                    entry.index,
                    entry.term,
                    entry.timestamp,
                    entry.payload.len(),
                ),
            },
            Err(raftlog::error::Error::OutOfBounds(_)) => println!("{index:>8}  (absent, compacted or out of range)"),
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn compact(dir: &std::path::Path) -> Result<()> {
    let config = Config { storage_dir: dir.to_path_buf(), ..Config::default() };
    let log = Arc::new(Log::open(dir, &config)?);
    let runtime = Arc::new(Runtime::new(Arc::clone(&log), AlwaysKeep));
    let compactor = Compactor::new(
        Arc::clone(&log),
        runtime,
        config.compaction_minor_threshold,
        Duration::from_secs(0),
    );
    match compactor.run_minor()? {
        Some(id) => println!("compacted segment {id}"),
        None => println!("nothing to compact"),
    }
    Ok(())
}
