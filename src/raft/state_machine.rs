//! Drives committed entries into a user state machine in index order,
//! maintaining the logical clock and session table the filter/apply
//! handlers depend on.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::encoding::bincode;
use crate::error::{Error, Result};
use crate::raft::log::Log;
use crate::raft::session::{SessionId, SessionTable};
use crate::raft::{Entry, Index, Term};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionPolicy {
    Minor,
    Major,
}

/// Metadata the runtime derives for a committed entry, handed to `apply`
/// and `filter` alongside the command's own payload.
#[derive(Clone, Copy, Debug)]
pub struct Commit {
    pub index: Index,
    pub term: Term,
    pub timestamp: i64,
    pub session: Option<SessionId>,
}

/// Context a filter is evaluated under. `compaction_index` is set only
/// during a major-compaction pass; minor compaction leaves it `None`.
#[derive(Clone, Copy, Debug)]
pub struct FilterContext {
    pub now: i64,
    pub commit_index: Index,
    pub compaction_index: Option<Index>,
    pub session_live: bool,
}

/// Context an `apply` call runs under: the logical clock and a liveness
/// lookup for *any* session, not just the one that issued the command being
/// applied. A handler needs this to judge a record it stored earlier under a
/// different session than the one making the current call -- e.g. a
/// `Contains` issued on a fresh connection observing an `Add` some other,
/// possibly now-dead session wrote.
#[derive(Clone, Copy)]
pub struct ApplyContext<'a> {
    pub now: i64,
    session_live: &'a dyn Fn(SessionId) -> bool,
}

impl ApplyContext<'_> {
    /// Whether `session` is currently live, as of this call.
    pub fn session_live(&self, session: SessionId) -> bool {
        (self.session_live)(session)
    }
}

impl std::fmt::Debug for ApplyContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyContext").field("now", &self.now).finish_non_exhaustive()
    }
}

/// Every command appended through [`Runtime`] is wrapped in this envelope
/// so the runtime can extract the originating session without the state
/// machine having to repeat that bookkeeping for every command type.
#[derive(Serialize, Deserialize)]
pub struct Envelope {
    pub session: Option<SessionId>,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn encode(session: Option<SessionId>, body: Vec<u8>) -> Vec<u8> {
        bincode::serialize(&Envelope { session, body })
    }
}

/// A user state machine, driven by [`Runtime`]. Implementations dispatch on
/// their own command encoding inside `apply`/`filter`/`policy` (see
/// [`crate::raft::demo::KvStateMachine`] for a worked example); the runtime
/// only ever hands them already-decoded commit metadata and a raw body.
pub trait StateMachine: Send {
    fn register(&mut self, session: SessionId);
    fn expire(&mut self, session: SessionId);
    fn close(&mut self, session: SessionId);

    /// Applies one committed command, returning its result. Errors are
    /// recorded and surfaced to the caller via [`Runtime::failures`]; they
    /// never halt the runtime. Successful results are surfaced via
    /// [`Runtime::results`].
    fn apply(&mut self, commit: &Commit, ctx: &ApplyContext, body: &[u8]) -> Result<Vec<u8>>;

    /// Pure: must not mutate state-machine data. Returning an error is
    /// treated as "keep" by the caller, conservatively.
    fn filter(&self, commit: &Commit, ctx: &FilterContext, body: &[u8]) -> Result<bool>;

    /// Compaction policy for a given command, inspected without fully
    /// decoding it if convenient.
    fn policy(&self, body: &[u8]) -> CompactionPolicy;
}

pub struct Runtime<S: StateMachine> {
    log: Arc<Log>,
    state_machine: Mutex<S>,
    sessions: Mutex<SessionTable>,
    time: AtomicI64,
    applied: AtomicU64,
    failures: Mutex<Vec<(Index, String)>>,
    results: Mutex<Vec<(Index, Vec<u8>)>>,
}

impl<S: StateMachine> Runtime<S> {
    pub fn new(log: Arc<Log>, state_machine: S) -> Self {
        Self {
            log,
            state_machine: Mutex::new(state_machine),
            sessions: Mutex::new(SessionTable::new()),
            time: AtomicI64::new(0),
            applied: AtomicU64::new(0),
            failures: Mutex::new(Vec::new()),
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn applied_index(&self) -> Index {
        self.applied.load(Ordering::SeqCst)
    }

    /// The logical clock: `max` of every commit timestamp observed so far.
    /// The only notion of "now" visible to state-machine logic.
    pub fn time(&self) -> i64 {
        self.time.load(Ordering::SeqCst)
    }

    pub fn session_live(&self, id: SessionId) -> bool {
        self.sessions.lock().unwrap().is_live(id)
    }

    /// Runs `f` against the state machine under its lock. Used by the
    /// compactor to invoke `filter`, which takes `&self` on the state
    /// machine but still needs the same synchronization as `apply` -- the
    /// mutex here stands in for the read barrier a real multi-threaded
    /// implementation would otherwise need between the two.
    pub fn with_state_machine<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.state_machine.lock().unwrap())
    }

    pub fn failures(&self) -> Vec<(Index, String)> {
        self.failures.lock().unwrap().clone()
    }

    /// Results of every successful `apply` call, oldest first. Mirrors
    /// [`Runtime::failures`] for the non-error outcome.
    pub fn results(&self) -> Vec<(Index, Vec<u8>)> {
        self.results.lock().unwrap().clone()
    }

    /// Reported by the external session-keepalive layer; fires `expire` on
    /// the state machine exactly when the session transitions.
    pub fn expire_session(&self, id: SessionId) {
        if self.sessions.lock().unwrap().expire(id) {
            self.state_machine.lock().unwrap().expire(id);
        }
    }

    pub fn close_session(&self, id: SessionId) {
        if self.sessions.lock().unwrap().close(id) {
            self.state_machine.lock().unwrap().close(id);
        }
    }

    /// Drains every newly committed entry into the state machine, in index
    /// order. Returns the number applied. Only a deserialization failure at
    /// or below `commitIndex` is fatal; apply handler errors are recorded
    /// and otherwise swallowed.
    pub fn poll(&self) -> Result<usize> {
        let commit_index = self.log.commit_index();
        let mut applied = self.applied.load(Ordering::SeqCst);
        let mut reader = self.log.reader(applied + 1);
        let mut n = 0;

        while applied < commit_index {
            let Some(result) = reader.next() else { break };
            let entry = result?;
            if entry.index > commit_index {
                break;
            }
            self.apply_entry(&entry)?;
            applied = entry.index;
            self.applied.store(applied, Ordering::SeqCst);
            n += 1;
        }
        Ok(n)
    }

    fn apply_entry(&self, entry: &Entry) -> Result<()> {
        self.time.fetch_max(entry.timestamp, Ordering::SeqCst);

        let envelope: Envelope = match bincode::deserialize(&entry.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                log::error!("fatal: committed entry {} failed to decode: {err}", entry.index);
                return Err(err);
            }
        };

        if let Some(session) = envelope.session {
            let first_seen = self.sessions.lock().unwrap().observe(session);
            if first_seen {
                self.state_machine.lock().unwrap().register(session);
            }
        }

        let commit =
            Commit { index: entry.index, term: entry.term, timestamp: entry.timestamp, session: envelope.session };
        let session_live = |id: SessionId| self.sessions.lock().unwrap().is_live(id);
        let ctx = ApplyContext { now: self.time(), session_live: &session_live };

        log::debug!("dispatching apply for committed index {}", entry.index);
        match self.state_machine.lock().unwrap().apply(&commit, &ctx, &envelope.body) {
            Ok(result) => self.results.lock().unwrap().push((entry.index, result)),
            Err(err) => {
                log::warn!("apply failed at index {}: {err}", entry.index);
                self.failures.lock().unwrap().push((entry.index, err.to_string()));
            }
        }
        Ok(())
    }

    /// Spawns a background thread that calls `poll` each time `wake` fires.
    pub fn spawn(self: Arc<Self>, wake: crossbeam::channel::Receiver<()>) -> std::thread::JoinHandle<()>
    where
        S: 'static,
    {
        std::thread::spawn(move || {
            for () in wake.iter() {
                if let Err(err) = self.poll() {
                    log::error!("apply runtime halted: {err}");
                    break;
                }
            }
        })
    }
}

impl<S: StateMachine> std::fmt::Debug for Runtime<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("applied_index", &self.applied_index())
            .field("time", &self.time())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::Config;

    struct CountingMachine {
        applied: Vec<i32>,
        registered: Vec<SessionId>,
    }

    #[derive(Serialize, Deserialize)]
    struct Add(i32);

    impl StateMachine for CountingMachine {
        fn register(&mut self, session: SessionId) {
            self.registered.push(session);
        }
        fn expire(&mut self, _session: SessionId) {}
        fn close(&mut self, _session: SessionId) {}

        fn apply(&mut self, _commit: &Commit, _ctx: &ApplyContext, body: &[u8]) -> Result<Vec<u8>> {
            let Add(value) = bincode::deserialize(body)?;
            self.applied.push(value);
            Ok(Vec::new())
        }

        fn filter(&self, _commit: &Commit, _ctx: &FilterContext, _body: &[u8]) -> Result<bool> {
            Ok(true)
        }

        fn policy(&self, _body: &[u8]) -> CompactionPolicy {
            CompactionPolicy::Minor
        }
    }

    fn open_log(dir: &TempDir) -> Arc<Log> {
        let config = Config { segment_size: u64::MAX, ..Config::default() };
        Arc::new(Log::open(dir.path(), &config).unwrap())
    }

    #[test]
    fn applies_commits_in_order_and_tracks_clock() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let machine = CountingMachine { applied: Vec::new(), registered: Vec::new() };
        let runtime = Runtime::new(Arc::clone(&log), machine);

        let writer = log.writer();
        for (i, value) in [10, 20, 30].into_iter().enumerate() {
            let payload = Envelope::encode(Some(1), bincode::serialize(&Add(value)));
            writer.append(1, 1_000 + i as i64, payload).unwrap();
        }
        writer.commit(3).unwrap();

        assert_eq!(runtime.poll().unwrap(), 3);
        assert_eq!(runtime.applied_index(), 3);
        assert_eq!(runtime.time(), 1002);
        assert!(runtime.failures().is_empty());
    }

    #[test]
    fn registers_session_once_on_first_commit() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let machine = CountingMachine { applied: Vec::new(), registered: Vec::new() };
        let runtime = Runtime::new(Arc::clone(&log), machine);

        let writer = log.writer();
        writer.append(1, 1, Envelope::encode(Some(7), bincode::serialize(&Add(1)))).unwrap();
        writer.append(1, 2, Envelope::encode(Some(7), bincode::serialize(&Add(2)))).unwrap();
        writer.commit(2).unwrap();
        runtime.poll().unwrap();

        assert!(runtime.session_live(7));
    }

    #[test]
    fn poll_only_applies_up_to_commit_index() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let machine = CountingMachine { applied: Vec::new(), registered: Vec::new() };
        let runtime = Runtime::new(Arc::clone(&log), machine);

        let writer = log.writer();
        writer.append(1, 1, Envelope::encode(None, bincode::serialize(&Add(1)))).unwrap();
        writer.append(1, 2, Envelope::encode(None, bincode::serialize(&Add(2)))).unwrap();
        writer.commit(1).unwrap();

        assert_eq!(runtime.poll().unwrap(), 1);
        assert_eq!(runtime.applied_index(), 1);
    }
}
