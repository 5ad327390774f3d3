//! In-memory stand-ins for the stream transport and the output session, for tests.
use std::{collections::VecDeque, num::NonZeroUsize, sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use stream_ingest::{
    CreateReaderError, EventRead, EventStreamReader, OutputRecord, OutputSession, PoolConfig,
    ReaderError, ReaderFactory, ReaderGroupConfig, ReaderId, Relationship, SessionError,
};
use url::Url;

pub type ReadResult = Result<EventRead, ReaderError>;

/// A reader group config pointing at a local controller, reading `examples/sensors`.
pub fn reader_group_config() -> ReaderGroupConfig {
    ReaderGroupConfig {
        controller: Url::parse("tcp://localhost:9090").expect("valid url"),
        scope: "examples".to_string(),
        streams: vec!["sensors".to_string()],
        reader_group: "examples-sensors-reader-group".to_string(),
    }
}

/// A pool config with the given ceiling and a short read timeout.
pub fn pool_config(max_leases: usize) -> PoolConfig {
    PoolConfig::new(
        reader_group_config(),
        NonZeroUsize::new(max_leases).expect("max_leases must be non-zero"),
    )
    .with_read_timeout(Duration::from_millis(5))
}

pub fn event(payload: &'static str, pointer: &str) -> ReadResult {
    Ok(EventRead::event(Bytes::from_static(payload.as_bytes()), pointer))
}

pub fn checkpoint(name: &str) -> ReadResult {
    Ok(EventRead::checkpoint(name))
}

pub fn timeout() -> ReadResult {
    Ok(EventRead::Timeout)
}

pub fn reinitialization_required(reason: &str) -> ReadResult {
    Err(ReaderError::ReinitializationRequired(reason.to_string()))
}

pub fn transport_error(message: &str) -> ReadResult {
    Err(ReaderError::Transport(message.to_string().into()))
}

/// A reader that plays back a script of read results.
///
/// Once the script runs out every read sleeps for its timeout and reports a timeout. Reads on a
/// closed reader fail with [`ReaderError::Closed`].
#[derive(Debug, Default)]
pub struct ScriptedReader {
    state: Mutex<ScriptedReaderState>,
}

#[derive(Debug, Default)]
struct ScriptedReaderState {
    script: VecDeque<ReadResult>,
    read_timeouts: Vec<Duration>,
    closed: bool,
    close_calls: usize,
}

impl ScriptedReader {
    pub fn new(script: impl IntoIterator<Item = ReadResult>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ScriptedReaderState {
                script: script.into_iter().collect(),
                ..Default::default()
            }),
        })
    }

    /// Append results to the script.
    pub fn extend(&self, results: impl IntoIterator<Item = ReadResult>) {
        self.state.lock().script.extend(results);
    }

    /// The timeout passed to every read so far, in order.
    pub fn read_timeouts(&self) -> Vec<Duration> {
        self.state.lock().read_timeouts.clone()
    }

    pub fn reads(&self) -> usize {
        self.state.lock().read_timeouts.len()
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().script.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }
}

impl EventStreamReader for ScriptedReader {
    fn read_next_event(&self, timeout: Duration) -> Result<EventRead, ReaderError> {
        let next = {
            let mut state = self.state.lock();
            state.read_timeouts.push(timeout);
            if state.closed {
                return Err(ReaderError::Closed);
            }
            state.script.pop_front()
        };
        match next {
            Some(result) => result,
            None => {
                std::thread::sleep(timeout);
                Ok(EventRead::Timeout)
            }
        }
    }

    fn close(&self) -> Result<(), ReaderError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.close_calls += 1;
        Ok(())
    }
}

/// Hands out [`ScriptedReader`]s.
///
/// Planned readers and creation errors are handed out in the order they were pushed; once those
/// run out, every reader created has an empty script. When a stream is marked missing every
/// creation fails with [`CreateReaderError::StreamNotFound`].
#[derive(Debug, Default)]
pub struct ScriptedReaderFactory {
    state: Mutex<ScriptedReaderFactoryState>,
}

#[derive(Debug, Default)]
struct ScriptedReaderFactoryState {
    planned: VecDeque<Result<Arc<ScriptedReader>, CreateReaderError>>,
    created: Vec<(ReaderId, Arc<ScriptedReader>)>,
    missing_stream: bool,
    attempts: usize,
}

impl ScriptedReaderFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Use `reader` for the next reader created.
    pub fn push_reader(&self, reader: Arc<ScriptedReader>) {
        self.state.lock().planned.push_back(Ok(reader));
    }

    /// Fail the next creation with `error`.
    pub fn push_error(&self, error: CreateReaderError) {
        self.state.lock().planned.push_back(Err(error));
    }

    pub fn set_stream_missing(&self, missing: bool) {
        self.state.lock().missing_stream = missing;
    }

    /// Every reader created so far, in creation order.
    pub fn created(&self) -> Vec<(ReaderId, Arc<ScriptedReader>)> {
        self.state.lock().created.clone()
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().created.len()
    }

    /// Creation attempts so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    pub fn reader(&self, reader_id: &ReaderId) -> Option<Arc<ScriptedReader>> {
        self.state
            .lock()
            .created
            .iter()
            .find(|(id, _)| id == reader_id)
            .map(|(_, reader)| Arc::clone(reader))
    }
}

impl ReaderFactory for ScriptedReaderFactory {
    fn create_reader(
        &self,
        reader_id: &ReaderId,
        group: &ReaderGroupConfig,
    ) -> Result<Arc<dyn EventStreamReader>, CreateReaderError> {
        let mut state = self.state.lock();
        state.attempts += 1;
        if state.missing_stream {
            return Err(CreateReaderError::StreamNotFound {
                scope: group.scope.clone(),
                stream: group.streams.first().cloned().unwrap_or_default(),
            });
        }
        let reader = match state.planned.pop_front() {
            Some(planned) => planned?,
            None => ScriptedReader::new([]),
        };
        state.created.push((reader_id.clone(), Arc::clone(&reader)));
        Ok(reader)
    }
}

/// A session that keeps everything it is given, shared between clones.
///
/// Tests hand one clone to the lease and keep another to inspect what was transferred and
/// committed.
#[derive(Debug, Clone, Default)]
pub struct RecordingSession {
    inner: Arc<Mutex<RecordingSessionState>>,
}

#[derive(Debug, Default)]
struct RecordingSessionState {
    next_id: u64,
    pending: Vec<(OutputRecord, Relationship)>,
    committed: Vec<(OutputRecord, Relationship)>,
    provenance: Vec<(u64, String)>,
    commits: usize,
    rollbacks: usize,
    rolled_back_records: usize,
    fail_commits: bool,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following commit fail.
    pub fn fail_commits(&self) {
        self.inner.lock().fail_commits = true;
    }

    pub fn committed(&self) -> Vec<OutputRecord> {
        self.inner
            .lock()
            .committed
            .iter()
            .map(|(record, _)| record.clone())
            .collect()
    }

    /// Committed record contents as strings, in commit order.
    pub fn committed_payloads(&self) -> Vec<String> {
        self.inner
            .lock()
            .committed
            .iter()
            .map(|(record, _)| String::from_utf8_lossy(record.content()).into_owned())
            .collect()
    }

    pub fn committed_relationships(&self) -> Vec<Relationship> {
        self.inner
            .lock()
            .committed
            .iter()
            .map(|(_, relationship)| *relationship)
            .collect()
    }

    /// Records transferred but not yet committed.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Records transferred over the life of the session, committed or not.
    pub fn transferred(&self) -> usize {
        let state = self.inner.lock();
        state.pending.len() + state.committed.len() + state.rolled_back_records
    }

    pub fn commits(&self) -> usize {
        self.inner.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.inner.lock().rollbacks
    }

    pub fn rolled_back_records(&self) -> usize {
        self.inner.lock().rolled_back_records
    }

    /// `(record id, transit uri)` for every provenance receive event.
    pub fn provenance(&self) -> Vec<(u64, String)> {
        self.inner.lock().provenance.clone()
    }
}

impl OutputSession for RecordingSession {
    fn create(&mut self) -> OutputRecord {
        let mut state = self.inner.lock();
        state.next_id += 1;
        OutputRecord::new(state.next_id)
    }

    fn receive(&mut self, record: &OutputRecord, transit_uri: &str) {
        self.inner
            .lock()
            .provenance
            .push((record.id(), transit_uri.to_string()));
    }

    fn transfer(&mut self, record: OutputRecord, relationship: Relationship) {
        self.inner.lock().pending.push((record, relationship));
    }

    fn commit(&mut self) -> Result<(), SessionError> {
        let mut state = self.inner.lock();
        if state.fail_commits {
            return Err(SessionError::CommitFailed {
                reason: "sink unavailable".to_string(),
            });
        }
        let pending = std::mem::take(&mut state.pending);
        state.committed.extend(pending);
        state.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) {
        let mut state = self.inner.lock();
        let dropped = std::mem::take(&mut state.pending).len();
        state.rolled_back_records += dropped;
        state.rollbacks += 1;
    }
}
