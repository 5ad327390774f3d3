//! A bounded pool of stream readers.
use std::{collections::HashMap, num::NonZeroUsize, sync::Arc, time::Duration};

use tracing::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    Error, Result,
    lease::ConsumerLease,
    reader::{EventStreamReader, ReaderFactory, ReaderGroupConfig, ReaderId},
    session::OutputSession,
};

/// How long a single read blocks when no other timeout is configured.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub group: ReaderGroupConfig,
    /// The most readers the pool will have in existence at once, idle and leased together.
    pub max_leases: NonZeroUsize,
    /// How long records may stay uncommitted before offsets should be committed. This is a
    /// pacing hint for whoever injects checkpoints; the read loop itself only commits at
    /// checkpoints.
    pub max_uncommitted_time: Duration,
    /// Upper bound on how long a single read blocks.
    pub read_timeout: Duration,
}

impl PoolConfig {
    pub fn new(group: ReaderGroupConfig, max_leases: NonZeroUsize) -> Self {
        Self {
            group,
            max_leases,
            max_uncommitted_time: Duration::from_secs(1),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_max_uncommitted_time(self, max_uncommitted_time: Duration) -> Self {
        Self {
            max_uncommitted_time,
            ..self
        }
    }

    pub fn with_read_timeout(self, read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            ..self
        }
    }
}

/// A point-in-time view of the pool bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    /// Readers created over the lifetime of the pool.
    pub created: u64,
    /// Readers closed because their lease was poisoned.
    pub discarded: u64,
}

/// A reader owned by the pool, or by the one lease it is lent to.
#[derive(Debug)]
pub(crate) struct ReaderHandle {
    pub(crate) id: ReaderId,
    pub(crate) reader: Arc<dyn EventStreamReader>,
}

impl ReaderHandle {
    fn close(&self) {
        close_reader(&self.id, self.reader.as_ref());
    }
}

fn close_reader(id: &ReaderId, reader: &dyn EventStreamReader) {
    match reader.close() {
        Ok(()) => debug!(reader_id = %id, "closed reader"),
        Err(error) => warn!(reader_id = %id, %error, "failed to close reader"),
    }
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<ReaderHandle>,
    /// Readers currently lent out. The pool keeps its own reference so it can close them on
    /// shutdown.
    leased: HashMap<ReaderId, Arc<dyn EventStreamReader>>,
    /// Slots reserved by callers that are creating a reader outside the lock.
    creating: usize,
    next_seq: u64,
    created: u64,
    discarded: u64,
    closed: bool,
}

impl PoolState {
    fn outstanding(&self) -> usize {
        self.idle.len() + self.leased.len() + self.creating
    }
}

/// Lends stream readers to [`ConsumerLease`]s.
///
/// Readers are created lazily, one per lease that finds no idle reader, until the pool holds
/// `max_leases` of them. Each reader is lent to at most one lease at a time; readers of
/// poisoned leases are closed and leave room for a replacement.
#[derive(Debug)]
pub struct ConsumerPool {
    factory: Arc<dyn ReaderFactory>,
    config: PoolConfig,
    reader_group: Arc<str>,
    transit_uri: Arc<str>,
    state: Mutex<PoolState>,
}

impl ConsumerPool {
    pub fn new(factory: Arc<dyn ReaderFactory>, config: PoolConfig) -> Self {
        info!(
            controller = %config.group.controller,
            scope = %config.group.scope,
            streams = ?config.group.streams,
            reader_group = %config.group.reader_group,
            max_leases = config.max_leases.get(),
            max_uncommitted_time = ?config.max_uncommitted_time,
            "creating consumer pool"
        );
        Self {
            reader_group: config.group.reader_group.as_str().into(),
            transit_uri: config.group.transit_uri().into(),
            factory,
            config,
            state: Default::default(),
        }
    }

    /// Lease a reader bound to `session`.
    ///
    /// Idle readers are reused first; otherwise a new reader is created if the pool is below its
    /// ceiling. Returns `Ok(None)` when the ceiling is reached with no reader idle, or when the
    /// pool has been closed; callers should back off and try again later.
    ///
    /// Reader creation failures are returned as [`Error::CreateReader`] and are not retried.
    pub fn obtain<S: OutputSession>(&self, session: S) -> Result<Option<ConsumerLease<'_, S>>> {
        let reader_id = {
            let mut state = self.state.lock();
            if state.closed {
                debug!("consumer pool is closed, no lease available");
                return Ok(None);
            }
            if let Some(handle) = state.idle.pop() {
                state
                    .leased
                    .insert(handle.id.clone(), Arc::clone(&handle.reader));
                debug!(reader_id = %handle.id, "leasing idle reader");
                return Ok(Some(ConsumerLease::new(self, handle, session)));
            }
            if state.outstanding() >= self.config.max_leases.get() {
                debug!(
                    max_leases = self.config.max_leases.get(),
                    "all readers are leased"
                );
                return Ok(None);
            }
            state.creating += 1;
            state.next_seq += 1;
            ReaderId::new(Arc::clone(&self.reader_group), state.next_seq)
        };

        // the slot is reserved, so the reader can be created without holding the lock
        let created = self.factory.create_reader(&reader_id, &self.config.group);

        let mut state = self.state.lock();
        state.creating -= 1;
        let reader = match created {
            Ok(reader) => reader,
            Err(source) => return Err(Error::CreateReader { reader_id, source }),
        };
        if state.closed {
            drop(state);
            debug!(reader_id = %reader_id, "consumer pool closed while creating reader");
            close_reader(&reader_id, reader.as_ref());
            return Ok(None);
        }
        state.created += 1;
        state.leased.insert(reader_id.clone(), Arc::clone(&reader));
        drop(state);

        info!(reader_id = %reader_id, "created reader");
        let handle = ReaderHandle {
            id: reader_id,
            reader,
        };
        Ok(Some(ConsumerLease::new(self, handle, session)))
    }

    /// Give a lease back to the pool.
    ///
    /// This is the same as dropping the lease: the reader returns to the idle set, or is closed
    /// if the lease was poisoned.
    pub fn release<S: OutputSession>(&self, lease: ConsumerLease<'_, S>) {
        drop(lease);
    }

    /// Close every reader, idle and leased, and refuse further leases.
    ///
    /// Leases still outstanding keep their handle, but the reader underneath is closed, so
    /// their next read fails and poisons them. Calling `close` more than once is a no-op.
    pub fn close(&self) {
        let (idle, leased) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.leased),
            )
        };
        info!(
            idle = idle.len(),
            leased = leased.len(),
            "closing consumer pool"
        );
        for handle in idle {
            handle.close();
        }
        for (id, reader) in leased {
            close_reader(&id, reader.as_ref());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            leased: state.leased.len(),
            created: state.created,
            discarded: state.discarded,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn max_uncommitted_time(&self) -> Duration {
        self.config.max_uncommitted_time
    }

    pub(crate) fn read_timeout(&self) -> Duration {
        self.config.read_timeout
    }

    pub(crate) fn transit_uri(&self) -> &Arc<str> {
        &self.transit_uri
    }

    /// Take a reader back from a lease that is done with it.
    pub(crate) fn return_handle(&self, handle: ReaderHandle, poisoned: bool) {
        let mut state = self.state.lock();
        // a pool closed while the reader was out has already closed it
        let tracked = state.leased.remove(&handle.id).is_some();
        if poisoned || state.closed {
            if poisoned {
                state.discarded += 1;
            }
            drop(state);
            if tracked {
                if poisoned {
                    warn!(reader_id = %handle.id, "discarding poisoned reader");
                }
                handle.close();
            }
            return;
        }
        debug!(reader_id = %handle.id, "reader returned to pool");
        state.idle.push(handle);
    }
}

impl Drop for ConsumerPool {
    fn drop(&mut self) {
        self.close();
    }
}
