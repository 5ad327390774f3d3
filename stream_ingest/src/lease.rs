//! The checkpoint-bounded read loop run over a leased reader.
use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    Error, Result,
    pool::{ConsumerPool, ReaderHandle},
    reader::{Checkpoint, Event, EventRead, ReaderError, ReaderId},
    session::{
        Attributes, EVENT_ATTRIBUTE, EVENT_POINTER_ATTRIBUTE, OutputSession, Relationship,
    },
};

/// Where a lease stands after its most recent read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Reading; the last read returned an event or nothing has been read yet.
    Running,
    /// The last read timed out.
    IdleTimeout,
    /// The last read was a periodic checkpoint and the session was committed.
    CheckpointCommit,
    /// A final checkpoint was committed. The lease is poisoned and reads no more.
    Final,
    /// A read or commit failed. The lease is poisoned and reads no more.
    Error,
}

impl LeaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final | Self::Error)
    }
}

/// Whether the caller should keep calling [`ConsumerLease::read_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Stop,
}

/// Exclusive use of one pooled reader, bound to one output session.
///
/// A lease is used from a single thread and is returned to the pool that issued it when dropped,
/// on every exit path. If it was poisoned along the way, its reader is closed rather than reused.
/// Records transferred since the last checkpoint are rolled back when the lease ends and the
/// lease counts as poisoned: its reader has moved past those events, so only a fresh reader
/// starting from the last checkpoint will deliver them again.
#[derive(Debug)]
pub struct ConsumerLease<'a, S: OutputSession> {
    pool: &'a ConsumerPool,
    handle: Option<ReaderHandle>,
    reader_id: ReaderId,
    session: S,
    read_timeout: Duration,
    transit_uri: Arc<str>,
    state: LeaseState,
    /// Records transferred to the session since its last commit.
    uncommitted: usize,
    poisoned: bool,
    received_final_checkpoint: bool,
}

impl<'a, S: OutputSession> ConsumerLease<'a, S> {
    pub(crate) fn new(pool: &'a ConsumerPool, handle: ReaderHandle, session: S) -> Self {
        Self {
            pool,
            reader_id: handle.id.clone(),
            handle: Some(handle),
            session,
            read_timeout: pool.read_timeout(),
            transit_uri: Arc::clone(pool.transit_uri()),
            state: LeaseState::Running,
            uncommitted: 0,
            poisoned: false,
            received_final_checkpoint: false,
        }
    }

    /// Perform one bounded read and act on its result.
    ///
    /// | read result         | action                                              |
    /// |---------------------|-----------------------------------------------------|
    /// | timeout             | nothing                                             |
    /// | event               | transfer one record, no commit                      |
    /// | periodic checkpoint | commit the session                                  |
    /// | final checkpoint    | commit, acknowledge with a zero-timeout read, stop  |
    /// | error               | poison and return the error                         |
    ///
    /// Once the lease has stopped, further calls return [`StepOutcome::Stop`] without reading.
    pub fn read_step(&mut self) -> Result<StepOutcome> {
        let state = self.step()?;
        Ok(if state.is_terminal() {
            StepOutcome::Stop
        } else {
            StepOutcome::Continue
        })
    }

    /// Call [`read_step`](Self::read_step) until a checkpoint has been committed, the lease
    /// stops, or `is_scheduled` returns false.
    ///
    /// `is_scheduled` is only polled between reads, so a stop request can take up to one read
    /// timeout to be noticed.
    pub fn run_until_checkpoint(&mut self, is_scheduled: impl Fn() -> bool) -> Result<StepOutcome> {
        while is_scheduled() {
            match self.step()? {
                LeaseState::CheckpointCommit => return Ok(StepOutcome::Continue),
                state if state.is_terminal() => return Ok(StepOutcome::Stop),
                _ => {}
            }
        }
        Ok(StepOutcome::Continue)
    }

    fn step(&mut self) -> Result<LeaseState> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }
        let Some(reader) = self.handle.as_ref().map(|h| Arc::clone(&h.reader)) else {
            return Ok(self.state);
        };

        let state = match reader.read_next_event(self.read_timeout) {
            Ok(EventRead::Timeout) => {
                info!(reader_id = %self.reader_id, "timeout waiting for next event");
                LeaseState::IdleTimeout
            }
            Ok(EventRead::Event(event)) => {
                self.emit(&event);
                LeaseState::Running
            }
            Ok(EventRead::Checkpoint(checkpoint)) => {
                self.commit(&checkpoint)?;
                if checkpoint.is_final() {
                    info!(
                        reader_id = %self.reader_id,
                        checkpoint = %checkpoint,
                        "received final checkpoint"
                    );
                    self.received_final_checkpoint = true;
                    // acknowledge the checkpoint to the transport before the reader is closed
                    if let Err(error) = reader.read_next_event(Duration::ZERO) {
                        debug!(
                            reader_id = %self.reader_id,
                            %error,
                            "read after final checkpoint failed"
                        );
                    }
                    self.poison();
                    LeaseState::Final
                } else {
                    debug!(
                        reader_id = %self.reader_id,
                        checkpoint = %checkpoint,
                        "committed at checkpoint"
                    );
                    LeaseState::CheckpointCommit
                }
            }
            Err(ReaderError::ReinitializationRequired(reason)) => {
                self.fail();
                return Err(Error::ReinitializationRequired {
                    reader_id: self.reader_id.clone(),
                    reason,
                });
            }
            Err(source) => {
                self.fail();
                return Err(Error::Read {
                    reader_id: self.reader_id.clone(),
                    source,
                });
            }
        };
        self.state = state;
        Ok(state)
    }

    fn emit(&mut self, event: &Event) {
        debug!(
            reader_id = %self.reader_id,
            size = event.payload().len(),
            pointer = %event.pointer(),
            "writing event"
        );
        let mut record = self.session.create();
        self.session.write(&mut record, event.payload().clone());
        self.session.put_attributes(&mut record, event_attributes(event));
        self.session.receive(&record, &self.transit_uri);
        self.session.transfer(record, Relationship::Success);
        self.uncommitted += 1;
    }

    fn commit(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        if let Err(source) = self.session.commit() {
            self.fail();
            return Err(Error::Commit {
                reader_id: self.reader_id.clone(),
                checkpoint: checkpoint.name().to_string(),
                source,
            });
        }
        self.uncommitted = 0;
        Ok(())
    }

    fn fail(&mut self) {
        self.state = LeaseState::Error;
        self.poison();
    }

    fn poison(&mut self) {
        self.poisoned = true;
    }

    /// True once the reader must not go back to the pool.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn received_final_checkpoint(&self) -> bool {
        self.received_final_checkpoint
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    pub fn reader_id(&self) -> &ReaderId {
        &self.reader_id
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Records transferred since the last commit.
    pub fn uncommitted(&self) -> usize {
        self.uncommitted
    }

    fn finish(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if self.uncommitted > 0 {
            warn!(
                reader_id = %self.reader_id,
                uncommitted = self.uncommitted,
                "rolling back records read since the last checkpoint"
            );
            self.session.rollback();
            self.uncommitted = 0;
            self.poison();
        }
        self.pool.return_handle(handle, self.poisoned);
    }
}

impl<S: OutputSession> Drop for ConsumerLease<'_, S> {
    fn drop(&mut self) {
        self.finish();
    }
}

fn event_attributes(event: &Event) -> Attributes {
    Attributes::from([
        (EVENT_ATTRIBUTE.to_string(), event.to_string()),
        (EVENT_POINTER_ATTRIBUTE.to_string(), event.pointer().to_string()),
    ])
}
