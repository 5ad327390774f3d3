//! Checkpoint-driven ingestion from a partitioned event stream.
//!
//! Events are read from a stream through a bounded pool of readers and emitted as records into a
//! transactional [`OutputSession`]. Output is only committed when the stream delivers a
//! checkpoint, so everything read after the last checkpoint is re-delivered if a reader dies.
//!
//! # Lease readers from a [`ConsumerPool`]
//!
//! The pool lends each reader to one [`ConsumerLease`] at a time and never holds more readers than
//! its configured ceiling. A lease drives the read loop and goes back to the pool when dropped;
//! leases that saw an error or a final checkpoint are poisoned and their reader is closed instead
//! of being reused.
//!
//! # Drive the pool with a [`StreamConsumer`]
//!
//! The [`StreamConsumer`] is the entry point a host scheduler invokes from its worker threads. It
//! creates the pool lazily, runs a lease for as long as it remains scheduled and closes the pool
//! when stopped.
use thiserror::Error;

pub mod consumer;
pub mod lease;
pub mod pool;
pub mod reader;
pub mod session;

pub use consumer::{StreamConsumer, TriggerOutcome};
pub use lease::{ConsumerLease, LeaseState, StepOutcome};
pub use pool::{ConsumerPool, DEFAULT_READ_TIMEOUT, PoolConfig, PoolStats};
pub use reader::{
    Checkpoint, CheckpointKind, CreateReaderError, Event, EventPointer, EventRead,
    EventStreamReader, FINAL_CHECKPOINT_PREFIX, ReaderError, ReaderFactory, ReaderGroupConfig,
    ReaderId,
};
pub use session::{OutputRecord, OutputSession, Relationship, SessionError};

#[derive(Debug, Error)]
pub enum Error {
    /// The pool could not create a reader. This is a configuration problem (bad controller
    /// address, missing stream) and is surfaced on every attempt until it is fixed.
    #[error("failed to create reader {reader_id}: {source}")]
    CreateReader {
        reader_id: ReaderId,
        #[source]
        source: CreateReaderError,
    },

    #[error("reader {reader_id} must be reinitialized: {reason}")]
    ReinitializationRequired { reader_id: ReaderId, reason: String },

    #[error("error reading from reader {reader_id}: {source}")]
    Read {
        reader_id: ReaderId,
        #[source]
        source: ReaderError,
    },

    #[error("failed to commit records at checkpoint {checkpoint} on reader {reader_id}: {source}")]
    Commit {
        reader_id: ReaderId,
        checkpoint: String,
        #[source]
        source: SessionError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
