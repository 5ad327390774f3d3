//! The stream transport as seen by the consumer pool.
//!
//! A transport client is reduced to two traits: a [`ReaderFactory`] that can open a reader
//! within a reader group, and an [`EventStreamReader`] that performs bounded-timeout reads and
//! can be closed. Everything else the transport does (controller connections, segment
//! assignment, checkpoint injection) stays behind these traits.
use std::{
    fmt::{Debug, Display},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use thiserror::Error;
use url::Url;

/// Checkpoints whose name starts with this prefix signal that the reader group is being torn
/// down and that the reader which observed it must not be used again.
pub const FINAL_CHECKPOINT_PREFIX: &str = "final-";

/// Errors raised by a reader while reading or closing.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// The segment assignment of the reader changed underneath it; the reader has to be closed
    /// and a new one created in its place.
    #[error("reader must be reinitialized: {0}")]
    ReinitializationRequired(String),

    #[error("reader is closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors raised when a reader cannot be created. These are configuration problems from the
/// point of view of the pool and are never retried by it.
#[derive(Debug, Error)]
pub enum CreateReaderError {
    #[error("invalid controller address {controller}: {reason}")]
    InvalidController { controller: Url, reason: String },

    #[error("stream {scope}/{stream} does not exist")]
    StreamNotFound { scope: String, stream: String },

    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Identifies a reader within its reader group, rendered as `<reader-group>-<seq>`.
///
/// Sequence numbers are handed out by the pool and never reused, so a discarded reader's id is
/// never seen again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReaderId {
    reader_group: Arc<str>,
    seq: u64,
}

impl ReaderId {
    pub fn new(reader_group: Arc<str>, seq: u64) -> Self {
        Self { reader_group, seq }
    }

    pub fn reader_group(&self) -> &str {
        &self.reader_group
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Display for ReaderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.reader_group, self.seq)
    }
}

/// Where the readers of a pool read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderGroupConfig {
    pub controller: Url,
    pub scope: String,
    pub streams: Vec<String>,
    pub reader_group: String,
}

impl ReaderGroupConfig {
    /// The URI reported as the provenance source of every record read by the group.
    pub fn transit_uri(&self) -> String {
        format!(
            "{}/{}/{}",
            self.controller.as_str().trim_end_matches('/'),
            self.scope,
            self.streams.join(",")
        )
    }
}

/// Creates readers for a reader group.
pub trait ReaderFactory: Debug + Send + Sync + 'static {
    /// Open a new reader named `reader_id` in the group described by `group`.
    fn create_reader(
        &self,
        reader_id: &ReaderId,
        group: &ReaderGroupConfig,
    ) -> Result<Arc<dyn EventStreamReader>, CreateReaderError>;
}

/// A single reader of a partitioned stream.
///
/// Readers are shared with the pool so that it can close them on shutdown, but only the lease
/// holding a reader ever reads from it. A reader closed from under its lease must fail the next
/// read rather than block.
pub trait EventStreamReader: Debug + Send + Sync + 'static {
    /// Block for at most `timeout` waiting for the next event or checkpoint.
    fn read_next_event(&self, timeout: Duration) -> Result<EventRead, ReaderError>;

    /// Close the reader. Closing an already closed reader is not an error.
    fn close(&self) -> Result<(), ReaderError>;
}

/// The result of one bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRead {
    Event(Event),
    Checkpoint(Checkpoint),
    /// Nothing arrived within the timeout.
    Timeout,
}

impl EventRead {
    pub fn event(payload: impl Into<Bytes>, pointer: impl Into<String>) -> Self {
        Self::Event(Event::new(payload, pointer))
    }

    pub fn checkpoint(name: impl Into<String>) -> Self {
        Self::Checkpoint(Checkpoint::new(name))
    }
}

/// A data event together with the position it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    payload: Bytes,
    pointer: EventPointer,
}

impl Event {
    pub fn new(payload: impl Into<Bytes>, pointer: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            pointer: EventPointer(pointer.into()),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn pointer(&self) -> &EventPointer {
        &self.pointer
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Event(size={}, pointer={})",
            self.payload.len(),
            self.pointer
        )
    }
}

/// Opaque, durable position of an event in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventPointer(String);

impl EventPointer {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EventPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointKind {
    /// A routine checkpoint: commit what was read so far and keep going.
    Periodic,
    /// The reader group is going away: commit and stop using this reader.
    Final,
}

/// An in-band checkpoint marker. The kind is derived from the name once, on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    name: String,
    kind: CheckpointKind,
}

impl Checkpoint {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let kind = if name.starts_with(FINAL_CHECKPOINT_PREFIX) {
            CheckpointKind::Final
        } else {
            CheckpointKind::Periodic
        };
        Self { name, kind }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CheckpointKind {
        self.kind
    }

    pub fn is_final(&self) -> bool {
        matches!(self.kind, CheckpointKind::Final)
    }
}

impl Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_kind_from_name() {
        assert_eq!(Checkpoint::new("cp-1").kind(), CheckpointKind::Periodic);
        assert_eq!(Checkpoint::new("final-cp-2").kind(), CheckpointKind::Final);
        assert!(Checkpoint::new("final-").is_final());
        // the prefix is case sensitive and must lead the name
        assert!(!Checkpoint::new("FINAL-cp").is_final());
        assert!(!Checkpoint::new("cp-final-3").is_final());
        assert!(!Checkpoint::new("").is_final());
    }

    #[test]
    fn reader_id_display() {
        let id = ReaderId::new("sensors-rg".into(), 7);
        assert_eq!(id.to_string(), "sensors-rg-7");
        assert_eq!(id.reader_group(), "sensors-rg");
        assert_eq!(id.seq(), 7);
    }

    #[test]
    fn event_display() {
        let event = Event::new(&b"hello"[..], "segment-0@42");
        assert_eq!(event.to_string(), "Event(size=5, pointer=segment-0@42)");
    }

    #[test]
    fn transit_uri() {
        let group = ReaderGroupConfig {
            controller: Url::parse("tcp://localhost:9090").unwrap(),
            scope: "examples".to_string(),
            streams: vec!["sensors".to_string(), "logs".to_string()],
            reader_group: "examples-sensors-reader-group".to_string(),
        };
        assert_eq!(group.transit_uri(), "tcp://localhost:9090/examples/sensors,logs");

        let group = ReaderGroupConfig {
            controller: Url::parse("http://controller:9090/").unwrap(),
            streams: vec!["sensors".to_string()],
            ..group
        };
        assert_eq!(group.transit_uri(), "http://controller:9090/examples/sensors");
    }
}
