//! The transactional output session records are emitted into.
use std::{collections::BTreeMap, fmt::Debug};

use bytes::Bytes;
use thiserror::Error;

/// Attribute name carrying a description of the event a record was built from.
pub const EVENT_ATTRIBUTE: &str = "stream.event";
/// Attribute name carrying the durable pointer of the event a record was built from.
pub const EVENT_POINTER_ATTRIBUTE: &str = "stream.event.pointer";

pub type Attributes = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to commit session: {reason}")]
    CommitFailed { reason: String },
}

/// Outcome channels records can be transferred to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relationship {
    /// Records received from the stream.
    Success,
}

impl Relationship {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "success",
        }
    }
}

/// A record created by an [`OutputSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    id: u64,
    content: Bytes,
    attributes: Attributes,
}

impl OutputRecord {
    /// Create an empty record. Sessions assign the id.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            content: Bytes::new(),
            attributes: Attributes::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// A transactional sink session.
///
/// Transferred records are buffered by the session until [`commit`](Self::commit) makes them
/// durable or [`rollback`](Self::rollback) drops them. A session is owned by exactly one lease.
pub trait OutputSession: Debug + Send {
    /// Create a new, empty record owned by this session.
    fn create(&mut self) -> OutputRecord;

    /// Replace the content of `record`.
    fn write(&mut self, record: &mut OutputRecord, content: Bytes) {
        record.content = content;
    }

    /// Add `attributes` to `record`, overwriting existing keys.
    fn put_attributes(&mut self, record: &mut OutputRecord, attributes: Attributes) {
        record.attributes.extend(attributes);
    }

    /// Report that `record` was received from `transit_uri`.
    fn receive(&mut self, record: &OutputRecord, transit_uri: &str);

    /// Route `record` to `relationship`. The record is not durable until the next commit.
    fn transfer(&mut self, record: OutputRecord, relationship: Relationship);

    fn commit(&mut self) -> Result<(), SessionError>;

    fn rollback(&mut self);
}
