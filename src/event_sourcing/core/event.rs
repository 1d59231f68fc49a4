use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::Utc;
use std::fmt;

use crate::error::{Result, StoreError};

// ============================================================================
// Event Model - Rows, Commits and Streams
// ============================================================================
//
// A revision of an aggregate is persisted as a set of rows sharing
// (aggregate_id, revision). Private events occupy positions 0..N-1, public
// events start at PUBLIC_EVENTS_OFFSET. Positions in between stay empty so the
// private count can grow without renumbering public events.
//
// ============================================================================

/// First position used by public events within a revision.
pub const PUBLIC_EVENTS_OFFSET: i32 = 5;

/// Length in bytes of an aggregate key.
pub const AGGREGATE_ID_LEN: usize = 16;

/// Current time as stored in the `ts` columns (milliseconds since epoch).
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// Contracts
// ============================================================================

/// A message or event type with a stable, statically declared identifier.
///
/// The identifier is what the type index and the message counter key on, so
/// it must never change once data has been written with it.
pub trait Contract {
    const CONTRACT_ID: &'static str;
}

/// An event that can be stored in aggregate commits.
///
/// Event enums report the contract identifier of the active variant.
pub trait DomainEvent: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static {
    fn contract_id(&self) -> &'static str;
}

// ============================================================================
// Aggregate Identity
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateId([u8; AGGREGATE_ID_LEN]);

impl AggregateId {
    pub const fn new(bytes: [u8; AGGREGATE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; AGGREGATE_ID_LEN] = bytes.try_into().map_err(|_| {
            StoreError::InvalidConfiguration(format!(
                "aggregate id must be {} bytes, got {}",
                AGGREGATE_ID_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Uuid> for AggregateId {
    fn from(id: Uuid) -> Self {
        Self(*id.as_bytes())
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AggregateId({})", self)
    }
}

// ============================================================================
// Rows and Commits
// ============================================================================

/// One stored row: an event payload that has not been deserialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEvent {
    pub aggregate_id: AggregateId,
    pub revision: i32,
    pub position: i32,
    pub timestamp: i64,
    pub data: Vec<u8>,
}

impl RawEvent {
    pub fn is_public(&self) -> bool {
        self.position >= PUBLIC_EVENTS_OFFSET
    }
}

/// All events produced by one revision transition of an aggregate.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateCommit<E> {
    pub aggregate_id: AggregateId,
    pub revision: i32,
    pub events: Vec<E>,
    pub public_events: Vec<E>,
    pub timestamp: i64,
}

impl<E> AggregateCommit<E> {
    pub fn new(aggregate_id: AggregateId, revision: i32, events: Vec<E>, public_events: Vec<E>) -> Self {
        Self {
            aggregate_id,
            revision,
            events,
            public_events,
            timestamp: now_millis(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// The ordered commit history of one aggregate.
#[derive(Clone, Debug)]
pub struct EventStream<E> {
    commits: Vec<AggregateCommit<E>>,
}

impl<E> EventStream<E> {
    pub fn new(commits: Vec<AggregateCommit<E>>) -> Self {
        Self { commits }
    }

    pub fn commits(&self) -> &[AggregateCommit<E>] {
        &self.commits
    }

    pub fn into_commits(self) -> Vec<AggregateCommit<E>> {
        self.commits
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Revision of the last commit, 0 for an empty stream.
    pub fn revision(&self) -> i32 {
        self.commits.last().map(|c| c.revision).unwrap_or(0)
    }

    /// Private events of every commit, in order.
    pub fn events(&self) -> impl Iterator<Item = &E> {
        self.commits.iter().flat_map(|c| c.events.iter())
    }
}

/// All raw rows of one aggregate, as delivered by a full-store replay.
#[derive(Clone, Debug)]
pub struct AggregateStream {
    pub aggregate_id: AggregateId,
    pub events: Vec<RawEvent>,
}

/// Pointer from an event type to one stored event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexRecord {
    pub event_type_id: String,
    pub aggregate_id: AggregateId,
    pub revision: i32,
    pub position: i32,
    pub timestamp: i64,
}

impl IndexRecord {
    pub fn for_event(event_type_id: impl Into<String>, raw: &RawEvent) -> Self {
        Self {
            event_type_id: event_type_id.into(),
            aggregate_id: raw.aggregate_id,
            revision: raw.revision,
            position: raw.position,
            timestamp: raw.timestamp,
        }
    }
}

// ============================================================================
// Payload Serialization
// ============================================================================

/// Turns event payloads into the bytes stored in the `data` column.
pub trait PayloadSerializer: Send + Sync + 'static {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;
    fn deserialize<T: for<'de> Deserialize<'de>>(&self, bytes: &[u8]) -> Result<T>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl PayloadSerializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: for<'de> Deserialize<'de>>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
