// ============================================================================
// scylla_eventstore
// ============================================================================
//
// Append-only storage of aggregate commits on ScyllaDB, with a type index
// for replay-by-event-type and cursor-based enumeration of the whole store.
//
// ============================================================================

pub mod config;
pub mod error;
pub mod event_sourcing;
pub mod metrics;

pub use error::{Result, StoreError, WriteOutcome};
pub use event_sourcing::core::*;
pub use event_sourcing::store::{
    index_records, index_records_for_commit, EventStore, IndexReadOptions, IndexStatus,
    IndexStatusStore, IndexStore, MessageCounter, ReplayOperator, ReplayOptions, ReplayReport,
    ReplaySource,
};
pub use event_sourcing::store::memory::{
    InMemoryEventStore, InMemoryIndexStatusStore, InMemoryIndexStore, InMemoryMessageCounter,
};
pub use event_sourcing::store::scylladb::{
    ScyllaEventStore, ScyllaIndexStatusStore, ScyllaIndexStore, ScyllaMessageCounter, StorageManager, StoreContext,
};
