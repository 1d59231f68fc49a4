// ============================================================================
// Event Sourcing Core - Storage-Agnostic Building Blocks
// ============================================================================
//
// Everything here is independent of the database:
// - the event row / commit / stream model and payload serialization
// - the commit codec (rows <-> commits)
// - the pagination cursor shared by every paged read
//
// ============================================================================

pub mod commit_block;
pub mod event;
pub mod paging;

pub use commit_block::{encode_commit, CommitBlock};
pub use event::{
    now_millis, AggregateCommit, AggregateId, AggregateStream, Contract, DomainEvent, EventStream,
    IndexRecord, JsonSerializer, PayloadSerializer, RawEvent, AGGREGATE_ID_LEN, PUBLIC_EVENTS_OFFSET,
};
pub use paging::{LoadedEvents, Order, Page, PagingOptions, PagingState};
