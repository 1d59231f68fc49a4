// ============================================================================
// Event Sourcing Store - Persistence Contracts
// ============================================================================
//
// The traits every backend implements. `scylladb` is the production backend,
// `memory` keeps the same semantics in ordered maps for tests and local runs.
//
// ============================================================================

pub mod memory;
pub mod replay;
pub mod scylladb;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WriteOutcome};
use crate::event_sourcing::core::{
    AggregateCommit, AggregateId, Contract, DomainEvent, EventStream, IndexRecord, LoadedEvents,
    Order, Page, PagingOptions, PagingState, RawEvent,
};

pub use replay::{AggregateGrouper, ReplayOperator, ReplayOptions, ReplayReport};

/// What a replay needs from a backend.
#[async_trait]
pub trait ReplaySource: Send + Sync {
    /// One page of the whole events table in storage order.
    ///
    /// All rows of an aggregate must be contiguous across pages; replay
    /// grouping depends on it.
    async fn scan_page(&self, paging: &PagingState, batch_size: i32) -> Result<Page<RawEvent>>;

    /// Point lookup behind an index record. Missing rows and read failures are
    /// logged and yield `None`.
    async fn load_aggregate_event_raw(&self, record: &IndexRecord) -> Option<RawEvent>;

    fn index_store(&self) -> &dyn IndexStore;
}

#[async_trait]
pub trait EventStore: ReplaySource {
    type Event: DomainEvent;

    /// Write every row of a commit in one batch. `Err` is reserved for
    /// commits that cannot be encoded; driver failures become outcomes.
    async fn append(&self, commit: &AggregateCommit<Self::Event>) -> Result<WriteOutcome>;

    /// Write one stored row as is (migrations, replays into another store).
    async fn append_raw(&self, event: &RawEvent) -> WriteOutcome;

    async fn load(&self, aggregate_id: &AggregateId) -> Result<EventStream<Self::Event>>;

    async fn load_with_paging(&self, aggregate_id: &AggregateId, options: &PagingOptions) -> Result<LoadedEvents>;

    async fn delete(&self, event: &RawEvent) -> WriteOutcome;

    /// Like `load_aggregate_event_raw`, but a missing row is an error.
    async fn load_event_with_rebuild_projection(&self, record: &IndexRecord) -> Result<Self::Event>;

    async fn enumerate_event_store(
        &self,
        operator: &ReplayOperator,
        options: ReplayOptions,
        cancel: &CancellationToken,
    ) -> Result<ReplayReport> {
        replay::enumerate(self, operator, options, cancel).await
    }
}

// ============================================================================
// Type Index
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexReadOptions {
    pub event_type_id: String,
    pub after: Option<i64>,
    pub before: Option<i64>,
    pub batch_size: i32,
    pub order: Order,
    pub paging: PagingState,
}

impl IndexReadOptions {
    pub fn new(event_type_id: impl Into<String>, batch_size: i32) -> Self {
        Self {
            event_type_id: event_type_id.into(),
            after: None,
            before: None,
            batch_size,
            order: Order::Ascending,
            paging: PagingState::start(),
        }
    }
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn append(&self, record: &IndexRecord) -> WriteOutcome;

    async fn delete(&self, record: &IndexRecord) -> WriteOutcome;

    async fn get_records(&self, options: &IndexReadOptions) -> Result<Page<IndexRecord>>;
}

/// Lazily walk every index page for `options`, starting at `options.paging`.
///
/// `on_progress` sees the cursor after each page; hand it back in
/// `options.paging` to resume later.
pub fn index_records<'a, F>(
    store: &'a dyn IndexStore,
    options: IndexReadOptions,
    on_progress: F,
) -> BoxStream<'a, Result<IndexRecord>>
where
    F: FnMut(&PagingState) + Send + 'a,
{
    stream::unfold(Some((options, on_progress)), move |state| async move {
        let (mut options, mut on_progress) = state?;
        if options.paging.is_finished() {
            return None;
        }

        match store.get_records(&options).await {
            Ok(page) => {
                options.paging = page.next;
                on_progress(&options.paging);
                let items: Vec<Result<IndexRecord>> = page.items.into_iter().map(Ok).collect();
                Some((items, Some((options, on_progress))))
            }
            Err(e) => Some((vec![Err(e)], None)),
        }
    })
    .flat_map(stream::iter)
    .boxed()
}

/// Index records for every event of a commit, paired with its stored rows.
pub fn index_records_for_commit<E: DomainEvent>(commit: &AggregateCommit<E>, rows: &[RawEvent]) -> Vec<IndexRecord> {
    commit
        .events
        .iter()
        .chain(commit.public_events.iter())
        .zip(rows)
        .map(|(event, row)| IndexRecord::for_event(event.contract_id(), row))
        .collect()
}

// ============================================================================
// Message Counter
// ============================================================================

/// Distributed throughput counter keyed by message contract identifier.
#[async_trait]
pub trait MessageCounter: Send + Sync {
    async fn increment(&self, contract_id: &str, by: i64) -> Result<()>;

    async fn decrement(&self, contract_id: &str, by: i64) -> Result<()>;

    /// 0 for untracked messages.
    async fn get_count(&self, contract_id: &str) -> Result<i64>;

    /// Read the current count and decrement by it.
    ///
    /// Not atomic: increments landing between the read and the decrement
    /// survive the reset.
    async fn reset(&self, contract_id: &str) -> Result<()> {
        let count = self.get_count(contract_id).await?;
        if count != 0 {
            self.decrement(contract_id, count).await?;
        }
        Ok(())
    }

    async fn increment_for<M: Contract>(&self, by: i64) -> Result<()>
    where
        Self: Sized,
    {
        self.increment(M::CONTRACT_ID, by).await
    }

    async fn count_for<M: Contract>(&self) -> Result<i64>
    where
        Self: Sized,
    {
        self.get_count(M::CONTRACT_ID).await
    }
}

// ============================================================================
// Index Status
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexStatus {
    NotPresent,
    Building,
    Present,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::NotPresent => "NotPresent",
            IndexStatus::Building => "Building",
            IndexStatus::Present => "Present",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "Building" => IndexStatus::Building,
            "Present" => IndexStatus::Present,
            _ => IndexStatus::NotPresent,
        }
    }
}

#[async_trait]
pub trait IndexStatusStore: Send + Sync {
    async fn get(&self, index_id: &str) -> Result<IndexStatus>;

    async fn save(&self, index_id: &str, status: IndexStatus) -> Result<()>;
}
