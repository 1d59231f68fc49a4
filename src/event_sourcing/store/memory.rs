use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Result, StoreError, WriteOutcome};
use crate::event_sourcing::core::{
    encode_commit, AggregateCommit, AggregateId, CommitBlock, DomainEvent, EventStream, IndexRecord, JsonSerializer,
    LoadedEvents, Order, Page, PagingOptions, PagingState, PayloadSerializer, RawEvent, AGGREGATE_ID_LEN,
};
use crate::event_sourcing::store::{
    EventStore, IndexReadOptions, IndexStatus, IndexStatusStore, IndexStore, MessageCounter, ReplaySource,
};

// ============================================================================
// In-Memory Backend
// ============================================================================
//
// Same semantics as the ScyllaDB backend over ordered maps:
// - rows keyed by (id, rev, pos), so full scans are partition contiguous
// - cursors are the last key returned, JSON encoded
// - a page is followed by a cursor only when more rows exist
//
// Useful for tests and local development.
// ============================================================================

type RowKey = (AggregateId, i32, i32);
type IndexKey = (String, i64, AggregateId, i32, i32);

const MIN_ID: AggregateId = AggregateId::new([0x00; AGGREGATE_ID_LEN]);
const MAX_ID: AggregateId = AggregateId::new([0xff; AGGREGATE_ID_LEN]);

fn decode_cursor<K: DeserializeOwned>(paging: &PagingState) -> Result<Option<K>> {
    paging
        .token()
        .map(|bytes| serde_json::from_slice(bytes).map_err(|e| StoreError::InvalidCursor(e.to_string())))
        .transpose()
}

/// Narrow `(lower, upper)` by a cursor, in the direction of travel.
fn resume_bounds<K: Clone>(lower: Bound<K>, upper: Bound<K>, cursor: Option<K>, order: Order) -> (Bound<K>, Bound<K>) {
    match (cursor, order) {
        (None, _) => (lower, upper),
        (Some(key), Order::Ascending) => (Bound::Excluded(key), upper),
        (Some(key), Order::Descending) => (lower, Bound::Excluded(key)),
    }
}

/// `BTreeMap::range` panics on inverted bounds; treat those as empty.
fn is_empty_range<K: Ord>(lower: &Bound<K>, upper: &Bound<K>) -> bool {
    match (lower, upper) {
        (Bound::Included(a), Bound::Included(b)) => a > b,
        (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) => a >= b,
        _ => false,
    }
}

/// Take one page from `items`, emitting a cursor only if more remain.
fn paginate<K: Serialize, T>(mut items: impl Iterator<Item = (K, T)>, take: i32) -> Result<Page<T>> {
    let take = take.max(1) as usize;
    let mut page = Vec::new();
    let mut last_key = None;

    for (key, item) in items.by_ref().take(take) {
        page.push(item);
        last_key = Some(key);
    }

    let next = match (items.next(), last_key) {
        (Some(_), Some(key)) => PagingState::after_page(Some(serde_json::to_vec(&key)?)),
        _ => PagingState::finished(),
    };
    Ok(Page::new(page, next))
}

fn ordered_range<'a, K: Ord + Clone, V>(
    map: &'a BTreeMap<K, V>,
    lower: Bound<K>,
    upper: Bound<K>,
    order: Order,
) -> Box<dyn Iterator<Item = (&'a K, &'a V)> + 'a> {
    if is_empty_range(&lower, &upper) {
        return Box::new(std::iter::empty());
    }
    let range = map.range((lower, upper));
    match order {
        Order::Ascending => Box::new(range),
        Order::Descending => Box::new(range.rev()),
    }
}

// ============================================================================
// Event Store
// ============================================================================

pub struct InMemoryEventStore<E: DomainEvent, S: PayloadSerializer = JsonSerializer> {
    rows: RwLock<BTreeMap<RowKey, RawEvent>>,
    index: Arc<dyn IndexStore>,
    serializer: S,
    reads: AtomicU64,
    _phantom: PhantomData<E>,
}

impl<E: DomainEvent> InMemoryEventStore<E, JsonSerializer> {
    pub fn new() -> Self {
        Self::with_index(Arc::new(InMemoryIndexStore::new()))
    }

    pub fn with_index(index: Arc<dyn IndexStore>) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            index,
            serializer: JsonSerializer,
            reads: AtomicU64::new(0),
            _phantom: PhantomData,
        }
    }
}

impl<E: DomainEvent> Default for InMemoryEventStore<E, JsonSerializer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: DomainEvent, S: PayloadSerializer> InMemoryEventStore<E, S> {
    pub async fn row_count(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Storage reads served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn count_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    async fn insert(&self, event: RawEvent) {
        let key = (event.aggregate_id, event.revision, event.position);
        self.rows.write().await.insert(key, event);
    }

    async fn find(&self, record: &IndexRecord) -> Option<RawEvent> {
        self.count_read();
        let key = (record.aggregate_id, record.revision, record.position);
        self.rows.read().await.get(&key).cloned()
    }
}

#[async_trait]
impl<E: DomainEvent, S: PayloadSerializer> ReplaySource for InMemoryEventStore<E, S> {
    async fn scan_page(&self, paging: &PagingState, batch_size: i32) -> Result<Page<RawEvent>> {
        if paging.is_finished() {
            return Ok(Page::exhausted());
        }
        let cursor = decode_cursor::<RowKey>(paging)?;
        self.count_read();

        let rows = self.rows.read().await;
        let (lower, upper) = resume_bounds(Bound::Unbounded, Bound::Unbounded, cursor, Order::Ascending);
        paginate(
            ordered_range(&rows, lower, upper, Order::Ascending).map(|(key, row)| (*key, row.clone())),
            batch_size,
        )
    }

    async fn load_aggregate_event_raw(&self, record: &IndexRecord) -> Option<RawEvent> {
        let found = self.find(record).await;
        if found.is_none() {
            tracing::error!(
                aggregate_id = %record.aggregate_id,
                revision = record.revision,
                position = record.position,
                event_type = %record.event_type_id,
                "Index record points to a missing event"
            );
        }
        found
    }

    fn index_store(&self) -> &dyn IndexStore {
        self.index.as_ref()
    }
}

#[async_trait]
impl<E: DomainEvent, S: PayloadSerializer> EventStore for InMemoryEventStore<E, S> {
    type Event = E;

    async fn append(&self, commit: &AggregateCommit<E>) -> Result<WriteOutcome> {
        let rows = encode_commit(commit, &self.serializer)?;
        let mut table = self.rows.write().await;
        for row in rows {
            table.insert((row.aggregate_id, row.revision, row.position), row);
        }
        Ok(WriteOutcome::Applied)
    }

    async fn append_raw(&self, event: &RawEvent) -> WriteOutcome {
        self.insert(event.clone()).await;
        WriteOutcome::Applied
    }

    async fn load(&self, aggregate_id: &AggregateId) -> Result<EventStream<E>> {
        self.count_read();
        let rows = self.rows.read().await;

        let mut block = CommitBlock::new(*aggregate_id);
        let range = (*aggregate_id, i32::MIN, i32::MIN)..=(*aggregate_id, i32::MAX, i32::MAX);
        for row in rows.range(range).map(|(_, row)| row) {
            let event: E = self.serializer.deserialize(&row.data)?;
            block.append_row(row.revision, row.position, event, row.timestamp)?;
        }
        Ok(EventStream::new(block.complete()))
    }

    async fn load_with_paging(&self, aggregate_id: &AggregateId, options: &PagingOptions) -> Result<LoadedEvents> {
        if options.paging.is_finished() {
            return Ok(Page::exhausted());
        }
        let cursor = decode_cursor::<RowKey>(&options.paging)?;
        self.count_read();

        let rows = self.rows.read().await;
        let (lower, upper) = resume_bounds(
            Bound::Included((*aggregate_id, i32::MIN, i32::MIN)),
            Bound::Included((*aggregate_id, i32::MAX, i32::MAX)),
            cursor,
            options.order,
        );
        paginate(
            ordered_range(&rows, lower, upper, options.order).map(|(key, row)| (*key, row.clone())),
            options.take,
        )
    }

    async fn delete(&self, event: &RawEvent) -> WriteOutcome {
        let key = (event.aggregate_id, event.revision, event.position);
        self.rows.write().await.remove(&key);
        WriteOutcome::Applied
    }

    async fn load_event_with_rebuild_projection(&self, record: &IndexRecord) -> Result<E> {
        match self.find(record).await {
            Some(raw) => self.serializer.deserialize(&raw.data),
            None => Err(StoreError::MissingIndexedEvent {
                aggregate_id: record.aggregate_id.to_string(),
                revision: record.revision,
                position: record.position,
            }),
        }
    }
}

// ============================================================================
// Index, Counter & Status
// ============================================================================

#[derive(Default)]
pub struct InMemoryIndexStore {
    records: RwLock<BTreeMap<IndexKey, IndexRecord>>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(record: &IndexRecord) -> IndexKey {
        (
            record.event_type_id.clone(),
            record.timestamp,
            record.aggregate_id,
            record.revision,
            record.position,
        )
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn append(&self, record: &IndexRecord) -> WriteOutcome {
        self.records.write().await.insert(Self::key(record), record.clone());
        WriteOutcome::Applied
    }

    async fn delete(&self, record: &IndexRecord) -> WriteOutcome {
        self.records.write().await.remove(&Self::key(record));
        WriteOutcome::Applied
    }

    async fn get_records(&self, options: &IndexReadOptions) -> Result<Page<IndexRecord>> {
        if options.paging.is_finished() {
            return Ok(Page::exhausted());
        }
        let cursor = decode_cursor::<IndexKey>(&options.paging)?;

        let et = options.event_type_id.clone();
        let after = options.after.unwrap_or(i64::MIN);
        let before = options.before.unwrap_or(i64::MAX);
        let (lower, upper) = resume_bounds(
            Bound::Included((et.clone(), after, MIN_ID, i32::MIN, i32::MIN)),
            Bound::Included((et, before, MAX_ID, i32::MAX, i32::MAX)),
            cursor,
            options.order,
        );

        let records = self.records.read().await;
        paginate(
            ordered_range(&records, lower, upper, options.order).map(|(key, record)| (key.clone(), record.clone())),
            options.batch_size,
        )
    }
}

#[derive(Default)]
pub struct InMemoryMessageCounter {
    counters: RwLock<HashMap<String, i64>>,
}

impl InMemoryMessageCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageCounter for InMemoryMessageCounter {
    async fn increment(&self, contract_id: &str, by: i64) -> Result<()> {
        *self.counters.write().await.entry(contract_id.to_string()).or_insert(0) += by;
        Ok(())
    }

    async fn decrement(&self, contract_id: &str, by: i64) -> Result<()> {
        self.increment(contract_id, -by).await
    }

    async fn get_count(&self, contract_id: &str) -> Result<i64> {
        Ok(self.counters.read().await.get(contract_id).copied().unwrap_or(0))
    }
}

#[derive(Default)]
pub struct InMemoryIndexStatusStore {
    statuses: RwLock<HashMap<String, IndexStatus>>,
}

impl InMemoryIndexStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexStatusStore for InMemoryIndexStatusStore {
    async fn get(&self, index_id: &str) -> Result<IndexStatus> {
        Ok(self
            .statuses
            .read()
            .await
            .get(index_id)
            .copied()
            .unwrap_or(IndexStatus::NotPresent))
    }

    async fn save(&self, index_id: &str, status: IndexStatus) -> Result<()> {
        self.statuses.write().await.insert(index_id.to_string(), status);
        Ok(())
    }
}
