use async_trait::async_trait;
use chrono::{DateTime, Datelike};
use serde::{Deserialize, Serialize};

use super::statements::{
    PreparedStatementCache, DELETE_INDEX_RECORD, INSERT_INDEX_RECORD, LOAD_INDEX_RECORDS, LOAD_INDEX_RECORDS_DESC,
};
use super::{continuation_token, driver_paging_state, StoreContext};
use crate::config::StoreSettings;
use crate::error::{Result, StoreError, WriteOutcome};
use crate::event_sourcing::core::{now_millis, AggregateId, IndexRecord, Order, Page, PagingState};
use crate::event_sourcing::store::{IndexReadOptions, IndexStore};

// ============================================================================
// Index by Event Type
// ============================================================================
//
// Partitioned by (event type, month). Reads walk the monthly partitions that
// overlap the requested window, one driver page at a time; the cursor handed
// back to callers records the partition and the driver token inside it.
//
// ============================================================================

/// Monthly partition of a timestamp in milliseconds, as `year * 100 + month`.
pub fn partition_bucket(timestamp_ms: i64) -> i32 {
    let at = DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_default();
    at.year() * 100 + at.month() as i32
}

pub fn next_bucket(bucket: i32) -> i32 {
    let (year, month) = (bucket / 100, bucket % 100);
    if month >= 12 {
        (year + 1) * 100 + 1
    } else {
        bucket + 1
    }
}

pub fn prev_bucket(bucket: i32) -> i32 {
    let (year, month) = (bucket / 100, bucket % 100);
    if month <= 1 {
        (year - 1) * 100 + 12
    } else {
        bucket - 1
    }
}

/// Inclusive range of partitions overlapping a time window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketWindow {
    first: i32,
    last: i32,
}

impl BucketWindow {
    pub fn new(after: i64, before: i64) -> Option<Self> {
        if after > before {
            return None;
        }
        Some(Self {
            first: partition_bucket(after),
            last: partition_bucket(before),
        })
    }

    pub fn start(&self, order: Order) -> i32 {
        match order {
            Order::Ascending => self.first,
            Order::Descending => self.last,
        }
    }

    pub fn step(&self, bucket: i32, order: Order) -> Option<i32> {
        match order {
            Order::Ascending if bucket < self.last => Some(next_bucket(bucket)),
            Order::Descending if bucket > self.first => Some(prev_bucket(bucket)),
            _ => None,
        }
    }
}

/// Time bounds and partitions of one read. `None` when the window is empty.
fn read_window(options: &IndexReadOptions, epoch_ms: i64, now_ms: i64) -> Option<(i64, i64, BucketWindow)> {
    let after = options.after.unwrap_or(epoch_ms);
    let before = options.before.unwrap_or(now_ms);
    BucketWindow::new(after, before).map(|window| (after, before, window))
}

/// Where the next read resumes after one driver page of partition `pid`:
/// later in the same partition, the next partition of the window, or nowhere.
fn next_cursor(pid: i32, driver_token: Option<Vec<u8>>, window: &BucketWindow, order: Order) -> Option<IndexCursor> {
    match driver_token {
        Some(token) => Some(IndexCursor {
            pid,
            driver: Some(token),
        }),
        None => window.step(pid, order).map(IndexCursor::at),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct IndexCursor {
    pid: i32,
    driver: Option<Vec<u8>>,
}

impl IndexCursor {
    fn at(pid: i32) -> Self {
        Self { pid, driver: None }
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::InvalidCursor(e.to_string()))
    }
}

/// `(aid, rev, pos, ts)`
type IndexRow = (Vec<u8>, i32, i32, i64);

pub struct ScyllaIndexStore {
    context: StoreContext,
    epoch_ms: i64,
    insert_record: PreparedStatementCache,
    delete_record: PreparedStatementCache,
    load_records: PreparedStatementCache,
    load_records_desc: PreparedStatementCache,
}

impl ScyllaIndexStore {
    /// `epoch_ms` is the lower bound used when a read has no `after`.
    /// Partitions older than it are never visited by open-ended reads.
    pub fn new(context: StoreContext, epoch_ms: i64) -> Self {
        Self {
            epoch_ms,
            insert_record: context.statement(INSERT_INDEX_RECORD),
            delete_record: context.statement(DELETE_INDEX_RECORD),
            load_records: context.statement(LOAD_INDEX_RECORDS),
            load_records_desc: context.statement(LOAD_INDEX_RECORDS_DESC),
            context,
        }
    }

    pub fn from_settings(context: StoreContext, settings: &StoreSettings) -> Result<Self> {
        Ok(Self::new(context, settings.index_epoch()?))
    }

    async fn insert(&self, record: &IndexRecord) -> Result<WriteOutcome> {
        let session = self.context.session().await?;
        let mut prepared = self.insert_record.prepare(&session).await?;
        prepared.set_is_idempotent(true);

        let values = (
            record.event_type_id.as_str(),
            partition_bucket(record.timestamp),
            record.aggregate_id.as_bytes().to_vec(),
            record.revision,
            record.position,
            record.timestamp,
        );
        Ok(WriteOutcome::from_execution(session.execute_unpaged(&prepared, values).await))
    }

    async fn remove(&self, record: &IndexRecord) -> Result<WriteOutcome> {
        let session = self.context.session().await?;
        let mut prepared = self.delete_record.prepare(&session).await?;
        prepared.set_is_idempotent(true);

        let values = (
            record.event_type_id.as_str(),
            partition_bucket(record.timestamp),
            record.timestamp,
            record.aggregate_id.as_bytes().to_vec(),
            record.revision,
            record.position,
        );
        Ok(WriteOutcome::from_execution(session.execute_unpaged(&prepared, values).await))
    }

    fn finish_write(&self, operation: &'static str, record: &IndexRecord, result: Result<WriteOutcome>) -> WriteOutcome {
        let outcome = result.unwrap_or_else(|e| WriteOutcome::Failed(e.to_string()));

        self.context.metrics.record_write(operation, &outcome);
        match &outcome {
            WriteOutcome::Applied => {}
            WriteOutcome::TransientFailure(reason) => tracing::warn!(
                operation,
                event_type = %record.event_type_id,
                aggregate_id = %record.aggregate_id,
                reason = %reason,
                "Index write timed out"
            ),
            WriteOutcome::Failed(reason) => tracing::error!(
                operation,
                event_type = %record.event_type_id,
                aggregate_id = %record.aggregate_id,
                reason = %reason,
                "Index write failed"
            ),
        }
        outcome
    }
}

#[async_trait]
impl IndexStore for ScyllaIndexStore {
    async fn append(&self, record: &IndexRecord) -> WriteOutcome {
        let result = self.insert(record).await;
        self.finish_write("index_append", record, result)
    }

    async fn delete(&self, record: &IndexRecord) -> WriteOutcome {
        let result = self.remove(record).await;
        self.finish_write("index_delete", record, result)
    }

    async fn get_records(&self, options: &IndexReadOptions) -> Result<Page<IndexRecord>> {
        if options.paging.is_finished() {
            return Ok(Page::exhausted());
        }

        let Some((after, before, window)) = read_window(options, self.epoch_ms, now_millis()) else {
            return Ok(Page::exhausted());
        };

        let mut cursor = match options.paging.token() {
            Some(bytes) => IndexCursor::from_bytes(bytes)?,
            None => IndexCursor::at(window.start(options.order)),
        };

        let session = self.context.session().await?;
        let statement = match options.order {
            Order::Ascending => &self.load_records,
            Order::Descending => &self.load_records_desc,
        };
        let mut prepared = statement.prepare(&session).await?;
        prepared.set_page_size(options.batch_size.max(1));

        loop {
            let (result, response) = session
                .execute_single_page(
                    &prepared,
                    (options.event_type_id.as_str(), cursor.pid, after, before),
                    driver_paging_state(cursor.driver.as_deref()),
                )
                .await?;

            let rows = result.into_rows_result().map_err(StoreError::rows)?;
            let mut records = Vec::with_capacity(rows.rows_num());
            for row in rows.rows::<IndexRow>().map_err(StoreError::rows)? {
                let (aid, revision, position, timestamp) = row.map_err(StoreError::rows)?;
                records.push(IndexRecord {
                    event_type_id: options.event_type_id.clone(),
                    aggregate_id: AggregateId::from_slice(&aid)?,
                    revision,
                    position,
                    timestamp,
                });
            }
            self.context.metrics.record_rows("index_read", records.len());

            let next = next_cursor(cursor.pid, continuation_token(response), &window, options.order);

            match next {
                None => return Ok(Page::new(records, PagingState::finished())),
                Some(next) if !records.is_empty() => {
                    return Ok(Page::new(records, PagingState::after_page(Some(next.to_bytes()?))))
                }
                // Empty partition: keep walking.
                Some(next) => cursor = next,
            }
        }
    }
}
