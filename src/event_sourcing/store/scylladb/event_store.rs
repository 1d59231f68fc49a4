use async_trait::async_trait;
use scylla::client::session::Session;
use scylla::statement::batch::{Batch, BatchType};
use scylla::statement::prepared::PreparedStatement;
use scylla::statement::Consistency;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::statements::{
    PreparedStatementCache, DELETE_EVENT, INSERT_EVENT, LOAD_AGGREGATE_EVENT, LOAD_AGGREGATE_EVENTS,
    LOAD_AGGREGATE_EVENTS_DESC, SCAN_EVENTS,
};
use super::{driver_paging_state, next_paging_state, raw_event_from_row, EventRow, StoreContext};
use crate::error::{Result, StoreError, WriteOutcome};
use crate::event_sourcing::core::{
    encode_commit, AggregateCommit, AggregateId, CommitBlock, DomainEvent, EventStream, IndexRecord,
    JsonSerializer, LoadedEvents, Order, Page, PagingOptions, PagingState, PayloadSerializer, RawEvent,
};
use crate::event_sourcing::store::{
    replay, EventStore, IndexStore, ReplayOperator, ReplayOptions, ReplayReport, ReplaySource,
};

// ============================================================================
// ScyllaDB Event Store
// ============================================================================
//
// One partition per aggregate, clustered by (rev, pos). A commit is written
// as one unlogged batch: every row shares the partition, so the batch is
// applied atomically without the batchlog.
//
// Appends are not idempotent (a retried batch after a timeout may collide
// with a concurrent writer), so the driver never retries them. Concurrent
// appends for the same revision are not detected here.
//
// ============================================================================

pub struct ScyllaEventStore<E: DomainEvent, S: PayloadSerializer = JsonSerializer> {
    context: StoreContext,
    serializer: S,
    index: Arc<dyn IndexStore>,
    insert_event: PreparedStatementCache,
    load_events: PreparedStatementCache,
    load_events_desc: PreparedStatementCache,
    load_event: PreparedStatementCache,
    delete_event: PreparedStatementCache,
    scan_events: PreparedStatementCache,
    _phantom: PhantomData<E>,
}

impl<E: DomainEvent> ScyllaEventStore<E, JsonSerializer> {
    pub fn new(context: StoreContext, index: Arc<dyn IndexStore>) -> Self {
        Self::with_serializer(context, index, JsonSerializer)
    }
}

impl<E: DomainEvent, S: PayloadSerializer> ScyllaEventStore<E, S> {
    pub fn with_serializer(context: StoreContext, index: Arc<dyn IndexStore>, serializer: S) -> Self {
        Self {
            insert_event: context.statement(INSERT_EVENT),
            load_events: context.statement(LOAD_AGGREGATE_EVENTS),
            load_events_desc: context.statement(LOAD_AGGREGATE_EVENTS_DESC),
            load_event: context.statement(LOAD_AGGREGATE_EVENT),
            delete_event: context.statement(DELETE_EVENT),
            scan_events: context.statement(SCAN_EVENTS),
            context,
            serializer,
            index,
            _phantom: PhantomData,
        }
    }

    /// Session and statement for a best-effort write. Failures to obtain
    /// either are reported as a failed outcome.
    async fn write_path(
        &self,
        statement: &PreparedStatementCache,
    ) -> std::result::Result<(Arc<Session>, PreparedStatement), WriteOutcome> {
        let session = self.context.session().await.map_err(|e| WriteOutcome::Failed(e.to_string()))?;
        let prepared = statement
            .prepare(&session)
            .await
            .map_err(|e| WriteOutcome::Failed(e.to_string()))?;
        Ok((session, prepared))
    }

    fn log_write(&self, operation: &'static str, aggregate_id: &AggregateId, revision: i32, outcome: &WriteOutcome) {
        self.context.metrics.record_write(operation, outcome);
        match outcome {
            WriteOutcome::Applied => {}
            WriteOutcome::TransientFailure(reason) => tracing::warn!(
                operation,
                aggregate_id = %aggregate_id,
                revision,
                reason = %reason,
                "Write timed out; it may or may not have been applied"
            ),
            WriteOutcome::Failed(reason) => tracing::error!(
                operation,
                aggregate_id = %aggregate_id,
                revision,
                reason = %reason,
                "Write failed"
            ),
        }
    }

    /// Point read of one row.
    async fn read_event(&self, record: &IndexRecord) -> Result<Option<RawEvent>> {
        let session = self.context.session().await?;
        let statement = self.load_event.prepare(&session).await?;

        let result = session
            .execute_unpaged(
                &statement,
                (record.aggregate_id.as_bytes().to_vec(), record.revision, record.position),
            )
            .await?;

        let rows = result.into_rows_result().map_err(StoreError::rows)?;
        match rows.maybe_first_row::<EventRow>().map_err(StoreError::rows)? {
            Some(row) => Ok(Some(raw_event_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// One driver page of `statement`, resuming from `paging`.
    async fn read_page<V>(
        &self,
        statement: &PreparedStatementCache,
        values: V,
        paging: &PagingState,
        page_size: i32,
    ) -> Result<Page<RawEvent>>
    where
        V: scylla::serialize::row::SerializeRow + Send,
    {
        let session = self.context.session().await?;
        let mut prepared = statement.prepare(&session).await?;
        prepared.set_page_size(page_size.max(1));

        let (result, response) = session
            .execute_single_page(&prepared, values, driver_paging_state(paging.token()))
            .await?;

        let rows = result.into_rows_result().map_err(StoreError::rows)?;
        let mut events = Vec::with_capacity(rows.rows_num());
        for row in rows.rows::<EventRow>().map_err(StoreError::rows)? {
            events.push(raw_event_from_row(row.map_err(StoreError::rows)?)?);
        }

        self.context.metrics.record_rows(statement.template().name, events.len());
        Ok(Page::new(events, next_paging_state(response)))
    }
}

#[async_trait]
impl<E: DomainEvent, S: PayloadSerializer> ReplaySource for ScyllaEventStore<E, S> {
    async fn scan_page(&self, paging: &PagingState, batch_size: i32) -> Result<Page<RawEvent>> {
        if paging.is_finished() {
            return Ok(Page::exhausted());
        }
        self.read_page(&self.scan_events, (), paging, batch_size).await
    }

    async fn load_aggregate_event_raw(&self, record: &IndexRecord) -> Option<RawEvent> {
        match self.read_event(record).await {
            Ok(Some(event)) => Some(event),
            Ok(None) => {
                tracing::error!(
                    aggregate_id = %record.aggregate_id,
                    revision = record.revision,
                    position = record.position,
                    event_type = %record.event_type_id,
                    "Index record points to a missing event"
                );
                None
            }
            Err(e) => {
                tracing::error!(
                    aggregate_id = %record.aggregate_id,
                    revision = record.revision,
                    position = record.position,
                    error = %e,
                    "Failed to load indexed event"
                );
                None
            }
        }
    }

    fn index_store(&self) -> &dyn IndexStore {
        self.index.as_ref()
    }
}

#[async_trait]
impl<E: DomainEvent, S: PayloadSerializer> EventStore for ScyllaEventStore<E, S> {
    type Event = E;

    async fn append(&self, commit: &AggregateCommit<E>) -> Result<WriteOutcome> {
        let started = Instant::now();
        let rows = encode_commit(commit, &self.serializer)?;
        if rows.is_empty() {
            return Ok(WriteOutcome::Applied);
        }

        let (session, insert) = match self.write_path(&self.insert_event).await {
            Ok(path) => path,
            Err(outcome) => {
                self.log_write("append", &commit.aggregate_id, commit.revision, &outcome);
                return Ok(outcome);
            }
        };

        let mut batch = Batch::new(BatchType::Unlogged);
        batch.set_consistency(Consistency::Quorum);
        batch.set_is_idempotent(false);

        let row_count = rows.len();
        let mut values = Vec::with_capacity(row_count);
        for row in rows {
            batch.append_statement(insert.clone());
            values.push((row.aggregate_id.as_bytes().to_vec(), row.revision, row.position, row.timestamp, row.data));
        }

        let outcome = WriteOutcome::from_execution(session.batch(&batch, values).await);
        self.log_write("append", &commit.aggregate_id, commit.revision, &outcome);

        if outcome.is_success() {
            self.context.metrics.events_appended.inc_by(row_count as u64);
            tracing::debug!(
                aggregate_id = %commit.aggregate_id,
                revision = commit.revision,
                rows = row_count,
                "Appended commit"
            );
        }
        self.context.metrics.observe_duration("append", started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    async fn append_raw(&self, event: &RawEvent) -> WriteOutcome {
        let (session, mut insert) = match self.write_path(&self.insert_event).await {
            Ok(path) => path,
            Err(outcome) => {
                self.log_write("append_raw", &event.aggregate_id, event.revision, &outcome);
                return outcome;
            }
        };
        insert.set_is_idempotent(false);

        let outcome = WriteOutcome::from_execution(
            session
                .execute_unpaged(
                    &insert,
                    (
                        event.aggregate_id.as_bytes().to_vec(),
                        event.revision,
                        event.position,
                        event.timestamp,
                        event.data.clone(),
                    ),
                )
                .await,
        );
        self.log_write("append_raw", &event.aggregate_id, event.revision, &outcome);
        outcome
    }

    async fn load(&self, aggregate_id: &AggregateId) -> Result<EventStream<E>> {
        let started = Instant::now();
        let session = self.context.session().await?;
        let statement = self.load_events.prepare(&session).await?;

        let result = session
            .execute_unpaged(&statement, (aggregate_id.as_bytes().to_vec(),))
            .await?;
        let rows = result.into_rows_result().map_err(StoreError::rows)?;

        let mut block = CommitBlock::new(*aggregate_id);
        let mut loaded = 0usize;
        for row in rows.rows::<EventRow>().map_err(StoreError::rows)? {
            let (_, revision, position, timestamp, data) = row.map_err(StoreError::rows)?;
            let event: E = self.serializer.deserialize(&data)?;
            block.append_row(revision, position, event, timestamp)?;
            loaded += 1;
        }

        let stream = EventStream::new(block.complete());
        tracing::debug!(
            aggregate_id = %aggregate_id,
            rows = loaded,
            revision = stream.revision(),
            "Loaded aggregate"
        );
        self.context.metrics.record_rows("load", loaded);
        self.context.metrics.observe_duration("load", started.elapsed().as_secs_f64());
        Ok(stream)
    }

    async fn load_with_paging(&self, aggregate_id: &AggregateId, options: &PagingOptions) -> Result<LoadedEvents> {
        if options.paging.is_finished() {
            return Ok(Page::exhausted());
        }

        let statement = match options.order {
            Order::Ascending => &self.load_events,
            Order::Descending => &self.load_events_desc,
        };
        self.read_page(statement, (aggregate_id.as_bytes().to_vec(),), &options.paging, options.take)
            .await
    }

    async fn delete(&self, event: &RawEvent) -> WriteOutcome {
        let (session, statement) = match self.write_path(&self.delete_event).await {
            Ok(path) => path,
            Err(outcome) => {
                self.log_write("delete", &event.aggregate_id, event.revision, &outcome);
                return outcome;
            }
        };

        let outcome = WriteOutcome::from_execution(
            session
                .execute_unpaged(
                    &statement,
                    (event.aggregate_id.as_bytes().to_vec(), event.revision, event.position),
                )
                .await,
        );
        self.log_write("delete", &event.aggregate_id, event.revision, &outcome);
        outcome
    }

    async fn load_event_with_rebuild_projection(&self, record: &IndexRecord) -> Result<E> {
        match self.read_event(record).await? {
            Some(raw) => self.serializer.deserialize(&raw.data),
            None => Err(StoreError::MissingIndexedEvent {
                aggregate_id: record.aggregate_id.to_string(),
                revision: record.revision,
                position: record.position,
            }),
        }
    }

    async fn enumerate_event_store(
        &self,
        operator: &ReplayOperator,
        options: ReplayOptions,
        cancel: &CancellationToken,
    ) -> Result<ReplayReport> {
        let started = Instant::now();
        let report = replay::enumerate(self, operator, options, cancel).await?;
        self.context.metrics.record_replay(&report);
        self.context.metrics.observe_duration("replay", started.elapsed().as_secs_f64());
        Ok(report)
    }
}
