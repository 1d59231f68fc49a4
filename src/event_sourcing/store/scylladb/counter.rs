use async_trait::async_trait;
use scylla::value::Counter;

use super::statements::{PreparedStatementCache, GET_MESSAGE_COUNTER, UPDATE_MESSAGE_COUNTER};
use super::StoreContext;
use crate::error::{Result, StoreError, WriteOutcome};
use crate::event_sourcing::store::MessageCounter;

/// Message throughput counters backed by a CQL counter table.
///
/// Counter updates are never idempotent; a timed-out increment is reported
/// as an error and may or may not have been applied.
pub struct ScyllaMessageCounter {
    context: StoreContext,
    update: PreparedStatementCache,
    get: PreparedStatementCache,
}

impl ScyllaMessageCounter {
    pub fn new(context: StoreContext) -> Self {
        Self {
            update: context.statement(UPDATE_MESSAGE_COUNTER),
            get: context.statement(GET_MESSAGE_COUNTER),
            context,
        }
    }

    async fn add(&self, contract_id: &str, delta: i64) -> Result<()> {
        let session = self.context.session().await?;
        let mut statement = self.update.prepare(&session).await?;
        statement.set_is_idempotent(false);

        match session.execute_unpaged(&statement, (Counter(delta), contract_id)).await {
            Ok(_) => {
                self.context.metrics.record_write("counter_update", &WriteOutcome::Applied);
            }
            Err(e) => {
                self.context.metrics.record_write("counter_update", &WriteOutcome::from_error(&e));
                tracing::error!(contract_id = %contract_id, delta, error = %e, "Failed to update message counter");
                return Err(StoreError::Execution(e));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageCounter for ScyllaMessageCounter {
    async fn increment(&self, contract_id: &str, by: i64) -> Result<()> {
        self.add(contract_id, by).await
    }

    async fn decrement(&self, contract_id: &str, by: i64) -> Result<()> {
        self.add(contract_id, -by).await
    }

    async fn get_count(&self, contract_id: &str) -> Result<i64> {
        let session = self.context.session().await?;
        let statement = self.get.prepare(&session).await?;

        let result = session.execute_unpaged(&statement, (contract_id,)).await?;
        let rows = result.into_rows_result().map_err(StoreError::rows)?;

        Ok(rows
            .maybe_first_row::<(Option<Counter>,)>()
            .map_err(StoreError::rows)?
            .and_then(|(count,)| count)
            .map(|Counter(value)| value)
            .unwrap_or(0))
    }
}
