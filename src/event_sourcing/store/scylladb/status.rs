use async_trait::async_trait;

use super::statements::{PreparedStatementCache, GET_INDEX_STATUS, SAVE_INDEX_STATUS};
use super::StoreContext;
use crate::error::{Result, StoreError};
use crate::event_sourcing::store::{IndexStatus, IndexStatusStore};

pub struct ScyllaIndexStatusStore {
    context: StoreContext,
    get: PreparedStatementCache,
    save: PreparedStatementCache,
}

impl ScyllaIndexStatusStore {
    pub fn new(context: StoreContext) -> Self {
        Self {
            get: context.statement(GET_INDEX_STATUS),
            save: context.statement(SAVE_INDEX_STATUS),
            context,
        }
    }
}

#[async_trait]
impl IndexStatusStore for ScyllaIndexStatusStore {
    async fn get(&self, index_id: &str) -> Result<IndexStatus> {
        let session = self.context.session().await?;
        let statement = self.get.prepare(&session).await?;

        let result = session
            .execute_unpaged(&statement, (index_id.as_bytes().to_vec(),))
            .await?;
        let rows = result.into_rows_result().map_err(StoreError::rows)?;

        Ok(rows
            .maybe_first_row::<(Option<String>,)>()
            .map_err(StoreError::rows)?
            .and_then(|(status,)| status)
            .map(|status| IndexStatus::parse(&status))
            .unwrap_or(IndexStatus::NotPresent))
    }

    async fn save(&self, index_id: &str, status: IndexStatus) -> Result<()> {
        let session = self.context.session().await?;
        let mut statement = self.save.prepare(&session).await?;
        statement.set_is_idempotent(true);

        session
            .execute_unpaged(&statement, (index_id.as_bytes().to_vec(), status.as_str()))
            .await?;

        tracing::info!(index_id = %index_id, status = status.as_str(), "Index status saved");
        Ok(())
    }
}
