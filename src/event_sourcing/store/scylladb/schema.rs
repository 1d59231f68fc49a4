use futures_util::future::join_all;

use super::naming::{INDEX_BY_EVENT_TYPE_TABLE, INDEX_STATUS_TABLE, MESSAGE_COUNTER_TABLE};
use super::StoreContext;
use crate::error::{Result, StoreError};

// ============================================================================
// Storage Manager - idempotent schema creation
// ============================================================================
//
// events             (id blob, rev int, pos int, ts bigint, data blob)
//                    PRIMARY KEY ((id), rev, pos)
// index_by_eventtype (et text, pid int, aid blob, rev int, pos int, ts bigint)
//                    PRIMARY KEY ((et, pid), ts, aid, rev, pos)
// index_status       (id blob, status text)  PRIMARY KEY (id)
// message_counter    (cv counter, msgid text) PRIMARY KEY (msgid)
//
// `pid` is the monthly bucket of `ts`, see `index_store::partition_bucket`.
// ============================================================================

pub fn create_keyspace_cql(keyspace: &str, replication_factor: u32) -> String {
    format!(
        "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
        keyspace, replication_factor
    )
}

pub fn events_table_cql(keyspace: &str, table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} (id blob, rev int, pos int, ts bigint, data blob, \
         PRIMARY KEY ((id), rev, pos)) WITH CLUSTERING ORDER BY (rev ASC, pos ASC)",
        keyspace, table
    )
}

pub fn index_by_event_type_cql(keyspace: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} (et text, pid int, aid blob, rev int, pos int, ts bigint, \
         PRIMARY KEY ((et, pid), ts, aid, rev, pos)) \
         WITH CLUSTERING ORDER BY (ts ASC, aid ASC, rev ASC, pos ASC)",
        keyspace, INDEX_BY_EVENT_TYPE_TABLE
    )
}

pub fn index_status_cql(keyspace: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} (id blob, status text, PRIMARY KEY (id))",
        keyspace, INDEX_STATUS_TABLE
    )
}

pub fn message_counter_cql(keyspace: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} (cv counter, msgid text, PRIMARY KEY (msgid))",
        keyspace, MESSAGE_COUNTER_TABLE
    )
}

pub struct StorageManager {
    context: StoreContext,
}

impl StorageManager {
    pub fn new(context: StoreContext) -> Self {
        Self { context }
    }

    /// `(table, statement)` for every table in the current tenant keyspace.
    pub fn table_definitions(&self) -> Result<Vec<(String, String)>> {
        let keyspace = self.context.keyspace()?;
        let events_table = self.context.tables.events_table()?;

        Ok(vec![
            (events_table.clone(), events_table_cql(&keyspace, &events_table)),
            (INDEX_BY_EVENT_TYPE_TABLE.to_string(), index_by_event_type_cql(&keyspace)),
            (INDEX_STATUS_TABLE.to_string(), index_status_cql(&keyspace)),
            (MESSAGE_COUNTER_TABLE.to_string(), message_counter_cql(&keyspace)),
        ])
    }

    /// Create the tenant keyspace. Production clusters usually provision
    /// keyspaces out of band; the bootstrap binary uses this for local runs.
    pub async fn create_keyspace(&self, replication_factor: u32) -> Result<()> {
        let keyspace = self.context.keyspace()?;
        let session = self.context.session().await?;

        session
            .query_unpaged(create_keyspace_cql(&keyspace, replication_factor), ())
            .await?;

        tracing::info!(keyspace = %keyspace, replication_factor, "Keyspace ready");
        Ok(())
    }

    /// Create every table concurrently. Safe to call repeatedly; the first
    /// failure is returned after all statements have completed.
    pub async fn create_storage(&self) -> Result<()> {
        let definitions = self.table_definitions()?;
        let session = self.context.session().await?;

        let results = join_all(definitions.iter().map(|(table, cql)| {
            let session = session.clone();
            async move {
                let result = session.query_unpaged(cql.as_str(), ()).await;
                (table.as_str(), result)
            }
        }))
        .await;

        let mut first_error: Option<StoreError> = None;
        for (table, result) in results {
            match result {
                Ok(_) => tracing::debug!(table = %table, "Table ready"),
                Err(e) => {
                    tracing::error!(table = %table, error = %e, "Failed to create table");
                    if first_error.is_none() {
                        first_error = Some(e.into());
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(tables = definitions.len(), "Storage ready");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_table_layout() {
        let cql = events_table_cql("acme_eventstore", "sales_events");
        assert!(cql.starts_with("CREATE TABLE IF NOT EXISTS acme_eventstore.sales_events"));
        assert!(cql.contains("PRIMARY KEY ((id), rev, pos)"));
        assert!(cql.contains("data blob"));
    }

    #[test]
    fn test_index_table_is_bucketed_by_month() {
        let cql = index_by_event_type_cql("ks");
        assert!(cql.contains("ks.index_by_eventtype"));
        assert!(cql.contains("PRIMARY KEY ((et, pid), ts, aid, rev, pos)"));
    }

    #[test]
    fn test_auxiliary_tables() {
        assert!(index_status_cql("ks").contains("ks.index_status (id blob, status text"));
        assert!(message_counter_cql("ks").contains("cv counter"));
        assert!(message_counter_cql("ks").contains("PRIMARY KEY (msgid)"));
    }

    #[test]
    fn test_keyspace_statement() {
        let cql = create_keyspace_cql("acme_eventstore", 3);
        assert_eq!(
            cql,
            "CREATE KEYSPACE IF NOT EXISTS acme_eventstore WITH replication = {'class': 'SimpleStrategy', 'replication_factor': 3}"
        );
    }
}
