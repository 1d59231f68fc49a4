use scylla::client::session::Session;
use scylla::statement::prepared::PreparedStatement;
use scylla::statement::Consistency;

use super::naming::{INDEX_BY_EVENT_TYPE_TABLE, INDEX_STATUS_TABLE, MESSAGE_COUNTER_TABLE};
use super::single_flight::SingleFlight;
use super::StoreContext;
use crate::error::{Result, StoreError};

// ============================================================================
// Query Templates & Prepared Statement Cache
// ============================================================================
//
// Templates carry `{keyspace}` and `{table}` placeholders, resolved per tenant
// when the statement is first prepared. Prepared statements are cached per
// tenant for the lifetime of the process and default to QUORUM.
//
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    Events,
    IndexByEventType,
    IndexStatus,
    MessageCounter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryTemplate {
    pub name: &'static str,
    pub cql: &'static str,
    pub table: TableKind,
}

impl QueryTemplate {
    pub fn render(&self, keyspace: &str, table: &str) -> String {
        self.cql.replace("{keyspace}", keyspace).replace("{table}", table)
    }
}

// Events

pub const INSERT_EVENT: QueryTemplate = QueryTemplate {
    name: "insert_event",
    cql: "INSERT INTO {keyspace}.{table} (id, rev, pos, ts, data) VALUES (?, ?, ?, ?, ?)",
    table: TableKind::Events,
};

pub const LOAD_AGGREGATE_EVENTS: QueryTemplate = QueryTemplate {
    name: "load_aggregate_events",
    cql: "SELECT id, rev, pos, ts, data FROM {keyspace}.{table} WHERE id = ?",
    table: TableKind::Events,
};

pub const LOAD_AGGREGATE_EVENTS_DESC: QueryTemplate = QueryTemplate {
    name: "load_aggregate_events_desc",
    cql: "SELECT id, rev, pos, ts, data FROM {keyspace}.{table} WHERE id = ? ORDER BY rev DESC, pos DESC",
    table: TableKind::Events,
};

pub const LOAD_AGGREGATE_EVENT: QueryTemplate = QueryTemplate {
    name: "load_aggregate_event",
    cql: "SELECT id, rev, pos, ts, data FROM {keyspace}.{table} WHERE id = ? AND rev = ? AND pos = ?",
    table: TableKind::Events,
};

pub const DELETE_EVENT: QueryTemplate = QueryTemplate {
    name: "delete_event",
    cql: "DELETE FROM {keyspace}.{table} WHERE id = ? AND rev = ? AND pos = ?",
    table: TableKind::Events,
};

pub const SCAN_EVENTS: QueryTemplate = QueryTemplate {
    name: "scan_events",
    cql: "SELECT id, rev, pos, ts, data FROM {keyspace}.{table}",
    table: TableKind::Events,
};

// Index by event type

pub const INSERT_INDEX_RECORD: QueryTemplate = QueryTemplate {
    name: "insert_index_record",
    cql: "INSERT INTO {keyspace}.{table} (et, pid, aid, rev, pos, ts) VALUES (?, ?, ?, ?, ?, ?)",
    table: TableKind::IndexByEventType,
};

pub const DELETE_INDEX_RECORD: QueryTemplate = QueryTemplate {
    name: "delete_index_record",
    cql: "DELETE FROM {keyspace}.{table} WHERE et = ? AND pid = ? AND ts = ? AND aid = ? AND rev = ? AND pos = ?",
    table: TableKind::IndexByEventType,
};

pub const LOAD_INDEX_RECORDS: QueryTemplate = QueryTemplate {
    name: "load_index_records",
    cql: "SELECT aid, rev, pos, ts FROM {keyspace}.{table} WHERE et = ? AND pid = ? AND ts >= ? AND ts <= ?",
    table: TableKind::IndexByEventType,
};

pub const LOAD_INDEX_RECORDS_DESC: QueryTemplate = QueryTemplate {
    name: "load_index_records_desc",
    cql: "SELECT aid, rev, pos, ts FROM {keyspace}.{table} WHERE et = ? AND pid = ? AND ts >= ? AND ts <= ? ORDER BY ts DESC",
    table: TableKind::IndexByEventType,
};

// Index status

pub const GET_INDEX_STATUS: QueryTemplate = QueryTemplate {
    name: "get_index_status",
    cql: "SELECT status FROM {keyspace}.{table} WHERE id = ?",
    table: TableKind::IndexStatus,
};

pub const SAVE_INDEX_STATUS: QueryTemplate = QueryTemplate {
    name: "save_index_status",
    cql: "INSERT INTO {keyspace}.{table} (id, status) VALUES (?, ?)",
    table: TableKind::IndexStatus,
};

// Message counter

pub const UPDATE_MESSAGE_COUNTER: QueryTemplate = QueryTemplate {
    name: "update_message_counter",
    cql: "UPDATE {keyspace}.{table} SET cv = cv + ? WHERE msgid = ?",
    table: TableKind::MessageCounter,
};

pub const GET_MESSAGE_COUNTER: QueryTemplate = QueryTemplate {
    name: "get_message_counter",
    cql: "SELECT cv FROM {keyspace}.{table} WHERE msgid = ?",
    table: TableKind::MessageCounter,
};

/// Lazily prepares one template per tenant.
pub struct PreparedStatementCache {
    template: QueryTemplate,
    context: StoreContext,
    statements: SingleFlight<PreparedStatement>,
}

impl PreparedStatementCache {
    pub fn new(template: QueryTemplate, context: StoreContext) -> Self {
        let statements = SingleFlight::new(context.gate_timeout);
        Self {
            template,
            context,
            statements,
        }
    }

    pub fn template(&self) -> &QueryTemplate {
        &self.template
    }

    pub fn table_for(context: &StoreContext, table: TableKind) -> Result<String> {
        match table {
            TableKind::Events => context.tables.events_table(),
            TableKind::IndexByEventType => Ok(INDEX_BY_EVENT_TYPE_TABLE.to_string()),
            TableKind::IndexStatus => Ok(INDEX_STATUS_TABLE.to_string()),
            TableKind::MessageCounter => Ok(MESSAGE_COUNTER_TABLE.to_string()),
        }
    }

    /// The statement for the current tenant, preparing it on first use.
    pub async fn prepare(&self, session: &Session) -> Result<PreparedStatement> {
        let tenant = self.context.tenants.current_tenant()?;

        self.statements
            .get_or_try_init(&tenant, || async {
                let keyspace = self.context.sessions.keyspace(&tenant)?;
                let table = Self::table_for(&self.context, self.template.table)?;
                let cql = self.template.render(&keyspace, &table);

                let mut statement = session.prepare(cql).await.map_err(|source| {
                    tracing::error!(
                        template = self.template.name,
                        tenant = %tenant,
                        error = %source,
                        "Failed to prepare statement"
                    );
                    StoreError::Prepare {
                        template: self.template.name,
                        source,
                    }
                })?;
                statement.set_consistency(Consistency::Quorum);

                self.context.metrics.record_prepared(self.template.name);
                tracing::debug!(template = self.template.name, tenant = %tenant, "Prepared statement");
                Ok(statement)
            })
            .await
    }
}
