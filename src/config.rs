use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, StoreError};

// ============================================================================
// Store Settings
// ============================================================================
//
// Defaults target a local single-node ScyllaDB. Every field can be overridden
// from the environment:
//
//   SCYLLA_NODES                   comma separated host:port list
//   EVENTSTORE_KEYSPACE            base keyspace name (tenant is prefixed)
//   EVENTSTORE_TENANT              tenant used by the bootstrap binary
//   EVENTSTORE_BOUNDED_CONTEXT     bounded context owning the events table
//   EVENTSTORE_TABLE_MODE          "per_bounded_context" | "single_table"
//   EVENTSTORE_REPLICATION_FACTOR  SimpleStrategy replication factor
//   EVENTSTORE_GATE_TIMEOUT_SECS   single-flight initialization timeout
//   EVENTSTORE_BATCH_SIZE          replay page size
//   EVENTSTORE_PARALLELISM         replay callbacks in flight per channel
//   EVENTSTORE_INDEX_EPOCH_MS      earliest event timestamp (ms) in the type
//                                  index; required by the ScyllaDB index store
//
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableMode {
    /// One events table per bounded context (`{context}_events`).
    #[default]
    PerBoundedContext,
    /// A single `events` table shared by every bounded context.
    SingleTable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub known_nodes: Vec<String>,
    pub keyspace: String,
    pub tenant: String,
    pub bounded_context: String,
    pub table_mode: TableMode,
    pub replication_factor: u32,
    pub gate_timeout_secs: u64,
    pub batch_size: i32,
    pub max_degree_of_parallelism: usize,
    /// Lower bound of open-ended index reads. Must not be later than the
    /// oldest indexed event.
    pub index_epoch_ms: Option<i64>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            known_nodes: vec!["127.0.0.1:9042".to_string()],
            keyspace: "eventstore".to_string(),
            tenant: "default".to_string(),
            bounded_context: "default".to_string(),
            table_mode: TableMode::PerBoundedContext,
            replication_factor: 1,
            gate_timeout_secs: 10,
            batch_size: 1000,
            max_degree_of_parallelism: 2,
            index_epoch_ms: None,
        }
    }
}

impl StoreSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key/value source (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(nodes) = lookup("SCYLLA_NODES") {
            settings.known_nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(keyspace) = lookup("EVENTSTORE_KEYSPACE") {
            settings.keyspace = keyspace;
        }
        if let Some(tenant) = lookup("EVENTSTORE_TENANT") {
            settings.tenant = tenant;
        }
        if let Some(context) = lookup("EVENTSTORE_BOUNDED_CONTEXT") {
            settings.bounded_context = context;
        }
        if let Some(mode) = lookup("EVENTSTORE_TABLE_MODE") {
            settings.table_mode = match mode.as_str() {
                "per_bounded_context" => TableMode::PerBoundedContext,
                "single_table" => TableMode::SingleTable,
                other => {
                    return Err(StoreError::InvalidConfiguration(format!(
                        "unknown EVENTSTORE_TABLE_MODE '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(value) = lookup("EVENTSTORE_REPLICATION_FACTOR") {
            settings.replication_factor = parse_number("EVENTSTORE_REPLICATION_FACTOR", &value)?;
        }
        if let Some(value) = lookup("EVENTSTORE_GATE_TIMEOUT_SECS") {
            settings.gate_timeout_secs = parse_number("EVENTSTORE_GATE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("EVENTSTORE_BATCH_SIZE") {
            settings.batch_size = parse_number("EVENTSTORE_BATCH_SIZE", &value)?;
        }
        if let Some(value) = lookup("EVENTSTORE_PARALLELISM") {
            settings.max_degree_of_parallelism = parse_number("EVENTSTORE_PARALLELISM", &value)?;
        }

        if let Some(value) = lookup("EVENTSTORE_INDEX_EPOCH_MS") {
            settings.index_epoch_ms = Some(parse_number("EVENTSTORE_INDEX_EPOCH_MS", &value)?);
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.known_nodes.is_empty() {
            return Err(StoreError::InvalidConfiguration("no ScyllaDB nodes configured".into()));
        }
        if self.keyspace.trim().is_empty() {
            return Err(StoreError::InvalidConfiguration("keyspace must not be empty".into()));
        }
        if self.tenant.trim().is_empty() {
            return Err(StoreError::InvalidConfiguration("tenant must not be empty".into()));
        }
        if self.bounded_context.trim().is_empty() {
            return Err(StoreError::InvalidConfiguration("bounded context must not be empty".into()));
        }
        if self.replication_factor == 0 {
            return Err(StoreError::InvalidConfiguration("replication factor must be at least 1".into()));
        }
        if self.gate_timeout_secs == 0 {
            return Err(StoreError::InvalidConfiguration("gate timeout must be positive".into()));
        }
        if self.batch_size <= 0 {
            return Err(StoreError::InvalidConfiguration("batch size must be positive".into()));
        }
        if self.index_epoch_ms.is_some_and(|epoch| epoch < 0) {
            return Err(StoreError::InvalidConfiguration("index epoch must not be negative".into()));
        }
        Ok(())
    }

    /// The index epoch, required wherever the type index is read.
    pub fn index_epoch(&self) -> Result<i64> {
        self.index_epoch_ms.ok_or_else(|| {
            StoreError::InvalidConfiguration(
                "EVENTSTORE_INDEX_EPOCH_MS must be set to the timestamp of the oldest indexed event".into(),
            )
        })
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_timeout_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| StoreError::InvalidConfiguration(format!("{} is not a valid number: '{}'", key, value)))
}
