use crate::config::{StoreSettings, TableMode};
use crate::error::{Result, StoreError};

// ============================================================================
// Keyspace & Table Naming
// ============================================================================
//
// CQL identifiers are stored lowercased. Keyspace and table names are limited
// to 48 characters of [a-z0-9_] and must start with a letter.
//
// ============================================================================

pub const MAX_IDENTIFIER_LEN: usize = 48;

pub const INDEX_BY_EVENT_TYPE_TABLE: &str = "index_by_eventtype";
pub const INDEX_STATUS_TABLE: &str = "index_status";
pub const MESSAGE_COUNTER_TABLE: &str = "message_counter";

/// Lowercase and validate a keyspace or table name.
pub fn validate_identifier(kind: &str, name: &str) -> Result<String> {
    let name = name.trim().to_lowercase();

    if name.is_empty() {
        return Err(StoreError::InvalidConfiguration(format!("{} name is empty", kind)));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(StoreError::InvalidConfiguration(format!(
            "{} name '{}' is {} characters long, the limit is {}",
            kind,
            name,
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }
    let starts_with_letter = name.chars().next().is_some_and(|c| c.is_ascii_lowercase());
    let valid_chars = name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !starts_with_letter || !valid_chars {
        return Err(StoreError::InvalidConfiguration(format!(
            "{} name '{}' must start with a letter and contain only [a-z0-9_]",
            kind, name
        )));
    }

    Ok(name)
}

/// Maps a tenant to the keyspace holding its data.
pub trait KeyspaceNamingStrategy: Send + Sync {
    fn keyspace_for(&self, tenant: &str) -> Result<String>;
}

/// `{tenant}_{base}`, e.g. `acme_eventstore`.
pub struct TenantPrefixedKeyspace {
    base: String,
}

impl TenantPrefixedKeyspace {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }
}

impl KeyspaceNamingStrategy for TenantPrefixedKeyspace {
    fn keyspace_for(&self, tenant: &str) -> Result<String> {
        if tenant.trim().is_empty() {
            return Err(StoreError::InvalidConfiguration("tenant is empty".into()));
        }
        validate_identifier("keyspace", &format!("{}_{}", tenant.trim(), self.base.trim()))
    }
}

/// Maps the logical event stream to its physical events table.
pub trait TableNamingStrategy: Send + Sync {
    fn events_table(&self) -> Result<String>;
}

/// `{bounded_context}_events`
pub struct PerBoundedContextTable {
    bounded_context: String,
}

impl PerBoundedContextTable {
    pub fn new(bounded_context: impl Into<String>) -> Self {
        Self { bounded_context: bounded_context.into() }
    }
}

impl TableNamingStrategy for PerBoundedContextTable {
    fn events_table(&self) -> Result<String> {
        validate_identifier("table", &format!("{}_events", self.bounded_context.trim()))
    }
}

/// Every bounded context shares `events`.
pub struct SingleTable;

impl TableNamingStrategy for SingleTable {
    fn events_table(&self) -> Result<String> {
        Ok("events".to_string())
    }
}

pub fn table_naming_from_settings(settings: &StoreSettings) -> Box<dyn TableNamingStrategy> {
    match settings.table_mode {
        TableMode::PerBoundedContext => Box::new(PerBoundedContextTable::new(settings.bounded_context.clone())),
        TableMode::SingleTable => Box::new(SingleTable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_are_lowercased() {
        assert_eq!(validate_identifier("table", "Sales_Events").unwrap(), "sales_events");
    }

    #[test]
    fn test_invalid_identifiers_are_rejected() {
        assert!(validate_identifier("keyspace", "").is_err());
        assert!(validate_identifier("keyspace", "1tenant").is_err());
        assert!(validate_identifier("keyspace", "tenant-one").is_err());
        assert!(validate_identifier("keyspace", &"a".repeat(MAX_IDENTIFIER_LEN)).is_ok());
        assert!(validate_identifier("keyspace", &"a".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
    }

    #[test]
    fn test_tenant_prefixed_keyspace() {
        let strategy = TenantPrefixedKeyspace::new("eventstore");
        assert_eq!(strategy.keyspace_for("Acme").unwrap(), "acme_eventstore");
        assert!(strategy.keyspace_for(" ").is_err());
        assert!(strategy.keyspace_for(&"t".repeat(40)).is_err());
    }

    #[test]
    fn test_table_naming_modes() {
        assert_eq!(PerBoundedContextTable::new("Billing").events_table().unwrap(), "billing_events");
        assert_eq!(SingleTable.events_table().unwrap(), "events");

        let settings = StoreSettings {
            table_mode: TableMode::SingleTable,
            ..StoreSettings::default()
        };
        assert_eq!(table_naming_from_settings(&settings).events_table().unwrap(), "events");
    }
}
