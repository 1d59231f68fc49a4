// ============================================================================
// ScyllaDB Backend
// ============================================================================
//
// Every statement is fully qualified with the tenant keyspace and prepared
// lazily per tenant. Paging uses the driver's single-page execution so the
// continuation token can be handed back to callers.
//
// ============================================================================

pub mod counter;
pub mod event_store;
pub mod index_store;
pub mod naming;
pub mod schema;
pub mod session;
pub mod single_flight;
pub mod statements;
pub mod status;

use scylla::client::session::Session;
use scylla::response::{PagingState as DriverPagingState, PagingStateResponse};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StoreSettings;
use crate::error::Result;
use crate::event_sourcing::core::{AggregateId, PagingState, RawEvent};
use crate::metrics::StoreMetrics;

pub use counter::ScyllaMessageCounter;
pub use event_store::ScyllaEventStore;
pub use index_store::ScyllaIndexStore;
pub use naming::{
    KeyspaceNamingStrategy, PerBoundedContextTable, SingleTable, TableNamingStrategy, TenantPrefixedKeyspace,
};
pub use schema::StorageManager;
pub use session::{FixedTenant, ScyllaSessionProvider, SessionProvider, TaskLocalTenant, TenantContext};
pub use statements::{PreparedStatementCache, QueryTemplate};
pub use status::ScyllaIndexStatusStore;

/// Everything a ScyllaDB-backed store needs to resolve sessions, keyspaces
/// and tables for the current tenant.
#[derive(Clone)]
pub struct StoreContext {
    pub sessions: Arc<dyn SessionProvider>,
    pub tenants: Arc<dyn TenantContext>,
    pub tables: Arc<dyn TableNamingStrategy>,
    pub metrics: Arc<StoreMetrics>,
    pub gate_timeout: Duration,
}

impl StoreContext {
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        tenants: Arc<dyn TenantContext>,
        tables: Arc<dyn TableNamingStrategy>,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        Self {
            sessions,
            tenants,
            tables,
            metrics,
            gate_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_gate_timeout(mut self, gate_timeout: Duration) -> Self {
        self.gate_timeout = gate_timeout;
        self
    }

    /// Single-tenant context built from settings.
    pub fn from_settings(settings: &StoreSettings, metrics: Arc<StoreMetrics>) -> Result<Self> {
        settings.validate()?;
        let sessions = Arc::new(ScyllaSessionProvider::from_settings(settings)?);
        let tenants = Arc::new(FixedTenant::new(settings.tenant.clone()));
        let tables: Arc<dyn TableNamingStrategy> = Arc::from(naming::table_naming_from_settings(settings));

        Ok(Self::new(sessions, tenants, tables, metrics).with_gate_timeout(settings.gate_timeout()))
    }

    pub async fn session(&self) -> Result<Arc<Session>> {
        let tenant = self.tenants.current_tenant()?;
        self.sessions.get_session(&tenant).await
    }

    pub fn keyspace(&self) -> Result<String> {
        let tenant = self.tenants.current_tenant()?;
        self.sessions.keyspace(&tenant)
    }

    pub fn statement(&self, template: QueryTemplate) -> PreparedStatementCache {
        PreparedStatementCache::new(template, self.clone())
    }
}

// ============================================================================
// Driver Glue
// ============================================================================

/// `(id, rev, pos, ts, data)` as selected by the event templates.
pub(crate) type EventRow = (Vec<u8>, i32, i32, i64, Vec<u8>);

pub(crate) fn raw_event_from_row(row: EventRow) -> Result<RawEvent> {
    let (id, revision, position, timestamp, data) = row;
    Ok(RawEvent {
        aggregate_id: AggregateId::from_slice(&id)?,
        revision,
        position,
        timestamp,
        data,
    })
}

pub(crate) fn driver_paging_state(token: Option<&[u8]>) -> DriverPagingState {
    match token {
        Some(bytes) => DriverPagingState::new_from_raw_bytes(bytes),
        None => DriverPagingState::start(),
    }
}

/// Continuation token from a driver response, `None` on the last page.
///
/// A "more pages" response without token bytes cannot be resumed and is
/// treated as the last page.
pub(crate) fn continuation_token(response: PagingStateResponse) -> Option<Vec<u8>> {
    match response.into_paging_control_flow() {
        ControlFlow::Continue(state) => match state.as_bytes_slice() {
            Some(bytes) if !bytes.is_empty() => Some(bytes.to_vec()),
            _ => {
                tracing::warn!("Driver reported more pages without a paging state; ending the scan");
                None
            }
        },
        ControlFlow::Break(()) => None,
    }
}

pub(crate) fn next_paging_state(response: PagingStateResponse) -> PagingState {
    PagingState::after_page(continuation_token(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_token() {
        let more = PagingStateResponse::HasMorePages {
            state: DriverPagingState::new_from_raw_bytes(vec![1u8, 2, 3]),
        };
        assert_eq!(continuation_token(more), Some(vec![1, 2, 3]));
        assert_eq!(continuation_token(PagingStateResponse::NoMorePages), None);
    }

    #[test]
    fn test_more_pages_without_state_ends_the_scan() {
        let empty = PagingStateResponse::HasMorePages {
            state: DriverPagingState::start(),
        };
        assert_eq!(continuation_token(empty), None);

        let empty_bytes = PagingStateResponse::HasMorePages {
            state: DriverPagingState::new_from_raw_bytes(Vec::<u8>::new()),
        };
        let next = next_paging_state(empty_bytes);
        assert!(next.is_finished());
    }

    #[test]
    fn test_driver_paging_state_round_trip() {
        assert!(driver_paging_state(None).as_bytes_slice().is_none());
        let state = driver_paging_state(Some(&[9, 9]));
        assert_eq!(state.as_bytes_slice().map(|b| b.to_vec()), Some(vec![9, 9]));
    }
}
