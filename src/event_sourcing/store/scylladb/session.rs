use async_trait::async_trait;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::naming::{KeyspaceNamingStrategy, TenantPrefixedKeyspace};
use super::single_flight::SingleFlight;
use crate::config::StoreSettings;
use crate::error::{Result, StoreError};

// ============================================================================
// Tenants & Sessions
// ============================================================================

/// Resolves the tenant an operation runs for.
pub trait TenantContext: Send + Sync {
    fn current_tenant(&self) -> Result<String>;
}

/// Single-tenant deployments.
pub struct FixedTenant(String);

impl FixedTenant {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self(tenant.into())
    }
}

impl TenantContext for FixedTenant {
    fn current_tenant(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

tokio::task_local! {
    static CURRENT_TENANT: String;
}

/// Tenant carried by the running task, set with [`TaskLocalTenant::scope`].
///
/// Tasks spawned inside the scope do not inherit it.
pub struct TaskLocalTenant;

impl TaskLocalTenant {
    pub async fn scope<F: Future>(tenant: impl Into<String>, f: F) -> F::Output {
        CURRENT_TENANT.scope(tenant.into(), f).await
    }
}

impl TenantContext for TaskLocalTenant {
    fn current_tenant(&self) -> Result<String> {
        CURRENT_TENANT
            .try_with(|tenant| tenant.clone())
            .map_err(|_| StoreError::InvalidConfiguration("no tenant in scope for this task".into()))
    }
}

/// Hands out a connected session and the keyspace for a tenant.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn get_session(&self, tenant: &str) -> Result<Arc<Session>>;

    fn keyspace(&self, tenant: &str) -> Result<String>;
}

/// One driver session per tenant, connected on first use.
pub struct ScyllaSessionProvider {
    known_nodes: Vec<String>,
    keyspaces: Arc<dyn KeyspaceNamingStrategy>,
    sessions: SingleFlight<Arc<Session>>,
}

impl ScyllaSessionProvider {
    pub fn new(
        known_nodes: Vec<String>,
        keyspaces: Arc<dyn KeyspaceNamingStrategy>,
        gate_timeout: Duration,
    ) -> Result<Self> {
        if known_nodes.is_empty() {
            return Err(StoreError::InvalidConfiguration("no ScyllaDB nodes configured".into()));
        }
        Ok(Self {
            known_nodes,
            keyspaces,
            sessions: SingleFlight::new(gate_timeout),
        })
    }

    pub fn from_settings(settings: &StoreSettings) -> Result<Self> {
        Self::new(
            settings.known_nodes.clone(),
            Arc::new(TenantPrefixedKeyspace::new(settings.keyspace.clone())),
            settings.gate_timeout(),
        )
    }
}

#[async_trait]
impl SessionProvider for ScyllaSessionProvider {
    async fn get_session(&self, tenant: &str) -> Result<Arc<Session>> {
        self.sessions
            .get_or_try_init(tenant, || async {
                tracing::info!(tenant = %tenant, nodes = ?self.known_nodes, "Connecting to ScyllaDB");
                let session = SessionBuilder::new()
                    .known_nodes(&self.known_nodes)
                    .build()
                    .await
                    .map_err(|e| StoreError::Connection(e.to_string()))?;
                Ok(Arc::new(session))
            })
            .await
    }

    fn keyspace(&self, tenant: &str) -> Result<String> {
        self.keyspaces.keyspace_for(tenant)
    }
}
