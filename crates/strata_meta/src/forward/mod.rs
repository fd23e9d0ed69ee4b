//! Forwarding statements from any node to the leader.
//!
//! Each relay bumps `forward_times`; a request that already made
//! `max_forward_times` hops is rejected instead of relayed, which stops
//! loops when nodes disagree about who leads.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MetaError, Result};
use crate::membership::LeaderOracle;
use crate::warehouse::{WarehouseCatalog, WarehouseRef};

mod pool;
mod server;

pub use pool::{ClientPool, ForwardClient, PooledClient, TcpClientPool, TcpForwardClient, MAX_FRAME_BYTES};
pub use server::{ForwardServer, StatementHandler};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user: String,
    pub host: String,
}

/// Audit fields filled in while a statement runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditEvent {
    pub resource_group: Option<String>,
}

/// The caller's session, as far as forwarding is concerned.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user: UserIdentity,
    pub warehouse: WarehouseRef,
    pub query_id: String,
    pub forward_times: u32,
    pub audit: AuditEvent,
}

impl SessionContext {
    pub fn new(user: UserIdentity, warehouse: WarehouseRef) -> Self {
        Self {
            user,
            warehouse,
            query_id: Uuid::new_v4().to_string(),
            forward_times: 0,
            audit: AuditEvent::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub sql: String,
    pub user: UserIdentity,
    pub warehouse_id: u64,
    pub warehouse_name: String,
    pub query_id: String,
    pub forward_times: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditMeta {
    #[serde(default)]
    pub resource_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardResult {
    /// Opaque statement result.
    pub payload: serde_json::Value,
    #[serde(default)]
    pub audit: AuditMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ForwardResponse {
    Ok(ForwardResult),
    Failed { code: String, message: String },
}

impl ForwardResponse {
    pub fn failed(err: &MetaError) -> Self {
        ForwardResponse::Failed {
            code: err.code().to_string(),
            message: err.wire_message(),
        }
    }
}

pub struct LeaderForwardExecutor {
    leader: Arc<dyn LeaderOracle>,
    warehouses: Arc<dyn WarehouseCatalog>,
    pool: Arc<dyn ClientPool>,
    max_forward_times: u32,
}

impl LeaderForwardExecutor {
    pub fn new(
        leader: Arc<dyn LeaderOracle>,
        warehouses: Arc<dyn WarehouseCatalog>,
        pool: Arc<dyn ClientPool>,
        max_forward_times: u32,
    ) -> Self {
        Self {
            leader,
            warehouses,
            pool,
            max_forward_times,
        }
    }

    pub fn max_forward_times(&self) -> u32 {
        self.max_forward_times
    }

    fn check_hops(&self, forward_times: u32) -> Result<()> {
        if forward_times >= self.max_forward_times {
            tracing::warn!(
                forward_times,
                max_forward_times = self.max_forward_times,
                "refusing to forward statement again"
            );
            return Err(MetaError::ForwardTooManyTimes {
                forward_times,
                max_forward_times: self.max_forward_times,
            });
        }
        Ok(())
    }

    /// Build the wire request for `sql`, resolving the session's warehouse.
    pub fn build_request(&self, sql: &str, session: &SessionContext) -> Result<ForwardRequest> {
        self.check_hops(session.forward_times)?;
        let warehouse = self.warehouses.resolve(&session.warehouse)?;
        Ok(ForwardRequest {
            sql: sql.to_string(),
            user: session.user.clone(),
            warehouse_id: warehouse.id,
            warehouse_name: warehouse.name,
            query_id: session.query_id.clone(),
            forward_times: session.forward_times + 1,
        })
    }

    /// Run `sql` on the leader and relay its result as if it ran here.
    pub async fn execute(
        &self,
        sql: &str,
        session: &mut SessionContext,
        timeout: Duration,
    ) -> Result<ForwardResult> {
        let request = self.build_request(sql, session)?;
        let result = self.send(&request, timeout).await?;
        session.audit.resource_group = result.audit.resource_group.clone();
        Ok(result)
    }

    /// Relay a request this node received but cannot serve itself.
    pub async fn forward_request(
        &self,
        received: &ForwardRequest,
        timeout: Duration,
    ) -> Result<ForwardResult> {
        self.check_hops(received.forward_times)?;
        let request = ForwardRequest {
            forward_times: received.forward_times + 1,
            ..received.clone()
        };
        self.send(&request, timeout).await
    }

    async fn send(&self, request: &ForwardRequest, timeout: Duration) -> Result<ForwardResult> {
        let leader = self
            .leader
            .leader_address()
            .ok_or(MetaError::LeaderUnknown)?;
        let exchange = async {
            let mut client = PooledClient::borrow(self.pool.clone(), leader, timeout).await?;
            let response = client.forward(request).await?;
            client.release();
            anyhow::Ok(response)
        };
        let response = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => {
                tracing::warn!(error = ?source, %leader, query_id = %request.query_id, "forward to leader failed");
                return Err(MetaError::ForwardTransport { leader, source });
            }
            Err(_) => {
                tracing::warn!(%leader, query_id = %request.query_id, "forward to leader timed out");
                return Err(MetaError::ForwardTimeout {
                    leader,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };
        tracing::debug!(
            %leader,
            query_id = %request.query_id,
            forward_times = request.forward_times,
            "statement forwarded"
        );
        match response {
            ForwardResponse::Ok(result) => Ok(result),
            ForwardResponse::Failed { code, message } => Err(MetaError::from_wire(code, message)),
        }
    }
}
