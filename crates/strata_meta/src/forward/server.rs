//! Accept side of the forward wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::error::MetaError;
use crate::forward::pool::codec;
use crate::forward::{ForwardRequest, ForwardResponse, ForwardResult, LeaderForwardExecutor};
use crate::membership::LeaderOracle;

/// Executes a forwarded statement on the leader.
#[async_trait]
pub trait StatementHandler: Send + Sync + 'static {
    async fn execute(&self, request: &ForwardRequest) -> anyhow::Result<ForwardResult>;
}

/// Serves forwarded statements. On the leader they run through the handler;
/// anywhere else they are relayed one hop further.
pub struct ForwardServer {
    leader: Arc<dyn LeaderOracle>,
    handler: Arc<dyn StatementHandler>,
    executor: Arc<LeaderForwardExecutor>,
    relay_timeout: Duration,
}

impl ForwardServer {
    pub fn new(
        leader: Arc<dyn LeaderOracle>,
        handler: Arc<dyn StatementHandler>,
        executor: Arc<LeaderForwardExecutor>,
        relay_timeout: Duration,
    ) -> Self {
        Self {
            leader,
            handler,
            executor,
            relay_timeout,
        }
    }

    /// Bind `addr` and serve until `cancel` fires. Returns the bound address,
    /// which differs from `addr` when port 0 was requested.
    pub async fn spawn(
        self: Arc<Self>,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> anyhow::Result<(SocketAddr, JoinHandle<anyhow::Result<()>>)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "forward server listening");
        let task = tokio::spawn(self.serve(listener, cancel));
        Ok((local, task))
    }

    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            let (socket, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let server = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    res = server.handle_conn(socket) => {
                        if let Err(err) = res {
                            tracing::debug!(error = ?err, %peer, "forward connection closed");
                        }
                    }
                }
            });
        }
    }

    async fn handle_conn(&self, socket: TcpStream) -> anyhow::Result<()> {
        socket.set_nodelay(true)?;
        let mut framed = Framed::new(socket, codec());
        while let Some(frame) = framed.next().await {
            let frame = frame?;
            let response = match serde_json::from_slice::<ForwardRequest>(&frame) {
                Ok(request) => self.respond(&request).await,
                Err(err) => ForwardResponse::Failed {
                    code: "ERR_BAD_FORWARD_REQUEST".to_string(),
                    message: err.to_string(),
                },
            };
            framed.send(Bytes::from(serde_json::to_vec(&response)?)).await?;
        }
        Ok(())
    }

    /// Answer one request.
    pub async fn respond(&self, request: &ForwardRequest) -> ForwardResponse {
        let result = if self.leader.is_leader() {
            self.execute_local(request).await
        } else {
            self.executor
                .forward_request(request, self.relay_timeout)
                .await
        };
        match result {
            Ok(result) => ForwardResponse::Ok(result),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    code = err.code(),
                    query_id = %request.query_id,
                    forward_times = request.forward_times,
                    "forwarded statement failed"
                );
                ForwardResponse::failed(&err)
            }
        }
    }

    async fn execute_local(&self, request: &ForwardRequest) -> Result<ForwardResult, MetaError> {
        let max_forward_times = self.executor.max_forward_times();
        if request.forward_times > max_forward_times {
            return Err(MetaError::ForwardTooManyTimes {
                forward_times: request.forward_times,
                max_forward_times,
            });
        }
        tracing::debug!(
            query_id = %request.query_id,
            forward_times = request.forward_times,
            warehouse = %request.warehouse_name,
            "executing forwarded statement"
        );
        self.handler
            .execute(request)
            .await
            .map_err(|err| MetaError::LeaderExecution(format!("{err:#}")))
    }
}
