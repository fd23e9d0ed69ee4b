//! Pooled connections to the leader's forward endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::forward::{ForwardRequest, ForwardResponse};

/// Largest forward frame accepted in either direction.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// One connection able to carry forward calls, one at a time.
#[async_trait]
pub trait ForwardClient: Send {
    async fn forward(&mut self, request: &ForwardRequest) -> anyhow::Result<ForwardResponse>;
}

#[async_trait]
pub trait ClientPool: Send + Sync + 'static {
    async fn borrow(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn ForwardClient>>;

    /// Return a healthy connection for reuse.
    fn give_back(&self, addr: SocketAddr, client: Box<dyn ForwardClient>);

    /// Account for a connection that was dropped instead of returned.
    fn discard(&self, addr: SocketAddr);

    /// Connections currently checked out.
    fn borrowed(&self) -> usize;
}

/// A borrowed connection. Dropping it without `release` discards the
/// connection, so a failed or cancelled call never poisons the pool.
pub struct PooledClient {
    pool: Arc<dyn ClientPool>,
    addr: SocketAddr,
    client: Option<Box<dyn ForwardClient>>,
    healthy: bool,
}

impl PooledClient {
    pub async fn borrow(
        pool: Arc<dyn ClientPool>,
        addr: SocketAddr,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = pool.borrow(addr, timeout).await?;
        Ok(Self {
            pool,
            addr,
            client: Some(client),
            healthy: false,
        })
    }

    pub async fn forward(&mut self, request: &ForwardRequest) -> anyhow::Result<ForwardResponse> {
        let client = self
            .client
            .as_mut()
            .context("pooled forward client already released")?;
        client.forward(request).await
    }

    /// Hand the connection back to the pool.
    pub fn release(mut self) {
        self.healthy = true;
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        if self.healthy {
            self.pool.give_back(self.addr, client);
        } else {
            drop(client);
            self.pool.discard(self.addr);
        }
    }
}

/// JSON over length-delimited frames on a plain TCP stream.
pub struct TcpForwardClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl TcpForwardClient {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> anyhow::Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("connect to {addr} timed out"))?
            .with_context(|| format!("connect to {addr}"))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, codec()),
        })
    }
}

#[async_trait]
impl ForwardClient for TcpForwardClient {
    async fn forward(&mut self, request: &ForwardRequest) -> anyhow::Result<ForwardResponse> {
        let body = serde_json::to_vec(request)?;
        self.framed
            .send(Bytes::from(body))
            .await
            .context("send forward request")?;
        let frame = match self.framed.next().await {
            Some(frame) => frame.context("read forward response")?,
            None => anyhow::bail!("forward connection closed by peer"),
        };
        Ok(serde_json::from_slice(&frame)?)
    }
}

/// Keeps up to `max_idle` idle connections per address.
pub struct TcpClientPool {
    idle: Mutex<HashMap<SocketAddr, Vec<Box<dyn ForwardClient>>>>,
    max_idle: usize,
    borrowed: AtomicUsize,
}

impl TcpClientPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle,
            borrowed: AtomicUsize::new(0),
        }
    }

    pub fn idle(&self, addr: SocketAddr) -> usize {
        self.idle.lock().get(&addr).map_or(0, Vec::len)
    }
}

#[async_trait]
impl ClientPool for TcpClientPool {
    async fn borrow(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn ForwardClient>> {
        let reused = self.idle.lock().get_mut(&addr).and_then(Vec::pop);
        let client: Box<dyn ForwardClient> = match reused {
            Some(client) => client,
            None => {
                tracing::debug!(%addr, "opening forward connection");
                Box::new(TcpForwardClient::connect(addr, timeout).await?)
            }
        };
        self.borrowed.fetch_add(1, Ordering::SeqCst);
        Ok(client)
    }

    fn give_back(&self, addr: SocketAddr, client: Box<dyn ForwardClient>) {
        self.borrowed.fetch_sub(1, Ordering::SeqCst);
        let mut idle = self.idle.lock();
        let slot = idle.entry(addr).or_default();
        if slot.len() < self.max_idle {
            slot.push(client);
        }
    }

    fn discard(&self, addr: SocketAddr) {
        self.borrowed.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(%addr, "discarded forward connection");
    }

    fn borrowed(&self) -> usize {
        self.borrowed.load(Ordering::SeqCst)
    }
}
