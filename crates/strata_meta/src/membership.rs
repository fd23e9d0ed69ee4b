//! Leader identity as seen by this node.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

/// Consumed view of the external election layer.
pub trait LeaderOracle: Send + Sync + 'static {
    fn is_leader(&self) -> bool;
    fn leader_address(&self) -> Option<SocketAddr>;
}

#[derive(Debug, Clone, Copy, Default)]
struct LeaderState {
    is_leader: bool,
    leader: Option<SocketAddr>,
}

/// A leader view that the membership layer updates in place.
#[derive(Clone, Default)]
pub struct SharedLeaderView {
    state: Arc<RwLock<LeaderState>>,
}

impl SharedLeaderView {
    pub fn new() -> Self {
        Self::default()
    }

    /// This node is the leader and serves forwarded statements on `addr`.
    pub fn leader(addr: Option<SocketAddr>) -> Self {
        let view = Self::new();
        view.become_leader(addr);
        view
    }

    /// Another node at `leader` is the leader.
    pub fn follower_of(leader: SocketAddr) -> Self {
        let view = Self::new();
        view.follow(Some(leader));
        view
    }

    pub fn become_leader(&self, addr: Option<SocketAddr>) {
        *self.state.write() = LeaderState {
            is_leader: true,
            leader: addr,
        };
    }

    pub fn follow(&self, leader: Option<SocketAddr>) {
        *self.state.write() = LeaderState {
            is_leader: false,
            leader,
        };
    }
}

impl LeaderOracle for SharedLeaderView {
    fn is_leader(&self) -> bool {
        self.state.read().is_leader
    }

    fn leader_address(&self) -> Option<SocketAddr> {
        self.state.read().leader
    }
}
