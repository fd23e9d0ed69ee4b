//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use strata_log::ReplicatedLog;
use strata_meta::forward::{
    AuditMeta, ClientPool, ForwardRequest, ForwardResult, StatementHandler, UserIdentity,
};
use strata_meta::job::{OptimizeJobSpec, PartitionSpec, ReplicaState, TabletPlacement};
use strata_meta::local::LocalCluster;
use strata_meta::membership::SharedLeaderView;
use strata_meta::warehouse::{StaticWarehouses, Warehouse};
use strata_meta::{MetaConfig, MetaNode, NodeDeps};

/// Upper bound for anything a test waits on.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Answers every statement, remembering the requests it saw.
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<ForwardRequest>>,
}

#[async_trait]
impl StatementHandler for RecordingHandler {
    async fn execute(&self, request: &ForwardRequest) -> anyhow::Result<ForwardResult> {
        self.seen.lock().push(request.clone());
        anyhow::ensure!(!request.sql.contains("missing_table"), "unknown table missing_table");
        Ok(ForwardResult {
            payload: serde_json::json!({
                "sql": request.sql,
                "forward_times": request.forward_times,
            }),
            audit: AuditMeta {
                resource_group: Some("default_rg".to_string()),
            },
        })
    }
}

pub fn warehouses() -> StaticWarehouses {
    StaticWarehouses::new([Warehouse {
        id: 10001,
        name: "wh1".to_string(),
    }])
}

pub fn root() -> UserIdentity {
    UserIdentity {
        user: "root".to_string(),
        host: "127.0.0.1".to_string(),
    }
}

/// Long ticks; tests drive the scheduler with `run_once`.
pub fn test_config(listen: Option<SocketAddr>) -> MetaConfig {
    let mut cfg = MetaConfig::default();
    cfg.scheduler.tick_interval = Duration::from_secs(3600);
    cfg.history.gc_interval = Duration::from_secs(3600);
    cfg.forward.timeout = Duration::from_secs(2);
    cfg.forward.listen = listen;
    cfg
}

pub struct TestNode {
    pub node: MetaNode,
    pub leader: SharedLeaderView,
    pub cluster: LocalCluster,
    pub handler: Arc<RecordingHandler>,
}

pub async fn start_node(
    cfg: MetaConfig,
    log: Arc<dyn ReplicatedLog>,
    leader: SharedLeaderView,
    pool: Option<Arc<dyn ClientPool>>,
) -> TestNode {
    let cluster = LocalCluster::default();
    cluster.placement.mark_all(&orders_spec(4, None), ReplicaState::Normal);
    let handler = Arc::new(RecordingHandler::default());
    let node = MetaNode::start(
        cfg,
        NodeDeps {
            log,
            leader: Arc::new(leader.clone()),
            env: cluster.env(),
            warehouses: Arc::new(warehouses()),
            handler: Some(handler.clone()),
            pool,
        },
    )
    .await
    .expect("start meta node");
    TestNode {
        node,
        leader,
        cluster,
        handler,
    }
}

pub fn orders_spec(partitions: u64, timeout_ms: Option<u64>) -> OptimizeJobSpec {
    OptimizeJobSpec {
        db_id: 11,
        table_id: 22,
        table_name: "orders".to_string(),
        partitions: (0..partitions)
            .map(|idx| PartitionSpec {
                partition_id: 300 + idx,
                partition_name: format!("p{idx}"),
                tablets: vec![TabletPlacement {
                    tablet_id: 5000 + idx,
                    replicas: vec![1, 2, 3],
                }],
            })
            .collect(),
        timeout_ms,
    }
}

/// Poll `check` until it holds or `IO_TIMEOUT` passes.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + IO_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// An address nothing listens on.
pub fn closed_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
    listener.local_addr().expect("probe addr")
}
