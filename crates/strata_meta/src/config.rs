//! Node options, parsed by clap from flags or `STRATA_*` environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

const DEFAULT_REPLAY_WAIT: Duration = Duration::from_secs(5);

/// Command-line options for the metadata core of one node.
#[derive(Parser, Debug, Clone)]
#[command(name = "strata-meta")]
pub struct NodeArgs {
    /// Task-run history records kept after GC.
    #[arg(long, env = "STRATA_TASK_RUNS_MAX_HISTORY", default_value_t = 10_000)]
    pub task_runs_max_history: usize,

    #[arg(long, env = "STRATA_HISTORY_GC_INTERVAL_MS", default_value_t = 60_000)]
    pub history_gc_interval_ms: u64,

    /// Forward hops allowed before a statement is rejected.
    #[arg(long, env = "STRATA_MAX_FORWARD_TIMES", default_value_t = 2)]
    pub max_forward_times: u32,

    #[arg(long, env = "STRATA_FORWARD_TIMEOUT_MS", default_value_t = 300_000)]
    pub forward_timeout_ms: u64,

    #[arg(long, env = "STRATA_ALTER_SCHEDULER_INTERVAL_MS", default_value_t = 10_000)]
    pub scheduler_interval_ms: u64,

    /// Default alter job timeout.
    #[arg(long, env = "STRATA_ALTER_TIMEOUT_SECS", default_value_t = 86_400)]
    pub job_timeout_secs: u64,

    /// Serve forwarded statements on this address.
    #[arg(long, env = "STRATA_LISTEN_FORWARD")]
    pub listen_forward: Option<SocketAddr>,

    /// Idle connections kept per leader address.
    #[arg(long, env = "STRATA_FORWARD_POOL_IDLE", default_value_t = 8)]
    pub forward_pool_idle: usize,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub default_job_timeout: Duration,
    /// Upper bound on waiting for replay to reach an entry the scheduler appended.
    pub replay_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub max_history: usize,
    pub gc_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub max_forward_times: u32,
    pub timeout: Duration,
    pub pool_idle: usize,
    pub listen: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct MetaConfig {
    pub scheduler: SchedulerConfig,
    pub history: HistoryConfig,
    pub forward: ForwardConfig,
}

impl MetaConfig {
    pub fn from_args(args: &NodeArgs) -> anyhow::Result<Self> {
        anyhow::ensure!(args.max_forward_times > 0, "max-forward-times must be at least 1");
        anyhow::ensure!(
            args.scheduler_interval_ms > 0,
            "scheduler-interval-ms must be positive"
        );
        anyhow::ensure!(
            args.history_gc_interval_ms > 0,
            "history-gc-interval-ms must be positive"
        );
        Ok(Self {
            scheduler: SchedulerConfig {
                tick_interval: Duration::from_millis(args.scheduler_interval_ms),
                default_job_timeout: Duration::from_secs(args.job_timeout_secs),
                replay_wait: DEFAULT_REPLAY_WAIT,
            },
            history: HistoryConfig {
                max_history: args.task_runs_max_history,
                gc_interval: Duration::from_millis(args.history_gc_interval_ms),
            },
            forward: ForwardConfig {
                max_forward_times: args.max_forward_times,
                timeout: Duration::from_millis(args.forward_timeout_ms),
                pool_idle: args.forward_pool_idle,
                listen: args.listen_forward,
            },
        })
    }
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig {
                tick_interval: Duration::from_secs(10),
                default_job_timeout: Duration::from_secs(86_400),
                replay_wait: DEFAULT_REPLAY_WAIT,
            },
            history: HistoryConfig {
                max_history: 10_000,
                gc_interval: Duration::from_secs(60),
            },
            forward: ForwardConfig {
                max_forward_times: 2,
                timeout: Duration::from_secs(300),
                pool_idle: 8,
                listen: None,
            },
        }
    }
}
