use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

use crate::metrics::{analyze, SyncMetrics};
use crate::state_sync::StateSynchronizer;

const METRICS_EVERY_MS: u64 = 1_000;

/// Owner of a running sync loop. Dropping it without `stop` leaves the task
/// running until the runtime shuts down.
pub struct LoopHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub fn spawn_sync_loop<F, G>(
    sync: Arc<StateSynchronizer>,
    interval_ms: u64,
    on_metrics: F,
    on_event: G,
) -> LoopHandle
where
    F: Fn(&SyncMetrics) + Send + Sync + 'static,
    G: Fn(&str) + Send + Sync + 'static,
{
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(run_loop(sync, interval_ms, on_metrics, on_event, rx));
    LoopHandle { shutdown, task }
}

pub async fn run_loop<F, G>(
    sync: Arc<StateSynchronizer>,
    interval_ms: u64,
    on_metrics: F,
    on_event: G,
    mut shutdown: watch::Receiver<bool>,
) where
    F: Fn(&SyncMetrics) + Send + Sync + 'static,
    G: Fn(&str) + Send + Sync + 'static,
{
    let tick_ms = interval_ms.max(10);
    let mut ticker = interval(Duration::from_millis(tick_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut elapsed_since_metrics = 0u64;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("sync_loop.stopped");
                    break;
                }
            }
            _ = ticker.tick() => {
                for report in sync.reconcile() {
                    let line = json!({
                        "ev": "coherence",
                        "meta": {
                            "node": report.node_id,
                            "role": report.role,
                            "level": report.level,
                            "stale_for_ms": report.stale_for_ms,
                        }
                    })
                    .to_string();
                    on_event(&line);
                }
                elapsed_since_metrics += tick_ms;
                if elapsed_since_metrics >= METRICS_EVERY_MS {
                    elapsed_since_metrics = 0;
                    let status = sync.status();
                    let nodes = sync.nodes();
                    let metrics = analyze(&status, &nodes, sync.now_ms(), sync.config().staleness_ms);
                    on_metrics(&metrics);
                }
            }
        }
    }
}
