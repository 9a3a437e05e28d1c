// src/core/cluster/shutdown.rs

//! The Concurrent Shutdown Orchestrator (§4.9): priority-batched, bounded-parallel stop
//! of local instances, with a separate busy-instance tracker.

use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

use crate::core::cluster::instance::{Instance, InstanceRuntime, VOLATILE_LAST_STATE_POWER};
use crate::core::errors::log_and_drop;
use crate::core::metrics::SHUTDOWN_FORCE_RELEASED_TOTAL;

const DEFAULT_PER_INSTANCE_TIMEOUT: Duration = Duration::from_secs(30);
const BUSY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Sorts instances by `boot.stop.priority` descending, `name` ascending (§4.9 step 1),
/// then partitions into contiguous equal-priority batches (step 2).
pub fn sort_and_batch(mut instances: Vec<Instance>) -> Vec<Vec<Instance>> {
    instances.sort_by(|a, b| b.stop_priority.cmp(&a.stop_priority).then(a.name.cmp(&b.name)));

    let mut batches: Vec<Vec<Instance>> = Vec::new();
    for instance in instances {
        match batches.last_mut() {
            Some(batch) if batch[0].stop_priority == instance.stop_priority => {
                batch.push(instance);
            }
            _ => batches.push(vec![instance]),
        }
    }
    batches
}

/// Snapshot of in-flight operations keyed by instance URL/name, as supplied by the
/// caller (§4.9 "optional snapshot of in-flight operations keyed by instance URL").
pub type BusyOperations = HashMap<String, bool>;

pub struct ShutdownOrchestrator {
    runtime: Arc<dyn InstanceRuntime>,
    per_instance_timeout: Duration,
    deadline: Duration,
}

impl ShutdownOrchestrator {
    pub fn new(runtime: Arc<dyn InstanceRuntime>, per_instance_timeout: Duration, deadline: Duration) -> Self {
        Self {
            runtime,
            per_instance_timeout: if per_instance_timeout.is_zero() {
                DEFAULT_PER_INSTANCE_TIMEOUT
            } else {
                per_instance_timeout
            },
            deadline,
        }
    }

    /// Runs the full shutdown sequence: blocks between priority batches, dispatches a
    /// bounded worker pool within each batch, and force-releases any still-busy
    /// instance once the overall deadline expires.
    pub async fn run(&self, instances: Vec<Instance>, busy: BusyOperations) {
        let batches = sort_and_batch(instances);
        let deadline_at = Instant::now() + self.deadline;

        for batch in batches {
            self.run_batch(batch, &busy, deadline_at).await;
        }
    }

    async fn run_batch(&self, batch: Vec<Instance>, busy: &BusyOperations, deadline_at: Instant) {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(batch.len().max(1));
        let semaphore = Arc::new(Semaphore::new(worker_count));
        let released = Arc::new(DashSet::new());

        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<Instance>();
        let busy_names: Vec<String> = batch
            .iter()
            .filter(|i| *busy.get(&i.name).unwrap_or(&false))
            .map(|i| i.name.clone())
            .collect();
        let not_busy: Vec<Instance> = batch
            .iter()
            .filter(|i| !busy.get(&i.name).copied().unwrap_or(false))
            .cloned()
            .collect();

        for instance in not_busy {
            let _ = ready_tx.send(instance);
        }

        if !busy_names.is_empty() {
            let batch_by_name: HashMap<String, Instance> =
                batch.into_iter().map(|i| (i.name.clone(), i)).collect();
            self.spawn_busy_tracker(busy_names, batch_by_name, ready_tx.clone(), deadline_at);
        }
        drop(ready_tx);

        let mut join_set = tokio::task::JoinSet::new();
        while let Some(instance) = ready_rx.recv().await {
            if released.contains(&instance.name) {
                continue;
            }
            released.insert(instance.name.clone());
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore open");
            let runtime = self.runtime.clone();
            let timeout = self.per_instance_timeout;
            join_set.spawn(async move {
                let _permit = permit;
                stop_one(runtime.as_ref(), instance, timeout).await;
            });
        }
        while join_set.join_next().await.is_some() {}
    }

    fn spawn_busy_tracker(
        &self,
        mut pending: Vec<String>,
        batch_by_name: HashMap<String, Instance>,
        ready_tx: mpsc::UnboundedSender<Instance>,
        deadline_at: Instant,
    ) {
        tokio::spawn(async move {
            loop {
                if pending.is_empty() {
                    return;
                }
                if Instant::now() >= deadline_at {
                    for name in pending.drain(..) {
                        if let Some(instance) = batch_by_name.get(&name) {
                            SHUTDOWN_FORCE_RELEASED_TOTAL.inc();
                            let _ = ready_tx.send(instance.clone());
                        }
                    }
                    return;
                }
                tokio::time::sleep(BUSY_POLL_INTERVAL).await;
                // A real implementation re-polls the operations snapshot here; this
                // reference orchestrator has no live operation feed to re-test against,
                // so it simply waits out the deadline and force-releases.
            }
        });
    }
}

async fn stop_one(runtime: &dyn InstanceRuntime, instance: Instance, timeout: Duration) {
    if instance.running {
        let result = runtime
            .stop_graceful(&instance.name, &instance.project, timeout.as_secs())
            .await;
        if result.is_err() {
            log_and_drop(
                "graceful stop failed, escalating to force stop",
                runtime.stop_force(&instance.name, &instance.project).await,
            );
        }
        if instance.database_id != 0 {
            log_and_drop(
                "failed to record last-state power for restart on next start",
                runtime
                    .set_config_key(
                        &instance.name,
                        &instance.project,
                        VOLATILE_LAST_STATE_POWER,
                        Some("RUNNING".to_string()),
                    )
                    .await,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn instance(name: &str, priority: i32) -> Instance {
        Instance {
            name: name.to_string(),
            project: "default".to_string(),
            node: "local".to_string(),
            running: true,
            migratable: true,
            architecture: 1,
            host_shutdown_timeout_secs: 30,
            stop_priority: priority,
            database_id: 1,
            config: BTreeMap::new(),
        }
    }

    #[test]
    fn batches_are_contiguous_by_descending_priority_then_name() {
        let instances = vec![
            instance("b", 1),
            instance("a", 2),
            instance("c", 1),
            instance("d", 2),
        ];
        let batches = sort_and_batch(instances);
        assert_eq!(batches.len(), 2);
        assert_eq!(
            batches[0].iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "d"]
        );
        assert_eq!(
            batches[1].iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );
    }
}
