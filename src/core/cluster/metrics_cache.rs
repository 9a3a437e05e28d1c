// src/core/cluster/metrics_cache.rs

//! The Metrics Cache (§4.8): per-project cached instance-metrics snapshot with an
//! 8-second TTL and a single-flight rebuild lock.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::core::cluster::instance::Instance;
use crate::core::ClusterError;

pub const METRICS_CACHE_TTL: Duration = Duration::from_secs(8);
pub const METRICS_LOCK_TIMEOUT: Duration = Duration::from_secs(8);

/// A sample for one instance. Stopped or unavailable instances are counted but
/// contribute no samples (§4.8 last sentence).
#[derive(Debug, Clone)]
pub struct InstanceMetricSample {
    pub instance: String,
    pub cpu_seconds_total: f64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectMetrics {
    pub instance_count: usize,
    pub samples: Vec<InstanceMetricSample>,
}

struct CachedEntry {
    built_at: Instant,
    metrics: ProjectMetrics,
}

/// Fetches a single instance's metric sample. Out of scope (instance runtime), so this
/// is expressed as a narrow trait rather than folded into `InstanceRuntime`.
#[async_trait::async_trait]
pub trait MetricSource: Send + Sync {
    async fn sample(&self, instance: &Instance) -> Option<InstanceMetricSample>;
}

/// Process-global, per-project cache. `metrics_mu` (the lock named in §5) guards only
/// the map write, matching "concurrent mutators hold `metrics_mu` only around map
/// writes."
pub struct MetricsCache {
    entries: Mutex<HashMap<String, CachedEntry>>,
    rebuild_lock: Mutex<()>,
}

impl Default for MetricsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// Returns a fresh-enough cached snapshot for `project`, rebuilding it if stale.
    /// Returns `ClusterError::Conflict("locked")` if the rebuild lock cannot be
    /// acquired within `METRICS_LOCK_TIMEOUT`.
    pub async fn get_or_build(
        &self,
        project: &str,
        instances: &[Instance],
        source: &dyn MetricSource,
    ) -> Result<ProjectMetrics, ClusterError> {
        if let Some(fresh) = self.fresh_entry(project).await {
            return Ok(fresh);
        }

        let _guard = tokio::time::timeout(METRICS_LOCK_TIMEOUT, self.rebuild_lock.lock())
            .await
            .map_err(|_| ClusterError::Conflict("locked".into()))?;

        // Re-check: another holder may have populated the cache while we waited.
        if let Some(fresh) = self.fresh_entry(project).await {
            return Ok(fresh);
        }

        let metrics = self.build(instances, source).await;

        let mut entries = self.entries.lock().await;
        entries.insert(
            project.to_string(),
            CachedEntry {
                built_at: Instant::now(),
                metrics: metrics.clone(),
            },
        );
        Ok(metrics)
    }

    async fn fresh_entry(&self, project: &str) -> Option<ProjectMetrics> {
        let entries = self.entries.lock().await;
        entries.get(project).and_then(|entry| {
            if entry.built_at.elapsed() < METRICS_CACHE_TTL {
                Some(entry.metrics.clone())
            } else {
                None
            }
        })
    }

    /// Builds metrics in parallel, bounded to `min(num_instances, num_cores)`.
    async fn build(&self, instances: &[Instance], source: &dyn MetricSource) -> ProjectMetrics {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(instances.len().max(1));

        let mut in_flight = FuturesUnordered::new();
        let mut iter = instances.iter();
        let mut samples = Vec::new();

        for instance in iter.by_ref().take(parallelism) {
            in_flight.push(source.sample(instance));
        }

        while let Some(result) = in_flight.next().await {
            if let Some(sample) = result {
                samples.push(sample);
            }
            if let Some(instance) = iter.next() {
                in_flight.push(source.sample(instance));
            }
        }

        ProjectMetrics {
            instance_count: instances.len(),
            samples,
        }
    }
}

pub fn shared_metrics_cache() -> Arc<MetricsCache> {
    Arc::new(MetricsCache::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct StaticSource;

    #[async_trait::async_trait]
    impl MetricSource for StaticSource {
        async fn sample(&self, instance: &Instance) -> Option<InstanceMetricSample> {
            if !instance.running {
                return None;
            }
            Some(InstanceMetricSample {
                instance: instance.name.clone(),
                cpu_seconds_total: 1.0,
                memory_bytes: 1024,
            })
        }
    }

    fn instance(name: &str, running: bool) -> Instance {
        Instance {
            name: name.to_string(),
            project: "default".to_string(),
            node: "local".to_string(),
            running,
            migratable: true,
            architecture: 1,
            host_shutdown_timeout_secs: 30,
            stop_priority: 0,
            database_id: 1,
            config: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn stopped_instances_are_counted_without_samples() {
        let cache = MetricsCache::new();
        let source = StaticSource;
        let instances = vec![instance("i1", true), instance("i2", false)];
        let metrics = cache
            .get_or_build("default", &instances, &source)
            .await
            .unwrap();
        assert_eq!(metrics.instance_count, 2);
        assert_eq!(metrics.samples.len(), 1);
    }

    #[tokio::test]
    async fn second_call_within_ttl_reuses_cache() {
        let cache = MetricsCache::new();
        let source = StaticSource;
        let instances = vec![instance("i1", true)];
        let first = cache
            .get_or_build("default", &instances, &source)
            .await
            .unwrap();
        let second = cache.get_or_build("default", &[], &source).await.unwrap();
        assert_eq!(first.instance_count, second.instance_count);
    }
}
