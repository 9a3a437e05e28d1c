// src/core/cluster/placement.rs

//! The Placement Engine (§4.6): picks a target member for an instance, honoring
//! architecture, liveness, cluster-group restriction, and placement-group policy.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::core::cluster::instance::PlacementView;
use crate::core::member::Member;
use crate::core::metrics::{PLACEMENT_DECISIONS_TOTAL, PLACEMENT_DURATION_SECONDS};
use crate::core::ClusterError;

/// External collaborator resolving placement-group membership. Opaque to this core
/// except for group name and the filtering contract (§3 Placement Group).
#[async_trait]
pub trait PlacementGroupResolver: Send + Sync {
    /// Filters `candidates` (member names) down to those the named placement group
    /// permits, with `exclude_current` always passed as `true` by this core. A
    /// *conflict* result is surfaced as `ClusterError::Conflict` and the caller
    /// translates it to not-found (§4.6 step 2).
    async fn filter(
        &self,
        group_name: &str,
        project: &str,
        candidates: &[String],
    ) -> Result<Vec<String>, ClusterError>;
}

/// Per-request cache keyed by `(name, project)`, as required by §3's "Placement Group"
/// entry. Deliberately request-scoped and single-threaded: a fresh instance is created
/// per incoming request and dropped at its end.
#[derive(Default)]
pub struct PlacementGroupCache {
    resolved: DashMap<(String, String), Vec<String>>,
}

impl PlacementGroupCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_resolve(
        &self,
        resolver: &dyn PlacementGroupResolver,
        group_name: &str,
        project: &str,
        candidates: &[String],
    ) -> Result<Vec<String>, ClusterError> {
        let key = (group_name.to_string(), project.to_string());
        if let Some(cached) = self.resolved.get(&key) {
            return Ok(cached.clone());
        }
        let filtered = resolver.filter(group_name, project, candidates).await?;
        self.resolved.insert(key, filtered.clone());
        Ok(filtered)
    }
}

/// Counts current instances per member name, used as the least-loaded tie-break
/// (§4.6 step 4).
pub trait LoadView {
    fn instance_count(&self, member_name: &str) -> usize;
}

/// Runs the placement algorithm to completion, returning the chosen member or
/// `ClusterError::NotFound` if no eligible candidate remains.
pub async fn place_instance(
    members: &[Member],
    online_member_names: &HashSet<String>,
    restricted_groups: Option<&HashSet<String>>,
    view: &PlacementView,
    cache: &PlacementGroupCache,
    resolver: &dyn PlacementGroupResolver,
    load: &dyn LoadView,
) -> Result<String, ClusterError> {
    let started_at = tokio::time::Instant::now();
    let result = place_instance_inner(
        members,
        online_member_names,
        restricted_groups,
        view,
        cache,
        resolver,
        load,
    )
    .await;
    PLACEMENT_DURATION_SECONDS.observe(started_at.elapsed().as_secs_f64());
    PLACEMENT_DECISIONS_TOTAL
        .with_label_values(&[if result.is_ok() { "placed" } else { "not_found" }])
        .inc();
    result
}

async fn place_instance_inner(
    members: &[Member],
    online_member_names: &HashSet<String>,
    restricted_groups: Option<&HashSet<String>>,
    view: &PlacementView,
    cache: &PlacementGroupCache,
    resolver: &dyn PlacementGroupResolver,
    load: &dyn LoadView,
) -> Result<String, ClusterError> {
    let mut candidates: Vec<&Member> = members
        .iter()
        .filter(|m| online_member_names.contains(&m.name))
        .filter(|m| m.architecture == view.architecture)
        .filter(|m| match restricted_groups {
            Some(allowed) => m.groups.iter().any(|g| allowed.contains(g)),
            None => true,
        })
        .collect();

    if candidates.is_empty() {
        return Err(ClusterError::NotFound(
            "no eligible placement candidate".into(),
        ));
    }

    if let Some(group_name) = &view.placement_group {
        let candidate_names: Vec<String> = candidates.iter().map(|m| m.name.clone()).collect();
        match cache
            .get_or_resolve(resolver, group_name, &view.project, &candidate_names)
            .await
        {
            Ok(filtered) if !filtered.is_empty() => {
                let filtered_set: HashSet<&str> = filtered.iter().map(String::as_str).collect();
                candidates.retain(|m| filtered_set.contains(m.name.as_str()));
            }
            Ok(_) => {
                // Empty filtered set: per §4.6 step 2, fall back to the pre-group
                // candidates (open question in the design notes; this core keeps the
                // original fallback behavior).
            }
            Err(e) if e.kind() == crate::core::errors::ErrorKind::Conflict => {
                return Err(ClusterError::NotFound(format!(
                    "placement group '{group_name}' reported a conflict"
                )));
            }
            Err(e) => return Err(e),
        }
    } else if let Some(cluster_group) = &view.cluster_group {
        candidates.retain(|m| m.groups.contains(cluster_group));
    }

    if candidates.is_empty() {
        return Err(ClusterError::NotFound(
            "no eligible placement candidate after group filtering".into(),
        ));
    }

    let least_loaded = candidates
        .into_iter()
        .min_by_key(|m| load.instance_count(&m.name))
        .expect("non-empty after emptiness check");

    Ok(least_loaded.name.clone())
}

pub fn online_member_names(
    members: &[Member],
    last_seen_floor_unix_ms: i64,
) -> HashSet<String> {
    members
        .iter()
        .filter(|m| m.last_seen_unix_ms >= last_seen_floor_unix_ms)
        .map(|m| m.name.clone())
        .collect()
}

pub fn empty_restriction() -> Option<HashSet<String>> {
    None
}

/// A trivial in-memory implementation used where no real placement-group backend is
/// configured: every candidate passes.
pub struct NoopPlacementGroupResolver;

#[async_trait]
impl PlacementGroupResolver for NoopPlacementGroupResolver {
    async fn filter(
        &self,
        _group_name: &str,
        _project: &str,
        candidates: &[String],
    ) -> Result<Vec<String>, ClusterError> {
        Ok(candidates.to_vec())
    }
}

pub fn shared_noop_resolver() -> Arc<dyn PlacementGroupResolver> {
    Arc::new(NoopPlacementGroupResolver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::member::MemberState;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    struct ZeroLoad;
    impl LoadView for ZeroLoad {
        fn instance_count(&self, _member_name: &str) -> usize {
            0
        }
    }

    struct CountingLoad(std::collections::HashMap<String, usize>);
    impl LoadView for CountingLoad {
        fn instance_count(&self, member_name: &str) -> usize {
            *self.0.get(member_name).unwrap_or(&0)
        }
    }

    fn member(name: &str, groups: &[&str], arch: u32) -> Member {
        Member {
            id: Uuid::new_v4(),
            name: name.to_string(),
            address: format!("{name}:8443"),
            state: MemberState::Created,
            roles: Default::default(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            failure_domain: None,
            architecture: arch,
            config: BTreeMap::new(),
            description: String::new(),
            last_seen_unix_ms: 0,
        }
    }

    #[tokio::test]
    async fn cluster_group_restriction_picks_the_sole_matching_candidate() {
        let members = vec![
            member("m1", &["default"], 1),
            member("m2", &["g1"], 1),
            member("m3", &["default"], 1),
        ];
        let online: HashSet<String> = members.iter().map(|m| m.name.clone()).collect();
        let mut restricted = HashSet::new();
        restricted.insert("g1".to_string());

        let view = PlacementView {
            architecture: 1,
            project: "default".to_string(),
            cluster_group: None,
            placement_group: None,
        };

        let cache = PlacementGroupCache::new();
        let resolver = NoopPlacementGroupResolver;
        let load = ZeroLoad;

        let chosen = place_instance(
            &members,
            &online,
            Some(&restricted),
            &view,
            &cache,
            &resolver,
            &load,
        )
        .await
        .unwrap();
        assert_eq!(chosen, "m2");
    }

    #[tokio::test]
    async fn ties_break_on_least_loaded() {
        let members = vec![member("m1", &["default"], 1), member("m2", &["default"], 1)];
        let online: HashSet<String> = members.iter().map(|m| m.name.clone()).collect();
        let view = PlacementView {
            architecture: 1,
            project: "default".to_string(),
            cluster_group: None,
            placement_group: None,
        };
        let cache = PlacementGroupCache::new();
        let resolver = NoopPlacementGroupResolver;
        let mut counts = std::collections::HashMap::new();
        counts.insert("m1".to_string(), 3);
        counts.insert("m2".to_string(), 1);
        let load = CountingLoad(counts);

        let chosen = place_instance(&members, &online, None, &view, &cache, &resolver, &load)
            .await
            .unwrap();
        assert_eq!(chosen, "m2");
    }

    #[tokio::test]
    async fn no_eligible_architecture_is_not_found() {
        let members = vec![member("m1", &["default"], 1)];
        let online: HashSet<String> = members.iter().map(|m| m.name.clone()).collect();
        let view = PlacementView {
            architecture: 2,
            project: "default".to_string(),
            cluster_group: None,
            placement_group: None,
        };
        let cache = PlacementGroupCache::new();
        let resolver = NoopPlacementGroupResolver;
        let load = ZeroLoad;
        let result = place_instance(&members, &online, None, &view, &cache, &resolver, &load).await;
        assert!(matches!(result, Err(ClusterError::NotFound(_))));
    }
}
