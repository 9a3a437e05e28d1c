// tests/property/placement_test.rs

//! Property-based tests for the Placement Engine's least-loaded tie-break (§4.6 step 4):
//! among equally-eligible candidates, the first member (by registry order) with the
//! lowest instance count always wins, no matter how the loads are distributed.

use clusterd::core::cluster::instance::PlacementView;
use clusterd::core::cluster::placement::{place_instance, shared_noop_resolver, LoadView, PlacementGroupCache};
use clusterd::core::member::{Member, MemberState};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

struct FixedLoad(HashMap<String, usize>);

impl LoadView for FixedLoad {
    fn instance_count(&self, member_name: &str) -> usize {
        *self.0.get(member_name).unwrap_or(&0)
    }
}

fn member_named(name: &str) -> Member {
    Member {
        id: Uuid::new_v4(),
        name: name.to_string(),
        address: format!("{name}:8443"),
        state: MemberState::Created,
        roles: HashSet::new(),
        groups: ["default".to_string()].into(),
        failure_domain: None,
        architecture: 1,
        config: BTreeMap::new(),
        description: String::new(),
        last_seen_unix_ms: 0,
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        ..ProptestConfig::default()
    })]

    #[test]
    fn least_loaded_candidate_wins_with_registry_order_as_tiebreak(
        loads in prop::collection::vec(0usize..8, 1..=8),
    ) {
        let members: Vec<Member> = loads
            .iter()
            .enumerate()
            .map(|(i, _)| member_named(&format!("m{i}")))
            .collect();
        let online: HashSet<String> = members.iter().map(|m| m.name.clone()).collect();
        let load_map: HashMap<String, usize> = members
            .iter()
            .zip(loads.iter())
            .map(|(m, &load)| (m.name.clone(), load))
            .collect();

        let expected = loads
            .iter()
            .enumerate()
            .min_by_key(|(_, &load)| load)
            .map(|(i, _)| format!("m{i}"))
            .unwrap();

        let view = PlacementView {
            architecture: 1,
            project: "default".to_string(),
            cluster_group: None,
            placement_group: None,
        };
        let cache = PlacementGroupCache::new();
        let resolver = shared_noop_resolver();
        let load = FixedLoad(load_map);

        let rt = tokio::runtime::Runtime::new().unwrap();
        let chosen = rt
            .block_on(place_instance(&members, &online, None, &view, &cache, resolver.as_ref(), &load))
            .unwrap();

        prop_assert_eq!(chosen, expected);
    }
}
