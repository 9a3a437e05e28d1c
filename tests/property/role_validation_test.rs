// tests/property/role_validation_test.rs

//! Property-based tests for the role-partition invariant (§4.3): an automatic role a
//! member already holds can never be dropped by a request that simply omits it, and a
//! request naming the same role twice is always rejected.

use clusterd::core::member::{known_roles, role_class, validate_roles, RoleClass};
use proptest::prelude::*;
use std::collections::HashSet;

fn known_role_names() -> Vec<&'static str> {
    known_roles().iter().map(|(name, _)| *name).collect()
}

fn current_roles() -> impl Strategy<Value = HashSet<String>> {
    prop::collection::hash_set(
        prop::sample::select(known_role_names()).prop_map(str::to_string),
        0..=known_roles().len(),
    )
}

/// Requested roles as a `Vec`, the shape `validate_roles` actually takes: sampling with
/// replacement and allowing a count past the known-role count makes duplicate entries
/// common enough for the duplicate-rejection property below to bite.
fn requested_roles() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        prop::sample::select(known_role_names()).prop_map(str::to_string),
        0..=known_roles().len() + 2,
    )
}

fn has_duplicates(roles: &[String]) -> bool {
    let mut seen = HashSet::with_capacity(roles.len());
    roles.iter().any(|r| !seen.insert(r.as_str()))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    #[test]
    fn automatic_roles_already_held_are_never_dropped(
        current in current_roles(),
        requested in requested_roles(),
    ) {
        if let Ok(effective) = validate_roles(&current, &requested) {
            for role in &current {
                if role_class(role) == Some(RoleClass::Automatic) {
                    prop_assert!(effective.contains(role));
                }
            }
        }
    }

    #[test]
    fn duplicate_requested_roles_are_always_rejected(
        current in current_roles(),
        requested in requested_roles(),
    ) {
        if has_duplicates(&requested) {
            prop_assert!(validate_roles(&current, &requested).is_err());
        }
    }

    #[test]
    fn an_automatic_role_not_already_held_is_rejected_absent_duplicates(
        current in current_roles(),
        requested in requested_roles(),
    ) {
        prop_assume!(!has_duplicates(&requested));
        let adds_new_automatic_role = requested.iter().any(|role| {
            role_class(role) == Some(RoleClass::Automatic) && !current.contains(role)
        });
        let result = validate_roles(&current, &requested);
        prop_assert_eq!(adds_new_automatic_role, result.is_err());
    }

    #[test]
    fn effective_roles_are_always_known(
        current in current_roles(),
        requested in requested_roles(),
    ) {
        if let Ok(effective) = validate_roles(&current, &requested) {
            for role in &effective {
                prop_assert!(role_class(role).is_some());
            }
        }
    }
}
