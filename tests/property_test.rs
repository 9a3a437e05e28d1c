// tests/property_test.rs

//! Property-based tests covering invariants that must hold for any input, not just the
//! handful of cases the unit tests enumerate.

mod property {
    pub mod placement_test;
    pub mod role_validation_test;
}
