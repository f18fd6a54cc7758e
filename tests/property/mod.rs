//! Property-based tests

pub mod conflict_proptest;
