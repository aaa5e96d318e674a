//! Unit tests for kafka-ops-core.
//!
//! Every test runs against `InMemoryCluster`, so failures can be injected
//! deterministically.

pub mod helpers;
pub mod offsets;
pub mod pipe;
