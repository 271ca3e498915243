// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the cassandra-operator orchestration core.
//!
//! These tests drive the version gate, preflight runner, controllers and
//! service manager end to end WITHOUT a live Kubernetes cluster. LIST/WATCH,
//! the server version and reconcile bodies are mocked.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_same_key_reconciles_are_sequential
//! ```
//!
//! ## Test Categories
//!
//! - **Startup tests**: version gate and preflight ordering through `Application`
//! - **Controller tests**: watch handling, per-key serialization, retry and failure marking
//! - **Supervision tests**: coordinated shutdown when a controller fails

mod mock_state;
mod scenario_tests;

pub use mock_state::*;
