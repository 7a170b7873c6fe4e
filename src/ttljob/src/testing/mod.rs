//! Test utilities for TTL processors.
//!
//! Provides an in-memory table that acts as both catalog and executor, plus a
//! builder for task specs.
//!
//! # Feature Flag
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dependencies]
//! ttljob = { path = "../ttljob", features = ["testing"] }
//! ```

mod memory;
mod spec_builder;

pub use memory::{MemoryTable, TEST_TABLE_ID};
pub use spec_builder::TestSpecBuilder;
