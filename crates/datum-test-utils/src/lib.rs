//! Shared test utilities for datum registry tests.
//!
//! This crate provides:
//! - [`TestContext`]: an in-memory store with a registry over it
//! - Loaders for the standard instrument, observation and calibration data
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use datum_test_utils::{TestContext, load_base_data, data_id};
//!
//! #[test]
//! fn test_example() {
//!     let ctx = TestContext::new();
//!     load_base_data(&ctx.registry).unwrap();
//!     let detector = data_id(&[("instrument", "Cam1".into()), ("detector", 2.into())]);
//!     // ... run test ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]

pub mod assertions;
pub mod fixtures;

pub use assertions::*;
pub use fixtures::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("datum_registry=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
