//! # Outpost Testkit
//!
//! Test utilities for Outpost.
//!
//! This crate provides:
//! - A clinical model registry and helpers to stand up central and facilities
//! - Property-based test generators using proptest
//! - A loopback transport that runs every request through the CBOR codec
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use outpost_testkit::prelude::*;
//!
//! #[test]
//! fn facility_round_trip() {
//!     let central = TestCentral::new();
//!     let facility = central.facility("facility-1");
//!     // ... write records, then facility.engine.sync()
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod loopback;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
    pub use crate::loopback::*;
}

pub use fixtures::*;
pub use generators::*;
pub use loopback::*;

/// Routes `tracing` output to the test writer.
///
/// The filter is read from `RUST_LOG` and defaults to `warn`. Calling it more
/// than once is harmless.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
