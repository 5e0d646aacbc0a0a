//! revpipe-core
//!
//! Incremental pipeline execution and invalidation engine for binary
//! reverse-engineering toolchains.
//!
//! The engine schedules expensive artifact-producing transformations (pipes)
//! over a fixed linear step chain, caches every produced artifact keyed by
//! its target address, recomputes only what a request is missing, and keeps
//! the cache sound by diffing every mutation of shared Global state and
//! invalidating the artifacts the diff touches.
//!
//! All substantive logic lives here so it is fully testable and reusable
//! from multiple frontends (CLI, service embeddings, etc.).

pub mod container;
pub mod description;
pub mod diff;
pub mod error;
pub mod global;
pub mod kinds;
pub mod pipe;
pub mod pipes;
pub mod registry;
pub mod runner;
pub mod step;
pub mod target;
pub mod trace;

/// Returns the library version as encoded at compile time.
///
/// Useful for tests and for frontends to report consistent version info.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
