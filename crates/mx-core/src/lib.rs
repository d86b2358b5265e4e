//! mx-core: shared types, IDs, errors, configuration, and run metrics.
//!
//! This crate is the foundational dependency for the other mx-* crates,
//! providing type-safe identifiers, a unified error type with a stable
//! [`ErrorKind`] classification, application configuration, and the
//! bounded metrics ring that collects one record per pipeline run.

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, ErrorKind, GraphError, Result};
pub use ids::*;
