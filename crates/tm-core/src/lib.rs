//! tm-core: shared types, IDs, errors, configuration, and the job event bus.
//!
//! This crate is the foundational dependency for all other tm-* crates,
//! providing type-safe identifiers, a unified error type, the job data
//! model, the tool catalog, plan tiers, application configuration, and
//! the per-job publish/subscribe bus.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod plan;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::*;
pub use job::*;
pub use plan::*;
