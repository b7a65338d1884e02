//! Shared value types and the fault taxonomy for the tracebot workspace.
//!
//! Everything in this crate is a plain serializable record: created during a
//! single pipeline run, never mutated, discarded at its end. Behavior lives
//! in `tracebot-core`.

pub mod error;
pub mod models;

pub use error::Result;
pub use error::TriageErr;
