//! # Hatch Common
//!
//! Shared types for the hatch process-spawn engine.
//!
//! This crate defines the error taxonomy used by every other hatch crate:
//! configuration errors (pure validation, raised before any OS resource is
//! touched), resource errors (parent-side OS refusals), launch failures
//! (child-side setup or exec failures relayed to the parent), and wait
//! errors (reaping misuse).

pub mod errors;

pub use errors::*;
