//!
//! Utility module for the DF-e engine.
//!
//! Re-exports small string helpers shared by the wire codecs and the sync orchestrator.
/// String normalization helpers
pub mod index;

pub use index::{only_digits, truncate_chars};
