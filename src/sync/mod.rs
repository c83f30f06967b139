//! Distribution sync engine.
//!
//! The `cursor_protocol` module runs the pull loop, `gap_tracker` plans backfill pulls, `orchestrator`
//! ties both to persistence, and `repositories` defines the persistence and storage collaborators.

pub mod cursor_protocol;
pub mod gap_tracker;
pub mod orchestrator;
pub mod repositories;
pub mod types;

pub use cursor_protocol::{CursorProtocol, PullConfig, PullStep, StopReason};
pub use gap_tracker::GapTracker;
pub use orchestrator::SyncOrchestrator;
pub use repositories::*;
pub use types::{CycleError, SyncSummary};
