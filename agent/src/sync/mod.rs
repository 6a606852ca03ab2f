//! Background synchronization with the remote store.

mod orchestrator;
mod scheduler;

pub use orchestrator::{SkipReason, SyncOrchestrator, SyncOutcome, SyncPhase, SyncReport, SyncState};
pub use scheduler::{spawn, SchedulerHandle, Trigger};
