//! Archiver core: pure lifecycle state machine and archive record types.
mod failure;
mod record;
mod state;
mod transition;

pub use failure::{Failure, FailureReason, Stage, UnknownReason};
pub use record::{
    Archive, ArchiveContent, ArchiveId, LinkId, MetadataBag, TransitionMetadata, TransitionRecord,
};
pub use state::{ArchiveState, UnknownState};
pub use transition::{
    plan_transition, ContentUpdate, RetryKind, StageMetrics, TransitionError, TransitionPlan,
    Trigger,
};
