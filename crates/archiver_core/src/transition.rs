use std::net::IpAddr;

use chrono::{DateTime, Utc};

use crate::{Archive, ArchiveContent, ArchiveState, Failure, TransitionMetadata};

/// How a failed archive came to be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Scheduled by the orchestrator after a retryable failure.
    Automatic,
    /// Requested by the owner.
    Manual,
}

/// Facts gathered while a job ran, copied into the transition metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageMetrics {
    pub attempt: u32,
    pub duration_ms: Option<u64>,
    pub byte_count: Option<u64>,
    pub http_status: Option<u16>,
    pub resolved_ip: Option<IpAddr>,
    pub final_url: Option<String>,
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Start { attempt: u32 },
    Retry { attempt: u32, kind: RetryKind },
    Complete { content: Box<ArchiveContent>, metrics: StageMetrics },
    Fail { failure: Failure, metrics: StageMetrics },
}

impl Trigger {
    pub fn target(&self) -> ArchiveState {
        match self {
            Trigger::Start { .. } | Trigger::Retry { .. } => ArchiveState::Processing,
            Trigger::Complete { .. } => ArchiveState::Completed,
            Trigger::Fail { .. } => ArchiveState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentUpdate {
    Keep,
    Clear,
    Set(Box<ArchiveContent>),
}

/// The full effect of one transition: row changes plus the log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPlan {
    pub from: ArchiveState,
    pub to: ArchiveState,
    pub error_message: Option<String>,
    pub content: ContentUpdate,
    pub metadata: TransitionMetadata,
}

impl TransitionPlan {
    /// Applies the row changes in memory. The caller persists the row and the
    /// log entry together.
    pub fn apply(&self, archive: &mut Archive, now: DateTime<Utc>) {
        archive.state = self.to;
        archive.error_message = self.error_message.clone();
        match &self.content {
            ContentUpdate::Keep => {}
            ContentUpdate::Clear => archive.clear_content(),
            ContentUpdate::Set(content) => archive.set_content(content.as_ref().clone()),
        }
        archive.updated_at = now;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("transition {from} -> {to} is not allowed")]
    NotAllowed {
        from: ArchiveState,
        to: ArchiveState,
    },
}

/// Pure transition function: validates `trigger` against `current` and
/// describes the resulting row changes.
pub fn plan_transition(
    current: ArchiveState,
    trigger: Trigger,
) -> Result<TransitionPlan, TransitionError> {
    let to = trigger.target();
    let allowed = match &trigger {
        Trigger::Start { .. } => current == ArchiveState::Pending,
        Trigger::Retry { .. } => current == ArchiveState::Failed,
        Trigger::Complete { .. } | Trigger::Fail { .. } => current == ArchiveState::Processing,
    };
    if !allowed || !current.can_transition_to(to) {
        return Err(TransitionError::NotAllowed { from: current, to });
    }

    let plan = match trigger {
        Trigger::Start { attempt } => TransitionPlan {
            from: current,
            to,
            error_message: None,
            content: ContentUpdate::Keep,
            metadata: TransitionMetadata {
                trigger: Some("start".to_string()),
                attempt: Some(attempt),
                ..TransitionMetadata::default()
            },
        },
        Trigger::Retry { attempt, kind } => TransitionPlan {
            from: current,
            to,
            error_message: None,
            content: ContentUpdate::Clear,
            metadata: TransitionMetadata {
                trigger: Some(
                    match kind {
                        RetryKind::Automatic => "retry",
                        RetryKind::Manual => "manual_retry",
                    }
                    .to_string(),
                ),
                attempt: Some(attempt),
                ..TransitionMetadata::default()
            },
        },
        Trigger::Complete { content, metrics } => {
            let mut metadata = metrics_metadata(&metrics);
            metadata.final_url = Some(content.final_url.clone());
            TransitionPlan {
                from: current,
                to,
                error_message: None,
                content: ContentUpdate::Set(content),
                metadata,
            }
        }
        Trigger::Fail { failure, metrics } => {
            let mut metadata = metrics_metadata(&metrics);
            metadata.stage = Some(failure.stage);
            metadata.reason = Some(failure.reason);
            metadata.detail = Some(failure.detail.clone());
            if let Some(status) = failure.http_status {
                metadata.http_status = Some(status);
            }
            if let Some(ip) = failure.resolved_ip {
                metadata.resolved_ip = Some(ip.to_string());
            }
            TransitionPlan {
                from: current,
                to,
                error_message: Some(failure.error_message()),
                content: ContentUpdate::Clear,
                metadata,
            }
        }
    };
    Ok(plan)
}

fn metrics_metadata(metrics: &StageMetrics) -> TransitionMetadata {
    TransitionMetadata {
        attempt: Some(metrics.attempt),
        duration_ms: metrics.duration_ms,
        byte_count: metrics.byte_count,
        http_status: metrics.http_status,
        resolved_ip: metrics.resolved_ip.map(|ip| ip.to_string()),
        final_url: metrics.final_url.clone(),
        ..TransitionMetadata::default()
    }
}
