use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ArchiveState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ArchiveState::Pending => "pending",
            ArchiveState::Processing => "processing",
            ArchiveState::Completed => "completed",
            ArchiveState::Failed => "failed",
        }
    }

    /// `completed` and `failed` end a job; only an explicit retry leaves `failed`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, ArchiveState::Completed | ArchiveState::Failed)
    }

    pub const fn can_transition_to(self, next: ArchiveState) -> bool {
        matches!(
            (self, next),
            (ArchiveState::Pending, ArchiveState::Processing)
                | (ArchiveState::Processing, ArchiveState::Completed)
                | (ArchiveState::Processing, ArchiveState::Failed)
                | (ArchiveState::Failed, ArchiveState::Processing)
        )
    }
}

impl fmt::Display for ArchiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown archive state `{0}`")]
pub struct UnknownState(pub String);

impl FromStr for ArchiveState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ArchiveState::Pending),
            "processing" => Ok(ArchiveState::Processing),
            "completed" => Ok(ArchiveState::Completed),
            "failed" => Ok(ArchiveState::Failed),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ArchiveState::*;
    use super::*;

    const ALL: [ArchiveState; 4] = [Pending, Processing, Completed, Failed];

    #[test]
    fn names_round_trip_through_from_str() {
        for state in ALL {
            assert_eq!(state.as_str().parse::<ArchiveState>(), Ok(state));
        }
        assert!("rejected".parse::<ArchiveState>().is_err());
    }

    #[test]
    fn pending_never_jumps_to_a_terminal_state() {
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Processing));
    }

    #[test]
    fn completed_is_final() {
        for next in ALL {
            assert!(!Completed.can_transition_to(next));
        }
    }

    #[test]
    fn failed_only_leaves_through_processing() {
        let allowed: Vec<_> = ALL
            .into_iter()
            .filter(|next| Failed.can_transition_to(*next))
            .collect();
        assert_eq!(allowed, vec![Processing]);
    }
}
