use crate::proto;

/// Per-execution state machine. Transitions are accepted only in the
/// forward direction; the two terminal states never move again.
///
/// ```text
/// CREATED ──(executor accepts)──► RUNNING ──► SUCCEEDED
///        │                              └──► FAILED
///        └─(executor lost before accept)──► FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Succeeded | ExecutionStatus::Failed)
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (ExecutionStatus::Created, ExecutionStatus::Running)
                | (ExecutionStatus::Created, ExecutionStatus::Failed)
                | (ExecutionStatus::Running, ExecutionStatus::Succeeded)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
        )
    }

    /// `None` for unspecified or unknown wire values.
    pub fn from_proto(status: i32) -> Option<Self> {
        match proto::ExecutionStatus::try_from(status).ok()? {
            proto::ExecutionStatus::Unspecified => None,
            proto::ExecutionStatus::Created => Some(ExecutionStatus::Created),
            proto::ExecutionStatus::Running => Some(ExecutionStatus::Running),
            proto::ExecutionStatus::Succeeded => Some(ExecutionStatus::Succeeded),
            proto::ExecutionStatus::Failed => Some(ExecutionStatus::Failed),
        }
    }

    pub fn to_proto(self) -> proto::ExecutionStatus {
        match self {
            ExecutionStatus::Created => proto::ExecutionStatus::Created,
            ExecutionStatus::Running => proto::ExecutionStatus::Running,
            ExecutionStatus::Succeeded => proto::ExecutionStatus::Succeeded,
            ExecutionStatus::Failed => proto::ExecutionStatus::Failed,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Created => write!(f, "CREATED"),
            ExecutionStatus::Running => write!(f, "RUNNING"),
            ExecutionStatus::Succeeded => write!(f, "SUCCEEDED"),
            ExecutionStatus::Failed => write!(f, "FAILED"),
        }
    }
}
