use aero_fc::LinkError;
use aero_proto::ActionKind;

/// Why an `execute` call failed. Carries the action and, for firmware
/// failures, the underlying link error.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{action}: vehicle link unavailable: {source}")]
    Connection { action: ActionKind, source: LinkError },

    #[error("{action}: mode transition rejected: {source}")]
    ModeTransition { action: ActionKind, source: LinkError },

    #[error("{action}: invalid parameter {param}={value}")]
    InvalidParameter { action: ActionKind, param: &'static str, value: f64 },

    #[error("follow_target: no target available (requested {target_id:?})")]
    TargetUnavailable { target_id: Option<String> },

    #[error("{action}: timed out: {source}")]
    Timeout { action: ActionKind, source: LinkError },

    #[error("{action}: vehicle command failed: {source}")]
    Link { action: ActionKind, source: LinkError },
}

impl ExecutionError {
    /// Sorts a link failure from an ordinary vehicle call into the taxonomy.
    pub fn from_link(action: ActionKind, source: LinkError) -> Self {
        match source {
            LinkError::Disconnected | LinkError::Io(_) => ExecutionError::Connection { action, source },
            LinkError::Timeout(_) => ExecutionError::Timeout { action, source },
            LinkError::Rejected { .. } | LinkError::Protocol(_) => ExecutionError::Link { action, source },
        }
    }

    /// Same as [`from_link`](Self::from_link) but for offboard entry and exit.
    pub fn mode(action: ActionKind, source: LinkError) -> Self {
        match source {
            LinkError::Disconnected | LinkError::Io(_) => ExecutionError::Connection { action, source },
            _ => ExecutionError::ModeTransition { action, source },
        }
    }
}
