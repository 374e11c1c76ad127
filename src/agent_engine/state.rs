/// Lifecycle states of a task run, as published on the handle's watch channel.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Running { step: u32 },
    Paused { step: u32 },
    Finished { message: String },
    Failed { kind: FailureKind, message: String },
    Cancelled,
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

/// Why a run failed. Network trouble and bad model output are kept apart so
/// the operator can tell a connectivity problem from a compliance problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection, timeout or server error talking to the model.
    Network,
    /// The model kept answering without a usable action.
    MalformedResponse,
    /// Too many failed actions in a row.
    ActionFailures,
    StepLimit,
    /// The operator declined to take over when asked.
    TakeOverDeclined,
}

/// Run/pause switch driven by the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    Running,
    Paused,
}

/// One executed turn, kept for the task report.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StepRecord {
    pub step: u32,
    pub thinking: String,
    pub action: String,
    pub success: bool,
    pub message: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskOutcome {
    pub state: AgentState,
    pub steps: Vec<StepRecord>,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.state, AgentState::Finished { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_tagged() {
        let json = serde_json::to_value(AgentState::Failed {
            kind: FailureKind::Network,
            message: "down".into(),
        })
        .unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["kind"], "network");
        assert!(AgentState::Cancelled.is_terminal());
        assert!(!AgentState::Paused { step: 2 }.is_terminal());
    }
}
