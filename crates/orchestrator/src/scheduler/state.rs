use serde::Serialize;
use uuid::Uuid;

/// Where a job is in its lifecycle. Jobs absent from the state table are idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum JobState {
    #[default]
    Idle,
    Queued { batch_id: Uuid },
    Running { batch_id: Uuid, attempt: u32 },
    RetryPending { batch_id: Uuid, attempt: u32 },
}

impl JobState {
    pub fn is_idle(&self) -> bool {
        matches!(self, JobState::Idle)
    }

    pub fn batch_id(&self) -> Option<Uuid> {
        match self {
            JobState::Idle => None,
            JobState::Queued { batch_id }
            | JobState::Running { batch_id, .. }
            | JobState::RetryPending { batch_id, .. } => Some(*batch_id),
        }
    }
}
