use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::call_request::{CallRequestId, GroupId};
use crate::models::resource::{Decision, ResourceClaim};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Suspended,
    Skipped,
    Running,
    Finished,
    Error,
    Canceled,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Error
                | TaskState::Canceled
                | TaskState::TimedOut
                | TaskState::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Suspended => "suspended",
            TaskState::Skipped => "skipped",
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Error => "error",
            TaskState::Canceled => "canceled",
            TaskState::TimedOut => "timed_out",
        }
    }

    pub fn parse(raw: &str) -> Option<TaskState> {
        match raw {
            "waiting" => Some(TaskState::Waiting),
            "suspended" => Some(TaskState::Suspended),
            "skipped" => Some(TaskState::Skipped),
            "running" => Some(TaskState::Running),
            "finished" => Some(TaskState::Finished),
            "error" => Some(TaskState::Error),
            "canceled" => Some(TaskState::Canceled),
            "timed_out" => Some(TaskState::TimedOut),
            _ => None,
        }
    }
}

/// A call request's progress as seen by its registered callbacks and by
/// `query`/`find` callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub call_request_id: CallRequestId,
    pub group_id: Option<GroupId>,
    /// Concurrency decision made when the request was submitted.
    pub response: Option<Decision>,
    /// Resources responsible for a postponement or rejection.
    pub reasons: Vec<ResourceClaim>,
    pub state: TaskState,
    pub progress: Option<Value>,
    pub result: Option<Value>,
    pub exception: Option<String>,
    pub traceback: Option<String>,
    pub start_time: Option<SystemTime>,
    pub finish_time: Option<SystemTime>,
    pub tags: Vec<String>,
}

impl TaskReport {
    pub fn new(call_request_id: CallRequestId, group_id: Option<GroupId>, tags: Vec<String>) -> Self {
        Self {
            call_request_id,
            group_id,
            response: None,
            reasons: Vec::new(),
            state: TaskState::Waiting,
            progress: None,
            result: None,
            exception: None,
            traceback: None,
            start_time: None,
            finish_time: None,
            tags,
        }
    }
}

/// Point-in-time copy of a task, safe to hand outside the queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: CallRequestId,
    pub group_id: Option<GroupId>,
    pub callable_name: String,
    pub tags: Vec<String>,
    pub weight: u32,
    pub state: TaskState,
    pub response: Option<Decision>,
    pub reasons: Vec<ResourceClaim>,
    pub progress: Option<Value>,
    pub result: Option<Value>,
    pub exception: Option<String>,
    pub traceback: Option<String>,
    pub enqueue_time: SystemTime,
    pub start_time: Option<SystemTime>,
    pub finish_time: Option<SystemTime>,
}
