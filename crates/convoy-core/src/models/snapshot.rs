use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::call_request::{CallRequest, CallRequestId, GroupId, OBFUSCATED_VALUE};
use crate::models::report::{TaskReport, TaskState};
use crate::models::resource::ResourceFootprint;

/// Serialized form of a queued call, written at enqueue time so a restarted
/// process can rebuild its waiting set.
///
/// Arguments are stored verbatim even for obfuscated requests; rehydration
/// needs the real values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedCallSnapshot {
    pub id: CallRequestId,
    pub group_id: Option<GroupId>,
    pub callable_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub resources: ResourceFootprint,
    pub tags: Vec<String>,
    pub weight: u32,
    pub asynchronous: bool,
    pub archive: bool,
    pub obfuscate_args: bool,
    pub timeout: Option<Duration>,
    pub depends_on: BTreeSet<CallRequestId>,
    pub state: TaskState,
    pub enqueue_time: SystemTime,
}

impl QueuedCallSnapshot {
    pub fn of(request: &CallRequest, state: TaskState, enqueue_time: SystemTime) -> Self {
        Self {
            id: request.id(),
            group_id: request.group_id(),
            callable_name: request.callable_name().to_string(),
            args: request.args().to_vec(),
            kwargs: request.kwargs().clone(),
            resources: request.resources().clone(),
            tags: request.tags().to_vec(),
            weight: request.weight(),
            asynchronous: request.is_asynchronous(),
            archive: request.archive(),
            obfuscate_args: request.obfuscate_args(),
            timeout: request.timeout(),
            depends_on: request.dependencies().clone(),
            state,
            enqueue_time,
        }
    }
}

/// Serialized form of a completed call, written at completion time for
/// history queries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchivedCallSnapshot {
    pub id: CallRequestId,
    pub group_id: Option<GroupId>,
    pub callable_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub resources: ResourceFootprint,
    pub tags: Vec<String>,
    pub weight: u32,
    pub state: TaskState,
    pub start_time: Option<SystemTime>,
    pub finish_time: Option<SystemTime>,
    pub result: Option<Value>,
    pub exception: Option<String>,
    pub traceback: Option<String>,
}

impl ArchivedCallSnapshot {
    /// Archived history is user-facing, so `obfuscate_args` is honored here.
    pub fn of(request: &CallRequest, report: &TaskReport) -> Self {
        let (args, kwargs) = if request.obfuscate_args() {
            let args = request
                .args()
                .iter()
                .map(|_| Value::String(OBFUSCATED_VALUE.to_string()))
                .collect();
            let kwargs = request
                .kwargs()
                .keys()
                .map(|key| (key.clone(), Value::String(OBFUSCATED_VALUE.to_string())))
                .collect();
            (args, kwargs)
        } else {
            (request.args().to_vec(), request.kwargs().clone())
        };

        Self {
            id: request.id(),
            group_id: request.group_id(),
            callable_name: request.callable_name().to_string(),
            args,
            kwargs,
            resources: request.resources().clone(),
            tags: request.tags().to_vec(),
            weight: request.weight(),
            state: report.state,
            start_time: report.start_time,
            finish_time: report.finish_time,
            result: report.result.clone(),
            exception: report.exception.clone(),
            traceback: report.traceback.clone(),
        }
    }
}
