use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::time::SystemTime;

use serde_json::Value;

use crate::models::call_request::{
    CallRequest, CallRequestId, CancellationToken, LifecycleHook,
};
use crate::models::error::DispatchError;
use crate::models::report::{TaskReport, TaskSnapshot, TaskState};
use crate::models::resource::ResourceClaim;

/// How a dispatched call ended, as observed at the worker boundary.
pub(crate) enum WorkOutcome {
    Finished(Value),
    Failed {
        exception: String,
        traceback: Option<String>,
    },
    Canceled {
        exception: Option<String>,
    },
    TimedOut {
        exception: String,
    },
}

/// Runtime wrapper around a call request while the queue owns it.
///
/// Mutated only under the queue's state lock; the worker running the call
/// never touches the task directly, it reports a [`WorkOutcome`] back.
pub(crate) struct Task {
    pub(crate) call_request: CallRequest,
    pub(crate) report: TaskReport,
    pub(crate) token: CancellationToken,
    /// Enqueue order; the dispatcher admits in ascending sequence.
    pub(crate) seq: u64,
    pub(crate) enqueue_time: SystemTime,
    /// Declared dependencies still waiting or running.
    pub(crate) blocking: BTreeSet<CallRequestId>,
}

impl Task {
    pub(crate) fn new(call_request: CallRequest, seq: u64, enqueue_time: SystemTime) -> Self {
        let report = TaskReport::new(
            call_request.id(),
            call_request.group_id(),
            call_request.tags().to_vec(),
        );
        Self {
            call_request,
            report,
            token: CancellationToken::new(),
            seq,
            enqueue_time,
            blocking: BTreeSet::new(),
        }
    }

    pub(crate) fn id(&self) -> CallRequestId {
        self.call_request.id()
    }

    pub(crate) fn state(&self) -> TaskState {
        self.report.state
    }

    pub(crate) fn weight(&self) -> u32 {
        self.call_request.weight()
    }

    /// Run every callback registered for the hook, in registration order.
    /// A panicking callback is logged and swallowed; it must never take the
    /// dispatcher down with it.
    pub(crate) fn fire_hooks(&self, hook: LifecycleHook) {
        for callback in self.call_request.callbacks_for(hook) {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                (callback.as_ref())(&self.call_request, &self.report)
            }));
            if outcome.is_err() {
                tracing::error!(
                    task_id = %self.id(),
                    hook = ?hook,
                    "life cycle callback panicked"
                );
            }
        }
    }

    /// Transition WAITING -> RUNNING and fire the RUN hooks. Called by the
    /// dispatcher immediately before the worker is launched.
    pub(crate) fn begin_running(&mut self) {
        self.report.state = TaskState::Running;
        self.report.start_time = Some(SystemTime::now());
        self.fire_hooks(LifecycleHook::Run);
    }

    /// Apply a terminal outcome: record result/exception, fire the outcome
    /// hook for the path taken, then the COMPLETE hooks.
    pub(crate) fn finish(&mut self, outcome: WorkOutcome) {
        match outcome {
            WorkOutcome::Finished(result) => {
                self.report.result = Some(result);
                tracing::debug!(task_id = %self.id(), "task succeeded");
                self.complete(TaskState::Finished, Some(LifecycleHook::Success));
            }
            WorkOutcome::Failed {
                exception,
                traceback,
            } => {
                tracing::debug!(task_id = %self.id(), exception = %exception, "task failed");
                self.report.exception = Some(exception);
                self.report.traceback = traceback;
                self.complete(TaskState::Error, Some(LifecycleHook::Failure));
            }
            WorkOutcome::Canceled { exception } => {
                self.report.exception = exception;
                self.complete(TaskState::Canceled, Some(LifecycleHook::Cancel));
            }
            WorkOutcome::TimedOut { exception } => {
                self.report.exception = Some(exception);
                self.complete(TaskState::TimedOut, Some(LifecycleHook::Failure));
            }
        }
    }

    /// Administrative culling of a WAITING task. Called instead of run.
    pub(crate) fn skip(&mut self, reasons: Vec<ResourceClaim>) {
        if !reasons.is_empty() {
            self.report.reasons = reasons;
        }
        self.complete(TaskState::Skipped, None);
    }

    fn complete(&mut self, state: TaskState, outcome_hook: Option<LifecycleHook>) {
        self.report.state = state;
        self.report.finish_time = Some(SystemTime::now());
        if let Some(hook) = outcome_hook {
            self.fire_hooks(hook);
        }
        self.fire_hooks(LifecycleHook::Complete);
    }

    /// Invoke the registered cancel control hook. An error (or panic) means
    /// the underlying work was NOT cancelled and the task must proceed as if
    /// nothing happened.
    pub(crate) fn invoke_cancel_hook(&self) -> Result<(), DispatchError> {
        let Some(hook) = self.call_request.cancel_hook() else {
            return Err(DispatchError::internal(
                "cancel requested for a task without a cancel control hook",
            ));
        };
        match panic::catch_unwind(AssertUnwindSafe(|| {
            (hook.as_ref())(&self.call_request, &self.report)
        })) {
            Ok(result) => result,
            Err(_) => Err(DispatchError::internal("cancel control hook panicked")),
        }
    }

    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id(),
            group_id: self.call_request.group_id(),
            callable_name: self.call_request.callable_name().to_string(),
            tags: self.report.tags.clone(),
            weight: self.weight(),
            state: self.report.state,
            response: self.report.response,
            reasons: self.report.reasons.clone(),
            progress: self.report.progress.clone(),
            result: self.report.result.clone(),
            exception: self.report.exception.clone(),
            traceback: self.report.traceback.clone(),
            enqueue_time: self.enqueue_time,
            start_time: self.report.start_time,
            finish_time: self.report.finish_time,
        }
    }
}
