//! Manager and dispatcher of concurrent, asynchronous call execution.
//!
//! All admission and state decisions are made by a single dispatcher loop
//! under one lock. Callables execute on their own worker tasks outside the
//! lock and re-acquire it only to report completion.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinError, JoinHandle};

use crate::dispatch::DispatchResult;
use crate::dispatch::coordinator::{self, topological_sort};
use crate::dispatch::registry::CallableRegistry;
use crate::dispatch::task::{Task, WorkOutcome};
use crate::models::call_request::{
    CallRequest, CallRequestId, CancellationToken, GroupId, LifecycleHook, WorkFuture,
};
use crate::models::error::{DispatchError, DispatchErrorKind};
use crate::models::report::{TaskSnapshot, TaskState};
use crate::models::resource::{Decision, ResourceClaim};
use crate::models::snapshot::{ArchivedCallSnapshot, QueuedCallSnapshot};
use crate::persistence::DispatchStore;

#[derive(Clone, Copy, Debug)]
pub struct DispatchConfig {
    /// Ceiling on the summed weight of running tasks.
    pub concurrency_threshold: u32,
    /// How long the dispatcher sleeps between checks for ready tasks when
    /// nothing wakes it explicitly.
    pub dispatch_interval: Duration,
    /// How long completed tasks stay queryable in memory.
    pub completed_task_cache_life: Duration,
    /// Poll interval used while waiting for a task to reach a state.
    pub task_state_poll_interval: Duration,
}

impl DispatchConfig {
    pub fn new(concurrency_threshold: u32) -> Self {
        Self {
            concurrency_threshold,
            dispatch_interval: Duration::from_millis(500),
            completed_task_cache_life: Duration::from_secs(20),
            task_state_poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_dispatch_interval(mut self, dispatch_interval: Duration) -> Self {
        self.dispatch_interval = dispatch_interval;
        self
    }

    pub fn with_completed_task_cache_life(mut self, cache_life: Duration) -> Self {
        self.completed_task_cache_life = cache_life;
        self
    }

    pub fn with_task_state_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.task_state_poll_interval = poll_interval;
        self
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::new(9)
    }
}

/// Outcome of submitting a single call request.
#[derive(Clone, Debug, PartialEq)]
pub enum Submission {
    Accepted { task_id: CallRequestId },
    Rejected { reasons: Vec<ResourceClaim> },
}

/// Outcome of submitting a call request group. One rejected member rejects
/// the whole group and nothing is queued.
#[derive(Clone, Debug, PartialEq)]
pub enum GroupSubmission {
    Accepted {
        group_id: GroupId,
        task_ids: Vec<CallRequestId>,
    },
    Rejected {
        reasons: Vec<ResourceClaim>,
    },
}

pub struct TaskQueue {
    config: DispatchConfig,
    store: Arc<dyn DispatchStore>,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    exit: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct QueueState {
    waiting: Vec<CallRequestId>,
    running: Vec<CallRequestId>,
    cancel_requests: Vec<CallRequestId>,
    tasks: HashMap<CallRequestId, Task>,
    /// Completed tasks in ascending finish order, retained for queries until
    /// the dispatcher purges them.
    completed: VecDeque<TaskSnapshot>,
    running_weight: u32,
    next_seq: u64,
}

/// Terminal bookkeeping that must happen outside the state lock.
struct FinalizeIo {
    task_id: CallRequestId,
    archive: Option<ArchivedCallSnapshot>,
}

enum TaskFinalization {
    Work(WorkOutcome),
    Skipped(Vec<ResourceClaim>),
}

impl QueueState {
    fn find_conflicts(&self, request: &CallRequest) -> coordinator::ConflictReport {
        let in_flight = self
            .running
            .iter()
            .chain(self.waiting.iter())
            .filter_map(|id| self.tasks.get(id))
            .map(|task| (task.id(), task.call_request.resources()));
        coordinator::find_conflicts(request.resources(), in_flight)
    }

    fn snapshot_of(&self, task_id: CallRequestId) -> Option<TaskSnapshot> {
        if let Some(task) = self.tasks.get(&task_id) {
            return Some(task.snapshot());
        }
        self.completed
            .iter()
            .rev()
            .find(|snapshot| snapshot.id == task_id)
            .cloned()
    }

    /// Remove the task from whichever set holds it, release its weight if it
    /// was running, unblock its dependents, and fire the DEQUEUE hooks.
    fn dequeue_locked(&mut self, task: &mut Task) {
        let task_id = task.id();
        self.waiting.retain(|id| *id != task_id);
        if let Some(position) = self.running.iter().position(|id| *id == task_id) {
            self.running.remove(position);
            self.running_weight = self.running_weight.saturating_sub(task.weight());
        }
        for other in self.tasks.values_mut() {
            other.blocking.remove(&task_id);
        }
        task.fire_hooks(LifecycleHook::Dequeue);
    }

    fn finalize_locked(
        &mut self,
        task_id: CallRequestId,
        finalization: TaskFinalization,
    ) -> Option<FinalizeIo> {
        let mut task = self.tasks.remove(&task_id)?;
        match finalization {
            TaskFinalization::Work(outcome) => task.finish(outcome),
            TaskFinalization::Skipped(reasons) => task.skip(reasons),
        }
        self.dequeue_locked(&mut task);
        let archive = task
            .call_request
            .archive()
            .then(|| ArchivedCallSnapshot::of(&task.call_request, &task.report));
        self.completed.push_back(task.snapshot());
        Some(FinalizeIo { task_id, archive })
    }
}

impl TaskQueue {
    pub fn new(config: DispatchConfig, store: Arc<dyn DispatchStore>) -> Self {
        Self {
            config,
            store,
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            exit: Arc::new(AtomicBool::new(false)),
            dispatcher: Mutex::new(None),
        }
    }

    // queue control --------------------------------------------------------

    pub async fn start(&self) -> DispatchResult<()> {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            return Err(DispatchError::invalid_input(
                "task queue dispatcher is already running",
            ));
        }
        self.exit.store(false, Ordering::SeqCst);
        let dispatch_loop = DispatchLoop {
            state: self.state.clone(),
            notify: self.notify.clone(),
            store: self.store.clone(),
            exit: self.exit.clone(),
            config: self.config,
        };
        *dispatcher = Some(tokio::spawn(dispatch_loop.run()));
        Ok(())
    }

    pub async fn stop(&self) -> DispatchResult<()> {
        let handle = self.dispatcher.lock().await.take();
        let Some(handle) = handle else {
            return Err(DispatchError::invalid_input(
                "task queue dispatcher is not running",
            ));
        };
        self.exit.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        handle.await.map_err(|join_error| {
            DispatchError::internal(format!("dispatcher join failure: {join_error}"))
        })
    }

    // submission -----------------------------------------------------------

    /// Evaluate the request against everything waiting and running, then
    /// either queue it or reject it outright. A rejected request never
    /// enters the queue.
    pub async fn submit(&self, call_request: CallRequest) -> DispatchResult<Submission> {
        let accepted = {
            let mut state = self.state.lock().await;
            let conflicts = state.find_conflicts(&call_request);
            if conflicts.decision == Decision::Reject {
                return Ok(Submission::Rejected {
                    reasons: conflicts.reasons,
                });
            }
            let task_id = call_request.id();
            self.enqueue_locked(&mut state, call_request, conflicts)
                .await?;
            task_id
        };
        self.notify.notify_one();
        Ok(Submission::Accepted { task_id: accepted })
    }

    /// Submit several requests as one group: members are queued in an order
    /// compatible with their declared dependencies, and a single rejection
    /// rejects them all.
    pub async fn submit_group(
        &self,
        requests: Vec<CallRequest>,
    ) -> DispatchResult<GroupSubmission> {
        if requests.is_empty() {
            return Err(DispatchError::invalid_input("call request group is empty"));
        }

        let group_id = GroupId::generate();
        let mut requests = requests;
        for request in &mut requests {
            request.set_group(group_id);
        }

        let graph: BTreeMap<CallRequestId, BTreeSet<CallRequestId>> = requests
            .iter()
            .map(|request| (request.id(), request.dependencies().clone()))
            .collect();
        let order = topological_sort(&graph)?;
        let mut by_id: HashMap<CallRequestId, CallRequest> = requests
            .into_iter()
            .map(|request| (request.id(), request))
            .collect();

        let task_ids = {
            let mut state = self.state.lock().await;

            let mut conflict_reports = Vec::with_capacity(order.len());
            for request_id in &order {
                let request = by_id.get(request_id).ok_or_else(|| {
                    DispatchError::internal("call request group lost a member during sorting")
                })?;
                let conflicts = state.find_conflicts(request);
                if conflicts.decision == Decision::Reject {
                    return Ok(GroupSubmission::Rejected {
                        reasons: conflicts.reasons,
                    });
                }
                conflict_reports.push((*request_id, conflicts));
            }

            let mut task_ids = Vec::with_capacity(order.len());
            for (request_id, conflicts) in conflict_reports {
                let request = by_id.remove(&request_id).ok_or_else(|| {
                    DispatchError::internal("call request group lost a member during sorting")
                })?;
                self.enqueue_locked(&mut state, request, conflicts).await?;
                task_ids.push(request_id);
            }
            task_ids
        };

        self.notify.notify_one();
        Ok(GroupSubmission::Accepted { group_id, task_ids })
    }

    async fn enqueue_locked(
        &self,
        state: &mut QueueState,
        call_request: CallRequest,
        conflicts: coordinator::ConflictReport,
    ) -> DispatchResult<()> {
        let task_id = call_request.id();
        let seq = state.next_seq;
        state.next_seq += 1;
        let enqueue_time = SystemTime::now();

        let mut task = Task::new(call_request, seq, enqueue_time);
        task.report.response = Some(conflicts.decision);
        task.report.reasons = conflicts.reasons;
        // a task cannot be blocked by a task that is not currently queued
        task.blocking = task
            .call_request
            .dependencies()
            .iter()
            .copied()
            .filter(|id| state.tasks.contains_key(id))
            .collect();

        let snapshot = QueuedCallSnapshot::of(&task.call_request, TaskState::Waiting, enqueue_time);
        persist_save_queued(&self.store, snapshot).await?;

        task.fire_hooks(LifecycleHook::Enqueue);
        state.waiting.push(task_id);
        state.tasks.insert(task_id, task);
        Ok(())
    }

    // cancellation ---------------------------------------------------------

    /// Request best-effort cancellation. Returns false without touching the
    /// task when it has no cancel control hook or is already complete; never
    /// blocks for the cancellation to take effect.
    pub async fn cancel(&self, task_id: CallRequestId) -> DispatchResult<bool> {
        {
            let mut state = self.state.lock().await;
            if let Some(task) = state.tasks.get(&task_id) {
                if !task.call_request.has_cancel_hook() {
                    return Ok(false);
                }
                if !state.cancel_requests.contains(&task_id) {
                    state.cancel_requests.push(task_id);
                }
            } else if state.snapshot_of(task_id).is_some() {
                // already complete
                return Ok(false);
            } else {
                return Err(unknown_task(task_id));
            }
        }
        self.notify.notify_one();
        Ok(true)
    }

    /// Request cancellation of every task in the group. Returns the cancel
    /// outcome per task.
    pub async fn cancel_group(
        &self,
        group_id: GroupId,
    ) -> DispatchResult<BTreeMap<CallRequestId, bool>> {
        let member_ids: Vec<CallRequestId> = {
            let state = self.state.lock().await;
            state
                .tasks
                .values()
                .filter(|task| task.call_request.group_id() == Some(group_id))
                .map(|task| task.id())
                .collect()
        };

        let mut outcomes = BTreeMap::new();
        for task_id in member_ids {
            let cancelled = self.cancel(task_id).await.unwrap_or(false);
            outcomes.insert(task_id, cancelled);
        }
        Ok(outcomes)
    }

    // removal --------------------------------------------------------------

    /// Forcibly remove a task from the queue without completing it. Removing
    /// an unknown or already-removed task is a no-op. This has no effect on
    /// a worker that is already executing the call.
    pub async fn dequeue(&self, task_id: CallRequestId) -> DispatchResult<()> {
        {
            let mut state = self.state.lock().await;
            let Some(mut task) = state.tasks.remove(&task_id) else {
                return Ok(());
            };
            state.dequeue_locked(&mut task);
        }
        persist_remove_queued(&self.store, task_id).await?;
        self.notify.notify_one();
        Ok(())
    }

    /// Administratively cull a WAITING task to SKIPPED.
    pub async fn skip(
        &self,
        task_id: CallRequestId,
        reasons: Vec<ResourceClaim>,
    ) -> DispatchResult<()> {
        let io = {
            let mut state = self.state.lock().await;
            let Some(task) = state.tasks.get(&task_id) else {
                return Err(unknown_task(task_id));
            };
            if task.state() != TaskState::Waiting {
                return Err(DispatchError::invalid_input(format!(
                    "task '{task_id}' cannot be skipped from state '{}'",
                    task.state().as_str()
                )));
            }
            state.finalize_locked(task_id, TaskFinalization::Skipped(reasons))
        };
        if let Some(io) = io {
            run_finalize_io(&self.store, io).await;
            self.notify.notify_one();
        }
        Ok(())
    }

    // asynchronous call completion -----------------------------------------

    /// Report an asynchronous call's success. Asynchronous calls stay
    /// RUNNING after their callable returns; an external collaborator owns
    /// their completion.
    pub async fn complete_call_success(
        &self,
        task_id: CallRequestId,
        result: Value,
    ) -> DispatchResult<()> {
        self.complete_asynchronous(task_id, WorkOutcome::Finished(result))
            .await
    }

    /// Report an asynchronous call's failure.
    pub async fn complete_call_failure(
        &self,
        task_id: CallRequestId,
        exception: impl Into<String>,
    ) -> DispatchResult<()> {
        self.complete_asynchronous(
            task_id,
            WorkOutcome::Failed {
                exception: exception.into(),
                traceback: None,
            },
        )
        .await
    }

    async fn complete_asynchronous(
        &self,
        task_id: CallRequestId,
        outcome: WorkOutcome,
    ) -> DispatchResult<()> {
        let io = {
            let mut state = self.state.lock().await;
            let Some(task) = state.tasks.get(&task_id) else {
                return Err(unknown_task(task_id));
            };
            if !task.call_request.is_asynchronous() {
                return Err(DispatchError::invalid_input(format!(
                    "task '{task_id}' is not an asynchronous call"
                )));
            }
            if task.state() != TaskState::Running {
                return Err(DispatchError::invalid_input(format!(
                    "task '{task_id}' cannot complete from state '{}'",
                    task.state().as_str()
                )));
            }
            state.finalize_locked(task_id, TaskFinalization::Work(outcome))
        };
        if let Some(io) = io {
            run_finalize_io(&self.store, io).await;
            self.notify.notify_one();
        }
        Ok(())
    }

    // progress -------------------------------------------------------------

    /// Attach a progress payload to a live task's report. Progress reported
    /// after completion is silently ignored.
    pub async fn report_progress(
        &self,
        task_id: CallRequestId,
        progress: Value,
    ) -> DispatchResult<()> {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.report.progress = Some(progress);
            return Ok(());
        }
        if state.snapshot_of(task_id).is_some() {
            return Ok(());
        }
        Err(unknown_task(task_id))
    }

    // queries --------------------------------------------------------------

    pub async fn query(&self, task_id: CallRequestId) -> DispatchResult<TaskSnapshot> {
        let state = self.state.lock().await;
        state
            .snapshot_of(task_id)
            .ok_or_else(|| unknown_task(task_id))
    }

    /// Tasks whose tags include every given tag, newest first. Completed
    /// tasks remain visible for the configured cache lifetime.
    pub async fn find(&self, tags: &[String]) -> Vec<TaskSnapshot> {
        let state = self.state.lock().await;
        let mut matches: Vec<TaskSnapshot> = state
            .completed
            .iter()
            .filter(|snapshot| tags.iter().all(|tag| snapshot.tags.contains(tag)))
            .cloned()
            .chain(
                state
                    .tasks
                    .values()
                    .filter(|task| tags.iter().all(|tag| task.report.tags.contains(tag)))
                    .map(|task| task.snapshot()),
            )
            .collect();
        matches.sort_by(|a, b| b.enqueue_time.cmp(&a.enqueue_time));
        matches
    }

    pub async fn find_group(&self, group_id: GroupId) -> Vec<TaskSnapshot> {
        let state = self.state.lock().await;
        let mut matches: Vec<TaskSnapshot> = state
            .completed
            .iter()
            .filter(|snapshot| snapshot.group_id == Some(group_id))
            .cloned()
            .chain(
                state
                    .tasks
                    .values()
                    .filter(|task| task.call_request.group_id() == Some(group_id))
                    .map(|task| task.snapshot()),
            )
            .collect();
        matches.sort_by(|a, b| b.enqueue_time.cmp(&a.enqueue_time));
        matches
    }

    pub async fn waiting_tasks(&self) -> Vec<TaskSnapshot> {
        let state = self.state.lock().await;
        let mut tasks: Vec<&Task> = state
            .waiting
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .collect();
        tasks.sort_by_key(|task| task.seq);
        tasks.into_iter().map(|task| task.snapshot()).collect()
    }

    pub async fn running_tasks(&self) -> Vec<TaskSnapshot> {
        let state = self.state.lock().await;
        let mut tasks: Vec<&Task> = state
            .running
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .collect();
        tasks.sort_by_key(|task| task.seq);
        tasks.into_iter().map(|task| task.snapshot()).collect()
    }

    /// Block until the task reaches a terminal state, or until the optional
    /// timeout elapses. Polls on the configured task-state interval.
    pub async fn wait_for_terminal(
        &self,
        task_id: CallRequestId,
        timeout_duration: Option<Duration>,
    ) -> DispatchResult<TaskSnapshot> {
        let deadline = timeout_duration.map(|duration| tokio::time::Instant::now() + duration);
        loop {
            {
                let state = self.state.lock().await;
                let Some(snapshot) = state.snapshot_of(task_id) else {
                    return Err(unknown_task(task_id));
                };
                if snapshot.state.is_terminal() {
                    return Ok(snapshot);
                }
            }
            if let Some(deadline) = deadline
                && tokio::time::Instant::now() >= deadline
            {
                return Err(DispatchError::timeout(format!(
                    "timed out waiting for task '{task_id}' to complete"
                )));
            }
            tokio::time::sleep(self.config.task_state_poll_interval).await;
        }
    }

    // restart recovery -----------------------------------------------------

    /// Rebuild the waiting set from persisted queued-call snapshots.
    ///
    /// Snapshots persisted as RUNNING belong to workers that no longer
    /// exist; they are re-queued as WAITING like everything else. Snapshots
    /// whose callable is not registered are dropped with a warning. Returns
    /// the number of requests re-queued.
    pub async fn rehydrate(&self, registry: &CallableRegistry) -> DispatchResult<usize> {
        let store = self.store.clone();
        let mut snapshots = tokio::task::spawn_blocking(move || store.load_queued())
            .await
            .map_err(|join_error| {
                DispatchError::internal(format!("queued call load join failure: {join_error}"))
            })??;
        snapshots.sort_by_key(|snapshot| snapshot.enqueue_time);

        let mut requeued = 0;
        for snapshot in snapshots {
            let snapshot_id = snapshot.id;
            // submit re-saves the snapshot; clear the stale row up front
            if let Err(error) = persist_remove_queued(&self.store, snapshot_id).await {
                tracing::error!(
                    call_request_id = %snapshot_id,
                    %error,
                    "failed to clear stale queued call snapshot"
                );
            }
            let Some(resolved) = registry.resolve(&snapshot.callable_name) else {
                tracing::warn!(
                    call_request_id = %snapshot_id,
                    callable_name = %snapshot.callable_name,
                    "no registered callable for queued call; dropping it"
                );
                continue;
            };
            let request = match CallRequest::restore(snapshot, resolved) {
                Ok(request) => request,
                Err(error) => {
                    tracing::warn!(
                        call_request_id = %snapshot_id,
                        %error,
                        "failed to restore queued call; dropping it"
                    );
                    continue;
                }
            };
            match self.submit(request).await? {
                Submission::Accepted { .. } => requeued += 1,
                Submission::Rejected { reasons } => {
                    tracing::warn!(
                        call_request_id = %snapshot_id,
                        ?reasons,
                        "queued call rejected during rehydration"
                    );
                }
            }
        }
        Ok(requeued)
    }
}

// dispatcher loop ------------------------------------------------------------

struct DispatchLoop {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    store: Arc<dyn DispatchStore>,
    exit: Arc<AtomicBool>,
    config: DispatchConfig,
}

impl DispatchLoop {
    async fn run(self) {
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.dispatch_interval) => {}
            }
            if self.exit.load(Ordering::SeqCst) {
                return;
            }
            // a broken iteration must not kill the loop: a dead dispatcher
            // orphans all waiting work
            if let Err(error) = self.iteration().await {
                tracing::error!(%error, "task queue dispatcher iteration failed");
            }
        }
    }

    async fn iteration(&self) -> DispatchResult<()> {
        let launched = self.admit_ready_tasks().await;
        self.process_cancel_requests().await;
        self.purge_completed_cache().await;
        for snapshot in launched {
            let task_id = snapshot.id;
            if let Err(error) = persist_save_queued(&self.store, snapshot).await {
                tracing::error!(
                    task_id = %task_id,
                    %error,
                    "failed to persist running state for launched task"
                );
            }
        }
        Ok(())
    }

    /// Admit waiting tasks in enqueue order while the concurrency budget
    /// holds. The scan never stops early: later tasks may have a weight of
    /// zero or touch disjoint resources.
    async fn admit_ready_tasks(&self) -> Vec<QueuedCallSnapshot> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let mut available = self
            .config
            .concurrency_threshold
            .saturating_sub(state.running_weight);
        let mut admitted: Vec<CallRequestId> = Vec::new();

        for task_id in state.waiting.clone() {
            let Some(task) = state.tasks.get(&task_id) else {
                continue;
            };
            if !task.blocking.is_empty() {
                continue;
            }
            if task.weight() > available {
                continue;
            }
            let seq = task.seq;
            // in-flight = everything running plus every waiting task queued
            // ahead of this one; tasks admitted earlier in this scan are
            // still in the waiting list and count through the second arm
            let decision = {
                let running = state
                    .running
                    .iter()
                    .filter_map(|id| state.tasks.get(id))
                    .map(|other| other.call_request.resources());
                let ahead = state
                    .waiting
                    .iter()
                    .filter_map(|id| state.tasks.get(id))
                    .filter(|other| other.seq < seq)
                    .map(|other| other.call_request.resources());
                coordinator::evaluate(task.call_request.resources(), running.chain(ahead))
            };
            if decision != Decision::Accept {
                continue;
            }
            available -= task.weight();
            admitted.push(task_id);
        }

        let mut launched = Vec::with_capacity(admitted.len());
        for task_id in admitted {
            let Some(task) = state.tasks.get_mut(&task_id) else {
                continue;
            };
            let weight = task.weight();
            let token = task.token.clone();
            let timeout_policy = task.call_request.timeout();
            // RUN hooks fire synchronously here, before the worker launches
            task.begin_running();
            let work = task.call_request.begin_work(token.clone());
            launched.push(QueuedCallSnapshot::of(
                &task.call_request,
                TaskState::Running,
                task.enqueue_time,
            ));
            state.waiting.retain(|id| *id != task_id);
            state.running.push(task_id);
            state.running_weight += weight;
            self.spawn_worker(task_id, work, token, timeout_policy);
        }
        launched
    }

    fn spawn_worker(
        &self,
        task_id: CallRequestId,
        work: WorkFuture,
        token: CancellationToken,
        timeout_policy: Option<Duration>,
    ) {
        let state = self.state.clone();
        let store = self.store.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            let work_handle = tokio::spawn(work);
            let abort_handle = work_handle.abort_handle();

            let joined = match timeout_policy {
                Some(limit) => match tokio::time::timeout(limit, work_handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        token.cancel();
                        abort_handle.abort();
                        let outcome = WorkOutcome::TimedOut {
                            exception: format!("call timed out after {limit:?}"),
                        };
                        complete_task(&state, &store, &notify, task_id, outcome).await;
                        return;
                    }
                },
                None => work_handle.await,
            };

            let outcome = outcome_from_join(joined, &token);
            complete_task(&state, &store, &notify, task_id, outcome).await;
        });
    }

    async fn process_cancel_requests(&self) {
        let io_list = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let requests = std::mem::take(&mut state.cancel_requests);
            let mut io_list = Vec::new();

            for task_id in requests {
                let cull = match state.tasks.get(&task_id) {
                    None => false,
                    Some(task) => match task.state() {
                        TaskState::Waiting => match task.invoke_cancel_hook() {
                            Ok(()) => {
                                task.token.cancel();
                                true
                            }
                            Err(error) => {
                                tracing::error!(
                                    task_id = %task_id,
                                    %error,
                                    "cancel control hook failed; task was not cancelled"
                                );
                                false
                            }
                        },
                        TaskState::Running => {
                            // the worker observes the token and reports the
                            // cancellation itself
                            match task.invoke_cancel_hook() {
                                Ok(()) => task.token.cancel(),
                                Err(error) => {
                                    tracing::error!(
                                        task_id = %task_id,
                                        %error,
                                        "cancel control hook failed; task was not cancelled"
                                    );
                                }
                            }
                            false
                        }
                        _ => false,
                    },
                };
                if cull
                    && let Some(io) = state.finalize_locked(
                        task_id,
                        TaskFinalization::Work(WorkOutcome::Canceled { exception: None }),
                    )
                {
                    io_list.push(io);
                }
            }
            io_list
        };

        for io in io_list {
            run_finalize_io(&self.store, io).await;
        }
    }

    async fn purge_completed_cache(&self) {
        let cutoff = SystemTime::now() - self.config.completed_task_cache_life;
        let mut state = self.state.lock().await;
        while let Some(front) = state.completed.front() {
            let expired = front
                .finish_time
                .map(|finish_time| finish_time < cutoff)
                .unwrap_or(true);
            if !expired {
                break;
            }
            state.completed.pop_front();
        }
    }
}

// worker completion ----------------------------------------------------------

async fn complete_task(
    state: &Arc<Mutex<QueueState>>,
    store: &Arc<dyn DispatchStore>,
    notify: &Arc<Notify>,
    task_id: CallRequestId,
    outcome: WorkOutcome,
) {
    let io = {
        let mut guard = state.lock().await;
        // asynchronous calls stay RUNNING on a clean return; an external
        // collaborator reports their completion later
        if let Some(task) = guard.tasks.get(&task_id)
            && task.call_request.is_asynchronous()
            && matches!(outcome, WorkOutcome::Finished(_))
        {
            return;
        }
        guard.finalize_locked(task_id, TaskFinalization::Work(outcome))
    };
    let Some(io) = io else {
        tracing::debug!(task_id = %task_id, "completion reported for a dequeued task");
        return;
    };
    run_finalize_io(store, io).await;
    notify.notify_one();
}

async fn run_finalize_io(store: &Arc<dyn DispatchStore>, io: FinalizeIo) {
    if let Err(error) = persist_remove_queued(store, io.task_id).await {
        tracing::error!(
            task_id = %io.task_id,
            %error,
            "failed to remove queued call snapshot"
        );
    }
    if let Some(snapshot) = io.archive
        && let Err(error) = persist_save_archived(store, snapshot).await
    {
        tracing::error!(task_id = %io.task_id, %error, "failed to archive completed call");
    }
}

fn outcome_from_join(
    joined: Result<Result<Value, DispatchError>, JoinError>,
    token: &CancellationToken,
) -> WorkOutcome {
    match joined {
        Ok(Ok(result)) => {
            if token.is_cancelled() {
                WorkOutcome::Canceled { exception: None }
            } else {
                WorkOutcome::Finished(result)
            }
        }
        Ok(Err(error)) => {
            if token.is_cancelled() || error.kind == DispatchErrorKind::Cancelled {
                WorkOutcome::Canceled {
                    exception: Some(error.to_string()),
                }
            } else {
                WorkOutcome::Failed {
                    exception: error.to_string(),
                    traceback: None,
                }
            }
        }
        Err(join_error) if join_error.is_panic() => WorkOutcome::Failed {
            exception: panic_message(join_error.into_panic()),
            traceback: Some("panic in dispatched callable".to_string()),
        },
        Err(_) => WorkOutcome::Canceled { exception: None },
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "dispatched callable panicked".to_string()
    }
}

// persistence helpers --------------------------------------------------------

async fn persist_save_queued(
    store: &Arc<dyn DispatchStore>,
    snapshot: QueuedCallSnapshot,
) -> DispatchResult<()> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.save_queued(&snapshot))
        .await
        .map_err(|join_error| {
            DispatchError::internal(format!("queued call persistence join failure: {join_error}"))
        })?
}

async fn persist_remove_queued(
    store: &Arc<dyn DispatchStore>,
    task_id: CallRequestId,
) -> DispatchResult<()> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.remove_queued(task_id))
        .await
        .map_err(|join_error| {
            DispatchError::internal(format!("queued call removal join failure: {join_error}"))
        })?
}

async fn persist_save_archived(
    store: &Arc<dyn DispatchStore>,
    snapshot: ArchivedCallSnapshot,
) -> DispatchResult<()> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.save_archived(&snapshot))
        .await
        .map_err(|join_error| {
            DispatchError::internal(format!("archive persistence join failure: {join_error}"))
        })?
}

fn unknown_task(task_id: CallRequestId) -> DispatchError {
    DispatchError::new(
        DispatchErrorKind::UnknownTask,
        format!("unknown task id '{task_id}'"),
    )
}
