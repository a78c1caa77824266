use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use convoy_core::dispatch::{DispatchConfig, Submission, TaskQueue, callable};
use convoy_core::models::{
    CallRequest, CallRequestId, DispatchErrorKind, LifecycleHook, TaskState,
};
use convoy_core::persistence::InMemoryDispatchStore;
use serde_json::Value;

fn test_queue(threshold: u32) -> TaskQueue {
    let config =
        DispatchConfig::new(threshold).with_dispatch_interval(Duration::from_millis(10));
    TaskQueue::new(config, Arc::new(InMemoryDispatchStore::new()))
}

fn permissive_cancel_hook(request: &mut CallRequest) {
    request.set_cancel_hook(Arc::new(|_request, _report| Ok(())));
}

async fn submit(queue: &TaskQueue, request: CallRequest) -> CallRequestId {
    match queue.submit(request).await.unwrap() {
        Submission::Accepted { task_id } => task_id,
        Submission::Rejected { reasons } => panic!("unexpected rejection: {reasons:?}"),
    }
}

#[tokio::test]
async fn cancel_without_a_control_hook_is_not_permitted() {
    let queue = test_queue(1);

    let request = CallRequest::new(callable("sync", |_args, _kwargs, _token| async {
        Ok(Value::Null)
    }));
    let task_id = submit(&queue, request).await;

    assert!(!queue.cancel(task_id).await.unwrap());
    // the task was left exactly where it was
    assert_eq!(queue.query(task_id).await.unwrap().state, TaskState::Waiting);
}

#[tokio::test]
async fn cancel_of_an_unknown_task_is_an_error() {
    let queue = test_queue(1);
    let error = queue.cancel(CallRequestId::generate()).await.unwrap_err();
    assert_eq!(error.kind, DispatchErrorKind::UnknownTask);
}

#[tokio::test]
async fn waiting_task_cancels_before_it_ever_runs() {
    let queue = test_queue(1);
    queue.start().await.unwrap();

    // occupy the whole budget so the victim stays WAITING
    let blocker = CallRequest::new(callable("blocker", |_args, _kwargs, _token| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Value::Null)
    }));
    let blocker_id = submit(&queue, blocker).await;

    let ran = Arc::new(AtomicBool::new(false));
    let hook_log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let mut victim = CallRequest::new(callable("victim", {
        let ran = ran.clone();
        move |_args, _kwargs, _token| {
            let ran = ran.clone();
            async move {
                ran.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }
    }));
    permissive_cancel_hook(&mut victim);
    for (hook, label) in [
        (LifecycleHook::Cancel, "cancel"),
        (LifecycleHook::Complete, "complete"),
    ] {
        let hook_log = hook_log.clone();
        victim.add_life_cycle_callback(
            hook,
            Arc::new(move |_request, _report| hook_log.lock().unwrap().push(label)),
        );
    }
    let victim_id = submit(&queue, victim).await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(queue.cancel(victim_id).await.unwrap());

    let snapshot = queue
        .wait_for_terminal(victim_id, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(snapshot.state, TaskState::Canceled);
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(*hook_log.lock().unwrap(), vec!["cancel", "complete"]);

    queue
        .wait_for_terminal(blocker_id, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    queue.stop().await.unwrap();
}

#[tokio::test]
async fn running_task_cancels_cooperatively_through_its_token() {
    let queue = test_queue(1);
    queue.start().await.unwrap();

    let mut request = CallRequest::new(callable("sync", |_args, _kwargs, token| async move {
        loop {
            if token.is_cancelled() {
                return Ok(Value::Null);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }));
    permissive_cancel_hook(&mut request);
    let task_id = submit(&queue, request).await;

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(queue.query(task_id).await.unwrap().state, TaskState::Running);

    assert!(queue.cancel(task_id).await.unwrap());
    let snapshot = queue
        .wait_for_terminal(task_id, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(snapshot.state, TaskState::Canceled);

    queue.stop().await.unwrap();
}

#[tokio::test]
async fn task_that_ignores_its_token_cannot_be_force_terminated() {
    let queue = test_queue(1);
    queue.start().await.unwrap();

    let mut request = CallRequest::new(callable("stubborn", |_args, _kwargs, _token| async {
        tokio::time::sleep(Duration::from_millis(120)).await;
        Ok(Value::Null)
    }));
    permissive_cancel_hook(&mut request);
    let task_id = submit(&queue, request).await;

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(queue.cancel(task_id).await.unwrap());

    // still running: cancellation is cooperative only
    assert_eq!(queue.query(task_id).await.unwrap().state, TaskState::Running);

    // once the callable finally returns, the cancellation is observed
    let snapshot = queue
        .wait_for_terminal(task_id, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(snapshot.state, TaskState::Canceled);

    queue.stop().await.unwrap();
}

#[tokio::test]
async fn cancel_after_completion_returns_false() {
    let queue = test_queue(1);
    queue.start().await.unwrap();

    let mut request = CallRequest::new(callable("sync", |_args, _kwargs, _token| async {
        Ok(Value::Null)
    }));
    permissive_cancel_hook(&mut request);
    let task_id = submit(&queue, request).await;

    queue
        .wait_for_terminal(task_id, Some(Duration::from_secs(2)))
        .await
        .unwrap();

    assert!(!queue.cancel(task_id).await.unwrap());
    queue.stop().await.unwrap();
}

#[tokio::test]
async fn failing_cancel_hook_leaves_the_task_untouched() {
    let queue = test_queue(1);
    queue.start().await.unwrap();

    // budget is occupied so the victim stays WAITING
    let blocker = CallRequest::new(callable("blocker", |_args, _kwargs, _token| async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(Value::Null)
    }));
    submit(&queue, blocker).await;

    let mut victim = CallRequest::new(callable("victim", |_args, _kwargs, _token| async {
        Ok(Value::Null)
    }));
    victim.set_cancel_hook(Arc::new(|_request, _report| {
        Err(convoy_core::models::DispatchError::internal(
            "agent unreachable",
        ))
    }));
    let victim_id = submit(&queue, victim).await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    // the request is accepted, but the hook refuses, so nothing changes
    assert!(queue.cancel(victim_id).await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.query(victim_id).await.unwrap().state, TaskState::Waiting);

    // with the blocker done the victim runs to completion as if the cancel
    // had never been attempted
    let snapshot = queue
        .wait_for_terminal(victim_id, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(snapshot.state, TaskState::Finished);

    queue.stop().await.unwrap();
}

#[tokio::test]
async fn cancel_group_reports_per_task_outcomes() {
    let queue = test_queue(2);

    let mut cancellable = CallRequest::new(callable("a", |_args, _kwargs, _token| async {
        Ok(Value::Null)
    }));
    permissive_cancel_hook(&mut cancellable);
    let stubborn = CallRequest::new(callable("b", |_args, _kwargs, _token| async {
        Ok(Value::Null)
    }));
    let cancellable_id = cancellable.id();
    let stubborn_id = stubborn.id();

    let convoy_core::dispatch::GroupSubmission::Accepted { group_id, .. } = queue
        .submit_group(vec![cancellable, stubborn])
        .await
        .unwrap()
    else {
        panic!("group should be accepted");
    };

    let outcomes = queue.cancel_group(group_id).await.unwrap();
    assert_eq!(outcomes.get(&cancellable_id), Some(&true));
    assert_eq!(outcomes.get(&stubborn_id), Some(&false));
}
