use std::sync::Arc;
use std::time::Duration;

use convoy_core::dispatch::{DispatchConfig, GroupSubmission, Submission, TaskQueue, callable};
use convoy_core::models::{
    CallRequest, Callable, Decision, DispatchErrorKind, Operation, ResourceFootprint, ResourceType,
    TaskState,
};
use convoy_core::persistence::InMemoryDispatchStore;
use serde_json::{Value, json};

fn test_queue(threshold: u32) -> TaskQueue {
    let config =
        DispatchConfig::new(threshold).with_dispatch_interval(Duration::from_millis(10));
    TaskQueue::new(config, Arc::new(InMemoryDispatchStore::new()))
}

fn noop() -> Arc<dyn Callable> {
    callable("noop", |_args, _kwargs, _token| async { Ok(Value::Null) })
}

fn footprint(operation: Operation, repo: &str) -> ResourceFootprint {
    let mut footprint = ResourceFootprint::new();
    footprint
        .claim(ResourceType::Repository, repo, operation)
        .unwrap();
    footprint
}

#[tokio::test]
async fn read_against_pending_delete_is_rejected() {
    let queue = test_queue(1);

    let update = CallRequest::new(noop()).with_resources(footprint(Operation::Update, "repo-1"));
    let Submission::Accepted { .. } = queue.submit(update).await.unwrap() else {
        panic!("update should be accepted");
    };

    // delete vs pending update postpones, but read vs pending delete is the
    // canonical rejection; exercise the reject path with read-after-delete
    let delete = CallRequest::new(noop()).with_resources(footprint(Operation::Delete, "repo-1"));
    let Submission::Accepted { .. } = queue.submit(delete).await.unwrap() else {
        panic!("delete should be postponed, not rejected");
    };

    let read = CallRequest::new(noop()).with_resources(footprint(Operation::Read, "repo-1"));
    let read_id = read.id();
    let Submission::Rejected { reasons } = queue.submit(read).await.unwrap() else {
        panic!("read against a pending delete must be rejected");
    };

    assert!(
        reasons
            .iter()
            .any(|reason| reason.resource_id == "repo-1" && reason.operation == Operation::Delete)
    );
    // a rejected request never enters the queue
    let error = queue.query(read_id).await.unwrap_err();
    assert_eq!(error.kind, DispatchErrorKind::UnknownTask);
}

#[tokio::test]
async fn postponed_submission_reports_blocking_reasons() {
    let queue = test_queue(1);

    let first = CallRequest::new(noop()).with_resources(footprint(Operation::Update, "repo-1"));
    queue.submit(first).await.unwrap();

    let second = CallRequest::new(noop()).with_resources(footprint(Operation::Update, "repo-1"));
    let second_id = second.id();
    let Submission::Accepted { task_id } = queue.submit(second).await.unwrap() else {
        panic!("conflicting update should be postponed, not rejected");
    };
    assert_eq!(task_id, second_id);

    let snapshot = queue.query(second_id).await.unwrap();
    assert_eq!(snapshot.state, TaskState::Waiting);
    assert_eq!(snapshot.response, Some(Decision::Postpone));
    assert_eq!(snapshot.reasons.len(), 1);
    assert_eq!(snapshot.reasons[0].resource_id, "repo-1");
    assert_eq!(snapshot.reasons[0].operation, Operation::Update);
}

#[tokio::test]
async fn empty_footprint_is_accepted_against_anything() {
    let queue = test_queue(1);

    let delete = CallRequest::new(noop()).with_resources(footprint(Operation::Delete, "repo-1"));
    queue.submit(delete).await.unwrap();

    let reporting = CallRequest::new(noop());
    let reporting_id = reporting.id();
    let Submission::Accepted { .. } = queue.submit(reporting).await.unwrap() else {
        panic!("a request with no footprint must always be accepted");
    };

    let snapshot = queue.query(reporting_id).await.unwrap();
    assert_eq!(snapshot.response, Some(Decision::Accept));
    assert!(snapshot.reasons.is_empty());
}

#[tokio::test]
async fn one_rejected_member_rejects_the_whole_group() {
    let queue = test_queue(2);

    let delete = CallRequest::new(noop()).with_resources(footprint(Operation::Delete, "repo-2"));
    queue.submit(delete).await.unwrap();

    let clean = CallRequest::new(noop()).with_resources(footprint(Operation::Update, "repo-3"));
    let clean_id = clean.id();
    let doomed = CallRequest::new(noop()).with_resources(footprint(Operation::Read, "repo-2"));

    let GroupSubmission::Rejected { reasons } =
        queue.submit_group(vec![clean, doomed]).await.unwrap()
    else {
        panic!("the group must be rejected as a whole");
    };
    assert!(!reasons.is_empty());

    // nothing from the group entered the queue, not even the clean member
    let error = queue.query(clean_id).await.unwrap_err();
    assert_eq!(error.kind, DispatchErrorKind::UnknownTask);
}

#[tokio::test]
async fn group_members_share_a_group_id() {
    let queue = test_queue(2);

    let first = CallRequest::new(noop());
    let second = CallRequest::new(noop());

    let GroupSubmission::Accepted { group_id, task_ids } =
        queue.submit_group(vec![first, second]).await.unwrap()
    else {
        panic!("conflict-free group should be accepted");
    };
    assert_eq!(task_ids.len(), 2);

    let members = queue.find_group(group_id).await;
    assert_eq!(members.len(), 2);
    for member in members {
        assert_eq!(member.group_id, Some(group_id));
    }
}

#[tokio::test]
async fn dependency_cycle_in_a_group_is_an_error() {
    let queue = test_queue(2);

    let mut first = CallRequest::new(noop());
    let mut second = CallRequest::new(noop());
    let first_id = first.id();
    let second_id = second.id();
    first.depends_on(second_id);
    second.depends_on(first_id);

    let error = queue.submit_group(vec![first, second]).await.unwrap_err();
    assert_eq!(error.kind, DispatchErrorKind::DependencyCycle);
}

#[tokio::test]
async fn empty_group_is_invalid() {
    let queue = test_queue(1);
    let error = queue.submit_group(Vec::new()).await.unwrap_err();
    assert_eq!(error.kind, DispatchErrorKind::InvalidInput);
}

#[tokio::test]
async fn find_matches_all_given_tags_newest_first() {
    let queue = test_queue(1);

    let sync = CallRequest::new(noop())
        .with_tags(vec!["repo".to_string(), "sync".to_string()])
        .with_args(vec![json!("repo-1")]);
    let sync_id = sync.id();
    queue.submit(sync).await.unwrap();

    // distinct enqueue times so newest-first ordering is unambiguous
    tokio::time::sleep(Duration::from_millis(10)).await;

    let publish = CallRequest::new(noop())
        .with_tags(vec!["repo".to_string(), "publish".to_string()]);
    let publish_id = publish.id();
    queue.submit(publish).await.unwrap();

    let repo_tagged = queue.find(&["repo".to_string()]).await;
    assert_eq!(repo_tagged.len(), 2);
    // newest first
    assert_eq!(repo_tagged[0].id, publish_id);
    assert_eq!(repo_tagged[1].id, sync_id);

    let sync_tagged = queue
        .find(&["repo".to_string(), "sync".to_string()])
        .await;
    assert_eq!(sync_tagged.len(), 1);
    assert_eq!(sync_tagged[0].id, sync_id);

    assert!(queue.find(&["missing".to_string()]).await.is_empty());
}
