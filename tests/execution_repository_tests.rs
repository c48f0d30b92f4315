use std::collections::HashMap;
use std::sync::Arc;

use prost::Message;
use tokio_util::sync::CancellationToken;

use octavius::dispatch::ExecutionStatus;
use octavius::error::ControllerError;
use octavius::proto;
use octavius::repository::ExecutionRepository;
use octavius::store::{MemStore, StoreClient};

fn execution_context(job_k8s_name: &str, job_id: &str) -> proto::ExecutionContext {
    proto::ExecutionContext {
        job_k8s_name: job_k8s_name.to_string(),
        job_id: job_id.to_string(),
        image_name: "images/test-image".to_string(),
        executor_id: "executor-1".to_string(),
        status: ExecutionStatus::Created.to_proto() as i32,
        env_args: HashMap::from([("data".to_string(), "test data".to_string())]),
        output: String::new(),
        updated_at_ms: 0,
        failure_reason: String::new(),
    }
}

fn repository() -> (Arc<MemStore>, ExecutionRepository) {
    let store = Arc::new(MemStore::new());
    let repo = ExecutionRepository::new(store.clone() as Arc<dyn StoreClient>);
    (store, repo)
}

#[tokio::test]
async fn test_save_then_get() {
    let (_store, repo) = repository();
    let ctx = CancellationToken::new();
    let context = execution_context("octavius-test", "123");

    repo.save(&ctx, &context).await.unwrap();
    let fetched = repo.get(&ctx, "octavius-test").await.unwrap();

    assert_eq!(fetched.job_id, "123");
    assert_eq!(fetched.executor_id, "executor-1");
    assert_eq!(fetched.status, ExecutionStatus::Created.to_proto() as i32);
    assert!(fetched.updated_at_ms > 0);
}

#[tokio::test]
async fn test_get_logs_returns_output() {
    let (_store, repo) = repository();
    let ctx = CancellationToken::new();

    let mut context = execution_context("octavius-logs", "123");
    context.output = "here are the logs".to_string();
    repo.save(&ctx, &context).await.unwrap();

    let logs = repo.get_logs(&ctx, "octavius-logs").await.unwrap();
    assert_eq!(logs, "here are the logs");
}

#[tokio::test]
async fn test_get_logs_for_unknown_execution() {
    let (_store, repo) = repository();
    let ctx = CancellationToken::new();

    let err = repo.get_logs(&ctx, "octavius-ghost").await.unwrap_err();
    assert!(matches!(err, ControllerError::NotFound(_)));
}

#[tokio::test]
async fn test_update_status_walks_the_forward_path() {
    let (_store, repo) = repository();
    let ctx = CancellationToken::new();
    repo.save(&ctx, &execution_context("octavius-walk", "123"))
        .await
        .unwrap();

    let running = repo
        .update_status(&ctx, "octavius-walk", ExecutionStatus::Running, None)
        .await
        .unwrap();
    assert_eq!(running.status, ExecutionStatus::Running.to_proto() as i32);

    let done = repo
        .update_status(
            &ctx,
            "octavius-walk",
            ExecutionStatus::Succeeded,
            Some("hello"),
        )
        .await
        .unwrap();
    assert_eq!(done.status, ExecutionStatus::Succeeded.to_proto() as i32);
    assert_eq!(done.output, "hello");
}

#[tokio::test]
async fn test_update_status_rejects_terminal_transitions() {
    let (_store, repo) = repository();
    let ctx = CancellationToken::new();
    repo.save(&ctx, &execution_context("octavius-term", "123"))
        .await
        .unwrap();

    repo.update_status(&ctx, "octavius-term", ExecutionStatus::Failed, None)
        .await
        .unwrap();

    let err = repo
        .update_status(&ctx, "octavius-term", ExecutionStatus::Succeeded, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::FailedPrecondition(_)));
}

#[tokio::test]
async fn test_update_status_rejects_unknown_execution() {
    let (_store, repo) = repository();
    let ctx = CancellationToken::new();

    let err = repo
        .update_status(&ctx, "octavius-ghost", ExecutionStatus::Running, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::FailedPrecondition(_)));
}

#[tokio::test]
async fn test_cumulative_output_replaces_old_text() {
    let (_store, repo) = repository();
    let ctx = CancellationToken::new();
    repo.save(&ctx, &execution_context("octavius-out", "123"))
        .await
        .unwrap();

    repo.update_status(&ctx, "octavius-out", ExecutionStatus::Running, Some("line1\n"))
        .await
        .unwrap();
    let done = repo
        .update_status(
            &ctx,
            "octavius-out",
            ExecutionStatus::Succeeded,
            Some("line1\nline2\n"),
        )
        .await
        .unwrap();
    assert_eq!(done.output, "line1\nline2\n");
}

#[tokio::test]
async fn test_mark_failed_records_reason() {
    let (_store, repo) = repository();
    let ctx = CancellationToken::new();
    repo.save(&ctx, &execution_context("octavius-lost", "123"))
        .await
        .unwrap();

    let failed = repo
        .mark_failed(&ctx, "octavius-lost", "executor_lost")
        .await
        .unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed.to_proto() as i32);
    assert_eq!(failed.failure_reason, "executor_lost");

    // Terminal records are frozen.
    let err = repo
        .mark_failed(&ctx, "octavius-lost", "again")
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::FailedPrecondition(_)));
}

#[tokio::test]
async fn test_find_by_job_id_prefers_latest_non_terminal() {
    let (store, repo) = repository();
    let ctx = CancellationToken::new();

    // Two contexts for job 555 after a crash-recovery re-dispatch: an old
    // terminal one and a newer live one. Written directly so the write
    // times are controlled.
    let mut old = execution_context("octavius-old", "555");
    old.status = ExecutionStatus::Failed.to_proto() as i32;
    old.updated_at_ms = 1_000;
    store
        .put(&ctx, "execution/octavius-old", old.encode_to_vec())
        .await
        .unwrap();

    let mut live = execution_context("octavius-live", "555");
    live.status = ExecutionStatus::Running.to_proto() as i32;
    live.updated_at_ms = 2_000;
    store
        .put(&ctx, "execution/octavius-live", live.encode_to_vec())
        .await
        .unwrap();

    let found = repo.find_by_job_id(&ctx, "555").await.unwrap();
    assert_eq!(found.job_k8s_name, "octavius-live");
}

#[tokio::test]
async fn test_find_by_job_id_falls_back_to_latest_terminal() {
    let (store, repo) = repository();
    let ctx = CancellationToken::new();

    let mut first = execution_context("octavius-a", "777");
    first.status = ExecutionStatus::Failed.to_proto() as i32;
    first.updated_at_ms = 1_000;
    store
        .put(&ctx, "execution/octavius-a", first.encode_to_vec())
        .await
        .unwrap();

    let mut second = execution_context("octavius-b", "777");
    second.status = ExecutionStatus::Succeeded.to_proto() as i32;
    second.updated_at_ms = 3_000;
    store
        .put(&ctx, "execution/octavius-b", second.encode_to_vec())
        .await
        .unwrap();

    let found = repo.find_by_job_id(&ctx, "777").await.unwrap();
    assert_eq!(found.job_k8s_name, "octavius-b");

    let err = repo.find_by_job_id(&ctx, "888").await.unwrap_err();
    assert!(matches!(err, ControllerError::NotFound(_)));
}
