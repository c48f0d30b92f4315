use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::{Code, Request};

use octavius::dispatch::Dispatcher;
use octavius::grpc::admin_service::AdminService;
use octavius::proto;
use octavius::proto::admin_cp_service_server::AdminCpService;
use octavius::repository::ExecutorRepository;
use octavius::store::{MemStore, StoreClient};

fn create_test_service(admin_token: &str) -> (AdminService, ExecutorRepository, CancellationToken) {
    let store = Arc::new(MemStore::new()) as Arc<dyn StoreClient>;
    let shutdown = CancellationToken::new();
    let (dispatcher, handle) = Dispatcher::new(store.clone(), shutdown.clone());
    tokio::spawn(dispatcher.run());

    let executors = ExecutorRepository::new(store);
    let service = AdminService::new(
        executors.clone(),
        handle,
        admin_token.to_string(),
        shutdown.clone(),
    );
    (service, executors, shutdown)
}

async fn register_pending(executors: &ExecutorRepository, id: &str) {
    let ctx = CancellationToken::new();
    executors
        .save(
            &ctx,
            &proto::ExecutorInfo {
                id: id.to_string(),
                host: "10.0.0.1:9090".to_string(),
                state: proto::ExecutorState::PendingApproval as i32,
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_approve_makes_executor_active() {
    let (service, executors, shutdown) = create_test_service("secret");
    register_pending(&executors, "e1").await;

    let response = service
        .approve_executor(Request::new(proto::ApprovalRequest {
            executor_id: "e1".to_string(),
            admin_token: "secret".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.status, "approved");

    let ctx = CancellationToken::new();
    let record = executors.get(&ctx, "e1").await.unwrap();
    assert_eq!(record.state, proto::ExecutorState::Active as i32);
    shutdown.cancel();
}

#[tokio::test]
async fn test_reject_marks_executor_rejected() {
    let (service, executors, shutdown) = create_test_service("secret");
    register_pending(&executors, "e1").await;

    let response = service
        .reject_executor(Request::new(proto::ApprovalRequest {
            executor_id: "e1".to_string(),
            admin_token: "secret".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.status, "rejected");

    let ctx = CancellationToken::new();
    let record = executors.get(&ctx, "e1").await.unwrap();
    assert_eq!(record.state, proto::ExecutorState::Rejected as i32);
    shutdown.cancel();
}

#[tokio::test]
async fn test_operator_surface_requires_admin_token() {
    let (service, executors, shutdown) = create_test_service("secret");
    register_pending(&executors, "e1").await;

    let status = service
        .approve_executor(Request::new(proto::ApprovalRequest {
            executor_id: "e1".to_string(),
            admin_token: "wrong".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);

    // An unset admin token locks the surface entirely.
    let (locked, locked_executors, locked_shutdown) = create_test_service("");
    register_pending(&locked_executors, "e2").await;
    let status = locked
        .approve_executor(Request::new(proto::ApprovalRequest {
            executor_id: "e2".to_string(),
            admin_token: "".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);

    shutdown.cancel();
    locked_shutdown.cancel();
}

#[tokio::test]
async fn test_approve_unknown_executor_is_not_found() {
    let (service, _executors, shutdown) = create_test_service("secret");

    let status = service
        .approve_executor(Request::new(proto::ApprovalRequest {
            executor_id: "ghost".to_string(),
            admin_token: "secret".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
    shutdown.cancel();
}
