use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::auth;
use crate::dispatch::DispatcherHandle;
use crate::proto;
use crate::proto::admin_cp_service_server::AdminCpService;
use crate::repository::ExecutorRepository;

/// Operator surface: approve or reject registered executors. Approval makes
/// an executor eligible to enrol its wait-for-job stream.
pub struct AdminService {
    executors: ExecutorRepository,
    dispatcher: DispatcherHandle,
    admin_token: String,
    shutdown: CancellationToken,
}

impl AdminService {
    pub fn new(
        executors: ExecutorRepository,
        dispatcher: DispatcherHandle,
        admin_token: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            executors,
            dispatcher,
            admin_token,
            shutdown,
        }
    }

    fn authorize(&self, presented: &str) -> Result<(), Status> {
        if !auth::is_admin(presented, &self.admin_token) {
            return Err(Status::unauthenticated("admin: admin token rejected"));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl AdminCpService for AdminService {
    async fn approve_executor(
        &self,
        request: Request<proto::ApprovalRequest>,
    ) -> Result<Response<proto::Response>, Status> {
        let req = request.into_inner();
        self.authorize(&req.admin_token)?;
        let ctx = self.shutdown.child_token();
        let record = self
            .executors
            .update_state(&ctx, &req.executor_id, proto::ExecutorState::Active)
            .await
            .map_err(Status::from)?;
        tracing::info!(executor_id = %record.id, "Executor approved");
        Ok(Response::new(proto::Response {
            status: "approved".to_string(),
        }))
    }

    async fn reject_executor(
        &self,
        request: Request<proto::ApprovalRequest>,
    ) -> Result<Response<proto::Response>, Status> {
        let req = request.into_inner();
        self.authorize(&req.admin_token)?;
        let ctx = self.shutdown.child_token();
        let record = self
            .executors
            .update_state(&ctx, &req.executor_id, proto::ExecutorState::Rejected)
            .await
            .map_err(Status::from)?;
        // A rejected executor may no longer sit in the ready queue.
        self.dispatcher.depart(&record.id).await;
        tracing::info!(executor_id = %record.id, "Executor rejected");
        Ok(Response::new(proto::Response {
            status: "rejected".to_string(),
        }))
    }
}
