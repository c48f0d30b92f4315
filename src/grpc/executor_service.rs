use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::auth::AccessTokenVerifier;
use crate::dispatch::{DispatcherHandle, ExecutionStatus};
use crate::error::ControllerError;
use crate::proto;
use crate::proto::executor_cp_service_server::ExecutorCpService;
use crate::repository::{ExecutionRepository, ExecutorRepository};

/// gRPC service for the executor-facing API: registration, the long-lived
/// wait-for-job stream, status reports, health pings.
pub struct ExecutorService {
    executors: ExecutorRepository,
    executions: ExecutionRepository,
    dispatcher: DispatcherHandle,
    verifier: Arc<dyn AccessTokenVerifier>,
    ping_ttl_secs: i64,
    shutdown: CancellationToken,
}

impl ExecutorService {
    pub fn new(
        executors: ExecutorRepository,
        executions: ExecutionRepository,
        dispatcher: DispatcherHandle,
        verifier: Arc<dyn AccessTokenVerifier>,
        ping_ttl_secs: i64,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            executors,
            executions,
            dispatcher,
            verifier,
            ping_ttl_secs,
            shutdown,
        }
    }
}

#[tonic::async_trait]
impl ExecutorCpService for ExecutorService {
    /// Idempotent by executor id: re-registration refreshes the host and
    /// preserves the approval state; first contact starts PENDING_APPROVAL.
    async fn register(
        &self,
        request: Request<proto::RegisterRequest>,
    ) -> Result<Response<proto::RegisterResponse>, Status> {
        let req = request.into_inner();
        let Some(info) = req.executor_info else {
            return Err(Status::invalid_argument("executor: missing executor info"));
        };
        if info.id.trim().is_empty() {
            return Err(Status::invalid_argument("executor: executor id is empty"));
        }
        if !self.verifier.verify(&info.id, &req.access_token) {
            return Err(Status::unauthenticated("executor: access token rejected"));
        }

        let ctx = self.shutdown.child_token();
        let record = match self.executors.get(&ctx, &info.id).await {
            Ok(mut existing) => {
                existing.host = info.host;
                existing
            }
            Err(ControllerError::NotFound(_)) => proto::ExecutorInfo {
                id: info.id,
                host: info.host,
                state: proto::ExecutorState::PendingApproval as i32,
            },
            Err(other) => return Err(other.into()),
        };
        self.executors.save(&ctx, &record).await.map_err(Status::from)?;
        tracing::info!(executor_id = %record.id, host = %record.host, state = record.state, "Executor registered");
        Ok(Response::new(proto::RegisterResponse {
            registered: true,
            state: record.state,
        }))
    }

    type WaitForJobStream = ReceiverStream<Result<proto::Job, Status>>;

    /// Enrols the executor in the ready queue and yields exactly one Job
    /// per successful assignment, then closes. Reconnecting joins the tail.
    async fn wait_for_job(
        &self,
        request: Request<proto::ExecutorId>,
    ) -> Result<Response<Self::WaitForJobStream>, Status> {
        let executor_id = request.into_inner().id;
        let ctx = self.shutdown.child_token();
        let record = self
            .executors
            .get(&ctx, &executor_id)
            .await
            .map_err(Status::from)?;
        if record.state != proto::ExecutorState::Active as i32 {
            return Err(Status::permission_denied(format!(
                "executor: {executor_id} is not approved for dispatch"
            )));
        }

        let (slot_tx, mut slot_rx) = mpsc::channel::<proto::Job>(1);
        self.dispatcher
            .enrol(executor_id.clone(), slot_tx)
            .await
            .map_err(Status::from)?;

        let (stream_tx, stream_rx) = mpsc::channel::<Result<proto::Job, Status>>(1);
        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                job = slot_rx.recv() => {
                    if let Some(job) = job {
                        if stream_tx.send(Ok(job)).await.is_err() {
                            tracing::warn!(executor_id = %executor_id, "Executor stream closed during handoff");
                        }
                    }
                }
                _ = stream_tx.closed() => {
                    // Client went away before an assignment.
                    dispatcher.depart(&executor_id).await;
                }
                _ = shutdown.cancelled() => {
                    dispatcher.depart(&executor_id).await;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(stream_rx)))
    }

    /// Commits a forward state transition and stores the cumulative log
    /// output. A report for an execution assigned to a different executor
    /// marks that execution FAILED (duplicate from crash recovery).
    async fn update_status(
        &self,
        request: Request<proto::ExecutionContext>,
    ) -> Result<Response<proto::Response>, Status> {
        let report = request.into_inner();
        let Some(next) = ExecutionStatus::from_proto(report.status) else {
            return Err(Status::invalid_argument(
                "executor: unspecified execution status",
            ));
        };
        let ctx = self.shutdown.child_token();

        let stored = match self.executions.get(&ctx, &report.job_k8s_name).await {
            Ok(stored) => stored,
            Err(ControllerError::NotFound(_)) => {
                return Err(Status::failed_precondition(format!(
                    "execution: invalid state report for unknown execution {}",
                    report.job_k8s_name
                )))
            }
            Err(other) => return Err(other.into()),
        };
        if stored.executor_id != report.executor_id {
            let _ = self
                .executions
                .mark_failed(&ctx, &report.job_k8s_name, "duplicate_execution")
                .await;
            return Err(Status::failed_precondition(format!(
                "execution: {} is assigned to executor {}",
                report.job_k8s_name, stored.executor_id
            )));
        }

        let output = (!report.output.is_empty()).then_some(report.output.as_str());
        let updated = self
            .executions
            .update_status(&ctx, &report.job_k8s_name, next, output)
            .await
            .map_err(Status::from)?;
        tracing::info!(
            job_k8s_name = %updated.job_k8s_name,
            job_id = %updated.job_id,
            status = %next,
            "Execution status updated"
        );
        Ok(Response::new(proto::Response {
            status: next.to_string(),
        }))
    }

    /// Refreshes the leased liveness key. Executors ping well inside the
    /// TTL; going quiet for the full TTL removes them from dispatch.
    async fn send_health_ping(
        &self,
        request: Request<proto::Status>,
    ) -> Result<Response<proto::Response>, Status> {
        let ping = request.into_inner();
        if ping.id.trim().is_empty() {
            return Err(Status::invalid_argument("executor: executor id is empty"));
        }
        let ctx = self.shutdown.child_token();
        // Only registered executors may ping.
        self.executors
            .get(&ctx, &ping.id)
            .await
            .map_err(Status::from)?;
        self.executors
            .ping(&ctx, &ping.id, self.ping_ttl_secs)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(proto::Response {
            status: "pong".to_string(),
        }))
    }
}
