use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::auth::AccessTokenVerifier;
use crate::error::{ControllerError, Result};
use crate::idgen::JobIdGenerator;
use crate::proto;
use crate::proto::client_cp_service_server::ClientCpService;
use crate::repository::{ExecutionRepository, JobRepository, MetadataRepository};

/// gRPC service for the client-facing API: register job metadata, submit
/// executions, list jobs, fetch logs.
pub struct ClientService {
    metadata: MetadataRepository,
    jobs: JobRepository,
    executions: ExecutionRepository,
    id_generator: Arc<JobIdGenerator>,
    verifier: Arc<dyn AccessTokenVerifier>,
    request_deadline: Duration,
    shutdown: CancellationToken,
}

impl ClientService {
    pub fn new(
        metadata: MetadataRepository,
        jobs: JobRepository,
        executions: ExecutionRepository,
        id_generator: Arc<JobIdGenerator>,
        verifier: Arc<dyn AccessTokenVerifier>,
        request_deadline: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            metadata,
            jobs,
            executions,
            id_generator,
            verifier,
            request_deadline,
            shutdown,
        }
    }

    /// Run a single-shot handler under the configured deadline with a
    /// request-scoped cancellation token.
    async fn deadline<T, F>(&self, fut: F) -> std::result::Result<T, Status>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.request_deadline, fut).await {
            Ok(result) => result.map_err(Status::from),
            Err(_) => Err(Status::cancelled("client: request deadline exceeded")),
        }
    }

    async fn handle_execute(
        &self,
        ctx: &CancellationToken,
        request: &proto::RequestToExecute,
    ) -> Result<u64> {
        let client = request.client_info.clone().unwrap_or_default();
        if !self.verifier.verify(&client.client_email, &client.access_token) {
            return Err(ControllerError::Unauthenticated(
                "client: access token rejected".to_string(),
            ));
        }
        if !self.jobs.check_available(ctx, &request.job_name).await? {
            return Err(ControllerError::NotFound(format!(
                "client: job with {} name not found",
                request.job_name
            )));
        }
        if !self.jobs.validate(ctx, request).await? {
            return Err(ControllerError::FailedPrecondition(format!(
                "client: invalid job data for job {}",
                request.job_name
            )));
        }
        let job_id = self.id_generator.next_id();
        self.jobs.save(ctx, job_id, request).await?;
        tracing::info!(job_id, job_name = %request.job_name, "Job queued");
        Ok(job_id)
    }
}

#[tonic::async_trait]
impl ClientCpService for ClientService {
    async fn post_metadata(
        &self,
        request: Request<proto::Metadata>,
    ) -> std::result::Result<Response<proto::Response>, Status> {
        let metadata = request.into_inner();
        if metadata.name.trim().is_empty() {
            return Err(Status::invalid_argument("client: metadata name is empty"));
        }
        if metadata.image_name.trim().is_empty() {
            return Err(Status::invalid_argument(
                "client: metadata image name is empty",
            ));
        }

        let ctx = self.shutdown.child_token();
        self.deadline(self.metadata.save(&ctx, &metadata)).await?;
        tracing::info!(job_name = %metadata.name, image = %metadata.image_name, "Metadata registered");
        Ok(Response::new(proto::Response {
            status: metadata.name,
        }))
    }

    async fn execute_job(
        &self,
        request: Request<proto::RequestToExecute>,
    ) -> std::result::Result<Response<proto::Response>, Status> {
        let req = request.into_inner();
        let ctx = self.shutdown.child_token();
        let job_id = self.deadline(self.handle_execute(&ctx, &req)).await?;
        Ok(Response::new(proto::Response {
            status: job_id.to_string(),
        }))
    }

    async fn get_job_list(
        &self,
        _request: Request<proto::JobListRequest>,
    ) -> std::result::Result<Response<proto::JobList>, Status> {
        let ctx = self.shutdown.child_token();
        let jobs = self.deadline(self.metadata.list(&ctx)).await?;
        Ok(Response::new(proto::JobList { jobs }))
    }

    /// The name is resolved first as a `job_k8s_name`; failing that, as a
    /// job id, picking the latest execution for that job.
    async fn get_logs(
        &self,
        request: Request<proto::LogRequest>,
    ) -> std::result::Result<Response<proto::Log>, Status> {
        let req = request.into_inner();
        let ctx = self.shutdown.child_token();
        let log = self
            .deadline(async {
                match self.executions.get_logs(&ctx, &req.name).await {
                    Ok(log) => Ok(log),
                    Err(ControllerError::NotFound(_)) => {
                        let context = self.executions.find_by_job_id(&ctx, &req.name).await?;
                        Ok(context.output)
                    }
                    Err(other) => Err(other),
                }
            })
            .await?;
        Ok(Response::new(proto::Log { log }))
    }
}
