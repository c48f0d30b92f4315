use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::auth::{AccessTokenVerifier, StaticTokenVerifier};
use crate::config::ControllerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{ControllerError, Result};
use crate::grpc::admin_service::AdminService;
use crate::grpc::client_service::ClientService;
use crate::grpc::executor_service::ExecutorService;
use crate::grpc::GrpcServer;
use crate::idgen::JobIdGenerator;
use crate::repository::{
    ExecutionRepository, ExecutorRepository, JobRepository, MetadataRepository,
};
use crate::store::{EtcdStore, StoreClient};

/// The control-plane process: a store gateway, the repositories over it,
/// the dispatch serializer, and the gRPC façade.
pub struct Controller {
    config: ControllerConfig,
    store: Arc<dyn StoreClient>,
    verifier: Arc<dyn AccessTokenVerifier>,
}

impl Controller {
    /// Connect to the store. A store that cannot be reached here is fatal;
    /// the process host maps it to exit code 2.
    pub async fn bootstrap(config: ControllerConfig) -> Result<Self> {
        let store = EtcdStore::connect(&config.store_endpoints, config.store_connect_timeout)
            .await
            .map_err(|e| ControllerError::Unavailable(e.to_string()))?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Assemble the controller over any gateway implementation. Tests pass
    /// a `MemStore`.
    pub fn with_store(config: ControllerConfig, store: Arc<dyn StoreClient>) -> Self {
        Self {
            config,
            store,
            verifier: Arc::new(StaticTokenVerifier),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn AccessTokenVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Run all subsystems. The dispatcher runs as a spawned task; this
    /// method blocks on the gRPC server until shutdown fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let metadata = MetadataRepository::new(self.store.clone());
        let jobs = JobRepository::new(self.store.clone());
        let executions = ExecutionRepository::new(self.store.clone());
        let executors = ExecutorRepository::new(self.store.clone());
        let id_generator = Arc::new(JobIdGenerator::new());

        match executors.list_active(&shutdown).await {
            Ok(active) => {
                tracing::info!(count = active.len(), "Active executors known at startup")
            }
            Err(e) => tracing::warn!(error = %e, "Could not list active executors at startup"),
        }

        let (dispatcher, handle) = Dispatcher::new(self.store.clone(), shutdown.clone());
        tokio::spawn(dispatcher.run());

        let client_service = ClientService::new(
            metadata,
            jobs,
            executions.clone(),
            id_generator,
            self.verifier.clone(),
            self.config.request_deadline,
            shutdown.clone(),
        );
        let executor_service = ExecutorService::new(
            executors.clone(),
            executions,
            handle.clone(),
            self.verifier.clone(),
            self.config.ping_ttl_secs,
            shutdown.clone(),
        );
        let admin_service = AdminService::new(
            executors,
            handle,
            self.config.admin_token.clone(),
            shutdown.clone(),
        );

        let server = GrpcServer::new(
            self.config.listen_addr,
            client_service,
            executor_service,
            admin_service,
        );
        server
            .run(shutdown)
            .await
            .map_err(|e| ControllerError::Internal(format!("server: {e}")))
    }
}
