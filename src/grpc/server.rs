use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::admin_service::AdminService;
use crate::grpc::client_service::ClientService;
use crate::grpc::executor_service::ExecutorService;
use crate::proto::admin_cp_service_server::AdminCpServiceServer;
use crate::proto::client_cp_service_server::ClientCpServiceServer;
use crate::proto::executor_cp_service_server::ExecutorCpServiceServer;

pub struct GrpcServer {
    addr: SocketAddr,
    client_service: ClientService,
    executor_service: ExecutorService,
    admin_service: AdminService,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        client_service: ClientService,
        executor_service: ExecutorService,
        admin_service: AdminService,
    ) -> Self {
        Self {
            addr,
            client_service,
            executor_service,
            admin_service,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(ClientCpServiceServer::new(self.client_service))
            .add_service(ExecutorCpServiceServer::new(self.executor_service))
            .add_service(AdminCpServiceServer::new(self.admin_service))
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await
    }
}
