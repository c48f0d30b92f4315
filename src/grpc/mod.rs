pub mod admin_service;
pub mod client_service;
pub mod executor_service;
pub mod server;

pub use server::GrpcServer;
