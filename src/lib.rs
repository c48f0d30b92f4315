pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod grpc;
pub mod idgen;
pub mod node;
pub mod repository;
pub mod shutdown;
pub mod store;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("octavius");
}
