use thiserror::Error;
use tonic::Status;

/// Control-plane error taxonomy, mapped 1:1 onto transport status codes at
/// the service boundary. Messages carry a prefix naming the originating
/// component ("store: ", "dispatcher: ", ...).
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    Cancelled(String),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

impl From<ControllerError> for Status {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::NotFound(msg) => Status::not_found(msg),
            ControllerError::AlreadyExists(msg) => Status::already_exists(msg),
            ControllerError::FailedPrecondition(msg) => Status::failed_precondition(msg),
            ControllerError::Unauthenticated(msg) => Status::unauthenticated(msg),
            ControllerError::PermissionDenied(msg) => Status::permission_denied(msg),
            ControllerError::Unavailable(msg) => Status::unavailable(msg),
            ControllerError::Internal(msg) => Status::internal(msg),
            ControllerError::Cancelled(msg) => Status::cancelled(msg),
        }
    }
}
