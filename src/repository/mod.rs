pub mod execution;
pub mod executor;
pub mod job;
pub mod metadata;

pub use execution::ExecutionRepository;
pub use executor::ExecutorRepository;
pub use job::JobRepository;
pub use metadata::MetadataRepository;

use crate::error::ControllerError;
use crate::store::StoreError;

pub const METADATA_PREFIX: &str = "metadata/";
pub const PENDING_JOB_PREFIX: &str = "jobs/pending/";
pub const EXECUTION_PREFIX: &str = "execution/";
pub const EXECUTOR_PREFIX: &str = "executor/";

/// Classify a gateway failure that the call site did not expect to be a
/// missing key. Repositories never retry; they surface.
pub(crate) fn store_failure(err: StoreError) -> ControllerError {
    let message = err.to_string();
    match err {
        StoreError::Unavailable(_) => ControllerError::Unavailable(message),
        StoreError::Cancelled => ControllerError::Cancelled(message),
        _ => ControllerError::Internal(message),
    }
}
