use std::collections::HashSet;
use std::sync::Arc;

use prost::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{ControllerError, Result};
use crate::proto;
use crate::repository::{store_failure, METADATA_PREFIX, PENDING_JOB_PREFIX};
use crate::store::{StoreClient, StoreError};

/// Typed view over `jobs/pending/{job_id}` plus the metadata checks a
/// submission must pass before it is persisted.
#[derive(Clone)]
pub struct JobRepository {
    store: Arc<dyn StoreClient>,
}

impl JobRepository {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    fn pending_key(job_id: u64) -> String {
        format!("{PENDING_JOB_PREFIX}{job_id}")
    }

    /// Persist a submission under its freshly generated id. Put-if-absent:
    /// a colliding id is a bug in id generation and is surfaced, except for
    /// dispatcher re-inserts which tolerate `AlreadyExists`.
    pub async fn save(
        &self,
        ctx: &CancellationToken,
        job_id: u64,
        request: &proto::RequestToExecute,
    ) -> Result<()> {
        let value = request.encode_to_vec();
        let created = self
            .store
            .compare_and_swap(ctx, &Self::pending_key(job_id), None, value)
            .await
            .map_err(store_failure)?;
        if !created {
            return Err(ControllerError::AlreadyExists(format!(
                "job: pending job {job_id} already exists"
            )));
        }
        Ok(())
    }

    /// Whether metadata is registered for `job_name`. Absence maps to
    /// `false`; every other failure is internal. Never true on error.
    pub async fn check_available(&self, ctx: &CancellationToken, job_name: &str) -> Result<bool> {
        match self
            .store
            .get(ctx, &format!("{METADATA_PREFIX}{job_name}"))
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::KeyNotFound) => Ok(false),
            Err(other) => Err(ControllerError::Internal(other.to_string())),
        }
    }

    /// Validate job data against registered metadata: every required arg
    /// must be present, and no key may fall outside the declared set.
    /// `Ok(false)` is a validation verdict; `Err` is a store or decode
    /// failure.
    pub async fn validate(
        &self,
        ctx: &CancellationToken,
        request: &proto::RequestToExecute,
    ) -> Result<bool> {
        let bytes = match self
            .store
            .get(ctx, &format!("{METADATA_PREFIX}{}", request.job_name))
            .await
        {
            Ok(bytes) => bytes,
            Err(StoreError::KeyNotFound) => {
                return Err(ControllerError::NotFound(format!(
                    "job: job with {} name not found",
                    request.job_name
                )))
            }
            Err(other) => return Err(store_failure(other)),
        };
        let metadata = proto::Metadata::decode(bytes.as_slice()).map_err(|e| {
            ControllerError::Internal(format!("job: failed to decode metadata record: {e}"))
        })?;

        let args = metadata.env_vars.map(|vars| vars.args).unwrap_or_default();
        for arg in &args {
            if arg.required && !request.job_data.contains_key(&arg.name) {
                return Ok(false);
            }
        }
        let declared: HashSet<&str> = args.iter().map(|arg| arg.name.as_str()).collect();
        for key in request.job_data.keys() {
            if !declared.contains(key.as_str()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// First pending entry in key-ascending order, which under monotonic ids
    /// is submission order. The id is the key suffix after the last '/'.
    pub async fn fetch_next(
        &self,
        ctx: &CancellationToken,
    ) -> Result<(u64, proto::RequestToExecute)> {
        let pairs = self
            .store
            .range(ctx, PENDING_JOB_PREFIX)
            .await
            .map_err(store_failure)?;
        let Some((key, value)) = pairs.into_iter().next() else {
            return Err(ControllerError::NotFound(
                "dispatcher: no pending job".to_string(),
            ));
        };
        let suffix = key.rsplit('/').next().unwrap_or_default();
        let job_id = suffix.parse::<u64>().map_err(|_| {
            ControllerError::Internal(format!("job: malformed pending key {key}"))
        })?;
        let request = proto::RequestToExecute::decode(value.as_slice()).map_err(|e| {
            ControllerError::Internal(format!("job: failed to decode pending record: {e}"))
        })?;
        Ok((job_id, request))
    }

    pub async fn delete(&self, ctx: &CancellationToken, job_id: u64) -> Result<()> {
        self.store
            .delete_prefix(ctx, &Self::pending_key(job_id))
            .await
            .map_err(store_failure)?;
        Ok(())
    }
}
