use std::sync::Arc;

use chrono::Utc;
use prost::Message;
use tokio_util::sync::CancellationToken;

use crate::dispatch::status::ExecutionStatus;
use crate::error::{ControllerError, Result};
use crate::proto;
use crate::repository::{store_failure, EXECUTION_PREFIX};
use crate::store::{StoreClient, StoreError};

/// Attempts before giving up a contended read-modify-write.
const CAS_ATTEMPTS: u32 = 5;

/// Sole owner of `execution/{job_k8s_name}`. Execution contexts are created
/// at dispatch, mutated by executor reports, and retained indefinitely for
/// log lookup.
#[derive(Clone)]
pub struct ExecutionRepository {
    store: Arc<dyn StoreClient>,
}

impl ExecutionRepository {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    fn key(job_k8s_name: &str) -> String {
        format!("{EXECUTION_PREFIX}{job_k8s_name}")
    }

    pub async fn save(&self, ctx: &CancellationToken, context: &proto::ExecutionContext) -> Result<()> {
        let mut record = context.clone();
        record.updated_at_ms = Utc::now().timestamp_millis();
        self.store
            .put(ctx, &Self::key(&record.job_k8s_name), record.encode_to_vec())
            .await
            .map_err(store_failure)
    }

    pub async fn get(
        &self,
        ctx: &CancellationToken,
        job_k8s_name: &str,
    ) -> Result<proto::ExecutionContext> {
        match self.store.get(ctx, &Self::key(job_k8s_name)).await {
            Ok(bytes) => Self::decode(&bytes),
            Err(StoreError::KeyNotFound) => Err(ControllerError::NotFound(format!(
                "execution: no execution named {job_k8s_name}"
            ))),
            Err(other) => Err(store_failure(other)),
        }
    }

    pub async fn get_logs(&self, ctx: &CancellationToken, job_k8s_name: &str) -> Result<String> {
        Ok(self.get(ctx, job_k8s_name).await?.output)
    }

    /// Commit a forward status transition, linearized through the store's
    /// compare-and-swap so concurrent reports for one execution serialize.
    /// Executors send cumulative logs; a non-empty `output` replaces the old
    /// text. Reports for unknown or already-terminal executions reject.
    pub async fn update_status(
        &self,
        ctx: &CancellationToken,
        job_k8s_name: &str,
        next: ExecutionStatus,
        output: Option<&str>,
    ) -> Result<proto::ExecutionContext> {
        let key = Self::key(job_k8s_name);
        for _ in 0..CAS_ATTEMPTS {
            let current_bytes = match self.store.get(ctx, &key).await {
                Ok(bytes) => bytes,
                Err(StoreError::KeyNotFound) => {
                    return Err(ControllerError::FailedPrecondition(format!(
                        "execution: invalid state report for unknown execution {job_k8s_name}"
                    )))
                }
                Err(other) => return Err(store_failure(other)),
            };
            let mut record = Self::decode(&current_bytes)?;
            let current = ExecutionStatus::from_proto(record.status).ok_or_else(|| {
                ControllerError::Internal(format!(
                    "execution: stored record for {job_k8s_name} carries unknown status {}",
                    record.status
                ))
            })?;
            if !current.can_transition_to(next) {
                return Err(ControllerError::FailedPrecondition(format!(
                    "execution: invalid state transition {current} -> {next} for {job_k8s_name}"
                )));
            }
            record.status = next.to_proto() as i32;
            if let Some(output) = output {
                if !output.is_empty() {
                    record.output = output.to_string();
                }
            }
            record.updated_at_ms = Utc::now().timestamp_millis();
            let swapped = self
                .store
                .compare_and_swap(ctx, &key, Some(&current_bytes), record.encode_to_vec())
                .await
                .map_err(store_failure)?;
            if swapped {
                return Ok(record);
            }
            // Lost the race; re-read and re-validate against the new state.
        }
        Err(ControllerError::Unavailable(format!(
            "execution: contended status update for {job_k8s_name}"
        )))
    }

    /// Force a non-terminal execution to FAILED, recording why. Used when
    /// the assigned executor is lost before it could accept.
    pub async fn mark_failed(
        &self,
        ctx: &CancellationToken,
        job_k8s_name: &str,
        reason: &str,
    ) -> Result<proto::ExecutionContext> {
        let key = Self::key(job_k8s_name);
        for _ in 0..CAS_ATTEMPTS {
            let current_bytes = match self.store.get(ctx, &key).await {
                Ok(bytes) => bytes,
                Err(StoreError::KeyNotFound) => {
                    return Err(ControllerError::NotFound(format!(
                        "execution: no execution named {job_k8s_name}"
                    )))
                }
                Err(other) => return Err(store_failure(other)),
            };
            let mut record = Self::decode(&current_bytes)?;
            let current = ExecutionStatus::from_proto(record.status);
            if matches!(current, Some(status) if status.is_terminal()) {
                return Err(ControllerError::FailedPrecondition(format!(
                    "execution: {job_k8s_name} is already terminal"
                )));
            }
            record.status = ExecutionStatus::Failed.to_proto() as i32;
            record.failure_reason = reason.to_string();
            record.updated_at_ms = Utc::now().timestamp_millis();
            let swapped = self
                .store
                .compare_and_swap(ctx, &key, Some(&current_bytes), record.encode_to_vec())
                .await
                .map_err(store_failure)?;
            if swapped {
                return Ok(record);
            }
        }
        Err(ControllerError::Unavailable(format!(
            "execution: contended failure mark for {job_k8s_name}"
        )))
    }

    /// Multiple contexts may exist for one job after crash recovery. Picks
    /// the latest non-terminal by write time, else the latest terminal.
    pub async fn find_by_job_id(
        &self,
        ctx: &CancellationToken,
        job_id: &str,
    ) -> Result<proto::ExecutionContext> {
        let pairs = self
            .store
            .range(ctx, EXECUTION_PREFIX)
            .await
            .map_err(store_failure)?;
        let mut newest_live: Option<proto::ExecutionContext> = None;
        let mut newest_done: Option<proto::ExecutionContext> = None;
        for (_, value) in pairs {
            let record = Self::decode(&value)?;
            if record.job_id != job_id {
                continue;
            }
            let terminal = ExecutionStatus::from_proto(record.status)
                .map(ExecutionStatus::is_terminal)
                .unwrap_or(true);
            let slot = if terminal {
                &mut newest_done
            } else {
                &mut newest_live
            };
            let newer = slot
                .as_ref()
                .map(|held| record.updated_at_ms >= held.updated_at_ms)
                .unwrap_or(true);
            if newer {
                *slot = Some(record);
            }
        }
        newest_live.or(newest_done).ok_or_else(|| {
            ControllerError::NotFound(format!("execution: no execution for job {job_id}"))
        })
    }

    fn decode(bytes: &[u8]) -> Result<proto::ExecutionContext> {
        proto::ExecutionContext::decode(bytes).map_err(|e| {
            ControllerError::Internal(format!("execution: failed to decode record: {e}"))
        })
    }
}
