use std::sync::Arc;

use chrono::Utc;
use prost::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{ControllerError, Result};
use crate::proto;
use crate::repository::{store_failure, EXECUTOR_PREFIX};
use crate::store::{StoreClient, StoreError};

/// Typed view over `executor/{id}/info` and the leased liveness key
/// `executor/{id}/ping`. The record survives restarts; the ping expires
/// with its lease when the executor goes quiet.
#[derive(Clone)]
pub struct ExecutorRepository {
    store: Arc<dyn StoreClient>,
}

impl ExecutorRepository {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    fn info_key(executor_id: &str) -> String {
        format!("{EXECUTOR_PREFIX}{executor_id}/info")
    }

    fn ping_key(executor_id: &str) -> String {
        format!("{EXECUTOR_PREFIX}{executor_id}/ping")
    }

    pub async fn save(&self, ctx: &CancellationToken, record: &proto::ExecutorInfo) -> Result<()> {
        self.store
            .put(ctx, &Self::info_key(&record.id), record.encode_to_vec())
            .await
            .map_err(store_failure)
    }

    pub async fn get(
        &self,
        ctx: &CancellationToken,
        executor_id: &str,
    ) -> Result<proto::ExecutorInfo> {
        match self.store.get(ctx, &Self::info_key(executor_id)).await {
            Ok(bytes) => proto::ExecutorInfo::decode(bytes.as_slice()).map_err(|e| {
                ControllerError::Internal(format!("executor: failed to decode record: {e}"))
            }),
            Err(StoreError::KeyNotFound) => Err(ControllerError::NotFound(format!(
                "executor: executor {executor_id} not registered"
            ))),
            Err(other) => Err(store_failure(other)),
        }
    }

    pub async fn update_state(
        &self,
        ctx: &CancellationToken,
        executor_id: &str,
        state: proto::ExecutorState,
    ) -> Result<proto::ExecutorInfo> {
        let mut record = self.get(ctx, executor_id).await?;
        record.state = state as i32;
        self.save(ctx, &record).await?;
        Ok(record)
    }

    /// Refresh liveness under a fresh lease; the key vanishes when the
    /// executor stops pinging for the TTL.
    pub async fn ping(
        &self,
        ctx: &CancellationToken,
        executor_id: &str,
        ttl_secs: i64,
    ) -> Result<()> {
        let lease_id = self
            .store
            .lease_grant(ctx, ttl_secs)
            .await
            .map_err(store_failure)?;
        let stamp = Utc::now().timestamp_millis().to_string().into_bytes();
        self.store
            .put_with_lease(ctx, &Self::ping_key(executor_id), stamp, lease_id)
            .await
            .map_err(store_failure)
    }

    /// Whether the liveness key is still present. Never true on error.
    pub async fn is_alive(&self, ctx: &CancellationToken, executor_id: &str) -> Result<bool> {
        match self.store.get(ctx, &Self::ping_key(executor_id)).await {
            Ok(_) => Ok(true),
            Err(StoreError::KeyNotFound) => Ok(false),
            Err(other) => Err(store_failure(other)),
        }
    }

    /// Every registered executor whose record is ACTIVE, in id order.
    pub async fn list_active(&self, ctx: &CancellationToken) -> Result<Vec<proto::ExecutorInfo>> {
        let pairs = self
            .store
            .range(ctx, EXECUTOR_PREFIX)
            .await
            .map_err(store_failure)?;
        let mut active = Vec::new();
        for (key, value) in pairs {
            if !key.ends_with("/info") {
                continue;
            }
            let record = proto::ExecutorInfo::decode(value.as_slice()).map_err(|e| {
                ControllerError::Internal(format!("executor: failed to decode record: {e}"))
            })?;
            if record.state == proto::ExecutorState::Active as i32 {
                active.push(record);
            }
        }
        Ok(active)
    }
}
