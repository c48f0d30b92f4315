use std::sync::Arc;

use prost::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{ControllerError, Result};
use crate::proto;
use crate::repository::{store_failure, METADATA_PREFIX};
use crate::store::{StoreClient, StoreError};

/// Typed view over `metadata/{job_name}`. Metadata is mutated only by
/// replacement and never deleted by the control plane.
#[derive(Clone)]
pub struct MetadataRepository {
    store: Arc<dyn StoreClient>,
}

impl MetadataRepository {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    fn key(name: &str) -> String {
        format!("{METADATA_PREFIX}{name}")
    }

    pub async fn save(&self, ctx: &CancellationToken, metadata: &proto::Metadata) -> Result<()> {
        let value = metadata.encode_to_vec();
        self.store
            .put(ctx, &Self::key(&metadata.name), value)
            .await
            .map_err(store_failure)
    }

    pub async fn get(&self, ctx: &CancellationToken, name: &str) -> Result<proto::Metadata> {
        match self.store.get(ctx, &Self::key(name)).await {
            Ok(bytes) => proto::Metadata::decode(bytes.as_slice()).map_err(|e| {
                ControllerError::Internal(format!("metadata: failed to decode record: {e}"))
            }),
            Err(StoreError::KeyNotFound) => Err(ControllerError::NotFound(format!(
                "metadata: job with {name} name not found"
            ))),
            Err(other) => Err(store_failure(other)),
        }
    }

    /// Registered job names in key-ascending order.
    pub async fn list(&self, ctx: &CancellationToken) -> Result<Vec<String>> {
        let pairs = self
            .store
            .range(ctx, METADATA_PREFIX)
            .await
            .map_err(store_failure)?;
        Ok(pairs
            .into_iter()
            .filter_map(|(key, _)| key.strip_prefix(METADATA_PREFIX).map(str::to_string))
            .collect())
    }
}
