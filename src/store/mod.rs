pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemStore;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Gateway-level failures. `KeyNotFound` is a sentinel for an absent key,
/// distinct from transport trouble; callers decide what absence means.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store: no value found")]
    KeyNotFound,

    #[error("store: unavailable: {0}")]
    Unavailable(String),

    #[error("store: {0}")]
    Internal(String),

    #[error("store: operation cancelled")]
    Cancelled,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub key: String,
    pub value: Vec<u8>,
    pub kind: WatchEventKind,
}

/// Thin semantic layer over a strongly-consistent ordered key/value store.
///
/// Every call accepts a cancellation token and performs no retries; retry
/// policy belongs to the caller. Implementations must keep `range` ordered
/// by key ascending and `watch` delivering every subsequent change under
/// the prefix until the token fires.
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn put(&self, ctx: &CancellationToken, key: &str, value: Vec<u8>) -> StoreResult<()>;

    async fn put_with_lease(
        &self,
        ctx: &CancellationToken,
        key: &str,
        value: Vec<u8>,
        lease_id: i64,
    ) -> StoreResult<()>;

    async fn get(&self, ctx: &CancellationToken, key: &str) -> StoreResult<Vec<u8>>;

    /// Removes all keys matching the prefix; returns the number removed.
    async fn delete_prefix(&self, ctx: &CancellationToken, prefix: &str) -> StoreResult<i64>;

    async fn range(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
    ) -> StoreResult<Vec<(String, Vec<u8>)>>;

    async fn watch(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
    ) -> StoreResult<mpsc::Receiver<WatchEvent>>;

    async fn lease_grant(&self, ctx: &CancellationToken, ttl_secs: i64) -> StoreResult<i64>;

    async fn keep_alive(&self, ctx: &CancellationToken, lease_id: i64) -> StoreResult<()>;

    /// Atomic compare-and-swap. `expected = None` means put-if-absent.
    /// Returns whether the swap was applied.
    async fn compare_and_swap(
        &self,
        ctx: &CancellationToken,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> StoreResult<bool>;
}
