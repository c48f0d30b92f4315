use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::store::{StoreClient, StoreError, StoreResult, WatchEvent, WatchEventKind};

/// In-memory store honoring the gateway contract: ordered keys, prefix
/// scans, watches, leases with expiry, and compare-and-swap. Tests run the
/// whole control plane against this instead of a live etcd.
pub struct MemStore {
    inner: Mutex<Inner>,
    watch_tx: broadcast::Sender<WatchEvent>,
    next_lease: AtomicI64,
}

struct Inner {
    data: BTreeMap<String, Vec<u8>>,
    key_leases: HashMap<String, i64>,
    lease_expiry: HashMap<i64, Instant>,
    lease_ttl: HashMap<i64, Duration>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        let (watch_tx, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner {
                data: BTreeMap::new(),
                key_leases: HashMap::new(),
                lease_expiry: HashMap::new(),
                lease_ttl: HashMap::new(),
            }),
            watch_tx,
            next_lease: AtomicI64::new(1),
        }
    }

    /// Test hook: force a lease to expire immediately, dropping its keys.
    pub fn expire_lease(&self, lease_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.lease_expiry.remove(&lease_id);
        inner.lease_ttl.remove(&lease_id);
        let dropped: Vec<String> = inner
            .key_leases
            .iter()
            .filter(|(_, lease)| **lease == lease_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in dropped {
            inner.key_leases.remove(&key);
            inner.data.remove(&key);
            let _ = self.watch_tx.send(WatchEvent {
                key,
                value: Vec::new(),
                kind: WatchEventKind::Delete,
            });
        }
    }

    /// Test hook: most recently granted lease id, if any.
    pub fn last_lease_id(&self) -> i64 {
        self.next_lease.load(Ordering::SeqCst) - 1
    }

    fn purge_expired(&self, inner: &mut Inner) {
        let now = Instant::now();
        let expired: Vec<i64> = inner
            .lease_expiry
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease_id in expired {
            inner.lease_expiry.remove(&lease_id);
            inner.lease_ttl.remove(&lease_id);
            let dropped: Vec<String> = inner
                .key_leases
                .iter()
                .filter(|(_, lease)| **lease == lease_id)
                .map(|(key, _)| key.clone())
                .collect();
            for key in dropped {
                inner.key_leases.remove(&key);
                inner.data.remove(&key);
                let _ = self.watch_tx.send(WatchEvent {
                    key,
                    value: Vec::new(),
                    kind: WatchEventKind::Delete,
                });
            }
        }
    }

    fn check_cancelled(ctx: &CancellationToken) -> StoreResult<()> {
        if ctx.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoreClient for MemStore {
    async fn put(&self, ctx: &CancellationToken, key: &str, value: Vec<u8>) -> StoreResult<()> {
        Self::check_cancelled(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        inner.data.insert(key.to_string(), value.clone());
        inner.key_leases.remove(key);
        let _ = self.watch_tx.send(WatchEvent {
            key: key.to_string(),
            value,
            kind: WatchEventKind::Put,
        });
        Ok(())
    }

    async fn put_with_lease(
        &self,
        ctx: &CancellationToken,
        key: &str,
        value: Vec<u8>,
        lease_id: i64,
    ) -> StoreResult<()> {
        Self::check_cancelled(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        if !inner.lease_expiry.contains_key(&lease_id) {
            return Err(StoreError::Internal(format!("lease {lease_id} not found")));
        }
        inner.data.insert(key.to_string(), value.clone());
        inner.key_leases.insert(key.to_string(), lease_id);
        let _ = self.watch_tx.send(WatchEvent {
            key: key.to_string(),
            value,
            kind: WatchEventKind::Put,
        });
        Ok(())
    }

    async fn get(&self, ctx: &CancellationToken, key: &str) -> StoreResult<Vec<u8>> {
        Self::check_cancelled(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        inner.data.get(key).cloned().ok_or(StoreError::KeyNotFound)
    }

    async fn delete_prefix(&self, ctx: &CancellationToken, prefix: &str) -> StoreResult<i64> {
        Self::check_cancelled(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        let doomed: Vec<String> = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        let count = doomed.len() as i64;
        for key in doomed {
            inner.data.remove(&key);
            inner.key_leases.remove(&key);
            let _ = self.watch_tx.send(WatchEvent {
                key,
                value: Vec::new(),
                kind: WatchEventKind::Delete,
            });
        }
        Ok(count)
    }

    async fn range(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
    ) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Self::check_cancelled(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn watch(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
    ) -> StoreResult<mpsc::Receiver<WatchEvent>> {
        Self::check_cancelled(ctx)?;
        let mut events = self.watch_tx.subscribe();
        let (tx, rx) = mpsc::channel(64);
        let prefix = prefix.to_string();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) if event.key.starts_with(&prefix) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn lease_grant(&self, ctx: &CancellationToken, ttl_secs: i64) -> StoreResult<i64> {
        Self::check_cancelled(ctx)?;
        let lease_id = self.next_lease.fetch_add(1, Ordering::SeqCst);
        let ttl = Duration::from_secs(ttl_secs.max(0) as u64);
        let mut inner = self.inner.lock().unwrap();
        inner.lease_expiry.insert(lease_id, Instant::now() + ttl);
        inner.lease_ttl.insert(lease_id, ttl);
        Ok(lease_id)
    }

    async fn keep_alive(&self, ctx: &CancellationToken, lease_id: i64) -> StoreResult<()> {
        Self::check_cancelled(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        let Some(ttl) = inner.lease_ttl.get(&lease_id).copied() else {
            return Err(StoreError::Internal(format!("lease {lease_id} not found")));
        };
        inner.lease_expiry.insert(lease_id, Instant::now() + ttl);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        ctx: &CancellationToken,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> StoreResult<bool> {
        Self::check_cancelled(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        let matches = match (inner.data.get(key), expected) {
            (Some(current), Some(expected)) => current.as_slice() == expected,
            (None, None) => true,
            _ => false,
        };
        if !matches {
            return Ok(false);
        }
        inner.data.insert(key.to_string(), new.clone());
        let _ = self.watch_tx.send(WatchEvent {
            key: key.to_string(),
            value: new,
            kind: WatchEventKind::Put,
        });
        Ok(true)
    }
}
