use std::future::Future;
use std::time::Duration;

use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions, PutOptions,
    SortOrder, SortTarget, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::{StoreClient, StoreError, StoreResult, WatchEvent, WatchEventKind};

/// Store gateway backed by etcd. The client handle is cheap to clone; each
/// call works on its own clone so the gateway stays shareable behind `Arc`.
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String], connect_timeout: Duration) -> StoreResult<Self> {
        let options = ConnectOptions::new().with_connect_timeout(connect_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { client })
    }

    fn classify(err: etcd_client::Error) -> StoreError {
        match err {
            etcd_client::Error::GRpcStatus(status)
                if status.code() == tonic::Code::Unavailable =>
            {
                StoreError::Unavailable(status.message().to_string())
            }
            other => StoreError::Internal(other.to_string()),
        }
    }
}

async fn with_cancel<T, F>(ctx: &CancellationToken, fut: F) -> StoreResult<T>
where
    F: Future<Output = Result<T, etcd_client::Error>>,
{
    tokio::select! {
        _ = ctx.cancelled() => Err(StoreError::Cancelled),
        result = fut => result.map_err(EtcdStore::classify),
    }
}

#[async_trait::async_trait]
impl StoreClient for EtcdStore {
    async fn put(&self, ctx: &CancellationToken, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut client = self.client.clone();
        with_cancel(ctx, async move { client.put(key, value, None).await })
            .await
            .map(|_| ())
    }

    async fn put_with_lease(
        &self,
        ctx: &CancellationToken,
        key: &str,
        value: Vec<u8>,
        lease_id: i64,
    ) -> StoreResult<()> {
        let mut client = self.client.clone();
        let options = PutOptions::new().with_lease(lease_id);
        with_cancel(ctx, async move { client.put(key, value, Some(options)).await })
            .await
            .map(|_| ())
    }

    async fn get(&self, ctx: &CancellationToken, key: &str) -> StoreResult<Vec<u8>> {
        let mut client = self.client.clone();
        let resp = with_cancel(ctx, async move { client.get(key, None).await }).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(kv.value().to_vec()),
            None => Err(StoreError::KeyNotFound),
        }
    }

    async fn delete_prefix(&self, ctx: &CancellationToken, prefix: &str) -> StoreResult<i64> {
        let mut client = self.client.clone();
        let options = DeleteOptions::new().with_prefix();
        let resp =
            with_cancel(ctx, async move { client.delete(prefix, Some(options)).await }).await?;
        Ok(resp.deleted())
    }

    async fn range(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
    ) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut client = self.client.clone();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let resp = with_cancel(ctx, async move { client.get(prefix, Some(options)).await }).await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).into_owned(),
                    kv.value().to_vec(),
                )
            })
            .collect())
    }

    async fn watch(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
    ) -> StoreResult<mpsc::Receiver<WatchEvent>> {
        let mut client = self.client.clone();
        let options = WatchOptions::new().with_prefix();
        let (mut watcher, mut stream) =
            with_cancel(ctx, async move { client.watch(prefix, Some(options)).await }).await?;

        let (tx, rx) = mpsc::channel(64);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            'pump: loop {
                tokio::select! {
                    _ = ctx.cancelled() => break 'pump,
                    msg = stream.message() => {
                        let resp = match msg {
                            Ok(Some(resp)) => resp,
                            Ok(None) => break 'pump,
                            Err(e) => {
                                tracing::warn!(error = %e, "Store watch stream failed");
                                break 'pump;
                            }
                        };
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let kind = match event.event_type() {
                                EventType::Put => WatchEventKind::Put,
                                EventType::Delete => WatchEventKind::Delete,
                            };
                            let forwarded = tx
                                .send(WatchEvent {
                                    key: String::from_utf8_lossy(kv.key()).into_owned(),
                                    value: kv.value().to_vec(),
                                    kind,
                                })
                                .await;
                            if forwarded.is_err() {
                                break 'pump;
                            }
                        }
                    }
                }
            }
            let _ = watcher.cancel().await;
        });

        Ok(rx)
    }

    async fn lease_grant(&self, ctx: &CancellationToken, ttl_secs: i64) -> StoreResult<i64> {
        let mut client = self.client.clone();
        let resp = with_cancel(ctx, async move { client.lease_grant(ttl_secs, None).await }).await?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, ctx: &CancellationToken, lease_id: i64) -> StoreResult<()> {
        let mut client = self.client.clone();
        with_cancel(ctx, async move {
            let (mut keeper, _stream) = client.lease_keep_alive(lease_id).await?;
            keeper.keep_alive().await
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        ctx: &CancellationToken,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> StoreResult<bool> {
        let mut client = self.client.clone();
        let compare = match expected {
            Some(value) => Compare::value(key, CompareOp::Equal, value.to_vec()),
            // Version 0 means the key does not exist yet.
            None => Compare::version(key, CompareOp::Equal, 0),
        };
        let txn = Txn::new()
            .when(vec![compare])
            .and_then(vec![TxnOp::put(key, new, None)]);
        let resp = with_cancel(ctx, async move { client.txn(txn).await }).await?;
        Ok(resp.succeeded())
    }
}
