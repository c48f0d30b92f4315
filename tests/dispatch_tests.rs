use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use octavius::dispatch::{Dispatcher, DispatcherHandle, ExecutionStatus};
use octavius::proto;
use octavius::repository::{
    ExecutionRepository, ExecutorRepository, JobRepository, MetadataRepository,
};
use octavius::store::{MemStore, StoreClient, StoreError};

struct Harness {
    store: Arc<MemStore>,
    handle: DispatcherHandle,
    shutdown: CancellationToken,
    metadata: MetadataRepository,
    jobs: JobRepository,
    executions: ExecutionRepository,
    executors: ExecutorRepository,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_dispatcher() -> Harness {
    let store = Arc::new(MemStore::new());
    let dyn_store = store.clone() as Arc<dyn StoreClient>;
    let shutdown = CancellationToken::new();
    let (dispatcher, handle) = Dispatcher::new(dyn_store.clone(), shutdown.clone());
    tokio::spawn(dispatcher.run());

    Harness {
        store,
        handle,
        shutdown,
        metadata: MetadataRepository::new(dyn_store.clone()),
        jobs: JobRepository::new(dyn_store.clone()),
        executions: ExecutionRepository::new(dyn_store.clone()),
        executors: ExecutorRepository::new(dyn_store),
    }
}

impl Harness {
    async fn register_metadata(&self, job_name: &str) {
        let ctx = CancellationToken::new();
        let metadata = proto::Metadata {
            name: job_name.to_string(),
            description: "test job".to_string(),
            image_name: format!("images/{job_name}"),
            env_vars: Some(proto::EnvVars {
                args: vec![proto::Arg {
                    name: "X".to_string(),
                    description: "test arg".to_string(),
                    required: true,
                }],
            }),
        };
        self.metadata.save(&ctx, &metadata).await.unwrap();
    }

    /// Save an ACTIVE executor with a fresh ping and enrol a slot for it.
    async fn enrol_live_executor(&self, executor_id: &str) -> mpsc::Receiver<proto::Job> {
        let ctx = CancellationToken::new();
        self.executors
            .save(
                &ctx,
                &proto::ExecutorInfo {
                    id: executor_id.to_string(),
                    host: "10.0.0.1:9090".to_string(),
                    state: proto::ExecutorState::Active as i32,
                },
            )
            .await
            .unwrap();
        self.executors.ping(&ctx, executor_id, 30).await.unwrap();

        let (slot_tx, slot_rx) = mpsc::channel(1);
        self.handle
            .enrol(executor_id.to_string(), slot_tx)
            .await
            .unwrap();
        slot_rx
    }

    async fn submit(&self, job_id: u64, job_name: &str) {
        let ctx = CancellationToken::new();
        let request = proto::RequestToExecute {
            client_info: None,
            job_name: job_name.to_string(),
            job_data: HashMap::from([("X".to_string(), "1".to_string())]),
        };
        self.jobs.save(&ctx, job_id, &request).await.unwrap();
    }

    async fn executions_snapshot(&self) -> Vec<proto::ExecutionContext> {
        let ctx = CancellationToken::new();
        let mut contexts = Vec::new();
        for (key, _) in self.store.range(&ctx, "execution/").await.unwrap() {
            let name = key.strip_prefix("execution/").unwrap();
            contexts.push(self.executions.get(&ctx, name).await.unwrap());
        }
        contexts
    }
}

async fn recv_job(rx: &mut mpsc::Receiver<proto::Job>) -> proto::Job {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for assignment")
        .expect("slot closed without assignment")
}

/// Scenario: submit then dispatch. One ACTIVE executor with an open stream
/// receives the job; the pending key is gone and a CREATED execution exists.
#[tokio::test]
async fn test_submit_then_dispatch() {
    let harness = start_dispatcher().await;
    harness.register_metadata("J").await;
    let mut slot = harness.enrol_live_executor("E").await;

    harness.submit(7, "J").await;

    let job = recv_job(&mut slot).await;
    assert!(job.has_job);
    assert_eq!(job.job_id, "7");
    assert_eq!(job.image_name, "images/J");
    assert_eq!(job.job_data.get("X").map(String::as_str), Some("1"));

    let ctx = CancellationToken::new();
    let gone = harness.store.get(&ctx, "jobs/pending/7").await.unwrap_err();
    assert!(matches!(gone, StoreError::KeyNotFound));

    let contexts = harness.executions_snapshot().await;
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].job_id, "7");
    assert_eq!(contexts[0].executor_id, "E");
    assert_eq!(contexts[0].status, ExecutionStatus::Created.to_proto() as i32);
}

/// Jobs already pending when the dispatcher starts are found on startup
/// and handed to the first executor that enrols.
#[tokio::test]
async fn test_pending_job_survives_restart() {
    let store = Arc::new(MemStore::new());
    let dyn_store = store.clone() as Arc<dyn StoreClient>;
    let ctx = CancellationToken::new();

    let metadata_repo = MetadataRepository::new(dyn_store.clone());
    metadata_repo
        .save(
            &ctx,
            &proto::Metadata {
                name: "J".to_string(),
                description: String::new(),
                image_name: "images/J".to_string(),
                env_vars: None,
            },
        )
        .await
        .unwrap();
    JobRepository::new(dyn_store.clone())
        .save(
            &ctx,
            4242,
            &proto::RequestToExecute {
                client_info: None,
                job_name: "J".to_string(),
                job_data: HashMap::new(),
            },
        )
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let (dispatcher, handle) = Dispatcher::new(dyn_store.clone(), shutdown.clone());
    tokio::spawn(dispatcher.run());

    let executors = ExecutorRepository::new(dyn_store);
    executors
        .save(
            &ctx,
            &proto::ExecutorInfo {
                id: "E".to_string(),
                host: "10.0.0.1:9090".to_string(),
                state: proto::ExecutorState::Active as i32,
            },
        )
        .await
        .unwrap();
    executors.ping(&ctx, "E", 30).await.unwrap();

    let (slot_tx, mut slot_rx) = mpsc::channel(1);
    handle.enrol("E".to_string(), slot_tx).await.unwrap();

    let job = recv_job(&mut slot_rx).await;
    assert_eq!(job.job_id, "4242");
    shutdown.cancel();
}

/// Fair dispatch: executors receive jobs in enrolment order, jobs leave in
/// key-ascending (submission) order.
#[tokio::test]
async fn test_fifo_rendezvous_on_both_queues() {
    let harness = start_dispatcher().await;
    harness.register_metadata("J").await;

    let mut first_slot = harness.enrol_live_executor("E1").await;
    let mut second_slot = harness.enrol_live_executor("E2").await;

    harness.submit(101, "J").await;
    harness.submit(102, "J").await;

    let first = recv_job(&mut first_slot).await;
    let second = recv_job(&mut second_slot).await;
    assert_eq!(first.job_id, "101");
    assert_eq!(second.job_id, "102");
}

/// Liveness gating: an executor whose ping lease expired is never chosen;
/// the job goes to the next live one.
#[tokio::test]
async fn test_stale_executor_is_skipped() {
    let harness = start_dispatcher().await;
    harness.register_metadata("J").await;

    let mut dead_slot = harness.enrol_live_executor("dead").await;
    let dead_lease = harness.store.last_lease_id();
    let mut live_slot = harness.enrol_live_executor("live").await;
    harness.store.expire_lease(dead_lease);

    harness.submit(303, "J").await;

    let job = recv_job(&mut live_slot).await;
    assert_eq!(job.job_id, "303");
    assert!(dead_slot.try_recv().is_err());

    let contexts = harness.executions_snapshot().await;
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].executor_id, "live");
}

/// Scenario: executor lost before accept. The stream closes before the
/// handoff lands; the execution flips to FAILED with reason executor_lost
/// and the job returns to the pending queue under the same id.
#[tokio::test]
async fn test_executor_lost_before_accept() {
    let harness = start_dispatcher().await;
    harness.register_metadata("J").await;

    let slot = harness.enrol_live_executor("E").await;
    drop(slot);

    harness.submit(505, "J").await;

    // Give the dispatcher a round to fail the handoff and re-insert.
    let ctx = CancellationToken::new();
    let mut reinserted = false;
    for _ in 0..40 {
        if harness.store.get(&ctx, "jobs/pending/505").await.is_ok()
            && !harness.executions_snapshot().await.is_empty()
        {
            reinserted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(reinserted, "pending job was not re-inserted");

    let contexts = harness.executions_snapshot().await;
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].status, ExecutionStatus::Failed.to_proto() as i32);
    assert_eq!(contexts[0].failure_reason, "executor_lost");
    assert_eq!(contexts[0].job_id, "505");
}

/// An executor that departs (stream torn down before assignment) no longer
/// receives jobs; the job waits for the next enrolment.
#[tokio::test]
async fn test_departed_executor_is_removed_from_queue() {
    let harness = start_dispatcher().await;
    harness.register_metadata("J").await;

    let _early_slot = harness.enrol_live_executor("early").await;
    harness.handle.depart("early").await;

    harness.submit(606, "J").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Still pending: the only enrolled executor departed.
    let ctx = CancellationToken::new();
    assert!(harness.store.get(&ctx, "jobs/pending/606").await.is_ok());

    let mut late_slot = harness.enrol_live_executor("late").await;
    let job = recv_job(&mut late_slot).await;
    assert_eq!(job.job_id, "606");
}
