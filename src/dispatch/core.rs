use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::status::ExecutionStatus;
use crate::error::{ControllerError, Result};
use crate::idgen::generate_k8s_name;
use crate::proto;
use crate::repository::{
    ExecutionRepository, ExecutorRepository, JobRepository, MetadataRepository, PENDING_JOB_PREFIX,
};
use crate::store::{StoreClient, WatchEventKind};

const FETCH_RETRY_BASE: Duration = Duration::from_millis(50);
const FETCH_RETRY_CAP: Duration = Duration::from_secs(1);
const FETCH_RETRY_ATTEMPTS: u32 = 5;

/// An executor with an open `wait_for_job` stream, waiting for exactly one
/// assignment. The slot is the server side of a bounded channel pair whose
/// other half feeds the stream.
pub struct ReadyExecutor {
    pub executor_id: String,
    pub slot: mpsc::Sender<proto::Job>,
}

enum DispatcherMessage {
    Enrol(ReadyExecutor),
    Depart { executor_id: String },
    Nudge,
}

/// Handle through which request tasks reach the serializer.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<DispatcherMessage>,
}

impl DispatcherHandle {
    pub async fn enrol(&self, executor_id: String, slot: mpsc::Sender<proto::Job>) -> Result<()> {
        self.send(DispatcherMessage::Enrol(ReadyExecutor { executor_id, slot }))
            .await
    }

    pub async fn depart(&self, executor_id: &str) {
        let _ = self
            .send(DispatcherMessage::Depart {
                executor_id: executor_id.to_string(),
            })
            .await;
    }

    async fn send(&self, message: DispatcherMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| ControllerError::Unavailable("dispatcher: not running".to_string()))
    }
}

/// The rendezvous serializer: one task owning the ready-executor queue and
/// the pending-job notifier, matching exactly one pending job to exactly
/// one ready executor per round. All mutation of the queue happens inside
/// this task; the rest of the server talks to it through the handle.
pub struct Dispatcher {
    store: Arc<dyn StoreClient>,
    metadata: MetadataRepository,
    jobs: JobRepository,
    executions: ExecutionRepository,
    executors: ExecutorRepository,
    ready: VecDeque<ReadyExecutor>,
    rx: mpsc::Receiver<DispatcherMessage>,
    tx: mpsc::Sender<DispatcherMessage>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StoreClient>,
        shutdown: CancellationToken,
    ) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::channel(64);
        let dispatcher = Self {
            metadata: MetadataRepository::new(store.clone()),
            jobs: JobRepository::new(store.clone()),
            executions: ExecutionRepository::new(store.clone()),
            executors: ExecutorRepository::new(store.clone()),
            store,
            ready: VecDeque::new(),
            rx,
            tx: tx.clone(),
            shutdown,
        };
        (dispatcher, DispatcherHandle { tx })
    }

    pub async fn run(mut self) {
        self.start_pending_watch().await;

        // Startup: jobs may already be waiting from a previous life.
        match self.jobs.fetch_next(&self.shutdown).await {
            Ok((job_id, _)) => {
                tracing::info!(job_id, "Pending jobs found at startup");
                let _ = self.tx.send(DispatcherMessage::Nudge).await;
            }
            Err(ControllerError::NotFound(_)) => {}
            Err(e) => tracing::warn!(error = %e, "Startup scan of pending jobs failed"),
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Dispatcher shutting down");
                    break;
                }
                message = self.rx.recv() => {
                    let Some(message) = message else { break };
                    self.handle(message).await;
                }
            }
        }
    }

    /// The pending-job notifier: every PUT under `jobs/pending/` becomes a
    /// nudge, covering both fresh submissions and crash-recovery re-inserts.
    async fn start_pending_watch(&self) {
        match self.store.watch(&self.shutdown, PENDING_JOB_PREFIX).await {
            Ok(mut events) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if event.kind == WatchEventKind::Put
                            && tx.send(DispatcherMessage::Nudge).await.is_err()
                        {
                            break;
                        }
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to watch pending jobs; dispatch will only run on executor arrival");
            }
        }
    }

    async fn handle(&mut self, message: DispatcherMessage) {
        match message {
            DispatcherMessage::Enrol(executor) => {
                tracing::debug!(executor_id = %executor.executor_id, "Executor ready");
                self.ready.push_back(executor);
                self.try_dispatch().await;
            }
            DispatcherMessage::Depart { executor_id } => {
                self.ready.retain(|e| e.executor_id != executor_id);
            }
            DispatcherMessage::Nudge => {
                self.try_dispatch().await;
            }
        }
    }

    /// Drain as many (job, executor) pairs as both queues allow.
    async fn try_dispatch(&mut self) {
        loop {
            if self.ready.is_empty() {
                return;
            }
            let (job_id, request) = match self.fetch_next_with_backoff().await {
                Ok(next) => next,
                Err(ControllerError::NotFound(_)) => return,
                Err(e) => {
                    tracing::error!(error = %e, "Fetching next pending job failed");
                    return;
                }
            };
            let Some(executor) = self.pop_live_executor().await else {
                // No live executor; the job stays pending.
                return;
            };
            if let Err(e) = self.assign(job_id, &request, &executor).await {
                tracing::error!(
                    job_id,
                    executor_id = %executor.executor_id,
                    error = %e,
                    "Dispatch round failed"
                );
                return;
            }
        }
    }

    /// Pop the head of the ready queue, discarding executors that have gone
    /// stale since enrolment: liveness key expired, or record no longer
    /// ACTIVE. A discarded executor re-enrols by reopening its stream.
    async fn pop_live_executor(&mut self) -> Option<ReadyExecutor> {
        while let Some(executor) = self.ready.pop_front() {
            let alive = match self
                .executors
                .is_alive(&self.shutdown, &executor.executor_id)
                .await
            {
                Ok(alive) => alive,
                Err(e) => {
                    tracing::warn!(executor_id = %executor.executor_id, error = %e, "Liveness check failed");
                    false
                }
            };
            if !alive {
                tracing::info!(executor_id = %executor.executor_id, "Dropping executor without fresh ping");
                continue;
            }
            let active = match self
                .executors
                .get(&self.shutdown, &executor.executor_id)
                .await
            {
                Ok(record) => record.state == proto::ExecutorState::Active as i32,
                Err(_) => false,
            };
            if !active {
                tracing::info!(executor_id = %executor.executor_id, "Dropping executor no longer ACTIVE");
                continue;
            }
            return Some(executor);
        }
        None
    }

    /// One rendezvous: persist the execution, delete the pending key (in
    /// that order, so a crash leaves the job re-dispatchable), hand the Job
    /// over the executor's slot.
    async fn assign(
        &mut self,
        job_id: u64,
        request: &proto::RequestToExecute,
        executor: &ReadyExecutor,
    ) -> Result<()> {
        let ctx = &self.shutdown;
        let metadata = self.metadata.get(ctx, &request.job_name).await?;
        let job_k8s_name = generate_k8s_name();
        let context = proto::ExecutionContext {
            job_k8s_name: job_k8s_name.clone(),
            job_id: job_id.to_string(),
            image_name: metadata.image_name.clone(),
            executor_id: executor.executor_id.clone(),
            status: ExecutionStatus::Created.to_proto() as i32,
            env_args: request.job_data.clone(),
            output: String::new(),
            updated_at_ms: 0,
            failure_reason: String::new(),
        };

        self.executions.save(ctx, &context).await?;
        self.jobs.delete(ctx, job_id).await?;

        let job = proto::Job {
            has_job: true,
            job_id: job_id.to_string(),
            image_name: metadata.image_name,
            job_data: request.job_data.clone(),
            job_k8s_name: job_k8s_name.clone(),
        };
        if executor.slot.try_send(job).is_err() {
            // The stream is gone; undo the handoff. The execution flips to
            // FAILED and the job returns to the queue under the same id.
            tracing::warn!(
                job_id,
                executor_id = %executor.executor_id,
                "Executor lost before handoff"
            );
            self.executions
                .mark_failed(ctx, &job_k8s_name, "executor_lost")
                .await?;
            match self.jobs.save(ctx, job_id, request).await {
                Ok(()) | Err(ControllerError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
            return Ok(());
        }

        tracing::info!(
            job_id,
            executor_id = %executor.executor_id,
            job_k8s_name = %job_k8s_name,
            "Job dispatched"
        );
        Ok(())
    }

    /// `fetch_next` with capped exponential backoff on transient store
    /// failure; every other error propagates untouched.
    async fn fetch_next_with_backoff(&self) -> Result<(u64, proto::RequestToExecute)> {
        let mut delay = FETCH_RETRY_BASE;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.jobs.fetch_next(&self.shutdown).await {
                Err(ControllerError::Unavailable(reason)) if attempt < FETCH_RETRY_ATTEMPTS => {
                    tracing::warn!(attempt, reason = %reason, "Store unavailable, backing off");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(FETCH_RETRY_CAP);
                }
                other => return other,
            }
        }
    }
}
