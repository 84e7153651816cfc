//! Lifecycle coordination
//!
//! Drives every job through its state machine. Each active job gets its own
//! task plus a handle through which bids, acknowledgements, results and
//! cancellation reach that task. Unrelated jobs never contend on a shared
//! lock; writes for one job are serialized by its write gate.
//!
//! Cancellation sets the job's flag before taking the write gate, and the
//! task checks the flag under the gate before every commit, so a cancel
//! that arrives before a competing transition is committed always wins.
//! A task that stops on the flag stores the cancellation itself if the
//! request that raised it did not get that far.

mod policy;
mod task;

pub use policy::{BidPolicy, FirstValidBid, LowestCostBid};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, SubsecRound, Utc};
use keel_core::domain::bid::Bid;
use keel_core::domain::job::{JobPhase, JobRecord, TransitionCause};
use keel_core::domain::result::ExecutionResult;
use keel_core::domain::{JobId, NodeId};
use keel_core::dto::job::SubmitJob;
use keel_core::dto::node::CancelExecution;
use tokio::sync::{Mutex, Notify, RwLock, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{Result, SchedulerError};
use crate::repository::{InMemoryJobStore, JobFilter, JobPages, JobStore};
use crate::service::feed::{CapabilityFeed, InMemoryCapabilityFeed};
use crate::service::matcher::{CapacityRanker, Matcher, NodeRanker};
use crate::service::reconciler::{ReconcilePolicy, ResultReconciler, policy_for_quorum};
use crate::service::transport::{LoggingTransport, NodeTransport};

use task::JobTask;

/// Writes retried after an optimistic-concurrency conflict
const MAX_WRITE_ATTEMPTS: u32 = 8;

/// Messages routed from the API to a job's task
#[derive(Debug, Clone)]
pub(crate) enum Signal {
    Bid(Bid),
    Ack(NodeId),
    Result(ExecutionResult),
}

/// Per-job handle shared between the coordinator and the job's task
pub(crate) struct JobHandle {
    signals: mpsc::UnboundedSender<Signal>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
    write_gate: Mutex<()>,
    phase_tx: watch::Sender<JobPhase>,
}

impl JobHandle {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The task will not read further signals
    fn is_winding_down(&self) -> bool {
        self.is_cancelled() || self.phase_tx.borrow().is_terminal() || self.signals.is_closed()
    }

    fn request_cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_one();
    }
}

pub(crate) struct Inner {
    pub(crate) config: OrchestratorConfig,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) feed: Arc<dyn CapabilityFeed>,
    pub(crate) matcher: Matcher,
    pub(crate) transport: Arc<dyn NodeTransport>,
    pub(crate) reconciler: ResultReconciler,
    pub(crate) bid_policy: Arc<dyn BidPolicy>,
    jobs: RwLock<HashMap<JobId, Arc<JobHandle>>>,
    last_stamp: StdMutex<DateTime<Utc>>,
}

impl Inner {
    /// Strictly increasing wall-clock timestamp at microsecond precision
    pub(crate) fn stamp(&self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let mut last = match self.last_stamp.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let next = if now > *last {
            now
        } else {
            *last + chrono::Duration::microseconds(1)
        };
        *last = next;
        next
    }

    /// Re-reads the record, applies `apply` and writes it back, retrying on
    /// write conflicts
    pub(crate) async fn update<F>(&self, job_id: JobId, mut apply: F) -> Result<JobRecord>
    where
        F: FnMut(&mut JobRecord) -> Result<()> + Send,
    {
        let mut attempt = 1;
        loop {
            let mut record = self.store.get(job_id).await?;
            apply(&mut record)?;

            match self.store.put(record).await {
                Ok(stored) => return Ok(stored),
                Err(err @ SchedulerError::StoreWriteConflict { .. }) if attempt < MAX_WRITE_ATTEMPTS => {
                    warn!("Job {}: {} (attempt {}), retrying", job_id, err, attempt);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Moves the job to `Cancelled` unless it is already terminal. Returns
    /// the stored record and whether it changed. The caller holds the
    /// job's write gate when the job is driven.
    pub(crate) async fn apply_cancel(&self, job_id: JobId) -> Result<(JobRecord, bool)> {
        let current = self.store.get(job_id).await?;
        if current.is_terminal() {
            return Ok((current, false));
        }

        let at = self.stamp();
        let record = self
            .update(job_id, |record| {
                record
                    .transition(JobPhase::Cancelled, TransitionCause::CancelRequested, at)
                    .map(|_| ())
                    .map_err(|e| SchedulerError::invalid_transition(job_id, e))
            })
            .await?;

        Ok((record, true))
    }

    async fn handle(&self, job_id: JobId) -> Option<Arc<JobHandle>> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    pub(crate) async fn release(&self, job_id: JobId) {
        self.jobs.write().await.remove(&job_id);
        self.reconciler.forget(job_id).await;
    }

    /// Best-effort stop signal to a node; spawned, never awaited
    pub(crate) fn signal_cancel(&self, job_id: JobId, node_id: &str) {
        let Some(node) = self.feed.snapshot().get(node_id).cloned() else {
            debug!("Job {}: node {} unknown, no cancel sent", job_id, node_id);
            return;
        };
        let transport = Arc::clone(&self.transport);

        tokio::spawn(async move {
            if let Err(e) = transport.cancel(&node, &CancelExecution { job_id }).await {
                warn!("Cancel for job {} to node {} failed: {:#}", job_id, node.node_id, e);
            }
        });
    }
}

/// Owns every active job's lifecycle
#[derive(Clone)]
pub struct LifecycleCoordinator {
    inner: Arc<Inner>,
}

impl LifecycleCoordinator {
    pub fn builder(config: OrchestratorConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.inner.store)
    }

    /// Admits a job and starts driving it
    ///
    /// A spec without exactly one of command / program path is rejected
    /// with `Validation` and never stored.
    pub async fn submit(&self, request: SubmitJob) -> Result<JobRecord> {
        let spec = request.into_spec(Uuid::new_v4())?;
        let record = JobRecord::new(spec, self.inner.stamp());
        let record = self.inner.store.put(record).await?;

        info!(
            "Job {} submitted ({} {})",
            record.id(),
            record.spec.language,
            record.spec.language_version.as_deref().unwrap_or("any version")
        );

        self.spawn(record.clone()).await;
        Ok(record)
    }

    /// Cancels a job; idempotent, terminal jobs are returned unchanged
    ///
    /// If the store write fails while the job is driven, the error is
    /// returned and the job's task stores the cancellation once it stops.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobRecord> {
        let handle = self.inner.handle(job_id).await;
        if let Some(handle) = &handle {
            handle.request_cancel();
        }
        let _gate = match &handle {
            Some(handle) => Some(handle.write_gate.lock().await),
            None => None,
        };

        let (record, changed) = self.inner.apply_cancel(job_id).await?;
        if let Some(handle) = &handle {
            handle.phase_tx.send_replace(record.phase);
        }
        if !changed {
            debug!("Job {} already {}, cancel ignored", job_id, record.phase);
            return Ok(record);
        }

        info!("Job {} cancelled", job_id);
        if let Some(node_id) = &record.assigned_node {
            self.inner.signal_cancel(job_id, node_id);
        }

        Ok(record)
    }

    /// Routes a node's bid to the job
    pub async fn deliver_bid(&self, job_id: JobId, bid: Bid) -> Result<()> {
        if bid.job_id != job_id {
            return Err(SchedulerError::Rejected(format!(
                "bid is for job {}, not {}",
                bid.job_id, job_id
            )));
        }
        if bid.is_expired(Utc::now()) {
            return Err(SchedulerError::Rejected(format!(
                "bid from {} already expired",
                bid.node_id
            )));
        }

        let node_id = bid.node_id.clone();
        self.route(job_id, &node_id, Signal::Bid(bid)).await
    }

    /// Routes a start-of-execution acknowledgement to the job
    pub async fn acknowledge(&self, job_id: JobId, node_id: NodeId) -> Result<()> {
        let node = node_id.clone();
        self.route(job_id, &node, Signal::Ack(node_id)).await
    }

    /// Routes an execution result to the job
    pub async fn deliver_result(&self, job_id: JobId, result: ExecutionResult) -> Result<()> {
        if result.job_id != job_id {
            return Err(SchedulerError::Rejected(format!(
                "result is for job {}, not {}",
                result.job_id, job_id
            )));
        }

        let node_id = result.node_id.clone();
        self.route(job_id, &node_id, Signal::Result(result)).await
    }

    /// Watches a job's phase; the channel closes once the job is released
    pub async fn subscribe(&self, job_id: JobId) -> Result<watch::Receiver<JobPhase>> {
        if let Some(handle) = self.inner.handle(job_id).await {
            return Ok(handle.phase_tx.subscribe());
        }

        let record = self.inner.store.get(job_id).await?;
        let (_tx, rx) = watch::channel(record.phase);
        Ok(rx)
    }

    /// Waits until the job is terminal (or no longer driven) and returns it
    pub async fn await_terminal(&self, job_id: JobId) -> Result<JobRecord> {
        let mut rx = self.subscribe(job_id).await?;
        loop {
            if rx.borrow_and_update().is_terminal() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.inner.store.get(job_id).await
    }

    /// Number of jobs currently driven by a task
    pub async fn active_jobs(&self) -> usize {
        self.inner.jobs.read().await.len()
    }

    /// Restarts tasks for stored jobs that are not terminal
    ///
    /// Used at start-up with a durable store.
    pub async fn recover(&self) -> Result<usize> {
        let mut pages = JobPages::new(
            self.store(),
            JobFilter::default(),
            self.inner.config.default_page_size,
        );
        let mut resumed = 0;

        while let Some(page) = pages.next_page().await? {
            for record in page.into_iter().filter(|r| !r.is_terminal()) {
                if self.inner.handle(record.id()).await.is_some() {
                    continue;
                }
                info!("Resuming job {} in phase {}", record.id(), record.phase);
                self.spawn(record).await;
                resumed += 1;
            }
        }

        Ok(resumed)
    }

    async fn spawn(&self, record: JobRecord) {
        let job_id = record.id();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (phase_tx, _) = watch::channel(record.phase);

        let handle = Arc::new(JobHandle {
            signals: signals_tx,
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            write_gate: Mutex::new(()),
            phase_tx,
        });

        self.inner.reconciler.restore(job_id, &record.results).await;
        self.inner
            .jobs
            .write()
            .await
            .insert(job_id, Arc::clone(&handle));

        let task = JobTask::new(Arc::clone(&self.inner), handle, signals_rx, record);
        tokio::spawn(task.run());
    }

    async fn route(&self, job_id: JobId, node_id: &str, signal: Signal) -> Result<()> {
        if let Some(handle) = self.inner.handle(job_id).await {
            debug!("Job {}: {} from {}", job_id, signal_kind(&signal), node_id);
            // A task that is finishing no longer reads its channel; answer
            // from the store instead
            if handle.signals.send(signal).is_ok() && !handle.is_winding_down() {
                return Ok(());
            }
        }

        let record = self.inner.store.get(job_id).await?;
        if record.results.contains_key(node_id) {
            debug!("Job {}: repeated delivery from {} ignored", job_id, node_id);
            return Ok(());
        }
        if record.is_terminal() {
            return Err(SchedulerError::Terminal {
                job_id,
                phase: record.phase,
            });
        }

        Err(SchedulerError::Rejected(format!(
            "job {} is not accepting node messages",
            job_id
        )))
    }
}

fn signal_kind(signal: &Signal) -> &'static str {
    match signal {
        Signal::Bid(_) => "bid",
        Signal::Ack(_) => "ack",
        Signal::Result(_) => "result",
    }
}

/// Assembles a coordinator; every collaborator has a default
pub struct CoordinatorBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn JobStore>>,
    feed: Option<Arc<dyn CapabilityFeed>>,
    transport: Option<Arc<dyn NodeTransport>>,
    ranker: Option<Arc<dyn NodeRanker>>,
    bid_policy: Option<Arc<dyn BidPolicy>>,
    reconcile_policy: Option<Arc<dyn ReconcilePolicy>>,
}

impl CoordinatorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            feed: None,
            transport: None,
            ranker: None,
            bid_policy: None,
            reconcile_policy: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_feed(mut self, feed: Arc<dyn CapabilityFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn NodeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_ranker(mut self, ranker: Arc<dyn NodeRanker>) -> Self {
        self.ranker = Some(ranker);
        self
    }

    pub fn with_bid_policy(mut self, policy: Arc<dyn BidPolicy>) -> Self {
        self.bid_policy = Some(policy);
        self
    }

    pub fn with_reconcile_policy(mut self, policy: Arc<dyn ReconcilePolicy>) -> Self {
        self.reconcile_policy = Some(policy);
        self
    }

    pub fn build(self) -> LifecycleCoordinator {
        let reconcile_policy = self
            .reconcile_policy
            .unwrap_or_else(|| policy_for_quorum(self.config.quorum));
        let reconciler = ResultReconciler::new(reconcile_policy, self.config.result_retry_budget);

        let inner = Inner {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryJobStore::new())),
            feed: self
                .feed
                .unwrap_or_else(|| Arc::new(InMemoryCapabilityFeed::new())),
            matcher: Matcher::new(self.ranker.unwrap_or_else(|| Arc::new(CapacityRanker))),
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(LoggingTransport)),
            reconciler,
            bid_policy: self.bid_policy.unwrap_or_else(|| Arc::new(FirstValidBid)),
            jobs: RwLock::new(HashMap::new()),
            last_stamp: StdMutex::new(DateTime::<Utc>::MIN_UTC),
            config: self.config,
        };

        LifecycleCoordinator {
            inner: Arc::new(inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamps_strictly_increase_at_micro_precision() {
        let coordinator = LifecycleCoordinator::builder(OrchestratorConfig::new()).build();

        let stamps: Vec<_> = (0..1000).map(|_| coordinator.inner.stamp()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        assert!(stamps.iter().all(|s| s.timestamp_subsec_nanos() % 1000 == 0));
    }

    #[tokio::test]
    async fn test_invalid_spec_is_never_stored() {
        let coordinator = LifecycleCoordinator::builder(OrchestratorConfig::new()).build();
        let request = SubmitJob {
            language: "python".into(),
            ..Default::default()
        };

        let err = coordinator.submit(request).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));

        let listed = coordinator
            .store()
            .list(&JobFilter::default(), None, 10)
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let coordinator = LifecycleCoordinator::builder(OrchestratorConfig::new()).build();
        let id = Uuid::new_v4();

        assert!(matches!(coordinator.cancel(id).await, Err(SchedulerError::NotFound(_))));
        assert!(matches!(
            coordinator.acknowledge(id, "a".into()).await,
            Err(SchedulerError::NotFound(_))
        ));
        assert!(matches!(coordinator.subscribe(id).await, Err(SchedulerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_signal_to_finishing_task_is_answered_from_store() {
        let coordinator = LifecycleCoordinator::builder(OrchestratorConfig::new()).build();
        let spec = SubmitJob::program("python", "run.py")
            .into_spec(Uuid::new_v4())
            .unwrap();
        let mut record = JobRecord::new(spec, Utc::now());
        record
            .transition(JobPhase::Failed, TransitionCause::NoEligibleNodes, Utc::now())
            .unwrap();
        let job_id = coordinator.store().put(record).await.unwrap().id();

        // Task committed its last transition but has not released the handle
        let (signals, _unread) = mpsc::unbounded_channel();
        let (phase_tx, _) = watch::channel(JobPhase::Failed);
        coordinator.inner.jobs.write().await.insert(
            job_id,
            Arc::new(JobHandle {
                signals,
                cancelled: AtomicBool::new(false),
                cancel_notify: Notify::new(),
                write_gate: Mutex::new(()),
                phase_tx,
            }),
        );

        let err = coordinator
            .acknowledge(job_id, "node-a".into())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Terminal {
                phase: JobPhase::Failed,
                ..
            }
        ));
    }
}
