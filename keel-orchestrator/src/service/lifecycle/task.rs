//! Per-job task
//!
//! Runs one job from its current phase to a terminal phase. Every wait is
//! bounded by a deadline and wakes early on cancellation.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_core::domain::NodeId;
use keel_core::domain::bid::Bid;
use keel_core::domain::job::{JobPhase, JobRecord, ReassignReason, TransitionCause};
use keel_core::domain::result::{ExecutionResult, ResultStatus, Verdict};
use keel_core::dto::node::BidRequest;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Inner, JobHandle, Signal};
use crate::error::SchedulerError;
use crate::service::reconciler::Outcome;

/// Why the task stopped
#[derive(Debug)]
pub(crate) enum Halt {
    /// The job reached a terminal phase
    Finished(JobPhase),
    /// A cancellation took over the job
    Cancelled,
    /// The store failed; the job is left where it was
    Failed(SchedulerError),
}

impl From<SchedulerError> for Halt {
    fn from(err: SchedulerError) -> Self {
        Halt::Failed(err)
    }
}

type Step<T = ()> = std::result::Result<T, Halt>;

enum Wait {
    Signal(Signal),
    Deadline,
}

pub(crate) struct JobTask {
    inner: Arc<Inner>,
    handle: Arc<JobHandle>,
    signals: mpsc::UnboundedReceiver<Signal>,
    /// Signals pulled early and replayed before reading the channel again
    backlog: VecDeque<Signal>,
    record: JobRecord,
    /// Nodes matched on admission, consumed by the first bidding round
    candidates: Option<Vec<NodeId>>,
}

impl JobTask {
    pub(crate) fn new(
        inner: Arc<Inner>,
        handle: Arc<JobHandle>,
        signals: mpsc::UnboundedReceiver<Signal>,
        record: JobRecord,
    ) -> Self {
        Self {
            inner,
            handle,
            signals,
            backlog: VecDeque::new(),
            record,
            candidates: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let job_id = self.record.id();
        let halt = self.drive().await;

        // Later sends fail, so the coordinator answers from the store instead
        self.signals.close();
        while let Ok(signal) = self.signals.try_recv() {
            self.ignore(signal);
        }

        if self.handle.is_cancelled() {
            self.finish_cancel().await;
        }

        match halt {
            Halt::Finished(phase) => info!("Job {} finished: {}", job_id, phase),
            Halt::Cancelled => debug!("Job {} task stopped by cancellation", job_id),
            Halt::Failed(err) => error!("Job {} task aborted: {}", job_id, err),
        }

        self.inner.release(job_id).await;
    }

    /// Stores the cancellation when the request that raised the flag could not
    ///
    /// Transient store failures are retried with backoff until the job is
    /// terminal.
    async fn finish_cancel(&mut self) {
        let job_id = self.record.id();
        let mut delay = self.inner.config.match_backoff_initial;

        loop {
            let applied = {
                let _gate = self.handle.write_gate.lock().await;
                self.inner.apply_cancel(job_id).await
            };

            match applied {
                Ok((record, changed)) => {
                    self.handle.phase_tx.send_replace(record.phase);
                    if changed {
                        info!("Job {} cancelled", job_id);
                        if let Some(node_id) = &record.assigned_node {
                            self.inner.signal_cancel(job_id, node_id);
                        }
                    }
                    self.record = record;
                    return;
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        "Job {}: cancellation not stored ({}), retrying in {:?}",
                        job_id, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.inner.config.match_backoff_max);
                }
                Err(err) => {
                    error!("Job {}: cancellation could not be stored: {}", job_id, err);
                    return;
                }
            }
        }
    }

    async fn drive(&mut self) -> Halt {
        loop {
            let step = match self.record.phase {
                JobPhase::Submitted => self.admit().await,
                JobPhase::Bidding => self.bid_round().await,
                JobPhase::Assigned => self.await_ack().await,
                JobPhase::Running => self.await_result().await,
                phase => return Halt::Finished(phase),
            };

            if let Err(halt) = step {
                return halt;
            }
        }
    }

    // =========================================================================
    // Phases
    // =========================================================================

    async fn admit(&mut self) -> Step {
        if self.record.spec.language.trim().is_empty() {
            return self
                .fail(SchedulerError::Validation("language is required".to_string()))
                .await;
        }

        match self.match_with_backoff().await? {
            Some(nodes) => {
                let count = nodes.len();
                self.candidates = Some(nodes);
                self.commit(JobPhase::Bidding, TransitionCause::NodesMatched { count }, |_| {})
                    .await
            }
            None => {
                self.fail(SchedulerError::NoEligibleNodes(self.record.id()))
                    .await
            }
        }
    }

    async fn bid_round(&mut self) -> Step {
        let candidates = match self.candidates.take() {
            Some(nodes) => nodes,
            None => match self.match_with_backoff().await? {
                Some(nodes) => nodes,
                None => {
                    return self
                        .fail(SchedulerError::NoEligibleNodes(self.record.id()))
                        .await;
                }
            },
        };

        let window = self.inner.config.bidding_window;
        let deadline = Instant::now() + window;
        self.request_bids(&candidates, window);

        let eligible: BTreeSet<NodeId> = candidates.into_iter().collect();
        let mut seen = HashSet::new();
        let mut bids: Vec<Bid> = Vec::new();

        let winner = loop {
            match self.next_signal(deadline).await? {
                Wait::Signal(Signal::Bid(bid)) => {
                    if !self.is_valid_bid(&bid, &eligible, &mut seen) {
                        continue;
                    }
                    bids.push(bid);
                    let now = Utc::now();
                    bids.retain(|b| !b.is_expired(now));
                    if let Some(winner) = self.select_bid(&bids, eligible.len(), false) {
                        break Some(winner);
                    }
                }
                Wait::Signal(other) => self.ignore(other),
                Wait::Deadline => {
                    let now = Utc::now();
                    bids.retain(|b| !b.is_expired(now));
                    break self.select_bid(&bids, eligible.len(), true);
                }
            }
        };

        let received: BTreeMap<NodeId, Bid> = bids
            .into_iter()
            .map(|bid| (bid.node_id.clone(), bid))
            .collect();

        let Some(winner) = winner else {
            return self.fail(SchedulerError::BidTimeout(self.record.id())).await;
        };

        let node_id = winner.node_id.clone();
        self.commit(
            JobPhase::Assigned,
            TransitionCause::BidAccepted {
                node_id: node_id.clone(),
            },
            |record| {
                // Earlier rounds stay; a node bidding again replaces its old terms
                record.bids.extend(received.clone());
                record.assigned_node = Some(node_id.clone());
            },
        )
        .await?;

        self.send_assignment(&node_id);
        Ok(())
    }

    async fn await_ack(&mut self) -> Step {
        let node_id = self.assigned_node()?;
        let deadline = Instant::now() + self.inner.config.ack_timeout;

        loop {
            match self.next_signal(deadline).await? {
                Wait::Signal(Signal::Ack(from)) if from == node_id => break,
                Wait::Signal(Signal::Result(result)) if result.node_id == node_id => {
                    // A result implies the node started
                    self.backlog.push_back(Signal::Result(result));
                    break;
                }
                Wait::Signal(other) => self.ignore(other),
                Wait::Deadline => {
                    let timeout = SchedulerError::AckTimeout {
                        job_id: self.record.id(),
                        node_id: node_id.clone(),
                    };
                    warn!("{} within {:?}", timeout, self.inner.config.ack_timeout);
                    self.inner.signal_cancel(self.record.id(), &node_id);
                    return self
                        .abandon(
                            node_id.clone(),
                            ReassignReason::AckTimeout,
                            TransitionCause::AckTimeout { node_id },
                            None,
                        )
                        .await;
                }
            }
        }

        self.commit(
            JobPhase::Running,
            TransitionCause::Acknowledged { node_id },
            |_| {},
        )
        .await
    }

    async fn await_result(&mut self) -> Step {
        let node_id = self.assigned_node()?;
        let deadline = Instant::now() + self.inner.config.result_timeout;

        let result = loop {
            match self.next_signal(deadline).await? {
                Wait::Signal(Signal::Result(result)) if result.node_id == node_id => break result,
                Wait::Signal(other) => self.ignore(other),
                Wait::Deadline => {
                    let timeout = SchedulerError::ResultTimeout {
                        job_id: self.record.id(),
                        node_id: node_id.clone(),
                    };
                    warn!("{} within {:?}", timeout, self.inner.config.result_timeout);
                    self.inner.signal_cancel(self.record.id(), &node_id);
                    break ExecutionResult::timed_out(self.record.id(), node_id.clone(), Utc::now());
                }
            }
        };

        self.reconcile(node_id, result).await
    }

    async fn reconcile(&mut self, node_id: NodeId, result: ExecutionResult) -> Step {
        let job_id = self.record.id();
        let failure_cause = failure_cause(&node_id, &result);

        match self.inner.reconciler.record(job_id, result.clone()).await {
            Outcome::Duplicate => Ok(()),
            Outcome::Verdict(verdict) => {
                let cause = match verdict {
                    Verdict::Completed => TransitionCause::ResultAccepted { node_id },
                    Verdict::Failed => failure_cause,
                };
                self.commit(verdict.phase(), cause, |record| {
                    record.results.insert(result.node_id.clone(), result.clone());
                })
                .await
            }
            Outcome::Reassign(reason) => {
                self.abandon(node_id, reason, failure_cause, Some(result))
                    .await
            }
        }
    }

    /// Excludes `node_id` and re-enters bidding, or fails the job once the
    /// reassignment budget is spent
    async fn abandon(
        &mut self,
        node_id: NodeId,
        reason: ReassignReason,
        failure: TransitionCause,
        result: Option<ExecutionResult>,
    ) -> Step {
        let exhausted = self.record.reassignments >= self.inner.config.max_reassignments;
        let apply = |record: &mut JobRecord| {
            record.excluded_nodes.insert(node_id.clone());
            record.assigned_node = None;
            if let Some(result) = &result {
                record.results.insert(result.node_id.clone(), result.clone());
            }
        };

        if exhausted {
            warn!(
                "Job {}: reassignment budget of {} spent",
                self.record.id(),
                self.inner.config.max_reassignments
            );
            return self.commit(JobPhase::Failed, failure, apply).await;
        }

        info!(
            "Job {}: reassigning away from node {} ({})",
            self.record.id(),
            node_id,
            reason
        );
        let cause = TransitionCause::Reassigned {
            node_id: node_id.clone(),
            reason,
        };
        self.commit(JobPhase::Bidding, cause, |record| {
            apply(record);
            record.reassignments += 1;
        })
        .await
    }

    // =========================================================================
    // Matching
    // =========================================================================

    /// Matches against fresh snapshots with exponential backoff; `None` once
    /// the retry ceiling is reached
    async fn match_with_backoff(&mut self) -> Step<Option<Vec<NodeId>>> {
        let config = &self.inner.config;
        let ceiling = config.match_retry_ceiling.max(1);
        let mut delay = config.match_backoff_initial;
        let max_delay = config.match_backoff_max;

        for attempt in 1..=ceiling {
            let snapshot = self.inner.feed.snapshot();
            match self
                .inner
                .matcher
                .match_nodes(&self.record.spec, &snapshot, &self.record.excluded_nodes)
            {
                Ok(nodes) => {
                    debug!(
                        "Job {}: matched {} node(s) on attempt {}",
                        self.record.id(),
                        nodes.len(),
                        attempt
                    );
                    return Ok(Some(nodes));
                }
                Err(SchedulerError::NoEligibleNodes(_)) if attempt < ceiling => {
                    warn!(
                        "Job {}: no eligible nodes (attempt {}/{}), retrying in {:?}",
                        self.record.id(),
                        attempt,
                        ceiling,
                        delay
                    );
                    self.pause(delay).await?;
                    delay = (delay * 2).min(max_delay);
                }
                Err(SchedulerError::NoEligibleNodes(_)) => break,
                Err(err) => return Err(err.into()),
            }
        }

        warn!(
            "Job {}: no eligible nodes after {} attempt(s)",
            self.record.id(),
            ceiling
        );
        Ok(None)
    }

    // =========================================================================
    // Signals and waiting
    // =========================================================================

    async fn next_signal(&mut self, deadline: Instant) -> Step<Wait> {
        if self.handle.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        if let Some(signal) = self.backlog.pop_front() {
            return Ok(Wait::Signal(signal));
        }

        tokio::select! {
            biased;
            _ = self.handle.cancel_notify.notified() => Err(Halt::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Ok(Wait::Deadline),
            signal = self.signals.recv() => match signal {
                Some(signal) => Ok(Wait::Signal(signal)),
                None => Err(Halt::Cancelled),
            },
        }
    }

    /// Sleeps without consuming signals; wakes early on cancellation
    async fn pause(&self, delay: Duration) -> Step {
        if self.handle.is_cancelled() {
            return Err(Halt::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.handle.cancel_notify.notified() => Err(Halt::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn ignore(&self, signal: Signal) {
        let job_id = self.record.id();
        match signal {
            Signal::Bid(bid) => debug!(
                "Job {}: bid from {} ignored in phase {}",
                job_id, bid.node_id, self.record.phase
            ),
            Signal::Ack(node_id) => debug!(
                "Job {}: ack from {} ignored in phase {}",
                job_id, node_id, self.record.phase
            ),
            Signal::Result(result) => debug!(
                "Job {}: result from {} ignored in phase {}",
                job_id, result.node_id, self.record.phase
            ),
        }
    }

    fn is_valid_bid(
        &self,
        bid: &Bid,
        eligible: &BTreeSet<NodeId>,
        seen: &mut HashSet<NodeId>,
    ) -> bool {
        let job_id = self.record.id();

        if bid.job_id != job_id {
            debug!("Job {}: bid for job {} dropped", job_id, bid.job_id);
            return false;
        }
        if !eligible.contains(&bid.node_id) {
            debug!("Job {}: bid from ineligible node {} dropped", job_id, bid.node_id);
            return false;
        }
        if bid.is_expired(Utc::now()) {
            debug!("Job {}: expired bid from {} dropped", job_id, bid.node_id);
            return false;
        }
        if !seen.insert(bid.node_id.clone()) {
            debug!("Job {}: repeated bid from {} dropped", job_id, bid.node_id);
            return false;
        }
        true
    }

    /// Asks the bid policy for a winner; an index outside `bids` picks none
    fn select_bid(&self, bids: &[Bid], eligible: usize, window_closed: bool) -> Option<Bid> {
        let index = self.inner.bid_policy.select(bids, eligible, window_closed)?;
        let winner = bids.get(index).cloned();
        if winner.is_none() {
            warn!(
                "Job {}: bid policy picked index {} of {} bid(s); ignored",
                self.record.id(),
                index,
                bids.len()
            );
        }
        winner
    }

    fn assigned_node(&self) -> Step<NodeId> {
        self.record.assigned_node.clone().ok_or_else(|| {
            Halt::Failed(SchedulerError::Rejected(format!(
                "job {} is {} without an assigned node",
                self.record.id(),
                self.record.phase
            )))
        })
    }

    // =========================================================================
    // Writes and node signalling
    // =========================================================================

    /// Fails the job with the cause `err` carries
    async fn fail(&mut self, err: SchedulerError) -> Step {
        let Some(cause) = err.transition_cause() else {
            return Err(Halt::Failed(err));
        };
        warn!("Job {}: {}", self.record.id(), err);
        self.commit(JobPhase::Failed, cause, |_| {}).await
    }

    /// Commits one transition under the write gate, unless the job was
    /// cancelled first
    async fn commit<F>(&mut self, to: JobPhase, cause: TransitionCause, mut apply: F) -> Step
    where
        F: FnMut(&mut JobRecord) + Send,
    {
        let job_id = self.record.id();
        let _gate = self.handle.write_gate.lock().await;
        if self.handle.is_cancelled() {
            return Err(Halt::Cancelled);
        }

        let at = self.inner.stamp();
        let record = self
            .inner
            .update(job_id, |record| {
                apply(record);
                record
                    .transition(to, cause.clone(), at)
                    .map(|_| ())
                    .map_err(|e| SchedulerError::invalid_transition(job_id, e))
            })
            .await?;

        info!(
            "Job {}: {} -> {} ({})",
            job_id, self.record.phase, record.phase, cause
        );
        self.handle.phase_tx.send_replace(record.phase);
        self.record = record;
        Ok(())
    }

    fn request_bids(&self, candidates: &[NodeId], window: Duration) {
        let snapshot = self.inner.feed.snapshot();
        let nodes: Vec<_> = candidates
            .iter()
            .filter_map(|id| snapshot.get(id).cloned())
            .collect();
        let bid_deadline = Utc::now()
            + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        let request = Arc::new(BidRequest::for_spec(&self.record.spec, bid_deadline));

        // One call per node; a slow node must not hold up the others
        for node in nodes {
            let transport = Arc::clone(&self.inner.transport);
            let request = Arc::clone(&request);

            tokio::spawn(async move {
                if let Err(e) = transport.request_bids(&node, &request).await {
                    warn!(
                        "Bid request for job {} to node {} failed: {:#}",
                        request.job_id, node.node_id, e
                    );
                }
            });
        }
    }

    fn send_assignment(&self, node_id: &str) {
        let Some(node) = self.inner.feed.snapshot().get(node_id).cloned() else {
            warn!(
                "Job {}: assigned node {} left the feed",
                self.record.id(),
                node_id
            );
            return;
        };
        let spec = self.record.spec.clone();
        let transport = Arc::clone(&self.inner.transport);

        tokio::spawn(async move {
            if let Err(e) = transport.assign(&node, &spec).await {
                warn!("Assignment of job {} to node {} failed: {:#}", spec.id, node.node_id, e);
            }
        });
    }
}

fn failure_cause(node_id: &str, result: &ExecutionResult) -> TransitionCause {
    match result.status {
        ResultStatus::Timeout => TransitionCause::ResultTimeout {
            node_id: node_id.to_string(),
        },
        ResultStatus::Failure => TransitionCause::ExecutionFailed {
            node_id: node_id.to_string(),
            message: result.message.clone(),
        },
        ResultStatus::Success => TransitionCause::ExecutionFailed {
            node_id: node_id.to_string(),
            message: Some("results did not reach quorum".to_string()),
        },
    }
}
