//! In-memory job store
//!
//! Used by tests and when no database is configured. A single `RwLock`
//! guards the maps; every critical section is a short map operation.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::domain::JobId;
use keel_core::domain::job::{AuditEntry, JobRecord};
use tokio::sync::RwLock;

use super::{JobFilter, JobStore, ListCursor, appended_event, check_revision};
use crate::error::{Result, SchedulerError};

#[derive(Default)]
struct State {
    records: HashMap<JobId, JobRecord>,
    /// Listing order: (submission time, job id)
    order: BTreeSet<(DateTime<Utc>, JobId)>,
    audit: HashMap<JobId, Vec<AuditEntry>>,
    next_seq: u64,
}

#[derive(Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs
    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn put(&self, mut record: JobRecord) -> Result<JobRecord> {
        let job_id = record.id();
        let mut state = self.state.write().await;

        let previous = state.records.get(&job_id);
        check_revision(job_id, previous.map(|r| r.revision), record.revision)?;

        let event = appended_event(previous, &record);
        record.revision += 1;

        state.next_seq += 1;
        let entry = AuditEntry {
            seq: state.next_seq,
            job_id,
            revision: record.revision,
            recorded_at: Utc::now(),
            event,
            record: record.clone(),
        };

        state.order.insert((record.submitted_at, job_id));
        state.audit.entry(job_id).or_default().push(entry);
        state.records.insert(job_id, record.clone());

        Ok(record)
    }

    async fn get(&self, job_id: JobId) -> Result<JobRecord> {
        self.state
            .read()
            .await
            .records
            .get(&job_id)
            .cloned()
            .ok_or(SchedulerError::NotFound(job_id))
    }

    async fn list(
        &self,
        filter: &JobFilter,
        after: Option<&ListCursor>,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let state = self.state.read().await;

        let start = match after {
            Some(cursor) => Bound::Excluded((cursor.submitted_at, cursor.id)),
            None => Bound::Unbounded,
        };

        let page = state
            .order
            .range((start, Bound::Unbounded))
            .filter_map(|(_, id)| state.records.get(id))
            .filter(|record| filter.matches(record))
            .take(limit)
            .cloned()
            .collect();

        Ok(page)
    }

    async fn history(&self, job_id: JobId) -> Result<Vec<AuditEntry>> {
        self.state
            .read()
            .await
            .audit
            .get(&job_id)
            .cloned()
            .ok_or(SchedulerError::NotFound(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::JobPages;
    use chrono::Duration;
    use keel_core::domain::job::{JobPhase, TransitionCause};
    use keel_core::dto::job::SubmitJob;
    use std::sync::Arc;
    use uuid::Uuid;

    fn record_at(at: DateTime<Utc>) -> JobRecord {
        let spec = SubmitJob::program("python", "run.py")
            .into_spec(Uuid::new_v4())
            .unwrap();
        JobRecord::new(spec, at)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InMemoryJobStore::new();
        let record = record_at(Utc::now());
        let id = record.id();

        let stored = store.put(record).await.unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(store.get(id).await.unwrap(), stored);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InMemoryJobStore::new();
        let id = Uuid::new_v4();

        assert!(matches!(store.get(id).await, Err(SchedulerError::NotFound(x)) if x == id));
        assert!(matches!(store.history(id).await, Err(SchedulerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let store = InMemoryJobStore::new();
        let stored = store.put(record_at(Utc::now())).await.unwrap();

        let mut first = stored.clone();
        first
            .transition(JobPhase::Cancelled, TransitionCause::CancelRequested, Utc::now())
            .unwrap();
        store.put(first).await.unwrap();

        let err = store.put(stored).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::StoreWriteConflict {
                expected: 1,
                found: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let store = InMemoryJobStore::new();
        let record = record_at(Utc::now());

        store.put(record.clone()).await.unwrap();
        assert!(store.put(record).await.is_err());
    }

    #[tokio::test]
    async fn test_audit_log_replays_current_state() {
        let store = InMemoryJobStore::new();
        let mut record = store.put(record_at(Utc::now())).await.unwrap();

        record
            .transition(JobPhase::Bidding, TransitionCause::NodesMatched { count: 2 }, Utc::now())
            .unwrap();
        record = store.put(record).await.unwrap();
        record.reassignments = 1;
        record = store.put(record).await.unwrap();

        let history = store.history(record.id()).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].event.as_ref().unwrap().seq, 1);
        assert_eq!(history[1].event.as_ref().unwrap().to, JobPhase::Bidding);
        assert!(history[2].event.is_none());
        assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));

        assert_eq!(JobRecord::replay(&history).unwrap(), record);
    }

    #[tokio::test]
    async fn test_list_orders_by_submission_then_id() {
        let store = InMemoryJobStore::new();
        let base = Utc::now();
        let late = record_at(base + Duration::seconds(5));
        let early = record_at(base);
        let tie = record_at(base);

        for record in [late.clone(), early.clone(), tie.clone()] {
            store.put(record).await.unwrap();
        }

        let listed: Vec<_> = store
            .list(&JobFilter::default(), None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id())
            .collect();

        let (first, second) = if early.id() < tie.id() {
            (early.id(), tie.id())
        } else {
            (tie.id(), early.id())
        };
        assert_eq!(listed, vec![first, second, late.id()]);
    }

    #[tokio::test]
    async fn test_pages_restart_from_cursor() {
        let store = Arc::new(InMemoryJobStore::new());
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let record = record_at(base + Duration::seconds(i));
            ids.push(record.id());
            store.put(record).await.unwrap();
        }

        let mut pages = JobPages::new(store.clone(), JobFilter::default(), 2);
        let first = pages.next_page().await.unwrap().unwrap();
        assert_eq!(first.len(), 2);

        let cursor = pages.cursor();
        let resumed = JobPages::resume(store.clone(), JobFilter::default(), cursor, 2)
            .collect_all()
            .await
            .unwrap();
        let resumed: Vec<_> = resumed.iter().map(|r| r.id()).collect();
        assert_eq!(resumed, ids[2..].to_vec());

        let all = JobPages::new(store, JobFilter::default(), 2)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
    }
}
