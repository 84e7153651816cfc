//! Query Service
//!
//! Read-only projections over the job store. Never writes; tolerates
//! records that are mid-transition by reading whatever revision is current.

use std::sync::Arc;

use keel_core::domain::JobId;
use keel_core::domain::job::TransitionEvent;
use keel_core::dto::job::{HistoryItem, JobHistory, JobView, ListJobsQuery, ListResponse};

use crate::config::OrchestratorConfig;
use crate::error::{Result, SchedulerError};
use crate::repository::{JobFilter, JobStore, ListCursor};

#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn JobStore>,
    config: OrchestratorConfig,
}

impl QueryService {
    pub fn new(store: Arc<dyn JobStore>, config: OrchestratorConfig) -> Self {
        Self { store, config }
    }

    /// Get a job by ID
    pub async fn get(&self, job_id: JobId) -> Result<JobView> {
        let record = self.store.get(job_id).await?;
        Ok(JobView::from(&record))
    }

    /// One page of jobs plus the token for the next page, if any
    pub async fn list(&self, query: &ListJobsQuery) -> Result<ListResponse> {
        let filter = filter_from(query)?;
        let cursor = query
            .next_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .map(ListCursor::decode)
            .transpose()?;
        let limit = self.config.page_size(query.limit);

        // One extra record tells whether another page exists
        let mut records = self.store.list(&filter, cursor.as_ref(), limit + 1).await?;
        let next_token = if records.len() > limit {
            records.truncate(limit);
            records.last().map(|last| ListCursor::after(last).encode())
        } else {
            None
        };

        Ok(ListResponse {
            jobs: records.iter().map(JobView::from).collect(),
            next_token,
        })
    }

    /// Transition events of a job with a sequence number above `since`
    pub async fn history(&self, job_id: JobId, since: Option<u64>) -> Result<Vec<TransitionEvent>> {
        let entries = self.store.history(job_id).await?;
        let since = since.unwrap_or(0);

        Ok(entries
            .into_iter()
            .filter_map(|entry| entry.event)
            .filter(|event| event.seq > since)
            .collect())
    }

    pub async fn history_view(&self, job_id: JobId, since: Option<u64>) -> Result<JobHistory> {
        let items = self
            .history(job_id, since)
            .await?
            .iter()
            .map(|event| HistoryItem::from_event(job_id, event))
            .collect();

        Ok(JobHistory { items })
    }
}

fn filter_from(query: &ListJobsQuery) -> Result<JobFilter> {
    if let (Some(since), Some(until)) = (query.since, query.until) {
        if since >= until {
            return Err(SchedulerError::Validation(
                "since must be earlier than until".to_string(),
            ));
        }
    }

    Ok(JobFilter {
        phase: query.phase,
        submitter: query.submitter.clone(),
        namespace: query.namespace.clone(),
        since: query.since,
        until: query.until,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryJobStore;
    use chrono::{Duration, SubsecRound, Utc};
    use keel_core::domain::job::{JobPhase, JobRecord, TransitionCause};
    use keel_core::dto::job::SubmitJob;
    use uuid::Uuid;

    async fn seeded(count: i64) -> (QueryService, Vec<JobId>) {
        let store = Arc::new(InMemoryJobStore::new());
        // Continuation tokens carry microseconds, as stored timestamps do
        let base = Utc::now().trunc_subsecs(6);
        let mut ids = Vec::new();

        for i in 0..count {
            let request = SubmitJob::program("python", "run.py")
                .with_namespace(if i % 2 == 0 { "even" } else { "odd" });
            let record = JobRecord::new(
                request.into_spec(Uuid::new_v4()).unwrap(),
                base + Duration::milliseconds(i),
            );
            ids.push(record.id());
            store.put(record).await.unwrap();
        }

        (
            QueryService::new(store, OrchestratorConfig::new().with_page_sizes(2, 10)),
            ids,
        )
    }

    #[tokio::test]
    async fn test_list_pages_with_token() {
        let (query, ids) = seeded(5).await;

        let first = query.list(&ListJobsQuery::default()).await.unwrap();
        assert_eq!(first.jobs.len(), 2);
        assert!(first.next_token.is_some());

        let mut seen: Vec<_> = first.jobs.iter().map(|j| j.job_id).collect();
        let mut token = first.next_token;
        while let Some(next) = token {
            let page = query
                .list(&ListJobsQuery {
                    next_token: Some(next),
                    ..Default::default()
                })
                .await
                .unwrap();
            seen.extend(page.jobs.iter().map(|j| j.job_id));
            token = page.next_token;
        }

        assert_eq!(seen, ids);
    }

    #[tokio::test]
    async fn test_exact_last_page_has_no_token() {
        let (query, _) = seeded(4).await;
        let page = query
            .list(&ListJobsQuery {
                limit: Some(4),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(page.jobs.len(), 4);
        assert!(page.next_token.is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace() {
        let (query, _) = seeded(5).await;
        let page = query
            .list(&ListJobsQuery {
                namespace: Some("odd".into()),
                limit: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(page.jobs.len(), 2);
        assert!(page.jobs.iter().all(|j| j.namespace.as_deref() == Some("odd")));
    }

    #[tokio::test]
    async fn test_bad_query_is_validation_error() {
        let (query, _) = seeded(1).await;
        let now = Utc::now();

        let err = query
            .list(&ListJobsQuery {
                next_token: Some("not-a-token".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));

        let err = query
            .list(&ListJobsQuery {
                since: Some(now),
                until: Some(now),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_history_since() {
        let store = Arc::new(InMemoryJobStore::new());
        let spec = SubmitJob::program("python", "run.py")
            .into_spec(Uuid::new_v4())
            .unwrap();
        let mut record = store.put(JobRecord::new(spec, Utc::now())).await.unwrap();
        record
            .transition(JobPhase::Bidding, TransitionCause::NodesMatched { count: 1 }, Utc::now())
            .unwrap();
        let record = store.put(record).await.unwrap();

        let query = QueryService::new(store, OrchestratorConfig::new());
        let all = query.history(record.id(), None).await.unwrap();
        assert_eq!(all.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);

        let tail = query.history_view(record.id(), Some(1)).await.unwrap();
        assert_eq!(tail.items.len(), 1);
        assert_eq!(tail.items[0].new, JobPhase::Bidding);

        assert!(matches!(
            query.get(Uuid::new_v4()).await,
            Err(SchedulerError::NotFound(_))
        ));
    }
}
