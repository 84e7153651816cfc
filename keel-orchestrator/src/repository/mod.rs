//! Repository Module
//!
//! The job store: the single source of truth for job records and their
//! audit trail. Writes are optimistic; every successful `put` bumps the
//! record's revision and appends one audit entry.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use keel_core::domain::JobId;
use keel_core::domain::job::{AuditEntry, JobPhase, JobRecord, TransitionEvent};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

// Re-export implementations
pub use memory::InMemoryJobStore;
pub use postgres::PgJobStore;

/// Durable mapping from job id to job record
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts or overwrites a record
    ///
    /// `record.revision` must be the revision the writer read (0 for a new
    /// record). On success the stored record, carrying its new revision, is
    /// returned. A mismatch fails with `StoreWriteConflict`.
    async fn put(&self, record: JobRecord) -> Result<JobRecord>;

    /// Current record for a job, or `NotFound`
    async fn get(&self, job_id: JobId) -> Result<JobRecord>;

    /// One page of records matching `filter`, ordered by submission time
    /// then job id, starting strictly after `after`
    async fn list(
        &self,
        filter: &JobFilter,
        after: Option<&ListCursor>,
        limit: usize,
    ) -> Result<Vec<JobRecord>>;

    /// Audit entries for a job in write order, or `NotFound`
    async fn history(&self, job_id: JobId) -> Result<Vec<AuditEntry>>;
}

/// Optional predicate applied to listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub phase: Option<JobPhase>,
    pub submitter: Option<String>,
    pub namespace: Option<String>,
    /// Inclusive lower bound on submission time
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on submission time
    pub until: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn matches(&self, record: &JobRecord) -> bool {
        self.phase.is_none_or(|phase| record.phase == phase)
            && self
                .submitter
                .as_deref()
                .is_none_or(|s| record.spec.submitter.as_deref() == Some(s))
            && self
                .namespace
                .as_deref()
                .is_none_or(|ns| record.spec.namespace.as_deref() == Some(ns))
            && self.since.is_none_or(|since| record.submitted_at >= since)
            && self.until.is_none_or(|until| record.submitted_at < until)
    }
}

/// Position in the listing order: the last record already returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListCursor {
    pub submitted_at: DateTime<Utc>,
    pub id: JobId,
}

impl ListCursor {
    pub fn after(record: &JobRecord) -> Self {
        Self {
            submitted_at: record.submitted_at,
            id: record.id(),
        }
    }

    /// Opaque continuation token handed to clients
    pub fn encode(&self) -> String {
        format!("{}_{}", self.submitted_at.timestamp_micros(), self.id)
    }

    pub fn decode(token: &str) -> Result<Self> {
        let invalid = || SchedulerError::Validation(format!("invalid continuation token: {}", token));

        let (micros, id) = token.split_once('_').ok_or_else(invalid)?;
        let micros: i64 = micros.parse().map_err(|_| invalid())?;
        let submitted_at = Utc.timestamp_micros(micros).single().ok_or_else(invalid)?;
        let id = Uuid::parse_str(id).map_err(|_| invalid())?;

        Ok(Self { submitted_at, id })
    }

    /// Whether `record` sorts strictly after this cursor
    pub fn precedes(&self, record: &JobRecord) -> bool {
        (record.submitted_at, record.id()) > (self.submitted_at, self.id)
    }
}

/// Lazy, restartable walk over a filtered listing
///
/// Fetches one page per call; `cursor()` can be saved and handed to
/// `resume` to continue after the last record returned.
pub struct JobPages {
    store: Arc<dyn JobStore>,
    filter: JobFilter,
    cursor: Option<ListCursor>,
    page_size: usize,
    exhausted: bool,
}

impl JobPages {
    pub fn new(store: Arc<dyn JobStore>, filter: JobFilter, page_size: usize) -> Self {
        Self::resume(store, filter, None, page_size)
    }

    pub fn resume(
        store: Arc<dyn JobStore>,
        filter: JobFilter,
        cursor: Option<ListCursor>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            filter,
            cursor,
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    pub fn cursor(&self) -> Option<ListCursor> {
        self.cursor
    }

    /// Next page, or `None` once the listing is exhausted
    pub async fn next_page(&mut self) -> Result<Option<Vec<JobRecord>>> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self
            .store
            .list(&self.filter, self.cursor.as_ref(), self.page_size)
            .await?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(ListCursor::after(last));
        }

        if page.is_empty() {
            Ok(None)
        } else {
            Ok(Some(page))
        }
    }

    /// Drains the remaining pages
    pub async fn collect_all(mut self) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();
        while let Some(page) = self.next_page().await? {
            records.extend(page);
        }
        Ok(records)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Transition appended by a write, comparing against the stored record
pub(crate) fn appended_event(
    previous: Option<&JobRecord>,
    next: &JobRecord,
) -> Option<TransitionEvent> {
    let previous_seq = previous
        .and_then(|record| record.last_event())
        .map(|event| event.seq)
        .unwrap_or(0);

    next.last_event()
        .filter(|event| event.seq > previous_seq)
        .cloned()
}

pub(crate) fn check_revision(
    job_id: JobId,
    stored: Option<u64>,
    expected: u64,
) -> Result<()> {
    let found = stored.unwrap_or(0);
    if found != expected {
        return Err(SchedulerError::StoreWriteConflict {
            job_id,
            expected,
            found,
        });
    }
    Ok(())
}
