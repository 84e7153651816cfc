//! Job-related API endpoints

use keel_core::domain::job::Entrypoint;
use keel_core::dto::job::{
    CancelJobResponse, HistoryQuery, JobHistory, JobView, ListJobsQuery, ListResponse, SubmitJob,
    SubmitJobResponse,
};
use uuid::Uuid;

use crate::OrchestratorClient;
use crate::error::{ClientError, Result};

impl OrchestratorClient {
    // =============================================================================
    // Submission
    // =============================================================================

    /// Submit a new job
    ///
    /// Exactly one of command or program path must be set, blank values
    /// counting as unset. The request is checked locally before it is sent.
    ///
    /// # Example
    /// ```no_run
    /// # use keel_client::OrchestratorClient;
    /// # use keel_core::dto::job::SubmitJob;
    /// # async fn example() -> anyhow::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// let submitted = client
    ///     .submit_job(&SubmitJob::command("python", "print('hi')"))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn submit_job(&self, req: &SubmitJob) -> Result<SubmitJobResponse> {
        Entrypoint::from_parts(req.command.clone(), req.program_path.clone())
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;

        let response = self
            .client
            .post(self.url("/job/submit"))
            .json(req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Cancel a job; cancelling a finished job returns its final phase
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<CancelJobResponse> {
        let url = self.url(&format!("/job/{}/cancel", job_id));
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Queries
    // =============================================================================

    /// Get a job by ID
    pub async fn get_job(&self, job_id: Uuid) -> Result<JobView> {
        let url = self.url(&format!("/job/{}", job_id));
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// List one page of jobs
    ///
    /// Pass the returned `next_token` back in `query` to fetch the next page.
    pub async fn list_jobs(&self, query: &ListJobsQuery) -> Result<ListResponse> {
        let response = self
            .client
            .get(self.url("/job/list"))
            .query(query)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// List every job matching `query`, following continuation tokens
    pub async fn list_all_jobs(&self, query: &ListJobsQuery) -> Result<Vec<JobView>> {
        let mut query = query.clone();
        let mut jobs = Vec::new();

        loop {
            let page = self.list_jobs(&query).await?;
            jobs.extend(page.jobs);
            match page.next_token {
                Some(token) => query.next_token = Some(token),
                None => return Ok(jobs),
            }
        }
    }

    /// Transition history of a job, optionally only events after `since`
    pub async fn job_history(&self, job_id: Uuid, since: Option<u64>) -> Result<JobHistory> {
        let url = self.url(&format!("/job/{}/history", job_id));
        let response = self
            .client
            .get(&url)
            .query(&HistoryQuery { since })
            .send()
            .await?;

        self.handle_response(response).await
    }
}
