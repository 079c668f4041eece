//! API client module
//!
//! HTTP client for the Quill operations API.

use anyhow::{Context, Result};
use quill_core::domain::job::{Job, JobKind};
use quill_core::domain::session::SessionStats;
use quill_core::dto::job::{EnqueueJob, JobCounts, JobFilter, JobPage, Pagination, StatusOverride};
use reqwest::Client;
use uuid::Uuid;

/// HTTP client for the operations API
pub struct ApiClient {
    base_url: String,
    client: Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    /// Enqueue a new job
    pub async fn enqueue(&self, kind: JobKind, target_id: &str) -> Result<Job> {
        let url = format!("{}/jobs", self.base_url);
        let req = EnqueueJob {
            kind,
            target_id: target_id.to_string(),
        };
        let response = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .context("Failed to send enqueue request")?;

        self.handle_response(response).await
    }

    /// List jobs matching `filter`, newest first
    pub async fn list_jobs(&self, filter: &JobFilter, pagination: Pagination) -> Result<JobPage> {
        let url = format!("{}/jobs", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&list_query(filter, pagination))
            .send()
            .await
            .context("Failed to send list jobs request")?;

        self.handle_response(response).await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job> {
        let url = format!("{}/jobs/{}", self.base_url, id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to send get job request")?;

        self.handle_response(response).await
    }

    /// Job counts per status
    pub async fn job_stats(&self) -> Result<JobCounts> {
        let url = format!("{}/jobs/stats", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to send job stats request")?;

        self.handle_response(response).await
    }

    /// Force a job's status
    pub async fn override_job(&self, id: Uuid, req: &StatusOverride) -> Result<Job> {
        let url = format!("{}/jobs/{}/override", self.base_url, id);
        let response = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .context("Failed to send override request")?;

        self.handle_response(response).await
    }

    pub async fn session_stats(&self) -> Result<SessionStats> {
        let url = format!("{}/session", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to send session stats request")?;

        self.handle_response(response).await
    }

    /// Handle API response and deserialize JSON
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Request failed with status {}: {}", status, error_text);
        }

        response
            .json()
            .await
            .context("Failed to parse response JSON")
    }
}

/// Query parameters for `GET /jobs`; unset filters are omitted
fn list_query(filter: &JobFilter, pagination: Pagination) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("limit", pagination.limit.to_string()),
        ("offset", pagination.offset.to_string()),
    ];
    if let Some(status) = filter.status {
        query.push(("status", status.to_string()));
    }
    if let Some(kind) = filter.kind {
        query.push(("kind", kind.to_string()));
    }
    if let Some(target_id) = &filter.target_id {
        query.push(("target_id", target_id.clone()));
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::domain::job::JobStatus;

    #[test]
    fn test_list_query_omits_unset_filters() {
        let query = list_query(&JobFilter::default(), Pagination::default());
        assert_eq!(
            query,
            vec![("limit", "50".to_string()), ("offset", "0".to_string())]
        );

        let filter = JobFilter {
            status: Some(JobStatus::Paused),
            target_id: Some("book-4".to_string()),
            kind: Some(JobKind::EditorialAnalysis),
        };
        let query = list_query(&filter, Pagination::new(Some(10), Some(20)));
        assert!(query.contains(&("status", "paused".to_string())));
        assert!(query.contains(&("kind", "editorial_analysis".to_string())));
        assert!(query.contains(&("target_id", "book-4".to_string())));
        assert!(query.contains(&("offset", "20".to_string())));
    }
}
