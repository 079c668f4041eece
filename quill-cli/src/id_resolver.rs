//! ID resolver module
//!
//! Lets users name a job by a short, unambiguous prefix of its UUID.

use anyhow::{Context, Result, anyhow, bail};
use quill_core::dto::job::{JobFilter, Pagination};
use uuid::Uuid;

use crate::api::ApiClient;

/// A job reference as typed on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRef {
    Full(Uuid),
    Prefix(String),
}

impl JobRef {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if let Ok(uuid) = Uuid::parse_str(input) {
            return Ok(JobRef::Full(uuid));
        }
        if input.is_empty() || !input.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            bail!("'{}' is not a job ID or ID prefix", input);
        }
        Ok(JobRef::Prefix(input.to_lowercase()))
    }
}

/// Resolves a job ID or prefix to a full UUID
///
/// Prefixes are matched against the most recent jobs the API returns in one
/// page.
pub async fn resolve_job_id(client: &ApiClient, input: &str) -> Result<Uuid> {
    let prefix = match JobRef::parse(input)? {
        JobRef::Full(uuid) => return Ok(uuid),
        JobRef::Prefix(prefix) => prefix,
    };

    let page = client
        .list_jobs(
            &JobFilter::default(),
            Pagination::new(Some(Pagination::MAX_LIMIT), None),
        )
        .await
        .context("Failed to fetch jobs for ID resolution")?;

    match_prefix(page.jobs.iter().map(|job| job.id), &prefix)
}

fn match_prefix(ids: impl Iterator<Item = Uuid>, prefix: &str) -> Result<Uuid> {
    let matches: Vec<Uuid> = ids
        .filter(|id| id.to_string().starts_with(prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No job found with ID starting with '{}'", prefix)),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple jobs: {}",
                prefix,
                ids.join(", ")
            ))
        }
    }
}
