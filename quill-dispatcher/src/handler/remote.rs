//! Remote step handler
//!
//! Runs a job kind's ordered step list against a collaborator HTTP service.
//! Each step is one request:
//!
//! `POST {base_url}/{kind}/{step}` with the job reference and the current
//! checkpoint payload. A 2xx response body (a JSON object for the job kind)
//! becomes the next checkpoint payload.
//!
//! Steps already completed by an earlier run are skipped, so a retried or
//! resumed job continues where it stopped.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use quill_core::domain::checkpoint::CheckpointData;
use quill_core::domain::job::JobKind;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{HandlerError, StepContext, StepHandler};

const RETRY_AFTER: &str = "retry-after";
const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Epoch seconds below this are read as a relative delay
const EPOCH_THRESHOLD: i64 = 1_000_000_000;

/// Ordered step labels for each job kind
pub fn pipeline_steps(kind: JobKind) -> &'static [&'static str] {
    match kind {
        JobKind::ChapterGeneration => &[
            "started",
            "status_updated",
            "context_assembled",
            "draft_generated",
            "chapter_saved",
        ],
        JobKind::MultiPassEditing => &[
            "started",
            "structural_pass",
            "line_pass",
            "copy_pass",
            "revision_saved",
        ],
        JobKind::EditorialAnalysis => &[
            "started",
            "reviews_collected",
            "consensus_built",
            "report_saved",
        ],
    }
}

#[derive(Debug, Serialize)]
struct StepRequest<'a> {
    job_id: Uuid,
    target_id: &'a str,
    step: &'a str,
    attempts: i32,
    data: JsonValue,
}

/// Step handler backed by a collaborator HTTP service
pub struct RemoteStepHandler {
    client: Client,
    base_url: String,
    kind: JobKind,
}

impl RemoteStepHandler {
    pub fn new(base_url: &str, kind: JobKind, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            kind,
        })
    }

    fn step_url(&self, step: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.kind, step)
    }

    async fn run_step(
        &self,
        ctx: &StepContext,
        step: &str,
        data: &CheckpointData,
    ) -> Result<CheckpointData, HandlerError> {
        let body = StepRequest {
            job_id: ctx.job.id,
            target_id: &ctx.job.target_id,
            step,
            attempts: ctx.job.attempts,
            data: data
                .to_value()
                .map_err(|e| HandlerError::Permanent(format!("invalid checkpoint data: {}", e)))?,
        };

        ctx.record_request().await?;
        let response = self
            .client
            .post(self.step_url(step))
            .json(&body)
            .send()
            .await
            .map_err(|e| HandlerError::Transient(format!("step '{}' request failed: {}", step, e)))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &headers, &text, step, Utc::now()));
        }

        let text = response
            .text()
            .await
            .map_err(|e| HandlerError::Transient(format!("step '{}' response lost: {}", step, e)))?;
        if text.trim().is_empty() {
            return Ok(data.clone());
        }

        let value: JsonValue = serde_json::from_str(&text).map_err(|e| {
            HandlerError::Permanent(format!("step '{}' returned invalid JSON: {}", step, e))
        })?;
        CheckpointData::from_value(self.kind, value).map_err(|e| {
            HandlerError::Permanent(format!("step '{}' returned unexpected payload: {}", step, e))
        })
    }
}

#[async_trait]
impl StepHandler for RemoteStepHandler {
    async fn execute(&self, ctx: &mut StepContext) -> Result<(), HandlerError> {
        if let Some(step) = ctx.resume_from_step() {
            info!("Resuming job {} after step '{}'", ctx.job.id, step);
        }

        for step in pipeline_steps(self.kind) {
            if ctx.is_step_completed(step) {
                debug!("Job {} skipping completed step '{}'", ctx.job.id, step);
                continue;
            }

            let data = ctx.data_or_empty();
            let next = self.run_step(ctx, step, &data).await?;

            ctx.save_checkpoint(step, next).await?;
            ctx.mark_step_completed(step).await?;
        }

        Ok(())
    }
}

/// Maps a non-2xx collaborator response to a handler error
fn classify_failure(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    step: &str,
    now: DateTime<Utc>,
) -> HandlerError {
    let message = if body.trim().is_empty() {
        format!("step '{}' failed with status {}", step, status)
    } else {
        format!("step '{}' failed with status {}: {}", step, status, body.trim())
    };

    if status == StatusCode::TOO_MANY_REQUESTS {
        HandlerError::RateLimited {
            message,
            resets_at: parse_reset(headers, now),
        }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        HandlerError::Transient(message)
    } else {
        HandlerError::Permanent(message)
    }
}

/// Best-known quota reset from `Retry-After` or `X-RateLimit-Reset`
///
/// Values that do not fit a timestamp are treated as absent, so the guard's
/// default wait applies.
fn parse_reset(headers: &HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let header = |name: &'static str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    };

    if let Some(value) = header(RETRY_AFTER) {
        if let Ok(secs) = value.parse::<i64>() {
            return offset(now, secs);
        }
        if let Ok(at) = DateTime::parse_from_rfc2822(value) {
            return Some(at.with_timezone(&Utc));
        }
    }

    let value = header(RATE_LIMIT_RESET)?;
    if let Ok(n) = value.parse::<i64>() {
        return if n >= EPOCH_THRESHOLD {
            Utc.timestamp_opt(n, 0).single()
        } else {
            offset(now, n)
        };
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn offset(now: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    now.checked_add_signed(TimeDelta::try_seconds(secs)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_step_lists_start_with_started_and_are_unique() {
        for kind in JobKind::ALL {
            let steps = pipeline_steps(kind);
            assert_eq!(steps[0], "started");
            let mut unique = steps.to_vec();
            unique.sort();
            unique.dedup();
            assert_eq!(unique.len(), steps.len());
        }
    }

    #[test]
    fn test_step_url() {
        let handler = RemoteStepHandler::new(
            "http://collab:9000/",
            JobKind::MultiPassEditing,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            handler.step_url("line_pass"),
            "http://collab:9000/multi_pass_editing/line_pass"
        );
    }

    #[test]
    fn test_retry_after_seconds_and_date() {
        let now = Utc::now();
        assert_eq!(
            parse_reset(&headers(&[("retry-after", "120")]), now),
            Some(now + chrono::Duration::seconds(120))
        );

        let parsed = parse_reset(
            &headers(&[("retry-after", "Wed, 21 Oct 2026 07:28:00 GMT")]),
            now,
        )
        .unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-10-21T07:28:00+00:00");
    }

    #[test]
    fn test_ratelimit_reset_epoch_delta_and_rfc3339() {
        let now = Utc::now();
        assert_eq!(
            parse_reset(&headers(&[("x-ratelimit-reset", "1792560000")]), now),
            Utc.timestamp_opt(1_792_560_000, 0).single()
        );
        assert_eq!(
            parse_reset(&headers(&[("x-ratelimit-reset", "30")]), now),
            Some(now + chrono::Duration::seconds(30))
        );
        assert_eq!(
            parse_reset(
                &headers(&[("x-ratelimit-reset", "2026-10-16T12:00:00Z")]),
                now
            )
            .map(|at| at.to_rfc3339()),
            Some("2026-10-16T12:00:00+00:00".to_string())
        );
        assert_eq!(parse_reset(&headers(&[]), now), None);
        assert_eq!(parse_reset(&headers(&[("retry-after", "soon")]), now), None);
    }

    #[test]
    fn test_out_of_range_reset_is_ignored() {
        let now = Utc::now();
        for (name, value) in [
            ("retry-after", "9223372036854775807"),
            ("retry-after", "-9223372036854775807"),
            ("x-ratelimit-reset", "-9223372036854775807"),
            ("x-ratelimit-reset", "9223372036854775807"),
        ] {
            assert_eq!(parse_reset(&headers(&[(name, value)]), now), None, "{name}: {value}");
        }

        // Still a rate limit, just with an unknown reset
        let limited = classify_failure(
            StatusCode::TOO_MANY_REQUESTS,
            &headers(&[("retry-after", "9223372036854775807")]),
            "",
            "draft_generated",
            now,
        );
        assert!(matches!(
            limited,
            HandlerError::RateLimited { resets_at: None, .. }
        ));
    }

    #[test]
    fn test_classify_failure() {
        let now = Utc::now();
        let limited = classify_failure(
            StatusCode::TOO_MANY_REQUESTS,
            &headers(&[("retry-after", "60")]),
            "quota exceeded",
            "draft_generated",
            now,
        );
        match limited {
            HandlerError::RateLimited { message, resets_at } => {
                assert!(message.contains("quota exceeded"));
                assert_eq!(resets_at, Some(now + chrono::Duration::seconds(60)));
            }
            other => panic!("expected rate limit, got {:?}", other),
        }

        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, &HeaderMap::new(), "", "started", now),
            HandlerError::Transient(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::UNPROCESSABLE_ENTITY, &HeaderMap::new(), "", "started", now),
            HandlerError::Permanent(_)
        ));
    }
}
