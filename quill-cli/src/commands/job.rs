//! Job command handlers
//!
//! Handles enqueueing, listing, inspecting and overriding jobs.

use anyhow::Result;
use chrono::{Duration, Utc};
use clap::{Subcommand, ValueEnum};
use colored::*;
use quill_core::domain::checkpoint::Checkpoint;
use quill_core::domain::job::{Job, JobKind, JobStatus};
use quill_core::dto::job::{JobFilter, OverrideStatus, Pagination, StatusOverride};

use crate::api::ApiClient;
use crate::config::Config;
use crate::id_resolver::resolve_job_id;

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// List jobs, newest first
    List {
        /// Only jobs in this status
        #[arg(long)]
        status: Option<JobStatus>,
        /// Only jobs of this kind
        #[arg(long)]
        kind: Option<JobKind>,
        /// Only jobs for this target entity
        #[arg(long)]
        target: Option<String>,
        #[arg(long, default_value_t = Pagination::DEFAULT_LIMIT)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Get job details
    Get {
        /// Job ID or unambiguous prefix
        id: String,
    },
    /// Job counts per status
    Stats,
    /// Force a job's status
    Override {
        /// Job ID or unambiguous prefix
        id: String,
        status: OverrideTarget,
        /// Error text to record on the job
        #[arg(long)]
        error: Option<String>,
        /// For a pause: seconds until the job may resume
        #[arg(long)]
        resume_in: Option<i64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OverrideTarget {
    Pending,
    Paused,
    Failed,
}

impl From<OverrideTarget> for OverrideStatus {
    fn from(target: OverrideTarget) -> Self {
        match target {
            OverrideTarget::Pending => OverrideStatus::Pending,
            OverrideTarget::Paused => OverrideStatus::Paused,
            OverrideTarget::Failed => OverrideStatus::Failed,
        }
    }
}

/// Handle job commands
pub async fn handle_job_command(command: JobCommands, config: &Config) -> Result<()> {
    let client = ApiClient::new(&config.api_url);

    match command {
        JobCommands::List {
            status,
            kind,
            target,
            limit,
            offset,
        } => {
            let filter = JobFilter {
                status,
                target_id: target,
                kind,
            };
            list_jobs(&client, &filter, Pagination::new(Some(limit), Some(offset))).await
        }
        JobCommands::Get { id } => get_job(&client, &id).await,
        JobCommands::Stats => job_stats(&client).await,
        JobCommands::Override {
            id,
            status,
            error,
            resume_in,
        } => {
            let request = StatusOverride {
                status: status.into(),
                error,
                resume_at: resume_in.map(|secs| Utc::now() + Duration::seconds(secs)),
            };
            override_job(&client, &id, &request).await
        }
    }
}

pub async fn enqueue(config: &Config, kind: JobKind, target_id: &str) -> Result<()> {
    let client = ApiClient::new(&config.api_url);
    let job = client.enqueue(kind, target_id).await?;

    println!("{} Enqueued job {}", "✓".green(), job.id.to_string().cyan());
    print_job_summary(&job);

    Ok(())
}

async fn list_jobs(client: &ApiClient, filter: &JobFilter, pagination: Pagination) -> Result<()> {
    let page = client.list_jobs(filter, pagination).await?;

    if page.jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
        return Ok(());
    }

    let first = page.offset as u64 + 1;
    let last = page.offset as u64 + page.jobs.len() as u64;
    println!(
        "{}",
        format!("Showing job(s) {}-{} of {}:", first, last, page.total).bold()
    );
    println!();
    for job in &page.jobs {
        print_job_summary(job);
    }

    Ok(())
}

async fn get_job(client: &ApiClient, id: &str) -> Result<()> {
    let uuid = resolve_job_id(client, id).await?;
    let job = client.get_job(uuid).await?;

    print_job_details(&job);

    Ok(())
}

async fn job_stats(client: &ApiClient) -> Result<()> {
    let counts = client.job_stats().await?;

    println!("{}", "Jobs by status:".bold());
    println!("  {:<10} {}", colorize_status(&JobStatus::Pending), counts.pending);
    println!("  {:<10} {}", colorize_status(&JobStatus::Running), counts.running);
    println!("  {:<10} {}", colorize_status(&JobStatus::Paused), counts.paused);
    println!("  {:<10} {}", colorize_status(&JobStatus::Completed), counts.completed);
    println!("  {:<10} {}", colorize_status(&JobStatus::Failed), counts.failed);
    println!("  {:<10} {}", "total".bold(), counts.total);

    Ok(())
}

async fn override_job(client: &ApiClient, id: &str, request: &StatusOverride) -> Result<()> {
    let uuid = resolve_job_id(client, id).await?;
    let job = client.override_job(uuid, request).await?;

    println!(
        "{} Job {} is now {}",
        "✓".green(),
        job.id.to_string().cyan(),
        colorize_status(&job.status)
    );

    Ok(())
}

fn print_job_summary(job: &Job) {
    println!("  {} Job {}", "▸".cyan(), job.id.to_string().dimmed());
    println!("    Kind:     {}", job.kind);
    println!("    Target:   {}", job.target_id);
    println!("    Status:   {}", colorize_status(&job.status));
    println!(
        "    Created:  {}",
        job.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    if job.attempts > 0 {
        println!("    Attempts: {}", job.attempts);
    }
    println!();
}

fn print_job_details(job: &Job) {
    println!("{}", "Job Details:".bold());
    println!("  ID:          {}", job.id.to_string().cyan());
    println!("  Kind:        {}", job.kind);
    println!("  Target:      {}", job.target_id);
    println!("  Status:      {}", colorize_status(&job.status));
    println!("  Attempts:    {}", job.attempts);
    println!("  Created:     {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));

    if let Some(started) = job.started_at {
        println!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(lease) = job.lease_expires_at {
        println!("  Lease until: {}", lease.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(completed) = job.completed_at {
        println!("  Finished:    {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(reason) = job.pause_reason {
        println!("  Paused by:   {}", reason.as_str());
    }

    if let Some(resume_at) = job.resume_at {
        println!("  Resumes:     {}", resume_at.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(raw) = &job.checkpoint {
        println!("\n{}", "Checkpoint:".bold());
        match Checkpoint::parse(raw) {
            Ok(checkpoint) => {
                println!("  Step:      {}", checkpoint.step.cyan());
                println!("  Completed: {}", checkpoint.completed_steps.join(", "));
                println!(
                    "  Saved:     {}",
                    checkpoint.timestamp.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Err(_) => println!("  {}", "unreadable (job will restart from scratch)".yellow()),
        }
    }

    if let Some(error) = &job.error {
        println!("\n{}", "Error:".bold());
        println!("{}", error.red());
    }
}

/// Colorize job status for display
fn colorize_status(status: &JobStatus) -> ColoredString {
    let status_str = status.as_str();
    match status {
        JobStatus::Pending => status_str.yellow(),
        JobStatus::Running => status_str.cyan(),
        JobStatus::Completed => status_str.green(),
        JobStatus::Paused => status_str.magenta(),
        JobStatus::Failed => status_str.red(),
    }
}
