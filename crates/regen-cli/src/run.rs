//! `regen run`: feed a batch of jobs through the supervisor.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use anyhow::Context;
use regen_core::{Error, Job, JobId, JobPayload, JobReport, ProcessSpawner, Supervisor};
use serde::{Deserialize, Serialize};

use crate::check;

/// One line of the jobs file.
#[derive(Debug, Deserialize)]
struct JobLine {
    #[serde(default)]
    id: Option<String>,
    #[serde(flatten)]
    payload: JobPayload,
}

#[derive(Serialize)]
struct ReportLine<'a> {
    #[serde(flatten)]
    report: &'a JobReport,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn read_jobs(path: &Path) -> anyhow::Result<Vec<Job>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read jobs file {}", path.display()))?;

    let mut jobs = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed: JobLine = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid job", path.display(), index + 1))?;
        let id = parsed.id.map(JobId::new).unwrap_or_else(JobId::generate);
        jobs.push(Job::with_id(id, parsed.payload));
    }
    Ok(jobs)
}

/// Retry bookkeeping for submitted jobs.
struct Batch {
    pending: VecDeque<Job>,
    payloads: HashMap<JobId, JobPayload>,
    attempts: HashMap<JobId, u32>,
    max_retries: u32,
}

impl Batch {
    fn new(jobs: Vec<Job>, max_retries: u32) -> Self {
        let payloads = jobs
            .iter()
            .map(|job| (job.id.clone(), job.payload.clone()))
            .collect();
        Self {
            pending: jobs.into(),
            payloads,
            attempts: HashMap::new(),
            max_retries,
        }
    }

    /// Dispatch pending jobs until the supervisor pushes back.
    fn feed(&mut self, supervisor: &mut Supervisor) -> Result<(), Error> {
        while let Some(job) = self.pending.pop_front() {
            match supervisor.dispatch(job.clone()) {
                Ok(()) => *self.attempts.entry(job.id).or_default() += 1,
                Err(Error::Backpressure { .. }) => {
                    self.pending.push_front(job);
                    break;
                }
                Err(e) => {
                    self.pending.push_front(job);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Re-queue a retryable failure, or return the attempt count for a final report.
    fn settle(&mut self, report: &JobReport, can_retry: bool) -> Option<u32> {
        let attempts = self.attempts.get(&report.job_id).copied().unwrap_or(1);
        if can_retry
            && report.outcome.is_retryable()
            && attempts <= self.max_retries
            && let Some(payload) = self.payloads.get(&report.job_id)
        {
            tracing::info!(job = %report.job_id, attempts, "Retrying job");
            self.pending
                .push_back(Job::with_id(report.job_id.clone(), payload.clone()));
            return None;
        }
        self.payloads.remove(&report.job_id);
        Some(attempts)
    }

    fn unfinished(&self) -> usize {
        self.payloads.len()
    }
}

fn report_line(report: &JobReport, attempts: u32) -> ReportLine<'_> {
    let error = report.error().map(|e| {
        tracing::warn!(attempts, "{}", e.with_hint());
        e.to_string()
    });
    ReportLine {
        report,
        attempts,
        error,
    }
}

fn print_report(report: &JobReport, attempts: u32) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(&report_line(report, attempts))?);
    Ok(())
}

pub async fn execute(config: Option<&Path>, jobs_path: &Path, max_retries: u32) -> anyhow::Result<()> {
    let (settings, _) = check::load(config)?;
    let jobs = read_jobs(jobs_path)?;
    if jobs.is_empty() {
        tracing::warn!(path = %jobs_path.display(), "Jobs file is empty");
        return Ok(());
    }

    let spawner = ProcessSpawner::from_settings(&settings)?;
    let mut supervisor = Supervisor::start(settings, spawner).await?;
    let mut batch = Batch::new(jobs, max_retries);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut halted = None;
    while batch.unfinished() > 0 {
        if let Err(e) = batch.feed(&mut supervisor)
            && !matches!(e, Error::Halted(_))
        {
            return Err(e.into());
        }

        tokio::select! {
            report = supervisor.next_report() => match report {
                Ok(report) => {
                    let can_retry = !supervisor.is_halted();
                    if let Some(attempts) = batch.settle(&report, can_retry) {
                        print_report(&report, attempts)?;
                    }
                }
                Err(Error::Halted(reason)) => {
                    halted = Some(reason);
                    break;
                }
                Err(e) => return Err(e.into()),
            },
            _ = &mut ctrl_c => {
                tracing::warn!("Interrupted, shutting down");
                break;
            }
        }
    }

    for report in supervisor.shutdown().await {
        if let Some(attempts) = batch.settle(&report, false) {
            print_report(&report, attempts)?;
        }
    }

    if batch.unfinished() > 0 {
        tracing::warn!(unfinished = batch.unfinished(), "Jobs were never dispatched");
    }
    match halted {
        Some(reason) => Err(Error::Halted(reason).into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regen_core::{FailureCause, JobOutcome};

    fn report(id: &str, outcome: JobOutcome) -> JobReport {
        JobReport {
            job_id: JobId::new(id),
            model: "sdxl".to_string(),
            outcome,
            elapsed_ms: 0,
        }
    }

    fn retryable() -> JobOutcome {
        JobOutcome::Failed {
            cause: FailureCause::WorkerDeath {
                reason: "killed".to_string(),
            },
            retryable: true,
        }
    }

    #[test]
    fn test_read_jobs_skips_blank_and_comment_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.jsonl");
        fs::write(
            &path,
            "# batch\n{\"id\": \"a\", \"model\": \"sdxl\"}\n\n{\"model\": \"flux\", \"safety_check\": false}\n",
        )
        .unwrap();

        let jobs = read_jobs(&path).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, JobId::new("a"));
        assert!(jobs[0].payload.safety_check);
        assert_eq!(jobs[1].payload.model, "flux");
        assert!(!jobs[1].payload.safety_check);
    }

    #[test]
    fn test_read_jobs_reports_line_of_bad_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.jsonl");
        fs::write(&path, "{\"model\": \"sdxl\"}\n{\"prompt\": 1}\n").unwrap();

        let err = read_jobs(&path).unwrap_err();
        assert!(err.to_string().ends_with(":2: invalid job"));
    }

    #[test]
    fn test_retryable_failures_are_requeued_until_exhausted() {
        let job = Job::with_id(JobId::new("a"), JobPayload::new("sdxl", Default::default()));
        let mut batch = Batch::new(vec![job], 1);
        batch.pending.clear();
        batch.attempts.insert(JobId::new("a"), 1);

        assert_eq!(batch.settle(&report("a", retryable()), true), None);
        assert_eq!(batch.pending.len(), 1);
        assert_eq!(batch.unfinished(), 1);

        batch.attempts.insert(JobId::new("a"), 2);
        assert_eq!(batch.settle(&report("a", retryable()), true), Some(2));
        assert_eq!(batch.unfinished(), 0);
    }

    #[test]
    fn test_no_retry_once_halted() {
        let job = Job::with_id(JobId::new("a"), JobPayload::new("sdxl", Default::default()));
        let mut batch = Batch::new(vec![job], 5);
        batch.pending.clear();
        assert_eq!(batch.settle(&report("a", retryable()), false), Some(1));
        assert!(batch.pending.is_empty());
    }

    #[test]
    fn test_failed_reports_carry_an_error_line() {
        let failed = report(
            "a",
            JobOutcome::Failed {
                cause: FailureCause::PhaseTimeout {
                    phase: regen_core::Phase::Preloading,
                },
                retryable: true,
            },
        );
        let json = serde_json::to_value(report_line(&failed, 2)).unwrap();
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["attempts"], 2);
        assert_eq!(json["error"], "job a exceeded its preloading deadline");

        let done = report(
            "b",
            JobOutcome::Done {
                output_ref: "out/b.png".to_string(),
                verdict: None,
            },
        );
        let json = serde_json::to_value(report_line(&done, 1)).unwrap();
        assert!(json.get("error").is_none());
    }
}
