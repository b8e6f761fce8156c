//! Error types for regen-core.

use thiserror::Error;

use crate::ipc::Resource;
use crate::job::{FailureCause, JobId, Phase};

/// Result type for regen-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in regen-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Creating a worker process failed.
    #[error("failed to spawn worker process: {0}")]
    Spawn(String),

    /// A job phase exceeded its deadline.
    #[error("job {job_id} exceeded its {phase} deadline")]
    PhaseTimeout { job_id: JobId, phase: Phase },

    /// A worker reported an unhandled fault while executing a job.
    #[error("job {job_id} failed in its worker: {message}")]
    WorkerFault { job_id: JobId, message: String },

    /// A worker process disappeared without reporting a final status.
    #[error("job {job_id} lost its worker: {reason}")]
    WorkerDeath { job_id: JobId, reason: String },

    /// Waiting for a shared resource took longer than allowed.
    #[error("job {job_id} timed out waiting for the {resource} resource")]
    ResourceAcquisitionTimeout { job_id: JobId, resource: Resource },

    /// The job was still unfinished when the supervisor stopped.
    #[error("job {job_id} was cancelled by shutdown")]
    Cancelled { job_id: JobId },

    /// The intake queue is full.
    #[error("job queue is full ({capacity} queued)")]
    Backpressure { capacity: usize },

    /// A job with the same id is already in flight.
    #[error("job {0} is already in flight")]
    DuplicateJob(JobId),

    /// The supervisor halted under the fatal fault policy.
    #[error("supervisor halted: {0}")]
    Halted(String),

    /// Settings failed validation.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The error describing why `job_id` failed.
    pub fn from_failure(job_id: &JobId, cause: &FailureCause) -> Self {
        let job_id = job_id.clone();
        match cause {
            FailureCause::PhaseTimeout { phase } => Error::PhaseTimeout {
                job_id,
                phase: *phase,
            },
            FailureCause::WorkerFault { message } => Error::WorkerFault {
                job_id,
                message: message.clone(),
            },
            FailureCause::WorkerDeath { reason } => Error::WorkerDeath {
                job_id,
                reason: reason.clone(),
            },
            FailureCause::ResourceAcquisitionTimeout { resource } => {
                Error::ResourceAcquisitionTimeout {
                    job_id,
                    resource: *resource,
                }
            }
            FailureCause::Shutdown => Error::Cancelled { job_id },
        }
    }

    /// Whether a caller may reasonably retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PhaseTimeout { .. }
                | Error::WorkerDeath { .. }
                | Error::ResourceAcquisitionTimeout { .. }
                | Error::Cancelled { .. }
                | Error::Backpressure { .. }
        )
    }

    /// Error message with a recovery hint for operators.
    pub fn with_hint(&self) -> String {
        match self {
            Error::Spawn(_) => format!(
                "{self}\n  hint: build the worker with `cargo build -p regen-worker` or set REGEN_WORKER_PATH"
            ),
            Error::InvalidSettings(_) => {
                format!("{self}\n  hint: run `regen check --config <file>` to see the accepted ranges")
            }
            Error::PhaseTimeout { phase, .. } => {
                format!("{self}\n  hint: raise the timeout for the {phase} phase if the backend is this slow")
            }
            Error::ResourceAcquisitionTimeout { .. } => format!(
                "{self}\n  hint: raise resource_acquire_timeout or lower max_inference_processes"
            ),
            Error::Backpressure { .. } => {
                format!("{self}\n  hint: wait for a terminal report before dispatching more jobs")
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Backpressure { capacity: 3 }.is_retryable());
        let job_id = JobId::new("j1");
        assert!(
            Error::ResourceAcquisitionTimeout {
                job_id: job_id.clone(),
                resource: Resource::Disk
            }
            .is_retryable()
        );
        assert!(
            !Error::WorkerFault {
                job_id,
                message: "boom".to_string()
            }
            .is_retryable()
        );
        assert!(!Error::Halted("fatal".to_string()).is_retryable());
    }

    #[test]
    fn test_hint_mentions_worker_path() {
        let msg = Error::Spawn("not found".to_string()).with_hint();
        assert!(msg.contains("REGEN_WORKER_PATH"));
    }

    #[test]
    fn test_failure_causes_map_to_job_errors() {
        let job_id = JobId::new("j1");
        let timeout = Error::from_failure(
            &job_id,
            &FailureCause::PhaseTimeout {
                phase: Phase::Preloading,
            },
        );
        assert!(matches!(
            timeout,
            Error::PhaseTimeout { ref job_id, phase: Phase::Preloading } if job_id.as_str() == "j1"
        ));
        assert!(timeout.with_hint().contains("preloading phase"));

        let starved = Error::from_failure(
            &job_id,
            &FailureCause::ResourceAcquisitionTimeout {
                resource: Resource::Inference,
            },
        );
        assert_eq!(
            starved.to_string(),
            "job j1 timed out waiting for the inference slot resource"
        );
        assert!(starved.with_hint().contains("resource_acquire_timeout"));

        let died = Error::from_failure(
            &job_id,
            &FailureCause::WorkerDeath {
                reason: "killed".to_string(),
            },
        );
        assert_eq!(died.to_string(), "job j1 lost its worker: killed");
        assert!(Error::from_failure(&job_id, &FailureCause::Shutdown).is_retryable());
    }
}
