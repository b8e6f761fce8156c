//! Safety worker loop.

use crate::error::Result;
use crate::ipc::{Resource, SupervisorMessage, WorkerConfig, WorkerMessage};
use crate::job::{JobId, Verdict};
use crate::settings::ExecutionTarget;

use super::{ControlLink, JobError, Permits, SafetyBackend, guarded};

/// Checks produced artifacts. Loads its model from disk on first use and
/// never touches the inference pool.
pub struct SafetyWorker<L, B> {
    link: L,
    backend: B,
    target: ExecutionTarget,
    permits: Permits,
    loaded: bool,
}

impl<L: ControlLink, B: SafetyBackend> SafetyWorker<L, B> {
    pub fn new(link: L, backend: B, config: &WorkerConfig) -> Self {
        let target = if config.safety_on_gpu {
            ExecutionTarget::Gpu
        } else {
            ExecutionTarget::Cpu
        };
        Self {
            link,
            backend,
            target,
            permits: Permits::default(),
            loaded: false,
        }
    }

    pub fn run(mut self) -> Result<()> {
        self.link.send(&WorkerMessage::Ready {
            pid: std::process::id(),
        })?;
        tracing::info!(execution = ?self.target, "Safety worker ready");

        loop {
            let outcome = match self.link.recv()? {
                SupervisorMessage::SafetyCheck {
                    job_id,
                    artifact_ref,
                    prompt,
                } => self.handle_check(job_id, &artifact_ref, &prompt),
                SupervisorMessage::Infer { job_id, .. } => {
                    self.report_error(Some(job_id), JobError::Unsupported("generation"))
                }
                SupervisorMessage::Load { .. } => {
                    self.report_error(None, JobError::Unsupported("model preloading"))
                }
                SupervisorMessage::Shutdown => break,
                other => {
                    tracing::debug!(?other, "Ignoring unexpected command");
                    Ok(())
                }
            };
            match outcome {
                Ok(()) => {}
                Err(JobError::ShuttingDown) => break,
                Err(JobError::Link(e)) => return Err(e),
                Err(e) => tracing::error!("Failed to report check outcome: {}", e),
            }
        }

        tracing::info!("Safety worker shutting down");
        self.link.send(&WorkerMessage::ShuttingDown)?;
        Ok(())
    }

    fn handle_check(
        &mut self,
        job_id: JobId,
        artifact_ref: &str,
        prompt: &str,
    ) -> std::result::Result<(), JobError> {
        let result = guarded(|| self.check(artifact_ref, prompt));
        self.permits.release_all(&self.link)?;

        match result {
            Ok(verdict) => {
                tracing::info!(job = %job_id, ?verdict, "Safety check finished");
                self.link.send(&WorkerMessage::SafetyResult { job_id, verdict })?;
                Ok(())
            }
            Err(e) if matches!(e, JobError::Link(_) | JobError::ShuttingDown) => Err(e),
            Err(e) => self.report_error(Some(job_id), e),
        }
    }

    fn check(&mut self, artifact_ref: &str, prompt: &str) -> std::result::Result<Verdict, JobError> {
        if !self.loaded {
            self.permits.acquire(&mut self.link, Resource::Disk)?;
            tracing::info!("Loading safety model");
            let loaded = self.backend.load();
            self.permits.release(&self.link, Resource::Disk)?;
            loaded?;
            self.loaded = true;
        }
        Ok(self.backend.check(artifact_ref, prompt, self.target)?)
    }

    fn report_error(&self, job_id: Option<JobId>, error: JobError) -> std::result::Result<(), JobError> {
        tracing::warn!(job = ?job_id, "Safety check failed: {}", error);
        self.link.send(&WorkerMessage::Error {
            job_id,
            cause: error.to_string(),
            retryable: error.is_retryable(),
        })?;
        Ok(())
    }
}
