//! Inference worker loop.

use std::collections::VecDeque;

use crate::error::Result;
use crate::ipc::{Resource, SupervisorMessage, WorkerConfig, WorkerMessage};
use crate::job::{GenerationParams, JobId, Phase};

use super::{ControlLink, InferenceBackend, JobError, Permits, guarded};

/// Runs generation jobs one at a time.
///
/// Per job: load the model under the disk permit if it is not resident, run
/// every step under the inference permit, post-process, report.
pub struct InferenceWorker<L, B> {
    link: L,
    backend: B,
    config: WorkerConfig,
    permits: Permits,
    /// Most recently used first.
    resident: VecDeque<String>,
}

impl<L: ControlLink, B: InferenceBackend> InferenceWorker<L, B> {
    pub fn new(link: L, backend: B, config: WorkerConfig) -> Self {
        Self {
            link,
            backend,
            config,
            permits: Permits::default(),
            resident: VecDeque::new(),
        }
    }

    fn capacity(&self) -> usize {
        (self.config.max_resident_models as usize).max(1)
    }

    /// Serve commands until `Shutdown`. Errors only when the control
    /// channel breaks.
    pub fn run(mut self) -> Result<()> {
        self.link.send(&WorkerMessage::Ready {
            pid: std::process::id(),
        })?;
        tracing::info!("Inference worker ready");

        loop {
            let outcome = match self.link.recv()? {
                SupervisorMessage::Load { model } => self.handle_load(model),
                SupervisorMessage::Infer {
                    job_id,
                    model,
                    params,
                } => self.handle_infer(job_id, model, params),
                SupervisorMessage::SafetyCheck { job_id, .. } => {
                    self.report_error(Some(job_id), JobError::Unsupported("safety checks"))
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
                Err(e) => {
                    tracing::error!("Failed to report job outcome: {}", e);
                }
            }
        }

        tracing::info!("Inference worker shutting down");
        self.link.send(&WorkerMessage::ShuttingDown)?;
        Ok(())
    }

    fn handle_load(&mut self, model: String) -> std::result::Result<(), JobError> {
        let loaded = guarded(|| self.ensure_resident(&model, None));
        self.permits.release_all(&self.link)?;
        match loaded {
            Ok(_) => self.report_resident(),
            Err(e) if matches!(e, JobError::Link(_) | JobError::ShuttingDown) => Err(e),
            Err(e) => {
                if matches!(e, JobError::Panicked(_)) {
                    self.forget_resident()?;
                }
                self.report_error(None, e)
            }
        }
    }

    fn handle_infer(
        &mut self,
        job_id: JobId,
        model: String,
        params: GenerationParams,
    ) -> std::result::Result<(), JobError> {
        tracing::info!(job = %job_id, %model, steps = params.steps, "Starting job");
        let result = guarded(|| self.run_job(&job_id, &model, &params));
        self.permits.release_all(&self.link)?;

        match result {
            Ok(output_ref) => {
                tracing::info!(job = %job_id, %output_ref, "Job finished");
                self.link.send(&WorkerMessage::Result { job_id, output_ref })?;
                Ok(())
            }
            Err(e) if matches!(e, JobError::Link(_) | JobError::ShuttingDown) => Err(e),
            Err(e) => {
                if matches!(e, JobError::Panicked(_)) {
                    self.forget_resident()?;
                }
                self.report_error(Some(job_id), e)
            }
        }
    }

    fn run_job(
        &mut self,
        job_id: &JobId,
        model: &str,
        params: &GenerationParams,
    ) -> std::result::Result<String, JobError> {
        self.backend.validate(model, params)?;

        if self.ensure_resident(model, Some(job_id))? {
            self.report_resident()?;
        }

        self.permits.acquire(&mut self.link, Resource::Inference)?;
        let generated = self.generate(job_id, model, params);
        self.permits.release(&self.link, Resource::Inference)?;
        let output_ref = generated?;

        if !params.post_processors.is_empty() && !self.config.skip_post_processing {
            self.link.send(&WorkerMessage::Progress {
                job_id: job_id.clone(),
                phase: Phase::PostProcessing,
            })?;
            for processor in &params.post_processors {
                self.backend.post_process(&output_ref, processor)?;
            }
        }

        Ok(output_ref)
    }

    fn generate(
        &mut self,
        job_id: &JobId,
        model: &str,
        params: &GenerationParams,
    ) -> std::result::Result<String, JobError> {
        self.link.send(&WorkerMessage::Progress {
            job_id: job_id.clone(),
            phase: Phase::Inferring,
        })?;
        for step in 1..=params.steps {
            self.backend.step(model, params, step)?;
            self.link.send(&WorkerMessage::Step {
                job_id: job_id.clone(),
                step,
                total: params.steps,
            })?;
        }
        Ok(self.backend.finish(job_id, model)?)
    }

    /// Make `model` resident, loading it under the disk permit if needed.
    /// Returns whether the resident set changed.
    fn ensure_resident(
        &mut self,
        model: &str,
        job_id: Option<&JobId>,
    ) -> std::result::Result<bool, JobError> {
        if let Some(pos) = self.resident.iter().position(|m| m == model) {
            if let Some(hit) = self.resident.remove(pos) {
                self.resident.push_front(hit);
            }
            return Ok(false);
        }

        // The preload deadline starts before the disk wait.
        if let Some(job_id) = job_id {
            self.link.send(&WorkerMessage::Progress {
                job_id: job_id.clone(),
                phase: Phase::Preloading,
            })?;
        }
        self.permits.acquire(&mut self.link, Resource::Disk)?;
        tracing::info!(model, "Loading model");
        let loaded = self.backend.load(model);
        self.permits.release(&self.link, Resource::Disk)?;
        loaded?;

        self.resident.push_front(model.to_string());
        while self.resident.len() > self.capacity() {
            if let Some(evicted) = self.resident.pop_back() {
                tracing::debug!(model = %evicted, "Evicting model");
                self.backend.unload(&evicted);
            }
        }
        Ok(true)
    }

    fn report_resident(&self) -> std::result::Result<(), JobError> {
        self.link.send(&WorkerMessage::ModelsResident {
            models: self.resident.iter().cloned().collect(),
        })?;
        Ok(())
    }

    /// After a panic the backend's model state is unknown.
    fn forget_resident(&mut self) -> std::result::Result<(), JobError> {
        if self.resident.is_empty() {
            return Ok(());
        }
        self.resident.clear();
        self.report_resident()
    }

    fn report_error(&self, job_id: Option<JobId>, error: JobError) -> std::result::Result<(), JobError> {
        tracing::warn!(job = ?job_id, "Job failed: {}", error);
        self.link.send(&WorkerMessage::Error {
            job_id,
            cause: error.to_string(),
            retryable: error.is_retryable(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::BackendSettings;
    use crate::worker::backend::instant;
    use crate::worker::link::testing::ScriptedLink;
    use crate::worker::{BackendError, SimulatedInference};

    fn config(max_resident_models: u32) -> WorkerConfig {
        WorkerConfig {
            heartbeat_interval_ms: 1000,
            max_resident_models,
            skip_post_processing: false,
            safety_on_gpu: false,
            backend: instant(),
        }
    }

    fn infer(id: &str, model: &str, steps: u32) -> SupervisorMessage {
        SupervisorMessage::Infer {
            job_id: JobId::new(id),
            model: model.to_string(),
            params: GenerationParams {
                steps,
                ..GenerationParams::default()
            },
        }
    }

    fn grant(resource: Resource) -> SupervisorMessage {
        SupervisorMessage::Grant { resource }
    }

    fn simulated() -> SimulatedInference {
        SimulatedInference::new(instant()).unwrap()
    }

    #[test]
    fn test_job_follows_the_resource_protocol() {
        let (link, sent) = ScriptedLink::new(vec![
            infer("j1", "sdxl", 2),
            grant(Resource::Disk),
            grant(Resource::Inference),
            SupervisorMessage::Shutdown,
        ]);
        InferenceWorker::new(link, simulated(), config(1)).run().unwrap();

        let sent = sent.borrow();
        let kinds: Vec<&str> = sent
            .iter()
            .map(|m| match m {
                WorkerMessage::Ready { .. } => "ready",
                WorkerMessage::Acquire { resource: Resource::Disk } => "acquire-disk",
                WorkerMessage::Release { resource: Resource::Disk } => "release-disk",
                WorkerMessage::Acquire { resource: Resource::Inference } => "acquire-gpu",
                WorkerMessage::Release { resource: Resource::Inference } => "release-gpu",
                WorkerMessage::Progress { phase: Phase::Preloading, .. } => "preloading",
                WorkerMessage::Progress { phase: Phase::Inferring, .. } => "inferring",
                WorkerMessage::Step { .. } => "step",
                WorkerMessage::ModelsResident { .. } => "resident",
                WorkerMessage::Result { .. } => "result",
                WorkerMessage::ShuttingDown => "bye",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            [
                "ready",
                "preloading",
                "acquire-disk",
                "release-disk",
                "resident",
                "acquire-gpu",
                "inferring",
                "step",
                "step",
                "release-gpu",
                "result",
                "bye",
            ]
        );
    }

    #[test]
    fn test_resident_model_skips_the_disk() {
        let (link, sent) = ScriptedLink::new(vec![
            infer("j1", "sdxl", 1),
            grant(Resource::Disk),
            grant(Resource::Inference),
            infer("j2", "sdxl", 1),
            grant(Resource::Inference),
            SupervisorMessage::Shutdown,
        ]);
        InferenceWorker::new(link, simulated(), config(1)).run().unwrap();

        let disk_requests = sent
            .borrow()
            .iter()
            .filter(|m| matches!(m, WorkerMessage::Acquire { resource: Resource::Disk }))
            .count();
        assert_eq!(disk_requests, 1);
    }

    #[test]
    fn test_lru_evicts_least_recent_model() {
        let (link, sent) = ScriptedLink::new(vec![
            SupervisorMessage::Load {
                model: "a".to_string(),
            },
            grant(Resource::Disk),
            SupervisorMessage::Load {
                model: "b".to_string(),
            },
            grant(Resource::Disk),
            SupervisorMessage::Load {
                model: "a".to_string(),
            },
            SupervisorMessage::Load {
                model: "c".to_string(),
            },
            grant(Resource::Disk),
            SupervisorMessage::Shutdown,
        ]);
        InferenceWorker::new(link, simulated(), config(2)).run().unwrap();

        let last = sent
            .borrow()
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::ModelsResident { models } => Some(models.clone()),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last, ["c", "a"]);
    }

    #[test]
    fn test_invalid_params_report_a_non_retryable_error() {
        let (link, sent) = ScriptedLink::new(vec![infer("j1", "sdxl", 0), SupervisorMessage::Shutdown]);
        InferenceWorker::new(link, simulated(), config(1)).run().unwrap();

        let sent = sent.borrow();
        let error = sent
            .iter()
            .find_map(|m| match m {
                WorkerMessage::Error {
                    job_id, retryable, ..
                } => Some((job_id.clone(), *retryable)),
                _ => None,
            })
            .unwrap();
        assert_eq!(error, (Some(JobId::new("j1")), false));
    }

    #[test]
    fn test_denied_disk_reports_a_retryable_error_and_keeps_serving() {
        let (link, sent) = ScriptedLink::new(vec![
            infer("j1", "sdxl", 1),
            SupervisorMessage::Denied {
                resource: Resource::Disk,
            },
            infer("j2", "sdxl", 1),
            grant(Resource::Disk),
            grant(Resource::Inference),
            SupervisorMessage::Shutdown,
        ]);
        InferenceWorker::new(link, simulated(), config(1)).run().unwrap();

        let sent = sent.borrow();
        assert!(sent.iter().any(|m| matches!(
            m,
            WorkerMessage::Error { retryable: true, .. }
        )));
        assert!(sent.iter().any(|m| matches!(
            m,
            WorkerMessage::Result { job_id, .. } if job_id.as_str() == "j2"
        )));
    }

    struct PanickingBackend;

    impl InferenceBackend for PanickingBackend {
        fn validate(&self, _: &str, _: &GenerationParams) -> std::result::Result<(), BackendError> {
            Ok(())
        }

        fn load(&mut self, _: &str) -> std::result::Result<(), BackendError> {
            Ok(())
        }

        fn unload(&mut self, _: &str) {}

        fn step(&mut self, _: &str, _: &GenerationParams, _: u32) -> std::result::Result<(), BackendError> {
            panic!("CUDA error: illegal memory access");
        }

        fn finish(&mut self, _: &JobId, _: &str) -> std::result::Result<String, BackendError> {
            Ok(String::new())
        }

        fn post_process(&mut self, _: &str, _: &str) -> std::result::Result<(), BackendError> {
            Ok(())
        }
    }

    #[test]
    fn test_panic_mid_inference_releases_permit_and_keeps_serving() {
        let (link, sent) = ScriptedLink::new(vec![
            infer("j1", "sdxl", 3),
            grant(Resource::Disk),
            grant(Resource::Inference),
            SupervisorMessage::Shutdown,
        ]);
        InferenceWorker::new(link, PanickingBackend, config(1)).run().unwrap();

        let sent = sent.borrow();
        let release_gpu = sent
            .iter()
            .position(|m| matches!(m, WorkerMessage::Release { resource: Resource::Inference }))
            .unwrap();
        let error = sent
            .iter()
            .position(|m| matches!(m, WorkerMessage::Error { cause, .. } if cause.contains("illegal memory access")))
            .unwrap();
        assert!(release_gpu < error);
        assert!(matches!(sent.last(), Some(WorkerMessage::ShuttingDown)));
    }

    #[test]
    fn test_post_processing_is_skipped_when_configured() {
        let job = SupervisorMessage::Infer {
            job_id: JobId::new("j1"),
            model: "sdxl".to_string(),
            params: GenerationParams {
                steps: 1,
                post_processors: vec!["RealESRGAN_x4plus".to_string()],
                ..GenerationParams::default()
            },
        };
        let script = || {
            vec![
                job.clone(),
                grant(Resource::Disk),
                grant(Resource::Inference),
                SupervisorMessage::Shutdown,
            ]
        };
        let post_processing = |sent: &[WorkerMessage]| {
            sent.iter().any(|m| {
                matches!(m, WorkerMessage::Progress { phase: Phase::PostProcessing, .. })
            })
        };

        let (link, sent) = ScriptedLink::new(script());
        InferenceWorker::new(link, simulated(), config(1)).run().unwrap();
        assert!(post_processing(sent.borrow().as_slice()));

        let skipping = WorkerConfig {
            skip_post_processing: true,
            ..config(1)
        };
        let (link, sent) = ScriptedLink::new(script());
        InferenceWorker::new(link, simulated(), skipping).run().unwrap();
        assert!(!post_processing(sent.borrow().as_slice()));
    }

    #[test]
    fn test_broken_channel_ends_the_loop_with_an_error() {
        let (link, _) = ScriptedLink::new(Vec::new());
        let backend = SimulatedInference::new(BackendSettings::default()).unwrap();
        assert!(InferenceWorker::new(link, backend, config(1)).run().is_err());
    }
}
