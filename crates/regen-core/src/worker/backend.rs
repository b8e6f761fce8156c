//! Model backends driven by the worker loops.
//!
//! The real image-generation and safety models are opaque to this crate.
//! The traits here are the seam where they plug in; the simulated backends
//! reproduce their latency profile from [`BackendSettings`].

use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::error::{Error as CoreError, Result as CoreResult};
use crate::job::{GenerationParams, JobId, Verdict};
use crate::settings::{BackendSettings, ExecutionTarget};

/// Failure inside a backend operation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid job parameters: {0}")]
    InvalidParams(String),

    #[error("failed to load model {model}: {reason}")]
    Load { model: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

/// An image-generation backend.
pub trait InferenceBackend {
    /// Reject parameters the backend cannot run.
    fn validate(&self, model: &str, params: &GenerationParams) -> Result<(), BackendError>;

    /// Make `model` resident. Called while holding the disk permit.
    fn load(&mut self, model: &str) -> Result<(), BackendError>;

    fn unload(&mut self, model: &str);

    /// Run generation step `step` (1-based).
    fn step(&mut self, model: &str, params: &GenerationParams, step: u32) -> Result<(), BackendError>;

    /// Store the generated artifact and return a reference to it.
    fn finish(&mut self, job_id: &JobId, model: &str) -> Result<String, BackendError>;

    fn post_process(&mut self, artifact_ref: &str, processor: &str) -> Result<(), BackendError>;
}

/// A content-safety backend.
pub trait SafetyBackend {
    /// Load the safety model. Called once, while holding the disk permit.
    fn load(&mut self) -> Result<(), BackendError>;

    fn check(
        &mut self,
        artifact_ref: &str,
        prompt: &str,
        target: ExecutionTarget,
    ) -> Result<Verdict, BackendError>;
}

fn pause(ms: u64) {
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms));
    }
}

/// Stand-in for the diffusion pipeline.
///
/// Loading reads `<models_dir>/<model>` when that file exists, so disk
/// contention is real; every operation then sleeps for its configured
/// latency.
#[derive(Debug)]
pub struct SimulatedInference {
    settings: BackendSettings,
    models_dir: Option<PathBuf>,
}

impl SimulatedInference {
    pub fn new(settings: BackendSettings) -> CoreResult<Self> {
        let models_dir = settings.models_dir.as_ref().map(PathBuf::from);
        if let Some(dir) = &models_dir
            && !dir.is_dir()
        {
            return Err(CoreError::InvalidSettings(format!(
                "models directory '{}' does not exist",
                dir.display()
            )));
        }
        Ok(Self {
            settings,
            models_dir,
        })
    }
}

impl InferenceBackend for SimulatedInference {
    fn validate(&self, model: &str, params: &GenerationParams) -> Result<(), BackendError> {
        if model.trim().is_empty() {
            return Err(BackendError::InvalidParams("empty model reference".to_string()));
        }
        if params.steps == 0 {
            return Err(BackendError::InvalidParams("steps must be at least 1".to_string()));
        }
        Ok(())
    }

    fn load(&mut self, model: &str) -> Result<(), BackendError> {
        if let Some(dir) = &self.models_dir {
            let path = model_path(dir, model)?;
            if path.is_file() {
                let bytes = std::fs::read(&path).map_err(|e| BackendError::Load {
                    model: model.to_string(),
                    reason: e.to_string(),
                })?;
                tracing::debug!(model, bytes = bytes.len(), "Read model weights");
            }
        }
        pause(self.settings.model_load_ms);
        Ok(())
    }

    fn unload(&mut self, model: &str) {
        tracing::debug!(model, "Unloaded model");
    }

    fn step(&mut self, _model: &str, _params: &GenerationParams, _step: u32) -> Result<(), BackendError> {
        pause(self.settings.step_ms);
        Ok(())
    }

    fn finish(&mut self, job_id: &JobId, model: &str) -> Result<String, BackendError> {
        Ok(format!("regen://{model}/{job_id}.webp"))
    }

    fn post_process(&mut self, _artifact_ref: &str, processor: &str) -> Result<(), BackendError> {
        tracing::debug!(processor, "Post-processing");
        pause(self.settings.post_process_ms);
        Ok(())
    }
}

/// `<dir>/<model>`, provided `model` is a single plain file name.
fn model_path(dir: &Path, model: &str) -> Result<PathBuf, BackendError> {
    let mut components = Path::new(model).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if !model.contains('\\') => Ok(dir.join(name)),
        _ => Err(BackendError::Load {
            model: model.to_string(),
            reason: "model name must be a plain file name inside the models directory".to_string(),
        }),
    }
}

/// Stand-in for the safety classifier: flags prompts containing any of the
/// configured terms.
#[derive(Debug)]
pub struct SimulatedSafety {
    settings: BackendSettings,
    flagged_terms: Vec<String>,
}

impl SimulatedSafety {
    pub fn new(settings: BackendSettings) -> Self {
        let flagged_terms = settings
            .flagged_terms
            .iter()
            .map(|t| t.to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self {
            settings,
            flagged_terms,
        }
    }
}

impl SafetyBackend for SimulatedSafety {
    fn load(&mut self) -> Result<(), BackendError> {
        pause(self.settings.model_load_ms);
        Ok(())
    }

    fn check(
        &mut self,
        artifact_ref: &str,
        prompt: &str,
        target: ExecutionTarget,
    ) -> Result<Verdict, BackendError> {
        if artifact_ref.is_empty() {
            return Err(BackendError::InvalidParams("no artifact to check".to_string()));
        }
        pause(match target {
            ExecutionTarget::Cpu => self.settings.safety_cpu_ms,
            ExecutionTarget::Gpu => self.settings.safety_gpu_ms,
        });

        let prompt = prompt.to_lowercase();
        if self.flagged_terms.iter().any(|t| prompt.contains(t.as_str())) {
            Ok(Verdict::Flagged)
        } else {
            Ok(Verdict::Pass)
        }
    }
}

/// Backend settings with every latency set to zero.
#[cfg(test)]
pub(crate) fn instant() -> BackendSettings {
    BackendSettings {
        model_load_ms: 0,
        step_ms: 0,
        post_process_ms: 0,
        safety_cpu_ms: 0,
        safety_gpu_ms: 0,
        ..BackendSettings::default()
    }
}
