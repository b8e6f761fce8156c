//! Jobs, their phases, and terminal outcomes.
//!
//! A job advances `Queued → Preloading → Inferring → PostProcessing →
//! SafetyCheck → Done`; any phase may be skipped, and `Failed` is reachable
//! from every non-terminal phase. The supervisor owns all `Job` values and
//! retires each one exactly once with a [`JobReport`].

use std::fmt;
use std::time::{Duration, Instant};

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ipc::Resource;
use crate::supervisor::WorkerId;

/// Unique identifier for a job.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle phase of a job.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Queued,
    Preloading,
    Inferring,
    PostProcessing,
    SafetyCheck,
    Done,
    Failed,
}

impl Phase {
    fn rank(self) -> u8 {
        match self {
            Phase::Queued => 0,
            Phase::Preloading => 1,
            Phase::Inferring => 2,
            Phase::PostProcessing => 3,
            Phase::SafetyCheck => 4,
            Phase::Done => 5,
            Phase::Failed => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Phases only move forward (skipping is allowed), `Failed` is reachable
    /// from any non-terminal phase, and terminal phases never change.
    pub fn can_advance_to(self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Phase::Failed || next.rank() > self.rank()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Queued => "queued",
            Phase::Preloading => "preloading",
            Phase::Inferring => "inferring",
            Phase::PostProcessing => "post-processing",
            Phase::SafetyCheck => "safety-check",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Generation parameters forwarded opaquely to the inference backend.
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
pub struct GenerationParams {
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default)]
    pub seed: u64,
    /// Post-processors to run after inference (e.g. upscalers, face fixers).
    #[serde(default)]
    pub post_processors: Vec<String>,
}

fn default_steps() -> u32 {
    30
}

fn default_dimension() -> u32 {
    512
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            steps: default_steps(),
            width: default_dimension(),
            height: default_dimension(),
            seed: 0,
            post_processors: Vec::new(),
        }
    }
}

/// What a job asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Model reference, e.g. `"stable_diffusion"`.
    pub model: String,
    #[serde(default)]
    pub params: GenerationParams,
    /// Route the produced artifact through the safety worker.
    #[serde(default = "default_safety_check")]
    pub safety_check: bool,
}

fn default_safety_check() -> bool {
    true
}

impl JobPayload {
    pub fn new(model: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            model: model.into(),
            params,
            safety_check: true,
        }
    }

    pub fn without_safety_check(mut self) -> Self {
        self.safety_check = false;
        self
    }
}

/// Safety verdict on a produced artifact.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Flagged,
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// The named phase ran past its deadline (or the job ran past the total
    /// process timeout).
    PhaseTimeout { phase: Phase },
    /// The worker reported a fault while running the job.
    WorkerFault { message: String },
    /// The worker process died or stopped sending heartbeats.
    WorkerDeath { reason: String },
    /// A shared resource could not be acquired in time.
    ResourceAcquisitionTimeout { resource: Resource },
    /// The supervisor shut down (or halted) before the job finished.
    Shutdown,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::PhaseTimeout { phase } => write!(f, "{phase} phase timed out"),
            FailureCause::WorkerFault { message } => write!(f, "worker fault: {message}"),
            FailureCause::WorkerDeath { reason } => write!(f, "worker died: {reason}"),
            FailureCause::ResourceAcquisitionTimeout { resource } => {
                write!(f, "timed out waiting for {resource}")
            }
            FailureCause::Shutdown => f.write_str("supervisor shut down"),
        }
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobOutcome {
    Done {
        output_ref: String,
        /// `None` when the job skipped the safety stage.
        verdict: Option<Verdict>,
    },
    Failed {
        cause: FailureCause,
        retryable: bool,
    },
}

impl JobOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, JobOutcome::Done { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobOutcome::Failed { retryable: true, .. })
    }

    pub fn phase(&self) -> Phase {
        match self {
            JobOutcome::Done { .. } => Phase::Done,
            JobOutcome::Failed { .. } => Phase::Failed,
        }
    }
}

/// Terminal status handed to the supervisor's caller, once per job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub model: String,
    pub outcome: JobOutcome,
    pub elapsed_ms: u64,
}

impl JobReport {
    /// Why the job failed, or `None` when it is done.
    pub fn error(&self) -> Option<Error> {
        match &self.outcome {
            JobOutcome::Done { .. } => None,
            JobOutcome::Failed { cause, .. } => Some(Error::from_failure(&self.job_id, cause)),
        }
    }
}

/// A job tracked by the supervisor.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub(crate) assigned: Option<WorkerId>,
    pub(crate) phase: Phase,
    pub(crate) phase_deadline: Option<Instant>,
    pub(crate) total_deadline: Option<Instant>,
    pub(crate) output_ref: Option<String>,
    /// Times a later job jumped ahead of this one through model stickiness.
    pub(crate) passed_over: u32,
    pub(crate) submitted_at: Instant,
}

impl Job {
    pub fn new(payload: JobPayload) -> Self {
        Self::with_id(JobId::generate(), payload)
    }

    pub fn with_id(id: JobId, payload: JobPayload) -> Self {
        Self {
            id,
            payload,
            assigned: None,
            phase: Phase::Queued,
            phase_deadline: None,
            total_deadline: None,
            output_ref: None,
            passed_over: 0,
            submitted_at: Instant::now(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn assigned(&self) -> Option<WorkerId> {
        self.assigned
    }

    pub fn model(&self) -> &str {
        &self.payload.model
    }

    /// Move to `next`, arming `deadline` for it. Returns `false` (and leaves
    /// the job untouched) when the transition is not allowed.
    pub(crate) fn advance(&mut self, next: Phase, deadline: Option<Duration>) -> bool {
        if !self.phase.can_advance_to(next) {
            return false;
        }
        self.phase = next;
        self.phase_deadline = deadline.map(|d| Instant::now() + d);
        true
    }

    /// Push the current phase's deadline out again (per inference step).
    pub(crate) fn rearm(&mut self, deadline: Duration) {
        self.phase_deadline = Some(Instant::now() + deadline);
    }

    /// Drop the phase deadline while the worker waits for the inference
    /// permit; the total deadline still applies.
    pub(crate) fn suspend_deadline(&mut self) {
        self.phase_deadline = None;
    }

    /// The earliest deadline that has already passed, if any.
    pub(crate) fn expired(&self, now: Instant) -> Option<Expiry> {
        if let Some(total) = self.total_deadline
            && now >= total
        {
            return Some(Expiry::Total);
        }
        match self.phase_deadline {
            Some(deadline) if now >= deadline => Some(Expiry::Phase(self.phase)),
            _ => None,
        }
    }

    pub(crate) fn into_report(self, outcome: JobOutcome) -> JobReport {
        JobReport {
            job_id: self.id,
            model: self.payload.model,
            outcome,
            elapsed_ms: self.submitted_at.elapsed().as_millis() as u64,
        }
    }
}

/// Which deadline a job ran past.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expiry {
    Phase(Phase),
    Total,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_only_move_forward() {
        assert!(Phase::Queued.can_advance_to(Phase::Preloading));
        assert!(Phase::Queued.can_advance_to(Phase::Inferring));
        assert!(Phase::Inferring.can_advance_to(Phase::SafetyCheck));
        assert!(!Phase::Inferring.can_advance_to(Phase::Preloading));
        assert!(!Phase::Inferring.can_advance_to(Phase::Inferring));
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal_phase() {
        for phase in [
            Phase::Queued,
            Phase::Preloading,
            Phase::Inferring,
            Phase::PostProcessing,
            Phase::SafetyCheck,
        ] {
            assert!(phase.can_advance_to(Phase::Failed), "{phase} -> failed");
        }
        assert!(!Phase::Done.can_advance_to(Phase::Failed));
        assert!(!Phase::Failed.can_advance_to(Phase::Done));
    }

    #[test]
    fn test_advance_arms_deadline() {
        let mut job = Job::new(JobPayload::new("sdxl", GenerationParams::default()));
        assert!(job.advance(Phase::Preloading, Some(Duration::from_millis(0))));
        assert_eq!(
            job.expired(Instant::now()),
            Some(Expiry::Phase(Phase::Preloading))
        );

        assert!(!job.advance(Phase::Queued, None));
        assert_eq!(job.phase(), Phase::Preloading);
    }

    #[test]
    fn test_total_deadline_wins() {
        let mut job = Job::new(JobPayload::new("sdxl", GenerationParams::default()));
        job.total_deadline = Some(Instant::now());
        job.advance(Phase::Inferring, Some(Duration::from_secs(60)));
        assert_eq!(job.expired(Instant::now()), Some(Expiry::Total));
    }

    #[test]
    fn test_payload_defaults_from_json() {
        let payload: JobPayload = serde_json::from_str(r#"{"model": "sdxl"}"#).unwrap();
        assert!(payload.safety_check);
        assert_eq!(payload.params.steps, 30);
        assert!(payload.params.post_processors.is_empty());
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = JobOutcome::Failed {
            cause: FailureCause::PhaseTimeout {
                phase: Phase::Preloading,
            },
            retryable: true,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["cause"]["kind"], "phase_timeout");
        assert_eq!(json["cause"]["phase"], "preloading");
    }
}
