//! Process orchestration core for the reGen GPU worker.
//!
//! This crate provides:
//! - A supervisor that owns N inference worker processes and one safety process
//! - Job intake with bounded queueing and model-affinity dispatch
//! - Cross-process arbitration of the inference and disk permits
//! - Per-phase deadlines enforced by a tick watchdog
//! - The worker-side loops and their fault-isolating entry points

pub mod arbiter;
pub mod error;
pub mod ipc;
pub mod job;
pub mod settings;
pub mod supervisor;
pub mod worker;

pub use arbiter::{ResourceHandles, ResourceSpan, ResourceUsage};
pub use error::{Error, Result};
pub use ipc::{Resource, WorkerKind};
pub use job::{
    FailureCause, GenerationParams, Job, JobId, JobOutcome, JobPayload, JobReport, Phase, Verdict,
};
pub use settings::{
    BackendSettings, FaultPolicy, RawSettings, ResolvedSettings, SettingsWarning, load_raw,
    validate,
};
pub use supervisor::{ProcessSpawner, Supervisor, WorkerId, WorkerInfo, WorkerSpawner, WorkerState};
