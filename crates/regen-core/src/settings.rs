//! Worker settings: the raw, user-facing model and its validated form.
//!
//! [`validate`] is pure: it never logs and never touches process state.
//! Adjustments it makes are returned as [`SettingsWarning`]s so the caller
//! decides how to surface them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ipc::WorkerConfig;

const DEFAULT_PROCESS_TIMEOUT: u64 = 300;
const MIN_PRELOAD_TIMEOUT: u64 = 15;
const EXTRA_SLOW_PRELOAD_TIMEOUT: u64 = 120;
const MIN_POST_PROCESS_TIMEOUT: u64 = 15;
const INFERENCE_STEP_TIMEOUT_RANGE: (u64, u64) = (15, 30);
const MAX_QUEUE_WITH_MULTIPLE_THREADS: usize = 3;

/// Latency profile and storage of the model backend.
///
/// Real model execution is opaque to this crate; the worker runs a simulated
/// backend whose latencies come from here.
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[serde(default)]
pub struct BackendSettings {
    pub model_load_ms: u64,
    pub step_ms: u64,
    pub post_process_ms: u64,
    pub safety_cpu_ms: u64,
    pub safety_gpu_ms: u64,
    /// When set, preloading reads `<models_dir>/<model>` from disk.
    pub models_dir: Option<String>,
    /// Prompts containing any of these terms are flagged by the safety check.
    pub flagged_terms: Vec<String>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            model_load_ms: 2_000,
            step_ms: 50,
            post_process_ms: 500,
            safety_cpu_ms: 800,
            safety_gpu_ms: 100,
            models_dir: None,
            flagged_terms: Vec::new(),
        }
    }
}

/// Settings as written by the operator. Timeouts are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSettings {
    pub max_threads: usize,
    pub queue_size: usize,
    pub max_inference_processes: Option<usize>,

    pub process_timeout: u64,
    pub preload_timeout: u64,
    pub inference_step_timeout: u64,
    pub post_process_timeout: u64,
    pub safety_check_timeout: u64,
    pub resource_acquire_timeout: Option<u64>,

    pub heartbeat_interval: u64,
    pub heartbeat_timeout: u64,
    pub spawn_timeout: u64,
    pub shutdown_grace: u64,
    pub tick_interval_ms: u64,
    /// First delay before respawning a worker that failed during startup.
    pub restart_backoff_ms: u64,
    pub restart_backoff_max_ms: u64,
    /// Consecutive startup failures of one worker kind before giving up.
    pub max_startup_failures: u32,

    #[serde(alias = "horde_model_stickiness")]
    pub model_stickiness: f64,

    pub high_memory_mode: bool,
    pub very_high_memory_mode: bool,
    pub high_performance_mode: bool,
    pub moderate_performance_mode: bool,
    pub extra_slow_worker: bool,
    pub very_fast_disk_mode: bool,
    pub disk_parallelism: usize,
    pub post_process_job_overlap: bool,
    pub unload_models_from_vram_often: bool,
    pub cycle_process_on_model_change: bool,
    pub exit_on_unhandled_faults: bool,
    pub safety_on_gpu: bool,
    pub max_resident_models: usize,

    pub worker_binary: Option<PathBuf>,
    pub backend: BackendSettings,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            max_threads: 1,
            queue_size: 1,
            max_inference_processes: None,
            process_timeout: DEFAULT_PROCESS_TIMEOUT,
            preload_timeout: 80,
            inference_step_timeout: 15,
            post_process_timeout: 60,
            safety_check_timeout: 60,
            resource_acquire_timeout: None,
            heartbeat_interval: 5,
            heartbeat_timeout: 30,
            spawn_timeout: 60,
            shutdown_grace: 10,
            tick_interval_ms: 1_000,
            restart_backoff_ms: 1_000,
            restart_backoff_max_ms: 60_000,
            max_startup_failures: 5,
            model_stickiness: 0.0,
            high_memory_mode: true,
            very_high_memory_mode: false,
            high_performance_mode: true,
            moderate_performance_mode: false,
            extra_slow_worker: false,
            very_fast_disk_mode: false,
            disk_parallelism: 2,
            post_process_job_overlap: false,
            unload_models_from_vram_often: true,
            cycle_process_on_model_change: false,
            exit_on_unhandled_faults: false,
            safety_on_gpu: false,
            max_resident_models: 3,
            worker_binary: None,
            backend: BackendSettings::default(),
        }
    }
}

/// Load raw settings from a JSON file.
pub fn load_raw(path: &Path) -> Result<RawSettings> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| {
        Error::InvalidSettings(format!("failed to parse {}: {}", path.display(), e))
    })
}

/// Deadlines for each bounded stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseTimeouts {
    pub preload: Duration,
    /// Bound on every single generation step, not on the whole phase.
    pub inference_step: Duration,
    pub post_process: Duration,
    pub safety_check: Duration,
    /// Bound on the whole job, from assignment to its terminal status.
    pub process: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryMode {
    Normal,
    High,
    VeryHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceMode {
    Normal,
    Moderate,
    High,
}

/// What to do when a worker faults, dies, or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Fail the job and respawn the worker.
    Recover,
    /// Halt the whole system.
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTarget {
    Cpu,
    Gpu,
}

/// Validated, immutable settings consumed by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedSettings {
    /// Concurrent GPU inference slots (inference pool capacity).
    pub max_threads: usize,
    /// Jobs that may wait for an idle inference worker.
    pub queue_depth: usize,
    pub inference_processes: usize,
    pub timeouts: PhaseTimeouts,
    pub resource_acquire_timeout: Option<Duration>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub spawn_timeout: Duration,
    pub shutdown_grace: Duration,
    pub tick_interval: Duration,
    pub restart_backoff: Duration,
    pub restart_backoff_max: Duration,
    pub max_startup_failures: u32,
    pub model_stickiness: f64,
    pub memory_mode: MemoryMode,
    pub performance_mode: PerformanceMode,
    pub skip_post_processing: bool,
    pub cycle_process_on_model_change: bool,
    pub fault_policy: FaultPolicy,
    /// Concurrent model loads allowed from disk.
    pub disk_permits: usize,
    pub safety_target: ExecutionTarget,
    pub max_resident_models: usize,
    pub worker_binary: Option<PathBuf>,
    pub backend: BackendSettings,
}

impl Default for ResolvedSettings {
    fn default() -> Self {
        resolve(RawSettings::default()).0
    }
}

impl ResolvedSettings {
    /// The configuration handed to every worker in its `Hello` handshake.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            heartbeat_interval_ms: self.heartbeat_interval.as_millis() as u64,
            max_resident_models: self.max_resident_models as u32,
            skip_post_processing: self.skip_post_processing,
            safety_on_gpu: self.safety_target == ExecutionTarget::Gpu,
            backend: self.backend.clone(),
        }
    }
}

/// A change or advisory produced by [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsWarning {
    pub field: &'static str,
    pub message: String,
    /// `true` when the value was changed, `false` for a pure advisory.
    pub adjusted: bool,
}

impl SettingsWarning {
    fn adjusted(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
            adjusted: true,
        }
    }

    fn advisory(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
            adjusted: false,
        }
    }
}

/// Validate raw settings, returning the resolved form and every adjustment
/// or advisory made along the way.
pub fn validate(raw: RawSettings) -> Result<(ResolvedSettings, Vec<SettingsWarning>)> {
    check_bounds(&raw)?;
    Ok(resolve(raw))
}

fn check_bounds(raw: &RawSettings) -> Result<()> {
    let fail = |msg: String| Err(Error::InvalidSettings(msg));

    if raw.max_threads == 0 {
        return fail("max_threads must be at least 1".to_string());
    }
    if raw.max_inference_processes == Some(0) {
        return fail("max_inference_processes must be at least 1".to_string());
    }
    if raw.process_timeout == 0 {
        return fail("process_timeout must be at least 1 second".to_string());
    }
    if raw.preload_timeout < MIN_PRELOAD_TIMEOUT {
        return fail(format!(
            "preload_timeout must be at least {MIN_PRELOAD_TIMEOUT} seconds, got {}",
            raw.preload_timeout
        ));
    }
    let (step_min, step_max) = INFERENCE_STEP_TIMEOUT_RANGE;
    if !(step_min..=step_max).contains(&raw.inference_step_timeout) {
        return fail(format!(
            "inference_step_timeout must be between {step_min} and {step_max} seconds, got {}",
            raw.inference_step_timeout
        ));
    }
    if raw.post_process_timeout < MIN_POST_PROCESS_TIMEOUT {
        return fail(format!(
            "post_process_timeout must be at least {MIN_POST_PROCESS_TIMEOUT} seconds, got {}",
            raw.post_process_timeout
        ));
    }
    if raw.safety_check_timeout == 0 {
        return fail("safety_check_timeout must be at least 1 second".to_string());
    }
    if raw.heartbeat_interval == 0 || raw.heartbeat_timeout <= raw.heartbeat_interval {
        return fail(format!(
            "heartbeat_timeout ({}) must exceed a non-zero heartbeat_interval ({})",
            raw.heartbeat_timeout, raw.heartbeat_interval
        ));
    }
    if raw.tick_interval_ms < 10 {
        return fail(format!(
            "tick_interval_ms must be at least 10, got {}",
            raw.tick_interval_ms
        ));
    }
    if raw.max_startup_failures == 0 {
        return fail("max_startup_failures must be at least 1".to_string());
    }
    if raw.restart_backoff_max_ms < raw.restart_backoff_ms {
        return fail(format!(
            "restart_backoff_max_ms ({}) must be at least restart_backoff_ms ({})",
            raw.restart_backoff_max_ms, raw.restart_backoff_ms
        ));
    }
    if !(0.0..=1.0).contains(&raw.model_stickiness) {
        return fail(format!(
            "model_stickiness must be between 0 and 1, got {}",
            raw.model_stickiness
        ));
    }
    if raw.disk_parallelism == 0 {
        return fail("disk_parallelism must be at least 1".to_string());
    }
    if raw.max_resident_models == 0 {
        return fail("max_resident_models must be at least 1".to_string());
    }
    Ok(())
}

fn resolve(mut raw: RawSettings) -> (ResolvedSettings, Vec<SettingsWarning>) {
    let mut warnings = Vec::new();

    if raw.max_threads >= 2 && raw.queue_size > MAX_QUEUE_WITH_MULTIPLE_THREADS {
        raw.queue_size = MAX_QUEUE_WITH_MULTIPLE_THREADS;
        warnings.push(SettingsWarning::adjusted(
            "queue_size",
            format!(
                "queue_size has been set to {MAX_QUEUE_WITH_MULTIPLE_THREADS} because max_threads is {}",
                raw.max_threads
            ),
        ));
    }

    let performance_divisor = if raw.high_performance_mode {
        Some(("High performance", 3))
    } else if raw.moderate_performance_mode {
        Some(("Moderate performance", 2))
    } else {
        None
    };
    if let Some((mode, divisor)) = performance_divisor {
        let new_timeout = DEFAULT_PROCESS_TIMEOUT / divisor;
        if raw.process_timeout != DEFAULT_PROCESS_TIMEOUT {
            warnings.push(SettingsWarning::adjusted(
                "process_timeout",
                format!(
                    "{mode} mode is enabled, so process_timeout has been set to 1/{divisor} of the default value ({new_timeout})"
                ),
            ));
        }
        raw.process_timeout = new_timeout;
    }

    if raw.extra_slow_worker {
        let mut disable = |flag: &mut bool, field: &'static str| {
            if *flag {
                *flag = false;
                warnings.push(SettingsWarning::adjusted(
                    field,
                    format!("Extra slow worker is enabled, so {field} has been set to false"),
                ));
            }
        };
        disable(&mut raw.high_performance_mode, "high_performance_mode");
        disable(&mut raw.moderate_performance_mode, "moderate_performance_mode");
        disable(&mut raw.high_memory_mode, "high_memory_mode");
        disable(&mut raw.very_high_memory_mode, "very_high_memory_mode");

        if raw.queue_size > 0 {
            raw.queue_size = 0;
            warnings.push(SettingsWarning::adjusted(
                "queue_size",
                "Extra slow worker is enabled, so queue_size has been set to 0",
            ));
        }
        if raw.max_threads > 1 {
            raw.max_threads = 1;
            warnings.push(SettingsWarning::adjusted(
                "max_threads",
                "Extra slow worker is enabled, so max_threads has been set to 1",
            ));
        }
        if raw.preload_timeout < EXTRA_SLOW_PRELOAD_TIMEOUT {
            raw.preload_timeout = EXTRA_SLOW_PRELOAD_TIMEOUT;
            warnings.push(SettingsWarning::adjusted(
                "preload_timeout",
                format!(
                    "Extra slow worker is enabled, so preload_timeout has been set to {EXTRA_SLOW_PRELOAD_TIMEOUT}"
                ),
            ));
        }
    }

    if raw.very_high_memory_mode && !raw.high_memory_mode {
        raw.high_memory_mode = true;
        warnings.push(SettingsWarning::adjusted(
            "high_memory_mode",
            "Very high memory mode is enabled, so high_memory_mode has been set to true",
        ));
    }

    if raw.high_memory_mode {
        if raw.max_threads == 1 {
            warnings.push(SettingsWarning::advisory(
                "max_threads",
                "High memory mode is enabled, you should consider setting max_threads to 2",
            ));
        }
        if raw.queue_size == 0 {
            warnings.push(SettingsWarning::advisory(
                "queue_size",
                "High memory mode is enabled, you should consider setting queue_size to 1 or higher",
            ));
        }
        if raw.unload_models_from_vram_often {
            warnings.push(SettingsWarning::advisory(
                "unload_models_from_vram_often",
                "High memory mode is enabled, you should consider setting unload_models_from_vram_often to false",
            ));
        }
        if raw.cycle_process_on_model_change {
            raw.cycle_process_on_model_change = false;
            warnings.push(SettingsWarning::adjusted(
                "cycle_process_on_model_change",
                "High memory mode is enabled, so cycle_process_on_model_change has been set to false",
            ));
        }
    }

    let inference_processes = match raw.max_inference_processes {
        Some(n) if n < raw.max_threads => {
            warnings.push(SettingsWarning::adjusted(
                "max_inference_processes",
                format!(
                    "max_inference_processes ({n}) is below max_threads, so it has been raised to {}",
                    raw.max_threads
                ),
            ));
            raw.max_threads
        }
        Some(n) => n,
        None => raw.max_threads,
    };

    let memory_mode = if raw.very_high_memory_mode {
        MemoryMode::VeryHigh
    } else if raw.high_memory_mode {
        MemoryMode::High
    } else {
        MemoryMode::Normal
    };
    let performance_mode = if raw.high_performance_mode {
        PerformanceMode::High
    } else if raw.moderate_performance_mode {
        PerformanceMode::Moderate
    } else {
        PerformanceMode::Normal
    };

    let resolved = ResolvedSettings {
        max_threads: raw.max_threads,
        queue_depth: raw.queue_size,
        inference_processes,
        timeouts: PhaseTimeouts {
            preload: Duration::from_secs(raw.preload_timeout),
            inference_step: Duration::from_secs(raw.inference_step_timeout),
            post_process: Duration::from_secs(raw.post_process_timeout),
            safety_check: Duration::from_secs(raw.safety_check_timeout),
            process: Duration::from_secs(raw.process_timeout),
        },
        resource_acquire_timeout: raw.resource_acquire_timeout.map(Duration::from_secs),
        heartbeat_interval: Duration::from_secs(raw.heartbeat_interval),
        heartbeat_timeout: Duration::from_secs(raw.heartbeat_timeout),
        spawn_timeout: Duration::from_secs(raw.spawn_timeout),
        shutdown_grace: Duration::from_secs(raw.shutdown_grace),
        tick_interval: Duration::from_millis(raw.tick_interval_ms),
        restart_backoff: Duration::from_millis(raw.restart_backoff_ms),
        restart_backoff_max: Duration::from_millis(raw.restart_backoff_max_ms),
        max_startup_failures: raw.max_startup_failures,
        model_stickiness: raw.model_stickiness,
        memory_mode,
        performance_mode,
        skip_post_processing: performance_mode != PerformanceMode::Normal
            && raw.post_process_job_overlap,
        cycle_process_on_model_change: raw.cycle_process_on_model_change,
        fault_policy: if raw.exit_on_unhandled_faults {
            FaultPolicy::Halt
        } else {
            FaultPolicy::Recover
        },
        disk_permits: if raw.very_fast_disk_mode {
            raw.disk_parallelism
        } else {
            1
        },
        safety_target: if raw.safety_on_gpu {
            ExecutionTarget::Gpu
        } else {
            ExecutionTarget::Cpu
        },
        max_resident_models: if memory_mode == MemoryMode::VeryHigh {
            raw.max_resident_models
        } else {
            1
        },
        worker_binary: raw.worker_binary,
        backend: raw.backend,
    };

    (resolved, warnings)
}
