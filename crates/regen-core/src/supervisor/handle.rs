//! Supervisor-side handle to one worker process.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Child;

use crate::ipc::{ControlChannel, Resource, SupervisorMessage, WorkerKind};
use crate::job::JobId;

/// Identifier of a worker process. Monotonic, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Lifecycle of a worker process as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Spawned; waiting for `Ready`.
    Starting,
    Idle,
    /// Running a job or a model load.
    Busy,
    /// Declared itself broken; about to be killed.
    Faulted,
    /// Asked to exit; waiting for its channel to close.
    Terminated,
}

/// Snapshot of a worker for introspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub kind: WorkerKind,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub job: Option<JobId>,
    pub resident_models: Vec<String>,
    pub jobs_completed: u64,
}

/// A live worker process, owned by the supervisor.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub id: WorkerId,
    pub kind: WorkerKind,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub channel: ControlChannel,
    child: Child,
    pub started_at: Instant,
    /// Answered `Ready` at least once.
    pub ready: bool,
    pub last_heartbeat: Instant,
    pub job: Option<JobId>,
    /// Deadline of a standalone `Load` command.
    pub load_deadline: Option<Instant>,
    /// Resource whose pending request was denied for the current job.
    pub denied: Option<Resource>,
    pub resident: Vec<String>,
    /// The resident set changed while a job ran.
    pub models_changed: bool,
    pub jobs_completed: u64,
    /// Reason reported with `Fatal`, used once the channel closes.
    pub fault: Option<String>,
    /// When the worker entered `Faulted` or `Terminated`.
    pub exiting_since: Option<Instant>,
}

impl WorkerHandle {
    pub fn new(id: WorkerId, kind: WorkerKind, child: Child, channel: ControlChannel) -> Self {
        let now = Instant::now();
        Self {
            id,
            kind,
            pid: child.id(),
            state: WorkerState::Starting,
            channel,
            child,
            started_at: now,
            ready: false,
            last_heartbeat: now,
            job: None,
            load_deadline: None,
            denied: None,
            resident: Vec::new(),
            models_changed: false,
            jobs_completed: 0,
            fault: None,
            exiting_since: None,
        }
    }

    pub fn send(&self, message: SupervisorMessage) {
        if !self.channel.send(message) {
            tracing::debug!(worker = %self.id, "Command dropped, control channel is closed");
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }

    pub fn holds_model(&self, model: &str) -> bool {
        self.resident.iter().any(|m| m == model)
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            kind: self.kind,
            pid: self.pid,
            state: self.state,
            job: self.job.clone(),
            resident_models: self.resident.clone(),
            jobs_completed: self.jobs_completed,
        }
    }

    /// Kill the process immediately and reap it in the background.
    pub fn kill(self) {
        let id = self.id;
        let mut child = self.child;
        if let Err(e) = child.start_kill() {
            // Already exited; nothing to kill.
            tracing::debug!(worker = %id, "Kill skipped: {}", e);
        }
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(worker = %id, %status, "Worker reaped"),
                Err(e) => tracing::warn!(worker = %id, "Failed to reap worker: {}", e),
            }
        });
    }

    /// Wait for a clean exit until `deadline`, then kill.
    pub async fn exit_within(mut self, deadline: Instant) {
        let id = self.id;
        drop(self.channel);
        let wait = tokio::time::timeout_at(deadline.into(), self.child.wait()).await;
        match wait {
            Ok(Ok(status)) => tracing::debug!(worker = %id, %status, "Worker exited"),
            Ok(Err(e)) => tracing::warn!(worker = %id, "Failed to wait for worker: {}", e),
            Err(_) => {
                tracing::warn!(worker = %id, "Worker ignored shutdown, killing it");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
    }

    /// Time since the last frame of any kind.
    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_ids_order_and_display() {
        let a = WorkerId::new(1);
        let b = WorkerId::new(2);
        assert!(a < b);
        assert_eq!(b.to_string(), "worker-2");
        assert_eq!(serde_json::to_string(&b).unwrap(), "2");
    }
}
