//! Worker-process side: the loops that run inside `regen-worker`.
//!
//! A worker is single-threaded apart from its heartbeat thread. It blocks
//! on the control channel for a command, runs it, and reports the outcome.
//! Each job runs inside an error boundary, so a backend error or panic
//! becomes an `Error` status and the loop keeps serving.

mod backend;
mod entry;
mod inference;
mod link;
mod safety;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;

use crate::ipc::{Resource, SupervisorMessage, WorkerMessage};

pub use backend::{
    BackendError, InferenceBackend, SafetyBackend, SimulatedInference, SimulatedSafety,
};
pub use entry::{
    EXIT_CHANNEL_BROKEN, EXIT_FATAL, run, run_from_stdio, start_inference_process,
    start_safety_process,
};
pub use inference::InferenceWorker;
pub use link::{ControlLink, Outbox, StreamLink};
pub use safety::SafetyWorker;

/// Why a job (or a standalone model load) did not complete.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("timed out waiting for {0}")]
    AcquisitionDenied(Resource),

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("not supported by this worker: {0}")]
    Unsupported(&'static str),

    /// `Shutdown` arrived while the job was waiting.
    #[error("shutdown requested")]
    ShuttingDown,

    /// The control channel broke; nothing more can be reported.
    #[error(transparent)]
    Link(#[from] crate::Error),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::AcquisitionDenied(_) | JobError::ShuttingDown)
    }
}

/// Permits this process holds, mirroring the supervisor's ledger so they
/// can be handed back when a job aborts.
#[derive(Debug, Default)]
pub(crate) struct Permits {
    held: Vec<Resource>,
}

impl Permits {
    /// Request a permit and block until the supervisor answers.
    pub fn acquire(&mut self, link: &mut impl ControlLink, resource: Resource) -> Result<(), JobError> {
        link.send(&WorkerMessage::Acquire { resource })?;
        loop {
            match link.recv()? {
                SupervisorMessage::Grant { resource: granted } if granted == resource => {
                    self.held.push(resource);
                    return Ok(());
                }
                SupervisorMessage::Denied { resource: denied } if denied == resource => {
                    return Err(JobError::AcquisitionDenied(resource));
                }
                SupervisorMessage::Shutdown => return Err(JobError::ShuttingDown),
                other => {
                    tracing::debug!(?other, %resource, "Ignoring command while waiting for a permit");
                }
            }
        }
    }

    pub fn release(&mut self, link: &impl ControlLink, resource: Resource) -> Result<(), JobError> {
        if let Some(pos) = self.held.iter().position(|r| *r == resource) {
            self.held.remove(pos);
            link.send(&WorkerMessage::Release { resource })?;
        }
        Ok(())
    }

    /// Hand back everything still held after an aborted job.
    pub fn release_all(&mut self, link: &impl ControlLink) -> Result<(), JobError> {
        for resource in std::mem::take(&mut self.held) {
            link.send(&WorkerMessage::Release { resource })?;
        }
        Ok(())
    }
}

/// Run `f`, converting a panic into [`JobError::Panicked`].
pub(crate) fn guarded<T>(f: impl FnOnce() -> Result<T, JobError>) -> Result<T, JobError> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(JobError::Panicked(panic_message(payload.as_ref()))))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::link::testing::ScriptedLink;
    use super::*;

    #[test]
    fn test_guarded_converts_panics() {
        let result: Result<(), JobError> = guarded(|| panic!("backend exploded"));
        match result {
            Err(JobError::Panicked(message)) => assert_eq!(message, "backend exploded"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_acquire_skips_unrelated_commands() {
        let (mut link, sent) = ScriptedLink::new(vec![
            SupervisorMessage::Grant {
                resource: Resource::Inference,
            },
            SupervisorMessage::Grant {
                resource: Resource::Disk,
            },
        ]);
        let mut permits = Permits::default();
        permits.acquire(&mut link, Resource::Disk).unwrap();
        permits.release_all(&link).unwrap();

        let sent = sent.borrow();
        assert!(matches!(sent[0], WorkerMessage::Acquire { resource: Resource::Disk }));
        assert!(matches!(sent[1], WorkerMessage::Release { resource: Resource::Disk }));
    }

    #[test]
    fn test_denied_and_shutdown_end_the_wait() {
        let (mut link, _) = ScriptedLink::new(vec![
            SupervisorMessage::Denied {
                resource: Resource::Disk,
            },
            SupervisorMessage::Shutdown,
        ]);
        let mut permits = Permits::default();
        let err = permits.acquire(&mut link, Resource::Disk).unwrap_err();
        assert!(matches!(err, JobError::AcquisitionDenied(Resource::Disk)));
        assert!(err.is_retryable());
        let err = permits.acquire(&mut link, Resource::Disk).unwrap_err();
        assert!(matches!(err, JobError::ShuttingDown));
    }

    #[test]
    fn test_release_of_unheld_permit_sends_nothing() {
        let (link, sent) = ScriptedLink::new(Vec::new());
        let mut permits = Permits::default();
        permits.release(&link, Resource::Inference).unwrap();
        assert!(sent.borrow().is_empty());
    }
}
