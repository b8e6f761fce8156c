//! Process entry points and the top-level fault guard.

use std::io::{BufReader, BufWriter, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ipc::{SupervisorMessage, WorkerConfig, WorkerKind, WorkerMessage, read_message};

use super::{
    ControlLink, InferenceWorker, SafetyWorker, SimulatedInference, SimulatedSafety, StreamLink,
    panic_message,
};

/// Exit code after reporting `Fatal`.
pub const EXIT_FATAL: i32 = 101;
/// Exit code when the control channel is unusable.
pub const EXIT_CHANNEL_BROKEN: i32 = 2;

/// Run an inference worker with the simulated backend.
pub fn start_inference_process<L: ControlLink>(
    link: L,
    process_id: u32,
    config: WorkerConfig,
) -> Result<()> {
    tracing::info!(process_id, pid = std::process::id(), "Starting inference process");
    let backend = SimulatedInference::new(config.backend.clone())?;
    InferenceWorker::new(link, backend, config).run()
}

/// Run the safety worker with the simulated backend.
pub fn start_safety_process<L: ControlLink>(
    link: L,
    process_id: u32,
    config: WorkerConfig,
) -> Result<()> {
    tracing::info!(process_id, pid = std::process::id(), "Starting safety process");
    let backend = SimulatedSafety::new(config.backend.clone());
    SafetyWorker::new(link, backend, &config).run()
}

/// Entry point of the `regen-worker` binary: the control channel is
/// stdin/stdout. Returns the process exit code.
pub fn run_from_stdio() -> i32 {
    let reader = BufReader::new(std::io::stdin().lock());
    let writer = BufWriter::new(std::io::stdout());
    run(reader, writer)
}

/// Read the `Hello` handshake and run the requested worker kind, containing
/// every fault that escapes the worker loop.
///
/// Clean shutdown returns 0. An escaped error or panic is reported as
/// `Fatal` and returns [`EXIT_FATAL`]. A broken channel returns
/// [`EXIT_CHANNEL_BROKEN`].
pub fn run<R: Read, W: Write + Send + 'static>(mut reader: R, writer: W) -> i32 {
    let (process_id, kind, config) = match read_message::<_, SupervisorMessage>(&mut reader) {
        Ok(SupervisorMessage::Hello {
            process_id,
            kind,
            config,
        }) => (process_id, kind, config),
        Ok(other) => {
            tracing::error!(?other, "Expected Hello as the first command");
            return EXIT_CHANNEL_BROKEN;
        }
        Err(e) => {
            tracing::error!("Failed to read handshake: {}", e);
            return EXIT_CHANNEL_BROKEN;
        }
    };

    let link = StreamLink::new(reader, writer)
        .with_heartbeat(Duration::from_millis(config.heartbeat_interval_ms));
    let outbox = link.outbox();

    let outcome = panic::catch_unwind(AssertUnwindSafe(move || match kind {
        WorkerKind::Inference => start_inference_process(link, process_id, config),
        WorkerKind::Safety => start_safety_process(link, process_id, config),
    }));

    let message = match outcome {
        Ok(Ok(())) => return 0,
        Ok(Err(e @ (Error::Ipc(_) | Error::Serialization(_) | Error::Io(_)))) => {
            tracing::error!("Control channel failed: {}", e);
            return EXIT_CHANNEL_BROKEN;
        }
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
    };

    tracing::error!(%message, "Unhandled fault, exiting");
    if let Err(e) = outbox.send(&WorkerMessage::Fatal { message }) {
        tracing::error!("Could not report fatal fault: {}", e);
        return EXIT_CHANNEL_BROKEN;
    }
    EXIT_FATAL
}
