//! Supervisor-side control channel for one worker process.
//!
//! A writer task drains queued commands onto the worker's stdin and a reader
//! task decodes statuses from its stdout, so the supervisor's control loop
//! never blocks on a single worker.

use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::mpsc;

use super::protocol::{SupervisorMessage, WorkerMessage, read_message_async, write_message_async};
use crate::supervisor::WorkerId;

/// Something observed on a worker's control channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A decoded status frame.
    Message(WorkerMessage),
    /// The channel broke; the worker is gone or unusable.
    Closed(String),
}

/// A channel event tagged with the worker it came from.
#[derive(Debug)]
pub struct WorkerEvent {
    pub worker: WorkerId,
    pub event: ChannelEvent,
}

/// Sending half of a worker's control channel.
///
/// Dropping it closes the worker's stdin once queued commands are written.
#[derive(Debug)]
pub struct ControlChannel {
    tx: mpsc::UnboundedSender<SupervisorMessage>,
}

impl ControlChannel {
    /// Queue a command for the worker. Returns `false` if the writer task is
    /// gone, in which case a `Closed` event has been (or will be) reported.
    pub fn send(&self, message: SupervisorMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Start the reader and writer tasks for a worker's pipes.
pub fn attach<W, R>(
    worker: WorkerId,
    stdin: W,
    stdout: R,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> ControlChannel
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(writer_task(worker, rx, stdin, events.clone()));
    tokio::spawn(reader_task(worker, stdout, events));

    ControlChannel { tx }
}

async fn writer_task<W: AsyncWrite + Unpin>(
    worker: WorkerId,
    mut rx: mpsc::UnboundedReceiver<SupervisorMessage>,
    stdin: W,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut writer = BufWriter::new(stdin);
    while let Some(message) = rx.recv().await {
        tracing::trace!(%worker, ?message, "-> worker");
        if let Err(e) = write_message_async(&mut writer, &message).await {
            let _ = events.send(WorkerEvent {
                worker,
                event: ChannelEvent::Closed(e.to_string()),
            });
            break;
        }
    }
    tracing::debug!(%worker, "Control writer task exiting");
}

async fn reader_task<R: AsyncRead + Unpin>(
    worker: WorkerId,
    stdout: R,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_message_async::<_, WorkerMessage>(&mut reader).await {
            Ok(message) => {
                tracing::trace!(%worker, ?message, "<- worker");
                let event = WorkerEvent {
                    worker,
                    event: ChannelEvent::Message(message),
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = events.send(WorkerEvent {
                    worker,
                    event: ChannelEvent::Closed(e.to_string()),
                });
                break;
            }
        }
    }
    tracing::debug!(%worker, "Control reader task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::Resource;

    #[tokio::test]
    async fn test_commands_reach_the_worker_and_statuses_come_back() {
        let (supervisor_side, mut worker_side) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(supervisor_side);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let channel = attach(WorkerId::new(7), write_half, read_half, events_tx);
        assert!(channel.send(SupervisorMessage::Grant {
            resource: Resource::Disk
        }));

        let received: SupervisorMessage = read_message_async(&mut worker_side).await.unwrap();
        assert!(matches!(received, SupervisorMessage::Grant { resource: Resource::Disk }));

        write_message_async(&mut worker_side, &WorkerMessage::Ready { pid: 42 })
            .await
            .unwrap();
        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.worker, WorkerId::new(7));
        assert!(matches!(event.event, ChannelEvent::Message(WorkerMessage::Ready { pid: 42 })));

        drop(worker_side);
        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event.event, ChannelEvent::Closed(_)));
    }
}
