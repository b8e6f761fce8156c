//! Worker-side end of the control channel.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::ipc::{SupervisorMessage, WorkerMessage, read_message, write_message};

/// Blocking, bidirectional channel to the supervisor.
pub trait ControlLink {
    /// Block until the next command arrives.
    fn recv(&mut self) -> Result<SupervisorMessage>;

    fn send(&self, message: &WorkerMessage) -> Result<()>;
}

/// Shared, locked writer half. Cloned into the heartbeat thread and the
/// top-level fault guard.
pub struct Outbox<W> {
    writer: Arc<Mutex<W>>,
}

impl<W> Clone for Outbox<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<W: Write> Outbox<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Write one frame. Frames from different threads never interleave.
    pub fn send(&self, message: &WorkerMessage) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::Ipc("control writer lock poisoned".to_string()))?;
        write_message(&mut *writer, message)
    }
}

/// [`ControlLink`] over a pair of byte streams (stdin/stdout in production).
pub struct StreamLink<R, W> {
    reader: R,
    outbox: Outbox<W>,
    heartbeat_stop: Arc<AtomicBool>,
}

impl<R: Read, W: Write + Send + 'static> StreamLink<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            outbox: Outbox::new(writer),
            heartbeat_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn outbox(&self) -> Outbox<W> {
        self.outbox.clone()
    }

    /// Send `Heartbeat` every `interval` from a background thread until the
    /// link is dropped or the channel breaks.
    pub fn with_heartbeat(self, interval: Duration) -> Self {
        let outbox = self.outbox.clone();
        let stop = Arc::clone(&self.heartbeat_stop);
        let interval = interval.max(Duration::from_millis(10));

        let spawned = std::thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let timestamp_ms = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or_default();
                    if let Err(e) = outbox.send(&WorkerMessage::Heartbeat { timestamp_ms }) {
                        tracing::debug!("Heartbeat thread exiting: {}", e);
                        break;
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("Failed to start heartbeat thread: {}", e);
        }

        self
    }
}

impl<R: Read, W: Write> ControlLink for StreamLink<R, W> {
    fn recv(&mut self) -> Result<SupervisorMessage> {
        read_message(&mut self.reader)
    }

    fn send(&self, message: &WorkerMessage) -> Result<()> {
        self.outbox.send(message)
    }
}

impl<R, W> Drop for StreamLink<R, W> {
    fn drop(&mut self) {
        self.heartbeat_stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;

    /// Replays a fixed command script and records everything sent back.
    pub struct ScriptedLink {
        script: VecDeque<SupervisorMessage>,
        sent: Rc<RefCell<Vec<WorkerMessage>>>,
    }

    impl ScriptedLink {
        pub fn new(script: Vec<SupervisorMessage>) -> (Self, Rc<RefCell<Vec<WorkerMessage>>>) {
            let sent = Rc::new(RefCell::new(Vec::new()));
            let link = Self {
                script: script.into(),
                sent: Rc::clone(&sent),
            };
            (link, sent)
        }
    }

    impl ControlLink for ScriptedLink {
        fn recv(&mut self) -> Result<SupervisorMessage> {
            self.script
                .pop_front()
                .ok_or_else(|| Error::Ipc("control channel closed".to_string()))
        }

        fn send(&self, message: &WorkerMessage) -> Result<()> {
            self.sent.borrow_mut().push(message.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Resource;
    use std::io::Cursor;

    /// Writer whose contents stay readable after it is moved into a link.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn frames(&self) -> Vec<WorkerMessage> {
            let bytes = self.0.lock().unwrap().clone();
            let mut cursor = Cursor::new(bytes);
            let mut frames = Vec::new();
            while let Ok(message) = read_message::<_, WorkerMessage>(&mut cursor) {
                frames.push(message);
            }
            frames
        }
    }

    #[test]
    fn test_stream_link_reads_commands_and_writes_statuses() {
        let mut input = Vec::new();
        write_message(&mut input, &SupervisorMessage::Grant { resource: Resource::Disk }).unwrap();
        let out = SharedBuf::default();

        let mut link = StreamLink::new(Cursor::new(input), out.clone());
        let command = link.recv().unwrap();
        assert!(matches!(command, SupervisorMessage::Grant { resource: Resource::Disk }));
        assert!(link.recv().is_err());

        link.send(&WorkerMessage::Ready { pid: 1 }).unwrap();
        assert!(matches!(out.frames().as_slice(), [WorkerMessage::Ready { pid: 1 }]));
    }

    #[test]
    fn test_heartbeats_flow_until_link_is_dropped() {
        let out = SharedBuf::default();
        let link = StreamLink::new(Cursor::new(Vec::new()), out.clone())
            .with_heartbeat(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(80));
        drop(link);
        std::thread::sleep(Duration::from_millis(30));
        let seen = out.frames().len();
        assert!(seen >= 2, "expected several heartbeats, saw {seen}");

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(out.frames().len(), seen, "heartbeats continued after drop");
        assert!(
            out.frames()
                .iter()
                .all(|m| matches!(m, WorkerMessage::Heartbeat { .. }))
        );
    }
}
