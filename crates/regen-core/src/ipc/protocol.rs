//! Control-channel protocol between the supervisor and worker processes.
//!
//! Uses length-prefixed rkyv messages over the worker's stdin/stdout.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.

use std::fmt;
use std::io::{Read, Write};

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::job::{GenerationParams, JobId, Phase, Verdict};
use crate::settings::BackendSettings;

/// Largest frame either side will accept.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Kind of worker process.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Inference,
    Safety,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Inference => f.write_str("inference"),
            WorkerKind::Safety => f.write_str("safety"),
        }
    }
}

/// Shared resource class brokered by the supervisor.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    /// One GPU inference slot.
    Inference,
    /// Disk access for model loading.
    Disk,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Inference => f.write_str("inference slot"),
            Resource::Disk => f.write_str("disk"),
        }
    }
}

/// Immutable per-process configuration, delivered in the `Hello` handshake.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// How often the worker's heartbeat thread reports in.
    pub heartbeat_interval_ms: u64,
    /// Models an inference worker may keep resident at once.
    pub max_resident_models: u32,
    /// Skip post-processing entirely (performance mode with job overlap).
    pub skip_post_processing: bool,
    /// Run the safety check on the GPU instead of the CPU.
    pub safety_on_gpu: bool,
    /// Latency profile and storage for the model backend.
    pub backend: BackendSettings,
}

/// Command sent from the supervisor to a worker process.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum SupervisorMessage {
    /// First frame on every channel: who the worker is and how to behave.
    Hello {
        process_id: u32,
        kind: WorkerKind,
        config: WorkerConfig,
    },

    /// Make a model resident ahead of demand.
    Load { model: String },

    /// Run a generation job.
    Infer {
        job_id: JobId,
        model: String,
        params: GenerationParams,
    },

    /// Check a previously produced artifact.
    SafetyCheck {
        job_id: JobId,
        artifact_ref: String,
        prompt: String,
    },

    /// A requested resource permit is now held by this worker.
    Grant { resource: Resource },

    /// A requested resource permit will not be granted.
    Denied { resource: Resource },

    /// Exit the main loop and terminate cleanly.
    Shutdown,
}

/// Status sent from a worker process to the supervisor.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// Handshake complete; the worker is idle.
    Ready { pid: u32 },

    /// Liveness signal, sent on a fixed interval.
    Heartbeat { timestamp_ms: u64 },

    /// The job entered a new phase.
    Progress { job_id: JobId, phase: Phase },

    /// One generation step finished.
    Step { job_id: JobId, step: u32, total: u32 },

    /// Request a resource permit; the worker blocks until `Grant` or `Denied`.
    Acquire { resource: Resource },

    /// Give back a resource permit.
    Release { resource: Resource },

    /// The set of resident models changed.
    ModelsResident { models: Vec<String> },

    /// Job finished; `output_ref` names the produced artifact.
    Result { job_id: JobId, output_ref: String },

    /// Safety check finished.
    SafetyResult { job_id: JobId, verdict: Verdict },

    /// Job failed (or a `Load` failed, with no job id).
    Error {
        job_id: Option<JobId>,
        cause: String,
        retryable: bool,
    },

    /// The process is about to die from a fault its loop could not contain.
    Fatal { message: String },

    /// Acknowledgement of `Shutdown`.
    ShuttingDown,
}

/// Types that can be written as a frame.
pub trait Encode:
    for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >
{
}

impl<T> Encode for T where
    T: for<'a> Serialize<
            rkyv::rancor::Strategy<
                rkyv::ser::Serializer<
                    AlignedVec,
                    rkyv::ser::allocator::ArenaHandle<'a>,
                    rkyv::ser::sharing::Share,
                >,
                rkyv::rancor::Error,
            >,
        >
{
}

fn encode(message: &impl Encode) -> Result<AlignedVec> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", bytes.len())));
    }
    Ok(bytes)
}

fn frame_len(len_bytes: [u8; 4]) -> Result<usize> {
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }
    Ok(len)
}

fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    // SAFETY: frames only come from our own supervisor or worker processes
    // over private pipes, and `bytes` is 16-byte aligned.
    unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(bytes) }
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))
}

fn read_error(e: std::io::Error, what: &str) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Ipc("control channel closed".to_string())
    } else {
        Error::Ipc(format!("Failed to read IPC message {}: {}", what, e))
    }
}

/// Write a message to a writer using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(writer: &mut W, message: &impl Encode) -> Result<()> {
    let bytes = encode(message)?;

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message from a reader using length-prefixed rkyv encoding.
pub fn read_message<R: Read, T>(reader: &mut R) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| read_error(e, "length"))?;
    let len = frame_len(len_bytes)?;

    let mut bytes = AlignedVec::<16>::with_capacity(len);
    bytes.resize(len, 0);
    reader
        .read_exact(&mut bytes)
        .map_err(|e| read_error(e, "body"))?;

    decode(&bytes)
}

/// Async counterpart of [`write_message`], used on the supervisor side.
pub async fn write_message_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &impl Encode,
) -> Result<()> {
    let bytes = encode(message)?;

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Async counterpart of [`read_message`], used on the supervisor side.
pub async fn read_message_async<R: AsyncRead + Unpin, T>(reader: &mut R) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| read_error(e, "length"))?;
    let len = frame_len(len_bytes)?;

    let mut bytes = AlignedVec::<16>::with_capacity(len);
    bytes.resize(len, 0);
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| read_error(e, "body"))?;

    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn config() -> WorkerConfig {
        WorkerConfig {
            heartbeat_interval_ms: 250,
            max_resident_models: 3,
            skip_post_processing: false,
            safety_on_gpu: true,
            backend: BackendSettings::default(),
        }
    }

    #[test]
    fn test_hello_roundtrip() {
        let cmd = SupervisorMessage::Hello {
            process_id: 4,
            kind: WorkerKind::Safety,
            config: config(),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &cmd).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: SupervisorMessage = read_message(&mut cursor).unwrap();

        match decoded {
            SupervisorMessage::Hello {
                process_id,
                kind,
                config: decoded_config,
            } => {
                assert_eq!(process_id, 4);
                assert_eq!(kind, WorkerKind::Safety);
                assert_eq!(decoded_config, config());
            }
            other => panic!("Wrong command type: {:?}", other),
        }
    }

    #[test]
    fn test_error_status_roundtrip() {
        let status = WorkerMessage::Error {
            job_id: Some(JobId::new("job-1")),
            cause: "out of memory".to_string(),
            retryable: false,
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &status).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: WorkerMessage = read_message(&mut cursor).unwrap();

        match decoded {
            WorkerMessage::Error {
                job_id,
                cause,
                retryable,
            } => {
                assert_eq!(job_id, Some(JobId::new("job-1")));
                assert_eq!(cause, "out of memory");
                assert!(!retryable);
            }
            other => panic!("Wrong status type: {:?}", other),
        }
    }

    #[test]
    fn test_consecutive_frames_on_one_stream() {
        let mut buf = Vec::new();
        write_message(&mut buf, &WorkerMessage::Acquire { resource: Resource::Disk }).unwrap();
        write_message(&mut buf, &WorkerMessage::Release { resource: Resource::Disk }).unwrap();

        let mut cursor = Cursor::new(buf);
        let first: WorkerMessage = read_message(&mut cursor).unwrap();
        let second: WorkerMessage = read_message(&mut cursor).unwrap();
        assert!(matches!(first, WorkerMessage::Acquire { resource: Resource::Disk }));
        assert!(matches!(second, WorkerMessage::Release { resource: Resource::Disk }));
    }

    #[test]
    fn test_closed_stream_is_reported_as_closed() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let err = read_message::<_, WorkerMessage>(&mut cursor).unwrap_err();
        assert!(err.to_string().contains("closed"), "{err}");
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);
        let mut cursor = Cursor::new(buf);
        let err = read_message::<_, WorkerMessage>(&mut cursor).unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
    }

    #[tokio::test]
    async fn test_async_frames_interoperate_with_sync_reader() {
        let mut buf = Vec::new();
        write_message_async(&mut buf, &SupervisorMessage::Grant { resource: Resource::Inference })
            .await
            .unwrap();

        let mut cursor = Cursor::new(buf.clone());
        let decoded: SupervisorMessage = read_message(&mut cursor).unwrap();
        assert!(matches!(decoded, SupervisorMessage::Grant { resource: Resource::Inference }));

        let mut reader = buf.as_slice();
        let decoded: SupervisorMessage = read_message_async(&mut reader).await.unwrap();
        assert!(matches!(decoded, SupervisorMessage::Grant { resource: Resource::Inference }));
    }
}
