//! Error taxonomy for the session/queue/texture data path (spec §7).
//!
//! The policy split that matters to callers is transient vs. fatal:
//! transient errors are expected during host (re)initialization and are
//! handled by retry loops; fatal errors mean the shared region or the
//! client's view of it is no longer trustworthy and the caller should tear
//! down.

/// Errors produced by the session, queue, frame and texture layers.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Header magic did not match the expected sentinel.
    #[error("shared region magic mismatch")]
    InvalidMagic,

    /// Session id in the header is zero/unset, or has changed since it was
    /// snapshotted.
    #[error("shared region session is invalid")]
    InvalidSession,

    /// Header version does not match what this client implements.
    #[error("shared region version mismatch: host={host}, client={client}")]
    VersionMismatch {
        /// Version advertised by the host header.
        host: u32,
        /// Version this client implements.
        client: u32,
    },

    /// Queue descriptor at the requested id is not active.
    #[error("no such queue: {0}")]
    NoSuchQueue(u32),

    /// `process` found producer index == consumer index.
    #[error("queue is empty")]
    QueueEmpty,

    /// A length/offset pair in the region failed bounds validation.
    #[error("shared region corrupt: {0}")]
    Corrupt(&'static str),

    /// Frame descriptor named a pixel format this client doesn't implement.
    #[error("unsupported frame type: {0}")]
    UnsupportedFrameType(u32),

    /// GPU buffer mapping failed during texture setup.
    #[error("texture PBO map failed")]
    TexMapFailed,

    /// `glClientWaitSync`-equivalent returned a failure status.
    #[error("fence wait failed")]
    FenceWaitFailed,

    /// Host heartbeat has not advanced within the configured threshold.
    #[error("host heartbeat stalled")]
    HostStall,
}

impl VmError {
    /// True for errors that a retry loop should absorb (§7): the condition
    /// is expected to clear once the host finishes (re)initializing or
    /// produces more data. False for errors that indicate a corrupt or
    /// incompatible region, which the caller must treat as fatal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VmError::InvalidMagic
                | VmError::InvalidSession
                | VmError::NoSuchQueue(_)
                | VmError::QueueEmpty
        )
    }
}

pub type VmResult<T> = Result<T, VmError>;
