use crate::core::handles::StreamHandle;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("time mapping not established")]
    MappingNotEstablished,

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("operation requires a specific stream, not the whole playback")]
    InvalidScope,

    #[error("unknown stream handle {0:?}")]
    UnknownStream(StreamHandle),

    #[error("clock recovery not initialized")]
    ClockRecoveryNotInitialized,

    #[error("coordinator error: {0}")]
    Coordinator(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Outcome of a decode-window wait. Abandonment is not an error: it tells
/// the caller its deadline was invalidated and should be re-planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The wait ran to its deadline (or no wait was needed).
    Completed,
    /// The wait was cancelled by a speed change or mapping reset.
    Abandoned,
}

/// Edge-triggered answer from
/// [`mapping_base_adjustment_applied`](crate::core::OutputCoordinator::mapping_base_adjustment_applied).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingBaseAdjustment {
    Unchanged,
    /// The stream's base was shifted by another party since last asked.
    Adjusted,
}

/// Progress of the vsync offset measurement window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VsyncMonitorState {
    /// Still settling or accumulating samples.
    Accumulating,
    /// The window completed (now or previously); the offset has been
    /// measured and, unless vsync-locked, applied.
    Complete,
}
