use thiserror::Error;

/// Failures surfaced by the named synchronization primitives.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    #[error("timed out waiting for the primitive")]
    Timeout,

    #[error("the holder died without releasing the lock")]
    Abandoned,

    #[error("synchronization primitive failure: {0}")]
    Os(#[from] nix::errno::Errno),
}

#[derive(Error, Debug)]
pub enum RingError {
    #[error("protocol version mismatch: expected {expected:#018x}, found {found:#018x}")]
    VersionMismatch { expected: u64, found: u64 },

    #[error("shared region is not available")]
    RegionUnavailable,

    #[error("no frame became ready within the wait budget")]
    NotReady,

    #[error("region lock was abandoned; close and reopen the session")]
    Abandoned,

    #[error("producer stopped the stream")]
    Stopped,

    #[error("publish called after stop")]
    AlreadyStopped,

    #[error("inline payload of {size} bytes exceeds slot capacity of {capacity} bytes")]
    PayloadTooLarge { size: usize, capacity: usize },

    #[error("invalid ring configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("memory mapping failed: {0}")]
    Mmap(nix::errno::Errno),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

pub type Result<T> = std::result::Result<T, RingError>;
