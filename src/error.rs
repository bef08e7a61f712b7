//! Error types shared across the control plane.

use crate::{ProjectId, SlotId};

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for control plane operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Fleet(#[from] FleetError),

    /// A control message is missing a field its type requires.
    #[error("malformed control message: {0}")]
    Malformed(String),

    /// Some fleet slots did not accept a new version.
    #[error("refresh reached {updated} slots, {failed} failed")]
    PartialRefresh { updated: usize, failed: usize },

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether redelivering the message can succeed.
    ///
    /// Integrity violations and malformed messages are permanent; they are
    /// dead-lettered instead of retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Store(error) => error.is_transient(),
            Error::Blob(error) => !matches!(error, BlobError::InvalidKey(_)),
            Error::Queue(_) => true,
            Error::Fleet(error) => !matches!(error, FleetError::InvalidDescriptor(_)),
            Error::Malformed(_) => false,
            Error::PartialRefresh { .. } => true,
            Error::Timeout(_) => true,
            Error::Other(_) => true,
        }
    }
}

/// Metadata store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A conditional write lost against a concurrent writer.
    #[error("conditional write failed: {0}")]
    Conflict(String),

    #[error("project {0} has been deleted")]
    Tombstoned(ProjectId),

    #[error("not found: {0}")]
    NotFound(String),

    /// The store holds a state that conditional writes should have prevented.
    #[error("metadata integrity violation: {0}")]
    Integrity(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Sqlite(_))
    }
}

/// Blob store errors.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    #[error("blob io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("control queue is closed")]
    Closed,

    #[error("unknown receipt handle: {0}")]
    UnknownReceipt(uuid::Uuid),

    #[error("failed to encode control message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Build fleet and query fleet errors.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// The fleet throttled the request; retry after backoff.
    #[error("fleet capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("invalid job descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("unknown fleet job: {0}")]
    UnknownJob(String),

    #[error("slot {slot} unavailable: {reason}")]
    SlotUnavailable { slot: SlotId, reason: String },

    #[error("fleet io error: {0}")]
    Io(#[from] std::io::Error),
}
