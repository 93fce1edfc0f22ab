use std::fmt::Display;

use crate::slot::SlotOffset;

/// A specialized error type for pagelog operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PagelogError {
    /// An I/O error occurred on the underlying log device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Grant reservation failed and the caller declined to wait.
    #[error("log space exhausted")]
    NoSpace,
    /// A suspending operation observed a lifecycle halt.
    #[error("operation cancelled")]
    Cancelled,
    /// The recycler was stopped while an operation was in flight.
    #[error("recycler stopped")]
    RecyclerStopped,
    /// WAL replay found a malformed or inconsistent record.
    #[error("corrupted slot: {0}")]
    Corruption(String),
    /// A read was requested below the trim floor.
    #[error("stale read below slot {0}")]
    StaleRead(SlotOffset),
    /// Page deletion failed after exhausting the retry budget.
    #[error("page delete failed: {0}")]
    PageDeleteFailed(String),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A slot sequencer upstream of this append resolved with an error.
    #[error("sequencer error: {0}")]
    Sequencer(String),
    /// The log device was closed.
    #[error("log device closed")]
    DeviceClosed,
}

impl PagelogError {
    /// Create a corruption error from a displayable value.
    pub fn corruption<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Corruption(msg.to_string())
    }

    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a page-delete failure from a displayable value.
    pub fn page_delete_failed<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::PageDeleteFailed(msg.to_string())
    }

    /// True for the statuses produced by a cooperative shutdown.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Cancelled | Self::RecyclerStopped)
    }
}

/// A Result type alias for pagelog operations.
pub type PagelogResult<T> = Result<T, PagelogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_helper() {
        let err = PagelogError::corruption("bad tag");
        assert!(matches!(err, PagelogError::Corruption(msg) if msg == "bad tag"));
    }

    #[test]
    fn shutdown_statuses() {
        assert!(PagelogError::Cancelled.is_shutdown());
        assert!(PagelogError::RecyclerStopped.is_shutdown());
        assert!(!PagelogError::NoSpace.is_shutdown());
    }
}
