use thiserror::Error;

/// Faults a driver implementation reports for conditions the replicator is
/// expected to ride out with its sleep-reconnect-retry discipline. Anything
/// else that comes out of the driver seam is treated as fatal.
#[derive(Debug, Error)]
pub enum DriverFault {
    /// The connection to the database dropped mid-operation.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The database rejected or aborted the operation for a reason that a
    /// fresh connection may resolve (failover, stepdown, cursor timeout).
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

/// Classification helpers on [`anyhow::Error`] for errors crossing the
/// driver seam.
pub trait FaultExt {
    /// Whether this error is a [`DriverFault`], i.e. worth one
    /// reconnect-and-retry before giving up.
    fn is_transient(&self) -> bool;
}

impl FaultExt for anyhow::Error {
    fn is_transient(&self) -> bool {
        self.chain()
            .any(|cause| cause.downcast_ref::<DriverFault>().is_some())
    }
}
