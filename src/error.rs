#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid lifecycle state: {0:?}")]
    InvalidState(String),

    #[error("invalid device address: {0:?}")]
    InvalidAddress(String),

    #[error("scheduler is no longer running")]
    SchedulerClosed,
}

/// Failure kinds reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The address will never accept a delivery; stop tracking it.
    #[error("address is permanently invalid")]
    InvalidAddress,

    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("delivery failed: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::InvalidAddress)
    }
}
