use thiserror::Error;

use crate::common::{PeripheralId, RadioState};
use crate::pending::OperationKey;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure a caller can observe. Delivered through the same completion
/// sink as the success value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("radio is not ready (state: {state:?})")]
    RadioNotReady { state: RadioState },

    #[error("unknown peripheral {0}")]
    UnknownPeripheral(PeripheralId),

    #[error("peripheral {0} is not connected")]
    NotConnected(PeripheralId),

    #[error("a connection attempt to {0} is already in progress")]
    ConnectInProgress(PeripheralId),

    #[error("a disconnect from {0} is still outstanding")]
    DisconnectInProgress(PeripheralId),

    #[error("peripheral {0} is still connected")]
    StillConnected(PeripheralId),

    #[error("operation {0} is already pending")]
    DuplicateOperation(OperationKey),

    #[error("peripheral {0} disconnected")]
    PeripheralDisconnected(PeripheralId),

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("disconnect failed: {0}")]
    DisconnectFailed(String),

    #[error("discovery failed: {0}")]
    DiscoveryError(String),

    #[error("read failed: {0}")]
    ReadError(String),

    #[error("write failed: {0}")]
    WriteError(String),

    #[error("notification update failed: {0}")]
    NotifyError(String),

    #[error("radio refused the command: {0}")]
    Radio(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation was abandoned")]
    Abandoned,

    #[error("session is closed")]
    SessionClosed,

    #[error("unexpected completion for {0}")]
    UnexpectedCompletion(&'static str),
}

#[cfg(feature = "btleplug")]
impl From<btleplug::Error> for Error {
    fn from(e: btleplug::Error) -> Self {
        Error::Radio(e.to_string())
    }
}
