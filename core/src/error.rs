use thiserror::Error;

use crate::ble::BleError;

/// Error type shared by the stream adapter, identification and sessions.
///
/// Every multi-step operation releases what it acquired before returning
/// one of these, so an error never leaves a half-open session behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("out of memory")]
    NoMemory,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("timed out")]
    Timeout,

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Opaque status reported by the protocol engine, forwarded as is.
    #[error("device status {0}")]
    Status(i32),
}

/// What a caller can reasonably do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Retry the same call, possibly with backoff.
    Retry,
    /// Try another identification for the device.
    Reidentify,
    /// Tear down the session and connect again.
    Reconnect,
    /// Nothing to retry; report the failure.
    Abort,
}

impl BridgeError {
    pub fn invalid_arguments(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn recovery(&self) -> Recovery {
        match self {
            BridgeError::Timeout => Recovery::Retry,
            BridgeError::Unsupported(_) => Recovery::Reidentify,
            BridgeError::Io(_) => Recovery::Reconnect,
            BridgeError::InvalidArguments(_)
            | BridgeError::NoMemory
            | BridgeError::InvalidState(_)
            | BridgeError::Status(_) => Recovery::Abort,
        }
    }
}

impl From<BleError> for BridgeError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::Timeout => BridgeError::Timeout,
            BleError::Unsupported => BridgeError::Unsupported(err.to_string()),
            other => BridgeError::Io(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_display() {
        let err = BridgeError::invalid_arguments("empty address");
        assert_eq!(err.to_string(), "invalid arguments: empty address");

        let err = BridgeError::io("connect: device not found");
        assert_eq!(err.to_string(), "I/O error: connect: device not found");

        assert_eq!(BridgeError::Timeout.to_string(), "timed out");
        assert_eq!(BridgeError::Status(-7).to_string(), "device status -7");
    }

    #[test]
    fn test_recovery_classification() {
        assert_eq!(BridgeError::Timeout.recovery(), Recovery::Retry);
        assert_eq!(
            BridgeError::unsupported("no descriptor").recovery(),
            Recovery::Reidentify
        );
        assert_eq!(BridgeError::io("write").recovery(), Recovery::Reconnect);
        assert_eq!(BridgeError::NoMemory.recovery(), Recovery::Abort);
        assert_eq!(BridgeError::Status(-1).recovery(), Recovery::Abort);
    }

    #[test]
    fn test_from_ble_error() {
        assert_eq!(BridgeError::from(BleError::Timeout), BridgeError::Timeout);
        assert!(matches!(
            BridgeError::from(BleError::Unsupported),
            BridgeError::Unsupported(_)
        ));
        assert!(matches!(
            BridgeError::from(BleError::GattError),
            BridgeError::Io(_)
        ));
        assert!(matches!(
            BridgeError::from(BleError::Closed),
            BridgeError::Io(_)
        ));
    }
}
