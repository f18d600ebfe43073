//! Transport primitives supplied by the platform BLE stack.
//!
//! The platform layer (CoreBluetooth, BlueZ, Android) implements
//! [`BleTransport`] for one peripheral link and [`BleConnector`] to create
//! them. Calls are blocking: any asynchronous notification delivery must be
//! hidden behind [`BleTransport::read_partial`], typically with a
//! [`NotificationQueue`](crate::notify::NotificationQueue).

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum BleError {
    #[error("bluetooth permission denied")]
    PermissionDenied,
    #[error("bluetooth is off")]
    BluetoothOff,
    #[error("device not found")]
    DeviceNotFound,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("GATT error")]
    GattError,
    #[error("operation timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation not supported by transport")]
    Unsupported,
    #[error("connection closed")]
    Closed,
    #[error("unknown BLE failure")]
    Unknown,
}

/// Fails the blocked call of one transport from any thread.
pub type AbortHandle = Arc<dyn Fn() + Send + Sync>;

/// One physical BLE link to a peripheral.
pub trait BleTransport: Send {
    /// Makes peripherals visible so that [`connect`](Self::connect) can find
    /// them by address or identifier.
    fn start_scan(&mut self) -> Result<(), BleError> {
        Ok(())
    }

    fn stop_scan(&mut self) {}

    fn connect(&mut self, address: &str) -> Result<(), BleError>;
    fn discover_services(&mut self) -> Result<(), BleError>;
    fn enable_notifications(&mut self) -> Result<(), BleError>;

    /// Hands `data` to the transport, returning the number of bytes accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, BleError>;

    /// Returns whatever notification bytes have arrived, at most `max_len`,
    /// waiting up to `timeout` for the first one. An empty vector means
    /// nothing arrived in time.
    fn read_partial(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, BleError>;

    /// Device specific control request. `data` is both input and output.
    fn ioctl(&mut self, _request: u32, _data: &mut [u8]) -> Result<usize, BleError> {
        Err(BleError::Unsupported)
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn close(&mut self) -> Result<(), BleError>;

    /// Handle that makes a pending [`read_partial`](Self::read_partial)
    /// return an error without waiting for its timeout. Must not need
    /// access to the transport itself. Without one, cancellation takes
    /// effect at the next call.
    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }
}

/// Creates unconnected transports, one per stream.
pub trait BleConnector: Send + Sync {
    fn create(&self) -> Result<Box<dyn BleTransport>, BleError>;
}
