use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::ble::{AbortHandle, BleConnector, BleError, BleTransport};
use crate::notify::NotificationQueue;
use crate::stream::IOCTL_BLE_GET_NAME;

/// Transport primitive invocations recorded by the mock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCall {
    Create,
    StartScan,
    StopScan,
    Connect(String),
    DiscoverServices,
    EnableNotifications,
    Write(Vec<u8>),
    Read { max_len: usize, timeout: Duration },
    Ioctl(u32),
    Sleep(Duration),
    Close,
}

/// Steps the mock should fail, and transport quirks to imitate.
#[derive(Clone, Debug, Default)]
pub struct MockFailures {
    pub create: bool,
    pub connect: bool,
    pub discover_services: bool,
    pub enable_notifications: bool,
    /// Accept at most this many bytes per write.
    pub write_limit: Option<usize>,
    /// Return every buffered byte from a read, ignoring `max_len`.
    pub ignore_read_limit: bool,
}

#[derive(Debug, Default)]
struct MockShared {
    calls: Mutex<Vec<MockCall>>,
    written: Mutex<Vec<u8>>,
    queue: NotificationQueue,
}

impl MockShared {
    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }
}

/// Connector handing out [`MockBleTransport`]s that share one call log and
/// one notification queue.
#[derive(Clone, Debug, Default)]
pub struct MockConnector {
    shared: Arc<MockShared>,
    failures: MockFailures,
    name: Option<String>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failures(mut self, failures: MockFailures) -> Self {
        self.failures = failures;
        self
    }

    /// Name reported through the `IOCTL_BLE_GET_NAME` request.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Delivers a notification as the peripheral would.
    pub fn notify(&self, payload: &[u8]) {
        self.shared.queue.push(payload);
    }

    /// Drops the link from the peripheral side.
    pub fn disconnect(&self) {
        self.shared.queue.close();
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.shared.calls.lock().clone()
    }

    pub fn written(&self) -> Vec<u8> {
        self.shared.written.lock().clone()
    }

    pub fn count(&self, call: &MockCall) -> usize {
        self.shared.calls.lock().iter().filter(|c| *c == call).count()
    }
}

impl BleConnector for MockConnector {
    fn create(&self) -> Result<Box<dyn BleTransport>, BleError> {
        self.shared.record(MockCall::Create);
        if self.failures.create {
            return Err(BleError::Unknown);
        }
        Ok(Box::new(MockBleTransport {
            shared: Arc::clone(&self.shared),
            failures: self.failures.clone(),
            name: self.name.clone(),
            connected: false,
        }))
    }
}

#[derive(Debug)]
pub struct MockBleTransport {
    shared: Arc<MockShared>,
    failures: MockFailures,
    name: Option<String>,
    connected: bool,
}

impl BleTransport for MockBleTransport {
    fn start_scan(&mut self) -> Result<(), BleError> {
        self.shared.record(MockCall::StartScan);
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.shared.record(MockCall::StopScan);
    }

    fn connect(&mut self, address: &str) -> Result<(), BleError> {
        self.shared.record(MockCall::Connect(address.to_string()));
        if self.failures.connect {
            return Err(BleError::DeviceNotFound);
        }
        self.connected = true;
        Ok(())
    }

    fn discover_services(&mut self) -> Result<(), BleError> {
        self.shared.record(MockCall::DiscoverServices);
        if self.failures.discover_services {
            return Err(BleError::GattError);
        }
        Ok(())
    }

    fn enable_notifications(&mut self) -> Result<(), BleError> {
        self.shared.record(MockCall::EnableNotifications);
        if self.failures.enable_notifications {
            return Err(BleError::GattError);
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, BleError> {
        self.shared.record(MockCall::Write(data.to_vec()));
        if !self.connected {
            return Err(BleError::ConnectionFailed);
        }
        let accepted = self
            .failures
            .write_limit
            .map_or(data.len(), |limit| limit.min(data.len()));
        self.shared.written.lock().extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn read_partial(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, BleError> {
        self.shared.record(MockCall::Read { max_len, timeout });
        let max_len = if self.failures.ignore_read_limit {
            usize::MAX
        } else {
            max_len
        };
        self.shared.queue.pop(max_len, timeout)
    }

    fn ioctl(&mut self, request: u32, data: &mut [u8]) -> Result<usize, BleError> {
        self.shared.record(MockCall::Ioctl(request));
        match (request, &self.name) {
            (IOCTL_BLE_GET_NAME, Some(name)) => {
                let bytes = name.as_bytes();
                if bytes.len() + 1 > data.len() {
                    return Err(BleError::Unknown);
                }
                data[..bytes.len()].copy_from_slice(bytes);
                data[bytes.len()] = 0;
                Ok(bytes.len() + 1)
            }
            _ => Err(BleError::Unsupported),
        }
    }

    fn sleep(&mut self, duration: Duration) {
        self.shared.record(MockCall::Sleep(duration));
    }

    fn close(&mut self) -> Result<(), BleError> {
        self.shared.record(MockCall::Close);
        self.connected = false;
        Ok(())
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let shared = Arc::clone(&self.shared);
        Some(Arc::new(move || shared.queue.close()))
    }
}
