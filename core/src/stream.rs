//! Blocking byte stream over a BLE link.
//!
//! Protocol engines drive every transport through [`Stream`]. BLE delivers
//! data as small notifications that do not line up with protocol frames, so
//! [`BleStream::read`] returns whatever has arrived (up to the requested
//! size) and leaves frame reassembly to the engine.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::ble::{AbortHandle, BleConnector, BleTransport};
use crate::catalog::Transports;
use crate::config::BridgeConfig;
use crate::error::BridgeError;

pub const IOCTL_DIR_NONE: u32 = 0;
pub const IOCTL_DIR_READ: u32 = 1;
pub const IOCTL_DIR_WRITE: u32 = 2;
pub const IOCTL_SIZE_VARIABLE: u32 = 0;

/// Encodes an ioctl request the way libdivecomputer does:
/// direction, payload size, type character and number.
pub const fn ioctl_code(dir: u32, kind: u8, nr: u8, size: u32) -> u32 {
    (dir << 30) | (size << 16) | ((kind as u32) << 8) | nr as u32
}

pub const IOCTL_BLE_GET_NAME: u32 = ioctl_code(IOCTL_DIR_READ, b'b', 0, IOCTL_SIZE_VARIABLE);
pub const IOCTL_BLE_GET_PINCODE: u32 = ioctl_code(IOCTL_DIR_READ, b'b', 1, IOCTL_SIZE_VARIABLE);
pub const IOCTL_BLE_GET_ACCESSCODE: u32 = ioctl_code(IOCTL_DIR_READ, b'b', 2, IOCTL_SIZE_VARIABLE);
pub const IOCTL_BLE_SET_ACCESSCODE: u32 = ioctl_code(IOCTL_DIR_WRITE, b'b', 2, IOCTL_SIZE_VARIABLE);

/// The blocking stream contract protocol engines are written against.
pub trait Stream: Send {
    /// Transport tag, so engines can apply transport specific framing.
    fn transport(&self) -> Transports;

    /// Deadline for later reads and writes. `0` selects the transport
    /// default; negative values are rejected.
    fn set_timeout(&mut self, timeout_ms: i32) -> Result<(), BridgeError>;

    /// Reads at least one byte unless the timeout elapses first.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BridgeError>;

    fn write(&mut self, data: &[u8]) -> Result<usize, BridgeError>;

    fn ioctl(&mut self, request: u32, data: &mut [u8]) -> Result<usize, BridgeError>;

    fn sleep(&mut self, milliseconds: u32) -> Result<(), BridgeError>;

    fn close(&mut self) -> Result<(), BridgeError>;
}

/// Stream handle shared between a session and the device it opened.
pub type SharedStream = Arc<Mutex<dyn Stream>>;

/// Abandons a stream's current and future operations from another thread.
///
/// Cancelling never takes the stream lock. A read blocked in the transport
/// is woken through the transport's [`AbortHandle`]; every later operation
/// fails with an I/O error.
#[derive(Clone)]
pub struct Canceller {
    state: Arc<CancelState>,
}

struct CancelState {
    cancelled: AtomicBool,
    abort: Option<AbortHandle>,
}

impl Canceller {
    fn new(abort: Option<AbortHandle>) -> Self {
        Self {
            state: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                abort,
            }),
        }
    }

    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("stream cancelled");
        if let Some(abort) = &self.state.abort {
            abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), BridgeError> {
        if self.is_cancelled() {
            return Err(BridgeError::io("operation cancelled"));
        }
        Ok(())
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller")
            .field("cancelled", &self.is_cancelled())
            .field("abortable", &self.state.abort.is_some())
            .finish()
    }
}

/// [`Stream`] implementation on top of a [`BleTransport`].
pub struct BleStream {
    transport: Option<Box<dyn BleTransport>>,
    canceller: Canceller,
    timeout: Option<Duration>,
    default_timeout: Duration,
    /// Bytes a transport delivered beyond what the last read asked for.
    pending: VecDeque<u8>,
}

impl BleStream {
    /// Creates a transport, connects it to `address` and enables
    /// notifications. A failure at any step closes the transport again.
    pub fn open(
        connector: &dyn BleConnector,
        address: &str,
        config: &BridgeConfig,
    ) -> Result<Self, BridgeError> {
        if address.is_empty() {
            return Err(BridgeError::invalid_arguments("empty device address"));
        }

        let transport = connector.create().map_err(|err| {
            warn!(%err, "failed to create BLE transport");
            BridgeError::NoMemory
        })?;
        let mut stream = Self::new(transport, config.default_timeout);
        let transport = stream.transport_mut()?;

        if config.scan_before_connect {
            transport
                .start_scan()
                .map_err(|err| BridgeError::io(format!("scan: {err}")))?;
        }
        let connected = transport.connect(address);
        if config.scan_before_connect {
            transport.stop_scan();
        }
        connected.map_err(|err| BridgeError::io(format!("connect to {address}: {err}")))?;

        transport
            .discover_services()
            .map_err(|err| BridgeError::io(format!("discover services: {err}")))?;
        transport
            .enable_notifications()
            .map_err(|err| BridgeError::io(format!("enable notifications: {err}")))?;

        debug!(address, "BLE stream open");
        Ok(stream)
    }

    /// Wraps an already connected transport.
    pub fn new(transport: Box<dyn BleTransport>, default_timeout: Duration) -> Self {
        let canceller = Canceller::new(transport.abort_handle());
        Self {
            transport: Some(transport),
            canceller,
            timeout: None,
            default_timeout,
            pending: VecDeque::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Deadline the next read or write will use.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(self.default_timeout)
    }

    fn transport_mut(&mut self) -> Result<&mut (dyn BleTransport + 'static), BridgeError> {
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or_else(|| BridgeError::invalid_state("stream is closed"))?;
        self.canceller.check()?;
        Ok(transport)
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

impl Stream for BleStream {
    fn transport(&self) -> Transports {
        Transports::BLE
    }

    fn set_timeout(&mut self, timeout_ms: i32) -> Result<(), BridgeError> {
        self.transport_mut()?;
        self.timeout = match timeout_ms {
            t if t < 0 => {
                return Err(BridgeError::invalid_arguments(format!(
                    "negative timeout {t} ms"
                )))
            }
            0 => None,
            t => Some(Duration::from_millis(t as u64)),
        };
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BridgeError> {
        self.transport_mut()?;
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.pending.is_empty() {
            let n = self.drain_pending(buf);
            trace!(data = %HexDump(&buf[..n]), "read (buffered)");
            return Ok(n);
        }

        let timeout = self.effective_timeout();
        let chunk = self.transport_mut()?.read_partial(buf.len(), timeout);
        self.canceller.check()?;
        let chunk = chunk?;
        if chunk.is_empty() {
            return Err(BridgeError::Timeout);
        }

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if chunk.len() > n {
            self.pending.extend(&chunk[n..]);
        }
        trace!(requested = buf.len(), data = %HexDump(&buf[..n]), "read");
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, BridgeError> {
        let transport = self.transport_mut()?;
        if data.is_empty() {
            return Ok(0);
        }
        trace!(data = %HexDump(data), "write");
        let accepted = transport.write(data);
        self.canceller.check()?;
        let accepted = accepted?;
        if accepted < data.len() {
            return Err(BridgeError::io(format!(
                "short write: {accepted} of {} bytes accepted",
                data.len()
            )));
        }
        Ok(accepted)
    }

    fn ioctl(&mut self, request: u32, data: &mut [u8]) -> Result<usize, BridgeError> {
        let transport = self.transport_mut()?;
        transport.ioctl(request, data).map_err(|err| match err {
            crate::ble::BleError::Unsupported => {
                BridgeError::unsupported(format!("ioctl {request:#010x}"))
            }
            other => other.into(),
        })
    }

    fn sleep(&mut self, milliseconds: u32) -> Result<(), BridgeError> {
        self.transport_mut()?
            .sleep(Duration::from_millis(u64::from(milliseconds)));
        Ok(())
    }

    fn close(&mut self) -> Result<(), BridgeError> {
        let mut transport = self
            .transport
            .take()
            .ok_or_else(|| BridgeError::invalid_state("stream already closed"))?;
        self.pending.clear();
        debug!("closing BLE stream");
        transport
            .close()
            .map_err(|err| BridgeError::io(format!("close: {err}")))
    }
}

impl Drop for BleStream {
    fn drop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = transport.close() {
                warn!(%err, "failed to close BLE transport on drop");
            }
        }
    }
}

impl fmt::Debug for BleStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleStream")
            .field("closed", &self.is_closed())
            .field("timeout", &self.effective_timeout())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Space separated uppercase hex, for trace output.
pub(crate) struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::BleError;
    use crate::ble_mock::{MockCall, MockConnector, MockFailures};

    fn open_stream(connector: &MockConnector) -> BleStream {
        BleStream::open(connector, "AA:BB:CC:DD:EE:FF", &BridgeConfig::default()).unwrap()
    }

    #[test]
    fn test_open_runs_transport_setup_in_order() {
        let connector = MockConnector::new();
        let _stream = open_stream(&connector);
        assert_eq!(
            connector.calls(),
            vec![
                MockCall::Create,
                MockCall::StartScan,
                MockCall::Connect("AA:BB:CC:DD:EE:FF".to_string()),
                MockCall::StopScan,
                MockCall::DiscoverServices,
                MockCall::EnableNotifications,
            ]
        );
    }

    #[test]
    fn test_open_without_scan() {
        let connector = MockConnector::new();
        let config = BridgeConfig::default().with_scan_before_connect(false);
        let _stream = BleStream::open(&connector, "addr", &config).unwrap();
        assert!(!connector.calls().contains(&MockCall::StartScan));
    }

    #[test]
    fn test_open_rejects_empty_address() {
        let connector = MockConnector::new();
        let err = BleStream::open(&connector, "", &BridgeConfig::default()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArguments(_)));
        assert!(connector.calls().is_empty());
    }

    #[test]
    fn test_open_create_failure_is_no_memory() {
        let connector = MockConnector::new().with_failures(MockFailures {
            create: true,
            ..Default::default()
        });
        let err = BleStream::open(&connector, "addr", &BridgeConfig::default()).unwrap_err();
        assert_eq!(err, BridgeError::NoMemory);
    }

    #[test]
    fn test_open_connect_failure_is_io_and_closes_transport() {
        let connector = MockConnector::new().with_failures(MockFailures {
            connect: true,
            ..Default::default()
        });
        let err = BleStream::open(&connector, "addr", &BridgeConfig::default()).unwrap_err();
        assert!(matches!(err, BridgeError::Io(ref msg) if msg.starts_with("connect")));
        let calls = connector.calls();
        assert_eq!(calls.last(), Some(&MockCall::Close));
        assert!(!calls.contains(&MockCall::DiscoverServices));
    }

    #[test]
    fn test_open_notification_failure_is_io() {
        let connector = MockConnector::new().with_failures(MockFailures {
            enable_notifications: true,
            ..Default::default()
        });
        let err = BleStream::open(&connector, "addr", &BridgeConfig::default()).unwrap_err();
        assert!(matches!(err, BridgeError::Io(ref msg) if msg.contains("notifications")));
        assert_eq!(connector.calls().last(), Some(&MockCall::Close));
    }

    #[test]
    fn test_open_discover_failure_is_io() {
        let connector = MockConnector::new().with_failures(MockFailures {
            discover_services: true,
            ..Default::default()
        });
        let err = BleStream::open(&connector, "addr", &BridgeConfig::default()).unwrap_err();
        assert!(matches!(err, BridgeError::Io(ref msg) if msg.starts_with("discover services")));
        let calls = connector.calls();
        assert_eq!(calls.last(), Some(&MockCall::Close));
        assert!(!calls.contains(&MockCall::EnableNotifications));
    }

    #[test]
    fn test_partial_read_returns_actual_count() {
        let connector = MockConnector::new();
        let mut stream = open_stream(&connector);
        connector.notify(&[0x01, 0xFF, 0x05]);

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..n], &[0x01, 0xFF, 0x05]);
    }

    #[test]
    fn test_read_without_data_times_out() {
        let connector = MockConnector::new();
        let mut stream = open_stream(&connector);
        stream.set_timeout(10).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf), Err(BridgeError::Timeout));
    }

    #[test]
    fn test_read_empty_buffer_skips_transport() {
        let connector = MockConnector::new();
        let mut stream = open_stream(&connector);
        let before = connector.calls().len();
        assert_eq!(stream.read(&mut []), Ok(0));
        assert_eq!(connector.calls().len(), before);
    }

    #[test]
    fn test_oversized_chunk_is_kept_for_next_read() {
        let connector = MockConnector::new().with_failures(MockFailures {
            ignore_read_limit: true,
            ..Default::default()
        });
        let mut stream = open_stream(&connector);
        connector.notify(&[1, 2, 3, 4, 5]);

        let mut buf = [0u8; 2];
        assert_eq!(stream.read(&mut buf), Ok(2));
        assert_eq!(buf, [1, 2]);
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf), Ok(3));
        assert_eq!(&buf[..3], &[3, 4, 5]);
    }

    #[test]
    fn test_set_timeout_semantics() {
        let connector = MockConnector::new();
        let mut stream = open_stream(&connector);

        assert!(matches!(
            stream.set_timeout(-1),
            Err(BridgeError::InvalidArguments(_))
        ));

        stream.set_timeout(250).unwrap();
        assert_eq!(stream.effective_timeout(), Duration::from_millis(250));

        stream.set_timeout(0).unwrap();
        assert_eq!(
            stream.effective_timeout(),
            BridgeConfig::default().default_timeout
        );
    }

    #[test]
    fn test_read_passes_timeout_to_transport() {
        let connector = MockConnector::new();
        let mut stream = open_stream(&connector);
        stream.set_timeout(15).unwrap();
        let _ = stream.read(&mut [0u8; 4]);
        assert!(connector.calls().contains(&MockCall::Read {
            max_len: 4,
            timeout: Duration::from_millis(15),
        }));
    }

    #[test]
    fn test_write_returns_accepted() {
        let connector = MockConnector::new();
        let mut stream = open_stream(&connector);
        assert_eq!(stream.write(&[0xFF, 0x01, 0x02]), Ok(3));
        assert_eq!(connector.written(), vec![0xFF, 0x01, 0x02]);
    }

    #[test]
    fn test_short_write_is_an_error() {
        let connector = MockConnector::new().with_failures(MockFailures {
            write_limit: Some(2),
            ..Default::default()
        });
        let mut stream = open_stream(&connector);
        let err = stream.write(&[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, BridgeError::Io(ref msg) if msg.contains("2 of 4")));
    }

    #[test]
    fn test_ioctl_unsupported_is_explicit() {
        let connector = MockConnector::new();
        let mut stream = open_stream(&connector);
        let mut data = [0u8; 32];
        let err = stream.ioctl(IOCTL_BLE_GET_PINCODE, &mut data).unwrap_err();
        assert!(matches!(err, BridgeError::Unsupported(_)));
    }

    #[test]
    fn test_ioctl_passthrough() {
        let connector = MockConnector::new().with_name("Perdix 2");
        let mut stream = open_stream(&connector);
        let mut data = [0u8; 32];
        let n = stream.ioctl(IOCTL_BLE_GET_NAME, &mut data).unwrap();
        assert_eq!(&data[..n], b"Perdix 2\0");
        assert!(connector.calls().contains(&MockCall::Ioctl(IOCTL_BLE_GET_NAME)));
    }

    #[test]
    fn test_ioctl_codes() {
        assert_eq!(IOCTL_BLE_GET_NAME, 0x4000_6200);
        assert_eq!(IOCTL_BLE_GET_PINCODE, 0x4000_6201);
        assert_eq!(IOCTL_BLE_GET_ACCESSCODE, 0x4000_6202);
        assert_eq!(IOCTL_BLE_SET_ACCESSCODE, 0x8000_6202);
    }

    #[test]
    fn test_sleep_delegates() {
        let connector = MockConnector::new();
        let mut stream = open_stream(&connector);
        stream.sleep(5).unwrap();
        assert!(connector
            .calls()
            .contains(&MockCall::Sleep(Duration::from_millis(5))));
    }

    #[test]
    fn test_close_twice_is_invalid_state() {
        let connector = MockConnector::new();
        let mut stream = open_stream(&connector);
        stream.close().unwrap();
        assert!(stream.is_closed());
        assert!(matches!(stream.close(), Err(BridgeError::InvalidState(_))));
        assert!(matches!(
            stream.read(&mut [0u8; 4]),
            Err(BridgeError::InvalidState(_))
        ));
        assert!(matches!(
            stream.write(&[1]),
            Err(BridgeError::InvalidState(_))
        ));
        assert!(matches!(
            stream.set_timeout(10),
            Err(BridgeError::InvalidState(_))
        ));
        let closes = connector
            .calls()
            .iter()
            .filter(|c| **c == MockCall::Close)
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_drop_closes_transport() {
        let connector = MockConnector::new();
        drop(open_stream(&connector));
        assert_eq!(connector.calls().last(), Some(&MockCall::Close));
    }

    #[test]
    fn test_transport_error_on_read_is_io() {
        let connector = MockConnector::new();
        let mut stream = open_stream(&connector);
        connector.disconnect();
        let err = stream.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err, BridgeError::from(BleError::Closed));
    }

    #[test]
    fn test_cancel_fails_later_operations() {
        let connector = MockConnector::new();
        let mut stream = open_stream(&connector);
        connector.notify(&[1, 2]);
        stream.canceller().cancel();

        let before = connector.calls().len();
        assert!(matches!(stream.read(&mut [0u8; 4]), Err(BridgeError::Io(_))));
        assert!(matches!(stream.write(&[1]), Err(BridgeError::Io(_))));
        assert_eq!(connector.calls().len(), before);
        // Closing a cancelled stream still releases the transport.
        stream.close().unwrap();
        assert_eq!(connector.calls().last(), Some(&MockCall::Close));
    }

    #[test]
    fn test_cancel_unblocks_pending_read() {
        let connector = MockConnector::new();
        let mut stream = open_stream(&connector);
        stream.set_timeout(10_000).unwrap();
        let canceller = stream.canceller();
        let cancelling = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            canceller.cancel();
        });

        let start = std::time::Instant::now();
        let err = stream.read(&mut [0u8; 4]).unwrap_err();
        cancelling.join().unwrap();
        assert!(matches!(err, BridgeError::Io(_)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(stream.canceller().is_cancelled());
    }

    #[test]
    fn test_hexdump() {
        assert_eq!(HexDump(&[0x01, 0xAB, 0x00]).to_string(), "01 AB 00");
        assert_eq!(HexDump(&[]).to_string(), "");
    }
}
