//! Seam to the vendor protocol engine.
//!
//! The engine opens a [`Device`] on a [`SharedStream`] for a resolved
//! descriptor. While it runs protocol operations it reports events to the
//! registered [`EventSink`] synchronously, on its own call stack.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use tracing::{debug, info_span, Span};

use crate::catalog::Descriptor;
use crate::error::BridgeError;
use crate::stream::SharedStream;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        const WAITING = 1 << 0;
        const PROGRESS = 1 << 1;
        const DEVINFO = 1 << 2;
        const CLOCK = 1 << 3;
        const VENDOR = 1 << 4;
    }
}

/// Identity a device reports once the engine has talked to it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DevInfo {
    pub model: u32,
    pub firmware: u32,
    pub serial: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub current: u32,
    pub maximum: u32,
}

/// Device clock paired with the host clock at the same instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Clock {
    pub devtime: u32,
    pub systime: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Waiting,
    Progress(Progress),
    DevInfo(DevInfo),
    Clock(Clock),
    Vendor(Vec<u8>),
}

impl DeviceEvent {
    pub fn kind(&self) -> EventMask {
        match self {
            DeviceEvent::Waiting => EventMask::WAITING,
            DeviceEvent::Progress(_) => EventMask::PROGRESS,
            DeviceEvent::DevInfo(_) => EventMask::DEVINFO,
            DeviceEvent::Clock(_) => EventMask::CLOCK,
            DeviceEvent::Vendor(_) => EventMask::VENDOR,
        }
    }
}

/// Observer for device events. Called reentrantly from inside a protocol
/// operation; `device` is the handle that raised the event.
pub trait EventSink: Send {
    fn on_event(&mut self, device: &mut dyn Device, event: &DeviceEvent);
}

/// Dive callback: raw dive bytes and that dive's fingerprint. Return
/// `false` to stop the enumeration.
pub type DiveCallback<'a> = dyn FnMut(&[u8], &[u8]) -> bool + 'a;

/// An open device handle owned by the protocol engine.
pub trait Device: Send {
    /// Enumeration stops at the dive with this fingerprint.
    fn set_fingerprint(&mut self, fingerprint: &[u8]) -> Result<(), BridgeError>;

    fn set_events(
        &mut self,
        events: EventMask,
        sink: Box<dyn EventSink>,
    ) -> Result<(), BridgeError>;

    /// Downloads dives, newest first.
    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<(), BridgeError>;

    fn close(&mut self) -> Result<(), BridgeError>;
}

/// Decoder for one downloaded dive.
pub trait Parser: Send {
    /// Dive bytes the parser was created over.
    fn data(&self) -> &[u8];
}

pub trait ProtocolEngine: Send + Sync {
    /// Opens the device `descriptor` describes over `stream`. Errors are
    /// handed to the caller unchanged.
    fn open(
        &self,
        context: &Context,
        descriptor: &Descriptor,
        stream: SharedStream,
    ) -> Result<Box<dyn Device>, BridgeError>;

    /// Creates a parser for dive `data` as produced by the `descriptor`
    /// model. Engines that only download keep the default.
    fn parser(
        &self,
        _context: &Context,
        descriptor: &Descriptor,
        _data: &[u8],
    ) -> Result<Box<dyn Parser>, BridgeError> {
        Err(BridgeError::unsupported(format!(
            "no parser for {}",
            descriptor.label()
        )))
    }
}

/// Per-session engine context: an id and the tracing span the engine should
/// log under.
#[derive(Debug)]
pub struct Context {
    id: u64,
    span: Span,
}

fn next_context_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

impl Context {
    pub fn new(address: &str) -> Self {
        let id = next_context_id();
        let span = info_span!("session", id, address);
        debug!(parent: &span, "context created");
        Self { id, span }
    }

    /// Context with no connection behind it, for parsing stored dives.
    pub fn detached() -> Self {
        let id = next_context_id();
        let span = info_span!("parser", id);
        debug!(parent: &span, "context created");
        Self { id, span }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        debug!(parent: &self.span, "context released");
    }
}

/// Owning wrapper that closes the device when dropped.
pub(crate) struct DeviceHandle {
    device: Option<Box<dyn Device>>,
}

impl DeviceHandle {
    pub fn new(device: Box<dyn Device>) -> Self {
        Self {
            device: Some(device),
        }
    }

    pub fn get_mut(&mut self) -> Result<&mut (dyn Device + 'static), BridgeError> {
        self.device
            .as_deref_mut()
            .ok_or_else(|| BridgeError::invalid_state("device is closed"))
    }

    pub fn close(&mut self) -> Result<(), BridgeError> {
        match self.device.take() {
            Some(mut device) => device.close(),
            None => Err(BridgeError::invalid_state("device already closed")),
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Some(mut device) = self.device.take() {
            if let Err(err) = device.close() {
                tracing::warn!(%err, "failed to close device on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind() {
        assert_eq!(DeviceEvent::Waiting.kind(), EventMask::WAITING);
        assert_eq!(
            DeviceEvent::DevInfo(DevInfo::default()).kind(),
            EventMask::DEVINFO
        );
        assert_eq!(
            DeviceEvent::Progress(Progress::default()).kind(),
            EventMask::PROGRESS
        );
        assert_eq!(DeviceEvent::Clock(Clock::default()).kind(), EventMask::CLOCK);
        assert_eq!(DeviceEvent::Vendor(vec![1]).kind(), EventMask::VENDOR);
    }

    #[test]
    fn test_context_ids_are_unique() {
        let a = Context::new("addr-a");
        let b = Context::new("addr-b");
        let c = Context::detached();
        assert_ne!(a.id(), b.id());
        assert_ne!(b.id(), c.id());
    }

    struct CountingDevice {
        closes: std::sync::Arc<AtomicU64>,
    }

    impl Device for CountingDevice {
        fn set_fingerprint(&mut self, _fingerprint: &[u8]) -> Result<(), BridgeError> {
            Ok(())
        }

        fn set_events(
            &mut self,
            _events: EventMask,
            _sink: Box<dyn EventSink>,
        ) -> Result<(), BridgeError> {
            Ok(())
        }

        fn foreach(&mut self, _callback: &mut DiveCallback<'_>) -> Result<(), BridgeError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), BridgeError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct DownloadOnly;

    impl ProtocolEngine for DownloadOnly {
        fn open(
            &self,
            _context: &Context,
            _descriptor: &Descriptor,
            _stream: SharedStream,
        ) -> Result<Box<dyn Device>, BridgeError> {
            Err(BridgeError::Status(-1))
        }
    }

    #[test]
    fn test_default_parser_is_unsupported() {
        let descriptor = crate::catalog::find_descriptor_by_model(
            &crate::catalog::BuiltinCatalog,
            crate::catalog::Family::CressiGoa,
            2,
        )
        .unwrap();
        let err = DownloadOnly
            .parser(&Context::detached(), &descriptor, &[1, 2, 3])
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Unsupported(ref msg) if msg.contains("Cressi Goa")));
    }

    #[test]
    fn test_device_handle_closes_once() {
        let closes = std::sync::Arc::new(AtomicU64::new(0));
        let mut handle = DeviceHandle::new(Box::new(CountingDevice {
            closes: closes.clone(),
        }));
        handle.close().unwrap();
        assert!(matches!(
            handle.close(),
            Err(BridgeError::InvalidState(_))
        ));
        assert!(handle.get_mut().is_err());
        drop(handle);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_device_handle_closes_on_drop() {
        let closes = std::sync::Arc::new(AtomicU64::new(0));
        drop(DeviceHandle::new(Box::new(CountingDevice {
            closes: closes.clone(),
        })));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
