//! Device session lifecycle.
//!
//! A [`DeviceSession`] owns everything one dive computer connection needs:
//! the engine context, the BLE stream, the resolved descriptor and the
//! device handle. Opening walks through [`SessionState`] step by step; when a
//! step fails, the resources of the earlier steps are dropped in reverse
//! order and the original error is returned.
//!
//! The session also registers itself as the device's event sink. On a
//! device-info event it asks the application for the fingerprint of the last
//! downloaded dive and hands it to the device, so the download stops there.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::ble::BleConnector;
use crate::catalog::{find_descriptor_by_model, BuiltinCatalog, Catalog, Descriptor, Family};
use crate::config::BridgeConfig;
use crate::device::{
    Clock, Context, DevInfo, Device, DeviceEvent, DeviceHandle, DiveCallback, EventSink, Parser,
    ProtocolEngine, Progress,
};
use crate::error::BridgeError;
use crate::fingerprint::{serial_key, FingerprintLookup};
use crate::identify::{Identifier, NameResolver};
use crate::stream::{BleStream, Canceller, SharedStream};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    ContextCreated,
    DescriptorResolved,
    StreamOpen,
    DeviceOpen,
    EventsRegistered,
    Ready,
    Closed,
}

/// Event snapshots, shared between the session and its event sink.
#[derive(Debug, Default)]
struct Snapshot {
    device_info: Option<DevInfo>,
    progress: Option<Progress>,
    clock: Option<Clock>,
    fingerprint: Option<Vec<u8>>,
    model_label: Option<String>,
}

struct SessionEvents {
    snapshot: Arc<Mutex<Snapshot>>,
    lookup: Option<Arc<dyn FingerprintLookup>>,
}

impl SessionEvents {
    fn on_devinfo(&mut self, device: &mut dyn Device, devinfo: DevInfo) {
        let label = {
            let mut snapshot = self.snapshot.lock();
            snapshot.device_info = Some(devinfo);
            snapshot.model_label.clone()
        };

        let (Some(lookup), Some(label)) = (&self.lookup, label) else {
            return;
        };
        let serial = serial_key(devinfo.serial);
        let fingerprint = match lookup.lookup(&label, &serial) {
            Some(fingerprint) if !fingerprint.is_empty() => fingerprint,
            _ => {
                debug!(device = %label, %serial, "no fingerprint stored");
                return;
            }
        };

        info!(device = %label, %serial, size = fingerprint.len(), "setting fingerprint");
        if let Err(err) = device.set_fingerprint(&fingerprint) {
            warn!(%err, "device rejected fingerprint");
        }
        self.snapshot.lock().fingerprint = Some(fingerprint);
    }
}

impl EventSink for SessionEvents {
    fn on_event(&mut self, device: &mut dyn Device, event: &DeviceEvent) {
        match event {
            DeviceEvent::DevInfo(devinfo) => self.on_devinfo(device, *devinfo),
            DeviceEvent::Progress(progress) => {
                self.snapshot.lock().progress = Some(*progress);
            }
            DeviceEvent::Clock(clock) => {
                self.snapshot.lock().clock = Some(*clock);
            }
            DeviceEvent::Waiting | DeviceEvent::Vendor(_) => {}
        }
    }
}

/// Entry point for applications: holds the collaborators every session
/// needs and opens sessions.
#[derive(Clone)]
pub struct DiveBridge {
    connector: Arc<dyn BleConnector>,
    engine: Arc<dyn ProtocolEngine>,
    catalog: Arc<dyn Catalog>,
    resolver: Option<Arc<dyn NameResolver>>,
    lookup: Option<Arc<dyn FingerprintLookup>>,
    config: BridgeConfig,
}

impl DiveBridge {
    /// Bridge over the built-in catalog with default settings.
    pub fn new(connector: Arc<dyn BleConnector>, engine: Arc<dyn ProtocolEngine>) -> Self {
        Self {
            connector,
            engine,
            catalog: Arc::new(BuiltinCatalog),
            resolver: None,
            lookup: None,
            config: BridgeConfig::default(),
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Overrides name resolution. By default an [`Identifier`] over the
    /// bridge's catalog is used.
    pub fn with_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_fingerprint_lookup(mut self, lookup: Arc<dyn FingerprintLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn resolver(&self) -> Arc<dyn NameResolver> {
        match &self.resolver {
            Some(resolver) => Arc::clone(resolver),
            None => Arc::new(Identifier::new(Arc::clone(&self.catalog))),
        }
    }

    /// "Vendor Product" for an advertised name.
    pub fn formatted_name(&self, name: &str) -> Option<String> {
        self.resolver().resolve_by_name(name).ok().map(|d| d.label())
    }

    /// Connects to `address` and opens the `(family, model)` device on it.
    pub fn open(
        &self,
        address: &str,
        family: Family,
        model: u32,
    ) -> Result<DeviceSession, BridgeError> {
        if address.is_empty() {
            return Err(BridgeError::invalid_arguments("empty device address"));
        }

        let context = Context::new(address);
        let _entered = context.span().clone().entered();
        debug!(state = ?SessionState::ContextCreated, ?family, model, "opening session");

        let descriptor = find_descriptor_by_model(self.catalog.as_ref(), family, model)
            .inspect_err(|err| warn!(%err, "descriptor lookup failed"))?;
        debug!(state = ?SessionState::DescriptorResolved, product = %descriptor.product);

        let stream = BleStream::open(self.connector.as_ref(), address, &self.config)
            .inspect_err(|err| warn!(%err, "BLE connection failed"))?;
        let canceller = stream.canceller();
        let stream: SharedStream = Arc::new(Mutex::new(stream));
        debug!(state = ?SessionState::StreamOpen);

        let snapshot = Arc::new(Mutex::new(Snapshot::default()));
        let device = open_device(
            self.engine.as_ref(),
            &context,
            &descriptor,
            &stream,
            &snapshot,
            self.lookup.clone(),
            &self.config,
        )?;

        info!(device = %descriptor.label(), "session ready");
        Ok(DeviceSession {
            state: SessionState::Ready,
            snapshot,
            device: Some(device),
            stream: Some(stream),
            canceller: Some(canceller),
            descriptor: Some(descriptor),
            context: Some(context),
            engine: Arc::clone(&self.engine),
            catalog: Arc::clone(&self.catalog),
            lookup: self.lookup.clone(),
            config: self.config.clone(),
        })
    }

    /// Opens with a previously confirmed `(family, model)` when one is given,
    /// falling back to identifying `name` if that fails or is absent.
    pub fn open_with_identification(
        &self,
        name: &str,
        address: &str,
        stored_family: Option<Family>,
        stored_model: Option<u32>,
    ) -> Result<DeviceSession, BridgeError> {
        if let (Some(family), Some(model)) = (stored_family, stored_model) {
            if model != 0 {
                match self.open(address, family, model) {
                    Ok(session) => return Ok(session),
                    Err(err) => {
                        warn!(%err, ?family, model, "stored identity failed, identifying by name")
                    }
                }
            }
        }

        let descriptor = self.resolver().resolve_by_name(name)?;
        debug!(name, product = %descriptor.product, "identified device");
        self.open(address, descriptor.family, descriptor.model)
    }

    /// Parser for dive `data` downloaded from a `(family, model)` device.
    /// Needs no connection.
    pub fn create_parser(
        &self,
        family: Family,
        model: u32,
        data: &[u8],
    ) -> Result<Box<dyn Parser>, BridgeError> {
        let descriptor = find_descriptor_by_model(self.catalog.as_ref(), family, model)?;
        let context = Context::detached();
        let _entered = context.span().clone().entered();
        debug!(product = %descriptor.product, size = data.len(), "creating parser");
        self.engine
            .parser(&context, &descriptor, data)
            .inspect_err(|err| warn!(%err, "parser creation failed"))
    }
}

impl fmt::Debug for DiveBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiveBridge")
            .field("config", &self.config)
            .field("custom_resolver", &self.resolver.is_some())
            .field("fingerprint_lookup", &self.lookup.is_some())
            .finish()
    }
}

/// Runs the DeviceOpen and EventsRegistered steps. The model label is in
/// place before events are registered so a device-info event can use it.
fn open_device(
    engine: &dyn ProtocolEngine,
    context: &Context,
    descriptor: &Descriptor,
    stream: &SharedStream,
    snapshot: &Arc<Mutex<Snapshot>>,
    lookup: Option<Arc<dyn FingerprintLookup>>,
    config: &BridgeConfig,
) -> Result<DeviceHandle, BridgeError> {
    let mut device = DeviceHandle::new(
        engine
            .open(context, descriptor, Arc::clone(stream))
            .inspect_err(|err| warn!(%err, "device open failed"))?,
    );
    debug!(state = ?SessionState::DeviceOpen);

    snapshot.lock().model_label = Some(descriptor.label());
    let sink = SessionEvents {
        snapshot: Arc::clone(snapshot),
        lookup,
    };
    if let Err(err) = device.get_mut()?.set_events(config.events, Box::new(sink)) {
        warn!(%err, "registering events failed");
        snapshot.lock().model_label = None;
        return Err(err);
    }
    debug!(state = ?SessionState::EventsRegistered);
    Ok(device)
}

/// One open dive computer connection.
pub struct DeviceSession {
    state: SessionState,
    snapshot: Arc<Mutex<Snapshot>>,
    device: Option<DeviceHandle>,
    stream: Option<SharedStream>,
    canceller: Option<Canceller>,
    descriptor: Option<Descriptor>,
    context: Option<Context>,
    engine: Arc<dyn ProtocolEngine>,
    catalog: Arc<dyn Catalog>,
    lookup: Option<Arc<dyn FingerprintLookup>>,
    config: BridgeConfig,
}

impl DeviceSession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.as_ref()
    }

    /// "Vendor Product" of the open device.
    pub fn model_label(&self) -> Option<String> {
        self.snapshot.lock().model_label.clone()
    }

    pub fn device_info(&self) -> Option<DevInfo> {
        self.snapshot.lock().device_info
    }

    pub fn progress(&self) -> Option<Progress> {
        self.snapshot.lock().progress
    }

    pub fn clock(&self) -> Option<Clock> {
        self.snapshot.lock().clock
    }

    /// Fingerprint handed to the device for this download, if any.
    pub fn fingerprint(&self) -> Option<Vec<u8>> {
        self.snapshot.lock().fingerprint.clone()
    }

    /// The stream the device talks through.
    pub fn stream(&self) -> Result<SharedStream, BridgeError> {
        self.ensure_open()?;
        self.stream
            .clone()
            .ok_or_else(|| BridgeError::invalid_state("session has no stream"))
    }

    /// Handle another thread can use to abandon a running download. The
    /// blocked transport call fails with an I/O error, as does every later
    /// stream operation; the session itself still has to be closed.
    pub fn canceller(&self) -> Result<Canceller, BridgeError> {
        self.ensure_open()?;
        self.canceller
            .clone()
            .ok_or_else(|| BridgeError::invalid_state("session has no stream"))
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.state == SessionState::Closed {
            return Err(BridgeError::invalid_state("session is closed"));
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), BridgeError> {
        self.ensure_open()?;
        if self.state != SessionState::Ready {
            return Err(BridgeError::invalid_state(format!(
                "session is not ready ({:?})",
                self.state
            )));
        }
        Ok(())
    }

    /// Closes the current device and opens `(family, model)` on the same
    /// stream, without reconnecting over BLE.
    pub fn reopen_with_model(&mut self, family: Family, model: u32) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| BridgeError::invalid_state("session has no context"))?;
        let _entered = context.span().clone().entered();

        if let Some(mut device) = self.device.take() {
            if let Err(err) = device.close() {
                warn!(%err, "closing previous device failed");
            }
        }
        self.descriptor = None;
        *self.snapshot.lock() = Snapshot::default();
        self.state = SessionState::StreamOpen;
        debug!(?family, model, "reopening device");

        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| BridgeError::invalid_state("session has no stream"))?;
        let descriptor = find_descriptor_by_model(self.catalog.as_ref(), family, model)?;
        let device = open_device(
            self.engine.as_ref(),
            context,
            &descriptor,
            stream,
            &self.snapshot,
            self.lookup.clone(),
            &self.config,
        )?;

        info!(device = %descriptor.label(), "session ready after reopen");
        self.device = Some(device);
        self.descriptor = Some(descriptor);
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Runs the device's dive enumeration. Events raised meanwhile update
    /// the session snapshots.
    pub fn download(&mut self, callback: &mut DiveCallback<'_>) -> Result<(), BridgeError> {
        self.ensure_ready()?;
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| BridgeError::invalid_state("session has no device"))?;
        device.get_mut()?.foreach(callback)
    }

    /// Releases the fingerprint, model label, device, stream and context, in
    /// that order. Keeps going after a failure and reports the first one.
    pub fn close(&mut self) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.state = SessionState::Closed;
        let mut first_err = None;

        *self.snapshot.lock() = Snapshot::default();

        if let Some(mut device) = self.device.take() {
            if let Err(err) = device.close() {
                warn!(%err, "closing device failed");
                first_err.get_or_insert(err);
            }
        }
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.lock().close() {
                warn!(%err, "closing stream failed");
                first_err.get_or_insert(err);
            }
        }
        self.canceller = None;
        self.descriptor = None;
        self.context = None;
        debug!("session closed");

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            if let Err(err) = self.close() {
                warn!(%err, "session close on drop failed");
            }
        }
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("state", &self.state)
            .field("descriptor", &self.descriptor)
            .field("snapshot", &*self.snapshot.lock())
            .finish()
    }
}
