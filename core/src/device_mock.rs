use std::sync::Arc;

use parking_lot::Mutex;

use crate::catalog::{Descriptor, Family};
use crate::device::{
    Context, Device, DeviceEvent, DiveCallback, EventMask, EventSink, Parser, ProtocolEngine,
};
use crate::error::BridgeError;
use crate::stream::SharedStream;

/// Engine and device invocations recorded by the mock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineCall {
    Open { family: Family, model: u32 },
    SetFingerprint(Vec<u8>),
    SetEvents(EventMask),
    Foreach,
    Close { model: u32 },
    Parser { family: Family, model: u32, size: usize },
}

/// A dive the mock device hands out, newest first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockDive {
    pub data: Vec<u8>,
    pub fingerprint: Vec<u8>,
}

impl MockDive {
    pub fn new(data: &[u8], fingerprint: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            fingerprint: fingerprint.to_vec(),
        }
    }
}

/// Request written to the stream at the start of a download, and the reply
/// length read back before any dive is reported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockHandshake {
    pub request: Vec<u8>,
    pub reply_len: usize,
}

#[derive(Clone, Debug, Default)]
struct Script {
    failing_models: Vec<(u32, BridgeError)>,
    failing_parsers: Vec<(u32, BridgeError)>,
    fail_set_events: bool,
    events: Vec<DeviceEvent>,
    dives: Vec<MockDive>,
    handshake: Option<MockHandshake>,
}

/// Protocol engine whose devices replay a script. Clones share one call log.
#[derive(Clone, Debug, Default)]
pub struct MockEngine {
    calls: Arc<Mutex<Vec<EngineCall>>>,
    script: Script,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opening `model` fails with `err`.
    pub fn failing_open(mut self, model: u32, err: BridgeError) -> Self {
        self.script.failing_models.push((model, err));
        self
    }

    /// Creating a parser for `model` fails with `err`.
    pub fn failing_parser(mut self, model: u32, err: BridgeError) -> Self {
        self.script.failing_parsers.push((model, err));
        self
    }

    /// Event registration fails with status -1.
    pub fn failing_set_events(mut self) -> Self {
        self.script.fail_set_events = true;
        self
    }

    /// Events raised at the start of every download.
    pub fn with_events(mut self, events: Vec<DeviceEvent>) -> Self {
        self.script.events = events;
        self
    }

    pub fn with_dives(mut self, dives: Vec<MockDive>) -> Self {
        self.script.dives = dives;
        self
    }

    pub fn with_handshake(mut self, request: &[u8], reply_len: usize) -> Self {
        self.script.handshake = Some(MockHandshake {
            request: request.to_vec(),
            reply_len,
        });
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }
}

impl ProtocolEngine for MockEngine {
    fn open(
        &self,
        _context: &Context,
        descriptor: &Descriptor,
        stream: SharedStream,
    ) -> Result<Box<dyn Device>, BridgeError> {
        self.calls.lock().push(EngineCall::Open {
            family: descriptor.family,
            model: descriptor.model,
        });
        if let Some((_, err)) = self
            .script
            .failing_models
            .iter()
            .find(|(model, _)| *model == descriptor.model)
        {
            return Err(err.clone());
        }
        Ok(Box::new(MockDevice {
            model: descriptor.model,
            calls: Arc::clone(&self.calls),
            script: self.script.clone(),
            stream,
            sink: None,
            mask: EventMask::empty(),
            fingerprint: Vec::new(),
            closed: false,
        }))
    }

    fn parser(
        &self,
        _context: &Context,
        descriptor: &Descriptor,
        data: &[u8],
    ) -> Result<Box<dyn Parser>, BridgeError> {
        self.calls.lock().push(EngineCall::Parser {
            family: descriptor.family,
            model: descriptor.model,
            size: data.len(),
        });
        if let Some((_, err)) = self
            .script
            .failing_parsers
            .iter()
            .find(|(model, _)| *model == descriptor.model)
        {
            return Err(err.clone());
        }
        Ok(Box::new(MockParser {
            data: data.to_vec(),
        }))
    }
}

#[derive(Debug)]
pub struct MockParser {
    data: Vec<u8>,
}

impl Parser for MockParser {
    fn data(&self) -> &[u8] {
        &self.data
    }
}

pub struct MockDevice {
    model: u32,
    calls: Arc<Mutex<Vec<EngineCall>>>,
    script: Script,
    stream: SharedStream,
    sink: Option<Box<dyn EventSink>>,
    mask: EventMask,
    fingerprint: Vec<u8>,
    closed: bool,
}

impl MockDevice {
    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.closed {
            return Err(BridgeError::invalid_state("mock device closed"));
        }
        Ok(())
    }

    fn emit(&mut self, event: &DeviceEvent) {
        if !self.mask.contains(event.kind()) {
            return;
        }
        // The sink may call back into this device, so it is taken out for
        // the duration of the call.
        if let Some(mut sink) = self.sink.take() {
            sink.on_event(self, event);
            self.sink = Some(sink);
        }
    }

    fn handshake(&mut self, handshake: &MockHandshake) -> Result<(), BridgeError> {
        let mut stream = self.stream.lock();
        stream.write(&handshake.request)?;
        let mut reply = vec![0; handshake.reply_len];
        let mut filled = 0;
        while filled < reply.len() {
            filled += stream.read(&mut reply[filled..])?;
        }
        Ok(())
    }
}

impl Device for MockDevice {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.record(EngineCall::SetFingerprint(fingerprint.to_vec()));
        self.fingerprint = fingerprint.to_vec();
        Ok(())
    }

    fn set_events(
        &mut self,
        events: EventMask,
        sink: Box<dyn EventSink>,
    ) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.record(EngineCall::SetEvents(events));
        if self.script.fail_set_events {
            return Err(BridgeError::Status(-1));
        }
        self.mask = events;
        self.sink = Some(sink);
        Ok(())
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.record(EngineCall::Foreach);

        if let Some(handshake) = self.script.handshake.clone() {
            self.handshake(&handshake)?;
        }
        for event in self.script.events.clone() {
            self.emit(&event);
        }
        for dive in &self.script.dives {
            if !self.fingerprint.is_empty() && dive.fingerprint == self.fingerprint {
                break;
            }
            if !callback(&dive.data, &dive.fingerprint) {
                break;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.closed = true;
        self.sink = None;
        self.record(EngineCall::Close { model: self.model });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble_mock::MockConnector;
    use crate::catalog::{find_descriptor_by_model, BuiltinCatalog};
    use crate::config::BridgeConfig;
    use crate::device::DevInfo;
    use crate::stream::BleStream;

    fn open_device(engine: &MockEngine) -> Box<dyn Device> {
        let connector = MockConnector::new();
        let stream = BleStream::open(&connector, "addr", &BridgeConfig::default()).unwrap();
        let descriptor =
            find_descriptor_by_model(&BuiltinCatalog, Family::ShearwaterPetrel, 5).unwrap();
        engine
            .open(&Context::new("addr"), &descriptor, Arc::new(Mutex::new(stream)))
            .unwrap()
    }

    struct Recorder(Arc<Mutex<Vec<DeviceEvent>>>);

    impl EventSink for Recorder {
        fn on_event(&mut self, _device: &mut dyn Device, event: &DeviceEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[test]
    fn test_foreach_stops_at_fingerprint() {
        let engine = MockEngine::new().with_dives(vec![
            MockDive::new(b"dive3", &[3]),
            MockDive::new(b"dive2", &[2]),
            MockDive::new(b"dive1", &[1]),
        ]);
        let mut device = open_device(&engine);
        device.set_fingerprint(&[2]).unwrap();

        let mut seen = Vec::new();
        device
            .foreach(&mut |data, _| {
                seen.push(data.to_vec());
                true
            })
            .unwrap();
        assert_eq!(seen, vec![b"dive3".to_vec()]);
    }

    #[test]
    fn test_events_respect_mask() {
        let engine = MockEngine::new().with_events(vec![
            DeviceEvent::Waiting,
            DeviceEvent::DevInfo(DevInfo::default()),
        ]);
        let mut device = open_device(&engine);
        let events = Arc::new(Mutex::new(Vec::new()));
        device
            .set_events(EventMask::DEVINFO, Box::new(Recorder(events.clone())))
            .unwrap();
        device.foreach(&mut |_, _| true).unwrap();
        assert_eq!(
            *events.lock(),
            vec![DeviceEvent::DevInfo(DevInfo::default())]
        );
    }

    #[test]
    fn test_close_twice_is_invalid_state() {
        let engine = MockEngine::new();
        let mut device = open_device(&engine);
        device.close().unwrap();
        assert!(matches!(device.close(), Err(BridgeError::InvalidState(_))));
        assert_eq!(engine.calls().last(), Some(&EngineCall::Close { model: 5 }));
    }
}
