pub mod ble;
pub mod ble_mock;
pub mod catalog;
pub mod config;
pub mod device;
pub mod device_mock;
pub mod error;
pub mod ffi;
pub mod fingerprint;
pub mod identify;
pub mod notify;
pub mod session;
pub mod stream;

uniffi::include_scaffolding!("divelog_ble");

pub use ble::{AbortHandle, BleConnector, BleError, BleTransport};
pub use catalog::{BuiltinCatalog, Catalog, Descriptor, Family, Filter, Transports};
pub use config::BridgeConfig;
pub use device::{
    Clock, Context, DevInfo, Device, DeviceEvent, DiveCallback, EventMask, EventSink, Parser,
    ProtocolEngine, Progress,
};
pub use error::{BridgeError, Recovery};
pub use ffi::{alternative_models, formatted_device_name, identify_device};
pub use fingerprint::{serial_key, FingerprintLookup, FingerprintStore};
pub use identify::{DeviceIdentity, Identifier, NameResolver};
pub use notify::NotificationQueue;
pub use session::{DeviceSession, DiveBridge, SessionState};
pub use stream::{BleStream, Canceller, SharedStream, Stream};
