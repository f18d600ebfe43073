//! Functions exported through the UniFFI interface. They work on the
//! built-in catalog; sessions need an engine and a platform transport and
//! are driven from Rust.

use crate::catalog::Family;
use crate::error::BridgeError;
use crate::identify::{DeviceIdentity, Identifier};

pub fn identify_device(name: String) -> Result<DeviceIdentity, BridgeError> {
    Identifier::builtin().identify(&name)
}

pub fn formatted_device_name(name: String) -> Option<String> {
    Identifier::builtin().formatted_name(&name)
}

pub fn alternative_models(
    name: String,
    family: Family,
    max_models: u32,
) -> Result<Vec<u32>, BridgeError> {
    Identifier::builtin().alternative_models(&name, family, max_models as usize)
}
