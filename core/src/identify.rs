//! Maps advertised BLE names to catalog descriptors.
//!
//! Resolution runs in two phases:
//!
//! 1. [`NAME_PATTERNS`] is walked in order; the first entry whose key
//!    matches the name and whose vendor/product exists in the catalog wins.
//!    More specific keys ("Petrel 3") sit above broader ones ("Petrel") they
//!    would otherwise be shadowed by.
//! 2. Otherwise the catalog's own BLE filters are asked, in catalog order.
//!
//! ```
//! use divelog_ble::identify::Identifier;
//!
//! let identifier = Identifier::builtin();
//! let identity = identifier.identify("Peregrine").unwrap();
//! assert_eq!(identity.product, "Peregrine TX");
//! ```

use std::sync::Arc;

use tracing::debug;

use crate::catalog::{BuiltinCatalog, Catalog, Descriptor, Family, Transports};
use crate::error::BridgeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchMode {
    /// Substring test. Kept apart from `Contains` for table readability.
    Exact,
    Prefix,
    Contains,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamePattern {
    pub key: &'static str,
    pub vendor: &'static str,
    pub product: &'static str,
    pub mode: MatchMode,
}

impl NamePattern {
    const fn new(
        key: &'static str,
        vendor: &'static str,
        product: &'static str,
        mode: MatchMode,
    ) -> Self {
        Self {
            key,
            vendor,
            product,
            mode,
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self.mode {
            MatchMode::Exact | MatchMode::Contains => name.contains(self.key),
            MatchMode::Prefix => name.starts_with(self.key),
        }
    }
}

use MatchMode::{Contains, Exact, Prefix};

/// Known advertised names. Order matters: first match wins.
#[rustfmt::skip]
pub static NAME_PATTERNS: &[NamePattern] = &[
    // Shearwater
    NamePattern::new("Predator", "Shearwater", "Predator", Exact),
    NamePattern::new("Perdix 2", "Shearwater", "Perdix 2", Exact),
    NamePattern::new("Petrel 3", "Shearwater", "Petrel 3", Exact),
    // Petrel and Petrel 2 both advertise as "Petrel".
    NamePattern::new("Petrel", "Shearwater", "Petrel 2", Exact),
    NamePattern::new("Perdix", "Shearwater", "Perdix", Exact),
    NamePattern::new("Teric", "Shearwater", "Teric", Exact),
    NamePattern::new("Peregrine TX", "Shearwater", "Peregrine TX", Exact),
    // Advertises as "Peregrine", hardware is the TX.
    NamePattern::new("Peregrine", "Shearwater", "Peregrine TX", Exact),
    NamePattern::new("NERD 2", "Shearwater", "NERD 2", Exact),
    NamePattern::new("NERD", "Shearwater", "NERD", Exact),
    NamePattern::new("Tern", "Shearwater", "Tern", Exact),
    // Suunto
    NamePattern::new("EON Steel", "Suunto", "EON Steel", Exact),
    NamePattern::new("Suunto D5", "Suunto", "D5", Exact),
    NamePattern::new("EON Core", "Suunto", "EON Core", Exact),
    // Scubapro
    NamePattern::new("G2", "Scubapro", "G2", Exact),
    NamePattern::new("HUD", "Scubapro", "G2 HUD", Exact),
    NamePattern::new("G3", "Scubapro", "G3", Exact),
    NamePattern::new("Aladin", "Scubapro", "Aladin Sport Matrix", Exact),
    NamePattern::new("A1", "Scubapro", "Aladin A1", Exact),
    NamePattern::new("A2", "Scubapro", "Aladin A2", Exact),
    NamePattern::new("Luna 2.0 AI", "Scubapro", "Luna 2.0 AI", Exact),
    NamePattern::new("Luna 2.0", "Scubapro", "Luna 2.0", Exact),
    // Mares
    NamePattern::new("Mares Genius", "Mares", "Genius", Exact),
    NamePattern::new("Sirius", "Mares", "Sirius", Exact),
    NamePattern::new("Quad Ci", "Mares", "Quad Ci", Exact),
    NamePattern::new("Puck4", "Mares", "Puck 4", Exact),
    // Cressi
    NamePattern::new("CARESIO_", "Cressi", "Cartesio", Prefix),
    NamePattern::new("GOA_", "Cressi", "Goa", Prefix),
    NamePattern::new("Leonardo", "Cressi", "Leonardo 2.0", Contains),
    NamePattern::new("Donatello", "Cressi", "Donatello", Contains),
    NamePattern::new("Michelangelo", "Cressi", "Michelangelo", Contains),
    NamePattern::new("Neon", "Cressi", "Neon", Contains),
    NamePattern::new("Nepto", "Cressi", "Nepto", Contains),
    // Heinrichs Weikamp
    NamePattern::new("OSTC 3", "Heinrichs Weikamp", "OSTC Plus", Exact),
    NamePattern::new("OSTC s#", "Heinrichs Weikamp", "OSTC Sport", Exact),
    NamePattern::new("OSTC s ", "Heinrichs Weikamp", "OSTC Sport", Exact),
    NamePattern::new("OSTC 4-", "Heinrichs Weikamp", "OSTC 4", Exact),
    NamePattern::new("OSTC 2-", "Heinrichs Weikamp", "OSTC 2N", Exact),
    NamePattern::new("OSTC + ", "Heinrichs Weikamp", "OSTC 2", Exact),
    NamePattern::new("OSTC", "Heinrichs Weikamp", "OSTC 2", Exact),
    // Deepblu
    NamePattern::new("COSMIQ", "Deepblu", "Cosmiq+", Exact),
    // Oceans
    NamePattern::new("S1", "Oceans", "S1", Exact),
    // McLean
    NamePattern::new("McLean Extreme", "McLean", "Extreme", Exact),
    // Tecdiving
    NamePattern::new("DiveComputer", "Tecdiving", "DiveComputer.eu", Exact),
    // Ratio
    NamePattern::new("DS", "Ratio", "iX3M 2021 GPS Easy", Exact),
    NamePattern::new("IX5M", "Ratio", "iX3M 2021 GPS Easy", Exact),
    NamePattern::new("RATIO-", "Ratio", "iX3M 2021 GPS Easy", Exact),
];

/// Resolved identity of an advertised device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub family: Family,
    pub model: u32,
    pub vendor: String,
    pub product: String,
}

impl DeviceIdentity {
    pub fn label(&self) -> String {
        format!("{} {}", self.vendor, self.product)
    }
}

impl From<Descriptor> for DeviceIdentity {
    fn from(d: Descriptor) -> Self {
        Self {
            family: d.family,
            model: d.model,
            vendor: d.vendor.into_owned(),
            product: d.product.into_owned(),
        }
    }
}

/// Anything that can turn an advertised name into a descriptor.
pub trait NameResolver: Send + Sync {
    fn resolve_by_name(&self, name: &str) -> Result<Descriptor, BridgeError>;
}

/// Pattern table plus catalog-filter resolver.
#[derive(Clone)]
pub struct Identifier {
    catalog: Arc<dyn Catalog>,
    patterns: &'static [NamePattern],
}

impl Identifier {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self {
            catalog,
            patterns: NAME_PATTERNS,
        }
    }

    /// Identifier over [`BuiltinCatalog`].
    pub fn builtin() -> Self {
        Self::new(Arc::new(BuiltinCatalog))
    }

    pub fn identify(&self, name: &str) -> Result<DeviceIdentity, BridgeError> {
        self.resolve_by_name(name).map(DeviceIdentity::from)
    }

    /// "Vendor Product" for an advertised name, if it resolves.
    pub fn formatted_name(&self, name: &str) -> Option<String> {
        self.resolve_by_name(name).ok().map(|d| d.label())
    }

    /// Models of `family` worth trying for `name`, best guess first:
    /// matching table entries, then filter matches, then the family's other
    /// BLE models. At most `max_models` entries, no duplicates.
    pub fn alternative_models(
        &self,
        name: &str,
        family: Family,
        max_models: usize,
    ) -> Result<Vec<u32>, BridgeError> {
        let descriptors: Vec<Descriptor> = self
            .catalog
            .descriptors()?
            .into_iter()
            .filter(|d| d.family == family)
            .collect();

        let mut models = Vec::new();
        let mut push = |model: u32| {
            if models.len() < max_models && !models.contains(&model) {
                models.push(model);
            }
        };

        for pattern in self.patterns.iter().filter(|p| p.matches(name)) {
            if let Some(d) = descriptors
                .iter()
                .find(|d| d.vendor == pattern.vendor && d.product == pattern.product)
            {
                push(d.model);
            }
        }
        for d in &descriptors {
            if self.catalog.filter(d, Transports::BLE, name) {
                push(d.model);
            }
        }
        for d in descriptors.iter().filter(|d| d.supports(Transports::BLE)) {
            push(d.model);
        }
        Ok(models)
    }

    fn lookup_pattern(&self, pattern: &NamePattern) -> Result<Option<Descriptor>, BridgeError> {
        Ok(self
            .catalog
            .descriptors()?
            .into_iter()
            .find(|d| d.vendor == pattern.vendor && d.product == pattern.product))
    }
}

impl NameResolver for Identifier {
    fn resolve_by_name(&self, name: &str) -> Result<Descriptor, BridgeError> {
        if name.is_empty() {
            return Err(BridgeError::invalid_arguments("empty device name"));
        }

        for pattern in self.patterns.iter().filter(|p| p.matches(name)) {
            match self.lookup_pattern(pattern)? {
                Some(descriptor) => {
                    debug!(
                        name,
                        key = pattern.key,
                        product = %descriptor.product,
                        "name matched pattern"
                    );
                    return Ok(descriptor);
                }
                None => {
                    debug!(
                        name,
                        key = pattern.key,
                        "pattern matched but catalog has no such product"
                    );
                }
            }
        }

        let descriptor = self
            .catalog
            .descriptors()?
            .into_iter()
            .find(|d| self.catalog.filter(d, Transports::BLE, name));
        match descriptor {
            Some(descriptor) => {
                debug!(name, product = %descriptor.product, "name matched catalog filter");
                Ok(descriptor)
            }
            None => Err(BridgeError::unsupported(format!(
                "no device matches name {name:?}"
            ))),
        }
    }
}

impl std::fmt::Debug for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identifier")
            .field("patterns", &self.patterns.len())
            .finish()
    }
}
