//! Device-capability catalog.
//!
//! A catalog lists every dive computer a protocol engine can talk to, with
//! the transports it supports and a name filter for BLE advertisements.
//! [`BuiltinCatalog`] covers the BLE models the identification table knows
//! about; engines with their own catalog implement [`Catalog`].

use std::borrow::Cow;

use bitflags::bitflags;

use crate::error::BridgeError;

bitflags! {
    /// Transport kinds, as a set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Transports: u32 {
        const SERIAL = 1 << 0;
        const USB = 1 << 1;
        const USBHID = 1 << 2;
        const IRDA = 1 << 3;
        const BLUETOOTH = 1 << 4;
        const BLE = 1 << 5;
    }
}

/// Protocol family. Models are numbered within a family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    ShearwaterPredator,
    ShearwaterPetrel,
    SuuntoVyper,
    SuuntoEonSteel,
    UwatecSmart,
    MaresIconHd,
    CressiGoa,
    HwOstc3,
    DeepbluCosmiq,
    OceansS1,
    McleanExtreme,
    TecdivingDiveComputerEu,
    DivesystemIdive,
    HalcyonSymbios,
    GarminDescent,
}

/// How a descriptor decides whether an advertised name belongs to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filter {
    /// Accepts nothing; the model is not discoverable by name.
    None,
    /// Name starts with one of the prefixes.
    Prefix(&'static [&'static str]),
    /// Name contains one of the substrings.
    Contains(&'static [&'static str]),
    /// Name equals one of the strings.
    Exact(&'static [&'static str]),
}

impl Filter {
    pub fn accepts(&self, name: &str) -> bool {
        match self {
            Filter::None => false,
            Filter::Prefix(prefixes) => prefixes.iter().any(|p| name.starts_with(p)),
            Filter::Contains(needles) => needles.iter().any(|n| name.contains(n)),
            Filter::Exact(names) => names.iter().any(|n| name == *n),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub family: Family,
    pub model: u32,
    pub vendor: Cow<'static, str>,
    pub product: Cow<'static, str>,
    pub transports: Transports,
    pub filter: Filter,
}

impl Descriptor {
    pub const fn new(
        family: Family,
        model: u32,
        vendor: &'static str,
        product: &'static str,
        transports: Transports,
        filter: Filter,
    ) -> Self {
        Self {
            family,
            model,
            vendor: Cow::Borrowed(vendor),
            product: Cow::Borrowed(product),
            transports,
            filter,
        }
    }

    /// "Vendor Product", the label fingerprints are stored under.
    pub fn label(&self) -> String {
        format!("{} {}", self.vendor, self.product)
    }

    pub fn supports(&self, transport: Transports) -> bool {
        self.transports.contains(transport)
    }
}

pub trait Catalog: Send + Sync {
    /// Every descriptor, in catalog order. Callers own the returned copies.
    fn descriptors(&self) -> Result<Vec<Descriptor>, BridgeError>;

    /// Whether `descriptor` claims the advertised `name` on `transport`.
    fn filter(&self, descriptor: &Descriptor, transport: Transports, name: &str) -> bool {
        descriptor.supports(transport) && descriptor.filter.accepts(name)
    }
}

/// First descriptor with the given family and model.
pub fn find_descriptor_by_model(
    catalog: &dyn Catalog,
    family: Family,
    model: u32,
) -> Result<Descriptor, BridgeError> {
    catalog
        .descriptors()?
        .into_iter()
        .find(|d| d.family == family && d.model == model)
        .ok_or_else(|| {
            BridgeError::unsupported(format!("no descriptor for {family:?} model {model}"))
        })
}

const BLE: Transports = Transports::BLE;
const BLE_USBHID: Transports = Transports::BLE.union(Transports::USBHID);
const BLE_SERIAL: Transports = Transports::BLE.union(Transports::SERIAL);
const BLE_BT: Transports = Transports::BLE.union(Transports::BLUETOOTH);
const BLE_BT_SERIAL: Transports = BLE_BT.union(Transports::SERIAL);

const SHEARWATER: Filter = Filter::Contains(&[
    "Predator", "Petrel", "Nerd", "NERD", "Perdix", "Teric", "Peregrine", "Tern",
]);
const SUUNTO: Filter = Filter::Prefix(&["EON Steel", "Suunto D5", "EON Core"]);
const UWATEC: Filter = Filter::Contains(&["G2", "Aladin", "HUD", "A1", "A2", "G3", "Luna 2.0"]);
const MARES: Filter = Filter::Contains(&["Mares", "Sirius", "Quad Ci", "Puck4"]);
const CRESSI: Filter = Filter::Prefix(&[
    "CARESIO_", "GOA_", "Leonardo", "Donatello", "Michelangelo", "Neon", "Nepto",
]);
const OSTC: Filter = Filter::Prefix(&["OSTC"]);

#[rustfmt::skip]
static BUILTIN_DESCRIPTORS: &[Descriptor] = &[
    Descriptor::new(Family::SuuntoVyper, 0x0A, "Suunto", "Vyper", Transports::SERIAL, Filter::None),
    Descriptor::new(Family::ShearwaterPredator, 2, "Shearwater", "Predator", BLE_BT, SHEARWATER),
    Descriptor::new(Family::ShearwaterPetrel, 3, "Shearwater", "Petrel", BLE_BT_SERIAL, SHEARWATER),
    Descriptor::new(Family::ShearwaterPetrel, 3, "Shearwater", "Petrel 2", BLE_BT_SERIAL, SHEARWATER),
    Descriptor::new(Family::ShearwaterPetrel, 4, "Shearwater", "NERD", BLE_BT, SHEARWATER),
    Descriptor::new(Family::ShearwaterPetrel, 5, "Shearwater", "Perdix", BLE_BT_SERIAL, SHEARWATER),
    Descriptor::new(Family::ShearwaterPetrel, 6, "Shearwater", "Perdix AI", BLE, SHEARWATER),
    Descriptor::new(Family::ShearwaterPetrel, 7, "Shearwater", "NERD 2", BLE, SHEARWATER),
    Descriptor::new(Family::ShearwaterPetrel, 8, "Shearwater", "Teric", BLE, SHEARWATER),
    Descriptor::new(Family::ShearwaterPetrel, 9, "Shearwater", "Peregrine", BLE, SHEARWATER),
    Descriptor::new(Family::ShearwaterPetrel, 10, "Shearwater", "Petrel 3", BLE, SHEARWATER),
    Descriptor::new(Family::ShearwaterPetrel, 11, "Shearwater", "Perdix 2", BLE, SHEARWATER),
    Descriptor::new(Family::ShearwaterPetrel, 12, "Shearwater", "Tern", BLE, SHEARWATER),
    Descriptor::new(Family::ShearwaterPetrel, 13, "Shearwater", "Peregrine TX", BLE, SHEARWATER),
    Descriptor::new(Family::SuuntoEonSteel, 0, "Suunto", "EON Steel", BLE_USBHID, SUUNTO),
    Descriptor::new(Family::SuuntoEonSteel, 1, "Suunto", "EON Core", BLE_USBHID, SUUNTO),
    Descriptor::new(Family::SuuntoEonSteel, 2, "Suunto", "D5", BLE_USBHID, SUUNTO),
    Descriptor::new(Family::SuuntoEonSteel, 3, "Suunto", "EON Steel Black", BLE_USBHID, SUUNTO),
    Descriptor::new(Family::UwatecSmart, 0x17, "Scubapro", "Aladin Sport Matrix", BLE, UWATEC),
    Descriptor::new(Family::UwatecSmart, 0x25, "Scubapro", "Aladin A1", BLE, UWATEC),
    Descriptor::new(Family::UwatecSmart, 0x28, "Scubapro", "Aladin A2", BLE, UWATEC),
    Descriptor::new(Family::UwatecSmart, 0x31, "Scubapro", "G2 Console", BLE_USBHID, UWATEC),
    Descriptor::new(Family::UwatecSmart, 0x32, "Scubapro", "G2", BLE_USBHID, UWATEC),
    Descriptor::new(Family::UwatecSmart, 0x34, "Scubapro", "G3", BLE_USBHID, UWATEC),
    Descriptor::new(Family::UwatecSmart, 0x42, "Scubapro", "G2 HUD", BLE_USBHID, UWATEC),
    Descriptor::new(Family::UwatecSmart, 0x50, "Scubapro", "Luna 2.0 AI", BLE, UWATEC),
    Descriptor::new(Family::UwatecSmart, 0x51, "Scubapro", "Luna 2.0", BLE, UWATEC),
    Descriptor::new(Family::MaresIconHd, 0x1C, "Mares", "Genius", BLE_SERIAL, MARES),
    Descriptor::new(Family::MaresIconHd, 0x29, "Mares", "Quad Ci", BLE_SERIAL, MARES),
    Descriptor::new(Family::MaresIconHd, 0x2F, "Mares", "Sirius", BLE_SERIAL, MARES),
    Descriptor::new(Family::MaresIconHd, 0x35, "Mares", "Puck 4", BLE_SERIAL, MARES),
    Descriptor::new(Family::CressiGoa, 1, "Cressi", "Cartesio", BLE_SERIAL, CRESSI),
    Descriptor::new(Family::CressiGoa, 2, "Cressi", "Goa", BLE_SERIAL, CRESSI),
    Descriptor::new(Family::CressiGoa, 3, "Cressi", "Leonardo 2.0", BLE_SERIAL, CRESSI),
    Descriptor::new(Family::CressiGoa, 4, "Cressi", "Donatello", BLE_SERIAL, CRESSI),
    Descriptor::new(Family::CressiGoa, 5, "Cressi", "Michelangelo", BLE_SERIAL, CRESSI),
    Descriptor::new(Family::CressiGoa, 9, "Cressi", "Neon", BLE_SERIAL, CRESSI),
    Descriptor::new(Family::CressiGoa, 10, "Cressi", "Nepto", BLE_SERIAL, CRESSI),
    Descriptor::new(Family::HwOstc3, 0x0A, "Heinrichs Weikamp", "OSTC 3", Transports::SERIAL, Filter::None),
    Descriptor::new(Family::HwOstc3, 0x11, "Heinrichs Weikamp", "OSTC 2N", BLE_BT_SERIAL, OSTC),
    Descriptor::new(Family::HwOstc3, 0x12, "Heinrichs Weikamp", "OSTC Sport", BLE_BT_SERIAL, OSTC),
    Descriptor::new(Family::HwOstc3, 0x13, "Heinrichs Weikamp", "OSTC 2", BLE_BT_SERIAL, OSTC),
    Descriptor::new(Family::HwOstc3, 0x1A, "Heinrichs Weikamp", "OSTC Plus", BLE_BT_SERIAL, OSTC),
    Descriptor::new(Family::HwOstc3, 0x3B, "Heinrichs Weikamp", "OSTC 4", BLE_BT_SERIAL, OSTC),
    Descriptor::new(Family::DeepbluCosmiq, 0, "Deepblu", "Cosmiq+", BLE, Filter::Prefix(&["COSMIQ"])),
    Descriptor::new(Family::OceansS1, 0, "Oceans", "S1", BLE, Filter::Prefix(&["S1"])),
    Descriptor::new(Family::McleanExtreme, 0, "McLean", "Extreme", BLE_BT, Filter::Prefix(&["McLean Extreme"])),
    Descriptor::new(Family::TecdivingDiveComputerEu, 0, "Tecdiving", "DiveComputer.eu", BLE_BT, Filter::Prefix(&["DiveComputer"])),
    Descriptor::new(Family::DivesystemIdive, 0x60, "Ratio", "iX3M 2021 GPS Easy", BLE_BT_SERIAL, Filter::Prefix(&["DS", "IX5M", "RATIO-"])),
    Descriptor::new(Family::HalcyonSymbios, 1, "Halcyon", "Symbios", BLE, Filter::Prefix(&["Symbios"])),
    Descriptor::new(Family::GarminDescent, 0x0C3B, "Garmin", "Descent Mk2", BLE_USBHID, Filter::Prefix(&["Descent Mk2"])),
];

/// Static catalog of the BLE dive computers this crate knows by name.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinCatalog;

impl BuiltinCatalog {
    pub fn as_slice(&self) -> &'static [Descriptor] {
        BUILTIN_DESCRIPTORS
    }
}

impl Catalog for BuiltinCatalog {
    fn descriptors(&self) -> Result<Vec<Descriptor>, BridgeError> {
        Ok(BUILTIN_DESCRIPTORS.to_vec())
    }
}
