//! Static table of known hub models.
//! Resolves a device-type code to its family, display name and capabilities.

use crate::config::Config;
use crate::protocol::DeviceTypeCode;
use log::debug;
use serde::Serialize;
use std::fmt;

/// Equivalence class of device-type codes that speak one command dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompatClass {
    Sp1,
    Sp2,
    Sp3s,
    Mp1,
    A1,
    Hysen,
    Dooya,
    Rm,
    Rm4,
    /// Not in the table; the raw code is its own class
    Unknown(u16),
}

impl CompatClass {
    pub fn name(self) -> &'static str {
        match self {
            CompatClass::Sp1 => "SP1",
            CompatClass::Sp2 => "SP2",
            CompatClass::Sp3s => "SP3S",
            CompatClass::Mp1 => "MP1",
            CompatClass::A1 => "A1",
            CompatClass::Hysen => "Hysen",
            CompatClass::Dooya => "Dooya",
            CompatClass::Rm => "RM",
            CompatClass::Rm4 => "RM4",
            CompatClass::Unknown(_) => "Unknown",
        }
    }

    pub fn capabilities(self) -> &'static [Capability] {
        use Capability::*;
        match self {
            CompatClass::Sp1 => &[OnOff],
            CompatClass::Sp2 => &[OnOff, NightLight],
            CompatClass::Sp3s => &[OnOff, NightLight, EnergyMeter],
            CompatClass::Mp1 => &[Relays],
            CompatClass::A1 => &[
                MeasureTemperature,
                MeasureHumidity,
                AirQuality,
                LightLevel,
                NoiseLevel,
            ],
            CompatClass::Hysen => &[
                OnOff,
                TargetTemperature,
                MeasureTemperature,
                ParentalMode,
            ],
            CompatClass::Dooya => &[WindowCovering],
            CompatClass::Rm => &[InfraredRemote],
            CompatClass::Rm4 => &[InfraredRemote, MeasureTemperature, MeasureHumidity],
            CompatClass::Unknown(_) => &[],
        }
    }
}

impl fmt::Display for CompatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompatClass::Unknown(code) => write!(f, "Unknown(0x{:04X})", code),
            other => f.write_str(other.name()),
        }
    }
}

/// Host-visible capabilities a model exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    OnOff,
    NightLight,
    EnergyMeter,
    Relays,
    TargetTemperature,
    MeasureTemperature,
    MeasureHumidity,
    ParentalMode,
    AirQuality,
    LightLevel,
    NoiseLevel,
    WindowCovering,
    InfraredRemote,
}

/// Descriptor resolved for a device-type code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub display_name: &'static str,
    pub capabilities: &'static [Capability],
    pub class: CompatClass,
}

impl DeviceDescriptor {
    pub fn is_known(&self) -> bool {
        !matches!(self.class, CompatClass::Unknown(_))
    }
}

const DEVICE_TABLE: &[(u16, &str, CompatClass)] = &[
    (0x0000, "SP1", CompatClass::Sp1),
    (0x2711, "SP2", CompatClass::Sp2),
    (0x2719, "Honeywell SP2", CompatClass::Sp2),
    (0x7919, "Honeywell SP2", CompatClass::Sp2),
    (0x271a, "Honeywell SP2", CompatClass::Sp2),
    (0x791a, "Honeywell SP2", CompatClass::Sp2),
    (0x2720, "SPMini", CompatClass::Sp2),
    (0x753e, "SP3", CompatClass::Sp2),
    (0x7d00, "OEM branded SP3", CompatClass::Sp2),
    (0x2728, "SPMini2", CompatClass::Sp2),
    (0x2733, "OEM branded SPMini", CompatClass::Sp2),
    (0x273e, "OEM branded SPMini", CompatClass::Sp2),
    (0x7530, "OEM branded SPMini2", CompatClass::Sp2),
    (0x7918, "OEM branded SPMini2", CompatClass::Sp2),
    (0x2736, "SPMiniPlus", CompatClass::Sp2),
    (0x9479, "SP3S-US", CompatClass::Sp3s),
    (0x947a, "SP3S-EU", CompatClass::Sp3s),
    (0x4eb5, "MP1", CompatClass::Mp1),
    (0x4ef7, "Honyar MP1", CompatClass::Mp1),
    (0x2714, "A1", CompatClass::A1),
    (0x4ead, "Hysen Thermostat", CompatClass::Hysen),
    (0x4e4d, "Dooya DT360E", CompatClass::Dooya),
    (0x2712, "RM2", CompatClass::Rm),
    (0x2737, "RM Mini", CompatClass::Rm),
    (0x273d, "RM Pro Phicomm", CompatClass::Rm),
    (0x2783, "RM2 Home Plus", CompatClass::Rm),
    (0x277c, "RM2 Home Plus GDT", CompatClass::Rm),
    (0x272a, "RM2 Pro Plus", CompatClass::Rm),
    (0x2787, "RM2 Pro Plus2", CompatClass::Rm),
    (0x279d, "RM2 Pro Plus3", CompatClass::Rm),
    (0x27a9, "RM2 Pro Plus_300", CompatClass::Rm),
    (0x278b, "RM2 Pro Plus BL", CompatClass::Rm),
    (0x2797, "RM2 Pro Plus HYC", CompatClass::Rm),
    (0x27a1, "RM2 Pro Plus R1", CompatClass::Rm),
    (0x27a6, "RM2 Pro PP", CompatClass::Rm),
    (0x278f, "RM Mini Shate", CompatClass::Rm),
    (0x27c2, "RM Mini 3", CompatClass::Rm),
    (0x5f36, "RM Mini 3", CompatClass::Rm),
    (0x51da, "RM4 Mini", CompatClass::Rm4),
    (0x6026, "RM4 Pro", CompatClass::Rm4),
    (0x6070, "RM4c Mini", CompatClass::Rm4),
    (0x610e, "RM4 Mini", CompatClass::Rm4),
    (0x610f, "RM4c", CompatClass::Rm4),
    (0x61a2, "RM4 Pro", CompatClass::Rm4),
    (0x62bc, "RM4 Mini", CompatClass::Rm4),
    (0x62be, "RM4c Mini", CompatClass::Rm4),
    (0x649b, "RM4 Pro", CompatClass::Rm4),
    (0x653c, "RM4 Pro", CompatClass::Rm4),
];

/// Looks up model descriptors and decides compatibility.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    force_compatibility: bool,
}

impl DeviceRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            force_compatibility: config.debug.force_compatibility,
        }
    }

    /// Resolve a code. Unknown codes never fail; they map to an "Unknown"
    /// descriptor whose class is the raw code.
    pub fn lookup(&self, code: DeviceTypeCode) -> DeviceDescriptor {
        DEVICE_TABLE
            .iter()
            .find(|(c, _, _)| *c == code.0)
            .map(|&(_, name, class)| DeviceDescriptor {
                display_name: name,
                capabilities: class.capabilities(),
                class,
            })
            .unwrap_or(DeviceDescriptor {
                display_name: "Unknown",
                capabilities: &[],
                class: CompatClass::Unknown(code.0),
            })
    }

    /// Two codes are compatible when their classes match, or always under the
    /// debug override.
    pub fn is_compatible(&self, found: DeviceTypeCode, expected: DeviceTypeCode) -> bool {
        let compatible =
            self.force_compatibility || self.lookup(found).class == self.lookup(expected).class;
        debug!(
            "compatibility: found = {}  expected = {}  compatible = {}",
            found, expected, compatible
        );
        compatible
    }
}
