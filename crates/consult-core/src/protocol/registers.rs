//! Register catalog
//!
//! Static table of the engine registers a Consult ECU can be polled for.
//! Any particular ECU answers only a subset of these depending on engine type.
//!
//! Dual-byte registers are addressed by two ids: the MSB id listed here and
//! the LSB id directly after it. Their raw value is `msb * 256 + lsb`.

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

/// Number of bytes a register occupies in a reply frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Width {
    /// Single byte
    One,
    /// MSB/LSB pair
    Two,
}

impl Width {
    /// Byte count
    pub fn bytes(&self) -> usize {
        match self {
            Width::One => 1,
            Width::Two => 2,
        }
    }
}

/// Conversion from a raw register value to a physical value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ScaleRule {
    /// `raw * factor`
    Factor(f64),
    /// `raw - offset`
    Offset(f64),
    /// `base - raw`
    Inverted(f64),
    /// Raw value, or a bit register reported as-is
    Raw,
}

impl ScaleRule {
    /// Apply the rule to a raw value
    pub fn apply(&self, raw: u16) -> f64 {
        let raw = raw as f64;
        match *self {
            ScaleRule::Factor(factor) => raw * factor,
            ScaleRule::Offset(offset) => raw - offset,
            ScaleRule::Inverted(base) => base - raw,
            ScaleRule::Raw => raw,
        }
    }
}

/// A register known to the catalog
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Register {
    /// Snapshot and configuration key
    pub name: &'static str,
    /// Human-readable label
    pub label: &'static str,
    /// Register id (MSB id for dual-byte registers)
    pub id: u8,
    /// Byte width
    pub width: Width,
    /// Scaling rule
    pub scale: ScaleRule,
    /// Physical units after scaling
    pub units: &'static str,
}

impl Register {
    const fn single(
        name: &'static str,
        label: &'static str,
        id: u8,
        scale: ScaleRule,
        units: &'static str,
    ) -> Self {
        Self {
            name,
            label,
            id,
            width: Width::One,
            scale,
            units,
        }
    }

    const fn dual(
        name: &'static str,
        label: &'static str,
        id: u8,
        scale: ScaleRule,
        units: &'static str,
    ) -> Self {
        Self {
            name,
            label,
            id,
            width: Width::Two,
            scale,
            units,
        }
    }

    /// LSB id of a dual-byte register
    pub fn lsb_id(&self) -> Option<u8> {
        match self.width {
            Width::One => None,
            Width::Two => Some(self.id + 1),
        }
    }

    /// Ids polled for this register, MSB first
    pub fn poll_ids(&self) -> impl Iterator<Item = u8> {
        std::iter::once(self.id).chain(self.lsb_id())
    }

    /// Combine raw bytes and scale them
    pub fn decode(&self, msb: u8, lsb: Option<u8>) -> f64 {
        let raw = match (self.width, lsb) {
            (Width::Two, Some(lsb)) => BigEndian::read_u16(&[msb, lsb]),
            _ => u16::from(msb),
        };
        self.scale.apply(raw)
    }
}

/// Number of registers in the catalog
pub const CATALOG_LEN: usize = 29;

/// Every known register, in declaration (and id) order
pub static CATALOG: [Register; CATALOG_LEN] = [
    Register::dual("rpm", "CAS Position", 0x00, ScaleRule::Factor(12.5), "rpm"),
    Register::dual("rpm_reference", "CAS Reference", 0x02, ScaleRule::Factor(8.0), "rpm"),
    Register::dual("maf_voltage", "MAF Voltage", 0x04, ScaleRule::Factor(0.005), "V"),
    Register::dual("maf_voltage_rh", "RH MAF Voltage", 0x06, ScaleRule::Factor(0.005), "V"),
    Register::single("coolant_temp", "Coolant Temp", 0x08, ScaleRule::Offset(50.0), "°C"),
    Register::single("o2_voltage_lh", "LH O2 Sensor Voltage", 0x09, ScaleRule::Factor(0.01), "V"),
    Register::single("o2_voltage_rh", "RH O2 Sensor Voltage", 0x0A, ScaleRule::Factor(0.01), "V"),
    Register::single("speed", "Vehicle Speed", 0x0B, ScaleRule::Factor(2.0), "kph"),
    Register::single("battery_voltage", "Battery Voltage", 0x0C, ScaleRule::Factor(0.80), "V"),
    Register::single("throttle_voltage", "Throttle Position Sensor", 0x0D, ScaleRule::Factor(0.02), "V"),
    Register::single("fuel_temp", "Fuel Temp", 0x0F, ScaleRule::Offset(50.0), "°C"),
    Register::single("intake_air_temp", "Intake Air Temp", 0x11, ScaleRule::Offset(50.0), "°C"),
    Register::single("exhaust_gas_temp_voltage", "Exhaust Gas Temp", 0x12, ScaleRule::Factor(0.02), "V"),
    Register::single("digital_bit_register", "Digital Bit Register", 0x13, ScaleRule::Raw, "bits"),
    Register::dual("injection_time_lh", "Injection Time (LH)", 0x14, ScaleRule::Factor(0.01), "ms"),
    Register::single("ignition_timing", "Ignition Timing", 0x16, ScaleRule::Inverted(110.0), "deg BTDC"),
    Register::single("aac_valve", "AAC Valve", 0x17, ScaleRule::Factor(0.5), "%"),
    Register::single("alpha_lh", "A/F Alpha LH", 0x1A, ScaleRule::Raw, "%"),
    Register::single("alpha_rh", "A/F Alpha RH", 0x1B, ScaleRule::Raw, "%"),
    Register::single("alpha_lh_selflearn", "A/F Alpha LH (Self-learn)", 0x1C, ScaleRule::Raw, "%"),
    Register::single("alpha_rh_selflearn", "A/F Alpha RH (Self-learn)", 0x1D, ScaleRule::Raw, "%"),
    Register::single("digital_control_1", "Digital Control Register 1", 0x1E, ScaleRule::Raw, "bits"),
    Register::single("digital_control_2", "Digital Control Register 2", 0x1F, ScaleRule::Raw, "bits"),
    Register::single("mr_fc_mnt", "M/R F/C MNT", 0x21, ScaleRule::Raw, "bits"),
    Register::dual("injection_time_rh", "Injection Time (RH)", 0x22, ScaleRule::Factor(0.01), "ms"),
    Register::single("waste_gate", "Waste Gate Solenoid", 0x28, ScaleRule::Raw, "%"),
    Register::single("map_voltage", "Turbo Boost Sensor Voltage", 0x29, ScaleRule::Factor(0.02), "V"),
    Register::single("engine_mount", "Engine Mount", 0x2A, ScaleRule::Raw, "bits"),
    Register::single("position_counter", "Position Counter", 0x2E, ScaleRule::Raw, "count"),
];

/// All registers in declaration order
pub fn catalog() -> &'static [Register] {
    &CATALOG
}

/// Look up a register by id (MSB id for dual-byte registers)
pub fn lookup(id: u8) -> Option<&'static Register> {
    CATALOG.iter().find(|r| r.id == id)
}

/// Look up a register by name
pub fn lookup_name(name: &str) -> Option<&'static Register> {
    CATALOG.iter().find(|r| r.name == name)
}

/// Position of a register in the catalog
pub(crate) fn catalog_index(id: u8) -> Option<usize> {
    CATALOG.iter().position(|r| r.id == id)
}
