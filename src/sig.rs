// Bluetooth SIG assigned numbers, used by the presentation format descriptor of a characteristic signature.
use zerocopy::{Immutable, IntoBytes, KnownLayout, TryFromBytes};

// https://bitbucket.org/bluetooth-SIG/public/src/main/assigned_numbers/core/formattypes.yaml
#[derive(PartialEq, Eq, TryFromBytes, IntoBytes, Immutable, KnownLayout, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Format {
    Boolean = 0x01,
    U8 = 0x04,
    U16 = 0x06,
    U32 = 0x08,
    U64 = 0x0a,
    I32 = 0x10,
    F32 = 0x14,
    StringUtf8 = 0x19,
    Opaque = 0x1B,
}
impl Format {
    /// Number of bytes for fixed size formats.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Format::Boolean | Format::U8 => Some(1),
            Format::U16 => Some(2),
            Format::U32 | Format::I32 | Format::F32 => Some(4),
            Format::U64 => Some(8),
            Format::StringUtf8 | Format::Opaque => None,
        }
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, Format::U8 | Format::U16 | Format::U32 | Format::U64)
    }
}

// https://bitbucket.org/bluetooth-SIG/public/src/main/assigned_numbers/uuids/units.yaml
#[derive(PartialEq, Eq, TryFromBytes, IntoBytes, Immutable, KnownLayout, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum Unit {
    UnitLess = 0x2700,
    Second = 0x2703,
    Celsius = 0x272f,
    ArcDegree = 0x2763,
    Percentage = 0x27AD,
    Lux = 0x2731,
}

#[derive(PartialEq, Eq, TryFromBytes, IntoBytes, Immutable, KnownLayout, Debug, Copy, Clone)]
#[repr(u8)]
pub enum Namespace {
    Bluetooth = 0x01,
}

/// GATT presentation format descriptor, 7 bytes on the wire.
#[derive(PartialEq, Eq, TryFromBytes, IntoBytes, Immutable, KnownLayout, Debug, Copy, Clone)]
#[repr(C, packed)]
pub struct CharacteristicRepresentation {
    pub format: Format,
    pub exponent: i8,
    pub unit: Unit,
    pub namespace: Namespace,
    pub description: u16,
}
impl CharacteristicRepresentation {
    pub fn new(format: Format, unit: Unit) -> Self {
        Self {
            format,
            unit,
            ..Default::default()
        }
    }
}
impl Default for CharacteristicRepresentation {
    fn default() -> Self {
        Self {
            format: Format::U8,
            exponent: 0,
            unit: Unit::UnitLess,
            namespace: Namespace::Bluetooth,
            description: 0,
        }
    }
}
