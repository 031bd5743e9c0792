use crate::sig::{CharacteristicRepresentation, Format, Unit};
use crate::tlv::TLVError;
use crate::{CharId, HapError};
use bitfield_struct::bitfield;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Longest string or opaque value a characteristic can hold.
pub const VALUE_MAX_LENGTH: usize = 64;

pub const HOMEKIT_BASE_UUID_BYTES: [u8; 16] = [
    0x91, 0x52, 0x76, 0xbb, 0x26, 0x0, 0x0, 0x80, 0x0, 0x10, 0x0, 0x0, // First block.
    0x0, 0x0, 0x0, 0x0,
];

/// Short form of a HomeKit type uuid, expanded with the HomeKit base uuid.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HomekitUuid16(u16);

impl HomekitUuid16 {
    pub const fn new(uuid: u16) -> Self {
        Self(uuid)
    }
    pub const fn to_le_bytes_long(&self) -> [u8; 16] {
        let mut raw_bytes = HOMEKIT_BASE_UUID_BYTES;
        let [low, high] = self.0.to_le_bytes();
        raw_bytes[12] = low;
        raw_bytes[13] = high;
        raw_bytes
    }
}

/// Brightness, percentage.
pub const BRIGHTNESS: HomekitUuid16 = HomekitUuid16::new(0x0008);
/// On/Off characteristic, for lightbulb
pub const ON: HomekitUuid16 = HomekitUuid16::new(0x0025);
/// Lightbulb service.
pub const SERVICE_LIGHTBULB: HomekitUuid16 = HomekitUuid16::new(0x0043);

// https://github.com/apple/HomeKitADK/blob/fb201f98f5fdc7fef6a455054f08b59cca5d1ec8/HAP/HAPBLECharacteristic%2BSignature.c
#[bitfield(u16)]
#[derive(PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CharacteristicProperties {
    /// Readable without a secure session.
    pub read_open: bool,
    /// Writable without a secure session.
    pub write_open: bool,
    pub supports_authorization_data: bool,
    /// Writes must go through timed write and execute write.
    pub requires_timed_write: bool,
    pub read: bool,
    pub write: bool,
    pub hidden: bool,
    pub supports_event_notification: bool,
    pub supports_disconnected_notification: bool,
    pub supports_broadcast_notification: bool,
    #[bits(6)]
    __: u16,
}

/// Value of a characteristic, the variant follows the format of the characteristic.
#[derive(Debug, Clone, PartialEq)]
pub enum CharacteristicValue {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I32(i32),
    F32(f32),
    String(heapless::String<VALUE_MAX_LENGTH>),
    Data(heapless::Vec<u8, VALUE_MAX_LENGTH>),
}

impl CharacteristicValue {
    pub fn format(&self) -> Format {
        match self {
            CharacteristicValue::Bool(_) => Format::Boolean,
            CharacteristicValue::U8(_) => Format::U8,
            CharacteristicValue::U16(_) => Format::U16,
            CharacteristicValue::U32(_) => Format::U32,
            CharacteristicValue::U64(_) => Format::U64,
            CharacteristicValue::I32(_) => Format::I32,
            CharacteristicValue::F32(_) => Format::F32,
            CharacteristicValue::String(_) => Format::StringUtf8,
            CharacteristicValue::Data(_) => Format::Opaque,
        }
    }

    /// Decode a value received from a controller.
    ///
    /// Unsigned integers may arrive in any of the variable length integer widths, they are range checked against the
    /// format afterwards.
    pub fn decode(format: Format, data: &[u8]) -> Result<Self, HapError> {
        let value = match format {
            Format::Boolean => match data {
                [0] => CharacteristicValue::Bool(false),
                [1] => CharacteristicValue::Bool(true),
                _ => return Err(HapError::InvalidData),
            },
            Format::U8 => CharacteristicValue::U8(narrow(crate::varint::decode(data)?)?),
            Format::U16 => CharacteristicValue::U16(narrow(crate::varint::decode(data)?)?),
            Format::U32 => CharacteristicValue::U32(narrow(crate::varint::decode(data)?)?),
            Format::U64 => CharacteristicValue::U64(crate::varint::decode(data)?),
            Format::I32 => CharacteristicValue::I32(i32::from_le_bytes(
                data.try_into().map_err(|_| HapError::InvalidData)?,
            )),
            Format::F32 => CharacteristicValue::F32(f32::from_le_bytes(
                data.try_into().map_err(|_| HapError::InvalidData)?,
            )),
            Format::StringUtf8 => {
                let s = core::str::from_utf8(data).map_err(|_| HapError::InvalidData)?;
                CharacteristicValue::String(
                    heapless::String::try_from(s).map_err(|_| HapError::OutOfResources)?,
                )
            }
            Format::Opaque => CharacteristicValue::Data(
                heapless::Vec::from_slice(data).map_err(|_| HapError::OutOfResources)?,
            ),
        };
        Ok(value)
    }

    /// Encode the value into `out`, integers take the full width of their format.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, HapError> {
        let v = match self {
            CharacteristicValue::Bool(v) => return put(out, &[*v as u8]),
            CharacteristicValue::U8(v) => *v as u64,
            CharacteristicValue::U16(v) => *v as u64,
            CharacteristicValue::U32(v) => *v as u64,
            CharacteristicValue::U64(v) => *v,
            CharacteristicValue::I32(v) => return put(out, &v.to_le_bytes()),
            CharacteristicValue::F32(v) => return put(out, &v.to_le_bytes()),
            CharacteristicValue::String(v) => return put(out, v.as_bytes()),
            CharacteristicValue::Data(v) => return put(out, v),
        };
        let width = self.format().fixed_size().ok_or(HapError::InvalidState)?;
        Ok(crate::varint::encode(v, width, out)?)
    }

    /// Integer view of the value, for range checks.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            CharacteristicValue::U8(v) => Some(*v as i128),
            CharacteristicValue::U16(v) => Some(*v as i128),
            CharacteristicValue::U32(v) => Some(*v as i128),
            CharacteristicValue::U64(v) => Some(*v as i128),
            CharacteristicValue::I32(v) => Some(*v as i128),
            _ => None,
        }
    }
}

fn narrow<T: TryFrom<u64>>(v: u64) -> Result<T, TLVError> {
    T::try_from(v).map_err(|_| TLVError::UnexpectedValue)
}

fn put(out: &mut [u8], data: &[u8]) -> Result<usize, HapError> {
    if data.len() > out.len() {
        return Err(HapError::OutOfResources);
    }
    out[0..data.len()].copy_from_slice(data);
    Ok(data.len())
}

/// Inclusive range an integer characteristic must stay within.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ValidRange {
    pub min: i64,
    pub max: i64,
}
impl ValidRange {
    pub fn contains(&self, value: &CharacteristicValue) -> bool {
        match value.as_i128() {
            Some(v) => (self.min as i128) <= v && v <= (self.max as i128),
            None => true,
        }
    }

    /// GATT valid range descriptor, min then max in the format of the characteristic.
    pub fn encode(&self, format: Format, out: &mut [u8]) -> Result<usize, HapError> {
        let width = format.fixed_size().ok_or(HapError::InvalidState)?;
        if out.len() < 2 * width {
            return Err(HapError::OutOfResources);
        }
        if format.is_unsigned() {
            let min = u64::try_from(self.min).map_err(|_| HapError::InvalidState)?;
            let max = u64::try_from(self.max).map_err(|_| HapError::InvalidState)?;
            crate::varint::encode(min, width, &mut out[0..width])?;
            crate::varint::encode(max, width, &mut out[width..2 * width])?;
        } else if format == Format::I32 {
            let min = i32::try_from(self.min).map_err(|_| HapError::InvalidState)?;
            let max = i32::try_from(self.max).map_err(|_| HapError::InvalidState)?;
            out[0..4].copy_from_slice(&min.to_le_bytes());
            out[4..8].copy_from_slice(&max.to_le_bytes());
        } else {
            return Err(HapError::InvalidState);
        }
        Ok(2 * width)
    }
}

/// Static description of a characteristic.
#[derive(Debug, Copy, Clone)]
pub struct Characteristic {
    pub iid: CharId,
    pub char_type: HomekitUuid16,
    pub service_iid: u16,
    pub service_type: HomekitUuid16,
    pub format: Format,
    pub unit: Unit,
    pub properties: CharacteristicProperties,
    pub range: Option<ValidRange>,
}

impl Characteristic {
    pub fn new(iid: CharId, char_type: HomekitUuid16, format: Format) -> Self {
        Self {
            iid,
            char_type,
            service_iid: 0,
            service_type: HomekitUuid16::new(0),
            format,
            unit: Unit::UnitLess,
            properties: CharacteristicProperties::new()
                .with_read(true)
                .with_write(true)
                .with_supports_event_notification(true),
            range: None,
        }
    }
    pub fn with_service(mut self, service_iid: u16, service_type: HomekitUuid16) -> Self {
        self.service_iid = service_iid;
        self.service_type = service_type;
        self
    }
    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }
    pub fn with_properties(mut self, properties: CharacteristicProperties) -> Self {
        self.properties = properties;
        self
    }
    pub fn with_range(mut self, min: i64, max: i64) -> Self {
        self.range = Some(ValidRange { min, max });
        self
    }

    pub fn representation(&self) -> CharacteristicRepresentation {
        CharacteristicRepresentation::new(self.format, self.unit)
    }

    /// Decode and validate a value written by a controller.
    pub fn decode_write(&self, data: &[u8]) -> Result<CharacteristicValue, HapError> {
        let value = CharacteristicValue::decode(self.format, data)?;
        if let Some(range) = &self.range {
            if !range.contains(&value) {
                warn!("value out of range for {:?}", self.iid.0);
                return Err(HapError::InvalidData);
            }
        }
        Ok(value)
    }
}

/// The characteristics an accessory exposes, looked up by instance id.
#[derive(Debug, Copy, Clone)]
pub struct AttributeDatabase<'a> {
    characteristics: &'a [Characteristic],
}

impl<'a> AttributeDatabase<'a> {
    /// Instance ids must be unique and non-zero.
    pub fn new(characteristics: &'a [Characteristic]) -> Result<Self, HapError> {
        for (i, c) in characteristics.iter().enumerate() {
            if c.iid.0 == 0 || characteristics[i + 1..].iter().any(|o| o.iid == c.iid) {
                error!("invalid or duplicate instance id {}", c.iid.0);
                return Err(HapError::InvalidData);
            }
        }
        Ok(Self { characteristics })
    }

    pub fn get(&self, iid: CharId) -> Option<&'a Characteristic> {
        self.characteristics.iter().find(|c| c.iid == iid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Characteristic> {
        self.characteristics.iter()
    }
}
