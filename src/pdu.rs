use crate::tlv::{TLVError, TLVWriter};
use crate::{CharId, HapError, TId};
use bitfield_struct::bitfield;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, TryFromBytes};

// PDU looks like:
// control field | some fixed params | body length | TLV
// Fixed params are opcode, tid and iid for a request, tid and status for a response.
//
// The body length is optional for the last PDU in a message; if it is absent or zero there is no body.

pub trait WriteIntoLength {
    fn write_into_length(&self, buffer: &mut [u8]) -> Result<usize, HapError>;
}
impl<T: IntoBytes + Immutable> WriteIntoLength for T {
    fn write_into_length(&self, buffer: &mut [u8]) -> Result<usize, HapError> {
        let as_bytes = self.as_bytes();
        let l = as_bytes.len();
        if l <= buffer.len() {
            buffer[0..l].copy_from_slice(as_bytes);
            Ok(l)
        } else {
            Err(HapError::OutOfResources)
        }
    }
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum OpCode {
    CharacteristicSignatureRead = 0x01,
    CharacteristicWrite = 0x02,
    CharacteristicRead = 0x03,
    CharacteristicTimedWrite = 0x04,
    CharacteristicExecuteWrite = 0x05,
    ServiceSignatureRead = 0x06,
    CharacteristicConfiguration = 0x07,
    ProtocolConfiguration = 0x08,
    Token = 0x10,
    TokenUpdate = 0x11,
    Info = 0x12,
}
impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::CharacteristicSignatureRead,
            0x02 => Self::CharacteristicWrite,
            0x03 => Self::CharacteristicRead,
            0x04 => Self::CharacteristicTimedWrite,
            0x05 => Self::CharacteristicExecuteWrite,
            0x06 => Self::ServiceSignatureRead,
            0x07 => Self::CharacteristicConfiguration,
            0x08 => Self::ProtocolConfiguration,
            0x10 => Self::Token,
            0x11 => Self::TokenUpdate,
            0x12 => Self::Info,
            _ => return None,
        })
    }
}

#[derive(PartialEq, Eq, TryFromBytes, IntoBytes, Immutable, KnownLayout, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Status {
    // Success.
    Success = 0x00,

    // Unsupported-PDU.
    UnsupportedPDU = 0x01,

    // Max-Procedures.
    MaxProcedures = 0x02,

    // Insufficient Authorization.
    InsufficientAuthorization = 0x03,

    // Invalid instance ID.
    InvalidInstanceID = 0x04,

    // Insufficient Authentication.
    InsufficientAuthentication = 0x05,

    // Invalid Request.
    InvalidRequest = 0x06,
}
impl Status {
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::try_read_from_bytes(&[value]).ok()
    }
}

#[derive(PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum PduType {
    Request = 0,
    Response = 1,
    Notification = 2,
    Invalid = 7,
}
impl PduType {
    const fn into_bits(self) -> u8 {
        self as _
    }
    const fn from_bits(value: u8) -> Self {
        match value {
            0 => Self::Request,
            1 => Self::Response,
            2 => Self::Notification,
            _ => Self::Invalid,
        }
    }
}

#[bitfield(u8)]
#[derive(PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ControlField {
    #[bits(1)]
    __: u8, // 1 is reserved, so always zero.

    #[bits(3)]
    pub pdu_type: PduType,

    #[bits(1)]
    pub extended_iid: bool,

    // 5 and 6, reserved.
    #[bits(2)]
    __: u8,

    // bit 7
    #[bits(1)]
    pub continuation: bool,
}
impl ControlField {
    pub fn request() -> Self {
        Self::new().with_pdu_type(PduType::Request)
    }
    pub fn response() -> Self {
        Self::new().with_pdu_type(PduType::Response)
    }
    pub fn notification() -> Self {
        Self::new().with_pdu_type(PduType::Notification)
    }
}

#[derive(Debug, Copy, Clone, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C, packed)]
pub struct RequestHeader {
    pub control: ControlField,
    /// Raw opcode, unknown opcodes still have to be answered.
    pub opcode: u8,
    pub tid: TId,
    pub iid: U16,
}
impl RequestHeader {
    pub fn new(opcode: OpCode, tid: TId, iid: CharId) -> Self {
        Self {
            control: ControlField::request(),
            opcode: opcode as u8,
            tid,
            iid: U16::new(iid.0),
        }
    }
    pub fn char_id(&self) -> CharId {
        CharId(self.iid.get())
    }
    pub fn op(&self) -> Option<OpCode> {
        OpCode::from_u8(self.opcode)
    }
    pub fn to_success(&self) -> ResponseHeader {
        self.to_status(Status::Success)
    }
    pub fn to_status(&self, status: Status) -> ResponseHeader {
        ResponseHeader {
            control: ControlField::response(),
            tid: self.tid,
            status: status as u8,
        }
    }
}

#[derive(Debug, Copy, Clone, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C, packed)]
pub struct ResponseHeader {
    pub control: ControlField,
    pub tid: TId,
    /// Raw status byte, see [`Status`].
    pub status: u8,
}
impl ResponseHeader {
    pub fn status(&self) -> Option<Status> {
        Status::from_u8(self.status)
    }
}

/// Header of an event notification frame, the body holds the new value.
#[derive(Debug, Copy, Clone, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C, packed)]
pub struct NotificationHeader {
    pub control: ControlField,
    pub iid: U16,
}
impl NotificationHeader {
    pub fn new(iid: CharId) -> Self {
        Self {
            control: ControlField::notification(),
            iid: U16::new(iid.0),
        }
    }
    pub fn char_id(&self) -> CharId {
        CharId(self.iid.get())
    }
}

// https://github.com/apple/HomeKitADK/blob/fb201f98f5fdc7fef6a455054f08b59cca5d1ec8/HAP/HAPBLEPDU%2BTLV.h#L22-L26
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
#[repr(u8)]
pub enum PduTLVType {
    /// HAP-Param-Value.
    Value = 0x01,

    /// HAP-Param-Additional-Authorization-Data.
    AdditionalAuthorizationData = 0x02,

    /// HAP-Param-Origin (local vs remote).
    Origin = 0x03,

    /// HAP-Param-Characteristic-Type.
    CharacteristicType = 0x04,

    /// HAP-Param-Characteristic-Instance-ID.
    CharacteristicInstanceID = 0x05,

    /// HAP-Param-Service-Type.
    ServiceType = 0x06,

    /// HAP-Param-Service-Instance-ID.
    ServiceInstanceID = 0x07,

    /// HAP-Param-TTL.
    Ttl = 0x08,

    /// HAP-Param-Return-Response.
    ReturnResponse = 0x09,

    /// HAP-Param-HAP-Characteristic-Properties-Descriptor.
    HAPCharacteristicPropertiesDescriptor = 0x0A,

    /// HAP-Param-GATT-User-Description-Descriptor.
    GATTUserDescriptionDescriptor = 0x0B,

    /// HAP-Param-GATT-Presentation-Format-Descriptor.
    GATTPresentationFormatDescriptor = 0x0C,

    /// HAP-Param-GATT-Valid-Range.
    GATTValidRange = 0x0D,

    /// HAP-Param-HAP-Step-Value-Descriptor.
    HAPStepValueDescriptor = 0x0E,

    /// HAP-Param-HAP-Service-Properties.
    HAPServiceProperties = 0x0F,

    /// HAP-Param-HAP-Linked-Services.
    HAPLinkedServices = 0x10,

    /// HAP-Param-HAP-Valid-Values-Descriptor.
    HAPValidValuesDescriptor = 0x11,

    /// HAP-Param-HAP-Valid-Values-Range-Descriptor
    HAPValidValuesRangeDescriptor = 0x12,
}
impl From<PduTLVType> for u8 {
    fn from(v: PduTLVType) -> u8 {
        v as u8
    }
}

/// Tags in the body of a characteristic configuration request, these are scoped to that opcode.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
#[repr(u8)]
pub enum ConfigurationTLVType {
    Properties = 0x01,
    BroadcastInterval = 0x02,
}
impl From<ConfigurationTLVType> for u8 {
    fn from(v: ConfigurationTLVType) -> u8 {
        v as u8
    }
}

/// Bit in the configuration properties that requests event notifications.
pub const CONFIGURATION_PROPERTY_EVENTS: u16 = 0x0001;

crate::typed_tlv!(TLVValue, PduTLVType::Value);
crate::typed_tlv!(TLVOrigin, PduTLVType::Origin);
crate::typed_tlv!(TLVTtl, PduTLVType::Ttl);
crate::typed_tlv!(TLVReturnResponse, PduTLVType::ReturnResponse);
crate::typed_tlv!(TLVConfigurationProperties, ConfigurationTLVType::Properties);

/// Writes a body length placeholder, then TLV entries; [`BodyBuilder::end`] patches in the final length.
pub struct BodyBuilder<'a> {
    start: usize, // this is where the body length always goes.
    position: usize,
    buffer: &'a mut [u8],
}
impl<'a> BodyBuilder<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Result<Self, TLVError> {
        Self::new_at(buffer, 0)
    }
    pub fn new_at(buffer: &'a mut [u8], start: usize) -> Result<Self, TLVError> {
        if start + 2 > buffer.len() {
            return Err(TLVError::BufferOverrun);
        }
        buffer[start..start + 2].fill(0);
        Ok(Self {
            start,
            position: start + 2,
            buffer,
        })
    }

    pub fn add_slice<T: Into<u8>>(mut self, t: T, value: &[u8]) -> Result<Self, TLVError> {
        self.position = TLVWriter::new_at(&mut *self.buffer, self.position)
            .add_slice(t, value)?
            .end();
        Ok(self)
    }

    pub fn add_uint<T: Into<u8>>(mut self, t: T, value: u64) -> Result<Self, TLVError> {
        self.position = TLVWriter::new_at(&mut *self.buffer, self.position)
            .add_uint(t, value)?
            .end();
        Ok(self)
    }

    pub fn add_entry<T: Into<u8>, V: IntoBytes + Immutable + ?Sized>(
        self,
        t: T,
        value: &V,
    ) -> Result<Self, TLVError> {
        self.add_slice(t, value.as_bytes())
    }

    /// Number of body bytes written so far.
    pub fn body_length(&self) -> usize {
        self.position - self.start - 2
    }

    /// Patch the length and return the end of the PDU.
    pub fn end(self) -> Result<usize, TLVError> {
        let body_length = self.body_length();
        let length = u16::try_from(body_length).map_err(|_| TLVError::BufferOverrun)?;
        self.buffer[self.start..self.start + 2].copy_from_slice(&length.to_le_bytes());
        Ok(self.position)
    }

    /// Like [`BodyBuilder::end`], but an empty body drops the length field entirely.
    ///
    /// Only valid for the last PDU of a message, a PDU followed by others always carries a length.
    pub fn end_omit_empty(self) -> Result<usize, TLVError> {
        if self.body_length() == 0 {
            Ok(self.start)
        } else {
            self.end()
        }
    }
}

/// One parsed PDU, the header plus its body if there was one.
#[derive(Debug, Copy, Clone)]
pub struct Pdu<'a, H> {
    pub header: H,
    pub body: Option<&'a [u8]>,
}
impl<'a, H> Pdu<'a, H> {
    /// Body bytes, empty if there was no body.
    pub fn body(&self) -> &'a [u8] {
        self.body.unwrap_or(&[])
    }
}

pub type RequestPdu<'a> = Pdu<'a, RequestHeader>;
pub type ResponsePdu<'a> = Pdu<'a, ResponseHeader>;
pub type NotificationPdu<'a> = Pdu<'a, NotificationHeader>;

/// Walks the PDUs in a decrypted message, sequentially using the body length of each.
#[derive(Debug, Clone)]
pub struct PduReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> PduReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.position >= self.buffer.len()
    }

    pub fn next_request(&mut self) -> Option<Result<RequestPdu<'a>, HapError>> {
        self.next_pdu::<RequestHeader>()
    }

    pub fn next_response(&mut self) -> Option<Result<ResponsePdu<'a>, HapError>> {
        self.next_pdu::<ResponseHeader>()
    }

    pub fn next_notification(&mut self) -> Option<Result<NotificationPdu<'a>, HapError>> {
        self.next_pdu::<NotificationHeader>()
    }

    fn next_pdu<H: FromBytes>(&mut self) -> Option<Result<Pdu<'a, H>, HapError>> {
        if self.is_empty() {
            return None;
        }
        let r = self.parse_pdu::<H>();
        if r.is_err() {
            self.position = self.buffer.len();
        }
        Some(r)
    }

    fn parse_pdu<H: FromBytes>(&mut self) -> Result<Pdu<'a, H>, HapError> {
        let remaining = &self.buffer[self.position..];
        let (header, remaining) = H::read_from_prefix(remaining).map_err(|_| HapError::InvalidData)?;
        let header_length = self.buffer.len() - self.position - remaining.len();
        self.position += header_length;
        match remaining.len() {
            0 => return Ok(Pdu { header, body: None }),
            1 => return Err(HapError::InvalidData),
            _ => {}
        }
        let body_length = u16::from_le_bytes([remaining[0], remaining[1]]) as usize;
        let body = remaining
            .get(2..2 + body_length)
            .ok_or(HapError::InvalidData)?;
        self.position += 2 + body_length;
        Ok(Pdu {
            header,
            body: if body_length == 0 { None } else { Some(body) },
        })
    }
}
