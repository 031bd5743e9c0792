//! Controller side of a secure session, composes requests and reads the responses and notifications.
//!
//! The accessory only ever needs [`crate::server`], this exists to drive an accessory from tests and tools.

use crate::crypto::aead::{SessionChannel, CHACHA20_POLY1305_TAG_BYTES};
use crate::pdu::{
    self, BodyBuilder, ConfigurationTLVType, OpCode, PduReader, PduTLVType, RequestHeader,
    ResponsePdu, WriteIntoLength,
};
use crate::server::{Rejection, TransportReply, Ttl};
use crate::session::SessionKeys;
use crate::tlv::{TLVError, TLVReader};
use crate::{CharId, HapError, TId};

/// Carries an encrypted message to the accessory and the encrypted reply back.
pub trait Transport {
    fn exchange(&mut self, request: &[u8], response: &mut [u8])
        -> Result<TransportReply, HapError>;
}

/// Builds the plaintext of a message, every PDU carries its body length.
pub struct MessageBuilder<'a> {
    buffer: &'a mut [u8],
    position: usize,
    next_tid: u8,
}

impl<'a> MessageBuilder<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
            next_tid: 1,
        }
    }

    /// Continue numbering transactions from `tid`.
    pub fn starting_at(mut self, tid: TId) -> Self {
        self.next_tid = tid.0;
        self
    }

    /// Transaction id the next request will get.
    pub fn next_tid(&self) -> TId {
        TId(self.next_tid)
    }

    fn add<F>(mut self, opcode: u8, iid: CharId, f: F) -> Result<Self, HapError>
    where
        F: FnOnce(BodyBuilder<'_>) -> Result<BodyBuilder<'_>, TLVError>,
    {
        let tid = TId(self.next_tid);
        self.next_tid = self.next_tid.wrapping_add(1);
        let mut header = RequestHeader::new(OpCode::CharacteristicRead, tid, iid);
        header.opcode = opcode;
        let remaining = self
            .buffer
            .get_mut(self.position..)
            .ok_or(HapError::OutOfResources)?;
        let len = header.write_into_length(remaining)?;
        let end = f(BodyBuilder::new_at(remaining, len)?)?.end()?;
        self.position += end;
        Ok(self)
    }

    /// A request with a raw opcode and no body.
    pub fn raw(self, opcode: u8, iid: CharId) -> Result<Self, HapError> {
        self.add(opcode, iid, |b| Ok(b))
    }

    pub fn read(self, iid: CharId) -> Result<Self, HapError> {
        self.add(OpCode::CharacteristicRead as u8, iid, |b| Ok(b))
    }

    pub fn signature_read(self, iid: CharId) -> Result<Self, HapError> {
        self.add(OpCode::CharacteristicSignatureRead as u8, iid, |b| Ok(b))
    }

    pub fn write(self, iid: CharId, value: &[u8], return_response: bool) -> Result<Self, HapError> {
        self.add(OpCode::CharacteristicWrite as u8, iid, |b| {
            let b = b.add_slice(PduTLVType::Value, value)?;
            if return_response {
                b.add_slice(PduTLVType::ReturnResponse, &[1])
            } else {
                Ok(b)
            }
        })
    }

    pub fn timed_write(self, iid: CharId, value: &[u8], ttl: Ttl) -> Result<Self, HapError> {
        self.add(OpCode::CharacteristicTimedWrite as u8, iid, |b| {
            b.add_slice(PduTLVType::Value, value)?
                .add_slice(PduTLVType::Ttl, &[ttl.0])
        })
    }

    pub fn execute_write(self, iid: CharId) -> Result<Self, HapError> {
        self.add(OpCode::CharacteristicExecuteWrite as u8, iid, |b| Ok(b))
    }

    /// Subscribe to or unsubscribe from event notifications.
    pub fn configure_events(self, iid: CharId, enable: bool) -> Result<Self, HapError> {
        let properties = if enable {
            pdu::CONFIGURATION_PROPERTY_EVENTS
        } else {
            0
        };
        self.add(OpCode::CharacteristicConfiguration as u8, iid, |b| {
            b.add_slice(ConfigurationTLVType::Properties, &properties.to_le_bytes())
        })
    }

    /// Length of the plaintext message.
    pub fn end(self) -> usize {
        self.position
    }
}

/// Outcome of a request from the controller's point of view.
#[derive(Debug, Clone)]
pub enum ControllerReply<'a> {
    Responses(PduReader<'a>),
    Rejected(Rejection),
}

/// Controller end of a secure session.
#[derive(Debug)]
pub struct ControllerSession {
    encrypt: SessionChannel,
    decrypt: SessionChannel,
    event: SessionChannel,
}

impl ControllerSession {
    /// Takes the keys as derived by the accessory, the control directions are swapped here.
    pub fn new(accessory_keys: &SessionKeys) -> Self {
        let keys = accessory_keys.controller_view();
        Self {
            encrypt: SessionChannel::new(keys.encrypt),
            decrypt: SessionChannel::new(keys.decrypt),
            event: SessionChannel::new(keys.event),
        }
    }

    /// Encrypt the first `length` bytes of `message` in place and send them.
    ///
    /// A rejected message leaves the response nonce untouched, the accessory never encrypted anything.
    pub fn request<'r>(
        &mut self,
        transport: &mut impl Transport,
        message: &mut [u8],
        length: usize,
        response: &'r mut [u8],
    ) -> Result<ControllerReply<'r>, HapError> {
        if length + CHACHA20_POLY1305_TAG_BYTES > message.len() {
            return Err(HapError::OutOfResources);
        }
        let encrypted = self.encrypt.encrypt(message, length)?;
        match transport.exchange(encrypted, response)? {
            TransportReply::Rejected(r) => Ok(ControllerReply::Rejected(r)),
            TransportReply::Encrypted(len) => {
                let buffer = response.get_mut(0..len).ok_or(HapError::InvalidData)?;
                let plaintext = self.decrypt.decrypt(buffer)?;
                Ok(ControllerReply::Responses(PduReader::new(plaintext)))
            }
        }
    }

    /// Decrypt a notification frame, returning the characteristic and its new value.
    pub fn decrypt_notification<'a>(
        &mut self,
        frame: &'a mut [u8],
    ) -> Result<(CharId, &'a [u8]), HapError> {
        let plaintext = self.event.decrypt(frame)?;
        let mut reader = PduReader::new(plaintext);
        let notification = reader.next_notification().ok_or(HapError::InvalidData)??;
        if notification.header.control.pdu_type() != pdu::PduType::Notification {
            return Err(HapError::InvalidData);
        }
        let body = notification.body();
        let mut value = pdu::TLVValue::tied(body);
        TLVReader::new(body).require_into(&mut [&mut value])?;
        Ok((notification.header.char_id(), value.short_data()?))
    }
}

/// The value parameter of a response, if it has one.
pub fn response_value<'a>(response: &ResponsePdu<'a>) -> Result<Option<&'a [u8]>, HapError> {
    let body = response.body();
    let mut value = pdu::TLVValue::tied(body);
    TLVReader::new(body).read_into(&mut [&mut value])?;
    if value.is_none() {
        return Ok(None);
    }
    Ok(Some(value.short_data()?))
}
