// Accessory side of the secure message exchange: decrypt, walk the PDUs, dispatch per opcode, encrypt the replies.
//
// https://github.com/apple/HomeKitADK/blob/fb201f98f5fdc7fef6a455054f08b59cca5d1ec8/HAP/HAPBLEProcedure.c

use crate::characteristic::{AttributeDatabase, Characteristic, VALUE_MAX_LENGTH};
use crate::crypto::aead::CHACHA20_POLY1305_TAG_BYTES;
use crate::event::{HapEvent, HapInterfaceReceiver};
use crate::pdu::{
    self, BodyBuilder, ConfigurationTLVType, OpCode, PduReader, PduTLVType, PduType, RequestPdu,
    Status, WriteIntoLength,
};
use crate::session::{Session, SessionKeys, SessionState};
use crate::store::{PlatformSupport, ServerConfig};
use crate::tlv::{TLVError, TLVReader};
use crate::{
    AccessoryInterface, CharId, CharacteristicResponse, ConnectionId, HapError, InterfaceError,
};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Instant};
use thiserror::Error;

#[cfg(test)]
mod test;

/// Max number of simultaneous controller connections.
pub const CONNECTIONS_MAX: usize = 4;
/// Max number of characteristics a single connection can subscribe to.
pub const SUBSCRIPTIONS_MAX: usize = 16;
/// Max number of notifications queued per connection.
pub const PENDING_EVENTS_MAX: usize = 8;

/// Time To Live, expressed in multiples of 100ms.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ttl(pub u8);
impl Ttl {
    pub fn to_millis(&self) -> u64 {
        self.0 as u64 * 100
    }
}

/// Result of handing a secure message to the server.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportReply {
    /// The encrypted response occupies this many bytes of the output buffer.
    Encrypted(usize),
    /// The message was not processed, transports report this as "not found".
    Rejected(Rejection),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Rejection {
    SessionExpired,
    SessionReleased,
}

/// Errors caused by the request of the controller, these become a PDU status and are not propagated.
#[derive(Error, PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum StatusError {
    #[error("unsupported pdu encountered")]
    UnsupportedPDU,

    #[error("maximum number of concurrent procedures exceeded")]
    MaxProcedures,

    #[error("insufficient authorization")]
    InsufficientAuthorization,

    #[error("invalid instance id provided 0x{0:0>4x}")]
    InvalidInstanceID(u16),

    #[error("invalid request")]
    InvalidRequest,
}

impl From<StatusError> for Status {
    fn from(e: StatusError) -> Status {
        match e {
            StatusError::UnsupportedPDU => Status::UnsupportedPDU,
            StatusError::MaxProcedures => Status::MaxProcedures,
            StatusError::InsufficientAuthorization => Status::InsufficientAuthorization,
            StatusError::InvalidInstanceID(_) => Status::InvalidInstanceID,
            StatusError::InvalidRequest => Status::InvalidRequest,
        }
    }
}

/// All errors encountered while handling a single PDU, used for logging before deciding between a status response
/// and propagation.
#[derive(Error, PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum InternalError {
    #[error("tlv error encountered")]
    TLVError(#[from] TLVError),
    #[error("status error")]
    StatusError(#[from] StatusError),
    #[error("accessory interface error")]
    InterfaceError(#[from] InterfaceError),
    /// An error occured that should be propagated through to the callsite.
    #[error("a to be propagated error")]
    HapError(#[from] HapError),
}

impl InternalError {
    /// The status to respond with, or the error to propagate.
    fn to_status_error(self) -> Result<StatusError, HapError> {
        match self {
            InternalError::TLVError(TLVError::BufferOverrun) => Err(HapError::OutOfResources),
            InternalError::TLVError(_) => Ok(StatusError::InvalidRequest),
            InternalError::StatusError(e) => Ok(e),
            InternalError::InterfaceError(InterfaceError::CharacteristicUnknown(c)) => {
                Ok(StatusError::InvalidInstanceID(c.0))
            }
            InternalError::InterfaceError(InterfaceError::CharacteristicWriteInvalid) => {
                Ok(StatusError::InvalidRequest)
            }
            InternalError::InterfaceError(e) => Err(e.into()),
            InternalError::HapError(HapError::InvalidData) => Ok(StatusError::InvalidRequest),
            InternalError::HapError(e) => Err(e),
        }
    }
}

/// A write that waits for its execute write.
#[derive(Debug, Clone)]
pub struct TimedWrite {
    pub char_id: CharId,
    pub time_start: Instant,
    pub ttl: Ttl,
    pub return_response: bool,
    pub value: heapless::Vec<u8, VALUE_MAX_LENGTH>,
}
impl TimedWrite {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.time_start) > Duration::from_millis(self.ttl.to_millis())
    }
}

/// State for one connected controller, the session is private to it.
#[derive(Debug)]
pub struct ControllerConnection {
    id: ConnectionId,
    session: Session,
    subscriptions: heapless::Vec<CharId, SUBSCRIPTIONS_MAX>,
    pending_events: heapless::Deque<CharId, PENDING_EVENTS_MAX>,
    timed_write: Option<TimedWrite>,
}

impl ControllerConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
    pub fn session(&self) -> &Session {
        &self.session
    }
    pub fn is_subscribed(&self, iid: CharId) -> bool {
        self.subscriptions.contains(&iid)
    }
    pub fn pending_events(&self) -> usize {
        self.pending_events.len()
    }

    fn subscribe(&mut self, iid: CharId) -> Result<(), StatusError> {
        if !self.is_subscribed(iid) {
            self.subscriptions
                .push(iid)
                .map_err(|_| StatusError::MaxProcedures)?;
        }
        Ok(())
    }

    fn unsubscribe(&mut self, iid: CharId) {
        self.subscriptions.retain(|v| *v != iid);
        let mut remaining = heapless::Deque::new();
        while let Some(v) = self.pending_events.pop_front() {
            if v != iid {
                // Can't exceed the capacity it came from.
                let _ = remaining.push_back(v);
            }
        }
        self.pending_events = remaining;
    }

    fn queue_event(&mut self, iid: CharId) {
        if self.pending_events.iter().any(|v| *v == iid) {
            return;
        }
        if self.pending_events.push_back(iid).is_err() {
            warn!("event queue full, dropping event for 0x{:?}", iid.0);
        }
    }
}

/// Dispatches secure messages to the accessory and tracks the controller connections.
#[derive(Debug)]
pub struct AccessoryServer<'a> {
    database: AttributeDatabase<'a>,
    config: ServerConfig,
    connections: heapless::Vec<ControllerConnection, CONNECTIONS_MAX>,
    next_id: u8,
}

impl<'a> AccessoryServer<'a> {
    pub fn new(database: AttributeDatabase<'a>, config: ServerConfig) -> Result<Self, HapError> {
        config.session.validate()?;
        Ok(Self {
            database,
            config,
            connections: Default::default(),
            next_id: 0,
        })
    }

    /// Create the server with the configuration from the platform store.
    pub fn from_store(
        database: AttributeDatabase<'a>,
        support: &impl PlatformSupport,
    ) -> Result<Self, HapError> {
        Self::new(database, ServerConfig::load(support)?)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ControllerConnection> {
        self.connections.iter().find(|c| c.id == id)
    }

    fn connection_index(&self, id: ConnectionId) -> Result<usize, HapError> {
        self.connections
            .iter()
            .position(|c| c.id == id)
            .ok_or(HapError::InvalidState)
    }

    /// Start a secure session for a controller that completed pair verify.
    pub fn connect(&mut self, keys: &SessionKeys, now: Instant) -> Result<ConnectionId, HapError> {
        if self.connections.is_full() {
            return Err(HapError::OutOfResources);
        }
        let mut id = ConnectionId(self.next_id);
        while self.connections.iter().any(|c| c.id == id) {
            id = ConnectionId(id.0.wrapping_add(1));
        }
        self.next_id = id.0.wrapping_add(1);
        let connection = ControllerConnection {
            id,
            session: Session::new(keys, self.config.session, now),
            subscriptions: Default::default(),
            pending_events: Default::default(),
            timed_write: None,
        };
        self.connections
            .push(connection)
            .map_err(|_| HapError::OutOfResources)?;
        info!("connection {} established", id.0);
        Ok(id)
    }

    /// Tear down a connection, its keys are zeroed.
    pub fn disconnect(&mut self, id: ConnectionId) -> Result<(), HapError> {
        let index = self.connection_index(id)?;
        let mut connection = self.connections.swap_remove(index);
        connection.session.release();
        info!("connection {} closed", id.0);
        Ok(())
    }

    /// Apply session timeouts, released connections are removed.
    pub fn poll(&mut self, now: Instant) {
        for c in self.connections.iter_mut() {
            if c.session.poll(now) == SessionState::Released {
                c.pending_events.clear();
                c.timed_write = None;
            }
        }
        self.connections
            .retain(|c| c.session.state() != SessionState::Released);
    }

    /// Handle an encrypted message from a controller, the encrypted response is written into `out`.
    ///
    /// Expired sessions are rejected without attempting to decrypt. An authentication failure is
    /// [`HapError::InvalidData`] and produces no response.
    pub fn handle_secure_message(
        &mut self,
        id: ConnectionId,
        accessory: &mut impl AccessoryInterface,
        support: &mut impl PlatformSupport,
        now: Instant,
        message: &mut [u8],
        out: &mut [u8],
    ) -> Result<TransportReply, HapError> {
        let index = self.connection_index(id)?;
        match self.connections[index].session.poll(now) {
            SessionState::Active => {}
            SessionState::Expired => {
                warn!("rejecting message on expired session {}", id.0);
                return Ok(TransportReply::Rejected(Rejection::SessionExpired));
            }
            SessionState::Released => {
                return Ok(TransportReply::Rejected(Rejection::SessionReleased));
            }
        }

        let plaintext = self.connections[index]
            .session
            .decrypt_control(now, message)
            .inspect_err(|e| error!("failed to decrypt message: {:?}", e))?;
        trace!("handle_secure_message {:?}", plaintext);

        let capacity = out
            .len()
            .checked_sub(CHACHA20_POLY1305_TAG_BYTES)
            .ok_or(HapError::OutOfResources)?;

        let mut reader = PduReader::new(plaintext);
        // Every PDU must parse before any of them takes effect.
        let mut check = reader.clone();
        while let Some(request) = check.next_request() {
            request.inspect_err(|_| warn!("malformed pdu, dropping message"))?;
        }

        let mut position = 0;
        while let Some(request) = reader.next_request() {
            let request = request?;
            let last = reader.is_empty();
            let (end, changed) = self.handle_request_entry(
                index,
                accessory,
                now,
                &request,
                &mut out[position..capacity],
                last,
            )?;
            position += end;
            if let Some(iid) = changed {
                self.raise(iid, Some(id), support)?;
            }
        }

        let connection = &mut self.connections[index];
        connection.session.touch(now);
        let encrypted = connection.session.encrypt_control(out, position)?;
        Ok(TransportReply::Encrypted(encrypted.len()))
    }

    fn handle_request_entry(
        &mut self,
        index: usize,
        accessory: &mut impl AccessoryInterface,
        now: Instant,
        request: &RequestPdu<'_>,
        out: &mut [u8],
        last: bool,
    ) -> Result<(usize, Option<CharId>), HapError> {
        match self.handle_request(index, accessory, now, request, out, last) {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!("processing returned error: {:?}", e);
                let status_error = e.to_status_error()?;
                let reply = request.header.to_status(status_error.into());
                let len = reply.write_into_length(out)?;
                let builder = BodyBuilder::new_at(out, len)?;
                let len = if last {
                    builder.end_omit_empty()?
                } else {
                    builder.end()?
                };
                Ok((len, None))
            }
        }
    }

    fn handle_request(
        &mut self,
        index: usize,
        accessory: &mut impl AccessoryInterface,
        now: Instant,
        request: &RequestPdu<'_>,
        out: &mut [u8],
        last: bool,
    ) -> Result<(usize, Option<CharId>), InternalError> {
        let header = &request.header;
        if header.control.pdu_type() != PduType::Request {
            return Err(StatusError::UnsupportedPDU.into());
        }
        let char_id = header.char_id();
        let op = header.op();
        let (opcode, tid) = (header.opcode, header.tid);
        debug!("request opcode 0x{:?} tid {} iid {}", opcode, tid.0, char_id.0);

        let connection = &mut self.connections[index];
        if let Some(tw) = &connection.timed_write {
            if tw.is_expired(now) {
                info!("timed write on {} expired", tw.char_id.0);
                connection.timed_write = None;
            }
        }

        let op = match op {
            Some(
                op @ (OpCode::CharacteristicSignatureRead
                | OpCode::CharacteristicRead
                | OpCode::CharacteristicWrite
                | OpCode::CharacteristicTimedWrite
                | OpCode::CharacteristicExecuteWrite
                | OpCode::CharacteristicConfiguration),
            ) => op,
            _ => {
                warn!("unsupported opcode 0x{:?}", opcode);
                return Err(StatusError::UnsupportedPDU.into());
            }
        };

        let chr = self
            .database
            .get(char_id)
            .ok_or(StatusError::InvalidInstanceID(char_id.0))?;

        let len = header.to_success().write_into_length(out)?;
        let builder = BodyBuilder::new_at(out, len)?;
        let mut changed = None;

        let builder = match op {
            OpCode::CharacteristicSignatureRead => characteristic_signature(chr, builder)?,
            OpCode::CharacteristicRead => {
                if !chr.properties.read() {
                    return Err(StatusError::InsufficientAuthorization.into());
                }
                add_value(chr, &*accessory, builder)?
            }
            OpCode::CharacteristicWrite => {
                if !chr.properties.write() {
                    return Err(StatusError::InsufficientAuthorization.into());
                }
                if chr.properties.requires_timed_write() {
                    warn!("characteristic {} requires a timed write", char_id.0);
                    return Err(StatusError::InvalidRequest.into());
                }
                let body = request.body();
                let mut value = pdu::TLVValue::tied(body);
                let mut return_response = pdu::TLVReturnResponse::tied(body);
                TLVReader::new(body)
                    .require_into(&mut [&mut value])
                    .map_err(malformed)?;
                TLVReader::new(body)
                    .read_into(&mut [&mut return_response])
                    .map_err(malformed)?;

                let mut data = [0u8; VALUE_MAX_LENGTH];
                let data_length = value.copy_body(&mut data).map_err(malformed)?;
                changed = write_value(chr, accessory, &data[0..data_length])?;
                if read_flag(&return_response)? {
                    add_value(chr, &*accessory, builder)?
                } else {
                    builder
                }
            }
            OpCode::CharacteristicTimedWrite => {
                if !chr.properties.write() {
                    return Err(StatusError::InsufficientAuthorization.into());
                }
                if connection.timed_write.is_some() {
                    return Err(StatusError::MaxProcedures.into());
                }
                let body = request.body();
                let mut value = pdu::TLVValue::tied(body);
                let mut ttl = pdu::TLVTtl::tied(body);
                let mut return_response = pdu::TLVReturnResponse::tied(body);
                TLVReader::new(body)
                    .require_into(&mut [&mut value, &mut ttl])
                    .map_err(malformed)?;
                TLVReader::new(body)
                    .read_into(&mut [&mut return_response])
                    .map_err(malformed)?;
                let ttl = match ttl.short_data()? {
                    [v] => Ttl(*v),
                    _ => return Err(StatusError::InvalidRequest.into()),
                };

                let mut stored: heapless::Vec<u8, VALUE_MAX_LENGTH> = heapless::Vec::new();
                stored
                    .resize_default(value.len())
                    .map_err(|_| StatusError::InvalidRequest)?;
                value.copy_body(&mut stored).map_err(malformed)?;
                info!("timed write on {} with ttl {} ms", char_id.0, ttl.to_millis());
                connection.timed_write = Some(TimedWrite {
                    char_id,
                    time_start: now,
                    ttl,
                    return_response: read_flag(&return_response)?,
                    value: stored,
                });
                builder
            }
            OpCode::CharacteristicExecuteWrite => {
                let pending = match connection.timed_write.take() {
                    Some(tw) if tw.char_id == char_id => tw,
                    other => {
                        connection.timed_write = other;
                        warn!("execute write without matching timed write on {}", char_id.0);
                        return Err(StatusError::InvalidRequest.into());
                    }
                };
                changed = write_value(chr, accessory, &pending.value)?;
                if pending.return_response {
                    add_value(chr, &*accessory, builder)?
                } else {
                    builder
                }
            }
            OpCode::CharacteristicConfiguration => {
                let body = request.body();
                let mut properties = pdu::TLVConfigurationProperties::tied(body);
                TLVReader::new(body)
                    .read_into(&mut [&mut properties])
                    .map_err(malformed)?;
                let bits = if properties.is_some() {
                    u16::try_from(properties.to_u64()?).map_err(|_| StatusError::InvalidRequest)?
                } else {
                    0
                };
                if bits & pdu::CONFIGURATION_PROPERTY_EVENTS != 0 {
                    if !chr.properties.supports_event_notification() {
                        return Err(StatusError::InvalidRequest.into());
                    }
                    connection.subscribe(char_id)?;
                    info!("connection {} subscribed to {}", connection.id.0, char_id.0);
                } else {
                    connection.unsubscribe(char_id);
                }
                let current = if connection.is_subscribed(char_id) {
                    pdu::CONFIGURATION_PROPERTY_EVENTS
                } else {
                    0
                };
                builder.add_slice(ConfigurationTLVType::Properties, &current.to_le_bytes())?
            }
            _ => return Err(StatusError::UnsupportedPDU.into()),
        };

        let len = if last {
            builder.end_omit_empty()?
        } else {
            builder.end()?
        };
        Ok((len, changed))
    }

    /// A characteristic changed, queue notifications for every subscribed connection except the origin.
    fn raise(
        &mut self,
        iid: CharId,
        origin: Option<ConnectionId>,
        support: &mut impl PlatformSupport,
    ) -> Result<(), HapError> {
        let gsn = support.advance_global_state_number()?;
        debug!("characteristic {} changed, gsn now {}", iid.0, gsn);
        for c in self.connections.iter_mut() {
            if Some(c.id) != origin && c.is_subscribed(iid) {
                c.queue_event(iid);
            }
        }
        Ok(())
    }

    /// Drain the event channel, queueing notifications for subscribed connections.
    pub fn dispatch_events<M: RawMutex>(
        &mut self,
        receiver: &HapInterfaceReceiver<'_, M>,
        support: &mut impl PlatformSupport,
    ) -> Result<usize, HapError> {
        let mut count = 0;
        while let Some(event) = receiver.try_receive() {
            match event {
                HapEvent::CharacteristicChanged { iid, origin } => {
                    if self.database.get(iid).is_none() {
                        warn!("event for unknown characteristic {}", iid.0);
                        continue;
                    }
                    self.raise(iid, origin, support)?;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Produce the next encrypted notification frame for a connection, if one is pending.
    pub fn next_notification(
        &mut self,
        id: ConnectionId,
        accessory: &impl AccessoryInterface,
        now: Instant,
        out: &mut [u8],
    ) -> Result<Option<usize>, HapError> {
        let index = self.connection_index(id)?;
        let connection = &mut self.connections[index];
        if connection.session.poll(now) == SessionState::Released {
            connection.pending_events.clear();
            return Err(HapError::InvalidState);
        }
        let iid = match connection.pending_events.pop_front() {
            Some(iid) => iid,
            None => return Ok(None),
        };
        let chr = self.database.get(iid).ok_or(HapError::InvalidState)?;

        let capacity = out
            .len()
            .checked_sub(CHACHA20_POLY1305_TAG_BYTES)
            .ok_or(HapError::OutOfResources)?;
        let len = pdu::NotificationHeader::new(iid).write_into_length(&mut out[0..capacity])?;
        let builder = BodyBuilder::new_at(&mut out[0..capacity], len)?;
        let len = add_value(chr, &*accessory, builder)
            .map_err(|e| match e.to_status_error() {
                Ok(_) => HapError::InvalidData,
                Err(e) => e,
            })?
            .end()?;
        let encrypted = connection.session.encrypt_event(now, out, len)?;
        debug!("notification for {} on connection {}", iid.0, id.0);
        Ok(Some(encrypted.len()))
    }
}

/// The controller sent a body that cannot be taken apart, overruns here are not ours.
fn malformed(e: TLVError) -> InternalError {
    warn!("malformed request body: {:?}", e);
    StatusError::InvalidRequest.into()
}

fn read_flag(tlv: &crate::tlv::TLV<'_>) -> Result<bool, InternalError> {
    if tlv.is_none() {
        return Ok(false);
    }
    match tlv.short_data()? {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(StatusError::InvalidRequest.into()),
    }
}

fn add_value<'b>(
    chr: &Characteristic,
    accessory: &impl AccessoryInterface,
    builder: BodyBuilder<'b>,
) -> Result<BodyBuilder<'b>, InternalError> {
    let value = accessory.read_characteristic(chr.iid)?;
    if value.format() != chr.format {
        error!("accessory returned a value of the wrong format for {}", chr.iid.0);
        return Err(HapError::InvalidState.into());
    }
    let mut data = [0u8; VALUE_MAX_LENGTH];
    let length = value.encode(&mut data)?;
    Ok(builder.add_slice(PduTLVType::Value, &data[0..length])?)
}

fn write_value(
    chr: &Characteristic,
    accessory: &mut impl AccessoryInterface,
    data: &[u8],
) -> Result<Option<CharId>, InternalError> {
    let value = chr.decode_write(data)?;
    let r = accessory.write_characteristic(chr.iid, &value)?;
    Ok(match r {
        CharacteristicResponse::Modified => Some(chr.iid),
        CharacteristicResponse::Unmodified => None,
    })
}

// https://github.com/apple/HomeKitADK/blob/fb201f98f5fdc7fef6a455054f08b59cca5d1ec8/HAP/HAPBLECharacteristic%2BSignature.c#L10
fn characteristic_signature<'b>(
    chr: &Characteristic,
    builder: BodyBuilder<'b>,
) -> Result<BodyBuilder<'b>, InternalError> {
    let mut builder = builder
        .add_slice(PduTLVType::CharacteristicType, &chr.char_type.to_le_bytes_long())?
        .add_slice(PduTLVType::ServiceInstanceID, &chr.service_iid.to_le_bytes())?
        .add_slice(PduTLVType::ServiceType, &chr.service_type.to_le_bytes_long())?
        .add_slice(
            PduTLVType::HAPCharacteristicPropertiesDescriptor,
            &chr.properties.into_bits().to_le_bytes(),
        )?
        .add_entry(
            PduTLVType::GATTPresentationFormatDescriptor,
            &chr.representation(),
        )?;
    if let Some(range) = &chr.range {
        let mut data = [0u8; 16];
        let length = range.encode(chr.format, &mut data)?;
        builder = builder.add_slice(PduTLVType::GATTValidRange, &data[0..length])?;
    }
    Ok(builder)
}
