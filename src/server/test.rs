use super::*;
use crate::characteristic::{
    CharacteristicProperties, CharacteristicValue, BRIGHTNESS, ON, SERVICE_LIGHTBULB,
};
use crate::controller::{
    response_value, ControllerReply, ControllerSession, MessageBuilder, Transport,
};
use crate::crypto::aead::SessionChannel;
use crate::event::{HapEventChannel, HapInterfaceReceiver, HapInterfaceSender};
use crate::pdu::Status;
use crate::session::SessionConfig;
use crate::sig::{Format, Unit};
use crate::store::test::MemoryStore;
use crate::test::TestClock;
use crate::{Clock, TId};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use std::collections::HashMap;
use std::vec::Vec;

const SERVICE_IID: u16 = 0x0f;
const ON_IID: CharId = CharId(0x10);
const BRIGHTNESS_IID: CharId = CharId(0x12);
const SCENE_IID: CharId = CharId(0x14);

fn characteristics() -> [Characteristic; 3] {
    [
        Characteristic::new(ON_IID, ON, Format::Boolean).with_service(SERVICE_IID, SERVICE_LIGHTBULB),
        Characteristic::new(BRIGHTNESS_IID, BRIGHTNESS, Format::I32)
            .with_service(SERVICE_IID, SERVICE_LIGHTBULB)
            .with_unit(Unit::Percentage)
            .with_range(0, 100),
        // Only writable through timed write.
        Characteristic::new(SCENE_IID, crate::characteristic::HomekitUuid16::new(0xfe00), Format::U8)
            .with_service(SERVICE_IID, SERVICE_LIGHTBULB)
            .with_properties(
                CharacteristicProperties::new()
                    .with_read(true)
                    .with_write(true)
                    .with_requires_timed_write(true),
            ),
    ]
}

fn config() -> ServerConfig {
    ServerConfig {
        session: SessionConfig {
            key_expiry_ms: 10_000,
            unreachable_timeout_ms: 60_000,
        },
        config_number: 1,
    }
}

#[derive(Debug)]
struct Lightbulb {
    on: bool,
    brightness: i32,
    scene: u8,
}
impl Default for Lightbulb {
    fn default() -> Self {
        Self {
            on: false,
            brightness: 50,
            scene: 0,
        }
    }
}

impl AccessoryInterface for Lightbulb {
    fn read_characteristic(&self, char_id: CharId) -> Result<CharacteristicValue, InterfaceError> {
        match char_id {
            ON_IID => Ok(CharacteristicValue::Bool(self.on)),
            BRIGHTNESS_IID => Ok(CharacteristicValue::I32(self.brightness)),
            SCENE_IID => Ok(CharacteristicValue::U8(self.scene)),
            _ => Err(InterfaceError::CharacteristicUnknown(char_id)),
        }
    }

    fn write_characteristic(
        &mut self,
        char_id: CharId,
        value: &CharacteristicValue,
    ) -> Result<CharacteristicResponse, InterfaceError> {
        fn update<T: PartialEq + Copy>(field: &mut T, value: T) -> CharacteristicResponse {
            if *field == value {
                CharacteristicResponse::Unmodified
            } else {
                *field = value;
                CharacteristicResponse::Modified
            }
        }
        match (char_id, value) {
            (ON_IID, CharacteristicValue::Bool(v)) => Ok(update(&mut self.on, *v)),
            (BRIGHTNESS_IID, CharacteristicValue::I32(v)) => Ok(update(&mut self.brightness, *v)),
            (SCENE_IID, CharacteristicValue::U8(v)) => Ok(update(&mut self.scene, *v)),
            _ => Err(InterfaceError::CharacteristicWriteInvalid),
        }
    }
}

#[derive(Debug, PartialEq)]
struct Reply {
    tid: u8,
    status: Option<Status>,
    body: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
}

struct Fixture<'d> {
    server: AccessoryServer<'d>,
    accessory: Lightbulb,
    store: MemoryStore,
    clock: TestClock,
}

struct Loopback<'f, 'd> {
    fixture: &'f mut Fixture<'d>,
    id: ConnectionId,
}

impl Transport for Loopback<'_, '_> {
    fn exchange(&mut self, request: &[u8], response: &mut [u8]) -> Result<TransportReply, HapError> {
        let mut buffer = [0u8; 512];
        let message = buffer
            .get_mut(0..request.len())
            .ok_or(HapError::OutOfResources)?;
        message.copy_from_slice(request);
        let f = &mut *self.fixture;
        f.server.handle_secure_message(
            self.id,
            &mut f.accessory,
            &mut f.store,
            f.clock.now(),
            message,
            response,
        )
    }
}

impl<'d> Fixture<'d> {
    fn new(characteristics: &'d [Characteristic]) -> Self {
        let database = AttributeDatabase::new(characteristics).unwrap();
        Self {
            server: AccessoryServer::new(database, config()).unwrap(),
            accessory: Lightbulb::default(),
            store: MemoryStore {
                global_state_number: 1,
                ..Default::default()
            },
            clock: TestClock::default(),
        }
    }

    fn connect(&mut self, secret: u8) -> (ConnectionId, ControllerSession, SessionKeys) {
        let keys = SessionKeys::derive(&[secret; 32]).unwrap();
        let id = self.server.connect(&keys, self.clock.now()).unwrap();
        (id, ControllerSession::new(&keys), keys)
    }

    fn send<F>(
        &mut self,
        id: ConnectionId,
        controller: &mut ControllerSession,
        build: F,
    ) -> Result<Result<Vec<Reply>, Rejection>, HapError>
    where
        F: FnOnce(MessageBuilder<'_>) -> Result<MessageBuilder<'_>, HapError>,
    {
        let mut message = [0u8; 256];
        let length = build(MessageBuilder::new(&mut message))?.end();
        let mut response = [0u8; 256];
        let mut transport = Loopback { fixture: self, id };
        match controller.request(&mut transport, &mut message, length, &mut response)? {
            ControllerReply::Rejected(r) => Ok(Err(r)),
            ControllerReply::Responses(mut reader) => {
                let mut replies = Vec::new();
                while let Some(pdu) = reader.next_response() {
                    let pdu = pdu?;
                    replies.push(Reply {
                        tid: pdu.header.tid.0,
                        status: pdu.header.status(),
                        body: pdu.body.map(|b| b.to_vec()),
                        value: response_value(&pdu)?.map(|v| v.to_vec()),
                    });
                }
                Ok(Ok(replies))
            }
        }
    }

    fn send_ok<F>(&mut self, id: ConnectionId, controller: &mut ControllerSession, build: F) -> Vec<Reply>
    where
        F: FnOnce(MessageBuilder<'_>) -> Result<MessageBuilder<'_>, HapError>,
    {
        self.send(id, controller, build).unwrap().unwrap()
    }
}

fn status_only(tid: u8, status: Status) -> Reply {
    Reply {
        tid,
        status: Some(status),
        body: None,
        value: None,
    }
}

fn with_value(tid: u8, value: &[u8]) -> Reply {
    let mut body = std::vec![PduTLVType::Value as u8, value.len() as u8];
    body.extend_from_slice(value);
    Reply {
        tid,
        status: Some(Status::Success),
        body: Some(body),
        value: Some(value.to_vec()),
    }
}

#[test]
fn test_write_then_read_brightness() {
    crate::test::init();
    let chars = characteristics();
    let mut f = Fixture::new(&chars);
    let (id, mut controller, _keys) = f.connect(0x42);

    // The plaintext of a single write of 90.
    let mut plain = [0u8; 32];
    let len = MessageBuilder::new(&mut plain)
        .starting_at(TId(3))
        .write(BRIGHTNESS_IID, &90i32.to_le_bytes(), false)
        .unwrap()
        .end();
    assert_eq!(
        &plain[0..len],
        &[0x00, 0x02, 0x03, 0x12, 0x00, 0x06, 0x00, 0x01, 0x04, 0x5a, 0x00, 0x00, 0x00]
    );

    let replies = f.send_ok(id, &mut controller, |m| {
        m.starting_at(TId(3))
            .write(BRIGHTNESS_IID, &90i32.to_le_bytes(), false)
    });
    assert_eq!(replies, [status_only(3, Status::Success)]);
    assert_eq!(f.accessory.brightness, 90);
    // The write changed the value.
    assert_eq!(f.store.global_state_number, 2);

    let replies = f.send_ok(id, &mut controller, |m| m.read(BRIGHTNESS_IID));
    assert_eq!(replies, [with_value(1, &[90, 0, 0, 0])]);

    // Writing the same value again is not a change.
    let replies = f.send_ok(id, &mut controller, |m| {
        m.write(BRIGHTNESS_IID, &90i32.to_le_bytes(), true)
    });
    assert_eq!(replies, [with_value(1, &[90, 0, 0, 0])]);
    assert_eq!(f.store.global_state_number, 2);

    // One nonce per message in each direction.
    let session = f.server.connection(id).unwrap().session();
    assert_eq!(session.nonces(), (3, 3, 0));
}

#[test]
fn test_multiple_pdus_in_one_message() {
    crate::test::init();
    let chars = characteristics();
    let mut f = Fixture::new(&chars);
    let (id, mut controller, _keys) = f.connect(0x42);

    let replies = f.send_ok(id, &mut controller, |m| {
        m.read(ON_IID)?
            .write(BRIGHTNESS_IID, &30i32.to_le_bytes(), false)?
            .read(BRIGHTNESS_IID)?
            .read(CharId(0x99))?
            .raw(OpCode::ProtocolConfiguration as u8, ON_IID)
    });
    assert_eq!(
        replies,
        [
            with_value(1, &[0]),
            status_only(2, Status::Success),
            with_value(3, &[30, 0, 0, 0]),
            status_only(4, Status::InvalidInstanceID),
            status_only(5, Status::UnsupportedPDU),
        ]
    );
    // Responses to all five went out in a single encrypted message.
    let session = f.server.connection(id).unwrap().session();
    assert_eq!(session.nonces(), (1, 1, 0));
}

#[test]
fn test_reads_see_preceding_writes() {
    crate::test::init();
    let chars = characteristics();
    let mut f = Fixture::new(&chars);
    let (id, mut controller, _keys) = f.connect(0x42);

    let replies = f.send_ok(id, &mut controller, |m| {
        m.read(ON_IID)?
            .write(BRIGHTNESS_IID, &30i32.to_le_bytes(), false)?
            .read(BRIGHTNESS_IID)?
            .write(BRIGHTNESS_IID, &80i32.to_le_bytes(), false)?
            .read(BRIGHTNESS_IID)
    });
    assert_eq!(
        replies,
        [
            with_value(1, &[0]),
            status_only(2, Status::Success),
            with_value(3, &[30, 0, 0, 0]),
            status_only(4, Status::Success),
            with_value(5, &[80, 0, 0, 0]),
        ]
    );
    assert_eq!(f.accessory.brightness, 80);
    // One state change per write.
    assert_eq!(f.store.global_state_number, 3);
}

#[test]
fn test_oversized_values_in_message() {
    crate::test::init();
    let chars = characteristics();
    let mut f = Fixture::new(&chars);
    let (id, mut controller, _keys) = f.connect(0x42);

    let replies = f.send_ok(id, &mut controller, |m| {
        m.write(ON_IID, &[1], false)?
            .write(BRIGHTNESS_IID, &[1u8; 100], false)?
            .timed_write(SCENE_IID, &[2u8; 70], Ttl(10))?
            .read(BRIGHTNESS_IID)
    });
    assert_eq!(
        replies,
        [
            status_only(1, Status::Success),
            status_only(2, Status::InvalidRequest),
            status_only(3, Status::InvalidRequest),
            with_value(4, &[50, 0, 0, 0]),
        ]
    );
    assert!(f.accessory.on);
    assert_eq!(f.accessory.brightness, 50);
    assert_eq!(f.store.global_state_number, 2);

    // Nothing is pending from the rejected timed write.
    let replies = f.send_ok(id, &mut controller, |m| m.execute_write(SCENE_IID));
    assert_eq!(replies, [status_only(1, Status::InvalidRequest)]);

    // The session carried on normally.
    let session = f.server.connection(id).unwrap().session();
    assert_eq!(session.nonces(), (2, 2, 0));
}

#[test]
fn test_truncated_message_has_no_effect() {
    crate::test::init();
    let chars = characteristics();
    let mut f = Fixture::new(&chars);
    let (id, mut controller, _keys) = f.connect(0x42);

    let mut message = [0u8; 256];
    let length = MessageBuilder::new(&mut message)
        .write(BRIGHTNESS_IID, &70i32.to_le_bytes(), false)
        .unwrap()
        .end();
    // A second request header that stops after two bytes.
    message[length..length + 2].copy_from_slice(&[0x00, OpCode::CharacteristicRead as u8]);
    let mut response = [0u8; 256];
    let mut transport = Loopback { fixture: &mut f, id };
    let r = controller.request(&mut transport, &mut message, length + 2, &mut response);
    assert_eq!(r.err(), Some(HapError::InvalidData));

    assert_eq!(f.accessory.brightness, 50);
    assert_eq!(f.store.global_state_number, 1);
    // Decrypted but never answered.
    let session = f.server.connection(id).unwrap().session();
    assert_eq!(session.nonces(), (0, 1, 0));

    let replies = f.send_ok(id, &mut controller, |m| m.read(BRIGHTNESS_IID));
    assert_eq!(replies, [with_value(1, &[50, 0, 0, 0])]);
}

#[test]
fn test_rejected_requests() {
    crate::test::init();
    let chars = characteristics();
    let mut f = Fixture::new(&chars);
    let (id, mut controller, _keys) = f.connect(0x42);

    let replies = f.send_ok(id, &mut controller, |m| {
        m.write(BRIGHTNESS_IID, &101i32.to_le_bytes(), false)?
            .write(BRIGHTNESS_IID, &[5, 0], false)?
            .write(ON_IID, &[2], false)?
            .write(SCENE_IID, &[3], false)?
            .raw(OpCode::CharacteristicWrite as u8, ON_IID)?
            .raw(0x42, ON_IID)
    });
    assert_eq!(
        replies,
        [
            status_only(1, Status::InvalidRequest),
            status_only(2, Status::InvalidRequest),
            status_only(3, Status::InvalidRequest),
            status_only(4, Status::InvalidRequest),
            status_only(5, Status::InvalidRequest),
            status_only(6, Status::UnsupportedPDU),
        ]
    );
    assert_eq!(f.accessory.brightness, 50);
    assert!(!f.accessory.on);
    assert_eq!(f.accessory.scene, 0);
    assert_eq!(f.store.global_state_number, 1);
}

#[test]
fn test_signature_read() {
    crate::test::init();
    let chars = characteristics();
    let mut f = Fixture::new(&chars);
    let (id, mut controller, _keys) = f.connect(0x42);

    let replies = f.send_ok(id, &mut controller, |m| m.signature_read(BRIGHTNESS_IID));
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status, Some(Status::Success));
    let body = replies[0].body.clone().unwrap();

    let mut entries = HashMap::new();
    for tlv in TLVReader::new(&body) {
        let tlv = tlv.unwrap();
        entries.insert(tlv.type_id, tlv.short_data().unwrap().to_vec());
    }
    let char_type = &entries[&(PduTLVType::CharacteristicType as u8)];
    assert_eq!(char_type.as_slice(), &BRIGHTNESS.to_le_bytes_long());
    assert_eq!(
        entries[&(PduTLVType::ServiceInstanceID as u8)],
        [SERVICE_IID as u8, 0]
    );
    assert_eq!(
        entries[&(PduTLVType::ServiceType as u8)].as_slice(),
        &SERVICE_LIGHTBULB.to_le_bytes_long()
    );
    assert_eq!(
        entries[&(PduTLVType::HAPCharacteristicPropertiesDescriptor as u8)],
        [0xb0, 0x00]
    );
    assert_eq!(
        entries[&(PduTLVType::GATTPresentationFormatDescriptor as u8)],
        [0x10, 0x00, 0xad, 0x27, 0x01, 0x00, 0x00]
    );
    assert_eq!(
        entries[&(PduTLVType::GATTValidRange as u8)],
        [0, 0, 0, 0, 100, 0, 0, 0]
    );

    // No range, no range entry.
    let replies = f.send_ok(id, &mut controller, |m| m.signature_read(ON_IID));
    let body = replies[0].body.clone().unwrap();
    assert!(TLVReader::new(&body).all(|t| t.unwrap().type_id != PduTLVType::GATTValidRange as u8));
}

#[test]
fn test_timed_write() {
    crate::test::init();
    let chars = characteristics();
    let mut f = Fixture::new(&chars);
    let (id, mut controller, _keys) = f.connect(0x42);

    let replies = f.send_ok(id, &mut controller, |m| {
        m.timed_write(SCENE_IID, &[7], Ttl(10))
    });
    assert_eq!(replies, [status_only(1, Status::Success)]);
    assert_eq!(f.accessory.scene, 0);

    // A second one while the first is pending.
    let replies = f.send_ok(id, &mut controller, |m| {
        m.timed_write(BRIGHTNESS_IID, &[1, 0, 0, 0], Ttl(10))
    });
    assert_eq!(replies, [status_only(1, Status::MaxProcedures)]);

    f.clock.advance(Duration::from_millis(1000));
    let replies = f.send_ok(id, &mut controller, |m| m.execute_write(SCENE_IID));
    assert_eq!(replies, [status_only(1, Status::Success)]);
    assert_eq!(f.accessory.scene, 7);

    // Execute after the ttl ran out.
    f.send_ok(id, &mut controller, |m| m.timed_write(SCENE_IID, &[9], Ttl(10)));
    f.clock.advance(Duration::from_millis(1001));
    let replies = f.send_ok(id, &mut controller, |m| m.execute_write(SCENE_IID));
    assert_eq!(replies, [status_only(1, Status::InvalidRequest)]);
    assert_eq!(f.accessory.scene, 7);

    // Execute without anything pending.
    let replies = f.send_ok(id, &mut controller, |m| m.execute_write(BRIGHTNESS_IID));
    assert_eq!(replies, [status_only(1, Status::InvalidRequest)]);

    // Range checks apply on execute.
    f.send_ok(id, &mut controller, |m| {
        m.timed_write(BRIGHTNESS_IID, &200i32.to_le_bytes(), Ttl(10))
    });
    let replies = f.send_ok(id, &mut controller, |m| m.execute_write(BRIGHTNESS_IID));
    assert_eq!(replies, [status_only(1, Status::InvalidRequest)]);
    assert_eq!(f.accessory.brightness, 50);
}

static EVENTS: HapEventChannel<CriticalSectionRawMutex> = Channel::new();

#[test]
fn test_notifications() {
    crate::test::init();
    let chars = characteristics();
    let mut f = Fixture::new(&chars);
    let (a, mut controller_a, _keys_a) = f.connect(0x0a);
    let (b, mut controller_b, keys_b) = f.connect(0x0b);
    assert_ne!(a, b);

    for (id, controller) in [(a, &mut controller_a), (b, &mut controller_b)] {
        let replies = f.send_ok(id, controller, |m| m.configure_events(BRIGHTNESS_IID, true));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].status, Some(Status::Success));
        assert_eq!(
            replies[0].body.as_deref(),
            Some(&[ConfigurationTLVType::Properties as u8, 2, 0x01, 0x00][..])
        );
        assert!(f.server.connection(id).unwrap().is_subscribed(BRIGHTNESS_IID));
    }

    // Events can't be enabled on a characteristic without event support.
    let replies = f.send_ok(a, &mut controller_a, |m| m.configure_events(SCENE_IID, true));
    assert_eq!(replies, [status_only(1, Status::InvalidRequest)]);

    // A writes, only B hears about it.
    f.send_ok(a, &mut controller_a, |m| {
        m.write(BRIGHTNESS_IID, &70i32.to_le_bytes(), false)
    });
    let mut frame = [0u8; 64];
    assert_eq!(
        f.server.next_notification(a, &f.accessory, f.clock.now(), &mut frame),
        Ok(None)
    );
    let len = f
        .server
        .next_notification(b, &f.accessory, f.clock.now(), &mut frame)
        .unwrap()
        .unwrap();

    // Only the event key opens it.
    let mut copy = frame;
    let mut control = SessionChannel::new(keys_b.controller_view().decrypt);
    assert_eq!(control.decrypt(&mut copy[0..len]), Err(HapError::InvalidData));
    let (iid, value) = controller_b.decrypt_notification(&mut frame[0..len]).unwrap();
    assert_eq!(iid, BRIGHTNESS_IID);
    assert_eq!(value, &70i32.to_le_bytes());
    assert_eq!(f.server.connection(b).unwrap().session().nonces().2, 1);

    // Local changes go through the event channel.
    let sender = HapInterfaceSender::new(&EVENTS);
    let receiver = HapInterfaceReceiver::new(&EVENTS);
    f.accessory.brightness = 20;
    sender.try_characteristic_changed(BRIGHTNESS_IID).unwrap();
    sender.try_characteristic_changed(BRIGHTNESS_IID).unwrap();
    sender.try_characteristic_changed(CharId(0x99)).unwrap();
    let gsn = f.store.global_state_number;
    assert_eq!(f.server.dispatch_events(&receiver, &mut f.store), Ok(2));
    assert_eq!(f.store.global_state_number, gsn + 2);
    // Repeated changes of the same characteristic coalesce.
    assert_eq!(f.server.connection(a).unwrap().pending_events(), 1);
    assert_eq!(f.server.connection(b).unwrap().pending_events(), 1);

    let len = f
        .server
        .next_notification(a, &f.accessory, f.clock.now(), &mut frame)
        .unwrap()
        .unwrap();
    let (iid, value) = controller_a.decrypt_notification(&mut frame[0..len]).unwrap();
    assert_eq!((iid, value), (BRIGHTNESS_IID, &20i32.to_le_bytes()[..]));

    // Unsubscribing drops what was queued.
    f.send_ok(b, &mut controller_b, |m| m.configure_events(BRIGHTNESS_IID, false));
    assert_eq!(f.server.connection(b).unwrap().pending_events(), 0);
    assert!(!f.server.connection(b).unwrap().is_subscribed(BRIGHTNESS_IID));
}

#[test]
fn test_session_expiry() {
    crate::test::init();
    let chars = characteristics();
    let mut f = Fixture::new(&chars);
    let (id, mut controller, _keys) = f.connect(0x42);
    f.send_ok(id, &mut controller, |m| m.configure_events(ON_IID, true));

    let expiry = Duration::from_millis(config().session.key_expiry_ms);
    let epsilon = Duration::from_ticks(1);

    // Just before the expiry is fine, and restarts the clock.
    f.clock.advance(expiry - epsilon);
    let replies = f.send_ok(id, &mut controller, |m| m.read(ON_IID));
    assert_eq!(replies, [with_value(1, &[0])]);

    f.clock.advance(expiry);
    assert_eq!(
        f.send(id, &mut controller, |m| m.read(ON_IID)),
        Ok(Err(Rejection::SessionExpired))
    );
    // Nothing was decrypted.
    let session = f.server.connection(id).unwrap().session();
    assert_eq!(session.state(), SessionState::Expired);
    assert_eq!(session.nonces(), (2, 2, 0));

    // Notifications still go out.
    let receiver = HapInterfaceReceiver::new(&EXPIRY_EVENTS);
    HapInterfaceSender::new(&EXPIRY_EVENTS)
        .try_characteristic_changed(ON_IID)
        .unwrap();
    f.server.dispatch_events(&receiver, &mut f.store).unwrap();
    let mut frame = [0u8; 64];
    let len = f
        .server
        .next_notification(id, &f.accessory, f.clock.now(), &mut frame)
        .unwrap()
        .unwrap();
    assert!(controller.decrypt_notification(&mut frame[0..len]).is_ok());

    // Until the controller is unreachable for too long.
    f.clock.advance(Duration::from_millis(config().session.unreachable_timeout_ms));
    f.server.poll(f.clock.now());
    assert!(f.server.connection(id).is_none());
    assert_eq!(
        f.send(id, &mut controller, |m| m.read(ON_IID)),
        Err(HapError::InvalidState)
    );
}

static EXPIRY_EVENTS: HapEventChannel<CriticalSectionRawMutex> = Channel::new();

#[test]
fn test_authentication_failure() {
    crate::test::init();
    let chars = characteristics();
    let mut f = Fixture::new(&chars);
    let (id, mut controller, _keys) = f.connect(0x42);

    let mut garbage = [0x5au8; 24];
    let mut out = [0u8; 64];
    assert_eq!(
        f.server.handle_secure_message(
            id,
            &mut f.accessory,
            &mut f.store,
            f.clock.now(),
            &mut garbage,
            &mut out
        ),
        Err(HapError::InvalidData)
    );
    assert_eq!(f.server.connection(id).unwrap().session().nonces(), (0, 1, 0));

    // The genuine controller is now a nonce behind.
    assert_eq!(
        f.send(id, &mut controller, |m| m.read(ON_IID)),
        Err(HapError::InvalidData)
    );
}

#[test]
fn test_connections() {
    crate::test::init();
    let chars = characteristics();
    let mut f = Fixture::new(&chars);
    let keys = SessionKeys::derive(&[1u8; 32]).unwrap();
    let mut ids = Vec::new();
    for _ in 0..CONNECTIONS_MAX {
        ids.push(f.server.connect(&keys, f.clock.now()).unwrap());
    }
    assert_eq!(
        f.server.connect(&keys, f.clock.now()),
        Err(HapError::OutOfResources)
    );
    f.server.disconnect(ids[1]).unwrap();
    assert!(f.server.connection(ids[1]).is_none());
    assert_eq!(f.server.disconnect(ids[1]), Err(HapError::InvalidState));
    let id = f.server.connect(&keys, f.clock.now()).unwrap();
    assert!(!ids.contains(&id));
}

#[test]
fn test_server_from_store() {
    crate::test::init();
    let chars = characteristics();
    let database = AttributeDatabase::new(&chars).unwrap();
    let mut store = MemoryStore::default();
    let server = AccessoryServer::from_store(database, &store).unwrap();
    assert_eq!(server.config(), &ServerConfig::default());

    config().save(&mut store).unwrap();
    let server = AccessoryServer::from_store(database, &store).unwrap();
    assert_eq!(server.config(), &config());

    let bad = ServerConfig {
        session: SessionConfig {
            key_expiry_ms: 100,
            unreachable_timeout_ms: 100,
        },
        config_number: 1,
    };
    assert!(AccessoryServer::new(database, bad).is_err());
}
