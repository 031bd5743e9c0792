#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

#[cfg(test)]
extern crate std;

pub mod characteristic;
pub mod controller;
pub mod crypto;
mod error;
pub mod event;
pub mod pdu;
pub mod server;
pub mod session;
pub mod sig;
pub mod store;
pub mod tlv;
pub mod varint;

pub use error::HapError;

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Characteristic instance id.
#[derive(
    PartialEq, Eq, PartialOrd, Ord, FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Copy, Clone, Hash,
)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(transparent)]
pub struct CharId(pub u16);

/// Transaction id, a response carries the id of the request it answers.
#[derive(PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(transparent)]
pub struct TId(pub u8);

/// Identifies a controller connection within the accessory server.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionId(pub u8);

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InterfaceError {
    #[error("characteristic {0:?} is not known by the accessory")]
    CharacteristicUnknown(CharId),
    #[error("value rejected by the accessory")]
    CharacteristicWriteInvalid,
    #[error("platform storage failed")]
    Storage,
}

/// Whether a write changed the value of the characteristic.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CharacteristicResponse {
    /// Value changed, subscribed controllers get notified.
    Modified,
    /// Value is the same as before.
    Unmodified,
}

/// Interface to the application that owns the characteristic values.
pub trait AccessoryInterface {
    /// Read the current value of a characteristic.
    fn read_characteristic(
        &self,
        char_id: CharId,
    ) -> Result<characteristic::CharacteristicValue, InterfaceError>;

    /// Write a new value, the value is already checked against the format and valid range.
    fn write_characteristic(
        &mut self,
        char_id: CharId,
        value: &characteristic::CharacteristicValue,
    ) -> Result<CharacteristicResponse, InterfaceError>;
}

/// Source of the current time, all expiry checks go through this.
pub trait Clock {
    fn now(&self) -> embassy_time::Instant;
}

/// Clock backed by the embassy time driver.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;
impl Clock for SystemClock {
    fn now(&self) -> embassy_time::Instant {
        embassy_time::Instant::now()
    }
}
