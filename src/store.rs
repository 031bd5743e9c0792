//! Persistence of long lived accessory state through the platform's key-value store.
//!
//! Session keys never go through here, they only live in memory.

use crate::session::SessionConfig;
use crate::{HapError, InterfaceError};
use serde::{Deserialize, Serialize};

/// Largest serialized record this crate writes.
pub const RECORD_MAX_LENGTH: usize = 64;

/// Keys of the records in the platform store.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RecordKey {
    ServerConfig = 0x01,
}

pub trait PlatformSupport {
    /// Copy the record into `buffer`, returning its length, or None if it was never written.
    fn read_record(&self, key: RecordKey, buffer: &mut [u8]) -> Result<Option<usize>, InterfaceError>;

    fn write_record(&mut self, key: RecordKey, data: &[u8]) -> Result<(), InterfaceError>;

    fn get_global_state_number(&self) -> Result<u16, InterfaceError>;

    fn set_global_state_number(&mut self, value: u16) -> Result<(), InterfaceError>;

    /// Bump the global state number, it wraps to 1 and is never 0.
    fn advance_global_state_number(&mut self) -> Result<u16, InterfaceError> {
        let old = self.get_global_state_number()?;
        let new = old.wrapping_add(1);
        let new = new.max(1); // overflow to 1, not to zero.
        self.set_global_state_number(new)?;
        Ok(new)
    }
}

/// Configuration of the accessory server that survives restarts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub session: SessionConfig,
    /// Bumped whenever the attribute database changes.
    #[serde(with = "postcard::fixint::le")]
    pub config_number: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            config_number: 1,
        }
    }
}

impl ServerConfig {
    /// Load the configuration, falling back to the defaults if none was stored.
    ///
    /// A record that exists but does not decode is an integrity violation and panics.
    pub fn load(support: &impl PlatformSupport) -> Result<Self, HapError> {
        let mut buffer = [0u8; RECORD_MAX_LENGTH];
        let length = match support.read_record(RecordKey::ServerConfig, &mut buffer)? {
            Some(length) => length,
            None => {
                info!("no stored server config, using defaults");
                return Ok(Self::default());
            }
        };
        let data = buffer.get(0..length).ok_or(HapError::InvalidData)?;
        let config = match postcard::take_from_bytes::<ServerConfig>(data) {
            Ok((config, [])) => config,
            Ok((_, trailing)) => {
                panic!("stored server config has {} trailing bytes", trailing.len())
            }
            Err(_) => panic!("stored server config is corrupt"),
        };
        if config.session.validate().is_err() {
            panic!("stored session config is invalid");
        }
        Ok(config)
    }

    pub fn save(&self, support: &mut impl PlatformSupport) -> Result<(), HapError> {
        self.session.validate()?;
        let mut buffer = [0u8; RECORD_MAX_LENGTH];
        let used = postcard::to_slice(self, &mut buffer).map_err(|_| HapError::OutOfResources)?;
        support.write_record(RecordKey::ServerConfig, used)?;
        Ok(())
    }
}
