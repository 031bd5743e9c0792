// Session key lifecycle, Active -> Expired -> Released.
//
// https://github.com/apple/HomeKitADK/blob/fb201f98f5fdc7fef6a455054f08b59cca5d1ec8/HAP/HAPSession.h

use crate::crypto::aead::{SessionChannel, CHACHA20_POLY1305_KEY_BYTES};
use crate::crypto::hkdf_sha512;
use crate::HapError;
use embassy_time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Keys of one secure session, as seen from the accessory.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// Accessory to controller control traffic.
    pub encrypt: [u8; CHACHA20_POLY1305_KEY_BYTES],
    /// Controller to accessory control traffic.
    pub decrypt: [u8; CHACHA20_POLY1305_KEY_BYTES],
    /// Accessory to controller notifications.
    pub event: [u8; CHACHA20_POLY1305_KEY_BYTES],
}

impl core::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.write_str("SessionKeys { .. }")
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.encrypt.zeroize();
        self.decrypt.zeroize();
        self.event.zeroize();
    }
}

impl SessionKeys {
    /// Derive the session keys from the shared secret of pair verify.
    pub fn derive(shared_secret: &[u8]) -> Result<Self, HapError> {
        let mut keys = SessionKeys {
            encrypt: [0u8; CHACHA20_POLY1305_KEY_BYTES],
            decrypt: [0u8; CHACHA20_POLY1305_KEY_BYTES],
            event: [0u8; CHACHA20_POLY1305_KEY_BYTES],
        };
        hkdf_sha512(
            shared_secret,
            b"Control-Salt",
            b"Control-Read-Encryption-Key",
            &mut keys.encrypt,
        )?;
        hkdf_sha512(
            shared_secret,
            b"Control-Salt",
            b"Control-Write-Encryption-Key",
            &mut keys.decrypt,
        )?;
        hkdf_sha512(
            shared_secret,
            b"Event-Salt",
            b"Event-Read-Encryption-Key",
            &mut keys.event,
        )?;
        Ok(keys)
    }

    /// The same keys from the controller's side, the control keys swap roles.
    pub fn controller_view(&self) -> Self {
        Self {
            encrypt: self.decrypt,
            decrypt: self.encrypt,
            event: self.event,
        }
    }
}

/// Timeouts of a session, measured from the last successfully processed control message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionConfig {
    /// After this the control keys are no longer used.
    pub key_expiry_ms: u64,
    /// After this notifications stop as well and the keys are discarded.
    pub unreachable_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            key_expiry_ms: 5 * 60 * 1000,
            unreachable_timeout_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// Longest timeout that still converts to embassy-time ticks without overflow.
pub const TIMEOUT_MAX_MS: u64 = u64::MAX / embassy_time::TICK_HZ;

impl SessionConfig {
    pub fn key_expiry(&self) -> Duration {
        Duration::from_millis(self.key_expiry_ms)
    }
    pub fn unreachable_timeout(&self) -> Duration {
        Duration::from_millis(self.unreachable_timeout_ms)
    }

    /// The expiry must be non-zero and shorter than the unreachable timeout, neither may exceed
    /// [`TIMEOUT_MAX_MS`].
    pub fn validate(&self) -> Result<(), HapError> {
        if self.key_expiry_ms == 0 || self.unreachable_timeout_ms <= self.key_expiry_ms {
            return Err(HapError::InvalidData);
        }
        if self.unreachable_timeout_ms > TIMEOUT_MAX_MS {
            warn!("unreachable timeout of {} ms is out of range", self.unreachable_timeout_ms);
            return Err(HapError::InvalidData);
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    /// Control traffic and notifications.
    Active,
    /// Notifications only.
    Expired,
    /// Keys are gone, terminal.
    Released,
}

/// A secure session with one controller.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    config: SessionConfig,
    last_activity: Instant,
    encrypt: SessionChannel,
    decrypt: SessionChannel,
    event: SessionChannel,
}

impl Session {
    pub fn new(keys: &SessionKeys, config: SessionConfig, now: Instant) -> Self {
        Self {
            state: SessionState::Active,
            config,
            last_activity: now,
            encrypt: SessionChannel::new(keys.encrypt),
            decrypt: SessionChannel::new(keys.decrypt),
            event: SessionChannel::new(keys.event),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Nonce counters as (encrypt, decrypt, event).
    pub fn nonces(&self) -> (u64, u64, u64) {
        (self.encrypt.nonce(), self.decrypt.nonce(), self.event.nonce())
    }

    /// Apply any transitions that are due at `now`.
    pub fn poll(&mut self, now: Instant) -> SessionState {
        if self.state == SessionState::Released {
            return self.state;
        }
        let elapsed = now.saturating_duration_since(self.last_activity);
        if elapsed >= self.config.unreachable_timeout() {
            info!("session unreachable for {} ms, releasing", elapsed.as_millis());
            self.release();
        } else if elapsed >= self.config.key_expiry() && self.state == SessionState::Active {
            info!("session keys expired after {} ms", elapsed.as_millis());
            self.state = SessionState::Expired;
        }
        self.state
    }

    /// Record controller activity, this restarts both timeouts.
    pub fn touch(&mut self, now: Instant) {
        if self.state == SessionState::Active {
            self.last_activity = now;
        }
    }

    /// Decrypt an incoming control message.
    ///
    /// Once expired this fails with [`HapError::InvalidState`] without touching the key or the nonce.
    pub fn decrypt_control<'a>(
        &mut self,
        now: Instant,
        buffer: &'a mut [u8],
    ) -> Result<&'a [u8], HapError> {
        if self.poll(now) != SessionState::Active {
            return Err(HapError::InvalidState);
        }
        self.decrypt.decrypt(buffer)
    }

    /// Encrypt an outgoing control message, the response to a message accepted by [`Session::decrypt_control`].
    pub fn encrypt_control<'a>(
        &mut self,
        buffer: &'a mut [u8],
        payload_length: usize,
    ) -> Result<&'a [u8], HapError> {
        if self.state != SessionState::Active {
            return Err(HapError::InvalidState);
        }
        self.encrypt.encrypt(buffer, payload_length)
    }

    /// Encrypt a notification, allowed until the session is released.
    pub fn encrypt_event<'a>(
        &mut self,
        now: Instant,
        buffer: &'a mut [u8],
        payload_length: usize,
    ) -> Result<&'a [u8], HapError> {
        if self.poll(now) == SessionState::Released {
            return Err(HapError::InvalidState);
        }
        self.event.encrypt(buffer, payload_length)
    }

    /// Tear down the session, zeroing all keys.
    pub fn release(&mut self) {
        self.encrypt.clear();
        self.decrypt.clear();
        self.event.clear();
        self.state = SessionState::Released;
    }
}
