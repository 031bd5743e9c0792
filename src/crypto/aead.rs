use crate::HapError;
use chacha20poly1305::aead::generic_array::typenum::Unsigned;
use chacha20poly1305::{
    aead::{AeadCore, KeyInit},
    AeadInPlace, ChaCha20Poly1305, Key, Nonce,
};
use zeroize::Zeroize;

pub const CHACHA20_POLY1305_KEY_BYTES: usize = 32;
pub const CHACHA20_POLY1305_TAG_BYTES: usize = 16;

type NonceSize = <ChaCha20Poly1305 as AeadCore>::NonceSize;

//  HAPSessionChannelState
/// One direction of a secure session, a key plus the counter that forms the nonce.
///
/// Every encrypt or decrypt consumes exactly one nonce, also when the operation fails.
#[derive(Clone, Default)]
pub struct SessionChannel {
    key: [u8; CHACHA20_POLY1305_KEY_BYTES],
    nonce: u64,
}

impl core::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("SessionChannel")
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl SessionChannel {
    pub fn new(key: [u8; CHACHA20_POLY1305_KEY_BYTES]) -> Self {
        Self { key, nonce: 0 }
    }

    /// Counter value the next operation will use.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Overwrite the key with zeros.
    pub fn clear(&mut self) {
        self.key.zeroize();
    }

    pub fn is_cleared(&self) -> bool {
        self.key.iter().all(|b| *b == 0)
    }

    // 32 bits of zero followed by the 64 bit counter, little endian.
    fn take_nonce(&mut self) -> Result<[u8; NonceSize::USIZE], HapError> {
        let current = self.nonce;
        self.nonce = current.checked_add(1).ok_or(HapError::InvalidState)?;
        let mut nonce_bytes: [u8; NonceSize::USIZE] = Default::default();
        nonce_bytes[4..].copy_from_slice(&current.to_le_bytes());
        Ok(nonce_bytes)
    }

    /// Decrypt and authenticate the whole buffer in place, returning the plaintext.
    pub fn decrypt<'a>(&mut self, buffer: &'a mut [u8]) -> Result<&'a [u8], HapError> {
        let nonce_bytes = self.take_nonce()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = Nonce::from_slice(&nonce_bytes);

        let associated_data = &[];
        let mut buffer = BufferSlice::whole(buffer);
        // Too short for a tag fails here too.
        cipher
            .decrypt_in_place(nonce, associated_data, &mut buffer)
            .map_err(|_| HapError::InvalidData)?;

        // Convert the buffer back into the ref.
        Ok(buffer.into_buffer_ref())
    }

    /// Encrypt the first `payload_length` bytes in place and append the tag.
    pub fn encrypt<'a>(
        &mut self,
        buffer: &'a mut [u8],
        payload_length: usize,
    ) -> Result<&'a [u8], HapError> {
        let nonce_bytes = self.take_nonce()?;
        if payload_length > buffer.len() {
            return Err(HapError::OutOfResources);
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = Nonce::from_slice(&nonce_bytes);

        let associated_data = &[];
        let mut buffer = BufferSlice::partial(buffer, payload_length);
        cipher
            .encrypt_in_place(nonce, associated_data, &mut buffer)
            .map_err(|_| HapError::OutOfResources)?;

        Ok(buffer.into_buffer_ref())
    }
}

/// Adapts a fixed slice to the growable buffer the aead crate works with.
pub struct BufferSlice<'a> {
    buffer: &'a mut [u8],
    end: usize,
}
impl<'a> BufferSlice<'a> {
    pub fn whole(buffer: &'a mut [u8]) -> Self {
        let len = buffer.len();
        Self { buffer, end: len }
    }
    pub fn partial(buffer: &'a mut [u8], length: usize) -> Self {
        Self {
            buffer,
            end: length,
        }
    }
    fn into_buffer_ref(self) -> &'a [u8] {
        &self.buffer[0..self.end]
    }
}
impl<'a> chacha20poly1305::aead::Buffer for BufferSlice<'a> {
    fn extend_from_slice(&mut self, other: &[u8]) -> chacha20poly1305::aead::Result<()> {
        if (self.end + other.len()) <= self.buffer.len() {
            self.buffer[self.end..self.end + other.len()].copy_from_slice(other);
            self.end += other.len();
        } else {
            return Err(chacha20poly1305::aead::Error);
        }
        Ok(())
    }

    fn truncate(&mut self, len: usize) {
        self.end = len;
    }
}
impl<'a> core::convert::AsRef<[u8]> for BufferSlice<'a> {
    fn as_ref(&self) -> &[u8] {
        &self.buffer[0..self.end]
    }
}
impl<'a> core::convert::AsMut<[u8]> for BufferSlice<'a> {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[0..self.end]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // c_to_a key from a captured pair verify.
    const KEY: [u8; 32] = [
        0x66, 0x52, 0x2f, 0xe8, 0xf4, 0x98, 0xdd, 0xfa, 0xd2, 0x54, 0x93, 0xd8, 0x6a, 0xef, 0xe7,
        0xad, 0x50, 0xe5, 0x80, 0xfc, 0x39, 0x52, 0x4e, 0x12, 0xca, 0xea, 0xc3, 0xbe, 0x5d, 0x36,
        0xb1, 0x30,
    ];
    // First encrypted write on that session, nonce 0.
    const CIPHERTEXT: [u8; 21] = [
        0x82, 0x25, 0xd1, 0xa4, 0x1f, 0x0a, 0xd5, 0xe0, 0xef, 0xe8, 0xb2, 0x48, 0x32, 0xa2, 0x7c,
        0xb6, 0x62, 0x39, 0x74, 0xb6, 0x31,
    ];
    const PLAINTEXT: [u8; 5] = [0x00, 0x12, 0x03, 0x11, 0x00];

    #[test]
    fn test_aead_first_incoming_payload() {
        crate::test::init();
        let mut channel = SessionChannel::new(KEY);

        let mut buffer = CIPHERTEXT;
        let v = channel.decrypt(&mut buffer).unwrap();
        info!("plaintext: {:?}", v);
        assert_eq!(v, &PLAINTEXT);
        assert_eq!(channel.nonce(), 1);
    }

    #[test]
    fn test_aead_encrypt_matches_capture() {
        crate::test::init();
        let mut channel = SessionChannel::new(KEY);
        let mut buffer = [0u8; 32];
        buffer[0..PLAINTEXT.len()].copy_from_slice(&PLAINTEXT);
        let encrypted = channel.encrypt(&mut buffer, PLAINTEXT.len()).unwrap();
        assert_eq!(encrypted, &CIPHERTEXT);
        assert_eq!(channel.nonce(), 1);

        // Same plaintext under the next nonce is different.
        let mut buffer = [0u8; 32];
        buffer[0..PLAINTEXT.len()].copy_from_slice(&PLAINTEXT);
        let encrypted = channel.encrypt(&mut buffer, PLAINTEXT.len()).unwrap();
        assert_ne!(encrypted, &CIPHERTEXT);
        assert_eq!(channel.nonce(), 2);
    }

    #[test]
    fn test_aead_exact_fit() {
        crate::test::init();
        // Payload plus tag exactly fills the buffer.
        let mut channel = SessionChannel::new(KEY);
        let mut buffer = [0u8; 21];
        buffer[0..PLAINTEXT.len()].copy_from_slice(&PLAINTEXT);
        assert_eq!(channel.encrypt(&mut buffer, 5).unwrap(), &CIPHERTEXT);

        let mut buffer = [0u8; 20];
        assert_eq!(
            channel.encrypt(&mut buffer, 5),
            Err(HapError::OutOfResources)
        );
        // The failed attempt still consumed its nonce.
        assert_eq!(channel.nonce(), 2);

        // Payload longer than the buffer itself.
        let mut buffer = [0u8; 4];
        assert_eq!(
            channel.encrypt(&mut buffer, 5),
            Err(HapError::OutOfResources)
        );
        assert_eq!(channel.nonce(), 3);
    }

    #[test]
    fn test_aead_failures_consume_nonce() {
        crate::test::init();
        let mut channel = SessionChannel::new(KEY);

        let mut tampered = CIPHERTEXT;
        tampered[2] ^= 0x01;
        assert_eq!(channel.decrypt(&mut tampered), Err(HapError::InvalidData));
        assert_eq!(channel.nonce(), 1);

        // Too short to even hold a tag.
        let mut short = [0u8; 10];
        assert_eq!(channel.decrypt(&mut short), Err(HapError::InvalidData));
        assert_eq!(channel.nonce(), 2);

        // The genuine message is now out of sequence.
        let mut buffer = CIPHERTEXT;
        assert_eq!(channel.decrypt(&mut buffer), Err(HapError::InvalidData));
    }

    #[test]
    fn test_aead_nonce_exhausted() {
        crate::test::init();
        let mut channel = SessionChannel::new(KEY);
        channel.nonce = u64::MAX;
        let mut buffer = [0u8; 32];
        assert_eq!(channel.encrypt(&mut buffer, 1), Err(HapError::InvalidState));
        assert_eq!(channel.nonce(), u64::MAX);
    }
}
