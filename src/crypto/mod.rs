pub mod aead;

use crate::HapError;
use hkdf::Hkdf;
use sha2::Sha512;

/// HKDF with SHA-512, filling all of `output`.
pub fn hkdf_sha512(key: &[u8], salt: &[u8], info: &[u8], output: &mut [u8]) -> Result<(), HapError> {
    let hk = Hkdf::<Sha512>::new(Some(salt), key);
    hk.expand(info, output).map_err(|_| HapError::InvalidData)
}
