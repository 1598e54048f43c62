//! Encryption seam for cache files
//!
//! All bytes written to encrypted stores pass through a [`Cipher`]. Key
//! management and the actual cryptography live outside this crate; the
//! persistence engine only needs the byte-level transform.

use mirror_core::Result;

/// Byte-level encryption seam.
///
/// Implementations must be `Send + Sync`; the persistence engine encrypts
/// from whatever thread performs the save. A cipher instance is already
/// keyed; key material never crosses this boundary.
pub trait Cipher: Send + Sync {
    /// Encrypt a serialized payload.
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a stored payload.
    ///
    /// Returns `Error::Cipher` if the data cannot be decrypted.
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// No-op cipher for stores flagged encrypted while a deployment's real
/// cipher is not yet wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCipher;

impl Cipher for PassthroughCipher {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        Ok(plain.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}
