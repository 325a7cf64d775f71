use crate::secret::{Password, SecretBytes};
use crate::{Error, Result};
use ring::pbkdf2;
use std::num::NonZeroU32;
use zeroize::Zeroizing;

/// Length in bytes of every key this module produces (256 bits).
pub const KEY_SIZE: usize = 32;

/// Default PBKDF2 round count written into new headers.
pub const DEFAULT_ROUNDS: u32 = 10_000;

/// The two PBKDF2-HMAC-SHA1 password encodings the backup manager has used.
///
/// `Utf8` is `PBKDF2WithHmacSHA1`; `EightBit` is `PBKDF2WithHmacSHA1And8bit`,
/// which only ever appears in version 1 archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pbkdf {
    Utf8,
    EightBit,
}

impl Pbkdf {
    pub fn name(self) -> &'static str {
        match self {
            Pbkdf::Utf8 => "PBKDF2WithHmacSHA1",
            Pbkdf::EightBit => "PBKDF2WithHmacSHA1And8bit",
        }
    }

    /// Derives the 256-bit user key from a password.
    pub fn derive_key(self, password: &Password, salt: &[u8], rounds: u32) -> Result<SecretBytes> {
        match self {
            Pbkdf::Utf8 => pbkdf2_sha1(password.expose().as_bytes(), salt, rounds),
            Pbkdf::EightBit => pbkdf2_sha1(&password.to_8bit(), salt, rounds),
        }
    }

    /// Runs raw key bytes back through the KDF as if they were a password.
    ///
    /// Each byte is widened to a UTF-16 unit with sign extension first, so
    /// bytes >= 0x80 become U+FF80..U+FFFF under the UTF-8 encoding. Archives
    /// written by the platform depend on this.
    pub fn key_checksum(self, key: &[u8], salt: &[u8], rounds: u32) -> Result<SecretBytes> {
        let secret = match self {
            Pbkdf::Utf8 => {
                let mut encoded = Zeroizing::new(Vec::with_capacity(key.len() * 3));
                let mut buf = [0u8; 4];
                for &byte in key {
                    let unit = byte as i8 as i16 as u16;
                    let ch = char::from_u32(unit as u32)
                        .ok_or_else(|| Error::Crypto(format!("unencodable key unit {:#06x}", unit)))?;
                    encoded.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
                encoded
            }
            Pbkdf::EightBit => Zeroizing::new(key.to_vec()),
        };
        pbkdf2_sha1(&secret, salt, rounds)
    }
}

fn pbkdf2_sha1(secret: &[u8], salt: &[u8], rounds: u32) -> Result<SecretBytes> {
    let rounds = NonZeroU32::new(rounds)
        .ok_or_else(|| Error::Crypto("PBKDF2 round count must be non-zero".to_string()))?;
    let mut out = Zeroizing::new(vec![0u8; KEY_SIZE]);
    pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA1, rounds, salt, secret, &mut out);
    Ok(out)
}
