//! Scoped secrets. Everything in here is wiped when it goes out of scope,
//! whichever way the enclosing function returns.

use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// Raw key material: derived keys, the data-encryption key, the decrypted key blob.
pub type SecretBytes = Zeroizing<Vec<u8>>;

/// A user password held only as long as the operation that needs it.
#[derive(Clone)]
pub struct Password(Zeroizing<String>);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(Zeroizing::new(password.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }

    /// UTF-16 code units narrowed to their low byte.
    pub(crate) fn to_8bit(&self) -> SecretBytes {
        Zeroizing::new(self.0.encode_utf16().map(|unit| unit as u8).collect())
    }
}

impl From<String> for Password {
    fn from(mut value: String) -> Self {
        let password = Self::new(value.as_str());
        value.zeroize();
        password
    }
}

impl From<&str> for Password {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl PartialEq for Password {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl Eq for Password {}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_does_not_leak() {
        let password = Password::new("hunter2");
        assert_eq!(format!("{:?}", password), "Password(***)");
    }

    #[test]
    fn test_equality() {
        assert_eq!(Password::from("pw".to_string()), Password::new("pw"));
        assert_ne!(Password::new("pw"), Password::new("pW"));
    }

    #[test]
    fn test_8bit_narrowing() {
        let password = Password::new("a\u{00e9}\u{0141}");
        assert_eq!(password.to_8bit().as_slice(), &[0x61, 0xe9, 0x41]);
    }
}
