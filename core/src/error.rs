use crate::category::Category;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed backup: {0}")]
    Format(String),

    #[error("Unsupported backup format version: {0}")]
    UnsupportedVersion(u32),

    #[error("Unsupported encryption method: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Incorrect password")]
    IncorrectPassword,

    #[error("Archive is encrypted but no password given")]
    PasswordRequired,

    #[error("Path traversal detected in entry {entry} (resolves to {resolved})")]
    Traversal { entry: String, resolved: String },

    #[error("Unknown/unsupported entries detected: {}", .0.join(", "))]
    UnknownEntries(Vec<String>),

    #[error("Invalid category: {0:?}")]
    InvalidCategory(Category),

    #[error("Refusing to overwrite existing segment {}", .0.display())]
    OutputExists(std::path::PathBuf),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for the password/checksum failures a caller may want to re-prompt on.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Error::IncorrectPassword | Error::PasswordRequired)
    }

    pub fn is_traversal(&self) -> bool {
        matches!(self, Error::Traversal { .. })
    }

    pub(crate) fn traversal(entry: impl Into<String>, resolved: impl Into<String>) -> Self {
        Error::Traversal {
            entry: entry.into(),
            resolved: resolved.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
