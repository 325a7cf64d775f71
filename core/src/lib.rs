pub mod archive;
pub mod category;
pub mod cipher;
pub mod codec;
pub mod config;
pub mod error;
pub mod header;
pub mod kdf;
pub mod manifest;
pub mod pack;
pub mod secret;
pub mod split;
pub mod unpack;

pub use archive::TarType;
pub use category::{Category, PathMapper};
pub use codec::{WriteOptions, ab_to_tar, tar_to_ab};
pub use config::Settings;
pub use error::{Error, Result};
pub use header::{BackupHeader, FormatVersion};
pub use manifest::{ManifestRecord, PackageInfo};
pub use pack::{BackupPacker, PackOptions, PackSummary};
pub use secret::Password;
pub use unpack::{BackupUnpacker, ExtractedBackup, StoredSet, UnpackOptions};
