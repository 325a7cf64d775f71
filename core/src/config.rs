use crate::archive::TarType;
use crate::header::FormatVersion;
use crate::kdf::DEFAULT_ROUNDS;
use crate::pack::PackOptions;
use crate::split::DEFAULT_SPLIT_SIZE;
use crate::unpack::UnpackOptions;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persistent defaults, read from a TOML file. Missing keys take their
/// default value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Target platform API level; selects the archive format version.
    pub api_level: u32,
    pub compress: bool,
    pub pbkdf2_rounds: u32,
    pub tar_type: TarType,
    /// Maximum size of one stored segment, in bytes.
    pub split_size: u64,
    /// Where working directories are created. System temp dir if unset.
    pub temp_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_level: 34,
            compress: true,
            pbkdf2_rounds: DEFAULT_ROUNDS,
            tar_type: TarType::Gzip,
            split_size: DEFAULT_SPLIT_SIZE,
            temp_dir: None,
        }
    }
}

impl Settings {
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| Error::Config(format!("Invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Loads `path` if it exists, defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        FormatVersion::from_api_level(self.api_level)?;
        if self.pbkdf2_rounds == 0 {
            return Err(Error::Config("pbkdf2_rounds must be at least 1".to_string()));
        }
        if self.split_size == 0 {
            return Err(Error::Config("split_size must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn pack_options(&self) -> PackOptions {
        PackOptions {
            api_level: self.api_level,
            compress: self.compress,
            rounds: self.pbkdf2_rounds,
            tar_type: self.tar_type,
        }
    }

    pub fn unpack_options(&self) -> UnpackOptions {
        UnpackOptions {
            tar_type: self.tar_type,
            split_size: self.split_size,
        }
    }
}
