use crate::{Error, Result};
use std::str::FromStr;

pub const MANIFEST_VERSION: u32 = 1;

/// Mode of the synthesized manifest entry, rw-------.
pub const MANIFEST_MODE: u32 = 0o600;

/// Identity of the package being packed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub package_name: String,
    pub version_code: i64,
    /// DER-encoded signing certificates, newest signer first.
    pub signatures: Vec<Vec<u8>>,
}

/// The `_manifest` record that opens every app's section of a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRecord {
    pub version: u32,
    pub package_name: String,
    pub version_code: i64,
    pub platform_sdk: u32,
    pub installer: String,
    pub apk_included: bool,
    /// Lowercase hex of each signing certificate.
    pub signatures: Vec<String>,
}

impl ManifestRecord {
    pub fn new(package: &PackageInfo, platform_sdk: u32, installer: Option<&str>, apk_included: bool) -> Self {
        Self {
            version: MANIFEST_VERSION,
            package_name: package.package_name.clone(),
            version_code: package.version_code,
            platform_sdk,
            installer: installer.unwrap_or_default().to_string(),
            apk_included,
            signatures: package.signatures.iter().map(hex::encode).collect(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(4096);
        let mut push_line = |line: &str| {
            out.push_str(line);
            out.push('\n');
        };
        push_line(&self.version.to_string());
        push_line(&self.package_name);
        push_line(&self.version_code.to_string());
        push_line(&self.platform_sdk.to_string());
        push_line(&self.installer);
        push_line(if self.apk_included { "1" } else { "0" });
        push_line(&self.signatures.len().to_string());
        for signature in &self.signatures {
            push_line(signature);
        }
        out.into_bytes()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::Format("Manifest is not UTF-8".to_string()))?;
        let mut lines = text.lines();
        let mut next = |what: &str| {
            lines
                .next()
                .ok_or_else(|| Error::Format(format!("Manifest is missing {}", what)))
        };
        let version = number::<u32>("version", next("version")?)?;
        let package_name = next("package name")?.to_string();
        let version_code = number::<i64>("version code", next("version code")?)?;
        let platform_sdk = number::<u32>("platform SDK", next("platform SDK")?)?;
        let installer = next("installer")?.to_string();
        let apk_included = next("APK flag")? == "1";
        let count = number::<usize>("signature count", next("signature count")?)?;
        let mut signatures = Vec::new();
        for _ in 0..count {
            signatures.push(next("signature")?.to_string());
        }

        Ok(Self {
            version,
            package_name,
            version_code,
            platform_sdk,
            installer,
            apk_included,
            signatures,
        })
    }
}

/// Parses one numeric line, rejecting values outside the field's range.
fn number<T: FromStr>(what: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| Error::Format(format!("Bad manifest {}: {}", what, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> PackageInfo {
        PackageInfo {
            package_name: "org.example.app".to_string(),
            version_code: 42,
            signatures: vec![vec![0x30, 0x82, 0x01, 0xff]],
        }
    }

    #[test]
    fn test_manifest_layout() {
        let manifest = ManifestRecord::new(&package(), 34, Some("com.android.vending"), true);
        assert_eq!(
            String::from_utf8(manifest.to_bytes()).unwrap(),
            "1\norg.example.app\n42\n34\ncom.android.vending\n1\n1\n308201ff\n"
        );
    }

    #[test]
    fn test_missing_installer_is_empty_line() {
        let mut info = package();
        info.signatures.clear();
        let manifest = ManifestRecord::new(&info, 21, None, false);
        assert_eq!(
            String::from_utf8(manifest.to_bytes()).unwrap(),
            "1\norg.example.app\n42\n21\n\n0\n0\n"
        );
    }

    #[test]
    fn test_parse() {
        let manifest = ManifestRecord::new(&package(), 34, None, true);
        assert_eq!(ManifestRecord::parse(&manifest.to_bytes()).unwrap(), manifest);
        assert!(ManifestRecord::parse(b"1\norg.example.app\n").is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_numbers() {
        let with = |version: &str, sdk: &str, count: &str| {
            format!("{}\norg.example.app\n42\n{}\n\n0\n{}\n", version, sdk, count).into_bytes()
        };
        assert_eq!(ManifestRecord::parse(&with("1", "34", "0")).unwrap().platform_sdk, 34);
        for bad in [with("-1", "34", "0"), with("1", "4294967296", "0"), with("1", "34", "-1")] {
            let err = ManifestRecord::parse(&bad).unwrap_err();
            assert!(matches!(err, Error::Format(_)), "{:?}", err);
        }
    }
}
