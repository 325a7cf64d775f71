use crate::{Error, Result};
use std::fmt;
use std::io::{BufRead, Read, Write};
use zeroize::Zeroizing;

pub const MAGIC: &str = "ANDROID BACKUP\n";
pub const ENCRYPTION_NONE: &str = "none";
pub const ENCRYPTION_AES_256: &str = "AES-256";

/// Salt length in bytes for both the user-password and checksum salts.
pub const SALT_SIZE: usize = 64;

// No legitimate header line comes close; keeps a garbage stream from
// being buffered whole while we look for a newline.
const MAX_LINE: u64 = 4096;

/// Backup container format version, 1 through 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FormatVersion(u32);

impl FormatVersion {
    pub const V1: FormatVersion = FormatVersion(1);
    pub const LATEST: FormatVersion = FormatVersion(5);

    pub fn new(version: u32) -> Result<Self> {
        if version == 0 || version > Self::LATEST.0 {
            return Err(Error::UnsupportedVersion(version));
        }
        Ok(Self(version))
    }

    /// The version the platform's backup manager writes at a given API level.
    pub fn from_api_level(api: u32) -> Result<Self> {
        match api {
            26.. => Ok(Self(5)),
            24..=25 => Ok(Self(4)),
            21..=23 => Ok(Self(3)),
            14..=20 => Ok(Self(1)),
            _ => Err(Error::Config(format!("API level {} is not supported", api))),
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lines 5 to 9 of an encrypted header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionParams {
    pub user_salt: Vec<u8>,
    pub checksum_salt: Vec<u8>,
    pub rounds: u32,
    pub user_iv: Vec<u8>,
    pub key_blob: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupHeader {
    pub version: FormatVersion,
    pub compressed: bool,
    pub encryption: Option<EncryptionParams>,
}

impl BackupHeader {
    pub fn algorithm(&self) -> &'static str {
        if self.encryption.is_some() {
            ENCRYPTION_AES_256
        } else {
            ENCRYPTION_NONE
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Serializes the header. The payload starts right after the last `\n`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = String::with_capacity(1024);
        buf.push_str(MAGIC);
        buf.push_str(&format!("{}\n", self.version));
        buf.push_str(if self.compressed { "1\n" } else { "0\n" });
        buf.push_str(self.algorithm());
        buf.push('\n');
        if let Some(params) = &self.encryption {
            buf.push_str(&hex::encode(&params.user_salt));
            buf.push('\n');
            buf.push_str(&hex::encode(&params.checksum_salt));
            buf.push('\n');
            buf.push_str(&format!("{}\n", params.rounds));
            buf.push_str(&hex::encode(&params.user_iv));
            buf.push('\n');
            buf.push_str(&hex::encode(&params.key_blob));
            buf.push('\n');
        }
        buf.into_bytes()
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Parses the header, leaving `reader` positioned at the first payload byte.
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; MAGIC.len()];
        reader.read_exact(&mut magic).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::Format("Didn't read the right header magic".to_string()),
            _ => Error::Io(e),
        })?;
        if magic != MAGIC.as_bytes() {
            return Err(Error::Format("Didn't read the right header magic".to_string()));
        }

        let line = read_line(reader)?;
        let version = line
            .parse::<u32>()
            .map_err(|_| Error::Format(format!("Wrong header version: {}", line)))?;
        let version = FormatVersion::new(version)?;

        let line = read_line(reader)?;
        let compressed = match line.as_str() {
            "0" => false,
            "1" => true,
            other => {
                // Anything non-zero counts as compressed, as long as it is a number.
                other
                    .parse::<i64>()
                    .map_err(|_| Error::Format(format!("Bad compression flag: {}", other)))?
                    != 0
            }
        };

        let algorithm = read_line(reader)?;
        let encryption = match algorithm.as_str() {
            ENCRYPTION_NONE => None,
            ENCRYPTION_AES_256 => Some(read_encryption_params(reader)?),
            other => return Err(Error::UnsupportedAlgorithm(other.to_string())),
        };

        Ok(Self {
            version,
            compressed,
            encryption,
        })
    }
}

fn read_encryption_params<R: BufRead>(reader: &mut R) -> Result<EncryptionParams> {
    let user_salt = read_hex_line(reader, "user salt")?;
    let checksum_salt = read_hex_line(reader, "checksum salt")?;
    let line = read_line(reader)?;
    let rounds = line
        .parse::<u32>()
        .map_err(|_| Error::Format(format!("Bad PBKDF2 round count: {}", line)))?;
    if rounds == 0 {
        return Err(Error::Format("PBKDF2 round count must be non-zero".to_string()));
    }
    let user_iv = read_hex_line(reader, "user key IV")?;
    let key_blob = read_hex_line(reader, "key blob")?;
    Ok(EncryptionParams {
        user_salt,
        checksum_salt,
        rounds,
        user_iv,
        key_blob,
    })
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut buf = Vec::with_capacity(80);
    reader.by_ref().take(MAX_LINE).read_until(b'\n', &mut buf)?;
    match buf.pop() {
        Some(b'\n') => {}
        _ => return Err(Error::Format("Truncated header line".to_string())),
    }
    String::from_utf8(buf).map_err(|_| Error::Format("Header line is not UTF-8".to_string()))
}

fn read_hex_line<R: BufRead>(reader: &mut R, what: &str) -> Result<Vec<u8>> {
    let line = read_line(reader)?;
    hex::decode(&line).map_err(|e| Error::Format(format!("Bad {} hex: {}", what, e)))
}

/// The plaintext hidden in header line 9:
/// `[len][iv][len][key][len][checksum]`, each length a single unsigned byte.
pub struct KeyBlob {
    pub iv: Vec<u8>,
    pub key: Zeroizing<Vec<u8>>,
    pub checksum: Vec<u8>,
}

impl KeyBlob {
    pub fn encode(&self) -> Result<Zeroizing<Vec<u8>>> {
        let mut out = Zeroizing::new(Vec::with_capacity(
            self.iv.len() + self.key.len() + self.checksum.len() + 3,
        ));
        for part in [&self.iv[..], &self.key[..], &self.checksum[..]] {
            let len = u8::try_from(part.len())
                .map_err(|_| Error::Crypto(format!("key blob component too long: {}", part.len())))?;
            out.push(len);
            out.extend_from_slice(part);
        }
        Ok(out)
    }

    /// Splits a decrypted blob. `None` when the lengths do not fit, which after
    /// decryption only happens with the wrong key.
    pub fn decode(blob: &[u8]) -> Option<Self> {
        let mut rest = blob;
        let iv = take_part(&mut rest)?.to_vec();
        let key = Zeroizing::new(take_part(&mut rest)?.to_vec());
        let checksum = take_part(&mut rest)?.to_vec();
        Some(Self { iv, key, checksum })
    }
}

fn take_part<'a>(rest: &mut &'a [u8]) -> Option<&'a [u8]> {
    let (&len, tail) = rest.split_first()?;
    if tail.len() < len as usize {
        return None;
    }
    let (part, tail) = tail.split_at(len as usize);
    *rest = tail;
    Some(part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encrypted_header() -> BackupHeader {
        BackupHeader {
            version: FormatVersion::LATEST,
            compressed: true,
            encryption: Some(EncryptionParams {
                user_salt: vec![0xab; SALT_SIZE],
                checksum_salt: vec![0x01; SALT_SIZE],
                rounds: 10000,
                user_iv: vec![0x22; 16],
                key_blob: vec![0xfe; 96],
            }),
        }
    }

    #[test]
    fn test_plain_header_layout() {
        let header = BackupHeader {
            version: FormatVersion::new(3).unwrap(),
            compressed: false,
            encryption: None,
        };
        assert_eq!(header.to_bytes(), b"ANDROID BACKUP\n3\n0\nnone\n");
    }

    #[test]
    fn test_encrypted_header_layout() {
        let bytes = encrypted_header().to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.split_terminator('\n').collect();
        assert_eq!(lines.len(), 9);
        assert_eq!(&lines[..4], ["ANDROID BACKUP", "5", "1", "AES-256"]);
        assert_eq!(lines[4], "ab".repeat(SALT_SIZE));
        assert_eq!(lines[6], "10000");
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_read_leaves_payload() {
        let mut data = encrypted_header().to_bytes();
        data.extend_from_slice(b"PAYLOAD");
        let mut cursor = Cursor::new(data);
        let header = BackupHeader::read_from(&mut cursor).unwrap();
        assert_eq!(header, encrypted_header());
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"PAYLOAD");
    }

    #[test]
    fn test_hex_is_case_insensitive() {
        let text = format!(
            "ANDROID BACKUP\n5\n1\nAES-256\n{}\n{}\n10000\n{}\n{}\n",
            "AB".repeat(SALT_SIZE),
            "Cd".repeat(SALT_SIZE),
            "0F".repeat(16),
            "aa".repeat(48)
        );
        let header = BackupHeader::read_from(&mut Cursor::new(text.into_bytes())).unwrap();
        let params = header.encryption.unwrap();
        assert_eq!(params.user_salt, vec![0xab; SALT_SIZE]);
        assert_eq!(params.checksum_salt, vec![0xcd; SALT_SIZE]);
        assert_eq!(params.user_iv, vec![0x0f; 16]);
    }

    #[test]
    fn test_bad_magic() {
        let err = BackupHeader::read_from(&mut Cursor::new(b"ANDROID BACKUQ\n5\n".to_vec())).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        let err = BackupHeader::read_from(&mut Cursor::new(b"ANDR".to_vec())).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_newer_version_rejected() {
        let err = BackupHeader::read_from(&mut Cursor::new(b"ANDROID BACKUP\n6\n1\nnone\n".to_vec()))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(6)));
    }

    #[test]
    fn test_unknown_algorithm() {
        let err = BackupHeader::read_from(&mut Cursor::new(b"ANDROID BACKUP\n5\n1\nDES\n".to_vec()))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlgorithm(ref name) if name == "DES"));
    }

    #[test]
    fn test_truncated_encrypted_header() {
        let err = BackupHeader::read_from(&mut Cursor::new(b"ANDROID BACKUP\n5\n1\nAES-256\nabab".to_vec()))
            .unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_version_from_api_level() {
        assert_eq!(FormatVersion::from_api_level(34).unwrap().get(), 5);
        assert_eq!(FormatVersion::from_api_level(26).unwrap().get(), 5);
        assert_eq!(FormatVersion::from_api_level(25).unwrap().get(), 4);
        assert_eq!(FormatVersion::from_api_level(24).unwrap().get(), 4);
        assert_eq!(FormatVersion::from_api_level(23).unwrap().get(), 3);
        assert_eq!(FormatVersion::from_api_level(21).unwrap().get(), 3);
        assert_eq!(FormatVersion::from_api_level(19).unwrap().get(), 1);
        assert_eq!(FormatVersion::from_api_level(14).unwrap().get(), 1);
        assert!(FormatVersion::from_api_level(13).is_err());
    }

    #[test]
    fn test_key_blob_layout() {
        let blob = KeyBlob {
            iv: vec![1; 16],
            key: Zeroizing::new(vec![2; 32]),
            checksum: vec![3; 32],
        };
        let encoded = blob.encode().unwrap();
        assert_eq!(encoded.len(), 16 + 32 + 32 + 3);
        assert_eq!(encoded[0], 16);
        assert_eq!(encoded[17], 32);
        assert_eq!(encoded[50], 32);

        let decoded = KeyBlob::decode(&encoded).unwrap();
        assert_eq!(decoded.iv, blob.iv);
        assert_eq!(decoded.key, blob.key);
        assert_eq!(decoded.checksum, blob.checksum);
    }

    #[test]
    fn test_key_blob_bad_lengths() {
        assert!(KeyBlob::decode(&[]).is_none());
        assert!(KeyBlob::decode(&[200, 1, 2, 3]).is_none());
        assert!(KeyBlob::decode(&[1, 9, 1, 9]).is_none());
    }
}
