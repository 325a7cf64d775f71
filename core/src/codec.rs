//! The `.ab` container: header, optional AES-256 layer and optional zlib
//! layer around a plain tar stream.
//!
//! On write the layers nest as `tar -> deflate -> encrypt -> file`; on read
//! they are peeled in the opposite order. Both sides stream, so the archive
//! is never held in memory.

use crate::cipher::{self, CipherReader, CipherWriter, IV_SIZE};
use crate::header::{BackupHeader, EncryptionParams, FormatVersion, KeyBlob, SALT_SIZE};
use crate::kdf::{DEFAULT_ROUNDS, KEY_SIZE, Pbkdf};
use crate::secret::{Password, SecretBytes};
use crate::{Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rand::RngCore;
use rand::rngs::OsRng;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// How a new archive is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    pub version: FormatVersion,
    pub compress: bool,
    pub rounds: u32,
}

impl WriteOptions {
    pub fn for_api_level(api_level: u32) -> Result<Self> {
        Ok(Self {
            version: FormatVersion::from_api_level(api_level)?,
            ..Self::default()
        })
    }
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            version: FormatVersion::LATEST,
            compress: true,
            rounds: DEFAULT_ROUNDS,
        }
    }
}

enum Sink<W: Write> {
    Plain(W),
    Encrypted(CipherWriter<W>),
}

impl<W: Write> Sink<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Sink::Plain(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            Sink::Encrypted(writer) => {
                let mut inner = writer.finish()?;
                inner.flush()?;
                Ok(inner)
            }
        }
    }
}

impl<W: Write> Write for Sink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(inner) => inner.write(buf),
            Sink::Encrypted(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(inner) => inner.flush(),
            Sink::Encrypted(writer) => writer.flush(),
        }
    }
}

enum WriteLayer<W: Write> {
    Raw(Sink<W>),
    Deflate(ZlibEncoder<Sink<W>>),
}

/// Payload writer returned by [`wrap`]. The header has already been written;
/// [`BackupWriter::finish`] must be called to close the compression and
/// cipher layers.
pub struct BackupWriter<W: Write> {
    layer: WriteLayer<W>,
}

impl<W: Write> BackupWriter<W> {
    pub fn finish(self) -> Result<W> {
        let sink = match self.layer {
            WriteLayer::Raw(sink) => sink,
            WriteLayer::Deflate(encoder) => encoder.finish()?,
        };
        Ok(sink.finish()?)
    }
}

impl<W: Write> Write for BackupWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.layer {
            WriteLayer::Raw(sink) => sink.write(buf),
            WriteLayer::Deflate(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.layer {
            WriteLayer::Raw(sink) => sink.flush(),
            WriteLayer::Deflate(encoder) => encoder.flush(),
        }
    }
}

/// Writes the header to `out` and returns a writer for the tar payload.
///
/// A missing or empty password produces an unencrypted archive.
pub fn wrap<W: Write>(out: W, options: &WriteOptions, password: Option<&Password>) -> Result<BackupWriter<W>> {
    wrap_with(out, options, password, Pbkdf::Utf8)
}

fn wrap_with<W: Write>(
    mut out: W,
    options: &WriteOptions,
    password: Option<&Password>,
    pbkdf: Pbkdf,
) -> Result<BackupWriter<W>> {
    let password = password.filter(|p| !p.is_empty());
    let sink = match password {
        None => {
            let header = BackupHeader {
                version: options.version,
                compressed: options.compress,
                encryption: None,
            };
            header.write_to(&mut out)?;
            Sink::Plain(out)
        }
        Some(password) => {
            let (params, data_key, data_iv) = seal_data_key(password, options.rounds, pbkdf)?;
            let header = BackupHeader {
                version: options.version,
                compressed: options.compress,
                encryption: Some(params),
            };
            header.write_to(&mut out)?;
            Sink::Encrypted(CipherWriter::new(out, &data_key, &data_iv)?)
        }
    };
    debug!(
        "Writing backup v{} (compressed: {}, encrypted: {})",
        options.version,
        options.compress,
        password.is_some()
    );

    let layer = if options.compress {
        WriteLayer::Deflate(ZlibEncoder::new(sink, flate2::Compression::best()))
    } else {
        WriteLayer::Raw(sink)
    };
    Ok(BackupWriter { layer })
}

/// Generates the data key and wraps it under the password-derived user key.
fn seal_data_key(password: &Password, rounds: u32, pbkdf: Pbkdf) -> Result<(EncryptionParams, SecretBytes, Vec<u8>)> {
    let mut rng = OsRng;
    let mut user_salt = vec![0u8; SALT_SIZE];
    rng.fill_bytes(&mut user_salt);
    let user_key = pbkdf.derive_key(password, &user_salt, rounds)?;

    let mut data_key = Zeroizing::new(vec![0u8; KEY_SIZE]);
    rng.fill_bytes(&mut data_key);
    let mut checksum_salt = vec![0u8; SALT_SIZE];
    rng.fill_bytes(&mut checksum_salt);
    let mut data_iv = vec![0u8; IV_SIZE];
    rng.fill_bytes(&mut data_iv);
    let mut user_iv = vec![0u8; IV_SIZE];
    rng.fill_bytes(&mut user_iv);

    let checksum = pbkdf.key_checksum(&data_key, &checksum_salt, rounds)?;
    let blob = KeyBlob {
        iv: data_iv.clone(),
        key: data_key.clone(),
        checksum: checksum.to_vec(),
    }
    .encode()?;
    let key_blob = cipher::encrypt_padded(&user_key, &user_iv, &blob)?;

    let params = EncryptionParams {
        user_salt,
        checksum_salt,
        rounds,
        user_iv,
        key_blob,
    };
    Ok((params, data_key, data_iv))
}

enum Source<R: Read> {
    Plain(R),
    Encrypted(CipherReader<R>),
}

impl<R: Read> Read for Source<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::Plain(inner) => inner.read(buf),
            Source::Encrypted(reader) => reader.read(buf),
        }
    }
}

enum ReadLayer<R: Read> {
    Raw(Source<R>),
    Inflate(ZlibDecoder<Source<R>>),
}

/// Tar payload of an opened archive.
pub struct BackupReader<R: Read> {
    layer: ReadLayer<R>,
}

impl<R: Read> Read for BackupReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.layer {
            ReadLayer::Raw(source) => source.read(buf),
            ReadLayer::Inflate(decoder) => decoder.read(buf),
        }
    }
}

/// Parses the header from `input` and returns it with a reader over the
/// decrypted, decompressed tar payload.
///
/// Fails with [`Error::PasswordRequired`] when the archive is encrypted and
/// no password was given, and with [`Error::IncorrectPassword`] when the key
/// blob does not decrypt or its checksum does not match.
pub fn unwrap<R: BufRead>(mut input: R, password: Option<&Password>) -> Result<(BackupHeader, BackupReader<R>)> {
    let header = BackupHeader::read_from(&mut input)?;
    debug!(
        "Backup header: v{} compressed={} algorithm={}",
        header.version,
        header.compressed,
        header.algorithm()
    );

    let source = match &header.encryption {
        None => Source::Plain(input),
        Some(params) => {
            let password = password
                .filter(|p| !p.is_empty())
                .ok_or(Error::PasswordRequired)?;
            let blob = open_key_blob(params, header.version, password)?;
            Source::Encrypted(CipherReader::new(input, &blob.key, &blob.iv)?)
        }
    };

    let layer = if header.compressed {
        ReadLayer::Inflate(ZlibDecoder::new(source))
    } else {
        ReadLayer::Raw(source)
    };
    Ok((header, BackupReader { layer }))
}

fn open_key_blob(params: &EncryptionParams, version: FormatVersion, password: &Password) -> Result<KeyBlob> {
    if params.user_iv.len() != IV_SIZE {
        return Err(Error::Format(format!(
            "User key IV must be {} bytes, got {}",
            IV_SIZE,
            params.user_iv.len()
        )));
    }
    match decrypt_key_blob(Pbkdf::Utf8, params, password) {
        Err(Error::IncorrectPassword) if version == FormatVersion::V1 => {
            warn!(
                "Key checksum mismatch with {}, retrying with {}",
                Pbkdf::Utf8.name(),
                Pbkdf::EightBit.name()
            );
            decrypt_key_blob(Pbkdf::EightBit, params, password)
        }
        result => result,
    }
}

fn decrypt_key_blob(pbkdf: Pbkdf, params: &EncryptionParams, password: &Password) -> Result<KeyBlob> {
    let user_key = pbkdf.derive_key(password, &params.user_salt, params.rounds)?;
    let plain = cipher::decrypt_padded(&user_key, &params.user_iv, &params.key_blob)?
        .map(Zeroizing::new)
        .ok_or(Error::IncorrectPassword)?;
    let blob = KeyBlob::decode(&plain).ok_or(Error::IncorrectPassword)?;
    if blob.iv.len() != IV_SIZE || blob.key.len() != KEY_SIZE {
        return Err(Error::IncorrectPassword);
    }

    let computed = pbkdf.key_checksum(&blob.key, &params.checksum_salt, params.rounds)?;
    if !constant_time_eq(&computed, &blob.checksum) {
        return Err(Error::IncorrectPassword);
    }
    debug!("Master key checksum verified with {}", pbkdf.name());
    Ok(blob)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Runs `write` against a temporary file next to `dest` and renames it over
/// `dest` only if it succeeds. On failure nothing is left behind.
pub(crate) fn write_atomically<T>(dest: &Path, write: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new().prefix(".abkit-").tempfile_in(dir)?;
    let value = write(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| Error::Io(e.error))?;
    Ok(value)
}

/// Wraps a plain tar file into an `.ab` archive.
pub fn tar_to_ab(tar: &Path, ab: &Path, options: &WriteOptions, password: Option<&Password>) -> Result<u64> {
    let mut input = BufReader::new(File::open(tar)?);
    let copied = write_atomically(ab, |file| {
        let mut writer = wrap(BufWriter::new(file), options, password)?;
        let copied = io::copy(&mut input, &mut writer)?;
        writer.finish()?.flush()?;
        Ok(copied)
    })?;
    info!("Wrapped {} tar bytes into {}", copied, ab.display());
    Ok(copied)
}

/// Unwraps an `.ab` archive into the plain tar stream it carries.
pub fn ab_to_tar(ab: &Path, tar: &Path, password: Option<&Password>) -> Result<BackupHeader> {
    let input = BufReader::new(File::open(ab)?);
    let (header, mut reader) = unwrap(input, password)?;
    let copied = write_atomically(tar, |file| {
        let mut out = BufWriter::new(file);
        let copied = io::copy(&mut reader, &mut out)?;
        out.flush()?;
        Ok(copied)
    })?;
    info!("Unwrapped {} tar bytes from {}", copied, ab.display());
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // Keeps the suite fast; the round count is read back from the header.
    const ROUNDS: u32 = 16;

    fn options(version: u32, compress: bool) -> WriteOptions {
        WriteOptions {
            version: FormatVersion::new(version).unwrap(),
            compress,
            rounds: ROUNDS,
        }
    }

    fn payload() -> Vec<u8> {
        (0..20_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect()
    }

    fn write_archive(options: &WriteOptions, password: Option<&Password>, data: &[u8]) -> Vec<u8> {
        let mut writer = wrap(Vec::new(), options, password).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    fn read_archive(archive: &[u8], password: Option<&Password>) -> Result<(BackupHeader, Vec<u8>)> {
        let (header, mut reader) = unwrap(Cursor::new(archive), password)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok((header, out))
    }

    fn rewrite_header(archive: &[u8], edit: impl FnOnce(&mut EncryptionParams)) -> Vec<u8> {
        let mut cursor = Cursor::new(archive);
        let mut header = BackupHeader::read_from(&mut cursor).unwrap();
        let payload = &archive[cursor.position() as usize..];
        edit(header.encryption.as_mut().unwrap());
        let mut out = header.to_bytes();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_round_trip_matrix() {
        let data = payload();
        let password = Password::new("correct horse");
        for version in 1..=5 {
            for compress in [false, true] {
                for pw in [None, Some(&password)] {
                    let archive = write_archive(&options(version, compress), pw, &data);
                    let (header, out) = read_archive(&archive, pw).unwrap();
                    assert_eq!(header.version.get(), version);
                    assert_eq!(header.compressed, compress);
                    assert_eq!(header.is_encrypted(), pw.is_some());
                    assert_eq!(out, data);
                }
            }
        }
    }

    #[test]
    fn test_plain_header_layout() {
        let archive = write_archive(&options(5, true), None, b"");
        assert!(archive.starts_with(b"ANDROID BACKUP\n5\n1\nnone\n"));
    }

    #[test]
    fn test_empty_password_writes_plain_archive() {
        let archive = write_archive(&options(5, false), Some(&Password::new("")), b"tar");
        assert_eq!(archive, b"ANDROID BACKUP\n5\n0\nnone\ntar");
    }

    #[test]
    fn test_encrypted_header_fields() {
        let archive = write_archive(&options(5, true), Some(&Password::new("pw")), b"x");
        let header = BackupHeader::read_from(&mut Cursor::new(&archive)).unwrap();
        let params = header.encryption.unwrap();
        assert_eq!(params.user_salt.len(), SALT_SIZE);
        assert_eq!(params.checksum_salt.len(), SALT_SIZE);
        assert_eq!(params.rounds, ROUNDS);
        assert_eq!(params.user_iv.len(), IV_SIZE);
        // 3 length bytes + 16 + 32 + 32, padded to a block.
        assert_eq!(params.key_blob.len(), 96);
    }

    #[test]
    fn test_password_required() {
        let archive = write_archive(&options(5, true), Some(&Password::new("pw")), b"x");
        assert!(matches!(read_archive(&archive, None), Err(Error::PasswordRequired)));
        assert!(matches!(
            read_archive(&archive, Some(&Password::new(""))),
            Err(Error::PasswordRequired)
        ));
    }

    #[test]
    fn test_wrong_password() {
        for version in [1, 5] {
            let archive = write_archive(&options(version, true), Some(&Password::new("right")), b"x");
            let err = read_archive(&archive, Some(&Password::new("wrong"))).unwrap_err();
            assert!(matches!(err, Error::IncorrectPassword), "v{}: {:?}", version, err);
        }
    }

    #[test]
    fn test_password_ignored_for_plain_archive() {
        let archive = write_archive(&options(3, true), None, b"data");
        let (_, out) = read_archive(&archive, Some(&Password::new("unused"))).unwrap();
        assert_eq!(out, b"data");
    }

    #[test]
    fn test_tampered_header_is_rejected() {
        let password = Password::new("pw");
        let archive = write_archive(&options(5, true), Some(&password), b"data");

        let edits: [fn(&mut EncryptionParams); 3] = [
            // Lands in the wrapped data key.
            |p| p.key_blob[20] ^= 0x01,
            |p| p.user_salt[0] ^= 0x01,
            |p| p.checksum_salt[0] ^= 0x01,
        ];
        for edit in edits {
            let bad = rewrite_header(&archive, edit);
            let err = read_archive(&bad, Some(&password)).unwrap_err();
            assert!(matches!(err, Error::IncorrectPassword), "{:?}", err);
        }
    }

    #[test]
    fn test_v1_eight_bit_fallback() {
        let password = Password::new("pässwörd");
        let mut writer = wrap_with(Vec::new(), &options(1, true), Some(&password), Pbkdf::EightBit).unwrap();
        writer.write_all(b"legacy").unwrap();
        let archive = writer.finish().unwrap();

        let (header, out) = read_archive(&archive, Some(&password)).unwrap();
        assert_eq!(header.version, FormatVersion::V1);
        assert_eq!(out, b"legacy");
    }

    #[test]
    fn test_no_fallback_after_v1() {
        let password = Password::new("pässwörd");
        let mut writer = wrap_with(Vec::new(), &options(2, true), Some(&password), Pbkdf::EightBit).unwrap();
        writer.write_all(b"legacy").unwrap();
        let archive = writer.finish().unwrap();

        let err = read_archive(&archive, Some(&password)).unwrap_err();
        assert!(matches!(err, Error::IncorrectPassword));
    }

    #[test]
    fn test_truncated_payload_fails() {
        let password = Password::new("pw");
        let archive = write_archive(&options(5, false), Some(&password), &payload());
        let cut = &archive[..archive.len() - 7];
        assert!(read_archive(cut, Some(&password)).is_err());
    }

    #[test]
    fn test_file_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let tar = dir.path().join("in.tar");
        let ab = dir.path().join("out.ab");
        let back = dir.path().join("back.tar");
        std::fs::write(&tar, payload()).unwrap();
        let password = Password::new("pw");

        let copied = tar_to_ab(&tar, &ab, &options(5, true), Some(&password)).unwrap();
        assert_eq!(copied, payload().len() as u64);
        let header = ab_to_tar(&ab, &back, Some(&password)).unwrap();
        assert!(header.is_encrypted());
        assert_eq!(std::fs::read(&back).unwrap(), payload());
    }

    #[test]
    fn test_failed_conversion_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let ab = dir.path().join("enc.ab");
        std::fs::write(&ab, write_archive(&options(5, true), Some(&Password::new("pw")), b"x")).unwrap();
        let tar = dir.path().join("out.tar");

        assert!(ab_to_tar(&ab, &tar, Some(&Password::new("nope"))).is_err());
        assert!(!tar.exists());
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
