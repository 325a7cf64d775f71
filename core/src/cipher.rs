//! Streaming AES-256/CBC/PKCS#5 over `std::io` readers and writers.
//!
//! The block-level primitives come from `aes`/`cbc`; this module only adds the
//! buffering needed to apply them to an unbounded byte stream.

use crate::{Error, Result};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use std::io::{self, Read, Write};
use zeroize::Zeroize;

pub const BLOCK_SIZE: usize = 16;
pub const IV_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const CHUNK_SIZE: usize = 8 * 1024;

/// One-shot encryption, used for the key blob.
pub fn encrypt_padded(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// One-shot decryption. A padding failure is reported as `None`; whether that
/// means a wrong password is for the caller to decide.
pub fn decrypt_padded(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Option<Vec<u8>>> {
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    Ok(cipher.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).ok())
}

/// Encrypts everything written to it. `finish` must be called to emit the
/// final padded block.
pub struct CipherWriter<W: Write> {
    inner: W,
    cipher: Aes256CbcEnc,
    pending: Vec<u8>,
}

impl<W: Write> CipherWriter<W> {
    pub fn new(inner: W, key: &[u8], iv: &[u8]) -> Result<Self> {
        let cipher = Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(Self {
            inner,
            cipher,
            pending: Vec::with_capacity(CHUNK_SIZE + BLOCK_SIZE),
        })
    }

    fn flush_blocks(&mut self) -> io::Result<()> {
        let whole = self.pending.len() - self.pending.len() % BLOCK_SIZE;
        if whole == 0 {
            return Ok(());
        }
        for block in self.pending[..whole].chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.inner.write_all(&self.pending[..whole])?;
        self.pending.drain(..whole);
        Ok(())
    }

    /// Pads and writes the last block, returning the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.flush_blocks()?;
        let pad = BLOCK_SIZE - self.pending.len();
        self.pending.resize(BLOCK_SIZE, pad as u8);
        self.cipher
            .encrypt_block_mut(GenericArray::from_mut_slice(&mut self.pending));
        self.inner.write_all(&self.pending)?;
        self.pending.zeroize();
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if self.pending.len() >= CHUNK_SIZE {
            self.flush_blocks()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_blocks()?;
        self.inner.flush()
    }
}

/// Decrypts a CBC stream, holding back the last block until end of input so
/// the padding can be checked and removed.
pub struct CipherReader<R: Read> {
    inner: R,
    cipher: Aes256CbcDec,
    /// Ciphertext not yet forming a whole block.
    raw: Vec<u8>,
    /// Decrypted bytes ready to hand out, `out[pos..]`.
    out: Vec<u8>,
    pos: usize,
    /// Last decrypted block, withheld until we know it is the final one.
    held: Option<[u8; BLOCK_SIZE]>,
    done: bool,
}

impl<R: Read> CipherReader<R> {
    pub fn new(inner: R, key: &[u8], iv: &[u8]) -> Result<Self> {
        let cipher = Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(Self {
            inner,
            cipher,
            raw: Vec::with_capacity(CHUNK_SIZE + BLOCK_SIZE),
            out: Vec::with_capacity(CHUNK_SIZE + BLOCK_SIZE),
            pos: 0,
            held: None,
            done: false,
        })
    }

    fn wipe(&mut self) {
        self.raw.zeroize();
        self.out.zeroize();
        if let Some(block) = self.held.as_mut() {
            block.zeroize();
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        self.out.zeroize();
        self.out.clear();
        self.pos = 0;

        while self.out.is_empty() && !self.done {
            let mut chunk = [0u8; CHUNK_SIZE];
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                self.done = true;
                return self.finish_stream();
            }
            self.raw.extend_from_slice(&chunk[..n]);

            let whole = self.raw.len() - self.raw.len() % BLOCK_SIZE;
            for block in self.raw[..whole].chunks_exact(BLOCK_SIZE) {
                let mut plain = [0u8; BLOCK_SIZE];
                plain.copy_from_slice(block);
                self.cipher
                    .decrypt_block_mut(GenericArray::from_mut_slice(&mut plain));
                if let Some(prev) = self.held.replace(plain) {
                    self.out.extend_from_slice(&prev);
                }
            }
            self.raw.drain(..whole);
        }
        Ok(())
    }

    fn finish_stream(&mut self) -> io::Result<()> {
        if !self.raw.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "encrypted stream is not a whole number of blocks",
            ));
        }
        let last = self.held.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "encrypted stream is empty")
        })?;
        let pad = last[BLOCK_SIZE - 1] as usize;
        if pad == 0 || pad > BLOCK_SIZE || last[BLOCK_SIZE - pad..].iter().any(|&b| b as usize != pad) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad PKCS#5 padding"));
        }
        self.out.extend_from_slice(&last[..BLOCK_SIZE - pad]);
        Ok(())
    }
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.out.len() {
            if self.done {
                return Ok(0);
            }
            self.fill()?;
        }
        let n = buf.len().min(self.out.len() - self.pos);
        buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl<R: Read> Drop for CipherReader<R> {
    fn drop(&mut self) {
        self.wipe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];
    const IV: [u8; 16] = [9u8; 16];

    fn encrypt_stream(data: &[u8], write_size: usize) -> Vec<u8> {
        let mut writer = CipherWriter::new(Vec::new(), &KEY, &IV).unwrap();
        for piece in data.chunks(write_size.max(1)) {
            writer.write_all(piece).unwrap();
        }
        writer.finish().unwrap()
    }

    fn decrypt_stream(data: &[u8]) -> io::Result<Vec<u8>> {
        let mut reader = CipherReader::new(data, &KEY, &IV).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_stream_matches_one_shot() {
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let streamed = encrypt_stream(&data, 777);
        let one_shot = encrypt_padded(&KEY, &IV, &data).unwrap();
        assert_eq!(streamed, one_shot);
        assert_eq!(decrypt_stream(&streamed).unwrap(), data);
    }

    #[test]
    fn test_block_aligned_input_gets_full_pad_block() {
        let data = [0x42u8; 32];
        let encrypted = encrypt_stream(&data, 32);
        assert_eq!(encrypted.len(), 48);
        assert_eq!(decrypt_stream(&encrypted).unwrap(), data);
    }

    #[test]
    fn test_empty_input() {
        let encrypted = encrypt_stream(&[], 1);
        assert_eq!(encrypted.len(), BLOCK_SIZE);
        assert!(decrypt_stream(&encrypted).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let encrypted = encrypt_stream(b"some payload that spans blocks", 5);
        let err = decrypt_stream(&encrypted[..encrypted.len() - 3]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_one_shot_wrong_key_fails_padding_or_differs() {
        let encrypted = encrypt_padded(&KEY, &IV, b"key blob").unwrap();
        let other = [8u8; 32];
        match decrypt_padded(&other, &IV, &encrypted).unwrap() {
            None => {}
            Some(plain) => assert_ne!(plain, b"key blob"),
        }
    }
}
