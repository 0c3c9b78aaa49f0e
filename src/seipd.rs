//! Stream layers of the integrity protected data packet
//!
//! AES-256 in OpenPGP CFB mode (zero IV, no resynchronization) and the
//! SHA-1 modification detection code that trails the plaintext.

use crate::error::{ErrorCategory, ErrorKind, QuicryptError, Result};
use crate::packet::TAG_MDC;
use aes::Aes256;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use sha1::{Digest, Sha1};
use std::io::{self, Read, Write};

pub const KEY_LEN: usize = 32;
pub const BLOCK_LEN: usize = 16;

/// Random block plus its last two bytes repeated.
pub const PREFIX_LEN: usize = BLOCK_LEN + 2;

/// MDC packet header (tag 19, length 20) followed by the SHA-1 digest.
const MDC_HEADER: [u8; 2] = [0xc0 | TAG_MDC, 20];
const MDC_LEN: usize = 22;

const ZERO_IV: [u8; BLOCK_LEN] = [0u8; BLOCK_LEN];

pub fn encryptor(key: &[u8]) -> Result<BufEncryptor<Aes256>> {
    BufEncryptor::<Aes256>::new_from_slices(key, &ZERO_IV).map_err(|_| invalid_key_length(key))
}

pub fn decryptor(key: &[u8]) -> Result<BufDecryptor<Aes256>> {
    BufDecryptor::<Aes256>::new_from_slices(key, &ZERO_IV).map_err(|_| invalid_key_length(key))
}

fn invalid_key_length(key: &[u8]) -> QuicryptError {
    QuicryptError::new(
        ErrorCategory::Internal,
        ErrorKind::InternalInvariant,
        format!("invalid AES-256 key length {}", key.len()),
    )
}

/// Whether a decrypted prefix carries the repeated quick-check bytes.
pub fn quick_check(prefix: &[u8; PREFIX_LEN]) -> bool {
    prefix[BLOCK_LEN - 2..BLOCK_LEN] == prefix[BLOCK_LEN..]
}

pub struct CfbWriter<W: Write> {
    inner: W,
    cipher: BufEncryptor<Aes256>,
    scratch: Vec<u8>,
}

impl<W: Write> CfbWriter<W> {
    pub fn new(inner: W, cipher: BufEncryptor<Aes256>) -> Self {
        Self {
            inner,
            cipher,
            scratch: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CfbWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(data);
        self.cipher.encrypt(&mut self.scratch);
        self.inner.write_all(&self.scratch)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct CfbReader<R: Read> {
    inner: R,
    cipher: BufDecryptor<Aes256>,
}

impl<R: Read> CfbReader<R> {
    pub fn new(inner: R, cipher: BufDecryptor<Aes256>) -> Self {
        Self { inner, cipher }
    }
}

impl<R: Read> Read for CfbReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.decrypt(&mut buf[..n]);
        Ok(n)
    }
}

/// Hashes everything written and appends the MDC packet on `finish`.
pub struct MdcWriter<W: Write> {
    inner: W,
    hasher: Sha1,
}

impl<W: Write> MdcWriter<W> {
    /// Writes the random prefix, which is covered by the MDC.
    pub fn new(mut inner: W, prefix: &[u8; PREFIX_LEN]) -> io::Result<Self> {
        let mut hasher = Sha1::new();
        hasher.update(prefix);
        inner.write_all(prefix)?;
        Ok(Self { inner, hasher })
    }

    pub fn finish(self) -> io::Result<W> {
        let Self { mut inner, mut hasher } = self;
        hasher.update(MDC_HEADER);
        let digest = hasher.finalize();
        inner.write_all(&MDC_HEADER)?;
        inner.write_all(&digest)?;
        Ok(inner)
    }
}

impl<W: Write> Write for MdcWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(data)?;
        self.hasher.update(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Releases decrypted data while holding back the trailing MDC packet,
/// which is checked once the inner stream ends.
pub struct MdcReader<R: Read> {
    inner: R,
    hasher: Sha1,
    pending: Vec<u8>,
    verified: bool,
}

impl<R: Read> MdcReader<R> {
    /// `prefix` is the already decrypted random prefix.
    pub fn new(inner: R, prefix: &[u8; PREFIX_LEN]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(prefix);
        Self {
            inner,
            hasher,
            pending: Vec::new(),
            verified: false,
        }
    }

    fn verify(&mut self) -> Result<()> {
        if self.pending.len() < MDC_LEN {
            return Err(QuicryptError::format(
                "encrypted data truncated before its modification detection code",
            ));
        }
        self.hasher.update(MDC_HEADER);
        let digest = std::mem::take(&mut self.hasher).finalize();
        if self.pending[..2] != MDC_HEADER || digest[..] != self.pending[2..] {
            return Err(QuicryptError::new(
                ErrorCategory::User,
                ErrorKind::AuthenticationFailed,
                "modification detected: encrypted data is corrupt or was tampered with",
            ));
        }
        self.verified = true;
        Ok(())
    }
}

impl<R: Read> Read for MdcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.verified || buf.is_empty() {
            return Ok(0);
        }
        let mut chunk = [0u8; 8192];
        loop {
            if self.pending.len() > MDC_LEN {
                let n = (self.pending.len() - MDC_LEN).min(buf.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.hasher.update(&self.pending[..n]);
                self.pending.drain(..n);
                return Ok(n);
            }
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                self.verify().map_err(QuicryptError::into_io)?;
                return Ok(0);
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [0x5a; KEY_LEN];

    fn prefix() -> [u8; PREFIX_LEN] {
        let mut prefix = [0u8; PREFIX_LEN];
        for (i, b) in prefix.iter_mut().enumerate().take(BLOCK_LEN) {
            *b = i as u8;
        }
        prefix[16] = prefix[14];
        prefix[17] = prefix[15];
        prefix
    }

    fn seal(plaintext: &[u8]) -> Vec<u8> {
        let cfb = CfbWriter::new(Vec::new(), encryptor(&KEY).unwrap());
        let mut mdc = MdcWriter::new(cfb, &prefix()).unwrap();
        mdc.write_all(plaintext).unwrap();
        mdc.finish().unwrap().into_inner()
    }

    fn open(ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut encrypted_prefix = [0u8; PREFIX_LEN];
        encrypted_prefix.copy_from_slice(&ciphertext[..PREFIX_LEN]);
        let mut cipher = decryptor(&KEY)?;
        cipher.decrypt(&mut encrypted_prefix);
        assert!(quick_check(&encrypted_prefix));

        let cfb = CfbReader::new(&ciphertext[PREFIX_LEN..], cipher);
        let mut mdc = MdcReader::new(cfb, &encrypted_prefix);
        let mut out = Vec::new();
        mdc.read_to_end(&mut out)
            .map_err(|e| QuicryptError::from_io(e, ErrorKind::Io, "read"))?;
        Ok(out)
    }

    #[test]
    fn test_seal_open() {
        for len in [0usize, 1, 15, 16, 17, 22, 23, 8192, 20_000] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let ciphertext = seal(&plaintext);
            assert_eq!(ciphertext.len(), PREFIX_LEN + len + MDC_LEN);
            assert_eq!(open(&ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext() {
        let plaintext = vec![0u8; 64];
        let ciphertext = seal(&plaintext);
        assert_ne!(&ciphertext[PREFIX_LEN..PREFIX_LEN + 64], &plaintext[..]);
    }

    #[test]
    fn test_tampered_data_detected() {
        let mut ciphertext = seal(b"attack at dawn");
        ciphertext[PREFIX_LEN + 3] ^= 0x01;
        let err = open(&ciphertext).expect_err("expected modification detection");
        assert_eq!(err.kind, ErrorKind::AuthenticationFailed);
    }

    #[test]
    fn test_tampered_digest_detected() {
        let mut ciphertext = seal(b"attack at dawn");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x80;
        let err = open(&ciphertext).expect_err("expected modification detection");
        assert_eq!(err.kind, ErrorKind::AuthenticationFailed);
    }

    #[test]
    fn test_missing_mdc() {
        let ciphertext = seal(b"attack at dawn");
        let err = open(&ciphertext[..ciphertext.len() - MDC_LEN]).expect_err("expected missing MDC");
        assert_eq!(err.kind, ErrorKind::Format);
    }

    #[test]
    fn test_wrong_key_fails_quick_check() {
        let ciphertext = seal(b"secret");
        let mut encrypted_prefix = [0u8; PREFIX_LEN];
        encrypted_prefix.copy_from_slice(&ciphertext[..PREFIX_LEN]);
        decryptor(&[0x11; KEY_LEN]).unwrap().decrypt(&mut encrypted_prefix);
        assert!(!quick_check(&encrypted_prefix));
    }
}
