//! Passphrase-based OpenPGP encryption and decryption
//!
//! Messages are written as:
//! - a symmetric-key encrypted session key packet (iterated+salted SHA-256
//!   S2K, AES-256, random session key)
//! - an integrity protected data packet holding, under AES-256 CFB, an
//!   optional ZLIB compressed packet around a literal data packet
//!
//! and may be ASCII-armored. Decryption also accepts the output of
//! `gpg --symmetric` with AES-256.

use crate::armor::{ArmorReader, ArmorWriter, MESSAGE_LABEL};
use crate::error::{ErrorCategory, ErrorKind, QuicryptError, Result};
use crate::packet::{
    self, BodyReader, PartialBodyWriter, TAG_COMPRESSED, TAG_LITERAL, TAG_MARKER, TAG_PKESK,
    TAG_SED, TAG_SEIPD, TAG_SKESK,
};
use crate::passphrase::{PassphraseReader, Prompt, RetryPolicy};
use crate::s2k::S2k;
use crate::seipd::{self, CfbReader, CfbWriter, KEY_LEN, MdcReader, MdcWriter, PREFIX_LEN};
use crate::sniff::{self, Format};
use aes::Aes256;
use bzip2::read::BzDecoder;
use cfb_mode::BufDecryptor;
use flate2::Compression;
use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use rand::RngCore;
use rand::rngs::OsRng;
use std::io::{self, BufRead, BufReader, Read, Write};
use tracing::debug;
use zeroize::Zeroizing;

/// AES-256.
const CIPHER_AES256: u8 = 9;

const SKESK_VERSION: u8 = 4;
const SEIPD_VERSION: u8 = 1;

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_ZIP: u8 = 1;
const COMPRESSION_ZLIB: u8 = 2;
const COMPRESSION_BZIP2: u8 = 3;

/// Literal packet file name meaning "for your eyes only"; the real name
/// is never stored.
const LITERAL_FILE_NAME: &[u8] = b"_CONSOLE";

/// Upper bound on the size of a session key packet we are willing to buffer.
const MAX_SKESK_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncryptOptions {
    /// Add a ZLIB compression layer inside the encryption.
    pub compress: bool,
    /// ASCII-armor the output.
    pub armor: bool,
}

type Source<'a> = Box<dyn BufRead + 'a>;
type Plaintext<'a> = MdcReader<CfbReader<BodyReader<Source<'a>>>>;

/// Encrypt everything read from `plaintext` under `passphrase`, writing the
/// message to `out`.
pub fn encrypt<W: Write>(
    plaintext: &mut dyn Read,
    passphrase: &[u8],
    options: EncryptOptions,
    out: W,
) -> Result<W> {
    let mut session_key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut *session_key);

    let mut prefix = [0u8; PREFIX_LEN];
    OsRng.fill_bytes(&mut prefix[..seipd::BLOCK_LEN]);
    prefix[16] = prefix[14];
    prefix[17] = prefix[15];

    encrypt_deterministic(
        plaintext,
        passphrase,
        options,
        out,
        &S2k::new_iterated(),
        &session_key,
        &prefix,
    )
}

/// Encrypt with caller-provided S2K, session key and random prefix.
///
/// This function is ONLY for testing purposes to generate deterministic output.
/// NEVER use this in production - always use `encrypt()` which generates
/// fresh randomness.
pub fn encrypt_deterministic<W: Write>(
    plaintext: &mut dyn Read,
    passphrase: &[u8],
    options: EncryptOptions,
    out: W,
    s2k: &S2k,
    session_key: &[u8; KEY_LEN],
    prefix: &[u8; PREFIX_LEN],
) -> Result<W> {
    debug!(
        compress = options.compress,
        armor = options.armor,
        "encrypting message"
    );
    if options.armor {
        let armored = ArmorWriter::new(out, MESSAGE_LABEL).map_err(write_error)?;
        let armored = write_message(
            plaintext,
            passphrase,
            options.compress,
            armored,
            s2k,
            session_key,
            prefix,
        )?;
        armored.finish().map_err(write_error)
    } else {
        write_message(
            plaintext,
            passphrase,
            options.compress,
            out,
            s2k,
            session_key,
            prefix,
        )
    }
}

/// Convenience wrapper returning the message as a byte vector.
pub fn encrypt_to_vec(
    plaintext: &[u8],
    passphrase: &[u8],
    options: EncryptOptions,
) -> Result<Vec<u8>> {
    encrypt(&mut &plaintext[..], passphrase, options, Vec::new())
}

fn write_message<W: Write>(
    plaintext: &mut dyn Read,
    passphrase: &[u8],
    compress: bool,
    mut out: W,
    s2k: &S2k,
    session_key: &[u8; KEY_LEN],
    prefix: &[u8; PREFIX_LEN],
) -> Result<W> {
    write_skesk(&mut out, passphrase, s2k, Some(session_key))?;

    let mut data = PartialBodyWriter::new(out, TAG_SEIPD).map_err(write_error)?;
    data.write_all(&[SEIPD_VERSION]).map_err(write_error)?;
    let cfb = CfbWriter::new(data, seipd::encryptor(session_key)?);
    let mdc = MdcWriter::new(cfb, prefix).map_err(write_error)?;

    let mdc = if compress {
        let mut compressed = PartialBodyWriter::new(mdc, TAG_COMPRESSED).map_err(write_error)?;
        compressed.write_all(&[COMPRESSION_ZLIB]).map_err(write_error)?;
        let zlib = ZlibEncoder::new(compressed, Compression::best());
        let zlib = write_literal(zlib, plaintext)?;
        zlib.finish()
            .and_then(PartialBodyWriter::finish)
            .map_err(write_error)?
    } else {
        write_literal(mdc, plaintext)?
    };

    let data = mdc.finish().map_err(write_error)?.into_inner();
    data.finish().map_err(write_error)
}

/// Write a session key packet. With `session_key`, it is encrypted under
/// the S2K key; without, the S2K key itself is the session key.
fn write_skesk<W: Write>(
    out: &mut W,
    passphrase: &[u8],
    s2k: &S2k,
    session_key: Option<&[u8; KEY_LEN]>,
) -> Result<()> {
    let mut body = vec![SKESK_VERSION, CIPHER_AES256];
    s2k.serialize(&mut body);

    if let Some(session_key) = session_key {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        s2k.derive_key(passphrase, &mut *key);
        let mut encrypted = Zeroizing::new(Vec::with_capacity(1 + KEY_LEN));
        encrypted.push(CIPHER_AES256);
        encrypted.extend_from_slice(session_key);
        seipd::encryptor(&*key)?.encrypt(&mut encrypted);
        body.extend_from_slice(&encrypted);
    }

    packet::write_packet(out, TAG_SKESK, &body).map_err(write_error)
}

fn write_literal<W: Write>(out: W, plaintext: &mut dyn Read) -> Result<W> {
    let mut literal = PartialBodyWriter::new(out, TAG_LITERAL).map_err(write_error)?;
    let mut header = vec![b'b', LITERAL_FILE_NAME.len() as u8];
    header.extend_from_slice(LITERAL_FILE_NAME);
    header.extend_from_slice(&0u32.to_be_bytes());
    literal.write_all(&header).map_err(write_error)?;

    let mut buf = vec![0u8; 64 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = match plaintext.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(QuicryptError::from_io(
                    e,
                    ErrorKind::Io,
                    "failed to read plaintext",
                ));
            }
        };
        literal.write_all(&buf[..n]).map_err(write_error)?;
        total += n as u64;
    }
    debug!(bytes = total, "plaintext encrypted");
    literal.finish().map_err(write_error)
}

fn write_error(e: io::Error) -> QuicryptError {
    QuicryptError::from_io(e, ErrorKind::Io, "failed to write encrypted output")
}

/// A parsed symmetric-key encrypted session key packet.
struct SessionKeyPacket {
    s2k: S2k,
    encrypted_key: Vec<u8>,
}

impl SessionKeyPacket {
    fn parse(body: &[u8]) -> Result<Self> {
        match body {
            [SKESK_VERSION, CIPHER_AES256, rest @ ..] => {
                let (s2k, used) = S2k::parse(rest)?;
                Ok(Self {
                    s2k,
                    encrypted_key: rest[used..].to_vec(),
                })
            }
            [SKESK_VERSION, cipher, ..] => Err(QuicryptError::format(format!(
                "unsupported cipher algorithm {} (only AES-256 is supported)",
                cipher
            ))),
            [version, ..] => Err(QuicryptError::format(format!(
                "unsupported session key packet version {}",
                version
            ))),
            [] => Err(QuicryptError::format("empty session key packet")),
        }
    }

    /// Derive the session key for `passphrase`, or fail with
    /// `AuthenticationFailed` if it evidently is the wrong one.
    fn session_key(&self, passphrase: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        self.s2k.derive_key(passphrase, &mut *key);
        if self.encrypted_key.is_empty() {
            return Ok(key);
        }

        let mut decrypted = Zeroizing::new(self.encrypted_key.clone());
        seipd::decryptor(&*key)?.decrypt(&mut decrypted);
        match decrypted.split_first() {
            Some((&CIPHER_AES256, session_key)) if session_key.len() == KEY_LEN => {
                key.copy_from_slice(session_key);
                Ok(key)
            }
            _ => Err(wrong_passphrase()),
        }
    }
}

fn wrong_passphrase() -> QuicryptError {
    QuicryptError::new(
        ErrorCategory::User,
        ErrorKind::AuthenticationFailed,
        "incorrect passphrase",
    )
}

/// Try a passphrase against the session key packets and the encrypted
/// prefix. On success returns the cipher positioned after the prefix,
/// together with the decrypted prefix.
fn unlock(
    packets: &[SessionKeyPacket],
    passphrase: &[u8],
    encrypted_prefix: &[u8; PREFIX_LEN],
) -> Result<(BufDecryptor<Aes256>, [u8; PREFIX_LEN])> {
    for packet in packets {
        let session_key = match packet.session_key(passphrase) {
            Ok(key) => key,
            Err(e) if e.kind == ErrorKind::AuthenticationFailed => continue,
            Err(e) => return Err(e),
        };
        let mut cipher = seipd::decryptor(&*session_key)?;
        let mut prefix = *encrypted_prefix;
        cipher.decrypt(&mut prefix);
        if seipd::quick_check(&prefix) {
            return Ok((cipher, prefix));
        }
    }
    Err(wrong_passphrase())
}

/// Decompression layer between the integrity protected stream and the
/// literal packet.
enum Payload<'a> {
    Stored(Plaintext<'a>),
    Zip(DeflateDecoder<BodyReader<Plaintext<'a>>>),
    Zlib(ZlibDecoder<BodyReader<Plaintext<'a>>>),
    Bzip2(BzDecoder<BodyReader<Plaintext<'a>>>),
}

impl Payload<'_> {
    /// Read whatever remains so that the MDC is reached and checked.
    fn finish(self) -> io::Result<()> {
        fn drain<R: Read>(mut body: BodyReader<R>) -> io::Result<R> {
            io::copy(&mut body, &mut io::sink())?;
            Ok(body.into_inner())
        }

        let mut plaintext = match self {
            Payload::Stored(plaintext) => plaintext,
            Payload::Zip(decoder) => drain(decoder.into_inner())?,
            Payload::Zlib(decoder) => drain(decoder.into_inner())?,
            Payload::Bzip2(decoder) => drain(decoder.into_inner())?,
        };
        io::copy(&mut plaintext, &mut io::sink())?;
        Ok(())
    }
}

impl Read for Payload<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Payload::Stored(r) => r.read(buf),
            Payload::Zip(r) => r.read(buf),
            Payload::Zlib(r) => r.read(buf),
            Payload::Bzip2(r) => r.read(buf),
        }
    }
}

/// The decrypted body of a message.
///
/// Reading to the end verifies the modification detection code; a mismatch
/// surfaces as an `io::Error` wrapping an `AuthenticationFailed`
/// [`QuicryptError`] (see [`QuicryptError::from_io`]).
pub struct DecryptedReader<'a> {
    literal: Option<BodyReader<Payload<'a>>>,
}

impl Read for DecryptedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(literal) = self.literal.as_mut() else {
            return Ok(0);
        };
        if buf.is_empty() {
            return Ok(0);
        }
        let n = literal.read(buf)?;
        if n == 0 {
            if let Some(literal) = self.literal.take() {
                literal.into_inner().finish()?;
            }
        }
        Ok(n)
    }
}

/// Decrypt a message read from `source`.
///
/// Passphrases are requested from `passphrase_reader` until one unlocks the
/// message or `retry` runs out. The returned reader streams the plaintext.
pub fn decrypt<'a, R: BufRead + 'a>(
    mut source: R,
    passphrase_reader: &mut dyn PassphraseReader,
    retry: RetryPolicy,
) -> Result<DecryptedReader<'a>> {
    let mut head = Vec::with_capacity(sniff::PREFIX_LEN);
    (&mut source)
        .take(sniff::PREFIX_LEN as u64)
        .read_to_end(&mut head)
        .map_err(|e| QuicryptError::from_io(e, ErrorKind::Io, "failed to read encrypted input"))?;
    let format = sniff::classify(&head)?;
    debug!(?format, max_attempts = ?retry.max_attempts(), "decrypting message");
    let source = io::Cursor::new(head).chain(source);

    let mut source: Source<'a> = match format {
        Format::Armored => {
            let armored = ArmorReader::new(source)?;
            if armored.label() != MESSAGE_LABEL {
                return Err(QuicryptError::format(format!(
                    "armored block is a {}, not an encrypted message",
                    armored.label()
                )));
            }
            debug!("removing ASCII armor");
            Box::new(BufReader::new(armored))
        }
        Format::RawEncrypted => Box::new(source),
        Format::Plain => {
            return Err(QuicryptError::format("input is not an encrypted message"));
        }
    };

    let mut session_keys = Vec::new();
    let seipd_length = loop {
        let header = packet::read_header(&mut source)?
            .ok_or_else(|| QuicryptError::format("message contains no encrypted data"))?;
        match header.tag {
            TAG_SKESK => {
                let body = BodyReader::new(&mut source, header.length).read_all(MAX_SKESK_LEN)?;
                session_keys.push(SessionKeyPacket::parse(&body)?);
            }
            TAG_MARKER => {
                BodyReader::new(&mut source, header.length).read_all(MAX_SKESK_LEN)?;
            }
            TAG_SEIPD => break header.length,
            TAG_SED => {
                return Err(QuicryptError::format(
                    "encrypted data without integrity protection is not supported",
                ));
            }
            TAG_PKESK => {
                return Err(QuicryptError::format(
                    "public-key encrypted messages are not supported",
                ));
            }
            tag => {
                return Err(QuicryptError::format(format!(
                    "unexpected packet (tag {}) in encrypted message",
                    tag
                )));
            }
        }
    };
    if session_keys.is_empty() {
        return Err(QuicryptError::format("message is not passphrase encrypted"));
    }

    let mut body = BodyReader::new(source, seipd_length);
    let mut version = [0u8; 1];
    let mut encrypted_prefix = [0u8; PREFIX_LEN];
    body.read_exact(&mut version)
        .and_then(|()| body.read_exact(&mut encrypted_prefix))
        .map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                QuicryptError::format("encrypted data packet truncated")
            } else {
                QuicryptError::from_io(e, ErrorKind::Io, "failed to read encrypted data")
            }
        })?;
    if version[0] != SEIPD_VERSION {
        return Err(QuicryptError::format(format!(
            "unsupported encrypted data packet version {}",
            version[0]
        )));
    }

    let mut attempt = 1u32;
    let (cipher, prefix) = loop {
        let passphrase = passphrase_reader.read_passphrase(Prompt::Decrypt { attempt })?;
        match unlock(&session_keys, &passphrase, &encrypted_prefix) {
            Ok(unlocked) => break unlocked,
            Err(e) if e.kind == ErrorKind::AuthenticationFailed && retry.allows(attempt + 1) => {
                debug!(attempt, "passphrase rejected, asking again");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    };
    debug!(attempt, "passphrase accepted");

    let mut plaintext = MdcReader::new(CfbReader::new(body, cipher), &prefix);
    let header = packet::read_header(&mut plaintext)?
        .ok_or_else(|| QuicryptError::format("encrypted data is empty"))?;

    let (payload, header) = if header.tag == TAG_COMPRESSED {
        let mut compressed = BodyReader::new(plaintext, header.length);
        let mut algorithm = [0u8; 1];
        compressed.read_exact(&mut algorithm).map_err(|e| {
            QuicryptError::from_io(e, ErrorKind::Format, "compressed packet truncated")
        })?;
        let mut payload = match algorithm[0] {
            COMPRESSION_NONE => {
                return Err(QuicryptError::format(
                    "stored compressed packets are not supported",
                ));
            }
            COMPRESSION_ZIP => Payload::Zip(DeflateDecoder::new(compressed)),
            COMPRESSION_ZLIB => Payload::Zlib(ZlibDecoder::new(compressed)),
            COMPRESSION_BZIP2 => Payload::Bzip2(BzDecoder::new(compressed)),
            other => {
                return Err(QuicryptError::format(format!(
                    "unsupported compression algorithm {}",
                    other
                )));
            }
        };
        debug!(algorithm = algorithm[0], "decompressing message");
        let header = packet::read_header(&mut payload)?
            .ok_or_else(|| QuicryptError::format("compressed packet is empty"))?;
        (payload, header)
    } else {
        (Payload::Stored(plaintext), header)
    };

    if header.tag != TAG_LITERAL {
        return Err(QuicryptError::format(format!(
            "expected literal data, found packet tag {}",
            header.tag
        )));
    }

    let mut literal = BodyReader::new(payload, header.length);
    let mut fields = [0u8; 2];
    read_literal_field(&mut literal, &mut fields)?;
    let mut name = vec![0u8; usize::from(fields[1])];
    read_literal_field(&mut literal, &mut name)?;
    let mut date = [0u8; 4];
    read_literal_field(&mut literal, &mut date)?;

    Ok(DecryptedReader {
        literal: Some(literal),
    })
}

fn read_literal_field<R: Read>(literal: &mut R, buf: &mut [u8]) -> Result<()> {
    literal.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            QuicryptError::format("literal data packet truncated")
        } else {
            QuicryptError::from_io(e, ErrorKind::Io, "failed to read literal data packet")
        }
    })
}

/// Convenience wrapper reading the whole plaintext into memory.
pub fn decrypt_to_vec(
    message: &[u8],
    passphrase_reader: &mut dyn PassphraseReader,
    retry: RetryPolicy,
) -> Result<Vec<u8>> {
    let mut reader = decrypt(message, passphrase_reader, retry)?;
    let mut plaintext = Vec::new();
    reader
        .read_to_end(&mut plaintext)
        .map_err(|e| QuicryptError::from_io(e, ErrorKind::Io, "failed to read decrypted data"))?;
    Ok(plaintext)
}
