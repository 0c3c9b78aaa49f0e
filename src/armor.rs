//! OpenPGP ASCII armor (RFC 4880 section 6)
//!
//! The armored format is:
//! - a `-----BEGIN <LABEL>-----` line, optional `Key: Value` headers and a
//!   blank line
//! - standard base64, 64 characters per line
//! - an optional `=XXXX` line holding the base64 CRC-24 of the decoded data
//! - a `-----END <LABEL>-----` line

use crate::error::{ErrorCategory, ErrorKind, QuicryptError, Result};
use base64::{Engine, engine::general_purpose::STANDARD};
use std::io::{self, BufRead, Read, Write};

/// Label used for encrypted messages.
pub const MESSAGE_LABEL: &str = "PGP MESSAGE";

/// Raw bytes per armored line (64 base64 characters).
const LINE_BYTES: usize = 48;

const CRC24_INIT: u32 = 0x00b7_04ce;
const CRC24_POLY: u32 = 0x0186_4cfb;

#[derive(Debug, Clone, Copy)]
pub struct Crc24(u32);

impl Crc24 {
    pub fn new() -> Self {
        Self(CRC24_INIT)
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.0 ^= u32::from(byte) << 16;
            for _ in 0..8 {
                self.0 <<= 1;
                if self.0 & 0x0100_0000 != 0 {
                    self.0 ^= CRC24_POLY;
                }
            }
        }
    }

    pub fn finish(&self) -> u32 {
        self.0 & 0x00ff_ffff
    }
}

impl Default for Crc24 {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ArmorWriter<W: Write> {
    inner: W,
    label: &'static str,
    pending: Vec<u8>,
    crc: Crc24,
}

impl<W: Write> ArmorWriter<W> {
    pub fn new(mut inner: W, label: &'static str) -> io::Result<Self> {
        write!(inner, "-----BEGIN {}-----\n\n", label)?;
        Ok(Self {
            inner,
            label,
            pending: Vec::with_capacity(LINE_BYTES * 2),
            crc: Crc24::new(),
        })
    }

    /// Write the last line, checksum and footer, returning the inner writer.
    pub fn finish(self) -> io::Result<W> {
        let Self {
            mut inner,
            label,
            pending,
            crc,
        } = self;
        if !pending.is_empty() {
            writeln!(inner, "{}", STANDARD.encode(&pending))?;
        }
        let checksum = crc.finish().to_be_bytes();
        writeln!(inner, "={}", STANDARD.encode(&checksum[1..]))?;
        writeln!(inner, "-----END {}-----", label)?;
        Ok(inner)
    }
}

impl<W: Write> Write for ArmorWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.crc.update(data);
        self.pending.extend_from_slice(data);
        let mut lines = self.pending.chunks_exact(LINE_BYTES);
        for line in &mut lines {
            writeln!(self.inner, "{}", STANDARD.encode(line))?;
        }
        let consumed = self.pending.len() - lines.remainder().len();
        self.pending.drain(..consumed);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decodes an armored block one line at a time.
pub struct ArmorReader<R: BufRead> {
    inner: R,
    label: String,
    decoded: Vec<u8>,
    pos: usize,
    carry: String,
    crc: Crc24,
    checksum: Option<u32>,
    finished: bool,
}

impl<R: BufRead> ArmorReader<R> {
    /// Consume the header line and any armor headers.
    pub fn new(mut inner: R) -> Result<Self> {
        let first = read_line(&mut inner)?
            .ok_or_else(|| QuicryptError::format("empty armored input"))?;
        let label = first
            .strip_prefix("-----BEGIN ")
            .and_then(|rest| rest.strip_suffix("-----"))
            .ok_or_else(|| QuicryptError::format("missing armor header line"))?
            .to_string();

        let mut reader = Self {
            inner,
            label,
            decoded: Vec::new(),
            pos: 0,
            carry: String::new(),
            crc: Crc24::new(),
            checksum: None,
            finished: false,
        };

        // Armor headers end at a blank line. Tolerate writers that omit both.
        loop {
            let line = read_line(&mut reader.inner)?
                .ok_or_else(|| QuicryptError::format("armored input ended in headers"))?;
            if line.is_empty() {
                break;
            }
            if !line.contains(':') {
                reader.body_line(&line)?;
                break;
            }
        }
        Ok(reader)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn body_line(&mut self, line: &str) -> Result<()> {
        if line.starts_with("-----END ") {
            return self.end();
        }
        if let Some(checksum) = line.strip_prefix('=') {
            let bytes = STANDARD.decode(checksum).map_err(|e| {
                QuicryptError::with_source(
                    ErrorCategory::User,
                    ErrorKind::Format,
                    "invalid armor checksum line",
                    e,
                )
            })?;
            let bytes: [u8; 3] = bytes
                .try_into()
                .map_err(|_| QuicryptError::format("armor checksum is not 24 bits"))?;
            self.checksum = Some(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]));
            return Ok(());
        }

        self.carry.push_str(line);
        let usable = self.carry.len() - self.carry.len() % 4;
        let start = self.decoded.len();
        STANDARD
            .decode_vec(&self.carry[..usable], &mut self.decoded)
            .map_err(|e| {
                QuicryptError::with_source(
                    ErrorCategory::User,
                    ErrorKind::Format,
                    "invalid base64 in armored input",
                    e,
                )
            })?;
        self.crc.update(&self.decoded[start..]);
        self.carry.drain(..usable);
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if !self.carry.is_empty() {
            return Err(QuicryptError::format("armored input ends mid base64 group"));
        }
        if let Some(expected) = self.checksum {
            if expected != self.crc.finish() {
                return Err(QuicryptError::format("armor checksum mismatch"));
            }
        }
        self.finished = true;
        Ok(())
    }
}

impl<R: BufRead> Read for ArmorReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.decoded.len() {
            if self.finished {
                return Ok(0);
            }
            self.decoded.clear();
            self.pos = 0;
            let line = read_line(&mut self.inner)
                .and_then(|line| {
                    line.ok_or_else(|| QuicryptError::format("armored input missing footer line"))
                })
                .map_err(QuicryptError::into_io)?;
            self.body_line(&line).map_err(QuicryptError::into_io)?;
        }
        let n = buf.len().min(self.decoded.len() - self.pos);
        buf[..n].copy_from_slice(&self.decoded[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Next line with surrounding whitespace removed; `None` at end of input.
fn read_line<R: BufRead>(r: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    let n = r.read_line(&mut line).map_err(|e| {
        if e.kind() == io::ErrorKind::InvalidData {
            QuicryptError::with_source(
                ErrorCategory::User,
                ErrorKind::Format,
                "armored input is not valid text",
                e,
            )
        } else {
            QuicryptError::from_io(e, ErrorKind::Io, "failed to read armored input")
        }
    })?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}
