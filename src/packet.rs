//! OpenPGP packet framing (RFC 4880 section 4)
//!
//! Only framing lives here: header parsing for both header formats, a reader
//! that follows a body across partial-length chunks, and a writer that emits
//! a body of unknown length as partial chunks.

use crate::error::{ErrorKind, QuicryptError, Result};
use std::io::{self, Read, Write};

pub const TAG_PKESK: u8 = 1;
pub const TAG_SKESK: u8 = 3;
pub const TAG_COMPRESSED: u8 = 8;
pub const TAG_SED: u8 = 9;
pub const TAG_MARKER: u8 = 10;
pub const TAG_LITERAL: u8 = 11;
pub const TAG_SEIPD: u8 = 18;
pub const TAG_MDC: u8 = 19;

/// Partial chunks are 2^13 bytes. The first chunk of a body must be at
/// least 512 bytes.
const PARTIAL_CHUNK_POWER: u8 = 13;
const PARTIAL_CHUNK: usize = 1 << PARTIAL_CHUNK_POWER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Fixed(u64),
    /// A chunk of this size, followed by another length.
    Partial(u64),
    /// Old-format only: the body runs to the end of the stream.
    Indeterminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub tag: u8,
    pub length: BodyLength,
}

fn read_byte<R: Read + ?Sized>(r: &mut R) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match r.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn read_exact<R: Read + ?Sized>(r: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            QuicryptError::format(format!("input truncated while reading {}", what))
        } else {
            QuicryptError::from_io(e, ErrorKind::Io, format!("failed to read {}", what))
        }
    })
}

fn required_byte<R: Read + ?Sized>(r: &mut R, what: &str) -> Result<u8> {
    let mut byte = [0u8; 1];
    read_exact(r, &mut byte, what)?;
    Ok(byte[0])
}

/// Read a packet header. `None` means the stream ended cleanly before one.
pub fn read_header<R: Read + ?Sized>(r: &mut R) -> Result<Option<PacketHeader>> {
    let first = match read_byte(r) {
        Ok(Some(b)) => b,
        Ok(None) => return Ok(None),
        Err(e) => {
            return Err(QuicryptError::from_io(
                e,
                ErrorKind::Io,
                "failed to read packet header",
            ));
        }
    };

    if first & 0x80 == 0 {
        return Err(QuicryptError::format(format!(
            "invalid packet header byte 0x{:02x}",
            first
        )));
    }

    if first & 0x40 != 0 {
        let tag = first & 0x3f;
        let length = read_new_length(r)?;
        return Ok(Some(PacketHeader { tag, length }));
    }

    let tag = (first >> 2) & 0x0f;
    let length = match first & 0x03 {
        0 => BodyLength::Fixed(u64::from(required_byte(r, "packet length")?)),
        1 => {
            let mut len = [0u8; 2];
            read_exact(r, &mut len, "packet length")?;
            BodyLength::Fixed(u64::from(u16::from_be_bytes(len)))
        }
        2 => {
            let mut len = [0u8; 4];
            read_exact(r, &mut len, "packet length")?;
            BodyLength::Fixed(u64::from(u32::from_be_bytes(len)))
        }
        _ => BodyLength::Indeterminate,
    };
    Ok(Some(PacketHeader { tag, length }))
}

/// Read a new-format body length.
pub fn read_new_length<R: Read + ?Sized>(r: &mut R) -> Result<BodyLength> {
    let first = required_byte(r, "packet length")?;
    let length = match first {
        0..=191 => BodyLength::Fixed(u64::from(first)),
        192..=223 => {
            let second = required_byte(r, "packet length")?;
            BodyLength::Fixed(((u64::from(first) - 192) << 8) + u64::from(second) + 192)
        }
        255 => {
            let mut len = [0u8; 4];
            read_exact(r, &mut len, "packet length")?;
            BodyLength::Fixed(u64::from(u32::from_be_bytes(len)))
        }
        _ => BodyLength::Partial(1u64 << (first & 0x1f)),
    };
    Ok(length)
}

/// Write a definite new-format body length.
pub fn write_length<W: Write + ?Sized>(w: &mut W, len: usize) -> io::Result<()> {
    if len < 192 {
        w.write_all(&[len as u8])
    } else if len < 8384 {
        let len = len - 192;
        w.write_all(&[((len >> 8) as u8) + 192, len as u8])
    } else {
        let len = u32::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "packet body too long"))?;
        w.write_all(&[0xff])?;
        w.write_all(&len.to_be_bytes())
    }
}

/// Write a complete packet with a new-format header.
pub fn write_packet<W: Write + ?Sized>(w: &mut W, tag: u8, body: &[u8]) -> io::Result<()> {
    w.write_all(&[0xc0 | tag])?;
    write_length(w, body.len())?;
    w.write_all(body)
}

/// Reads exactly one packet body, following partial-length chunks.
pub struct BodyReader<R> {
    inner: R,
    remaining: u64,
    partial: bool,
    indeterminate: bool,
}

impl<R: Read> BodyReader<R> {
    pub fn new(inner: R, length: BodyLength) -> Self {
        let (remaining, partial, indeterminate) = match length {
            BodyLength::Fixed(n) => (n, false, false),
            BodyLength::Partial(n) => (n, true, false),
            BodyLength::Indeterminate => (0, false, true),
        };
        Self {
            inner,
            remaining,
            partial,
            indeterminate,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the whole body into memory. Only for packets known to be small.
    pub fn read_all(mut self, limit: usize) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let read = (&mut self)
            .take(limit as u64 + 1)
            .read_to_end(&mut body)
            .map_err(|e| QuicryptError::from_io(e, ErrorKind::Io, "failed to read packet"))?;
        if read > limit {
            return Err(QuicryptError::format("packet unexpectedly large"));
        }
        Ok(body)
    }
}

impl<R: Read> Read for BodyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.indeterminate {
            return self.inner.read(buf);
        }
        while self.remaining == 0 {
            if !self.partial {
                return Ok(0);
            }
            match read_new_length(&mut self.inner).map_err(QuicryptError::into_io)? {
                BodyLength::Fixed(n) => {
                    self.remaining = n;
                    self.partial = false;
                }
                BodyLength::Partial(n) => self.remaining = n,
                BodyLength::Indeterminate => {
                    self.indeterminate = true;
                    return self.inner.read(buf);
                }
            }
        }

        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(QuicryptError::format("packet body truncated").into_io());
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Writes a packet whose length is not known up front, as partial chunks.
///
/// [`finish`](Self::finish) must be called to write the final chunk; dropping
/// the writer leaves the packet incomplete.
pub struct PartialBodyWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: Write> PartialBodyWriter<W> {
    pub fn new(mut inner: W, tag: u8) -> io::Result<Self> {
        inner.write_all(&[0xc0 | tag])?;
        Ok(Self {
            inner,
            buf: Vec::with_capacity(PARTIAL_CHUNK),
        })
    }

    /// Write the final (definite length) chunk and return the inner writer.
    pub fn finish(self) -> io::Result<W> {
        let Self { mut inner, buf } = self;
        write_length(&mut inner, buf.len())?;
        inner.write_all(&buf)?;
        Ok(inner)
    }
}

impl<W: Write> Write for PartialBodyWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = data.len().min(PARTIAL_CHUNK - self.buf.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() == PARTIAL_CHUNK {
            self.inner.write_all(&[0xe0 | PARTIAL_CHUNK_POWER])?;
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
