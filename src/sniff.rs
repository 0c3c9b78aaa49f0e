//! Input classification by leading bytes
//!
//! Decides whether a file is already an encrypted container (and so must be
//! decrypted) or plaintext (and so must be encrypted). Both directions end by
//! deleting the input, so the byte patterns must match exactly what earlier
//! releases matched.

use crate::error::{QuicryptError, Result};

/// Number of leading bytes [`classify`] looks at.
pub const PREFIX_LEN: usize = 11;

/// Fewest bytes [`classify`] accepts; the binary pattern spans five bytes.
pub const MIN_PREFIX_LEN: usize = 5;

/// Opening of every ASCII-armored block.
const ARMOR_MARKER: &[u8; PREFIX_LEN] = b"-----BEGIN ";

/// Packet headers of a symmetric-key encrypted session key packet:
/// old-format as written by GnuPG, and new-format as written by us.
const ENCRYPTED_TAGS: [[u8; 2]; 2] = [[0x8c, 0x0d], [0xc3, 0x2e]];

/// Session key packet version 4.
const SKESK_VERSION: u8 = 0x04;

/// Iterated and salted S2K.
const S2K_ITERATED: u8 = 0x03;

/// Leading bytes of a bzip2 stream, as produced by the archiver.
pub const ARCHIVE_MAGIC: &[u8; 2] = b"BZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// ASCII-armored OpenPGP data.
    Armored,
    /// Binary OpenPGP symmetrically encrypted message.
    RawEncrypted,
    /// Anything else.
    Plain,
}

impl Format {
    pub fn is_encrypted(self) -> bool {
        matches!(self, Format::Armored | Format::RawEncrypted)
    }
}

/// Classify a stream from its first bytes (ideally [`PREFIX_LEN`] of them).
///
/// Fails rather than guessing when fewer than [`MIN_PREFIX_LEN`] bytes are
/// available.
pub fn classify(prefix: &[u8]) -> Result<Format> {
    if prefix.len() < MIN_PREFIX_LEN {
        return Err(QuicryptError::format(format!(
            "input too short to classify ({} bytes, need at least {})",
            prefix.len(),
            MIN_PREFIX_LEN
        )));
    }

    if prefix.starts_with(ARMOR_MARKER) {
        return Ok(Format::Armored);
    }

    let tagged = ENCRYPTED_TAGS.iter().any(|tag| prefix[..2] == tag[..]);
    if tagged && prefix[2] == SKESK_VERSION && prefix[4] == S2K_ITERATED {
        return Ok(Format::RawEncrypted);
    }

    Ok(Format::Plain)
}

/// Whether decrypted plaintext is a packed directory.
pub fn is_archive_header(prefix: &[u8]) -> bool {
    prefix.len() >= ARCHIVE_MAGIC.len() && prefix[..2] == ARCHIVE_MAGIC[..]
}
