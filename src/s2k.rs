//! String-to-key: turning a passphrase into a cipher key (RFC 4880 3.7)

use crate::error::{QuicryptError, Result};
use rand::RngCore;
use rand::rngs::OsRng;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 8;

/// Coded count for 65536 hashed bytes.
pub const DEFAULT_CODED_COUNT: u8 = 96;

const S2K_SIMPLE: u8 = 0;
const S2K_SALTED: u8 = 1;
const S2K_ITERATED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn id(self) -> u8 {
        match self {
            HashAlgorithm::Sha1 => 2,
            HashAlgorithm::Sha256 => 8,
            HashAlgorithm::Sha512 => 10,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            2 => Some(HashAlgorithm::Sha1),
            8 => Some(HashAlgorithm::Sha256),
            10 => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S2k {
    Simple {
        hash: HashAlgorithm,
    },
    Salted {
        hash: HashAlgorithm,
        salt: [u8; SALT_LEN],
    },
    Iterated {
        hash: HashAlgorithm,
        salt: [u8; SALT_LEN],
        coded_count: u8,
    },
}

/// Number of bytes an iterated S2K hashes for a coded count.
pub fn decode_count(coded: u8) -> usize {
    (16 + usize::from(coded & 15)) << (usize::from(coded >> 4) + 6)
}

impl S2k {
    /// Iterated and salted SHA-256 with a fresh random salt.
    pub fn new_iterated() -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self::iterated_with_salt(salt)
    }

    pub fn iterated_with_salt(salt: [u8; SALT_LEN]) -> Self {
        S2k::Iterated {
            hash: HashAlgorithm::Sha256,
            salt,
            coded_count: DEFAULT_CODED_COUNT,
        }
    }

    /// Parse a specifier from the start of `data`, returning it and the
    /// number of bytes it occupied.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let truncated = || QuicryptError::format("input truncated while reading S2K specifier");
        let (&kind, rest) = data.split_first().ok_or_else(truncated)?;
        let (&hash_id, rest) = rest.split_first().ok_or_else(truncated)?;
        let hash = HashAlgorithm::from_id(hash_id).ok_or_else(|| {
            QuicryptError::format(format!("unsupported S2K hash algorithm {}", hash_id))
        })?;

        let salt = |rest: &[u8]| -> Result<[u8; SALT_LEN]> {
            rest.get(..SALT_LEN)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(truncated)
        };

        match kind {
            S2K_SIMPLE => Ok((S2k::Simple { hash }, 2)),
            S2K_SALTED => Ok((S2k::Salted { hash, salt: salt(rest)? }, 2 + SALT_LEN)),
            S2K_ITERATED => {
                let salt = salt(rest)?;
                let coded_count = *rest.get(SALT_LEN).ok_or_else(truncated)?;
                Ok((
                    S2k::Iterated {
                        hash,
                        salt,
                        coded_count,
                    },
                    3 + SALT_LEN,
                ))
            }
            other => Err(QuicryptError::format(format!(
                "unsupported S2K type {}",
                other
            ))),
        }
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            S2k::Simple { hash } => out.extend_from_slice(&[S2K_SIMPLE, hash.id()]),
            S2k::Salted { hash, salt } => {
                out.extend_from_slice(&[S2K_SALTED, hash.id()]);
                out.extend_from_slice(salt);
            }
            S2k::Iterated {
                hash,
                salt,
                coded_count,
            } => {
                out.extend_from_slice(&[S2K_ITERATED, hash.id()]);
                out.extend_from_slice(salt);
                out.push(*coded_count);
            }
        }
    }

    /// Fill `key` with key material derived from `passphrase`.
    pub fn derive_key(&self, passphrase: &[u8], key: &mut [u8]) {
        let (hash, salt, count): (_, &[u8], _) = match self {
            S2k::Simple { hash } => (*hash, &[], 0),
            S2k::Salted { hash, salt } => (*hash, salt, 0),
            S2k::Iterated {
                hash,
                salt,
                coded_count,
            } => (*hash, salt, decode_count(*coded_count)),
        };
        match hash {
            HashAlgorithm::Sha1 => hash_into::<Sha1>(salt, passphrase, count, key),
            HashAlgorithm::Sha256 => hash_into::<Sha256>(salt, passphrase, count, key),
            HashAlgorithm::Sha512 => hash_into::<Sha512>(salt, passphrase, count, key),
        }
    }
}

/// Hash `salt || passphrase` repeated up to `count` bytes (at least once).
/// Keys longer than one digest use further contexts preloaded with zero bytes.
fn hash_into<D: Digest>(salt: &[u8], passphrase: &[u8], count: usize, key: &mut [u8]) {
    let mut unit = Zeroizing::new(Vec::with_capacity(salt.len() + passphrase.len()));
    unit.extend_from_slice(salt);
    unit.extend_from_slice(passphrase);
    let total = if unit.is_empty() {
        0
    } else {
        count.max(unit.len())
    };

    let mut filled = 0;
    let mut preload = 0;
    while filled < key.len() {
        let mut hasher = D::new();
        for _ in 0..preload {
            hasher.update([0u8]);
        }
        let mut remaining = total;
        while remaining > 0 {
            let n = remaining.min(unit.len());
            hasher.update(&unit[..n]);
            remaining -= n;
        }
        let digest = hasher.finalize();
        let n = (key.len() - filled).min(digest.len());
        key[filled..filled + n].copy_from_slice(&digest[..n]);
        filled += n;
        preload += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_decode_count() {
        assert_eq!(decode_count(0), 1024);
        assert_eq!(decode_count(DEFAULT_CODED_COUNT), 65536);
        assert_eq!(decode_count(255), 65_011_712);
    }

    #[test]
    fn test_serialize_parse() {
        let s2k = S2k::iterated_with_salt([7u8; SALT_LEN]);
        let mut out = Vec::new();
        s2k.serialize(&mut out);
        assert_eq!(out, [3, 8, 7, 7, 7, 7, 7, 7, 7, 7, 96]);

        out.extend_from_slice(b"trailing");
        let (parsed, used) = S2k::parse(&out).unwrap();
        assert_eq!(parsed, s2k);
        assert_eq!(used, 11);
    }

    #[test]
    fn test_parse_errors() {
        let err = S2k::parse(&[3, 8, 1, 2]).expect_err("expected truncation");
        assert_eq!(err.kind, ErrorKind::Format);

        let err = S2k::parse(&[3, 99, 0, 0, 0, 0, 0, 0, 0, 0, 96]).expect_err("expected bad hash");
        assert_eq!(err.kind, ErrorKind::Format);

        let err = S2k::parse(&[101, 8]).expect_err("expected bad type");
        assert_eq!(err.kind, ErrorKind::Format);
    }

    #[test]
    fn test_salted_sha1_key_expansion() {
        let salt = [0x42u8; SALT_LEN];
        let s2k = S2k::Salted {
            hash: HashAlgorithm::Sha1,
            salt,
        };
        let mut key = [0u8; 32];
        s2k.derive_key(b"passphrase", &mut key);

        let mut first = Sha1::new();
        first.update(salt);
        first.update(b"passphrase");
        assert_eq!(&key[..20], &first.finalize()[..]);

        let mut second = Sha1::new();
        second.update([0u8]);
        second.update(salt);
        second.update(b"passphrase");
        assert_eq!(&key[20..], &second.finalize()[..12]);
    }

    #[test]
    fn test_simple_sha256() {
        let mut key = [0u8; 32];
        S2k::Simple {
            hash: HashAlgorithm::Sha256,
        }
        .derive_key(b"abc", &mut key);
        assert_eq!(&key[..], &Sha256::digest(b"abc")[..]);
    }

    #[test]
    fn test_iterated_count_below_input_hashes_once() {
        let passphrase = vec![b'x'; 2000];
        let salt = [9u8; SALT_LEN];

        let mut iterated = [0u8; 32];
        S2k::Iterated {
            hash: HashAlgorithm::Sha256,
            salt,
            coded_count: 0,
        }
        .derive_key(&passphrase, &mut iterated);

        let mut salted = [0u8; 32];
        S2k::Salted {
            hash: HashAlgorithm::Sha256,
            salt,
        }
        .derive_key(&passphrase, &mut salted);

        assert_eq!(iterated, salted);
    }

    #[test]
    fn test_iterated_depends_on_passphrase_and_salt() {
        let derive = |salt: [u8; SALT_LEN], passphrase: &[u8]| {
            let mut key = [0u8; 32];
            S2k::iterated_with_salt(salt).derive_key(passphrase, &mut key);
            key
        };
        assert_eq!(derive([1; SALT_LEN], b"abc123"), derive([1; SALT_LEN], b"abc123"));
        assert_ne!(derive([1; SALT_LEN], b"abc123"), derive([2; SALT_LEN], b"abc123"));
        assert_ne!(derive([1; SALT_LEN], b"abc123"), derive([1; SALT_LEN], b"abc124"));
    }
}
