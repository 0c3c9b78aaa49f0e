//! In-place encryption and decryption of files and directories
//!
//! A single entry point, [`process_path`], decides the direction from the
//! target's leading bytes:
//! - plaintext files and directories are encrypted to `<path>.gpg` and the
//!   original is removed
//! - encrypted files are decrypted, either unpacked (directories) or
//!   streamed to the caller's output (files), and the `.gpg` is removed
//!
//! The source is only removed after the new artifact has been completely
//! written. Any earlier failure leaves it untouched.

use crate::archive;
use crate::error::{ErrorCategory, ErrorKind, QuicryptError, Result};
use crate::passphrase::{PassphraseReader, Prompt, RetryPolicy};
use crate::sniff::{self, Format};
use crate::symcrypt::{self, EncryptOptions};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Suffix appended to encrypted artifacts.
pub const ENCRYPTED_SUFFIX: &str = ".gpg";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// ASCII-armor newly encrypted output.
    pub armor: bool,
    /// How many decryption passphrases to try.
    pub retry: RetryPolicy,
}

/// What [`process_path`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The target was encrypted to `output` and removed.
    Encrypted { output: PathBuf },
    /// An encrypted directory was unpacked into `dest`.
    Extracted { dest: PathBuf },
    /// An encrypted file was decrypted to the output stream.
    Streamed { bytes: u64 },
}

/// Encrypt or decrypt `path` in place.
///
/// Decrypted directories are unpacked into `workdir`; decrypted files are
/// written to `out`.
pub fn process_path(
    path: &Path,
    workdir: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
    out: &mut dyn Write,
    options: &Options,
) -> Result<Outcome> {
    let metadata = fs::metadata(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            QuicryptError::with_source(
                ErrorCategory::User,
                ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
                e,
            )
        } else {
            read_error(path, e)
        }
    })?;

    let format = if metadata.is_dir() {
        Format::Plain
    } else if metadata.is_file() {
        sniff_file(path)?
    } else {
        return Err(QuicryptError::format(format!(
            "{} is neither a regular file nor a directory",
            path.display()
        )));
    };
    debug!(path = %path.display(), ?format, "classified target");

    if format.is_encrypted() {
        decrypt_path(path, workdir, passphrase_reader, out, options)
    } else {
        encrypt_path(path, metadata.is_dir(), passphrase_reader, options)
    }
}

fn sniff_file(path: &Path) -> Result<Format> {
    let file = File::open(path).map_err(|e| read_error(path, e))?;
    let mut prefix = Vec::with_capacity(sniff::PREFIX_LEN);
    file.take(sniff::PREFIX_LEN as u64)
        .read_to_end(&mut prefix)
        .map_err(|e| read_error(path, e))?;
    sniff::classify(&prefix)
        .map_err(|e| e.with_context(format!("cannot process {}", path.display())))
}

/// `<path>.gpg`, with any trailing separators of `path` dropped.
pub fn encrypted_path(path: &Path) -> Result<PathBuf> {
    let trimmed: PathBuf = path.components().collect();
    if trimmed.file_name().is_none() {
        return Err(QuicryptError::new(
            ErrorCategory::User,
            ErrorKind::Format,
            format!("refusing to encrypt {}: it has no file name", path.display()),
        ));
    }
    let mut name = OsString::from(trimmed);
    name.push(ENCRYPTED_SUFFIX);
    Ok(PathBuf::from(name))
}

fn encrypt_path(
    path: &Path,
    is_dir: bool,
    passphrase_reader: &mut dyn PassphraseReader,
    options: &Options,
) -> Result<Outcome> {
    let output = encrypted_path(path)?;

    let passphrase = passphrase_reader.read_passphrase(Prompt::Encrypt)?;
    let confirmation = passphrase_reader.read_passphrase(Prompt::Confirm)?;
    if *passphrase != *confirmation {
        return Err(QuicryptError::new(
            ErrorCategory::User,
            ErrorKind::PassphraseMismatch,
            "passwords do not match",
        ));
    }

    let output_dir = match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut temp_file = NamedTempFile::new_in(output_dir).map_err(|e| {
        QuicryptError::with_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to create tempfile",
            e,
        )
    })?;

    let encrypt_options = EncryptOptions {
        compress: is_dir,
        armor: options.armor,
    };
    let writer = BufWriter::new(&mut temp_file);
    let writer = if is_dir {
        let mut staged = tempfile::tempfile().map_err(|e| {
            QuicryptError::with_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to create staging file",
                e,
            )
        })?;
        staged = archive::pack(path, staged)
            .map_err(|e| e.with_context(format!("failed to pack {}", path.display())))?;
        staged.rewind().map_err(|e| {
            QuicryptError::with_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to rewind staging file",
                e,
            )
        })?;
        symcrypt::encrypt(
            &mut BufReader::new(staged),
            &passphrase,
            encrypt_options,
            writer,
        )?
    } else {
        let file = File::open(path).map_err(|e| read_error(path, e))?;
        symcrypt::encrypt(
            &mut BufReader::new(file),
            &passphrase,
            encrypt_options,
            writer,
        )?
    };
    writer.into_inner().map_err(|e| {
        QuicryptError::with_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to write to tempfile",
            e.into_error(),
        )
    })?;

    persist_secure(temp_file, &output)?;
    info!(source = %path.display(), output = %output.display(), "encrypted");

    remove_source(path, is_dir)?;
    Ok(Outcome::Encrypted { output })
}

fn decrypt_path(
    path: &Path,
    workdir: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
    out: &mut dyn Write,
    options: &Options,
) -> Result<Outcome> {
    let file = File::open(path).map_err(|e| read_error(path, e))?;
    let mut decrypted = symcrypt::decrypt(BufReader::new(file), passphrase_reader, options.retry)
        .map_err(|e| e.with_context(format!("failed to decrypt {}", path.display())))?;
    let read_failed =
        |e: io::Error| QuicryptError::from_io(e, ErrorKind::Io, "failed to read decrypted data");

    let mut head = Vec::with_capacity(sniff::ARCHIVE_MAGIC.len());
    (&mut decrypted)
        .take(sniff::ARCHIVE_MAGIC.len() as u64)
        .read_to_end(&mut head)
        .map_err(read_failed)?;

    let outcome = if sniff::is_archive_header(&head) {
        debug!(
            dest = %workdir.display(),
            "decrypted data starts with the bzip2 magic, unpacking it as a folder archive"
        );
        archive::unpack(io::Cursor::new(head).chain(&mut decrypted), workdir)?;
        // The archive may end before the encrypted stream does.
        io::copy(&mut decrypted, &mut io::sink()).map_err(read_failed)?;
        Outcome::Extracted {
            dest: workdir.to_path_buf(),
        }
    } else {
        out.write_all(&head).map_err(write_error)?;
        let copied = io::copy(&mut decrypted, out)
            .map_err(|e| QuicryptError::from_io(e, ErrorKind::Io, "failed to write decrypted data"))?;
        out.flush().map_err(write_error)?;
        Outcome::Streamed {
            bytes: head.len() as u64 + copied,
        }
    };
    info!(source = %path.display(), "decrypted");

    remove_source(path, false)?;
    Ok(outcome)
}

/// Flush, fsync and restrict a tempfile, then atomically move it to `target`.
fn persist_secure(temp_file: NamedTempFile, target: &Path) -> Result<()> {
    // Flush and fsync() such that the rename later, if it succeeds, will
    // always point to a valid file.
    temp_file.as_file().sync_all().map_err(|e| {
        QuicryptError::with_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to sync file prior to rename",
            e,
        )
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = temp_file
            .as_file()
            .metadata()
            .map_err(|e| {
                QuicryptError::with_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    "failed to get tempfile metadata",
                    e,
                )
            })?
            .permissions();
        perms.set_mode(0o600);
        temp_file.as_file().set_permissions(perms).map_err(|e| {
            QuicryptError::with_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to set tempfile permissions",
                e,
            )
        })?;
    }
    temp_file.persist(target).map_err(|e| {
        QuicryptError::with_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            format!("failed to rename to target file {}", target.display()),
            e,
        )
    })?;
    Ok(())
}

fn remove_source(path: &Path, is_dir: bool) -> Result<()> {
    let removed = if is_dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.map_err(|e| {
        QuicryptError::with_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            format!("failed to remove {}", path.display()),
            e,
        )
    })
}

fn write_error(e: io::Error) -> QuicryptError {
    QuicryptError::from_io(e, ErrorKind::Io, "failed to write decrypted data")
}

fn read_error(path: &Path, err: io::Error) -> QuicryptError {
    let category = if err.kind() == io::ErrorKind::NotFound {
        ErrorCategory::User
    } else {
        ErrorCategory::Internal
    };
    QuicryptError::with_source(
        category,
        ErrorKind::Io,
        format!("failed to read from {}", path.display()),
        err,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passphrase::{ConstantPassphraseReader, SequencePassphraseReader};
    use std::num::NonZeroU32;
    use tempfile::TempDir;

    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    fn run(path: &Path, workdir: &Path, passphrase: &[u8]) -> Result<(Outcome, Vec<u8>)> {
        let mut reader = ConstantPassphraseReader::new(passphrase.to_vec());
        let mut out = Vec::new();
        let outcome = process_path(path, workdir, &mut reader, &mut out, &Options::default())?;
        Ok((outcome, out))
    }

    #[test]
    fn test_encrypted_path() {
        assert_eq!(encrypted_path(Path::new("hello.txt")).unwrap(), PathBuf::from("hello.txt.gpg"));
        assert_eq!(encrypted_path(Path::new("docs/")).unwrap(), PathBuf::from("docs.gpg"));
        assert_eq!(encrypted_path(Path::new("a/b//")).unwrap(), PathBuf::from("a/b.gpg"));
        assert!(encrypted_path(Path::new(".")).is_err());
        assert!(encrypted_path(Path::new("/")).is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("hello.txt");
        let crypt_path = temp_dir.path().join("hello.txt.gpg");
        fs::write(&plain_path, b"hello\n").unwrap();

        let (outcome, _) = run(&plain_path, temp_dir.path(), b"abc123").unwrap();
        assert_eq!(outcome, Outcome::Encrypted { output: crypt_path.clone() });
        assert!(!plain_path.exists());
        assert_eq!(&fs::read(&crypt_path).unwrap()[..2], &[0xc3, 0x2e]);

        let (outcome, out) = run(&crypt_path, temp_dir.path(), b"abc123").unwrap();
        assert_eq!(outcome, Outcome::Streamed { bytes: 6 });
        assert_eq!(out, b"hello\n");
        assert!(!crypt_path.exists());
        assert!(!plain_path.exists());
    }

    #[test]
    fn test_directory_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let docs = temp_dir.path().join("docs");
        fs::create_dir_all(docs.join("sub")).unwrap();
        fs::write(docs.join("a.txt"), b"A").unwrap();
        fs::write(docs.join("sub").join("b.txt"), b"B").unwrap();

        let (outcome, _) = run(&docs, temp_dir.path(), b"pw").unwrap();
        let crypt_path = temp_dir.path().join("docs.gpg");
        assert_eq!(outcome, Outcome::Encrypted { output: crypt_path.clone() });
        assert!(!docs.exists());

        let workdir = TempDir::new().unwrap();
        let (outcome, out) = run(&crypt_path, workdir.path(), b"pw").unwrap();
        assert_eq!(outcome, Outcome::Extracted { dest: workdir.path().to_path_buf() });
        assert!(out.is_empty());
        assert!(!crypt_path.exists());
        assert_eq!(fs::read(workdir.path().join("docs/a.txt")).unwrap(), b"A");
        assert_eq!(fs::read(workdir.path().join("docs/sub/b.txt")).unwrap(), b"B");
    }

    #[test]
    fn test_armored_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("notes.md");
        fs::write(&plain_path, b"# notes").unwrap();

        let mut reader = ConstantPassphraseReader::new(b"pw".to_vec());
        let options = Options {
            armor: true,
            ..Options::default()
        };
        process_path(&plain_path, temp_dir.path(), &mut reader, &mut io::sink(), &options).unwrap();

        let crypt_path = temp_dir.path().join("notes.md.gpg");
        assert!(fs::read(&crypt_path).unwrap().starts_with(b"-----BEGIN PGP MESSAGE-----"));

        let (_, out) = run(&crypt_path, temp_dir.path(), b"pw").unwrap();
        assert_eq!(out, b"# notes");
    }

    #[test]
    fn test_passphrase_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("hello.txt");
        fs::write(&plain_path, b"hello\n").unwrap();

        let mut reader = SequencePassphraseReader::new(["one", "two"]);
        let err = process_path(
            &plain_path,
            temp_dir.path(),
            &mut reader,
            &mut io::sink(),
            &Options::default(),
        )
        .expect_err("expected mismatch");
        assert_eq!(err.kind, ErrorKind::PassphraseMismatch);
        assert!(plain_path.exists());
        assert!(!temp_dir.path().join("hello.txt.gpg").exists());
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_decrypt_retries() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("hello.txt");
        fs::write(&plain_path, b"hello\n").unwrap();
        run(&plain_path, temp_dir.path(), b"right").unwrap();

        let crypt_path = temp_dir.path().join("hello.txt.gpg");
        let mut reader = SequencePassphraseReader::new(["wrong", "right"]);
        let mut out = Vec::new();
        process_path(&crypt_path, temp_dir.path(), &mut reader, &mut out, &Options::default())
            .unwrap();
        assert_eq!(out, b"hello\n");
        assert_eq!(
            reader.prompts(),
            [Prompt::Decrypt { attempt: 1 }, Prompt::Decrypt { attempt: 2 }]
        );
    }

    #[test]
    fn test_wrong_passphrase_keeps_source() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("hello.txt");
        fs::write(&plain_path, b"hello\n").unwrap();
        run(&plain_path, temp_dir.path(), b"right").unwrap();

        let crypt_path = temp_dir.path().join("hello.txt.gpg");
        let before = fs::read(&crypt_path).unwrap();
        let mut reader = SequencePassphraseReader::new(["a", "b", "c"]);
        let options = Options {
            retry: RetryPolicy::bounded(NonZeroU32::new(3).unwrap()),
            ..Options::default()
        };
        let mut out = Vec::new();
        let err = process_path(&crypt_path, temp_dir.path(), &mut reader, &mut out, &options)
            .expect_err("expected authentication failure");
        assert_eq!(err.kind, ErrorKind::AuthenticationFailed);
        assert!(out.is_empty());
        assert_eq!(fs::read(&crypt_path).unwrap(), before);
    }

    #[test]
    fn test_missing_path() {
        let temp_dir = TempDir::new().unwrap();
        let err = run(&temp_dir.path().join("nope"), temp_dir.path(), b"pw")
            .expect_err("expected not found");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.category, ErrorCategory::User);
    }

    #[test]
    fn test_short_file_rejected() {
        let temp_dir = TempDir::new().unwrap();
        for (name, contents) in [("empty", &b""[..]), ("tiny", &b"abcd"[..])] {
            let path = temp_dir.path().join(name);
            fs::write(&path, contents).unwrap();
            let err = run(&path, temp_dir.path(), b"pw").expect_err("expected format error");
            assert_eq!(err.kind, ErrorKind::Format);
            assert_eq!(fs::read(&path).unwrap(), contents);
        }
    }

    #[test]
    fn test_tampered_file_keeps_source() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("data.bin");
        fs::write(&plain_path, vec![0x11u8; 4096]).unwrap();
        run(&plain_path, temp_dir.path(), b"pw").unwrap();

        let crypt_path = temp_dir.path().join("data.bin.gpg");
        let mut bytes = fs::read(&crypt_path).unwrap();
        let idx = bytes.len() - 40;
        bytes[idx] ^= 0x10;
        fs::write(&crypt_path, &bytes).unwrap();

        let err = run(&crypt_path, temp_dir.path(), b"pw").expect_err("expected tamper detection");
        assert_eq!(err.kind, ErrorKind::AuthenticationFailed);
        assert!(crypt_path.exists());
    }

    /// A plain file holding bzip2 data decrypts down the archive branch.
    #[test]
    fn test_bzip2_file_unpacked_as_archive() {
        use bzip2::Compression;
        use bzip2::write::BzEncoder;

        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("notes.bz2");
        let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(b"not a tar stream").unwrap();
        fs::write(&plain_path, encoder.finish().unwrap()).unwrap();
        run(&plain_path, temp_dir.path(), b"pw").unwrap();

        let crypt_path = temp_dir.path().join("notes.bz2.gpg");
        let err = run(&crypt_path, temp_dir.path(), b"pw").expect_err("expected archive error");
        assert_eq!(err.kind, ErrorKind::ArchiveCorruption);
        assert!(crypt_path.exists());
        assert!(!plain_path.exists());
    }

    #[test]
    #[cfg(unix)]
    fn test_file_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let plain_path = temp_dir.path().join("plain.txt");
        fs::write(&plain_path, b"test data").unwrap();
        fs::set_permissions(&plain_path, fs::Permissions::from_mode(0o644)).unwrap();

        run(&plain_path, temp_dir.path(), b"test").unwrap();

        let metadata = fs::metadata(temp_dir.path().join("plain.txt.gpg")).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }
}
