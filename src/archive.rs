//! Directory packing: a tar stream inside bzip2
//!
//! Entries are named relative to the parent of the packed directory, so
//! packing `some/where/docs` yields `docs`, `docs/a.txt` and so on, and
//! unpacking recreates `docs` inside the destination.

use crate::error::{ErrorCategory, ErrorKind, QuicryptError, Result};
use bzip2::Compression;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType};
use tracing::debug;
use walkdir::WalkDir;

/// Pack the directory tree at `root` into `out`, returning `out` once the
/// compressed stream is complete.
pub fn pack<W: Write>(root: &Path, out: W) -> Result<W> {
    let base = base_name(root)?;
    let mut builder = Builder::new(BzEncoder::new(out, Compression::best()));
    builder.follow_symlinks(false);

    let mut count = 0usize;
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            QuicryptError::with_source(
                ErrorCategory::User,
                ErrorKind::Io,
                format!("failed to walk {}", path.display()),
                e,
            )
        })?;

        let file_type = entry.file_type();
        if !(file_type.is_dir() || file_type.is_file() || file_type.is_symlink()) {
            debug!(path = %entry.path().display(), "skipping special file");
            continue;
        }

        let relative = entry.path().strip_prefix(root).map_err(|e| {
            QuicryptError::with_source(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                "walked outside the packed directory",
                e,
            )
        })?;
        let name = if relative.as_os_str().is_empty() {
            base.clone()
        } else {
            base.join(relative)
        };

        builder
            .append_path_with_name(entry.path(), &name)
            .map_err(|e| {
                QuicryptError::from_io(
                    e,
                    ErrorKind::Io,
                    format!("failed to archive {}", entry.path().display()),
                )
            })?;
        count += 1;
    }

    let encoder = builder.into_inner().map_err(archive_write_error)?;
    let out = encoder.finish().map_err(archive_write_error)?;
    debug!(entries = count, root = %root.display(), "directory packed");
    Ok(out)
}

fn archive_write_error(e: io::Error) -> QuicryptError {
    QuicryptError::from_io(e, ErrorKind::Io, "failed to write archive")
}

/// Name the archive is rooted at: the final component of `root`.
fn base_name(root: &Path) -> Result<PathBuf> {
    if let Some(name) = root.file_name() {
        return Ok(PathBuf::from(name));
    }
    let canonical = root.canonicalize().map_err(|e| {
        QuicryptError::from_io(e, ErrorKind::Io, format!("failed to resolve {}", root.display()))
    })?;
    canonical
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| QuicryptError::format(format!("cannot pack {}", root.display())))
}

fn corrupt(e: io::Error, msg: &str) -> QuicryptError {
    QuicryptError::from_io(e, ErrorKind::ArchiveCorruption, msg)
}

/// Only plain relative paths may be unpacked.
fn checked_path(path: &Path) -> Result<&Path> {
    let safe = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe || path.as_os_str().is_empty() {
        return Err(QuicryptError::new(
            ErrorCategory::User,
            ErrorKind::ArchiveCorruption,
            format!("refusing to unpack entry with unsafe path {}", path.display()),
        ));
    }
    Ok(path)
}

/// Unpack a stream produced by [`pack`] into `dest`.
///
/// Directories and regular files are recreated; other entry types are
/// skipped. Existing files are overwritten.
pub fn unpack<R: Read>(source: R, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(BzDecoder::new(source));
    let entries = archive
        .entries()
        .map_err(|e| corrupt(e, "failed to read archive"))?;

    let mut count = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(e, "failed to read archive entry"))?;
        let path = entry
            .path()
            .map_err(|e| corrupt(e, "invalid archive entry path"))?
            .into_owned();
        let target = dest.join(checked_path(&path)?);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target).map_err(|e| {
                    QuicryptError::from_io(
                        e,
                        ErrorKind::Io,
                        format!("failed to create directory {}", target.display()),
                    )
                })?;
            }
            EntryType::Regular | EntryType::Continuous => {
                let size = entry
                    .header()
                    .size()
                    .map_err(|e| corrupt(e, "invalid archive entry size"))?;
                let mode = entry.header().mode().ok();
                extract_file(&mut entry, &target, size, mode)?;
            }
            other => {
                debug!(path = %path.display(), entry_type = ?other, "skipping archive entry");
                continue;
            }
        }
        count += 1;
    }
    debug!(entries = count, dest = %dest.display(), "archive unpacked");
    Ok(())
}

fn extract_file(entry: &mut dyn Read, target: &Path, size: u64, mode: Option<u32>) -> Result<()> {
    let write_error = |e: io::Error| {
        QuicryptError::from_io(e, ErrorKind::Io, format!("failed to write {}", target.display()))
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(write_error)?;
    }
    let mut file = File::create(target).map_err(write_error)?;

    let mut buf = vec![0u8; 64 * 1024];
    let mut copied: u64 = 0;
    loop {
        let n = match entry.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(corrupt(e, "failed to read archive entry data")),
        };
        file.write_all(&buf[..n]).map_err(write_error)?;
        copied += n as u64;
    }
    if copied != size {
        return Err(QuicryptError::new(
            ErrorCategory::User,
            ErrorKind::ArchiveCorruption,
            format!(
                "archive entry {} truncated ({} of {} bytes)",
                target.display(),
                copied,
                size
            ),
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = mode {
            fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o777))
                .map_err(write_error)?;
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}
