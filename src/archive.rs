//! Directory archiving
//!
//! Serializes a directory tree into `gzip(tar(tree))` so it can be
//! encrypted as a single message. The output depends only on the tree's
//! names, permission bits and contents: header timestamps and ownership are
//! zeroed and entries are visited in sorted pre-order.

use crate::error::{ErrorCategory, ErrorKind, GpgError, Result};
use flate2::{Compression, GzBuilder};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::fs::{self, Metadata};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Random characters appended to the temporary archive name.
const TEMP_SUFFIX_LEN: usize = 12;

/// Writes the archive of `root` to `writer`, returning the writer once the
/// gzip trailer has been written.
pub fn archive<W: Write>(root: &Path, writer: W) -> Result<W> {
    check_root(root)?;
    let encoder = GzBuilder::new().mtime(0).write(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .follow_root_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| root.display().to_string());
            GpgError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::Io,
                format!("failed to read directory entry under {}", path),
                e,
            )
        })?;

        let relative = entry.path().strip_prefix(root).map_err(|e| {
            GpgError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                format!("{} is not under {}", entry.path().display(), root.display()),
                e,
            )
        })?;
        check_relative_path(relative)?;

        let file_type = entry.file_type();
        let metadata = entry.metadata().map_err(|e| {
            GpgError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::Io,
                format!("failed to stat {}", entry.path().display()),
                e,
            )
        })?;

        if file_type.is_dir() {
            debug!(path = %relative.display(), "archiving directory");
            let mut header = entry_header(tar::EntryType::Directory, mode_bits(&metadata, true), 0);
            builder
                .append_data(&mut header, relative, io::empty())
                .map_err(|e| archive_write_error(relative, e))?;
        } else if file_type.is_file() {
            debug!(path = %relative.display(), "archiving file");
            let content = fs::read(entry.path()).map_err(|e| {
                GpgError::with_kind_and_source(
                    ErrorCategory::User,
                    ErrorKind::Io,
                    format!("failed to read from {}", entry.path().display()),
                    e,
                )
            })?;
            let mut header = entry_header(
                tar::EntryType::Regular,
                mode_bits(&metadata, false),
                content.len() as u64,
            );
            builder
                .append_data(&mut header, relative, content.as_slice())
                .map_err(|e| archive_write_error(relative, e))?;
        } else {
            let what = if file_type.is_symlink() {
                "symlink"
            } else {
                "special file"
            };
            return Err(GpgError::with_kind(
                ErrorCategory::User,
                ErrorKind::UnsafeArchiveEntry,
                format!(
                    "refusing to archive {} {}",
                    what,
                    entry.path().display()
                ),
            ));
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| archive_write_error(root, e))?;
    encoder.finish().map_err(|e| archive_write_error(root, e))
}

/// Archive written to a temporary file, deleted by [`TempArchive::remove`]
/// or, failing that, on drop.
#[derive(Debug)]
pub struct TempArchive {
    file: NamedTempFile,
}

impl TempArchive {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Deletes the temporary file. Failure is logged, not returned.
    pub fn remove(self) {
        let path = self.file.path().to_path_buf();
        match self.file.close() {
            Ok(()) => debug!(path = %path.display(), "removed temporary archive"),
            Err(e) => warn!(
                "failed to remove temporary archive {}: {}",
                path.display(),
                e
            ),
        }
    }
}

/// Archives `root` into `<tmp>/<dirname>-<random>`.
pub fn archive_to_temp<R: Rng + ?Sized>(root: &Path, rng: &mut R) -> Result<TempArchive> {
    let base = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let suffix: String = (0..TEMP_SUFFIX_LEN)
        .map(|_| rng.sample(Alphanumeric) as char)
        .collect();
    let name = format!("{}-{}", base, suffix);

    let mut file = tempfile::Builder::new()
        .prefix(&name)
        .rand_bytes(0)
        .tempfile()
        .map_err(|e| {
            GpgError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                format!("failed to create temporary archive {}", name),
                e,
            )
        })?;
    debug!(path = %file.path().display(), "writing temporary archive");

    let writer = archive(root, BufWriter::new(file.as_file_mut()))?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .and_then(|f| f.sync_all())
        .map_err(|e| {
            GpgError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                format!("failed to flush temporary archive {}", name),
                e,
            )
        })?;

    Ok(TempArchive { file })
}

/// The root must be a real directory, not a link to one.
fn check_root(root: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(root).map_err(|e| {
        GpgError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::Io,
            format!("failed to stat {}", root.display()),
            e,
        )
    })?;
    if metadata.file_type().is_symlink() {
        return Err(GpgError::with_kind(
            ErrorCategory::User,
            ErrorKind::UnsafeArchiveEntry,
            format!("refusing to archive symlink {}", root.display()),
        ));
    }
    Ok(())
}

/// Rejects anything but plain names, so no entry can resolve outside the
/// extraction directory.
fn check_relative_path(path: &Path) -> Result<()> {
    let safe = path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(GpgError::with_kind(
            ErrorCategory::User,
            ErrorKind::UnsafeArchiveEntry,
            format!("refusing to archive path {}", path.display()),
        ))
    }
}

fn entry_header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

#[cfg(unix)]
fn mode_bits(metadata: &Metadata, _is_dir: bool) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(metadata: &Metadata, is_dir: bool) -> u32 {
    match (is_dir, metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

fn archive_write_error(path: &Path, e: io::Error) -> GpgError {
    GpgError::with_kind_and_source(
        ErrorCategory::Internal,
        ErrorKind::Io,
        format!("failed to archive {}", path.display()),
        e,
    )
}
