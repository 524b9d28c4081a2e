//! File and directory encryption/decryption operations
//!
//! This module drives a single request end to end: pick the output path,
//! archive directories, run the message codec and write the result
//! atomically with owner-only permissions.

use crate::archive;
use crate::error::{ErrorCategory, ErrorKind, GpgError, Result};
use crate::message::{self, EncryptOptions};
use crate::passphrase::{PassphrasePrompt, PassphraseReader};
use rand::{CryptoRng, RngCore};
use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

const ENCRYPTED_EXTENSION: &str = "gpg";
const ENCRYPTED_SUFFIX: &str = ".gpg";
const ARCHIVE_SUFFIX: &str = ".tar.gz.gpg";
const DECRYPTED_PREFIX: &str = "decrypted-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// One invocation of the tool.
#[derive(Debug, Clone)]
pub struct Request {
    pub input: PathBuf,
    /// Destination; derived from `input` when absent.
    pub output: Option<PathBuf>,
    pub direction: Direction,
    /// Ignored when decrypting.
    pub options: EncryptOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Archive,
    Encrypt,
    Decrypt,
    Done,
    Failed,
}

struct Pipeline {
    stage: Stage,
}

impl Pipeline {
    fn new() -> Self {
        Self { stage: Stage::Idle }
    }

    fn enter(&mut self, stage: Stage) {
        debug!(from = ?self.stage, to = ?stage, "pipeline stage");
        self.stage = stage;
    }

    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        self.enter(if result.is_ok() { Stage::Done } else { Stage::Failed });
        result
    }
}

/// Runs `request`, returning the path of the written output.
///
/// The reader is asked for a passphrase once when encrypting and at most
/// twice when decrypting.
pub fn run<R: RngCore + CryptoRng>(
    request: &Request,
    reader: &mut dyn PassphraseReader,
    rng: &mut R,
) -> Result<PathBuf> {
    let mut pipeline = Pipeline::new();
    let result = match request.direction {
        Direction::Encrypt => encrypt_stages(&mut pipeline, request, reader, rng),
        Direction::Decrypt => decrypt_stages(&mut pipeline, request, reader),
    };
    pipeline.finish(result)
}

fn decrypt_stages(
    pipeline: &mut Pipeline,
    request: &Request,
    reader: &mut dyn PassphraseReader,
) -> Result<PathBuf> {
    let output = output_path(request)?;
    pipeline.enter(Stage::Decrypt);
    decrypt_file(&request.input, &output, reader)?;
    Ok(output)
}

fn encrypt_stages<R: RngCore + CryptoRng>(
    pipeline: &mut Pipeline,
    request: &Request,
    reader: &mut dyn PassphraseReader,
    rng: &mut R,
) -> Result<PathBuf> {
    let output = output_path(request)?;
    if request.input.is_dir() {
        pipeline.enter(Stage::Archive);
        let temp = archive::archive_to_temp(&request.input, rng)
            .map_err(|e| e.with_context(format!("failed to archive {}", request.input.display())))?;
        pipeline.enter(Stage::Encrypt);
        info!("Encrypting: {}", request.input.display());
        let result = encrypt_contents(temp.path(), &output, reader, &request.options, rng);
        temp.remove();
        result?;
        info!("Encryption successful: {}", output.display());
    } else {
        pipeline.enter(Stage::Encrypt);
        encrypt_file(&request.input, &output, reader, &request.options, rng)?;
    }
    Ok(output)
}

fn output_path(request: &Request) -> Result<PathBuf> {
    match &request.output {
        Some(output) => Ok(output.clone()),
        None => default_output_path(
            &request.input,
            request.direction,
            request.input.is_dir(),
        ),
    }
}

/// Output path used when none is given.
///
/// - file encryption: `<input>.gpg`
/// - directory encryption: `<dir>.tar.gz.gpg`, trailing separators ignored
/// - decryption: `decrypted-<name without .gpg>` next to the input
pub fn default_output_path(input: &Path, direction: Direction, is_dir: bool) -> Result<PathBuf> {
    let name = input.file_name().ok_or_else(|| {
        GpgError::new(
            ErrorCategory::User,
            format!(
                "cannot derive an output name from {}, use --output-file",
                input.display()
            ),
        )
    })?;

    let file_name = match (direction, is_dir) {
        (Direction::Encrypt, false) => {
            let mut out = OsString::from(input.as_os_str());
            out.push(ENCRYPTED_SUFFIX);
            return Ok(PathBuf::from(out));
        }
        (Direction::Encrypt, true) => {
            let mut out = name.to_os_string();
            out.push(ARCHIVE_SUFFIX);
            out
        }
        (Direction::Decrypt, _) => {
            // Works on the OS string so names that are not UTF-8 survive.
            let name_path = Path::new(name);
            let stem = match (name_path.extension(), name_path.file_stem()) {
                (Some(ext), Some(stem)) if ext == ENCRYPTED_EXTENSION => stem,
                _ => name,
            };
            let mut out = OsString::from(DECRYPTED_PREFIX);
            out.push(stem);
            out
        }
    };

    Ok(match input.parent() {
        Some(parent) => parent.join(file_name),
        None => PathBuf::from(file_name),
    })
}

/// Encrypt a file with a passphrase
///
/// Reads plaintext from `input_path`, encrypts it using a passphrase from
/// `passphrase_reader`, and writes the OpenPGP message to `output_path`.
pub fn encrypt_file<R: RngCore + CryptoRng>(
    input_path: &Path,
    output_path: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
    options: &EncryptOptions,
    rng: &mut R,
) -> Result<()> {
    info!("Encrypting: {}", input_path.display());
    encrypt_contents(input_path, output_path, passphrase_reader, options, rng)?;
    info!("Encryption successful: {}", output_path.display());
    Ok(())
}

fn encrypt_contents<R: RngCore + CryptoRng>(
    input_path: &Path,
    output_path: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
    options: &EncryptOptions,
    rng: &mut R,
) -> Result<()> {
    let plaintext = fs::read(input_path).map_err(|e| read_error(input_path, e))?;
    let ciphertext = {
        let passphrase = passphrase_reader.read_passphrase()?;
        message::encrypt(&passphrase, &plaintext, options, rng)
            .map_err(|e| e.with_context("encryption failed"))?
    };
    write_file_atomic(output_path, &ciphertext)
}

/// Decrypt a file with a passphrase
///
/// The plaintext is only written once the whole message has been
/// authenticated, so a failed decryption leaves no output behind.
pub fn decrypt_file(
    input_path: &Path,
    output_path: &Path,
    passphrase_reader: &mut dyn PassphraseReader,
) -> Result<()> {
    info!("Decrypting: {}", input_path.display());
    let ciphertext = fs::read(input_path).map_err(|e| read_error(input_path, e))?;
    let mut prompt = PassphrasePrompt::new(passphrase_reader);
    let literal = message::decrypt(&ciphertext, &mut prompt)
        .map_err(|e| e.with_context("failed to decrypt"))?;
    let plaintext = Zeroizing::new(literal.data);
    write_file_atomic(output_path, &plaintext)?;
    info!("Decryption successful: {}", output_path.display());
    Ok(())
}

/// Writes `contents` to `path` through a temporary file in the same
/// directory (flush, fsync, mode 0600, rename) so `path` is either absent
/// or complete.
fn write_file_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp_file = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        GpgError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::Io,
            format!("failed to create tempfile in {}", dir.display()),
            e,
        )
    })?;

    temp_file.write_all(contents).map_err(|e| {
        GpgError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to write to tempfile",
            e,
        )
    })?;
    // Flush and fsync() such that the rename, if it succeeds, always
    // points to a complete file.
    temp_file.flush().map_err(|e| {
        GpgError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to flush tempfile",
            e,
        )
    })?;
    temp_file.as_file().sync_all().map_err(|e| {
        GpgError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to sync file prior to rename",
            e,
        )
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp_file
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| {
                GpgError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    "failed to set tempfile permissions",
                    e,
                )
            })?;
    }

    temp_file.persist(path).map_err(|e| {
        GpgError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::Io,
            format!("failed to write to {}", path.display()),
            e,
        )
    })?;
    Ok(())
}

fn read_error(path: &Path, err: io::Error) -> GpgError {
    let category = if err.kind() == io::ErrorKind::NotFound {
        ErrorCategory::User
    } else {
        ErrorCategory::Internal
    };
    GpgError::with_kind_and_source(
        category,
        ErrorKind::Io,
        format!("failed to read from {}", path.display()),
        err,
    )
}
