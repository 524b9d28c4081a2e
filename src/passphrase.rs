//! Where passphrases come from
//!
//! Encryption asks its reader once. Decryption goes through
//! [`PassphrasePrompt`], which asks a second time when the first passphrase
//! fails the OpenPGP quick-check. The CLI picks the reader: `--password`
//! gives a [`ConstantPassphraseReader`], `--password-stdin` a
//! [`CachingPassphraseReader`] over a [`ReaderPassphraseReader`], and
//! otherwise a [`TerminalPassphraseReader`].

use crate::error::{ErrorCategory, ErrorKind, GpgError, Result};
use std::io::{self, IsTerminal, Read, Write};
use tracing::warn;
use zeroize::Zeroizing;

/// Text shown before reading from the terminal.
const TERMINAL_PROMPT: &[u8] = b"Enter password: ";

/// A source of passphrase bytes for S2K key derivation.
pub trait PassphraseReader {
    /// Returns the passphrase as raw bytes. OpenPGP hashes them as given,
    /// so nothing is trimmed or re-encoded.
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>>;
}

/// Hands out the same passphrase every time. Backs `--password`, so a
/// wrong one is offered again on the retry and decryption then fails.
pub struct ConstantPassphraseReader {
    passphrase: Zeroizing<Vec<u8>>,
}

impl ConstantPassphraseReader {
    pub fn new(passphrase: Vec<u8>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase),
        }
    }
}

impl PassphraseReader for ConstantPassphraseReader {
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(self.passphrase.clone())
    }
}

/// Reads a stream to its end and uses every byte, trailing newline included.
pub struct ReaderPassphraseReader {
    reader: Box<dyn Read>,
}

impl ReaderPassphraseReader {
    pub fn new(reader: Box<dyn Read>) -> Self {
        Self { reader }
    }
}

impl PassphraseReader for ReaderPassphraseReader {
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        let mut data = Zeroizing::new(Vec::new());
        self.reader.read_to_end(&mut data).map_err(|e| {
            GpgError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to read password stream",
                e,
            )
        })?;
        Ok(data)
    }
}

/// Prompts on stderr and reads a line from the terminal without echo.
/// Every call prompts again, which is how a decryption retry reaches the user.
pub struct TerminalPassphraseReader;

impl TerminalPassphraseReader {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TerminalPassphraseReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PassphraseReader for TerminalPassphraseReader {
    /// Terminal input arrives through rpassword and so must be UTF-8.
    /// Binary passphrases need `--password-stdin`.
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        if !io::stdin().is_terminal() {
            return Err(GpgError::with_kind(
                ErrorCategory::User,
                ErrorKind::PassphraseUnavailable,
                "stdin is not a terminal; use --password or --password-stdin",
            ));
        }

        write_prompt().map_err(|e| {
            GpgError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to write password prompt",
                e,
            )
        })?;

        // rpassword's String is not zeroized; only the copy we return is.
        let passphrase = rpassword::read_password().map_err(|e| {
            GpgError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::PassphraseUnavailable,
                "failed to read password from terminal",
                e,
            )
        })?;

        Ok(Zeroizing::new(passphrase.into_bytes()))
    }
}

fn write_prompt() -> io::Result<()> {
    let mut stderr = io::stderr().lock();
    stderr.write_all(TERMINAL_PROMPT)?;
    stderr.flush()
}

/// Reads its upstream once and replays the bytes afterwards.
///
/// Stdin is drained by the first read, so without this the decryption
/// retry would derive a key from an empty passphrase. A failed read is
/// not cached.
pub struct CachingPassphraseReader {
    upstream: Box<dyn PassphraseReader>,
    cached: Option<Zeroizing<Vec<u8>>>,
}

impl CachingPassphraseReader {
    pub fn new(upstream: Box<dyn PassphraseReader>) -> Self {
        Self {
            upstream,
            cached: None,
        }
    }
}

impl PassphraseReader for CachingPassphraseReader {
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        if let Some(passphrase) = &self.cached {
            return Ok(passphrase.clone());
        }
        let passphrase = self.upstream.read_passphrase()?;
        self.cached = Some(passphrase.clone());
        Ok(passphrase)
    }
}

/// Which passphrase a decryption is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    First,
    Retried,
}

/// Hands out passphrases for one decryption: the first one, then a single
/// retry after a rejection, then nothing.
pub struct PassphrasePrompt<'r> {
    reader: &'r mut dyn PassphraseReader,
    attempt: Option<Attempt>,
}

impl<'r> PassphrasePrompt<'r> {
    pub fn new(reader: &'r mut dyn PassphraseReader) -> Self {
        Self {
            reader,
            attempt: None,
        }
    }

    /// The attempt the most recent passphrase belongs to, if any was handed out.
    pub fn attempt(&self) -> Option<Attempt> {
        self.attempt
    }

    /// Returns the next passphrase to try.
    ///
    /// Every call after the first means the previous passphrase was
    /// rejected. Once the retry has been rejected too, or the reader fails
    /// to provide a retry, this returns an authentication error.
    pub fn next_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        match self.attempt {
            None => {
                self.attempt = Some(Attempt::First);
                self.reader.read_passphrase()
            }
            Some(Attempt::First) => {
                warn!("Decryption failed. Check password");
                self.attempt = Some(Attempt::Retried);
                self.reader.read_passphrase().map_err(|e| {
                    GpgError::with_kind_and_source(
                        ErrorCategory::User,
                        ErrorKind::Authentication,
                        "wrong passphrase: no password available for retry",
                        e,
                    )
                })
            }
            Some(Attempt::Retried) => Err(GpgError::with_kind(
                ErrorCategory::User,
                ErrorKind::Authentication,
                "wrong passphrase: decryption failed after retry",
            )),
        }
    }
}
