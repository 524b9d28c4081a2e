//! simple-gpg CLI - Passphrase-based OpenPGP encryption
//!
//! Encrypts a file or directory into a standard OpenPGP message that GnuPG
//! can decrypt with `gpg --decrypt`, and decrypts such messages.

use clap::Parser;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::error::Error as StdError;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

use simple_gpg::cipher::SymmetricAlgorithm;
use simple_gpg::error::{ErrorKind, GpgError};
use simple_gpg::file_ops::{self, Direction, Request};
use simple_gpg::message::EncryptOptions;
use simple_gpg::passphrase::{
    CachingPassphraseReader, ConstantPassphraseReader, PassphraseReader, ReaderPassphraseReader,
    TerminalPassphraseReader,
};
use simple_gpg::s2k;

const EXIT_FAILURE: i32 = 1;
const EXIT_CRYPTO: i32 = 3;
const EXIT_IO: i32 = 4;

const USAGE_EXAMPLES: &str = "\
Examples:
  Encrypt a file, prompting for the password:
    simple-gpg accounts.pdf
  Encrypt with the password given on the command line:
    simple-gpg --password 'correct horse' accounts.pdf
  Decrypt, writing decrypted-accounts.pdf:
    simple-gpg -d accounts.pdf.gpg
  Encrypt a folder into photos.tar.gz.gpg:
    simple-gpg photos/

A decrypted folder is a tar.gz archive; unpack it with `tar -xzf`.
Outputs can also be decrypted with `gpg --decrypt`.";

#[derive(Parser)]
#[command(name = "simple-gpg")]
#[command(version)]
#[command(
    about = "Passphrase-based OpenPGP encryption of files and directories.",
    long_about = None,
    after_help = USAGE_EXAMPLES
)]
struct Cli {
    /// File or directory to encrypt, or file to decrypt
    #[arg(value_name = "PATH")]
    input: PathBuf,

    /// Decrypt the input instead of encrypting it
    #[arg(short, long)]
    decrypt: bool,

    /// Cipher algorithm to be used. Choose one of AES, AES192, AES256
    #[arg(long, value_name = "NAME", default_value = "AES256")]
    cipher_algo: String,

    /// Password to use when encrypting/decrypting
    #[arg(long, value_name = "PASSWORD", conflicts_with = "password_stdin")]
    password: Option<String>,

    /// Read the password from stdin (verbatim, including any trailing newline)
    #[arg(long)]
    password_stdin: bool,

    /// Path for the output file [default: <PATH>.gpg, <DIR>.tar.gz.gpg or decrypted-<NAME>]
    #[arg(short, long, value_name = "FILE")]
    output_file: Option<PathBuf>,

    /// Bytes hashed during key derivation, rounded up to the nearest encodable count
    #[arg(long, value_name = "BYTES")]
    s2k_count: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let direction = if cli.decrypt {
        Direction::Decrypt
    } else {
        Direction::Encrypt
    };
    let options = match direction {
        Direction::Encrypt => EncryptOptions {
            cipher: SymmetricAlgorithm::from_name_or_default(&cli.cipher_algo),
            s2k_count: cli
                .s2k_count
                .map(s2k::encode_count)
                .unwrap_or(s2k::DEFAULT_CODED_COUNT),
        },
        Direction::Decrypt => EncryptOptions::default(),
    };
    let request = Request {
        input: cli.input,
        output: cli.output_file,
        direction,
        options,
    };

    let mut reader = get_passphrase_reader(cli.password, cli.password_stdin);
    let mut rng = StdRng::from_entropy();

    if let Err(e) = file_ops::run(&request, &mut *reader, &mut rng) {
        eprintln!("Error: {}", error_chain(&e));
        process::exit(exit_code(&e));
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .init();
}

fn get_passphrase_reader(password: Option<String>, use_stdin: bool) -> Box<dyn PassphraseReader> {
    match password {
        Some(password) => Box::new(ConstantPassphraseReader::new(password.into_bytes())),
        None if use_stdin => Box::new(CachingPassphraseReader::new(Box::new(
            ReaderPassphraseReader::new(Box::new(std::io::stdin())),
        ))),
        None => Box::new(TerminalPassphraseReader::new()),
    }
}

/// The error message followed by each source, separated by `: `.
fn error_chain(err: &GpgError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

fn exit_code(err: &GpgError) -> i32 {
    match err.kind {
        Some(
            ErrorKind::Format
            | ErrorKind::Authentication
            | ErrorKind::Integrity
            | ErrorKind::UnsupportedAlgorithm,
        ) => EXIT_CRYPTO,
        Some(ErrorKind::Io) => EXIT_IO,
        _ => EXIT_FAILURE,
    }
}
