//! CLI integration tests
//!
//! Tests the command-line interface end-to-end.

use flate2::read::GzDecoder;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

/// Smallest iteration count, so key derivation does not dominate test time.
const FAST_S2K: &str = "1024";

fn simple_gpg() -> Command {
    Command::new(env!("CARGO_BIN_EXE_simple-gpg"))
}

/// Run simple-gpg in `dir` with the password piped through stdin
fn run_in_dir(dir: &Path, args: &[&str], password: &str) -> Output {
    let mut child = simple_gpg()
        .current_dir(dir)
        .arg("--password-stdin")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn simple-gpg");

    {
        let stdin = child.stdin.as_mut().expect("failed to open stdin");
        // Ignore BrokenPipe errors - the command may exit before reading stdin
        // if it encounters an error (e.g., file not found)
        let _ = stdin.write_all(password.as_bytes());
    }
    drop(child.stdin.take());

    child.wait_with_output().expect("failed to wait for simple-gpg")
}

fn run_with_password(args: &[&str], password: &str) -> Output {
    run_in_dir(&std::env::temp_dir(), args, password)
}

fn encrypt_args<'a>(input: &'a str, output: &'a str) -> Vec<&'a str> {
    vec!["--s2k-count", FAST_S2K, "-o", output, input]
}

fn assert_success(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "{} failed: {}",
        what,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Get path to testdata directory
fn testdata_path(filename: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("testdata");
    path.push(filename);
    path
}

/// Decrypt a message produced by GnuPG: old-format headers, ZLIB
/// compression and an indeterminate-length compressed packet.
#[test]
fn test_decrypt_gnupg_message() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("hello-decrypted.txt");

    let result = run_with_password(
        &[
            "-d",
            "-o",
            output.to_str().unwrap(),
            testdata_path("hello.txt.gpg").to_str().unwrap(),
        ],
        "test",
    );
    assert_success(&result, "decrypt");

    let decrypted = fs::read(&output).unwrap();
    let expected = fs::read(testdata_path("hello.txt")).unwrap();
    assert_eq!(decrypted, expected);
}

/// GnuPG output from a pipe: partial body lengths, ZIP compression,
/// AES-128 with a SHA-1 S2K.
#[test]
fn test_decrypt_gnupg_partial_lengths() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("random.bin");

    let result = run_with_password(
        &[
            "--decrypt",
            "--output-file",
            output.to_str().unwrap(),
            testdata_path("random.bin.gpg").to_str().unwrap(),
        ],
        "test",
    );
    assert_success(&result, "decrypt");

    assert_eq!(
        fs::read(&output).unwrap(),
        fs::read(testdata_path("random.bin")).unwrap()
    );
}

#[test]
fn test_encrypt_decrypt_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let plaintext_path = testdata_path("hello.txt");
    let encrypted_path = temp_dir.path().join("hello-encrypted.txt.gpg");
    let decrypted_path = temp_dir.path().join("hello-decrypted.txt");

    let result = run_with_password(
        &encrypt_args(
            plaintext_path.to_str().unwrap(),
            encrypted_path.to_str().unwrap(),
        ),
        "test",
    );
    assert_success(&result, "encrypt");
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("Encrypting:"), "{}", stderr);
    assert!(stderr.contains("Encryption successful:"), "{}", stderr);

    let result = run_with_password(
        &[
            "-d",
            "-o",
            decrypted_path.to_str().unwrap(),
            encrypted_path.to_str().unwrap(),
        ],
        "test",
    );
    assert_success(&result, "decrypt");
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("Decryption successful:"), "{}", stderr);

    let original = fs::read(&plaintext_path).unwrap();
    let decrypted = fs::read(&decrypted_path).unwrap();
    assert_eq!(original, decrypted);
}

#[test]
fn test_default_output_names() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("accounts.pdf"), b"%PDF-1.4 totals").unwrap();

    let result = run_in_dir(
        temp_dir.path(),
        &["--s2k-count", FAST_S2K, "accounts.pdf"],
        "secret-word",
    );
    assert_success(&result, "encrypt");
    assert!(temp_dir.path().join("accounts.pdf.gpg").exists());

    let result = run_in_dir(temp_dir.path(), &["-d", "accounts.pdf.gpg"], "secret-word");
    assert_success(&result, "decrypt");
    assert_eq!(
        fs::read(temp_dir.path().join("decrypted-accounts.pdf")).unwrap(),
        b"%PDF-1.4 totals"
    );
}

#[test]
fn test_directory_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let tree = temp_dir.path().join("photos");
    fs::create_dir_all(tree.join("sub")).unwrap();
    fs::write(tree.join("a.txt"), b"hello").unwrap();
    fs::write(tree.join("sub").join("b.txt"), b"world").unwrap();

    let result = run_in_dir(
        temp_dir.path(),
        &["--s2k-count", FAST_S2K, "photos/"],
        "test",
    );
    assert_success(&result, "encrypt");
    assert!(temp_dir.path().join("photos.tar.gz.gpg").exists());

    let result = run_in_dir(temp_dir.path(), &["-d", "photos.tar.gz.gpg"], "test");
    assert_success(&result, "decrypt");

    let archive = fs::read(temp_dir.path().join("decrypted-photos.tar.gz")).unwrap();
    let out = temp_dir.path().join("extracted");
    tar::Archive::new(GzDecoder::new(archive.as_slice()))
        .unpack(&out)
        .unwrap();
    assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"hello");
    assert_eq!(fs::read(out.join("sub").join("b.txt")).unwrap(), b"world");
}

#[test]
fn test_wrong_password_fails() {
    let temp_dir = TempDir::new().unwrap();
    let plaintext = temp_dir.path().join("plain.txt");
    let encrypted = temp_dir.path().join("plain.txt.gpg");
    let decrypted = temp_dir.path().join("decrypted.txt");

    fs::write(&plaintext, "Original").unwrap();
    let result = run_with_password(
        &encrypt_args(plaintext.to_str().unwrap(), encrypted.to_str().unwrap()),
        "correct_password",
    );
    assert_success(&result, "encrypt");

    let result = run_with_password(
        &[
            "-d",
            "-o",
            decrypted.to_str().unwrap(),
            encrypted.to_str().unwrap(),
        ],
        "wrong_password",
    );

    assert_eq!(result.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("Decryption failed. Check password"), "{}", stderr);
    assert!(
        stderr.contains("wrong passphrase"),
        "Expected error message about the passphrase, got: {}",
        stderr
    );
    assert!(!decrypted.exists());
}

#[test]
fn test_tampered_message_fails() {
    let temp_dir = TempDir::new().unwrap();
    let plaintext = temp_dir.path().join("plain.txt");
    let encrypted = temp_dir.path().join("plain.txt.gpg");
    let decrypted = temp_dir.path().join("decrypted.txt");

    fs::write(&plaintext, "pay 100 to alice").unwrap();
    let result = run_with_password(
        &encrypt_args(plaintext.to_str().unwrap(), encrypted.to_str().unwrap()),
        "test",
    );
    assert_success(&result, "encrypt");

    let mut bytes = fs::read(&encrypted).unwrap();
    let last = bytes.len() - 5;
    bytes[last] ^= 0x80;
    fs::write(&encrypted, &bytes).unwrap();

    let result = run_with_password(
        &[
            "-d",
            "-o",
            decrypted.to_str().unwrap(),
            encrypted.to_str().unwrap(),
        ],
        "test",
    );
    assert_eq!(result.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("modification detection code"), "{}", stderr);
    assert!(!decrypted.exists());
}

#[test]
fn test_decrypt_nonexistent_file_fails() {
    let temp_dir = TempDir::new().unwrap();
    let nonexistent = temp_dir.path().join("nonexistent.gpg");
    let output = temp_dir.path().join("output.txt");

    let result = run_with_password(
        &[
            "-d",
            "-o",
            output.to_str().unwrap(),
            nonexistent.to_str().unwrap(),
        ],
        "test",
    );

    assert_eq!(result.status.code(), Some(4));
    assert!(!output.exists());
}

#[test]
fn test_cipher_selection() {
    let temp_dir = TempDir::new().unwrap();
    let plaintext = temp_dir.path().join("plain.txt");
    fs::write(&plaintext, "cipher choice").unwrap();

    // Session key packet body starts at offset 2: version, cipher id.
    for (name, id) in [("AES", 7u8), ("AES192", 8), ("AES256", 9)] {
        let encrypted = temp_dir.path().join(format!("{}.gpg", name));
        let mut args = encrypt_args(plaintext.to_str().unwrap(), encrypted.to_str().unwrap());
        args.extend(["--cipher-algo", name]);

        let result = run_with_password(&args, "test");
        assert_success(&result, name);
        let bytes = fs::read(&encrypted).unwrap();
        assert_eq!(bytes[3], id, "{}", name);
    }
}

#[test]
fn test_unknown_cipher_falls_back_with_warning() {
    let temp_dir = TempDir::new().unwrap();
    let plaintext = temp_dir.path().join("plain.txt");
    let encrypted = temp_dir.path().join("plain.txt.gpg");
    fs::write(&plaintext, "cipher choice").unwrap();

    let mut args = encrypt_args(plaintext.to_str().unwrap(), encrypted.to_str().unwrap());
    args.extend(["--cipher-algo", "TWOFISH"]);
    let result = run_with_password(&args, "test");

    assert_success(&result, "encrypt");
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(
        stderr.contains("Unknown cipher TWOFISH provided. Using AES256 as default"),
        "{}",
        stderr
    );
    assert_eq!(fs::read(&encrypted).unwrap()[3], 9);
}

#[test]
fn test_password_flag() {
    let temp_dir = TempDir::new().unwrap();
    let plaintext = temp_dir.path().join("plain.txt");
    let encrypted = temp_dir.path().join("plain.txt.gpg");
    let decrypted = temp_dir.path().join("decrypted.txt");
    fs::write(&plaintext, "from the command line").unwrap();

    let result = simple_gpg()
        .args(["--password", "secret-word", "--s2k-count", FAST_S2K, "-o"])
        .arg(&encrypted)
        .arg(&plaintext)
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert_success(&result, "encrypt");

    let result = simple_gpg()
        .args(["--password", "secret-word", "-d", "-o"])
        .arg(&decrypted)
        .arg(&encrypted)
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert_success(&result, "decrypt");
    assert_eq!(fs::read(&decrypted).unwrap(), b"from the command line");
}

#[test]
fn test_missing_input_argument_is_usage_error() {
    let result = simple_gpg().stdin(Stdio::null()).output().unwrap();
    assert_eq!(result.status.code(), Some(2));
}

#[test]
fn test_help_lists_usage_examples() {
    let result = simple_gpg().arg("--help").output().unwrap();
    assert!(result.status.success());
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.contains("simple-gpg -d accounts.pdf.gpg"), "{}", stdout);
    assert!(stdout.contains("simple-gpg --password"), "{}", stdout);
    assert!(stdout.contains("photos.tar.gz.gpg"), "{}", stdout);
    assert!(stdout.contains("tar -xzf"), "{}", stdout);
}

#[test]
fn test_empty_file_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let plaintext = temp_dir.path().join("empty.txt");
    let encrypted = temp_dir.path().join("empty.txt.gpg");
    let decrypted = temp_dir.path().join("empty-decrypted.txt");

    fs::write(&plaintext, b"").unwrap();

    let result = run_with_password(
        &encrypt_args(plaintext.to_str().unwrap(), encrypted.to_str().unwrap()),
        "test",
    );
    assert_success(&result, "encrypt");

    let result = run_with_password(
        &[
            "-d",
            "-o",
            decrypted.to_str().unwrap(),
            encrypted.to_str().unwrap(),
        ],
        "test",
    );

    assert_success(&result, "decrypt");
    let content = fs::read(&decrypted).unwrap();
    assert_eq!(content, b"");
}

#[test]
fn test_large_file_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let plaintext = temp_dir.path().join("large.bin");
    let encrypted = temp_dir.path().join("large.bin.gpg");
    let decrypted = temp_dir.path().join("large-decrypted.bin");

    let large_content: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    fs::write(&plaintext, &large_content).unwrap();

    let result = run_with_password(
        &encrypt_args(plaintext.to_str().unwrap(), encrypted.to_str().unwrap()),
        "test",
    );
    assert_success(&result, "encrypt");

    let result = run_with_password(
        &[
            "-d",
            "-o",
            decrypted.to_str().unwrap(),
            encrypted.to_str().unwrap(),
        ],
        "test",
    );

    assert_success(&result, "decrypt");
    let decrypted_content = fs::read(&decrypted).unwrap();
    assert_eq!(decrypted_content, large_content);
}
