//! Passphrase-encrypted OpenPGP messages
//!
//! An encrypted message is:
//! - a version 4 Symmetric-Key Encrypted Session Key packet carrying the
//!   cipher id and S2K parameters (the derived key is the message key)
//! - a version 1 Symmetrically Encrypted Integrity Protected Data packet
//!   whose CFB-encrypted body is `prefix || literal packet || MDC packet`
//!
//! The MDC packet is `0xD3 0x14` followed by the SHA-1 of everything before
//! its last 20 bytes, including the prefix and its own two header bytes.

use crate::cipher::{self, Cfb, PREFIX_LEN, SymmetricAlgorithm};
use crate::error::{ErrorCategory, ErrorKind, GpgError, Result};
use crate::packet::{self, PacketParser, Tag};
use crate::passphrase::PassphrasePrompt;
use crate::s2k::{self, S2k};
use flate2::read::{DeflateDecoder, ZlibDecoder};
use rand::{CryptoRng, RngCore};
use sha1::{Digest, Sha1};
use std::io::{Read, Write};
use tracing::debug;
use zeroize::Zeroizing;

const SKESK_VERSION: u8 = 4;
const SEIPD_VERSION: u8 = 1;

/// Header bytes of the MDC packet: new-format tag 19, length 20.
const MDC_HEADER: [u8; 2] = [0xD3, 0x14];
const MDC_DIGEST_LEN: usize = 20;
const MDC_PACKET_LEN: usize = MDC_HEADER.len() + MDC_DIGEST_LEN;

/// Format byte, filename length, 4-byte date.
const LITERAL_HEADER_LEN: usize = 6;
const LITERAL_FORMAT_BINARY: u8 = b'b';

/// Nesting allowed for compressed packets inside the encrypted body.
const MAX_COMPRESSION_DEPTH: usize = 8;

/// Parameters for encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptOptions {
    pub cipher: SymmetricAlgorithm,
    /// Coded S2K iteration count, see [`s2k::decode_count`].
    pub s2k_count: u8,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        Self {
            cipher: SymmetricAlgorithm::default(),
            s2k_count: s2k::DEFAULT_CODED_COUNT,
        }
    }
}

/// Contents of the Literal Data packet of a decrypted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralData {
    /// `b` for binary, `t`/`u` for text.
    pub format: u8,
    pub filename: Vec<u8>,
    /// Seconds since the epoch, 0 if unset.
    pub date: u32,
    pub data: Vec<u8>,
}

/// Encrypt plaintext with a passphrase using a random salt and prefix
pub fn encrypt<R: RngCore + CryptoRng>(
    passphrase: &[u8],
    plaintext: &[u8],
    options: &EncryptOptions,
    rng: &mut R,
) -> Result<Vec<u8>> {
    let s2k = S2k::generate(rng, options.s2k_count);
    let prefix = cipher::random_prefix(rng);
    encrypt_deterministic(passphrase, plaintext, options.cipher, &s2k, &prefix)
}

/// Encrypt plaintext with a passphrase using the provided S2K parameters and prefix
///
/// This function is ONLY for testing purposes to generate deterministic output.
/// NEVER use this in production - always use `encrypt()` which generates a random
/// salt and prefix.
pub fn encrypt_deterministic(
    passphrase: &[u8],
    plaintext: &[u8],
    cipher: SymmetricAlgorithm,
    s2k: &S2k,
    prefix: &[u8; PREFIX_LEN],
) -> Result<Vec<u8>> {
    let session_key = s2k.derive_key(passphrase, cipher.key_len());
    let mut output = Vec::with_capacity(plaintext.len() + 64);
    write_encrypted_stream(&mut output, &session_key, s2k, cipher, plaintext, prefix)?;
    Ok(output)
}

/// Writes the complete packet sequence for `plaintext` encrypted under
/// `session_key`, which must have been derived with `s2k`.
pub fn write_encrypted_stream<W: Write + ?Sized>(
    output: &mut W,
    session_key: &[u8],
    s2k: &S2k,
    cipher: SymmetricAlgorithm,
    plaintext: &[u8],
    prefix: &[u8; PREFIX_LEN],
) -> Result<()> {
    let mut skesk = vec![SKESK_VERSION, cipher.id()];
    s2k.encode(&mut skesk);
    packet::write_packet(output, Tag::SymKeyEncryptedSessionKey, &skesk)?;

    let literal_len = LITERAL_HEADER_LEN + plaintext.len();
    let mut body = Vec::with_capacity(
        PREFIX_LEN + packet::header_len(literal_len) + literal_len + MDC_PACKET_LEN,
    );
    body.extend_from_slice(prefix);
    packet::write_header(&mut body, Tag::LiteralData, literal_len)?;
    body.extend_from_slice(&[LITERAL_FORMAT_BINARY, 0, 0, 0, 0, 0]);
    body.extend_from_slice(plaintext);
    body.extend_from_slice(&MDC_HEADER);
    let mdc = Sha1::digest(&body);
    body.extend_from_slice(&mdc);

    Cfb::new(cipher, session_key)?.encrypt(&mut body);

    packet::write_header(
        output,
        Tag::SymEncryptedIntegrityProtectedData,
        1 + body.len(),
    )?;
    output
        .write_all(&[SEIPD_VERSION])
        .and_then(|()| output.write_all(&body))
        .map_err(|e| {
            GpgError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to write encrypted data",
                e,
            )
        })
}

/// Decrypt a message, asking `prompt` for passphrases
pub fn decrypt(input: &[u8], prompt: &mut PassphrasePrompt<'_>) -> Result<LiteralData> {
    read_encrypted_stream(input, prompt)
}

/// Parses, unlocks, decrypts and verifies a passphrase-encrypted message.
pub fn read_encrypted_stream(
    input: &[u8],
    prompt: &mut PassphrasePrompt<'_>,
) -> Result<LiteralData> {
    let mut parser = PacketParser::new(input);
    let mut session_key_packet = None;
    let mut encrypted = None;

    while let Some(packet) = parser.next_packet()? {
        debug!(tag = packet.tag.to_u8(), len = packet.body.len(), "read packet");
        match packet.tag {
            Tag::Marker => {}
            Tag::SymKeyEncryptedSessionKey => {
                if session_key_packet.is_none() {
                    session_key_packet = Some(SessionKeyPacket::parse(&packet.body)?);
                } else {
                    debug!("ignoring additional session key packet");
                }
            }
            Tag::SymEncryptedIntegrityProtectedData => {
                encrypted = Some(packet.body);
                break;
            }
            Tag::PublicKeyEncryptedSessionKey => {
                return Err(GpgError::unsupported(
                    "public-key encrypted messages are not supported",
                ));
            }
            Tag::SymEncryptedData => {
                return Err(GpgError::unsupported(
                    "encrypted data without integrity protection is not supported",
                ));
            }
            Tag::AeadEncryptedData => {
                return Err(GpgError::unsupported(
                    "AEAD encrypted data is not supported",
                ));
            }
            other => {
                return Err(GpgError::format(format!(
                    "unexpected packet tag {} in encrypted message",
                    other.to_u8()
                )));
            }
        }
    }

    if !parser.is_empty() {
        return Err(GpgError::format(
            "invalid input: unexpected data after encrypted data packet",
        ));
    }
    let session_key_packet = session_key_packet
        .ok_or_else(|| GpgError::format("no passphrase-encrypted session key packet"))?;
    let encrypted = encrypted
        .ok_or_else(|| GpgError::format("no integrity-protected encrypted data packet"))?;

    let (&version, ciphertext) = encrypted
        .split_first()
        .ok_or_else(|| GpgError::format("empty encrypted data packet"))?;
    if version != SEIPD_VERSION {
        return Err(GpgError::format(format!(
            "unsupported encrypted data packet version {}",
            version
        )));
    }
    if ciphertext.len() < PREFIX_LEN {
        return Err(GpgError::format(
            "input likely truncated while reading encrypted data prefix",
        ));
    }

    let (cipher, session_key) = unlock(&session_key_packet, ciphertext, prompt)?;

    let mut plaintext = ciphertext.to_vec();
    Cfb::new(cipher, &session_key)?.decrypt(&mut plaintext);
    drop(session_key);

    let inner = verify_mdc(&plaintext)?;
    parse_inner(inner, 0)
}

/// Finds a passphrase whose key passes the quick-check.
fn unlock(
    session_key_packet: &SessionKeyPacket,
    ciphertext: &[u8],
    prompt: &mut PassphrasePrompt<'_>,
) -> Result<(SymmetricAlgorithm, Zeroizing<Vec<u8>>)> {
    loop {
        let passphrase = prompt.next_passphrase()?;
        let Some((cipher, key)) = session_key_packet.session_key(&passphrase)? else {
            debug!("session key did not decrypt under this passphrase");
            continue;
        };

        let mut head = [0u8; PREFIX_LEN];
        head.copy_from_slice(&ciphertext[..PREFIX_LEN]);
        Cfb::new(cipher, &key)?.decrypt(&mut head);
        if cipher::quick_check(&head) {
            return Ok((cipher, key));
        }
        debug!("quick-check failed");
    }
}

/// Checks the MDC trailer of a decrypted body and returns the packets
/// between the prefix and the MDC.
fn verify_mdc(plaintext: &[u8]) -> Result<&[u8]> {
    if plaintext.len() < PREFIX_LEN + MDC_PACKET_LEN {
        return Err(integrity_error(
            "decrypted data too short to hold a modification detection code",
        ));
    }
    let (covered, digest) = plaintext.split_at(plaintext.len() - MDC_DIGEST_LEN);
    if !covered.ends_with(&MDC_HEADER) {
        return Err(integrity_error("modification detection code missing"));
    }
    if Sha1::digest(covered).as_slice() != digest {
        return Err(integrity_error(
            "modification detection code mismatch; data was tampered with or truncated",
        ));
    }
    Ok(&covered[PREFIX_LEN..covered.len() - MDC_HEADER.len()])
}

fn integrity_error(msg: &str) -> GpgError {
    GpgError::with_kind(ErrorCategory::User, ErrorKind::Integrity, msg)
}

/// Parses the decrypted packets down to the single literal packet.
fn parse_inner(data: &[u8], depth: usize) -> Result<LiteralData> {
    let mut parser = PacketParser::new(data);
    let mut literal = None;

    while let Some(packet) = parser.next_packet()? {
        if literal.is_some() {
            return Err(GpgError::format(
                "unexpected packet after literal data packet",
            ));
        }
        match packet.tag {
            Tag::Marker => {}
            Tag::LiteralData => literal = Some(parse_literal(&packet.body)?),
            Tag::CompressedData => {
                if depth >= MAX_COMPRESSION_DEPTH {
                    return Err(GpgError::format("compressed data nested too deeply"));
                }
                let decompressed = decompress(&packet.body)?;
                literal = Some(parse_inner(&decompressed, depth + 1)?);
            }
            other => {
                return Err(GpgError::format(format!(
                    "unexpected packet tag {} inside encrypted data",
                    other.to_u8()
                )));
            }
        }
    }

    literal.ok_or_else(|| GpgError::format("encrypted data contains no literal data packet"))
}

fn parse_literal(body: &[u8]) -> Result<LiteralData> {
    let truncated = || GpgError::format("input truncated while reading literal data packet");

    let (&format, rest) = body.split_first().ok_or_else(truncated)?;
    let (&name_len, rest) = rest.split_first().ok_or_else(truncated)?;
    let name_len = name_len as usize;
    if rest.len() < name_len + 4 {
        return Err(truncated());
    }
    let (filename, rest) = rest.split_at(name_len);
    let (date, data) = rest.split_at(4);

    Ok(LiteralData {
        format,
        filename: filename.to_vec(),
        date: u32::from_be_bytes([date[0], date[1], date[2], date[3]]),
        data: data.to_vec(),
    })
}

fn decompress(body: &[u8]) -> Result<Vec<u8>> {
    let (&algorithm, compressed) = body
        .split_first()
        .ok_or_else(|| GpgError::format("empty compressed data packet"))?;

    let mut out = Vec::new();
    let result = match algorithm {
        0 => {
            out.extend_from_slice(compressed);
            Ok(0)
        }
        1 => DeflateDecoder::new(compressed).read_to_end(&mut out),
        2 => ZlibDecoder::new(compressed).read_to_end(&mut out),
        _ => {
            return Err(GpgError::unsupported(format!(
                "unsupported compression algorithm {}",
                algorithm
            )));
        }
    };
    result.map_err(|e| {
        GpgError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::Format,
            "failed to decompress data",
            e,
        )
    })?;
    Ok(out)
}

/// Version 4 Symmetric-Key Encrypted Session Key packet.
struct SessionKeyPacket {
    cipher: SymmetricAlgorithm,
    s2k: S2k,
    /// Empty when the S2K-derived key is the message key.
    encrypted_key: Vec<u8>,
}

impl SessionKeyPacket {
    fn parse(body: &[u8]) -> Result<Self> {
        let (&version, rest) = body
            .split_first()
            .ok_or_else(|| GpgError::format("empty session key packet"))?;
        if version != SKESK_VERSION {
            return Err(GpgError::format(format!(
                "unsupported session key packet version {}",
                version
            )));
        }
        let (&cipher_id, rest) = rest
            .split_first()
            .ok_or_else(|| GpgError::format("input truncated while reading session key cipher"))?;
        let cipher = SymmetricAlgorithm::from_id(cipher_id)?;
        let (s2k, consumed) = S2k::parse(rest)?;

        Ok(Self {
            cipher,
            s2k,
            encrypted_key: rest[consumed..].to_vec(),
        })
    }

    /// Message cipher and key for `passphrase`, or `None` when an encrypted
    /// session key does not decrypt to anything sensible.
    fn session_key(
        &self,
        passphrase: &[u8],
    ) -> Result<Option<(SymmetricAlgorithm, Zeroizing<Vec<u8>>)>> {
        let key = self.s2k.derive_key(passphrase, self.cipher.key_len());
        if self.encrypted_key.is_empty() {
            return Ok(Some((self.cipher, key)));
        }

        let mut decrypted = Zeroizing::new(self.encrypted_key.clone());
        Cfb::new(self.cipher, &key)?.decrypt(&mut decrypted);
        let Some((&cipher_id, session_key)) = decrypted.split_first() else {
            return Ok(None);
        };
        match SymmetricAlgorithm::from_id(cipher_id) {
            Ok(cipher) if cipher.key_len() == session_key.len() => {
                Ok(Some((cipher, Zeroizing::new(session_key.to_vec()))))
            }
            _ => Ok(None),
        }
    }
}
