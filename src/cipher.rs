//! AES in OpenPGP's CFB mode
//!
//! Integrity-protected OpenPGP data is encrypted as one continuous CFB
//! stream with an all-zero IV. The IV is never transmitted; instead the
//! plaintext starts with a random block followed by a repeat of its last
//! two bytes, which lets a reader reject a wrong key after decrypting just
//! the first 18 bytes.

use crate::error::{ErrorCategory, ErrorKind, GpgError, Result};
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256, Block};
use rand::{CryptoRng, RngCore};
use tracing::warn;
use zeroize::Zeroize;

/// Block size shared by every supported cipher.
pub const BLOCK_SIZE: usize = 16;

/// Random block plus the two quick-check bytes.
pub const PREFIX_LEN: usize = BLOCK_SIZE + 2;

/// Symmetric ciphers supported for encryption and decryption, with their
/// OpenPGP ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymmetricAlgorithm {
    Aes128,
    Aes192,
    #[default]
    Aes256,
}

impl SymmetricAlgorithm {
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            7 => Ok(Self::Aes128),
            8 => Ok(Self::Aes192),
            9 => Ok(Self::Aes256),
            _ => Err(GpgError::unsupported(format!(
                "unsupported symmetric cipher {}",
                id
            ))),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Self::Aes128 => 7,
            Self::Aes192 => 8,
            Self::Aes256 => 9,
        }
    }

    /// Session key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// Command line name of the cipher.
    pub fn name(self) -> &'static str {
        match self {
            Self::Aes128 => "AES",
            Self::Aes192 => "AES192",
            Self::Aes256 => "AES256",
        }
    }

    /// Looks up a cipher by its command line name.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "AES" => Some(Self::Aes128),
            "AES192" => Some(Self::Aes192),
            "AES256" => Some(Self::Aes256),
            _ => None,
        }
    }

    /// Like [`Self::parse_name`], but unknown names fall back to the default
    /// cipher with a warning.
    pub fn from_name_or_default(name: &str) -> Self {
        Self::parse_name(name).unwrap_or_else(|| {
            let fallback = Self::default();
            warn!(
                "Unknown cipher {} provided. Using {} as default",
                name,
                fallback.name()
            );
            fallback
        })
    }
}

enum BlockCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl BlockCipher {
    fn new(algorithm: SymmetricAlgorithm, key: &[u8]) -> Result<Self> {
        let cipher = match algorithm {
            SymmetricAlgorithm::Aes128 => Aes128::new_from_slice(key).map(Self::Aes128),
            SymmetricAlgorithm::Aes192 => Aes192::new_from_slice(key).map(Self::Aes192),
            SymmetricAlgorithm::Aes256 => Aes256::new_from_slice(key).map(Self::Aes256),
        };
        cipher.map_err(|e| {
            GpgError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                format!(
                    "{} byte key does not fit {}",
                    key.len(),
                    algorithm.name()
                ),
                e,
            )
        })
    }

    fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        let block = Block::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.encrypt_block(block),
            Self::Aes192(c) => c.encrypt_block(block),
            Self::Aes256(c) => c.encrypt_block(block),
        }
    }
}

/// CFB stream state. Encrypting or decrypting in several calls produces the
/// same bytes as a single call over the concatenated input.
pub struct Cfb {
    cipher: BlockCipher,
    /// Previous ciphertext block, filled in as bytes are produced.
    register: [u8; BLOCK_SIZE],
    keystream: [u8; BLOCK_SIZE],
    used: usize,
}

impl Cfb {
    /// Starts a stream with the implicit all-zero IV.
    pub fn new(algorithm: SymmetricAlgorithm, key: &[u8]) -> Result<Self> {
        Ok(Self {
            cipher: BlockCipher::new(algorithm, key)?,
            register: [0u8; BLOCK_SIZE],
            keystream: [0u8; BLOCK_SIZE],
            used: BLOCK_SIZE,
        })
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let k = self.next_keystream_byte();
            *byte ^= k;
            self.register[self.used - 1] = *byte;
        }
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let k = self.next_keystream_byte();
            self.register[self.used - 1] = *byte;
            *byte ^= k;
        }
    }

    fn next_keystream_byte(&mut self) -> u8 {
        if self.used == BLOCK_SIZE {
            self.keystream = self.register;
            self.cipher.encrypt_block(&mut self.keystream);
            self.used = 0;
        }
        let k = self.keystream[self.used];
        self.used += 1;
        k
    }
}

impl Drop for Cfb {
    fn drop(&mut self) {
        self.register.zeroize();
        self.keystream.zeroize();
    }
}

/// Random prefix block followed by a repeat of its last two bytes.
pub fn random_prefix<R: RngCore + CryptoRng>(rng: &mut R) -> [u8; PREFIX_LEN] {
    let mut random = [0u8; BLOCK_SIZE];
    rng.fill_bytes(&mut random);
    prefix_from_block(&random)
}

/// Builds the prefix for a given random block.
pub fn prefix_from_block(random: &[u8; BLOCK_SIZE]) -> [u8; PREFIX_LEN] {
    let mut prefix = [0u8; PREFIX_LEN];
    prefix[..BLOCK_SIZE].copy_from_slice(random);
    prefix[BLOCK_SIZE] = random[BLOCK_SIZE - 2];
    prefix[BLOCK_SIZE + 1] = random[BLOCK_SIZE - 1];
    prefix
}

/// True if a decrypted prefix repeats its check bytes, i.e. the key is
/// very likely correct.
pub fn quick_check(prefix: &[u8; PREFIX_LEN]) -> bool {
    prefix[BLOCK_SIZE - 2..BLOCK_SIZE] == prefix[BLOCK_SIZE..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn counting(n: u8) -> Vec<u8> {
        (0..n).collect()
    }

    #[test]
    fn test_known_ciphertext_all_key_sizes() {
        // Zero IV full-block CFB, 40 bytes so the last block is partial.
        let cases = [
            (
                SymmetricAlgorithm::Aes128,
                "c6a03934838a5d8567468b69adc5d676a59b0277ccb9bf8cc1a95a409958eba40ab0d3d6b96ba8d4",
            ),
            (
                SymmetricAlgorithm::Aes192,
                "916353811876a325cb9fdc2c340c980849c204cd925a6f4996f3d10e1993c96193bbafcd60736eae",
            ),
            (
                SymmetricAlgorithm::Aes256,
                "f29102b52e4c99d7a1fa9061d123798f8af4819cc14fd031e0499c25bf6d87cb83381f33abcff67f",
            ),
        ];

        for (algorithm, expected) in cases {
            let key = counting(algorithm.key_len() as u8);
            let mut data = counting(40);
            Cfb::new(algorithm, &key).unwrap().encrypt(&mut data);
            assert_eq!(hex(&data), expected, "{:?}", algorithm);

            Cfb::new(algorithm, &key).unwrap().decrypt(&mut data);
            assert_eq!(data, counting(40));
        }
    }

    #[test]
    fn test_chunked_matches_single_pass() {
        let key = [0x11u8; 32];
        let plaintext = vec![0x5Au8; 100];

        let mut whole = plaintext.clone();
        Cfb::new(SymmetricAlgorithm::Aes256, &key)
            .unwrap()
            .encrypt(&mut whole);

        let mut chunked = plaintext.clone();
        let mut cfb = Cfb::new(SymmetricAlgorithm::Aes256, &key).unwrap();
        let (a, rest) = chunked.split_at_mut(7);
        let (b, c) = rest.split_at_mut(18);
        cfb.encrypt(a);
        cfb.encrypt(b);
        cfb.encrypt(c);

        assert_eq!(whole, chunked);

        let mut cfb = Cfb::new(SymmetricAlgorithm::Aes256, &key).unwrap();
        let (head, tail) = chunked.split_at_mut(PREFIX_LEN);
        cfb.decrypt(head);
        cfb.decrypt(tail);
        assert_eq!(chunked, plaintext);
    }

    #[test]
    fn test_wrong_key_length_is_rejected() {
        let result = Cfb::new(SymmetricAlgorithm::Aes256, &[0u8; 16]);
        let err = result.err().expect("expected key length error");
        assert_eq!(err.kind, Some(ErrorKind::InternalInvariant));
    }

    #[test]
    fn test_prefix_quick_check() {
        let mut rng = StdRng::seed_from_u64(1);
        let prefix = random_prefix(&mut rng);
        assert!(quick_check(&prefix));
        assert_eq!(prefix[14..16], prefix[16..18]);

        let mut broken = prefix;
        broken[17] ^= 1;
        assert!(!quick_check(&broken));
    }

    #[test]
    fn test_cipher_ids_and_key_lengths() {
        assert_eq!(SymmetricAlgorithm::Aes128.id(), 7);
        assert_eq!(SymmetricAlgorithm::Aes192.id(), 8);
        assert_eq!(SymmetricAlgorithm::Aes256.id(), 9);
        assert_eq!(SymmetricAlgorithm::from_id(8).unwrap().key_len(), 24);

        let err = SymmetricAlgorithm::from_id(3).expect_err("CAST5 is not supported");
        assert_eq!(err.kind, Some(ErrorKind::UnsupportedAlgorithm));
    }

    #[test]
    fn test_cipher_names() {
        assert_eq!(
            SymmetricAlgorithm::from_name_or_default("AES").key_len(),
            16
        );
        assert_eq!(
            SymmetricAlgorithm::from_name_or_default("AES192").key_len(),
            24
        );
        assert_eq!(
            SymmetricAlgorithm::from_name_or_default("AES256").key_len(),
            32
        );
    }

    #[test]
    fn test_unknown_cipher_name_falls_back() {
        assert_eq!(SymmetricAlgorithm::parse_name("TWOFISH"), None);
        assert_eq!(SymmetricAlgorithm::parse_name("aes"), None);
        assert_eq!(
            SymmetricAlgorithm::from_name_or_default("TWOFISH"),
            SymmetricAlgorithm::Aes256
        );
    }
}
