//! OpenPGP String-to-Key (S2K) passphrase derivation
//!
//! Turns a passphrase into a symmetric key using the salted, iterated
//! hashing scheme from RFC 4880 section 3.7. The wire form of the
//! parameters is:
//! - specifier type: 1 byte (0 simple, 1 salted, 3 iterated and salted)
//! - hash algorithm: 1 byte
//! - salt: 8 bytes (types 1 and 3)
//! - coded iteration count: 1 byte (type 3)

use crate::error::{GpgError, Result};
use rand::{CryptoRng, RngCore};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

/// Length of salt in bytes
pub const SALT_LEN: usize = 8;

/// Coded count used when none is configured: 65536 hashed bytes.
pub const DEFAULT_CODED_COUNT: u8 = 0x60;

const TYPE_SIMPLE: u8 = 0;
const TYPE_SALTED: u8 = 1;
const TYPE_ITERATED: u8 = 3;

/// Hash algorithms usable for key derivation, with their OpenPGP ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
    Sha224,
}

impl HashAlgorithm {
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            2 => Ok(Self::Sha1),
            8 => Ok(Self::Sha256),
            9 => Ok(Self::Sha384),
            10 => Ok(Self::Sha512),
            11 => Ok(Self::Sha224),
            _ => Err(GpgError::unsupported(format!(
                "unsupported S2K hash algorithm {}",
                id
            ))),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Self::Sha1 => 2,
            Self::Sha256 => 8,
            Self::Sha384 => 9,
            Self::Sha512 => 10,
            Self::Sha224 => 11,
        }
    }
}

/// S2K specifier as carried in a session key packet.
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

impl S2k {
    /// Iterated and salted SHA-256 with a fresh random salt.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R, coded_count: u8) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rng.fill_bytes(&mut salt);
        Self::iterated(salt, coded_count)
    }

    /// Iterated and salted SHA-256 with the given salt.
    pub fn iterated(salt: [u8; SALT_LEN], coded_count: u8) -> Self {
        Self::Iterated {
            hash: HashAlgorithm::Sha256,
            salt,
            coded_count,
        }
    }

    pub fn hash(&self) -> HashAlgorithm {
        match self {
            Self::Simple { hash } | Self::Salted { hash, .. } | Self::Iterated { hash, .. } => {
                *hash
            }
        }
    }

    /// Appends the wire form of the specifier to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Simple { hash } => {
                out.extend_from_slice(&[TYPE_SIMPLE, hash.id()]);
            }
            Self::Salted { hash, salt } => {
                out.extend_from_slice(&[TYPE_SALTED, hash.id()]);
                out.extend_from_slice(salt);
            }
            Self::Iterated {
                hash,
                salt,
                coded_count,
            } => {
                out.extend_from_slice(&[TYPE_ITERATED, hash.id()]);
                out.extend_from_slice(salt);
                out.push(*coded_count);
            }
        }
    }

    /// Parses a specifier from the start of `input`, returning it along with
    /// the number of bytes consumed.
    pub fn parse(input: &[u8]) -> Result<(Self, usize)> {
        let (&kind, rest) = input
            .split_first()
            .ok_or_else(|| GpgError::format("input truncated while reading S2K type"))?;
        let (&hash_id, rest) = rest
            .split_first()
            .ok_or_else(|| GpgError::format("input truncated while reading S2K hash"))?;

        // Reject unknown specifier types before the hash so that GnuPG's
        // private extensions report the type, not a bogus hash id.
        if !matches!(kind, TYPE_SIMPLE | TYPE_SALTED | TYPE_ITERATED) {
            return Err(GpgError::unsupported(format!(
                "unsupported S2K specifier type {}",
                kind
            )));
        }
        let hash = HashAlgorithm::from_id(hash_id)?;

        if kind == TYPE_SIMPLE {
            return Ok((Self::Simple { hash }, 2));
        }

        let salt: [u8; SALT_LEN] = rest
            .get(..SALT_LEN)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| GpgError::format("input truncated while reading S2K salt"))?;

        if kind == TYPE_SALTED {
            return Ok((Self::Salted { hash, salt }, 2 + SALT_LEN));
        }

        let coded_count = *rest
            .get(SALT_LEN)
            .ok_or_else(|| GpgError::format("input truncated while reading S2K count"))?;
        Ok((
            Self::Iterated {
                hash,
                salt,
                coded_count,
            },
            3 + SALT_LEN,
        ))
    }

    /// Derives a `key_len` byte key from `passphrase`.
    pub fn derive_key(&self, passphrase: &[u8], key_len: usize) -> Zeroizing<Vec<u8>> {
        let (salt, count): (&[u8], usize) = match self {
            Self::Simple { .. } => (&[], 0),
            Self::Salted { salt, .. } => (&salt[..], 0),
            Self::Iterated {
                salt, coded_count, ..
            } => (&salt[..], decode_count(*coded_count)),
        };

        match self.hash() {
            HashAlgorithm::Sha1 => derive_with::<Sha1>(passphrase, salt, count, key_len),
            HashAlgorithm::Sha256 => derive_with::<Sha256>(passphrase, salt, count, key_len),
            HashAlgorithm::Sha384 => derive_with::<Sha384>(passphrase, salt, count, key_len),
            HashAlgorithm::Sha512 => derive_with::<Sha512>(passphrase, salt, count, key_len),
            HashAlgorithm::Sha224 => derive_with::<Sha224>(passphrase, salt, count, key_len),
        }
    }
}

/// Number of bytes hashed for a coded iteration count.
pub fn decode_count(coded: u8) -> usize {
    (16 + (coded & 15) as usize) << ((coded >> 4) + 6)
}

/// Smallest coded count hashing at least `bytes` bytes, saturating at 0xFF.
pub fn encode_count(bytes: usize) -> u8 {
    (0..=u8::MAX)
        .find(|&coded| decode_count(coded) >= bytes)
        .unwrap_or(u8::MAX)
}

fn derive_with<D: Digest>(
    passphrase: &[u8],
    salt: &[u8],
    count: usize,
    key_len: usize,
) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(Vec::with_capacity(key_len));
    let mut preload = 0;

    // Each context beyond the first is preloaded with one more zero byte,
    // so keys longer than the digest are built from distinct hashes.
    while key.len() < key_len {
        let mut hasher = D::new();
        for _ in 0..preload {
            hasher.update([0u8]);
        }
        feed(&mut hasher, passphrase, salt, count);
        let digest = hasher.finalize();

        let take = (key_len - key.len()).min(digest.len());
        key.extend_from_slice(&digest[..take]);
        preload += 1;
    }

    key
}

/// Hashes `salt || passphrase` repeatedly until `count` bytes have been
/// fed, but never less than one full copy.
fn feed<D: Digest>(hasher: &mut D, passphrase: &[u8], salt: &[u8], count: usize) {
    let unit = salt.len() + passphrase.len();
    if unit == 0 {
        return;
    }
    let total = count.max(unit);

    for _ in 0..total / unit {
        hasher.update(salt);
        hasher.update(passphrase);
    }

    let remainder = total % unit;
    if remainder <= salt.len() {
        hasher.update(&salt[..remainder]);
    } else {
        hasher.update(salt);
        hasher.update(&passphrase[..remainder - salt.len()]);
    }
}
