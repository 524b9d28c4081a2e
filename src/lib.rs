//! simple-gpg - Passphrase-based OpenPGP file and directory encryption

#![forbid(unsafe_code)]

pub mod archive;
pub mod cipher;
pub mod error;
pub mod file_ops;
pub mod message;
pub mod packet;
pub mod passphrase;
pub mod s2k;
