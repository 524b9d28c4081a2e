//! OpenPGP packet framing
//!
//! Writes new-format packet headers with definite lengths and parses both
//! header formats, including new-format partial body lengths as produced
//! by streaming writers such as GnuPG.

use crate::error::{ErrorCategory, ErrorKind, GpgError, Result};
use std::borrow::Cow;
use std::io::Write;

/// Packet tags used by passphrase-encrypted messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    PublicKeyEncryptedSessionKey,
    SymKeyEncryptedSessionKey,
    CompressedData,
    SymEncryptedData,
    Marker,
    LiteralData,
    SymEncryptedIntegrityProtectedData,
    ModificationDetectionCode,
    AeadEncryptedData,
    Other(u8),
}

impl Tag {
    pub fn from_u8(tag: u8) -> Self {
        match tag {
            1 => Self::PublicKeyEncryptedSessionKey,
            3 => Self::SymKeyEncryptedSessionKey,
            8 => Self::CompressedData,
            9 => Self::SymEncryptedData,
            10 => Self::Marker,
            11 => Self::LiteralData,
            18 => Self::SymEncryptedIntegrityProtectedData,
            19 => Self::ModificationDetectionCode,
            20 => Self::AeadEncryptedData,
            other => Self::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::PublicKeyEncryptedSessionKey => 1,
            Self::SymKeyEncryptedSessionKey => 3,
            Self::CompressedData => 8,
            Self::SymEncryptedData => 9,
            Self::Marker => 10,
            Self::LiteralData => 11,
            Self::SymEncryptedIntegrityProtectedData => 18,
            Self::ModificationDetectionCode => 19,
            Self::AeadEncryptedData => 20,
            Self::Other(other) => other,
        }
    }

    /// Only data packets may be split into partial body chunks.
    fn allows_partial_length(self) -> bool {
        matches!(
            self,
            Self::CompressedData
                | Self::SymEncryptedData
                | Self::LiteralData
                | Self::SymEncryptedIntegrityProtectedData
                | Self::AeadEncryptedData
        )
    }
}

/// Bytes taken by a new-format header for a body of `body_len` bytes.
pub fn header_len(body_len: usize) -> usize {
    1 + match body_len {
        0..=191 => 1,
        192..=8383 => 2,
        _ => 5,
    }
}

/// Writes a new-format packet header with a definite body length.
///
/// Bodies must fit the 4-byte length form.
pub fn write_header<W: Write + ?Sized>(out: &mut W, tag: Tag, body_len: usize) -> Result<()> {
    let len = u32::try_from(body_len).map_err(|_| {
        GpgError::format(format!(
            "packet body of {} bytes exceeds the maximum definite length",
            body_len
        ))
    })?;

    let mut header = [0u8; 6];
    header[0] = 0xC0 | tag.to_u8();
    let n = match len {
        0..=191 => {
            header[1] = len as u8;
            2
        }
        192..=8383 => {
            let v = len - 192;
            header[1] = ((v >> 8) + 192) as u8;
            header[2] = v as u8;
            3
        }
        _ => {
            header[1] = 0xFF;
            header[2..6].copy_from_slice(&len.to_be_bytes());
            6
        }
    };
    out.write_all(&header[..n]).map_err(write_error)
}

/// Writes a complete packet.
pub fn write_packet<W: Write + ?Sized>(out: &mut W, tag: Tag, body: &[u8]) -> Result<()> {
    write_header(out, tag, body.len())?;
    out.write_all(body).map_err(write_error)
}

fn write_error(e: std::io::Error) -> GpgError {
    GpgError::with_kind_and_source(
        ErrorCategory::Internal,
        ErrorKind::Io,
        "failed to write packet",
        e,
    )
}

/// A parsed packet. The body borrows from the input unless it had to be
/// reassembled from partial chunks.
#[derive(Debug)]
pub struct Packet<'a> {
    pub tag: Tag,
    pub body: Cow<'a, [u8]>,
}

/// Sequential packet reader over an in-memory message.
pub struct PacketParser<'a> {
    input: &'a [u8],
    pos: usize,
}

enum BodyLength {
    Definite(usize),
    Partial(usize),
    Indeterminate,
}

impl<'a> PacketParser<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    /// True once every byte of input has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.input.len()
    }

    /// Returns the next packet, or `None` at end of input.
    pub fn next_packet(&mut self) -> Result<Option<Packet<'a>>> {
        if self.is_empty() {
            return Ok(None);
        }

        let ctb = self.take_byte("packet tag")?;
        if ctb & 0x80 == 0 {
            return Err(GpgError::format(format!(
                "invalid packet tag byte 0x{:02x}",
                ctb
            )));
        }

        let new_format = ctb & 0x40 != 0;
        let (tag, length) = if new_format {
            (ctb & 0x3F, self.new_format_length()?)
        } else {
            ((ctb >> 2) & 0x0F, self.old_format_length(ctb & 0x03)?)
        };
        if tag == 0 {
            return Err(GpgError::format("reserved packet tag 0"));
        }
        let tag = Tag::from_u8(tag);

        let body = match length {
            BodyLength::Definite(len) => Cow::Borrowed(self.take(len, "packet body")?),
            BodyLength::Indeterminate => {
                let input: &'a [u8] = self.input;
                let rest = &input[self.pos..];
                self.pos = self.input.len();
                Cow::Borrowed(rest)
            }
            BodyLength::Partial(first) => {
                if !tag.allows_partial_length() {
                    return Err(GpgError::format(format!(
                        "partial body length not allowed for packet tag {}",
                        tag.to_u8()
                    )));
                }
                let mut body = self.take(first, "partial packet body")?.to_vec();
                loop {
                    match self.new_format_length()? {
                        BodyLength::Partial(len) => {
                            body.extend_from_slice(self.take(len, "partial packet body")?);
                        }
                        BodyLength::Definite(len) => {
                            body.extend_from_slice(self.take(len, "partial packet body")?);
                            break;
                        }
                        BodyLength::Indeterminate => {
                            return Err(GpgError::format("invalid partial body length"));
                        }
                    }
                }
                Cow::Owned(body)
            }
        };

        Ok(Some(Packet { tag, body }))
    }

    fn new_format_length(&mut self) -> Result<BodyLength> {
        let first = self.take_byte("packet length")? as usize;
        match first {
            0..=191 => Ok(BodyLength::Definite(first)),
            192..=223 => {
                let second = self.take_byte("packet length")? as usize;
                Ok(BodyLength::Definite(((first - 192) << 8) + second + 192))
            }
            224..=254 => Ok(BodyLength::Partial(1 << (first & 0x1F))),
            _ => {
                let bytes = self.take(4, "packet length")?;
                let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Ok(BodyLength::Definite(len as usize))
            }
        }
    }

    fn old_format_length(&mut self, length_type: u8) -> Result<BodyLength> {
        match length_type {
            0 => Ok(BodyLength::Definite(
                self.take_byte("packet length")? as usize
            )),
            1 => {
                let bytes = self.take(2, "packet length")?;
                Ok(BodyLength::Definite(
                    u16::from_be_bytes([bytes[0], bytes[1]]) as usize,
                ))
            }
            2 => {
                let bytes = self.take(4, "packet length")?;
                let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Ok(BodyLength::Definite(len as usize))
            }
            _ => Ok(BodyLength::Indeterminate),
        }
    }

    fn take_byte(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let input: &'a [u8] = self.input;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= input.len())
            .ok_or_else(|| GpgError::format(format!("input truncated while reading {}", what)))?;
        let bytes = &input[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(tag: Tag, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        write_header(&mut out, tag, len).unwrap();
        out
    }

    #[test]
    fn test_length_encoding_boundaries() {
        assert_eq!(header(Tag::LiteralData, 0), [0xCB, 0x00]);
        assert_eq!(header(Tag::LiteralData, 191), [0xCB, 0xBF]);
        assert_eq!(header(Tag::LiteralData, 192), [0xCB, 0xC0, 0x00]);
        assert_eq!(header(Tag::LiteralData, 8383), [0xCB, 0xDF, 0xFF]);
        assert_eq!(
            header(Tag::LiteralData, 8384),
            [0xCB, 0xFF, 0x00, 0x00, 0x20, 0xC0]
        );
        assert_eq!(
            header(Tag::SymEncryptedIntegrityProtectedData, 100_000),
            [0xD2, 0xFF, 0x00, 0x01, 0x86, 0xA0]
        );
    }

    #[test]
    fn test_header_len_matches_written_header() {
        for len in [0, 191, 192, 8383, 8384, 1 << 20] {
            assert_eq!(header(Tag::LiteralData, len).len(), header_len(len));
        }
    }

    #[test]
    fn test_parse_written_packets() {
        let mut stream = Vec::new();
        for len in [0usize, 5, 191, 192, 8383, 8384] {
            write_packet(&mut stream, Tag::LiteralData, &vec![len as u8; len]).unwrap();
        }

        let mut parser = PacketParser::new(&stream);
        for len in [0usize, 5, 191, 192, 8383, 8384] {
            let packet = parser.next_packet().unwrap().unwrap();
            assert_eq!(packet.tag, Tag::LiteralData);
            assert_eq!(packet.body.len(), len);
            assert!(packet.body.iter().all(|&b| b == len as u8));
        }
        assert!(parser.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_parse_old_format_headers() {
        // Tag 11, one-byte length; then tag 3, two-byte length; then tag 10,
        // indeterminate length running to end of input.
        let stream = [
            0xAC, 0x02, b'h', b'i', //
            0x8D, 0x00, 0x01, 0x04, //
            0xAB, b'P', b'G', b'P',
        ];
        let mut parser = PacketParser::new(&stream);

        let p = parser.next_packet().unwrap().unwrap();
        assert_eq!(p.tag, Tag::LiteralData);
        assert_eq!(&p.body[..], b"hi");

        let p = parser.next_packet().unwrap().unwrap();
        assert_eq!(p.tag, Tag::SymKeyEncryptedSessionKey);
        assert_eq!(&p.body[..], [0x04]);

        let p = parser.next_packet().unwrap().unwrap();
        assert_eq!(p.tag, Tag::Marker);
        assert_eq!(&p.body[..], b"PGP");

        assert!(parser.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_parse_partial_body_lengths() {
        // 0xE1 = partial chunk of 2 bytes, 0xE0 = partial chunk of 1 byte,
        // then a definite final chunk of 3 bytes.
        let stream = [0xCB, 0xE1, 1, 2, 0xE0, 3, 0x03, 4, 5, 6];
        let mut parser = PacketParser::new(&stream);
        let p = parser.next_packet().unwrap().unwrap();
        assert_eq!(p.tag, Tag::LiteralData);
        assert_eq!(&p.body[..], [1, 2, 3, 4, 5, 6]);
        assert!(parser.is_empty());
    }

    #[test]
    fn test_partial_length_rejected_for_session_key_packet() {
        let stream = [0xC3, 0xE0, 4, 0x00];
        let err = PacketParser::new(&stream)
            .next_packet()
            .expect_err("expected format error");
        assert_eq!(err.kind, Some(ErrorKind::Format));
    }

    #[test]
    fn test_invalid_tag_byte() {
        let err = PacketParser::new(&[0x12, 0x00])
            .next_packet()
            .expect_err("expected format error");
        assert_eq!(err.kind, Some(ErrorKind::Format));
    }

    #[test]
    fn test_reserved_tag() {
        let err = PacketParser::new(&[0xC0, 0x00])
            .next_packet()
            .expect_err("expected format error");
        assert_eq!(err.kind, Some(ErrorKind::Format));
    }

    #[test]
    fn test_truncated_body() {
        let err = PacketParser::new(&[0xCB, 0x05, 1, 2])
            .next_packet()
            .expect_err("expected truncation");
        assert_eq!(err.kind, Some(ErrorKind::Format));
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_truncated_length() {
        let err = PacketParser::new(&[0xCB, 0xFF, 0x00])
            .next_packet()
            .expect_err("expected truncation");
        assert_eq!(err.kind, Some(ErrorKind::Format));
    }
}
