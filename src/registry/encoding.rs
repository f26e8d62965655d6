//! Content/transfer encodings (spec §4.1): `identity`, `gzip`, `deflate`,
//! `br`, `base64`, `quoted-printable`.
//!
//! Distinct from `MediaType`: an encoding transforms a byte stream without
//! any notion of a parsed shape, and several may stack (`Content-Encoding:
//! br, base64` decodes right-to-left, per `Registry::decode`).

use std::io::{Read, Write};
use base64::Engine;
use flate2::Compression;
use flate2::read::{DeflateDecoder, DeflateEncoder, GzDecoder, GzEncoder};
use crate::error::WebError;

pub trait Encoding: Send + Sync {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, WebError>;
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, WebError>;
}

pub struct Identity;

impl Encoding for Identity {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, WebError> {
        Ok(data.to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, WebError> {
        Ok(data.to_vec())
    }
}

pub struct Gzip;

impl Encoding for Gzip {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, WebError> {
        let mut encoder = GzEncoder::new(data, Compression::default());
        let mut out = Vec::new();
        encoder.read_to_end(&mut out).map_err(|err| {
            WebError::internal_server_error(format!("gzip encode failed: {}", err))
        })?;
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, WebError> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(|err| {
            WebError::parse_error(format!("invalid gzip stream: {}", err))
        })?;
        Ok(out)
    }
}

pub struct Deflate;

impl Encoding for Deflate {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, WebError> {
        let mut encoder = DeflateEncoder::new(data, Compression::default());
        let mut out = Vec::new();
        encoder.read_to_end(&mut out).map_err(|err| {
            WebError::internal_server_error(format!("deflate encode failed: {}", err))
        })?;
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, WebError> {
        let mut decoder = DeflateDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(|err| {
            WebError::parse_error(format!("invalid deflate stream: {}", err))
        })?;
        Ok(out)
    }
}

pub struct Brotli;

impl Encoding for Brotli {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, WebError> {
        let mut out = Vec::new();
        let params = brotli::enc::BrotliEncoderParams::default();
        brotli::BrotliCompress(&mut std::io::Cursor::new(data), &mut out, &params).map_err(|err| {
            WebError::internal_server_error(format!("brotli encode failed: {}", err))
        })?;
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, WebError> {
        let mut out = Vec::new();
        brotli::BrotliDecompress(&mut std::io::Cursor::new(data), &mut out).map_err(|err| {
            WebError::parse_error(format!("invalid brotli stream: {}", err))
        })?;
        Ok(out)
    }
}

pub struct Base64;

impl Encoding for Base64 {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, WebError> {
        Ok(base64::engine::general_purpose::STANDARD.encode(data).into_bytes())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, WebError> {
        base64::engine::general_purpose::STANDARD.decode(data).map_err(|err| {
            WebError::parse_error(format!("invalid base64: {}", err))
        })
    }
}

pub struct QuotedPrintable;

impl Encoding for QuotedPrintable {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, WebError> {
        let mut out = Vec::with_capacity(data.len());
        for &byte in data {
            match byte {
                b'=' => out.extend_from_slice(b"=3D"),
                0x20..=0x7e => out.push(byte),
                b'\n' => out.push(b'\n'),
                b'\r' => out.push(b'\r'),
                _ => {
                    out.push(b'=');
                    out.extend_from_slice(format!("{:02X}", byte).as_bytes());
                }
            }
        }
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, WebError> {
        let mut out = Vec::with_capacity(data.len());
        let mut iter = data.iter().copied().peekable();
        while let Some(byte) = iter.next() {
            if byte != b'=' {
                out.push(byte);
                continue
            }
            match (iter.next(), iter.peek().copied()) {
                (Some(b'\r'), Some(b'\n')) => { iter.next(); }
                (Some(b'\n'), _) => {}
                (Some(hi), Some(lo)) => {
                    let value = hex_pair(hi, lo).ok_or_else(|| {
                        WebError::parse_error("invalid quoted-printable escape")
                    })?;
                    out.push(value);
                    iter.next();
                }
                _ => return Err(WebError::parse_error(
                    "truncated quoted-printable escape"
                )),
            }
        }
        Ok(out)
    }
}

fn hex_pair(hi: u8, lo: u8) -> Option<u8> {
    let hi = (hi as char).to_digit(16)?;
    let lo = (lo as char).to_digit(16)?;
    Some(((hi << 4) | lo) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let encoded = Gzip.encode(data).unwrap();
        assert_ne!(encoded, data);
        assert_eq!(Gzip.decode(&encoded).unwrap(), data);
    }

    #[test]
    fn base64_round_trips() {
        let data = b"\x00\x01hello\xff";
        let encoded = Base64.encode(data).unwrap();
        assert_eq!(Base64.decode(&encoded).unwrap(), data);
    }

    #[test]
    fn quoted_printable_round_trips_non_ascii() {
        let data = b"caf\xc3\xa9=end";
        let encoded = QuotedPrintable.encode(data).unwrap();
        assert_eq!(QuotedPrintable.decode(&encoded).unwrap(), data);
    }

    #[test]
    fn identity_is_a_no_op() {
        assert_eq!(Identity.encode(b"x").unwrap(), b"x");
        assert_eq!(Identity.decode(b"x").unwrap(), b"x");
    }
}
