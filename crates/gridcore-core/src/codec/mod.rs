//! Wire codec: base64, gzip, MD5, and the filename-suffix envelope.
//!
//! Files travel inside JSON bodies as text, so binary payloads are wrapped
//! in a suffix-driven envelope: `name[.gz][.b64]`. Encoding optionally
//! gzips (appending `.gz`) and always base64-encodes last (appending
//! `.b64`); decoding strips suffixes right-to-left applying the inverse
//! transform. The grammar lives here and nowhere else.

use std::io::Read;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::{GzDecoder, GzEncoder};
use md5::{Digest, Md5};
use thiserror::Error;

/// Errors produced while decoding wire payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Illegal characters or truncated base64 input.
    #[error("malformed base64 payload: {0}")]
    MalformedBase64(String),

    /// Corrupt or truncated gzip stream.
    #[error("malformed gzip payload: {0}")]
    MalformedGzip(String),
}

/// Encodes bytes as standard base64 with no line terminators.
#[must_use]
pub fn b64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decodes base64 text, tolerating interleaved ASCII whitespace.
///
/// # Errors
///
/// Returns [`CodecError::MalformedBase64`] on illegal characters or
/// truncated input.
pub fn b64_decode(text: &str) -> Result<Vec<u8>, CodecError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| CodecError::MalformedBase64(e.to_string()))
}

/// Compresses bytes into the gzip wire format.
#[must_use]
pub fn gz_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(data, Compression::default());
    let mut out = Vec::with_capacity(data.len() / 2 + 32);
    // Reading from a slice-backed encoder cannot fail.
    encoder
        .read_to_end(&mut out)
        .expect("gzip compression of an in-memory buffer");
    out
}

/// Decompresses a gzip stream.
///
/// # Errors
///
/// Returns [`CodecError::MalformedGzip`] if the stream is corrupt or
/// truncated.
pub fn gz_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2 + 32);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::MalformedGzip(e.to_string()))?;
    Ok(out)
}

/// Returns the 32-character lowercase hex MD5 digest of `data`.
#[must_use]
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Wraps a file for transmission.
///
/// If `gzip` is true the data is compressed and `.gz` appended; the result
/// is always base64-encoded with `.b64` appended last. Returns the wire
/// filename and the text payload.
#[must_use]
pub fn encode_file(name: &str, data: &[u8], gzip: bool) -> (String, String) {
    let mut wire_name = name.to_string();
    let mut payload = data.to_vec();
    if gzip {
        payload = gz_compress(&payload);
        wire_name.push_str(".gz");
    }
    let text = b64_encode(&payload);
    wire_name.push_str(".b64");
    (wire_name, text)
}

/// Unwraps a received file.
///
/// Strips recognized suffixes right-to-left, applying the inverse
/// transformation for each, and stops at the first unrecognized suffix.
/// Unwrapping an already-unwrapped name is a fixed point.
///
/// # Errors
///
/// Returns [`CodecError`] if a recognized suffix wraps malformed data.
pub fn decode_file(name: &str, payload: &[u8]) -> Result<(String, Vec<u8>), CodecError> {
    let mut logical = name.to_string();
    let mut data = payload.to_vec();
    loop {
        if let Some(stripped) = logical.strip_suffix(".b64") {
            let text = String::from_utf8_lossy(&data);
            data = b64_decode(&text)?;
            logical = stripped.to_string();
        } else if let Some(stripped) = logical.strip_suffix(".gz") {
            data = gz_decompress(&data)?;
            logical = stripped.to_string();
        } else {
            return Ok((logical, data));
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    // Gzipped + base64'd "Hello World", produced by the reference stack.
    const HELLO_GZ_B64: &str = "H4sIAEnM6VIC//NIzcnJVwjPL8pJAQBWsRdKCwAAAA==";

    #[test]
    fn test_decode_gz_b64_hello_world() {
        let bytes = b64_decode(HELLO_GZ_B64).unwrap();
        let text = gz_decompress(&bytes).unwrap();
        assert_eq!(text, b"Hello World");
    }

    #[test]
    fn test_reencode_hello_world_round_trip() {
        let (wire_name, text) = encode_file("greeting.txt", b"Hello World", true);
        assert_eq!(wire_name, "greeting.txt.gz.b64");
        let (logical, data) = decode_file(&wire_name, text.as_bytes()).unwrap();
        assert_eq!(logical, "greeting.txt");
        assert_eq!(data, b"Hello World");
    }

    #[test]
    fn test_md5_hex_abc() {
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_b64_decode_tolerates_whitespace() {
        let encoded = "SGVs\nbG8g\r\nV29y bGQ=";
        assert_eq!(b64_decode(encoded).unwrap(), b"Hello World");
    }

    #[test]
    fn test_b64_decode_rejects_illegal_characters() {
        assert!(matches!(
            b64_decode("not!!legal~base64"),
            Err(CodecError::MalformedBase64(_))
        ));
    }

    #[test]
    fn test_gz_decompress_rejects_garbage() {
        assert!(matches!(
            gz_decompress(b"definitely not gzip"),
            Err(CodecError::MalformedGzip(_))
        ));
    }

    #[test]
    fn test_unwrap_is_fixed_point_on_plain_names() {
        let (logical, data) = decode_file("state.json", b"{}").unwrap();
        assert_eq!(logical, "state.json");
        assert_eq!(data, b"{}");
    }

    #[test]
    fn test_encode_without_gzip_appends_only_b64() {
        let (wire_name, text) = encode_file("frames.trj", &[0u8, 1, 2, 255], false);
        assert_eq!(wire_name, "frames.trj.b64");
        let (logical, data) = decode_file(&wire_name, text.as_bytes()).unwrap();
        assert_eq!(logical, "frames.trj");
        assert_eq!(data, vec![0u8, 1, 2, 255]);
    }

    proptest! {
        #[test]
        fn b64_round_trip(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let encoded = b64_encode(&data);
            prop_assert_eq!(b64_decode(&encoded).unwrap(), data);
        }

        #[test]
        fn b64_output_has_no_line_terminators(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let encoded = b64_encode(&data);
            prop_assert!(!encoded.bytes().any(|b| b == 0x0A || b == 0x0D));
        }

        #[test]
        fn gz_round_trip(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            prop_assert_eq!(gz_decompress(&gz_compress(&data)).unwrap(), data);
        }

        #[test]
        fn composed_envelope_round_trip(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            gzip in any::<bool>(),
        ) {
            let (wire_name, text) = encode_file("payload.bin", &data, gzip);
            let (logical, decoded) = decode_file(&wire_name, text.as_bytes()).unwrap();
            prop_assert_eq!(logical, "payload.bin");
            prop_assert_eq!(decoded, data);
        }
    }
}
