//! Payload codec for distributed document envelopes.
//!
//! Each distributed item arrives as a base64 `docZip` blob. The documented framing is gzip, but the
//! service has been seen sending zlib-wrapped and raw deflate streams too, so the framing is detected
//! rather than assumed.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use std::io::Read;
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
	#[error("Corrupt payload: {0}")]
	CorruptPayload(String),
}

/// Decode a base64 compressed envelope into raw XML bytes.
///
/// # Arguments
/// * `blob` - The base64 text of the envelope; embedded whitespace is ignored.
///
/// # Returns
/// The decompressed bytes, or `CorruptPayload` when the blob is not base64 or none of the supported
/// framings decode it.
pub fn decode(blob: &str) -> Result<Vec<u8>, CodecError> {
	let compact: String = blob.chars().filter(|c| !c.is_whitespace()).collect();
	let raw = STANDARD
		.decode(compact.as_bytes())
		.map_err(|e| CodecError::CorruptPayload(format!("invalid base64: {e}")))?;
	inflate(&raw)
}

/// Decompress raw envelope bytes, trying gzip (by magic), then zlib, then raw deflate.
pub fn inflate(raw: &[u8]) -> Result<Vec<u8>, CodecError> {
	if raw.is_empty() {
		return Err(CodecError::CorruptPayload("empty payload".into()));
	}

	if raw.starts_with(&GZIP_MAGIC) {
		if let Ok(out) = read_all(GzDecoder::new(raw)) {
			return Ok(out);
		}
	}
	if let Ok(out) = read_all(ZlibDecoder::new(raw)) {
		return Ok(out);
	}
	read_all(DeflateDecoder::new(raw)).map_err(|e| {
		CodecError::CorruptPayload(format!("no gzip, zlib or deflate framing matched: {e}"))
	})
}

fn read_all<R: Read>(mut reader: R) -> std::io::Result<Vec<u8>> {
	let mut out = Vec::new();
	reader.read_to_end(&mut out)?;
	if out.is_empty() {
		return Err(std::io::Error::new(
			std::io::ErrorKind::InvalidData,
			"decoded to nothing",
		));
	}
	Ok(out)
}
