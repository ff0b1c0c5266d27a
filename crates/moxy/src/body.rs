//! Tolerant content decoding for buffered bodies.
//!
//! Decoding never fails visibly: a missing, wrong, or lying
//! `content-encoding` hint falls back to the raw bytes as-is. Running the
//! decoder over already-decoded data therefore yields the data unchanged,
//! which makes the operation idempotent.

use std::borrow::Cow;
use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use tracing::debug;

/// Decode `raw` according to a `content-encoding` hint.
///
/// Supported encodings: `gzip` (and `x-gzip`), `deflate` in both its
/// zlib-wrapped and raw forms, and `identity`. Anything else, or a payload
/// that does not actually carry the claimed encoding, returns the raw bytes.
pub fn decode_content<'a>(raw: &'a [u8], hint: Option<&str>) -> Cow<'a, [u8]> {
    let encoding = match hint {
        Some(value) => value.trim().to_ascii_lowercase(),
        None => return Cow::Borrowed(raw),
    };

    match encoding.as_str() {
        "gzip" | "x-gzip" => decode_gzip(raw),
        "deflate" => decode_deflate(raw),
        "identity" | "" => Cow::Borrowed(raw),
        other => {
            debug!(encoding = other, "unrecognized content-encoding, exposing raw bytes");
            Cow::Borrowed(raw)
        }
    }
}

fn decode_gzip(raw: &[u8]) -> Cow<'_, [u8]> {
    let mut out = Vec::new();
    match GzDecoder::new(raw).read_to_end(&mut out) {
        Ok(_) => Cow::Owned(out),
        Err(error) => {
            debug!(%error, "gzip decode failed, exposing raw bytes");
            Cow::Borrowed(raw)
        }
    }
}

// "deflate" on the wire is zlib-wrapped per RFC 9110, but plenty of clients
// send the raw DEFLATE stream instead. Try zlib first, then the raw form.
fn decode_deflate(raw: &[u8]) -> Cow<'_, [u8]> {
    let mut out = Vec::new();
    if ZlibDecoder::new(raw).read_to_end(&mut out).is_ok() {
        return Cow::Owned(out);
    }

    out.clear();
    match DeflateDecoder::new(raw).read_to_end(&mut out) {
        Ok(_) => Cow::Owned(out),
        Err(error) => {
            debug!(%error, "deflate decode failed, exposing raw bytes");
            Cow::Borrowed(raw)
        }
    }
}
