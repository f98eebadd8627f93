//! Content-Encoding handling for displayed and edited bodies.
//!
//! Captured bodies are stored as received. Only the text shown to observers and
//! to the operator is decoded, and an edited body is encoded again before it
//! goes back on the wire.
use crate::errors::{Error, Result};
use bytes::Bytes;
#[cfg(feature = "gzip")]
use flate2::read::{DeflateDecoder, DeflateEncoder, GzDecoder, GzEncoder};
#[cfg(feature = "gzip")]
use flate2::Compression;
#[cfg(feature = "gzip")]
use std::io::Read;

/// A content coding the proxy knows how to undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
  /// no transformation
  Identity,
  /// gzip
  Gzip,
  /// zlib-less deflate
  Deflate,
}

impl ContentCoding {
  /// Resolve a `Content-Encoding` header value. A missing header is `Identity`.
  pub fn from_header(value: Option<&str>) -> Result<Self> {
    let value = value.map(|v| v.trim().to_ascii_lowercase()).unwrap_or_default();
    match value.as_str() {
      "" | "identity" => Ok(ContentCoding::Identity),
      #[cfg(feature = "gzip")]
      "gzip" | "x-gzip" => Ok(ContentCoding::Gzip),
      #[cfg(feature = "gzip")]
      "deflate" => Ok(ContentCoding::Deflate),
      _ => Err(Error::UnsupportedEncoding(value)),
    }
  }

  /// Undo the coding.
  pub fn decode(&self, body: &Bytes) -> Result<Bytes> {
    match self {
      ContentCoding::Identity => Ok(body.clone()),
      #[cfg(feature = "gzip")]
      ContentCoding::Gzip => {
        let mut out = Vec::new();
        GzDecoder::new(&body[..]).read_to_end(&mut out)?;
        Ok(Bytes::from(out))
      }
      #[cfg(feature = "gzip")]
      ContentCoding::Deflate => {
        let mut out = Vec::new();
        DeflateDecoder::new(&body[..]).read_to_end(&mut out)?;
        Ok(Bytes::from(out))
      }
      #[cfg(not(feature = "gzip"))]
      other => Err(Error::UnsupportedEncoding(format!("{:?}", other))),
    }
  }

  /// Apply the coding.
  pub fn encode(&self, body: &Bytes) -> Result<Bytes> {
    match self {
      ContentCoding::Identity => Ok(body.clone()),
      #[cfg(feature = "gzip")]
      ContentCoding::Gzip => {
        let mut out = Vec::new();
        GzEncoder::new(&body[..], Compression::default()).read_to_end(&mut out)?;
        Ok(Bytes::from(out))
      }
      #[cfg(feature = "gzip")]
      ContentCoding::Deflate => {
        let mut out = Vec::new();
        DeflateEncoder::new(&body[..], Compression::default()).read_to_end(&mut out)?;
        Ok(Bytes::from(out))
      }
      #[cfg(not(feature = "gzip"))]
      other => Err(Error::UnsupportedEncoding(format!("{:?}", other))),
    }
  }
}

/// Text to display for a body carrying the given `Content-Encoding`.
///
/// Falls back to the raw bytes when the coding is unknown or the payload does
/// not decode.
pub fn display_text(content_encoding: Option<&str>, body: &Bytes) -> String {
  let decoded = ContentCoding::from_header(content_encoding).and_then(|c| c.decode(body));
  match decoded {
    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
    Err(err) => {
      tracing::debug!("showing raw body: {}", err);
      String::from_utf8_lossy(body).into_owned()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn identity_when_header_missing() {
    assert_eq!(ContentCoding::from_header(None).unwrap(), ContentCoding::Identity);
    assert_eq!(
      ContentCoding::from_header(Some(" Identity ")).unwrap(),
      ContentCoding::Identity
    );
  }

  #[test]
  fn unknown_coding_is_rejected_but_displayed_raw() {
    assert!(matches!(
      ContentCoding::from_header(Some("br")),
      Err(Error::UnsupportedEncoding(_))
    ));
    let body = Bytes::from_static(b"raw payload");
    assert_eq!(display_text(Some("br"), &body), "raw payload");
  }

  #[cfg(feature = "gzip")]
  #[test]
  fn gzip_body_is_displayed_decoded() {
    let plain = Bytes::from_static(b"{\"hello\":\"world\"}");
    let packed = ContentCoding::Gzip.encode(&plain).unwrap();
    assert_ne!(packed, plain);
    assert_eq!(display_text(Some("gzip"), &packed), "{\"hello\":\"world\"}");
  }

  #[cfg(feature = "gzip")]
  #[test]
  fn deflate_decodes_what_it_encodes() {
    let plain = Bytes::from_static(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    let coding = ContentCoding::from_header(Some("deflate")).unwrap();
    let packed = coding.encode(&plain).unwrap();
    assert_eq!(coding.decode(&packed).unwrap(), plain);
  }

  #[cfg(feature = "gzip")]
  #[test]
  fn corrupt_gzip_falls_back_to_raw() {
    let body = Bytes::from_static(b"not gzip at all");
    assert_eq!(display_text(Some("gzip"), &body), "not gzip at all");
  }
}
