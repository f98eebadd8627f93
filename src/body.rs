use std::fmt;
use std::ops::Deref;

use bytes::Bytes;

/// Payload of a captured message, kept as the exact bytes seen on the wire
/// (after transfer decoding).
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Body {
  inner: Bytes,
}

impl Body {
  /// An empty body.
  pub fn empty() -> Self {
    Self::default()
  }
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&str> for Body {
  #[inline]
  fn from(s: &str) -> Body {
    Body {
      inner: Bytes::copy_from_slice(s.as_bytes()),
    }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Debug::fmt(s, f),
      Err(_err) => write!(f, "b\"{}\"", self.inner.escape_ascii()),
    }
  }
}

impl fmt::Display for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Display::fmt(s, f),
      Err(_err) => write!(f, "{}", self.inner.escape_ascii()),
    }
  }
}
