//! proxy error
use bytes::Bytes;
use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `pilot_mitm::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while intercepting traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  /// io Error
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(#[from] http::Error),
  #[error(transparent)]
  #[cfg(feature = "tls")]
  /// tls Error
  Tls(#[from] tokio_rustls::rustls::Error),
  /// The start-line or the headers of a message could not be parsed.
  ///
  /// The bytes read so far are kept for diagnostics.
  #[error("malformed message: {reason}")]
  MalformedMessage {
    /// what went wrong
    reason: String,
    /// raw bytes as read off the wire
    raw: Bytes,
  },
  /// The upstream server refused the connection or the handshake failed.
  #[error("upstream {target} unavailable: {reason}")]
  UpstreamUnavailable {
    /// host:port
    target: String,
    /// cause
    reason: String,
  },
  /// The upstream server did not answer in time.
  #[error("upstream {0} timed out")]
  UpstreamTimeout(String),
  /// Operator text that does not re-parse into a message.
  #[error("invalid editable text: {0}")]
  InvalidEditableText(String),
  /// Two requests were given the same pair id.
  #[error("pair id {0} is already in use")]
  PairingCollision(String),
  /// No held flow with this id.
  #[error("flow {0} is not held")]
  FlowNotFound(u64),
  /// The held flow went away before the decision could be delivered.
  #[error("flow {0} was closed while waiting")]
  FlowClosed(u64),
  /// Content-Encoding this build cannot decode.
  #[error("unsupported content encoding: {0}")]
  UnsupportedEncoding(String),
  /// Configuration could not be loaded or is invalid.
  #[error("config: {0}")]
  Config(String),
  /// Certificate material could not be loaded.
  #[error("certificate: {0}")]
  Certificate(String),
}

impl Error {
  /// Create a malformed message error and log it
  pub fn malformed(reason: impl Into<String>, raw: impl Into<Bytes>) -> Self {
    let raw = raw.into();
    let error = Error::MalformedMessage {
      reason: reason.into(),
      raw,
    };
    tracing::warn!("Malformed message: {}", error);
    error
  }

  /// Create an upstream unavailable error and log it
  pub fn upstream_unavailable(target: impl Into<String>, reason: impl ToString) -> Self {
    let error = Error::UpstreamUnavailable {
      target: target.into(),
      reason: reason.to_string(),
    };
    tracing::error!("Upstream error: {}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Whether the error is local to the operator edit and the hold is still in place.
  pub fn is_recoverable_edit(&self) -> bool {
    matches!(self, Error::InvalidEditableText(_))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<toml::de::Error> for Error {
  fn from(value: toml::de::Error) -> Self {
    Error::Config(value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::Io(std::io::Error::new(error_kind, msg))
}
