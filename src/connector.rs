//! Opening the upstream leg of a flow.
use crate::config::UpstreamConfig;
use crate::errors::{Error, Result};
use crate::socket::MaybeTlsStream;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
#[cfg(feature = "tls")]
use tokio_rustls::rustls::pki_types::ServerName;
#[cfg(feature = "tls")]
use tokio_rustls::TlsConnector;

/// Transport of an upstream target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
  /// plaintext
  Http,
  /// TLS
  Https,
}

impl Scheme {
  fn default_port(&self) -> u16 {
    match self {
      Scheme::Http => 80,
      Scheme::Https => 443,
    }
  }
}

/// Where a request goes, derived from its absolute url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
  /// transport
  pub scheme: Scheme,
  /// host name or address, without brackets
  pub host: String,
  /// port, defaulted from the scheme
  pub port: u16,
}

impl Target {
  /// Parse `http://host[:port]/...` or `https://...`.
  pub fn from_url(url: &str) -> Result<Target> {
    let uri: http::Uri = url.parse()?;
    let scheme = match uri.scheme_str() {
      Some(s) if s.eq_ignore_ascii_case("http") => Scheme::Http,
      Some(s) if s.eq_ignore_ascii_case("https") => Scheme::Https,
      other => {
        return Err(Error::upstream_unavailable(
          url,
          format!("unsupported scheme {:?}", other.unwrap_or_default()),
        ))
      }
    };
    let host = uri
      .host()
      .filter(|h| !h.is_empty())
      .ok_or_else(|| Error::upstream_unavailable(url, "url has no host"))?
      .trim_start_matches('[')
      .trim_end_matches(']')
      .to_string();
    let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());
    Ok(Target { scheme, host, port })
  }

  /// `host:port`, bracketing IPv6 literals.
  pub fn authority(&self) -> String {
    if self.host.contains(':') {
      format!("[{}]:{}", self.host, self.port)
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.authority())
  }
}

/// Opens one fresh upstream connection per flow.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Duration,
  #[cfg(feature = "tls")]
  tls: TlsConnector,
}

impl fmt::Debug for Connector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .finish()
  }
}

impl Connector {
  /// Connector for the given upstream settings.
  pub fn new(config: &UpstreamConfig) -> Result<Self> {
    #[cfg(feature = "tls")]
    let tls = TlsConnector::from(std::sync::Arc::new(
      crate::tls::upstream_client_config(config.verify_certificates)?,
    ));
    Ok(Connector {
      connect_timeout: config.connect_timeout(),
      #[cfg(feature = "tls")]
      tls,
    })
  }

  /// Plain TCP to `host:port`, bounded by the connect timeout.
  pub async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
    let authority = format!("{}:{}", host, port);
    let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
      .await
      .map_err(|_| Error::UpstreamTimeout(authority.clone()))?
      .map_err(|e| Error::upstream_unavailable(&authority, e))?;
    stream.set_nodelay(true)?;
    Ok(stream)
  }

  /// Connect to `target`, with a TLS handshake for `https`.
  pub async fn connect(&self, target: &Target) -> Result<MaybeTlsStream> {
    let stream = self.connect_tcp(&target.host, target.port).await?;
    match target.scheme {
      Scheme::Http => Ok(MaybeTlsStream::Tcp(stream)),
      #[cfg(feature = "tls")]
      Scheme::Https => {
        let domain = ServerName::try_from(target.host.clone())
          .map_err(|e| Error::upstream_unavailable(target.authority(), e))?;
        let tls = tokio::time::timeout(self.connect_timeout, self.tls.connect(domain, stream))
          .await
          .map_err(|_| Error::UpstreamTimeout(target.authority()))?
          .map_err(|e| Error::upstream_unavailable(target.authority(), e))?;
        Ok(MaybeTlsStream::Tls(Box::new(tls)))
      }
      #[cfg(not(feature = "tls"))]
      Scheme::Https => Err(Error::upstream_unavailable(
        target.authority(),
        "built without tls support",
      )),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[test]
  fn targets_default_their_port() {
    let target = Target::from_url("http://example.com/index.html").unwrap();
    assert_eq!(target.scheme, Scheme::Http);
    assert_eq!(target.authority(), "example.com:80");
    let target = Target::from_url("https://example.com:8443/").unwrap();
    assert_eq!(target.scheme, Scheme::Https);
    assert_eq!(target.port, 8443);
    let target = Target::from_url("http://[::1]:9000/x").unwrap();
    assert_eq!(target.host, "::1");
    assert_eq!(target.to_string(), "[::1]:9000");
  }

  #[test]
  fn origin_form_and_other_schemes_are_refused() {
    assert!(Target::from_url("/index.html").is_err());
    assert!(Target::from_url("ftp://example.com/").is_err());
  }

  #[tokio::test]
  async fn refused_connection_is_upstream_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let connector = Connector::new(&UpstreamConfig {
      verify_certificates: false,
      ..Default::default()
    })
    .unwrap();
    let target = Target::from_url(&format!("http://127.0.0.1:{}/", port)).unwrap();
    let err = connector.connect(&target).await.unwrap_err();
    assert!(matches!(err, Error::UpstreamUnavailable { .. }), "{:?}", err);
  }

  #[tokio::test]
  async fn plain_connect_reaches_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connector = Connector::new(&UpstreamConfig {
      verify_certificates: false,
      ..Default::default()
    })
    .unwrap();
    let target = Target::from_url(&format!("http://{}/", addr)).unwrap();
    let (stream, accepted) = tokio::join!(connector.connect(&target), listener.accept());
    assert!(!stream.unwrap().is_tls());
    assert!(accepted.is_ok());
  }
}
