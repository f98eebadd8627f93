//! TLS configuration for both legs of an intercepted connection.
//!
//! The client-facing leg presents a certificate chosen by a
//! [`CertificateResolver`]. Issuing per-host certificates is left to the
//! embedder; [`PemCertificate`] serves one chain for every host.
use crate::errors::{Error, Result};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  ClientConfig, DigitallySignedStruct, Error as TLSError, RootCertStore, ServerConfig,
  SignatureScheme,
};

/// Supplies the server configuration used to terminate TLS for a CONNECT host.
pub trait CertificateResolver: Send + Sync {
  /// Server config for `host` (the CONNECT authority without port).
  fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>>;
}

/// One PEM certificate chain and key, presented for every host.
#[derive(Debug, Clone)]
pub struct PemCertificate {
  config: Arc<ServerConfig>,
}

impl PemCertificate {
  /// Build from PEM text. The key may be PKCS#1, PKCS#8 or SEC1.
  pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
    let certs = rustls_pemfile::certs(&mut Cursor::new(cert_pem))
      .collect::<std::io::Result<Vec<CertificateDer<'static>>>>()
      .map_err(|e| Error::certificate(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
      return Err(Error::certificate("no certificate found in PEM"));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut Cursor::new(key_pem))
      .map_err(|e| Error::certificate(format!("invalid key PEM: {}", e)))?
      .ok_or_else(|| Error::certificate("no private key found in PEM"))?;
    let mut config = ServerConfig::builder_with_provider(provider())
      .with_safe_default_protocol_versions()?
      .with_no_client_auth()
      .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Self {
      config: Arc::new(config),
    })
  }

  /// Read the chain and key from disk.
  pub fn from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let (cert_path, key_path) = (cert_path.as_ref(), key_path.as_ref());
    let cert = std::fs::read(cert_path)
      .map_err(|e| Error::certificate(format!("{}: {}", cert_path.display(), e)))?;
    let key = std::fs::read(key_path)
      .map_err(|e| Error::certificate(format!("{}: {}", key_path.display(), e)))?;
    Self::from_pem(&cert, &key)
  }
}

impl CertificateResolver for PemCertificate {
  fn server_config(&self, _host: &str) -> Result<Arc<ServerConfig>> {
    Ok(self.config.clone())
  }
}

fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Client config for the upstream leg. With `verify` the platform roots are
/// trusted; without it any certificate is accepted.
pub fn upstream_client_config(verify: bool) -> Result<ClientConfig> {
  let builder =
    ClientConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
  let mut config = if verify {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
      tracing::warn!("loading platform certificates: {}", err);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!(added, ignored, "platform roots loaded");
    builder.with_root_certificates(roots).with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  };
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(config)
}

/// Accepts any server certificate.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const CERT: &[u8] = include_bytes!("../tests/fixtures/cert.pem");
  const KEY: &[u8] = include_bytes!("../tests/fixtures/key.pem");

  #[test]
  fn pem_pair_builds_a_server_config() {
    let cert = PemCertificate::from_pem(CERT, KEY).unwrap();
    let config = cert.server_config("example.com").unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
  }

  #[test]
  fn garbage_pem_is_a_certificate_error() {
    assert!(matches!(
      PemCertificate::from_pem(b"not pem", KEY),
      Err(Error::Certificate(_))
    ));
    assert!(matches!(
      PemCertificate::from_pem(CERT, b""),
      Err(Error::Certificate(_))
    ));
  }

  #[test]
  fn missing_files_are_reported() {
    let err =
      PemCertificate::from_files("/nonexistent/cert.pem", "/nonexistent/key.pem").unwrap_err();
    assert!(matches!(err, Error::Certificate(_)));
  }

  #[test]
  fn unverified_upstream_config_builds() {
    let config = upstream_client_config(false).unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
  }
}
