//! Proxy configuration, loaded from TOML.
//!
//! Every section has defaults, so a file only needs the keys it changes:
//!
//! ```toml
//! listen = "127.0.0.1:8080"
//!
//! [pilot]
//! enabled = true
//! hold_timeout_secs = 120
//! on_timeout = "drop"
//! ```
use crate::codec::Limits;
use crate::errors::{Error, Result};
use crate::pilot::TimeoutAction;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// Address the proxy listens on.
  pub listen: String,
  /// Client connections served at once; further clients wait in the accept
  /// backlog.
  pub max_connections: usize,
  /// Message size limits.
  pub limits: Limits,
  /// Upstream leg.
  pub upstream: UpstreamConfig,
  /// HTTPS interception.
  pub tls: TlsConfig,
  /// Pilot mode.
  pub pilot: PilotConfig,
  /// Observer notifications.
  pub events: EventsConfig,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen: "127.0.0.1:8080".to_string(),
      max_connections: 1000,
      limits: Limits::default(),
      upstream: UpstreamConfig::default(),
      tls: TlsConfig::default(),
      pilot: PilotConfig::default(),
      events: EventsConfig::default(),
    }
  }
}

/// Upstream connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
  /// TCP connect plus TLS handshake.
  pub connect_timeout_secs: u64,
  /// Writing the request and reading the whole response.
  pub response_timeout_secs: u64,
  /// Check upstream certificates against the system roots.
  pub verify_certificates: bool,
}

impl Default for UpstreamConfig {
  fn default() -> Self {
    Self {
      connect_timeout_secs: 10,
      response_timeout_secs: 60,
      verify_certificates: true,
    }
  }
}

impl UpstreamConfig {
  /// connect timeout
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }

  /// response timeout
  pub fn response_timeout(&self) -> Duration {
    Duration::from_secs(self.response_timeout_secs)
  }
}

/// HTTPS interception settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
  /// Terminate CONNECT tunnels and capture what runs inside. Needs a
  /// certificate; without one tunnels are relayed blind.
  pub intercept_https: bool,
  /// PEM certificate chain presented to clients.
  pub cert_path: Option<PathBuf>,
  /// PEM private key for `cert_path`.
  pub key_path: Option<PathBuf>,
}

impl Default for TlsConfig {
  fn default() -> Self {
    Self {
      intercept_https: true,
      cert_path: None,
      key_path: None,
    }
  }
}

/// Pilot mode settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
  /// Pilot mode at start.
  pub enabled: bool,
  /// How long a hold waits for the operator.
  pub hold_timeout_secs: u64,
  /// What an unanswered hold turns into.
  pub on_timeout: TimeoutAction,
  /// Hold the responses of piloted flows as well.
  pub intercept_responses: bool,
}

impl Default for PilotConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      hold_timeout_secs: 300,
      on_timeout: TimeoutAction::Forward,
      intercept_responses: false,
    }
  }
}

impl PilotConfig {
  /// hold timeout
  pub fn hold_timeout(&self) -> Duration {
    Duration::from_secs(self.hold_timeout_secs)
  }
}

/// Notification channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
  /// Events buffered per subscriber before it starts lagging.
  pub channel_capacity: usize,
}

impl Default for EventsConfig {
  fn default() -> Self {
    Self {
      channel_capacity: 1024,
    }
  }
}

impl ProxyConfig {
  /// Load and validate a TOML file.
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
      .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    Self::from_toml(&content)
  }

  /// Parse and validate TOML text.
  pub fn from_toml(content: &str) -> Result<Self> {
    let config: ProxyConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
  }

  /// Parsed listen address.
  pub fn listen_addr(&self) -> Result<SocketAddr> {
    self
      .listen
      .parse()
      .map_err(|_| Error::Config(format!("invalid listen address {:?}", self.listen)))
  }

  /// Reject settings the proxy cannot run with.
  pub fn validate(&self) -> Result<()> {
    let mut problems = Vec::new();
    if self.listen_addr().is_err() {
      problems.push(format!("invalid listen address {:?}", self.listen));
    }
    if self.max_connections == 0 {
      problems.push("max_connections must be positive".to_string());
    }
    if self.limits.max_head_bytes == 0 || self.limits.max_body_bytes == 0 {
      problems.push("limits must be positive".to_string());
    }
    if self.upstream.connect_timeout_secs == 0 || self.upstream.response_timeout_secs == 0 {
      problems.push("upstream timeouts must be positive".to_string());
    }
    if self.pilot.hold_timeout_secs == 0 {
      problems.push("pilot.hold_timeout_secs must be positive".to_string());
    }
    if self.events.channel_capacity == 0 {
      problems.push("events.channel_capacity must be positive".to_string());
    }
    if self.tls.cert_path.is_some() != self.tls.key_path.is_some() {
      problems.push("tls.cert_path and tls.key_path must be set together".to_string());
    }
    if problems.is_empty() {
      Ok(())
    } else {
      Err(Error::Config(problems.join(", ")))
    }
  }
}
