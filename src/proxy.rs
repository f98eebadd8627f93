//! Proxy facade: owns the store, the pilot controller and the event bus and
//! exposes the operator command surface.
use crate::config::ProxyConfig;
use crate::errors::Result;
use crate::events::{EventBus, OperatorCommand, ProxyEvent};
use crate::flow::FlowId;
use crate::pilot::{PendingInfo, PilotController};
use crate::server::ProxyServer;
use crate::store::ExchangeStore;
#[cfg(feature = "tls")]
use crate::tls::{CertificateResolver, PemCertificate};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Intercepting proxy.
///
/// Cloning is cheap and every clone shares the same store, pilot state and
/// event stream.
#[derive(Clone)]
pub struct MitmProxy {
  config: ProxyConfig,
  store: Arc<ExchangeStore>,
  pilot: Arc<PilotController>,
  events: EventBus,
  #[cfg(feature = "tls")]
  resolver: Option<Arc<dyn CertificateResolver>>,
}

impl MitmProxy {
  /// Create a proxy from validated configuration. A configured certificate
  /// pair is loaded here.
  pub fn new(config: ProxyConfig) -> Result<Self> {
    config.validate()?;
    let events = EventBus::new(config.events.channel_capacity);
    let store = Arc::new(ExchangeStore::new(events.clone()));
    let pilot = Arc::new(PilotController::new(
      config.pilot.enabled,
      config.pilot.hold_timeout(),
      config.pilot.on_timeout,
      events.clone(),
    ));
    #[cfg(feature = "tls")]
    let resolver = match (&config.tls.cert_path, &config.tls.key_path) {
      (Some(cert), Some(key)) => {
        Some(Arc::new(PemCertificate::from_files(cert, key)?) as Arc<dyn CertificateResolver>)
      }
      _ => None,
    };
    Ok(Self {
      config,
      store,
      pilot,
      events,
      #[cfg(feature = "tls")]
      resolver,
    })
  }

  /// Use `resolver` to terminate CONNECT tunnels instead of the configured
  /// certificate files.
  #[cfg(feature = "tls")]
  pub fn with_certificate_resolver(mut self, resolver: Arc<dyn CertificateResolver>) -> Self {
    self.resolver = Some(resolver);
    self
  }

  /// configuration in use
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// Captured exchanges.
  pub fn store(&self) -> Arc<ExchangeStore> {
    self.store.clone()
  }

  /// Pilot controller.
  pub fn pilot(&self) -> Arc<PilotController> {
    self.pilot.clone()
  }

  /// Every event: captures, pilot changes, holds and failed or dropped flows.
  pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
    self.events.subscribe()
  }

  /// Hold new flows for the operator.
  pub fn enable_pilot(&self) {
    self.pilot.set_enabled(true);
  }

  /// Stop holding new flows. Flows already held stay held.
  pub fn disable_pilot(&self) {
    self.pilot.set_enabled(false);
  }

  /// Replace a held message with edited text.
  pub fn submit_edit(&self, flow_id: FlowId, text: &str) -> Result<()> {
    self.pilot.submit_edit(flow_id, text)
  }

  /// Forward a held message unchanged.
  pub fn release(&self, flow_id: FlowId) -> Result<()> {
    self.pilot.release(flow_id)
  }

  /// Drop a held flow.
  pub fn cancel(&self, flow_id: FlowId) -> Result<()> {
    self.pilot.cancel(flow_id)
  }

  /// Held flows.
  pub fn pending(&self) -> Vec<PendingInfo> {
    self.pilot.pending()
  }

  /// Run an operator command.
  pub fn execute(&self, command: OperatorCommand) -> Result<()> {
    match command {
      OperatorCommand::EnablePilot => self.enable_pilot(),
      OperatorCommand::DisablePilot => self.disable_pilot(),
      OperatorCommand::SubmitEdit { flow_id, text } => self.submit_edit(flow_id, &text)?,
      OperatorCommand::Release { flow_id } => self.release(flow_id)?,
      OperatorCommand::Cancel { flow_id } => self.cancel(flow_id)?,
    }
    Ok(())
  }

  /// Bind `addr` and serve.
  pub async fn start(&self, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    self.serve(listener).await
  }

  /// Serve clients from an already bound listener.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    let server = ProxyServer::new(
      self.config.clone(),
      self.store.clone(),
      self.pilot.clone(),
      self.events.clone(),
    )?;
    #[cfg(feature = "tls")]
    let server = server.with_resolver(self.resolver.clone());
    server.run(listener).await
  }
}
