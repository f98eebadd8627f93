//! The interception pipeline.
//!
//! One task per client connection. A connection carries sequential flows
//! (keep-alive); each flow is parsed, tagged with a pair id, optionally held
//! for the operator, forwarded over a fresh upstream connection and recorded.
//! `CONNECT` either terminates TLS and runs the same loop on the decrypted
//! stream, or relays the tunnel untouched.
use crate::codec::{self, Limits, RequestHead};
use crate::config::ProxyConfig;
use crate::connector::{Connector, Target};
use crate::errors::{new_io_error, Error, Result};
use crate::events::{EventBus, ProxyEvent};
use crate::exchange::{Exchange, ExchangeKind};
use crate::flow::{Flow, FlowState};
use crate::pairing::{new_pair_id, PAIR_ID_HEADER};
use crate::pilot::{PilotController, PilotDecision};
use crate::store::ExchangeStore;
#[cfg(feature = "tls")]
use crate::tls::CertificateResolver;
use bytes::Bytes;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
#[cfg(feature = "tls")]
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Collision retries before giving up on a request.
const PAIR_ID_ATTEMPTS: usize = 3;

struct Shared {
  config: ProxyConfig,
  store: Arc<ExchangeStore>,
  pilot: Arc<PilotController>,
  events: EventBus,
  connector: Connector,
  #[cfg(feature = "tls")]
  resolver: Option<Arc<dyn CertificateResolver>>,
}

/// How requests on a connection are turned into absolute urls.
#[derive(Debug, Clone)]
enum Origin {
  /// plain proxy connection, absolute-form targets
  Plain,
  /// decrypted CONNECT tunnel to `authority`
  #[cfg_attr(not(feature = "tls"), allow(dead_code))]
  Tunnel { authority: String },
}

/// Accept loop plus the per-flow pipeline.
pub struct ProxyServer {
  shared: Shared,
}

impl ProxyServer {
  /// Server sharing `store`, `pilot` and `events` with its owner.
  pub fn new(
    config: ProxyConfig,
    store: Arc<ExchangeStore>,
    pilot: Arc<PilotController>,
    events: EventBus,
  ) -> Result<Self> {
    let connector = Connector::new(&config.upstream)?;
    Ok(Self {
      shared: Shared {
        config,
        store,
        pilot,
        events,
        connector,
        #[cfg(feature = "tls")]
        resolver: None,
      },
    })
  }

  /// Certificates presented when terminating CONNECT tunnels.
  #[cfg(feature = "tls")]
  pub fn with_resolver(mut self, resolver: Option<Arc<dyn CertificateResolver>>) -> Self {
    self.shared.resolver = resolver;
    self
  }

  /// Serve clients from `listener` until accepting fails.
  pub async fn run(self, listener: TcpListener) -> Result<()> {
    let shared = Arc::new(self.shared);
    let limit = Arc::new(Semaphore::new(shared.config.max_connections));
    info!("proxy listening on {}", listener.local_addr()?);
    loop {
      let permit = limit
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| new_io_error(ErrorKind::Other, "connection limiter closed"))?;
      let (stream, peer) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
          warn!("accept failed: {}", e);
          continue;
        }
      };
      let shared = shared.clone();
      tokio::spawn(async move {
        if let Err(e) = handle_connection(shared, stream, peer).await {
          debug!(%peer, "connection ended: {}", e);
        }
        drop(permit);
      });
    }
  }
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
  debug!(%peer, "client connected");
  let mut client = BufReader::new(stream);
  let first = match read_client_request(&shared.config.limits, &mut client).await? {
    Some(first) => first,
    None => return Ok(()),
  };
  if first.0.method.eq_ignore_ascii_case("CONNECT") {
    return handle_connect(shared, client, first.0).await;
  }
  serve_http(&shared, client, Origin::Plain, Some(first)).await
}

/// Read the next request; a malformed one is answered with `400` and ends
/// the connection.
async fn read_client_request<S>(
  limits: &Limits,
  client: &mut BufReader<S>,
) -> Result<Option<(RequestHead, Bytes)>>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  match codec::read_request(client, limits).await {
    Ok(request) => Ok(request),
    Err(e @ Error::MalformedMessage { .. }) => {
      write_status(client, 400, "malformed request").await;
      Err(e)
    }
    Err(e) => Err(e),
  }
}

async fn handle_connect(
  shared: Arc<Shared>,
  mut client: BufReader<TcpStream>,
  head: RequestHead,
) -> Result<()> {
  let (host, port) = split_authority(&head.target)
    .ok_or_else(|| {
      Error::malformed(
        format!("bad CONNECT target {:?}", head.target),
        Bytes::new(),
      )
    })?;
  #[cfg(feature = "tls")]
  if shared.config.tls.intercept_https {
    if let Some(resolver) = &shared.resolver {
      let server_config = resolver.server_config(&host)?;
      client
        .get_mut()
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
      let tls = TlsAcceptor::from(server_config).accept(client).await?;
      debug!(host = %host, port, "tunnel intercepted");
      let origin = Origin::Tunnel {
        authority: format_authority(&host, port),
      };
      return serve_http(&shared, BufReader::new(tls), origin, None).await;
    }
  }
  let mut upstream = match shared.connector.connect_tcp(&host, port).await {
    Ok(upstream) => upstream,
    Err(e) => {
      write_status(&mut client, failure_status(&e), &e.to_string()).await;
      return Err(e);
    }
  };
  client
    .get_mut()
    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
    .await?;
  debug!(host = %host, port, "relaying tunnel");
  tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
  Ok(())
}

async fn serve_http<S>(
  shared: &Shared,
  mut client: BufReader<S>,
  origin: Origin,
  mut first: Option<(RequestHead, Bytes)>,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  loop {
    let (head, body) = match first.take() {
      Some(request) => request,
      None => match read_client_request(&shared.config.limits, &mut client).await? {
        Some(request) => request,
        None => return Ok(()),
      },
    };
    if head.method.eq_ignore_ascii_case("CONNECT") {
      write_status(&mut client, 405, "nested CONNECT is not supported").await;
      return Ok(());
    }
    if !run_flow(shared, &mut client, &origin, head, body).await? {
      return Ok(());
    }
  }
}

/// One request/response cycle. Returns whether the client connection stays
/// open for another flow.
async fn run_flow<S>(
  shared: &Shared,
  client: &mut BufReader<S>,
  origin: &Origin,
  head: RequestHead,
  body: Bytes,
) -> Result<bool>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let keep_alive = wants_keep_alive(&head);
  let url = match resolve_url(&head, origin) {
    Some(url) => url,
    None => {
      warn!(request_target = %head.target, "request target is not absolute and has no host");
      write_status(client, 400, "request target must be absolute").await;
      return Ok(false);
    }
  };
  // the flag is read exactly once per flow
  let mut flow = Flow::new(shared.pilot.is_enabled());
  let mut request = Exchange::request(head.method, url, head.version, head.headers, body);
  request.headers.remove(PAIR_ID_HEADER);
  request.set_pair_id(&new_pair_id())?;

  if flow.piloted() {
    flow.advance(FlowState::AwaitingPilotDecision);
    request.piloted = true;
    match hold(shared, &mut flow, client, request).await {
      Some(edited) => request = edited,
      None => return Ok(false),
    }
  }

  flow.advance(FlowState::Forwarding);
  let request = record_request(shared, request)?;
  let pair_id = request.pair_id().unwrap_or_default().to_string();
  let timeout = shared.config.upstream.response_timeout();
  let outcome = tokio::select! {
    outcome = tokio::time::timeout(timeout, forward(shared, &mut flow, &request)) => Some(outcome),
    _ = client_closed(client) => None,
  };
  let (response_head, response_body) = match outcome {
    Some(Ok(Ok(response))) => response,
    Some(Ok(Err(e))) => return fail_flow(shared, &mut flow, client, &request, e).await,
    Some(Err(_)) => {
      let e = Error::UpstreamTimeout(request.url.clone().unwrap_or_default());
      return fail_flow(shared, &mut flow, client, &request, e).await;
    }
    None => {
      flow.advance(FlowState::Failed);
      info!(flow_id = flow.id(), pair_id = %pair_id, "client went away while awaiting response");
      shared.events.publish(ProxyEvent::FlowFailed {
        flow_id: flow.id(),
        pair_id: Some(pair_id),
        url: request.url.clone(),
        reason: "client disconnected".to_string(),
      });
      return Ok(false);
    }
  };

  let mut response = Exchange::response(
    response_head.status,
    response_head.version,
    response_head.headers,
    response_body,
  );
  response.headers.remove(PAIR_ID_HEADER);
  response.set_pair_id(&pair_id)?;
  response.url = request.url.clone();
  response.piloted = request.piloted;

  if flow.piloted() && shared.config.pilot.intercept_responses {
    flow.advance(FlowState::HoldingResponse);
    match hold(shared, &mut flow, client, response).await {
      Some(edited) => response = edited,
      None => return Ok(false),
    }
  }

  let response = shared.store.append(response)?;
  flow.advance(FlowState::Captured);
  info!(
    flow_id = flow.id(),
    pair_id = %pair_id,
    status = response.status.unwrap_or_default(),
    url = request.url.as_deref().unwrap_or_default(),
    "flow captured"
  );
  let head_request = request
    .method
    .as_deref()
    .is_some_and(|m| m.eq_ignore_ascii_case("HEAD"));
  let wire = codec::response_to_wire(&response, head_request, keep_alive);
  let writer = client.get_mut();
  let written = async {
    writer.write_all(&wire).await?;
    writer.flush().await
  };
  if let Err(e) = written.await {
    info!(flow_id = flow.id(), pair_id = %pair_id, "response not delivered: {}", e);
    return Ok(false);
  }
  if !keep_alive {
    let _ = writer.shutdown().await;
  }
  Ok(keep_alive)
}

/// Park `exchange` with the pilot controller and wait for the operator or
/// for the client to disconnect. `None` means the flow was dropped.
async fn hold<S>(
  shared: &Shared,
  flow: &mut Flow,
  client: &mut BufReader<S>,
  exchange: Exchange,
) -> Option<Exchange>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let pair_id = exchange.pair_id().map(str::to_owned);
  let kind = exchange.kind;
  let ticket = shared.pilot.park(flow.id(), exchange);
  info!(flow_id = flow.id(), %kind, "flow held for pilot");
  let decision = tokio::select! {
    decision = shared.pilot.await_decision(ticket) => decision,
    _ = client_closed(client) => {
      shared.pilot.abandon(flow.id());
      info!(flow_id = flow.id(), "client went away while held");
      PilotDecision::Drop
    }
  };
  match decision {
    PilotDecision::Forward(exchange) => Some(exchange),
    PilotDecision::Drop => {
      flow.advance(FlowState::Dropped);
      shared.events.publish(ProxyEvent::FlowDropped {
        flow_id: flow.id(),
        pair_id,
      });
      if kind == ExchangeKind::Response {
        let writer = client.get_mut();
        let _ = writer.shutdown().await;
      }
      None
    }
  }
}

/// Store the request, drawing a fresh pair id if the current one is taken.
fn record_request(shared: &Shared, mut request: Exchange) -> Result<Arc<Exchange>> {
  let mut attempts = 0;
  loop {
    match shared.store.append(request.clone()) {
      Err(Error::PairingCollision(_)) if attempts + 1 < PAIR_ID_ATTEMPTS => {
        attempts += 1;
        request.set_pair_id(&new_pair_id())?;
      }
      other => return other,
    }
  }
}

async fn forward(
  shared: &Shared,
  flow: &mut Flow,
  request: &Exchange,
) -> Result<(codec::ResponseHead, Bytes)> {
  let url = request.url.as_deref().unwrap_or_default();
  let target = Target::from_url(url)?;
  let mut upstream = shared.connector.connect(&target).await?;
  debug!(
    flow_id = flow.id(),
    upstream = ?upstream.tcp().peer_addr().ok(),
    tls = upstream.is_tls(),
    "upstream connected"
  );
  upstream.write_all(&codec::request_to_wire(request)).await?;
  upstream.flush().await?;
  flow.advance(FlowState::AwaitingResponse);
  let mut reader = BufReader::new(upstream);
  let method = request.method.as_deref().unwrap_or("GET");
  codec::read_response(&mut reader, &shared.config.limits, method).await
}

async fn fail_flow<S>(
  shared: &Shared,
  flow: &mut Flow,
  client: &mut BufReader<S>,
  request: &Exchange,
  error: Error,
) -> Result<bool>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  flow.advance(FlowState::Failed);
  warn!(
    flow_id = flow.id(),
    pair_id = request.pair_id().unwrap_or_default(),
    "flow failed: {}",
    error
  );
  shared.events.publish(ProxyEvent::FlowFailed {
    flow_id: flow.id(),
    pair_id: request.pair_id().map(str::to_owned),
    url: request.url.clone(),
    reason: error.to_string(),
  });
  write_status(client, failure_status(&error), &error.to_string()).await;
  Ok(false)
}

fn failure_status(error: &Error) -> u16 {
  match error {
    Error::UpstreamTimeout(_) => 504,
    _ => 502,
  }
}

async fn write_status<S>(client: &mut BufReader<S>, status: u16, message: &str)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let writer = client.get_mut();
  let written = async {
    writer.write_all(&codec::status_only(status, message)).await?;
    writer.flush().await
  };
  if let Err(e) = written.await {
    debug!("could not answer client: {}", e);
  }
}

/// Resolves once reading from the client fails, as it does after a reset.
/// End of stream is a half-close: the client may still read the answer, so
/// it never resolves. Pipelined bytes stay in the buffer for the next flow.
async fn client_closed<S>(client: &mut BufReader<S>)
where
  S: AsyncRead + Unpin,
{
  if client.fill_buf().await.is_ok() {
    std::future::pending::<()>().await;
  }
}

fn wants_keep_alive(head: &RequestHead) -> bool {
  let headers = &head.headers;
  if headers.has_token("connection", "close") || headers.has_token("proxy-connection", "close") {
    return false;
  }
  if head.version.eq_ignore_ascii_case("HTTP/1.0") {
    return headers.has_token("connection", "keep-alive")
      || headers.has_token("proxy-connection", "keep-alive");
  }
  true
}

fn resolve_url(head: &RequestHead, origin: &Origin) -> Option<String> {
  let target = head.target.as_str();
  let lower = target.to_ascii_lowercase();
  if lower.starts_with("http://") || lower.starts_with("https://") {
    return Some(target.to_string());
  }
  if !target.starts_with('/') {
    return None;
  }
  match origin {
    Origin::Plain => head
      .headers
      .get("host")
      .filter(|h| !h.is_empty())
      .map(|host| format!("http://{}{}", host, target)),
    Origin::Tunnel { authority } => {
      let host = head
        .headers
        .get("host")
        .filter(|h| !h.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| authority.clone());
      Some(format!("https://{}{}", host, target))
    }
  }
}

fn split_authority(authority: &str) -> Option<(String, u16)> {
  let (host, port) = match authority.rsplit_once(':') {
    Some((host, port)) if !port.contains(']') => (host, port.parse().ok()?),
    _ => (authority, 443),
  };
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if host.is_empty() {
    return None;
  }
  Some((host.to_string(), port))
}

#[cfg_attr(not(feature = "tls"), allow(dead_code))]
fn format_authority(host: &str, port: u16) -> String {
  if host.contains(':') {
    format!("[{}]:{}", host, port)
  } else if port == 443 {
    host.to_string()
  } else {
    format!("{}:{}", host, port)
  }
}
