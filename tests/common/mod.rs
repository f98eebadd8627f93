//! Shared helpers for the proxy integration tests.
#![allow(dead_code)]

use pilot_mitm::codec::{read_request, read_response, Limits};
use pilot_mitm::{ExchangeKind, FlowId, MitmProxy, ProxyConfig, ProxyEvent, PAIR_ID_HEADER};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

pub const CERT_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/cert.pem");
pub const KEY_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/key.pem");

/// Answer one request on `stream` with `200` and a body of
/// `"<METHOD> <target>"`; reports whether the pair id leaked upstream.
async fn echo_once<S>(stream: S, delay: Duration)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut reader = BufReader::new(stream);
  let (head, body) = match read_request(&mut reader, &Limits::default()).await {
    Ok(Some(request)) => request,
    _ => return,
  };
  tokio::time::sleep(delay).await;
  let mut text = format!("{} {}", head.method, head.target);
  if !body.is_empty() {
    text.push(' ');
    text.push_str(&String::from_utf8_lossy(&body));
  }
  let leaked = if head.headers.contains(PAIR_ID_HEADER) { "yes" } else { "no" };
  let response = format!(
    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Saw-Pair-Id: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    leaked,
    text.len(),
    text
  );
  let stream = reader.get_mut();
  let _ = stream.write_all(response.as_bytes()).await;
  let _ = stream.shutdown().await;
}

/// Plain HTTP upstream echoing the request line, after `delay`.
pub async fn start_echo_upstream(delay: Duration) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((socket, _)) = listener.accept().await {
      tokio::spawn(echo_once(socket, delay));
    }
  });
  addr
}

/// Upstream that reads one request and answers with `reply` verbatim.
pub async fn start_raw_upstream(reply: &'static [u8]) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((socket, _)) = listener.accept().await {
      tokio::spawn(async move {
        let mut reader = BufReader::new(socket);
        if let Ok(Some(_)) = read_request(&mut reader, &Limits::default()).await {
          let stream = reader.get_mut();
          let _ = stream.write_all(reply).await;
          let _ = stream.shutdown().await;
        }
      });
    }
  });
  addr
}

/// HTTPS upstream using the fixture certificate.
#[cfg(feature = "tls")]
pub async fn start_tls_echo_upstream() -> SocketAddr {
  let cert = pilot_mitm::PemCertificate::from_files(CERT_PATH, KEY_PATH).unwrap();
  let config = pilot_mitm::CertificateResolver::server_config(&cert, "localhost").unwrap();
  let acceptor = tokio_rustls::TlsAcceptor::from(config);
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((socket, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        if let Ok(tls) = acceptor.accept(socket).await {
          echo_once(tls, Duration::ZERO).await;
        }
      });
    }
  });
  addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  drop(listener);
  addr
}

/// Test configuration: loopback listener, unverified upstream TLS.
pub fn test_config() -> ProxyConfig {
  let mut config = ProxyConfig::default();
  config.listen = "127.0.0.1:0".to_string();
  config.upstream.verify_certificates = false;
  config.upstream.connect_timeout_secs = 2;
  config.upstream.response_timeout_secs = 5;
  config
}

/// Start a proxy on an ephemeral port.
pub async fn start_proxy(config: ProxyConfig) -> (MitmProxy, SocketAddr) {
  let proxy = MitmProxy::new(config).unwrap();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let serving = proxy.clone();
  tokio::spawn(async move {
    let _ = serving.serve(listener).await;
  });
  (proxy, addr)
}

/// `GET` through the proxy in absolute form, closing after the response.
pub fn get_request(upstream: SocketAddr, path: &str) -> String {
  format!(
    "GET http://{}{} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
    upstream, path, upstream
  )
}

/// Write `raw` and read until the proxy closes the connection.
pub async fn send_raw(proxy: SocketAddr, raw: impl AsRef<str>) -> String {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream.write_all(raw.as_ref().as_bytes()).await.unwrap();
  let mut out = Vec::new();
  tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut out))
    .await
    .expect("proxy did not close the connection")
    .unwrap_or_default();
  String::from_utf8_lossy(&out).into_owned()
}

/// Close with a reset instead of a FIN, the way a crashed client does.
#[allow(deprecated)]
pub fn abort(stream: TcpStream) {
  let _ = stream.set_linger(Some(Duration::ZERO));
  drop(stream);
}

/// Read one full response with the crate's own parser.
pub async fn read_one_response<S>(stream: S) -> (u16, String)
where
  S: AsyncRead + Unpin,
{
  let mut reader = BufReader::new(stream);
  let (head, body) = read_response(&mut reader, &Limits::default(), "GET")
    .await
    .unwrap();
  (head.status, String::from_utf8_lossy(&body).into_owned())
}

/// Wait until an event matches, skipping others.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<ProxyEvent>, mut matches: F) -> ProxyEvent
where
  F: FnMut(&ProxyEvent) -> bool,
{
  tokio::time::timeout(Duration::from_secs(10), async {
    loop {
      match rx.recv().await {
        Ok(event) if matches(&event) => return event,
        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
        Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
      }
    }
  })
  .await
  .expect("event did not arrive")
}

/// Next pilot hold: flow id, kind and editable text.
pub async fn wait_for_hold(
  rx: &mut broadcast::Receiver<ProxyEvent>,
) -> (FlowId, ExchangeKind, String) {
  match wait_for(rx, |e| matches!(e, ProxyEvent::PilotHold { .. })).await {
    ProxyEvent::PilotHold {
      flow_id, kind, text, ..
    } => (flow_id, kind, text),
    _ => unreachable!(),
  }
}

/// Poll until `condition` holds.
pub async fn eventually<F>(mut condition: F)
where
  F: FnMut() -> bool,
{
  tokio::time::timeout(Duration::from_secs(10), async {
    while !condition() {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .expect("condition never held");
}

