#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # pilot-mitm
//!
//! An intercepting HTTP/HTTPS proxy that records every request and response,
//! pairs them by a correlation id, and can hold flows for an operator to edit
//! before they continue ("pilot mode").
//!
//! - HTTP/1.x parsing and serialization, plus an editable text form
//! - Append-only [`ExchangeStore`] indexed by pair id
//! - Broadcast [`ProxyEvent`] stream for observers
//! - [`PilotController`] with edit, release, cancel and hold timeouts
//! - HTTPS interception of `CONNECT` tunnels with a [`CertificateResolver`]
//!
//! ## Running a proxy
//!
//! ```no_run
//! use pilot_mitm::{MitmProxy, ProxyConfig, ProxyEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let proxy = MitmProxy::new(ProxyConfig::default())?;
//!   let mut events = proxy.subscribe();
//!   tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!       if let ProxyEvent::PilotHold { flow_id, text, .. } = event {
//!         println!("flow {flow_id} held:\n{text}");
//!       }
//!     }
//!   });
//!   proxy.enable_pilot();
//!   proxy.start("127.0.0.1:8080").await?;
//!   Ok(())
//! }
//! ```
//!
//! ## Pairing
//!
//! Each request gets a random token in the internal `pair-id` header before it
//! can be held or forwarded. The token is copied onto the response, never sent
//! upstream and never shown in editable text.
//!
//! ```rust
//! use pilot_mitm::{EventBus, Exchange, ExchangeStore, Headers, PAIR_ID_HEADER};
//!
//! let store = ExchangeStore::new(EventBus::default());
//! let mut headers = Headers::new();
//! headers.append(PAIR_ID_HEADER, "abc").unwrap();
//! store.append(Exchange::response(200, "HTTP/1.1", headers, "ok")).unwrap();
//! assert_eq!(store.find_by_pair_id("abc").unwrap().status, Some(200));
//! ```
//!
//! ## Optional Features
//!
//! - **tls**: upstream HTTPS and interception of `CONNECT` tunnels.
//! - **gzip**: gzip and deflate bodies are shown and edited decoded.
//!
mod body;
/// Wire codec and editable text
pub mod codec;
mod config;
mod connector;
/// Content-Encoding handling
pub mod encoding;
mod errors;
mod events;
mod exchange;
mod flow;
mod pairing;
mod pilot;
mod proxy;
mod server;
mod socket;
mod store;
#[cfg(feature = "tls")]
mod tls;

pub use body::Body;
pub use codec::{from_editable_text, to_editable_text, EditedMessage, Limits};
pub use config::{EventsConfig, PilotConfig, ProxyConfig, TlsConfig, UpstreamConfig};
pub use connector::{Connector, Scheme, Target};
pub use errors::{Error, Result};
pub use events::{EventBus, OperatorCommand, ProxyEvent};
pub use exchange::{display_name, Exchange, ExchangeKind, Headers, Method};
pub use flow::{Flow, FlowId, FlowState};
pub use pairing::{find_match, find_match_or_empty, new_pair_id, PAIR_ID_HEADER};
pub use pilot::{HoldTicket, PendingInfo, PilotController, PilotDecision, TimeoutAction};
pub use proxy::MitmProxy;
pub use server::ProxyServer;
pub use socket::MaybeTlsStream;
pub use store::ExchangeStore;
#[cfg(feature = "tls")]
pub use tls::{upstream_client_config, CertificateResolver, PemCertificate};
