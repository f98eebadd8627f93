//! pilot-mitm command line.
//!
//! Captured exchanges and pilot notifications are written to stdout as JSON
//! lines; operator commands are read from stdin, one JSON object per line:
//!
//! ```text
//! {"command":"enable_pilot"}
//! {"command":"submit_edit","flow_id":3,"text":"GET /admin HTTP/1.1\nHost: example.com\n\n"}
//! {"command":"cancel","flow_id":4}
//! ```
//!
//! Logs go to stderr and follow `RUST_LOG` (default `pilot_mitm=info`).
use clap::Parser;
use pilot_mitm::{MitmProxy, OperatorCommand, ProxyConfig, ProxyEvent};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pilot-mitm", version, about = "Intercepting HTTP/HTTPS proxy with pilot mode")]
struct Args {
  /// TOML configuration file
  #[arg(short, long)]
  config: Option<PathBuf>,
  /// Listen address, overrides the configuration
  #[arg(short, long)]
  listen: Option<String>,
  /// Start with pilot mode enabled
  #[arg(long)]
  pilot: bool,
  /// PEM certificate presented for intercepted HTTPS
  #[arg(long, requires = "key")]
  cert: Option<PathBuf>,
  /// PEM private key for --cert
  #[arg(long, requires = "cert")]
  key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pilot_mitm=info".into()),
    )
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .init();

  let args = Args::parse();
  let mut config = match &args.config {
    Some(path) => ProxyConfig::from_file(path)?,
    None => ProxyConfig::default(),
  };
  if let Some(listen) = args.listen {
    config.listen = listen;
  }
  if args.pilot {
    config.pilot.enabled = true;
  }
  if args.cert.is_some() {
    config.tls.cert_path = args.cert;
    config.tls.key_path = args.key;
  }

  let proxy = MitmProxy::new(config)?;
  let listen = proxy.config().listen.clone();
  let events = tokio::spawn(print_events(proxy.subscribe()));
  let commands = tokio::spawn(read_commands(proxy.clone()));

  tokio::select! {
    served = proxy.start(&listen) => served?,
    _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
  }
  events.abort();
  commands.abort();
  Ok(())
}

async fn print_events(mut rx: broadcast::Receiver<ProxyEvent>) {
  let mut stdout = tokio::io::stdout();
  loop {
    match rx.recv().await {
      Ok(event) => match serde_json::to_string(&event) {
        Ok(mut line) => {
          line.push('\n');
          if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            return;
          }
        }
        Err(e) => tracing::warn!("event not serializable: {}", e),
      },
      Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event stream lagging"),
      Err(RecvError::Closed) => return,
    }
  }
}

async fn read_commands(proxy: MitmProxy) {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Ok(Some(line)) = lines.next_line().await {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }
    match serde_json::from_str::<OperatorCommand>(line) {
      Ok(command) => {
        if let Err(e) = proxy.execute(command) {
          tracing::warn!("command failed: {}", e);
        }
      }
      Err(e) => tracing::warn!("unreadable command {:?}: {}", line, e),
    }
  }
}
