//! Notifications to observers and commands from the operator.
use crate::exchange::{Exchange, ExchangeKind};
use crate::flow::FlowId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Something observers should know about, serialized as
/// `{"event": <name>, "payload": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum ProxyEvent {
  /// A request was appended to the store.
  #[serde(rename = "proxy-request")]
  Request(Arc<Exchange>),
  /// A response was appended to the store.
  #[serde(rename = "proxy-response")]
  Response(Arc<Exchange>),
  /// Pilot mode changed.
  #[serde(rename = "change_pilot_state")]
  PilotState {
    /// new value
    enabled: bool,
  },
  /// A flow is held and waits for the operator.
  #[serde(rename = "pilot-hold")]
  PilotHold {
    /// handle for `submit_edit` / `release` / `cancel`
    flow_id: FlowId,
    /// what is held
    kind: ExchangeKind,
    /// correlation id of the flow
    pair_id: Option<String>,
    /// editable text of the held message
    text: String,
  },
  /// The upstream leg failed; the request was recorded without a response.
  #[serde(rename = "flow-failed")]
  FlowFailed {
    /// flow
    flow_id: FlowId,
    /// correlation id
    pair_id: Option<String>,
    /// target url
    url: Option<String>,
    /// error text
    reason: String,
  },
  /// The flow was cancelled by the operator, timed out into a drop, or lost
  /// its client while held.
  #[serde(rename = "flow-dropped")]
  FlowDropped {
    /// flow
    flow_id: FlowId,
    /// correlation id
    pair_id: Option<String>,
  },
}

/// Operator commands, one JSON object each, tagged by `command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OperatorCommand {
  /// Turn pilot mode on.
  EnablePilot,
  /// Turn pilot mode off.
  DisablePilot,
  /// Replace a held message with edited text and forward it.
  SubmitEdit {
    /// held flow
    flow_id: FlowId,
    /// editable text
    text: String,
  },
  /// Forward a held message unchanged.
  Release {
    /// held flow
    flow_id: FlowId,
  },
  /// Drop a held flow.
  Cancel {
    /// held flow
    flow_id: FlowId,
  },
}

/// Broadcast channel shared by the store, the pilot controller and the
/// pipeline. Slow subscribers lag; they never block a flow.
#[derive(Debug, Clone)]
pub struct EventBus {
  sender: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
  /// Channel keeping at most `capacity` undelivered events per subscriber.
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self { sender }
  }

  /// Send to every current subscriber.
  pub fn publish(&self, event: ProxyEvent) {
    if self.sender.send(event).is_err() {
      tracing::trace!("event dropped, no subscribers");
    }
  }

  /// New receiver; sees events published from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
    self.sender.subscribe()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(1024)
  }
}
