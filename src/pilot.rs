//! Pilot mode: hold flows until the operator edits, releases or cancels them.
//!
//! A flow that reads the flag as enabled parks its request here and waits on
//! a one-shot channel. The operator answers through [`PilotController::submit_edit`],
//! [`PilotController::release`] or [`PilotController::cancel`]; a hold that gets
//! no answer within the configured timeout resolves to the configured
//! [`TimeoutAction`].
use crate::codec::{from_editable_text, to_editable_text};
use crate::errors::{Error, Result};
use crate::events::{EventBus, ProxyEvent};
use crate::exchange::{Exchange, ExchangeKind};
use crate::flow::FlowId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// What a hold turns into when the operator does not answer in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutAction {
  /// forward the message unchanged
  #[default]
  Forward,
  /// drop the flow
  Drop,
}

/// Outcome of a hold.
#[derive(Debug, Clone, PartialEq)]
pub enum PilotDecision {
  /// Continue with this message (the original or its edited replacement).
  Forward(Exchange),
  /// Abandon the flow and record nothing further.
  Drop,
}

struct PendingHold {
  original: Exchange,
  parked_at: Instant,
  decision_tx: oneshot::Sender<PilotDecision>,
}

/// A held flow, as listed for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingInfo {
  /// flow id to answer with
  pub flow_id: FlowId,
  /// request or response hold
  pub kind: ExchangeKind,
  /// correlation id
  pub pair_id: Option<String>,
  /// seconds since the hold began
  pub waiting_secs: u64,
}

/// Returned by [`PilotController::park`]; pass it to
/// [`PilotController::await_decision`].
#[derive(Debug)]
pub struct HoldTicket {
  flow_id: FlowId,
  decision_rx: oneshot::Receiver<PilotDecision>,
}

impl HoldTicket {
  /// flow the ticket belongs to
  pub fn flow_id(&self) -> FlowId {
    self.flow_id
  }
}

/// Global pilot flag plus the registry of held flows.
pub struct PilotController {
  enabled: AtomicBool,
  pending: Mutex<HashMap<FlowId, PendingHold>>,
  timeout: Duration,
  on_timeout: TimeoutAction,
  events: EventBus,
}

impl PilotController {
  /// Controller starting in the given mode.
  pub fn new(
    enabled: bool,
    timeout: Duration,
    on_timeout: TimeoutAction,
    events: EventBus,
  ) -> Self {
    Self {
      enabled: AtomicBool::new(enabled),
      pending: Mutex::new(HashMap::new()),
      timeout,
      on_timeout,
      events,
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<FlowId, PendingHold>> {
    self.pending.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Switch pilot mode. Observers are notified only when the value changes.
  /// Flows already past their decision point are not affected.
  pub fn set_enabled(&self, enabled: bool) {
    let previous = self.enabled.swap(enabled, Ordering::SeqCst);
    if previous != enabled {
      info!(enabled, "pilot mode changed");
      self.events.publish(ProxyEvent::PilotState { enabled });
    }
  }

  /// Current mode.
  pub fn is_enabled(&self) -> bool {
    self.enabled.load(Ordering::SeqCst)
  }

  /// Hold timeout.
  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  /// Hold `exchange` for flow `flow_id` and announce it with its editable text.
  pub fn park(&self, flow_id: FlowId, exchange: Exchange) -> HoldTicket {
    let (decision_tx, decision_rx) = oneshot::channel();
    let event = ProxyEvent::PilotHold {
      flow_id,
      kind: exchange.kind,
      pair_id: exchange.pair_id().map(str::to_owned),
      text: to_editable_text(&exchange),
    };
    self.lock().insert(
      flow_id,
      PendingHold {
        original: exchange,
        parked_at: Instant::now(),
        decision_tx,
      },
    );
    debug!(flow_id, "flow parked");
    self.events.publish(event);
    HoldTicket {
      flow_id,
      decision_rx,
    }
  }

  /// Replace the held message with `text` and forward it.
  ///
  /// Text that does not parse fails with [`Error::InvalidEditableText`] and
  /// leaves the hold in place, so the operator can try again.
  pub fn submit_edit(&self, flow_id: FlowId, text: &str) -> Result<()> {
    let mut pending = self.lock();
    let hold = pending.get(&flow_id).ok_or(Error::FlowNotFound(flow_id))?;
    let edited = from_editable_text(text, hold.original.kind)?;
    let replacement = hold.original.apply_edit(edited)?;
    debug!(flow_id, "edit submitted");
    resolve(&mut pending, flow_id, |_| PilotDecision::Forward(replacement))
  }

  /// Forward the held message unchanged.
  pub fn release(&self, flow_id: FlowId) -> Result<()> {
    debug!(flow_id, "released unchanged");
    resolve(&mut self.lock(), flow_id, PilotDecision::Forward)
  }

  /// Drop the held flow.
  pub fn cancel(&self, flow_id: FlowId) -> Result<()> {
    debug!(flow_id, "cancelled");
    resolve(&mut self.lock(), flow_id, |_| PilotDecision::Drop)
  }

  /// Forget a hold whose client went away. Returns whether it was held.
  pub fn abandon(&self, flow_id: FlowId) -> bool {
    let removed = self.lock().remove(&flow_id).is_some();
    if removed {
      debug!(flow_id, "hold abandoned");
    }
    removed
  }

  /// Wait for the operator, bounded by the hold timeout.
  pub async fn await_decision(&self, ticket: HoldTicket) -> PilotDecision {
    let HoldTicket {
      flow_id,
      mut decision_rx,
    } = ticket;
    match tokio::time::timeout(self.timeout, &mut decision_rx).await {
      Ok(Ok(decision)) => decision,
      Ok(Err(_)) => PilotDecision::Drop,
      Err(_) => {
        let expired = self.lock().remove(&flow_id);
        match expired {
          Some(hold) => {
            info!(flow_id, action = ?self.on_timeout, "pilot hold timed out");
            match self.on_timeout {
              TimeoutAction::Forward => PilotDecision::Forward(hold.original),
              TimeoutAction::Drop => PilotDecision::Drop,
            }
          }
          // answered while the timer fired
          None => decision_rx.await.unwrap_or(PilotDecision::Drop),
        }
      }
    }
  }

  /// Held flows, oldest id first.
  pub fn pending(&self) -> Vec<PendingInfo> {
    let mut list: Vec<PendingInfo> = self
      .lock()
      .iter()
      .map(|(flow_id, hold)| PendingInfo {
        flow_id: *flow_id,
        kind: hold.original.kind,
        pair_id: hold.original.pair_id().map(str::to_owned),
        waiting_secs: hold.parked_at.elapsed().as_secs(),
      })
      .collect();
    list.sort_by_key(|p| p.flow_id);
    list
  }

  /// Number of held flows.
  pub fn pending_count(&self) -> usize {
    self.lock().len()
  }
}

/// Remove the hold and send its decision under the same lock, so a timer
/// that finds the hold gone always finds the decision sent.
fn resolve<F>(pending: &mut HashMap<FlowId, PendingHold>, flow_id: FlowId, decide: F) -> Result<()>
where
  F: FnOnce(Exchange) -> PilotDecision,
{
  let PendingHold {
    original,
    decision_tx,
    ..
  } = pending
    .remove(&flow_id)
    .ok_or(Error::FlowNotFound(flow_id))?;
  decision_tx
    .send(decide(original))
    .map_err(|_| Error::FlowClosed(flow_id))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::exchange::Headers;
  use crate::pairing::PAIR_ID_HEADER;
  use std::sync::Arc;

  fn controller(timeout: Duration, on_timeout: TimeoutAction) -> PilotController {
    PilotController::new(true, timeout, on_timeout, EventBus::new(16))
  }

  fn held_request() -> Exchange {
    let headers = Headers::from_pairs([("host", "example.com"), (PAIR_ID_HEADER, "abc")]).unwrap();
    let mut request = Exchange::request(
      "GET",
      "http://example.com/index.html",
      "HTTP/1.1",
      headers,
      "",
    );
    request.piloted = true;
    request
  }

  #[tokio::test]
  async fn toggling_notifies_only_on_change() {
    let pilot = PilotController::new(
      false,
      Duration::from_secs(1),
      TimeoutAction::Forward,
      EventBus::new(8),
    );
    let mut rx = pilot.events.subscribe();
    pilot.set_enabled(false);
    pilot.set_enabled(true);
    pilot.set_enabled(true);
    assert!(pilot.is_enabled());
    assert!(matches!(rx.recv().await.unwrap(), ProxyEvent::PilotState { enabled: true }));
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn park_announces_editable_text() {
    let pilot = controller(Duration::from_secs(30), TimeoutAction::Forward);
    let mut rx = pilot.events.subscribe();
    let ticket = pilot.park(7, held_request());
    assert_eq!(ticket.flow_id(), 7);
    match rx.recv().await.unwrap() {
      ProxyEvent::PilotHold { flow_id, text, pair_id, .. } => {
        assert_eq!(flow_id, 7);
        assert_eq!(pair_id.as_deref(), Some("abc"));
        assert_eq!(text, "GET /index.html HTTP/1.1\nHost: example.com\n\n");
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test]
  async fn release_forwards_original() {
    let pilot = controller(Duration::from_secs(30), TimeoutAction::Drop);
    let ticket = pilot.park(1, held_request());
    assert_eq!(pilot.pending_count(), 1);
    pilot.release(1).unwrap();
    assert_eq!(pilot.await_decision(ticket).await, PilotDecision::Forward(held_request()));
    assert_eq!(pilot.pending_count(), 0);
  }

  #[tokio::test]
  async fn invalid_edit_keeps_the_hold() {
    let pilot = controller(Duration::from_secs(30), TimeoutAction::Drop);
    let ticket = pilot.park(2, held_request());
    let err = pilot.submit_edit(2, "garbage").unwrap_err();
    assert!(err.is_recoverable_edit());
    assert_eq!(pilot.pending_count(), 1);

    pilot
      .submit_edit(2, "GET /admin HTTP/1.1\nHost: example.com\nX-Edited: yes\n\n")
      .unwrap();
    match pilot.await_decision(ticket).await {
      PilotDecision::Forward(edited) => {
        assert_eq!(edited.url.as_deref(), Some("http://example.com/admin"));
        assert_eq!(edited.headers.get("x-edited"), Some("yes"));
        assert_eq!(edited.pair_id(), Some("abc"));
        assert!(edited.piloted);
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test]
  async fn cancel_drops_the_flow() {
    let pilot = controller(Duration::from_secs(30), TimeoutAction::Forward);
    let ticket = pilot.park(3, held_request());
    pilot.cancel(3).unwrap();
    assert_eq!(pilot.await_decision(ticket).await, PilotDecision::Drop);
    assert!(matches!(pilot.cancel(3), Err(Error::FlowNotFound(3))));
  }

  #[test]
  fn unknown_flow_is_not_found() {
    let pilot = controller(Duration::from_secs(30), TimeoutAction::Forward);
    assert!(matches!(pilot.release(99), Err(Error::FlowNotFound(99))));
    assert!(matches!(pilot.submit_edit(99, "GET / HTTP/1.1\n\n"), Err(Error::FlowNotFound(99))));
  }

  #[tokio::test(start_paused = true)]
  async fn timeout_resolves_per_configuration() {
    let pilot = controller(Duration::from_secs(300), TimeoutAction::Forward);
    let ticket = pilot.park(4, held_request());
    assert_eq!(pilot.await_decision(ticket).await, PilotDecision::Forward(held_request()));
    assert_eq!(pilot.pending_count(), 0);

    let pilot = controller(Duration::from_secs(300), TimeoutAction::Drop);
    let ticket = pilot.park(5, held_request());
    assert_eq!(pilot.await_decision(ticket).await, PilotDecision::Drop);
    assert!(pilot.pending().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn hold_waits_the_full_timeout() {
    let pilot = Arc::new(controller(Duration::from_secs(60), TimeoutAction::Drop));
    let ticket = pilot.park(10, held_request());
    let waiting = tokio::spawn({
      let pilot = pilot.clone();
      async move { pilot.await_decision(ticket).await }
    });
    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(!waiting.is_finished());
    assert_eq!(pilot.pending_count(), 1);
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(waiting.await.unwrap(), PilotDecision::Drop);
    assert_eq!(pilot.pending_count(), 0);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn edit_racing_the_timeout_is_never_dropped() {
    let pilot = Arc::new(controller(Duration::from_millis(5), TimeoutAction::Forward));
    for flow_id in 0..200 {
      let ticket = pilot.park(flow_id, held_request());
      let editor = {
        let pilot = pilot.clone();
        tokio::spawn(async move {
          tokio::time::sleep(Duration::from_millis(5)).await;
          pilot.submit_edit(flow_id, "GET /edited HTTP/1.1\nHost: example.com\n\n")
        })
      };
      let decision = pilot.await_decision(ticket).await;
      let submitted = editor.await.unwrap();
      match decision {
        PilotDecision::Forward(forwarded) if submitted.is_ok() => {
          assert_eq!(forwarded.url.as_deref(), Some("http://example.com/edited"));
        }
        PilotDecision::Forward(forwarded) => {
          assert!(matches!(submitted, Err(Error::FlowNotFound(_))));
          assert_eq!(forwarded, held_request());
        }
        PilotDecision::Drop => panic!("flow {} was dropped", flow_id),
      }
    }
  }

  #[tokio::test]
  async fn abandoned_hold_resolves_to_drop() {
    let pilot = controller(Duration::from_secs(30), TimeoutAction::Forward);
    let ticket = pilot.park(6, held_request());
    assert!(pilot.abandon(6));
    assert!(!pilot.abandon(6));
    assert_eq!(pilot.await_decision(ticket).await, PilotDecision::Drop);
  }

  #[test]
  fn pending_lists_holds_in_flow_order() {
    let pilot = controller(Duration::from_secs(30), TimeoutAction::Forward);
    let _b = pilot.park(9, held_request());
    let _a = pilot.park(8, held_request());
    let pending = pilot.pending();
    let ids: Vec<FlowId> = pending.iter().map(|p| p.flow_id).collect();
    assert_eq!(ids, vec![8, 9]);
    assert_eq!(pending[0].kind, ExchangeKind::Request);
    assert!(pending[0].waiting_secs <= 1);
  }
}
