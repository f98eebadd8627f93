//! Per-flow lifecycle.
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle for one client request/response cycle.
pub type FlowId = u64;

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_flow_id() -> FlowId {
  NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed)
}

/// Where a flow is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
  /// request parsed, pair id assigned
  Received,
  /// held for the operator
  AwaitingPilotDecision,
  /// request going upstream
  Forwarding,
  /// waiting for the upstream response
  AwaitingResponse,
  /// response held for the operator
  HoldingResponse,
  /// request and response recorded
  Captured,
  /// upstream leg failed, request recorded
  Failed,
  /// cancelled, timed out into a drop, or client gone
  Dropped,
}

impl FlowState {
  /// No further transition is possible.
  pub fn is_terminal(&self) -> bool {
    matches!(self, FlowState::Captured | FlowState::Failed | FlowState::Dropped)
  }

  fn rank(&self) -> u8 {
    match self {
      FlowState::Received => 0,
      FlowState::AwaitingPilotDecision => 1,
      FlowState::Forwarding => 2,
      FlowState::AwaitingResponse => 3,
      FlowState::HoldingResponse => 4,
      FlowState::Captured | FlowState::Failed | FlowState::Dropped => 5,
    }
  }

  /// Transitions only move forward, and terminal states are final.
  pub fn can_advance_to(&self, next: FlowState) -> bool {
    !self.is_terminal() && next.rank() > self.rank()
  }
}

impl fmt::Display for FlowState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      FlowState::Received => "received",
      FlowState::AwaitingPilotDecision => "awaiting_pilot_decision",
      FlowState::Forwarding => "forwarding",
      FlowState::AwaitingResponse => "awaiting_response",
      FlowState::HoldingResponse => "holding_response",
      FlowState::Captured => "captured",
      FlowState::Failed => "failed",
      FlowState::Dropped => "dropped",
    };
    f.write_str(s)
  }
}

/// State tracker for one flow. The pilot flag is sampled once, at creation.
#[derive(Debug)]
pub struct Flow {
  id: FlowId,
  state: FlowState,
  piloted: bool,
}

impl Flow {
  /// New flow in [`FlowState::Received`].
  pub fn new(piloted: bool) -> Self {
    let id = next_flow_id();
    tracing::debug!(flow_id = id, piloted, "flow received");
    Self {
      id,
      state: FlowState::Received,
      piloted,
    }
  }

  /// id
  pub fn id(&self) -> FlowId {
    self.id
  }

  /// current state
  pub fn state(&self) -> FlowState {
    self.state
  }

  /// Pilot mode as read when the flow was received.
  pub fn piloted(&self) -> bool {
    self.piloted
  }

  /// Move to `next`. Backward moves and moves out of a terminal state are
  /// ignored and reported as `false`.
  pub fn advance(&mut self, next: FlowState) -> bool {
    if !self.state.can_advance_to(next) {
      tracing::warn!(flow_id = self.id, from = %self.state, to = %next, "rejected flow transition");
      return false;
    }
    tracing::debug!(flow_id = self.id, from = %self.state, to = %next, "flow transition");
    self.state = next;
    true
  }
}
