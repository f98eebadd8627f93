//! Append-only ledger of captured exchanges.
use crate::errors::{Error, Result};
use crate::events::{EventBus, ProxyEvent};
use crate::exchange::{Exchange, ExchangeKind};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Default)]
struct PairSlots {
  request: Option<Arc<Exchange>>,
  response: Option<Arc<Exchange>>,
}

#[derive(Debug, Default)]
struct Ledger {
  entries: Vec<Arc<Exchange>>,
  pairs: HashMap<String, PairSlots>,
}

/// Id-ordered record of every captured request and response.
///
/// Appends take a short write lock; readers get snapshots and never observe a
/// partially appended entry. Nothing is ever removed, so memory grows with the
/// capture.
#[derive(Debug)]
pub struct ExchangeStore {
  ledger: RwLock<Ledger>,
  events: EventBus,
}

impl ExchangeStore {
  /// Empty store publishing to `events`.
  pub fn new(events: EventBus) -> Self {
    Self {
      ledger: RwLock::new(Ledger::default()),
      events,
    }
  }

  /// Stamp the next id on `exchange`, index it by pair id and notify
  /// subscribers.
  ///
  /// Fails with [`Error::PairingCollision`] when the pair already holds an
  /// exchange of the same kind; nothing is recorded in that case.
  pub fn append(&self, exchange: Exchange) -> Result<Arc<Exchange>> {
    let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
    let kind = exchange.kind;
    let pair_id = exchange.pair_id().map(str::to_owned);
    if let Some(slots) = pair_id.as_ref().and_then(|p| ledger.pairs.get(p)) {
      let taken = match kind {
        ExchangeKind::Request => slots.request.is_some(),
        ExchangeKind::Response => slots.response.is_some(),
      };
      if taken {
        let pair_id = pair_id.unwrap_or_default();
        tracing::error!(pair_id = %pair_id, %kind, "pair id collision");
        return Err(Error::PairingCollision(pair_id));
      }
    }
    let id = ledger.entries.len() as u64 + 1;
    let stored = Arc::new(exchange.with_id(id));
    ledger.entries.push(stored.clone());
    if let Some(pair_id) = pair_id {
      let slots = ledger.pairs.entry(pair_id).or_default();
      match kind {
        ExchangeKind::Request => slots.request = Some(stored.clone()),
        ExchangeKind::Response => slots.response = Some(stored.clone()),
      }
    }
    // published under the lock so subscribers see ids in order
    self.events.publish(match kind {
      ExchangeKind::Request => ProxyEvent::Request(stored.clone()),
      ExchangeKind::Response => ProxyEvent::Response(stored.clone()),
    });
    tracing::debug!(id, %kind, "exchange appended");
    Ok(stored)
  }

  /// The response carrying `pair_id`.
  pub fn find_by_pair_id(&self, pair_id: &str) -> Option<Arc<Exchange>> {
    let ledger = self.ledger.read().unwrap_or_else(PoisonError::into_inner);
    ledger.pairs.get(pair_id).and_then(|s| s.response.clone())
  }

  /// The request carrying `pair_id`.
  pub fn request_by_pair_id(&self, pair_id: &str) -> Option<Arc<Exchange>> {
    let ledger = self.ledger.read().unwrap_or_else(PoisonError::into_inner);
    ledger.pairs.get(pair_id).and_then(|s| s.request.clone())
  }

  /// Exchange by id.
  pub fn get(&self, id: u64) -> Option<Arc<Exchange>> {
    let ledger = self.ledger.read().unwrap_or_else(PoisonError::into_inner);
    id.checked_sub(1)
      .and_then(|index| ledger.entries.get(index as usize).cloned())
  }

  /// Snapshot in insertion order.
  pub fn all(&self) -> Vec<Arc<Exchange>> {
    let ledger = self.ledger.read().unwrap_or_else(PoisonError::into_inner);
    ledger.entries.clone()
  }

  /// Number of entries, which is also the highest id handed out.
  pub fn count(&self) -> u64 {
    let ledger = self.ledger.read().unwrap_or_else(PoisonError::into_inner);
    ledger.entries.len() as u64
  }

  /// Receive an event for every later append.
  pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
    self.events.subscribe()
  }
}
