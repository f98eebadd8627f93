//! Request/response correlation.
//!
//! Every request gets a random 128-bit token in the internal `pair-id` header
//! as soon as it is parsed; the pipeline copies it onto the response so the two
//! can be joined in the [`ExchangeStore`].
use crate::exchange::{Exchange, ExchangeKind};
use crate::store::ExchangeStore;
use std::sync::Arc;
use uuid::Uuid;

/// Name of the internal correlation header, as stored (lower-case).
pub const PAIR_ID_HEADER: &str = "pair-id";

/// A fresh correlation token.
pub fn new_pair_id() -> String {
  Uuid::new_v4().to_string()
}

/// The response paired with `pair_id`, if it has been captured.
pub fn find_match(pair_id: &str, store: &ExchangeStore) -> Option<Arc<Exchange>> {
  store.find_by_pair_id(pair_id)
}

/// Like [`find_match`] but returns the empty placeholder instead of `None`.
pub fn find_match_or_empty(pair_id: &str, store: &ExchangeStore) -> Arc<Exchange> {
  find_match(pair_id, store).unwrap_or_else(|| Arc::new(Exchange::empty(ExchangeKind::Response)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::events::EventBus;
  use crate::exchange::Headers;
  use std::collections::HashSet;

  #[test]
  fn pair_ids_are_unique() {
    let ids: HashSet<String> = (0..10_000).map(|_| new_pair_id()).collect();
    assert_eq!(ids.len(), 10_000);
  }

  #[test]
  fn unmatched_pair_resolves_to_placeholder() {
    let store = ExchangeStore::new(EventBus::new(16));
    assert!(find_match("nope", &store).is_none());
    let empty = find_match_or_empty("nope", &store);
    assert!(empty.is_placeholder());

    let mut headers = Headers::new();
    headers.append(PAIR_ID_HEADER, "abc").unwrap();
    store
      .append(Exchange::response(200, "HTTP/1.1", headers, ""))
      .unwrap();
    let found = find_match_or_empty("abc", &store);
    assert!(!found.is_placeholder());
    assert_ne!(*found, Exchange::empty(ExchangeKind::Response));
  }
}
