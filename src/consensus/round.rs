use {
  super::event::EventHash,
  crate::primitives::{decode_hex, sha256},
  primitive_types::U256,
  serde::{Deserialize, Serialize},
  std::collections::BTreeMap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundEvent {
  pub witness: bool,
  /// `None` until virtual voting reaches a verdict.
  pub famous: Option<bool>,
}

/// Per-round index of events and witness fame verdicts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundInfo {
  pub events: BTreeMap<EventHash, RoundEvent>,

  /// True once the round sits in the graph's undecided queue. Never
  /// persisted; a freshly loaded round always reads back unqueued.
  #[serde(skip)]
  pub queued: bool,
}

impl RoundInfo {
  pub fn add_event(&mut self, hash: &str, witness: bool) {
    self
      .events
      .entry(hash.to_owned())
      .or_insert(RoundEvent { witness, famous: None });
  }

  pub fn len(&self) -> usize {
    self.events.len()
  }

  pub fn is_empty(&self) -> bool {
    self.events.is_empty()
  }

  pub fn witnesses(&self) -> Vec<EventHash> {
    self
      .events
      .iter()
      .filter(|(_, e)| e.witness)
      .map(|(hash, _)| hash.clone())
      .collect()
  }

  pub fn famous_witnesses(&self) -> Vec<EventHash> {
    self
      .events
      .iter()
      .filter(|(_, e)| e.witness && e.famous == Some(true))
      .map(|(hash, _)| hash.clone())
      .collect()
  }

  pub fn set_fame(&mut self, hash: &str, famous: bool) {
    if let Some(event) = self.events.get_mut(hash) {
      event.famous = Some(famous);
    }
  }

  /// True if the fame of the given witness has been decided.
  pub fn is_decided(&self, hash: &str) -> bool {
    match self.events.get(hash) {
      Some(e) => e.witness && e.famous.is_some(),
      None => false,
    }
  }

  /// True once every witness in the round has a fame verdict.
  pub fn witnesses_decided(&self) -> bool {
    self
      .events
      .values()
      .all(|e| !e.witness || e.famous.is_some())
  }

  /// Round randomness for the consensus order tie-break: XOR over
  /// the digests of the round's witness hashes. XOR commutes, so the
  /// result is independent of iteration order and identical on every
  /// node that agrees on the witness set.
  pub fn pseudo_random_number(&self) -> U256 {
    let mut acc = U256::zero();
    for (hash, event) in &self.events {
      if !event.witness {
        continue;
      }
      let raw = decode_hex(hash).unwrap_or_default();
      acc ^= U256::from_big_endian(&sha256(&raw));
    }
    acc
  }
}
