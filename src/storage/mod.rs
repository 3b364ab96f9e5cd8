mod disk;
mod memory;

use {
  crate::consensus::{Block, Event, EventHash, Participants, Root, RoundInfo},
  serde::{Deserialize, Serialize},
  std::collections::{BTreeMap, HashMap},
  thiserror::Error,
};

pub use {disk::SledStore, memory::InmemStore};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("key not found: {0}")]
  KeyNotFound(String),

  #[error("no root for participant {0}")]
  NoRoot(String),

  #[error("unknown participant {0}")]
  UnknownParticipant(String),

  #[error("skipped index {index} for participant {participant}")]
  SkippedIndex { participant: String, index: i64 },

  #[error("serialization error: {0}")]
  Serialization(#[from] bincode::Error),

  #[error("storage engine error: {0}")]
  Engine(#[from] sled::Error),

  #[error("system io error: {0}")]
  SystemIo(#[from] std::io::Error),
}

impl StoreError {
  /// Missing keys are an expected outcome on many lookup paths and
  /// get handled by falling back to roots or defaults.
  pub fn is_not_found(&self) -> bool {
    matches!(self, StoreError::KeyNotFound(_))
  }
}

/// The persistent index the consensus state is built on. The graph
/// only ever talks to this contract; any engine providing it works.
pub trait Store: Send + Sync {
  fn cache_size(&self) -> usize;

  fn participants(&self) -> Participants;

  fn get_event(&self, hash: &str) -> Result<Event, StoreError>;
  fn set_event(&self, event: Event) -> Result<(), StoreError>;

  /// Hashes of a participant's events with index greater than
  /// `skip`, in index order.
  fn participant_events(
    &self,
    participant: &str,
    skip: i64,
  ) -> Result<Vec<EventHash>, StoreError>;

  fn participant_event(
    &self,
    participant: &str,
    index: i64,
  ) -> Result<EventHash, StoreError>;

  /// The hash of the participant's last known event, or its root's
  /// `x` when no event exists yet (second element true in that case).
  fn last_event_from(
    &self,
    participant: &str,
  ) -> Result<(EventHash, bool), StoreError>;

  /// Last known event index per participant id.
  fn known_events(&self) -> BTreeMap<usize, i64>;

  fn consensus_events(&self) -> Vec<EventHash>;
  fn consensus_events_count(&self) -> usize;
  fn add_consensus_event(&self, hash: EventHash) -> Result<(), StoreError>;

  fn get_round(&self, index: i64) -> Result<RoundInfo, StoreError>;
  fn set_round(&self, index: i64, round: RoundInfo) -> Result<(), StoreError>;
  fn last_round(&self) -> i64;

  fn round_witnesses(&self, index: i64) -> Vec<EventHash>;
  fn round_events(&self, index: i64) -> usize;

  fn get_root(&self, participant: &str) -> Result<Root, StoreError>;

  fn get_block(&self, index: i64) -> Result<Block, StoreError>;
  fn set_block(&self, block: Block) -> Result<(), StoreError>;

  /// Every stored event in local insertion order. Feeding these back
  /// through `EventGraph::insert` reproduces the graph exactly.
  fn topological_events(&self) -> Result<Vec<Event>, StoreError>;

  /// Drops all graph state and replaces the roots, keeping the
  /// participant set and any produced blocks.
  fn reset(&self, roots: HashMap<String, Root>) -> Result<(), StoreError>;

  fn close(&self) -> Result<(), StoreError>;
}

/// Per-participant chain of event hashes. Position `i` holds the
/// event at index `root_index + 1 + i`, so the log keeps working
/// after a reset onto a non-base root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ParticipantLog {
  root_index: i64,
  hashes: Vec<EventHash>,
}

impl ParticipantLog {
  pub fn new(root_index: i64) -> Self {
    Self {
      root_index,
      hashes: vec![],
    }
  }

  pub fn last_index(&self) -> i64 {
    self.root_index + self.hashes.len() as i64
  }

  pub fn last(&self) -> Option<&EventHash> {
    self.hashes.last()
  }

  pub fn get(&self, index: i64) -> Option<&EventHash> {
    let position = index.checked_sub(self.root_index + 1)?;
    if position < 0 {
      return None;
    }
    self.hashes.get(position as usize)
  }

  /// Appends the hash at `index`, tolerating replays of already
  /// recorded indexes (bootstrap feeds events through twice).
  pub fn append(
    &mut self,
    participant: &str,
    hash: EventHash,
    index: i64,
  ) -> Result<(), StoreError> {
    if index <= self.last_index() {
      return Ok(());
    }
    if index != self.last_index() + 1 {
      return Err(StoreError::SkippedIndex {
        participant: participant.to_owned(),
        index,
      });
    }
    self.hashes.push(hash);
    Ok(())
  }

  /// All hashes with index strictly greater than `skip`.
  pub fn after(&self, skip: i64) -> Vec<EventHash> {
    let from = (skip - self.root_index).max(0) as usize;
    self.hashes.iter().skip(from).cloned().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn participant_log_indexing() {
    let mut log = ParticipantLog::new(-1);
    assert_eq!(log.last_index(), -1);
    assert!(log.last().is_none());

    log.append("p", "0xA".into(), 0).unwrap();
    log.append("p", "0xB".into(), 1).unwrap();
    assert_eq!(log.last_index(), 1);
    assert_eq!(log.get(0), Some(&"0xA".to_owned()));
    assert_eq!(log.get(1), Some(&"0xB".to_owned()));
    assert_eq!(log.get(2), None);

    // replays are tolerated, gaps are not
    log.append("p", "0xA".into(), 0).unwrap();
    assert!(matches!(
      log.append("p", "0xD".into(), 5),
      Err(StoreError::SkippedIndex { index: 5, .. })
    ));

    assert_eq!(log.after(-1).len(), 2);
    assert_eq!(log.after(0), vec!["0xB".to_owned()]);
    assert!(log.after(1).is_empty());
  }

  #[test]
  fn participant_log_with_shifted_root() {
    let mut log = ParticipantLog::new(4);
    log.append("p", "0xE".into(), 5).unwrap();
    assert_eq!(log.get(5), Some(&"0xE".to_owned()));
    assert_eq!(log.get(4), None);
    assert_eq!(log.last_index(), 5);
    assert_eq!(log.after(4), vec!["0xE".to_owned()]);
  }
}
