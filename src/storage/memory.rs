use {
  super::{ParticipantLog, Store, StoreError},
  crate::consensus::{Block, Event, EventHash, Participants, Root, RoundInfo},
  std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
  },
};

/// Volatile store backing tests, simulations and nodes that accept
/// rebuilding from their peers after a restart.
pub struct InmemStore {
  cache_size: usize,
  participants: Participants,
  inner: RwLock<Inner>,
}

struct Inner {
  events: HashMap<EventHash, Event>,
  topological: Vec<EventHash>,
  logs: HashMap<String, ParticipantLog>,
  rounds: BTreeMap<i64, RoundInfo>,
  blocks: BTreeMap<i64, Block>,
  consensus: Vec<EventHash>,
  roots: HashMap<String, Root>,
  last_round: i64,
}

impl Inner {
  fn new(roots: HashMap<String, Root>) -> Self {
    let logs = roots
      .iter()
      .map(|(p, root)| (p.clone(), ParticipantLog::new(root.index)))
      .collect();
    Self {
      events: HashMap::new(),
      topological: vec![],
      logs,
      rounds: BTreeMap::new(),
      blocks: BTreeMap::new(),
      consensus: vec![],
      roots,
      last_round: -1,
    }
  }
}

impl InmemStore {
  pub fn new(participants: Participants, cache_size: usize) -> Self {
    let roots = participants
      .keys()
      .map(|p| (p.to_owned(), Root::base()))
      .collect();
    Self {
      cache_size,
      participants,
      inner: RwLock::new(Inner::new(roots)),
    }
  }
}

impl Store for InmemStore {
  fn cache_size(&self) -> usize {
    self.cache_size
  }

  fn participants(&self) -> Participants {
    self.participants.clone()
  }

  fn get_event(&self, hash: &str) -> Result<Event, StoreError> {
    let inner = self.inner.read().expect("store lock poisoned");
    inner
      .events
      .get(hash)
      .cloned()
      .ok_or_else(|| StoreError::KeyNotFound(hash.to_owned()))
  }

  fn set_event(&self, event: Event) -> Result<(), StoreError> {
    let mut inner = self.inner.write().expect("store lock poisoned");
    let hash = event.hex();
    let creator = event.creator_hex();
    if !inner.events.contains_key(&hash) {
      let log = inner
        .logs
        .get_mut(&creator)
        .ok_or_else(|| StoreError::UnknownParticipant(creator.clone()))?;
      log.append(&creator, hash.clone(), event.index())?;
      inner.topological.push(hash.clone());
    }
    inner.events.insert(hash, event);
    Ok(())
  }

  fn participant_events(
    &self,
    participant: &str,
    skip: i64,
  ) -> Result<Vec<EventHash>, StoreError> {
    let inner = self.inner.read().expect("store lock poisoned");
    let log = inner
      .logs
      .get(participant)
      .ok_or_else(|| StoreError::UnknownParticipant(participant.to_owned()))?;
    Ok(log.after(skip))
  }

  fn participant_event(
    &self,
    participant: &str,
    index: i64,
  ) -> Result<EventHash, StoreError> {
    let inner = self.inner.read().expect("store lock poisoned");
    let log = inner
      .logs
      .get(participant)
      .ok_or_else(|| StoreError::UnknownParticipant(participant.to_owned()))?;
    log
      .get(index)
      .cloned()
      .ok_or_else(|| StoreError::KeyNotFound(format!("{participant}@{index}")))
  }

  fn last_event_from(
    &self,
    participant: &str,
  ) -> Result<(EventHash, bool), StoreError> {
    let inner = self.inner.read().expect("store lock poisoned");
    if let Some(last) = inner.logs.get(participant).and_then(ParticipantLog::last)
    {
      return Ok((last.clone(), false));
    }
    match inner.roots.get(participant) {
      Some(root) => Ok((root.x.clone(), true)),
      None => Err(StoreError::NoRoot(participant.to_owned())),
    }
  }

  fn known_events(&self) -> BTreeMap<usize, i64> {
    let inner = self.inner.read().expect("store lock poisoned");
    self
      .participants
      .iter()
      .map(|(key, id)| {
        let last = inner.logs.get(key).map(|l| l.last_index()).unwrap_or(-1);
        (id, last)
      })
      .collect()
  }

  fn consensus_events(&self) -> Vec<EventHash> {
    self.inner.read().expect("store lock poisoned").consensus.clone()
  }

  fn consensus_events_count(&self) -> usize {
    self.inner.read().expect("store lock poisoned").consensus.len()
  }

  fn add_consensus_event(&self, hash: EventHash) -> Result<(), StoreError> {
    let mut inner = self.inner.write().expect("store lock poisoned");
    inner.consensus.push(hash);
    Ok(())
  }

  fn get_round(&self, index: i64) -> Result<RoundInfo, StoreError> {
    let inner = self.inner.read().expect("store lock poisoned");
    inner
      .rounds
      .get(&index)
      .cloned()
      .ok_or_else(|| StoreError::KeyNotFound(format!("round {index}")))
  }

  fn set_round(&self, index: i64, round: RoundInfo) -> Result<(), StoreError> {
    let mut inner = self.inner.write().expect("store lock poisoned");
    inner.rounds.insert(index, round);
    if index > inner.last_round {
      inner.last_round = index;
    }
    Ok(())
  }

  fn last_round(&self) -> i64 {
    self.inner.read().expect("store lock poisoned").last_round
  }

  fn round_witnesses(&self, index: i64) -> Vec<EventHash> {
    let inner = self.inner.read().expect("store lock poisoned");
    inner
      .rounds
      .get(&index)
      .map(RoundInfo::witnesses)
      .unwrap_or_default()
  }

  fn round_events(&self, index: i64) -> usize {
    let inner = self.inner.read().expect("store lock poisoned");
    inner.rounds.get(&index).map(RoundInfo::len).unwrap_or(0)
  }

  fn get_root(&self, participant: &str) -> Result<Root, StoreError> {
    let inner = self.inner.read().expect("store lock poisoned");
    inner
      .roots
      .get(participant)
      .cloned()
      .ok_or_else(|| StoreError::KeyNotFound(participant.to_owned()))
  }

  fn get_block(&self, index: i64) -> Result<Block, StoreError> {
    let inner = self.inner.read().expect("store lock poisoned");
    inner
      .blocks
      .get(&index)
      .cloned()
      .ok_or_else(|| StoreError::KeyNotFound(format!("block {index}")))
  }

  fn set_block(&self, block: Block) -> Result<(), StoreError> {
    let mut inner = self.inner.write().expect("store lock poisoned");
    inner.blocks.insert(block.index(), block);
    Ok(())
  }

  fn topological_events(&self) -> Result<Vec<Event>, StoreError> {
    let inner = self.inner.read().expect("store lock poisoned");
    inner
      .topological
      .iter()
      .map(|hash| {
        inner
          .events
          .get(hash)
          .cloned()
          .ok_or_else(|| StoreError::KeyNotFound(hash.clone()))
      })
      .collect()
  }

  fn reset(&self, roots: HashMap<String, Root>) -> Result<(), StoreError> {
    let mut inner = self.inner.write().expect("store lock poisoned");
    // blocks survive a reset, everything derived from events goes
    let blocks = std::mem::take(&mut inner.blocks);
    *inner = Inner::new(roots);
    inner.blocks = blocks;
    Ok(())
  }

  fn close(&self) -> Result<(), StoreError> {
    Ok(())
  }
}
