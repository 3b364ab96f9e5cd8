use {
  super::{ParticipantLog, Store, StoreError},
  crate::consensus::{Block, Event, EventHash, Participants, Root, RoundInfo},
  lru::LruCache,
  std::{
    collections::{BTreeMap, HashMap},
    num::NonZeroUsize,
    path::Path,
    sync::RwLock,
  },
};

const EVENTS_TREE: &str = "events";
const TOPOLOGICAL_TREE: &str = "topological";
const ROUNDS_TREE: &str = "rounds";
const BLOCKS_TREE: &str = "blocks";
const ROOTS_TREE: &str = "roots";

/// Durable store on a sled database. Event bodies, rounds, blocks
/// and roots live on disk; the per-participant event chains and the
/// consensus tape are session state rebuilt by `bootstrap`, which
/// replays the topological tree through a fresh graph.
pub struct SledStore {
  cache_size: usize,
  participants: Participants,
  db: sled::Db,
  events: sled::Tree,
  topological: sled::Tree,
  rounds: sled::Tree,
  blocks: sled::Tree,
  roots: sled::Tree,
  session: RwLock<Session>,
}

struct Session {
  event_cache: LruCache<EventHash, Event>,
  round_cache: LruCache<i64, RoundInfo>,
  logs: HashMap<String, ParticipantLog>,
  consensus: Vec<EventHash>,
  last_round: i64,
  topological_count: u64,
}

impl Session {
  fn new(cache_size: usize, roots: &HashMap<String, Root>) -> Self {
    let capacity =
      NonZeroUsize::new(cache_size.max(1)).expect("capacity is nonzero");
    Self {
      event_cache: LruCache::new(capacity),
      round_cache: LruCache::new(capacity),
      logs: roots
        .iter()
        .map(|(p, root)| (p.clone(), ParticipantLog::new(root.index)))
        .collect(),
      consensus: vec![],
      last_round: -1,
      topological_count: 0,
    }
  }
}

impl SledStore {
  pub fn new(
    directory: &Path,
    participants: Participants,
    cache_size: usize,
  ) -> Result<Self, StoreError> {
    std::fs::create_dir_all(directory)?;
    let db = sled::open(directory)?;

    let events = db.open_tree(EVENTS_TREE)?;
    let topological = db.open_tree(TOPOLOGICAL_TREE)?;
    let rounds = db.open_tree(ROUNDS_TREE)?;
    let blocks = db.open_tree(BLOCKS_TREE)?;
    let roots_tree = db.open_tree(ROOTS_TREE)?;

    // seed base roots on first open, load existing ones otherwise
    let mut roots = HashMap::new();
    for key in participants.keys() {
      let root = match roots_tree.get(key.as_bytes())? {
        Some(bytes) => bincode::deserialize(&bytes)?,
        None => {
          let root = Root::base();
          roots_tree.insert(key.as_bytes(), bincode::serialize(&root)?)?;
          root
        }
      };
      roots.insert(key.to_owned(), root);
    }

    let mut session = Session::new(cache_size, &roots);
    session.topological_count = topological.len() as u64;

    Ok(Self {
      cache_size,
      participants,
      db,
      events,
      topological,
      rounds,
      blocks,
      roots: roots_tree,
      session: RwLock::new(session),
    })
  }

  fn root_of(&self, participant: &str) -> Result<Root, StoreError> {
    match self.roots.get(participant.as_bytes())? {
      Some(bytes) => Ok(bincode::deserialize(&bytes)?),
      None => Err(StoreError::NoRoot(participant.to_owned())),
    }
  }
}

impl Store for SledStore {
  fn cache_size(&self) -> usize {
    self.cache_size
  }

  fn participants(&self) -> Participants {
    self.participants.clone()
  }

  fn get_event(&self, hash: &str) -> Result<Event, StoreError> {
    let mut session = self.session.write().expect("store lock poisoned");
    if let Some(event) = session.event_cache.get(hash) {
      return Ok(event.clone());
    }
    match self.events.get(hash.as_bytes())? {
      Some(bytes) => {
        let event: Event = bincode::deserialize(&bytes)?;
        session.event_cache.put(hash.to_owned(), event.clone());
        Ok(event)
      }
      None => Err(StoreError::KeyNotFound(hash.to_owned())),
    }
  }

  fn set_event(&self, event: Event) -> Result<(), StoreError> {
    let mut session = self.session.write().expect("store lock poisoned");
    let hash = event.hex();
    let creator = event.creator_hex();

    let log = session
      .logs
      .get_mut(&creator)
      .ok_or_else(|| StoreError::UnknownParticipant(creator.clone()))?;
    log.append(&creator, hash.clone(), event.index())?;

    if !self.events.contains_key(hash.as_bytes())? {
      let position = session.topological_count;
      self
        .topological
        .insert(position.to_be_bytes(), hash.as_bytes())?;
      session.topological_count += 1;
    }

    self
      .events
      .insert(hash.as_bytes(), bincode::serialize(&event)?)?;
    session.event_cache.put(hash, event);
    Ok(())
  }

  fn participant_events(
    &self,
    participant: &str,
    skip: i64,
  ) -> Result<Vec<EventHash>, StoreError> {
    let session = self.session.read().expect("store lock poisoned");
    let log = session
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
    let session = self.session.read().expect("store lock poisoned");
    let log = session
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
    {
      let session = self.session.read().expect("store lock poisoned");
      if let Some(last) =
        session.logs.get(participant).and_then(ParticipantLog::last)
      {
        return Ok((last.clone(), false));
      }
    }
    let root = self.root_of(participant)?;
    Ok((root.x, true))
  }

  fn known_events(&self) -> BTreeMap<usize, i64> {
    let session = self.session.read().expect("store lock poisoned");
    self
      .participants
      .iter()
      .map(|(key, id)| {
        let last = session.logs.get(key).map(|l| l.last_index()).unwrap_or(-1);
        (id, last)
      })
      .collect()
  }

  fn consensus_events(&self) -> Vec<EventHash> {
    self
      .session
      .read()
      .expect("store lock poisoned")
      .consensus
      .clone()
  }

  fn consensus_events_count(&self) -> usize {
    self.session.read().expect("store lock poisoned").consensus.len()
  }

  fn add_consensus_event(&self, hash: EventHash) -> Result<(), StoreError> {
    let mut session = self.session.write().expect("store lock poisoned");
    session.consensus.push(hash);
    Ok(())
  }

  fn get_round(&self, index: i64) -> Result<RoundInfo, StoreError> {
    let mut session = self.session.write().expect("store lock poisoned");
    if let Some(round) = session.round_cache.get(&index) {
      return Ok(round.clone());
    }
    match self.rounds.get(index.to_be_bytes())? {
      Some(bytes) => {
        // deserialized rounds always come back unqueued
        let round: RoundInfo = bincode::deserialize(&bytes)?;
        session.round_cache.put(index, round.clone());
        Ok(round)
      }
      None => Err(StoreError::KeyNotFound(format!("round {index}"))),
    }
  }

  fn set_round(&self, index: i64, round: RoundInfo) -> Result<(), StoreError> {
    let mut session = self.session.write().expect("store lock poisoned");
    self
      .rounds
      .insert(index.to_be_bytes(), bincode::serialize(&round)?)?;
    session.round_cache.put(index, round);
    if index > session.last_round {
      session.last_round = index;
    }
    Ok(())
  }

  fn last_round(&self) -> i64 {
    self.session.read().expect("store lock poisoned").last_round
  }

  fn round_witnesses(&self, index: i64) -> Vec<EventHash> {
    self
      .get_round(index)
      .map(|round| round.witnesses())
      .unwrap_or_default()
  }

  fn round_events(&self, index: i64) -> usize {
    self.get_round(index).map(|round| round.len()).unwrap_or(0)
  }

  fn get_root(&self, participant: &str) -> Result<Root, StoreError> {
    self.root_of(participant)
  }

  fn get_block(&self, index: i64) -> Result<Block, StoreError> {
    match self.blocks.get(index.to_be_bytes())? {
      Some(bytes) => Ok(bincode::deserialize(&bytes)?),
      None => Err(StoreError::KeyNotFound(format!("block {index}"))),
    }
  }

  fn set_block(&self, block: Block) -> Result<(), StoreError> {
    self
      .blocks
      .insert(block.index().to_be_bytes(), bincode::serialize(&block)?)?;
    Ok(())
  }

  fn topological_events(&self) -> Result<Vec<Event>, StoreError> {
    let mut events = vec![];
    for entry in self.topological.iter() {
      let (_, hash) = entry?;
      let hash = String::from_utf8_lossy(&hash).into_owned();
      match self.events.get(hash.as_bytes())? {
        Some(bytes) => events.push(bincode::deserialize(&bytes)?),
        None => return Err(StoreError::KeyNotFound(hash)),
      }
    }
    Ok(events)
  }

  fn reset(&self, roots: HashMap<String, Root>) -> Result<(), StoreError> {
    let mut session = self.session.write().expect("store lock poisoned");

    self.events.clear()?;
    self.topological.clear()?;
    self.rounds.clear()?;
    self.roots.clear()?;
    for (participant, root) in &roots {
      self
        .roots
        .insert(participant.as_bytes(), bincode::serialize(root)?)?;
    }

    *session = Session::new(self.cache_size, &roots);
    Ok(())
  }

  fn close(&self) -> Result<(), StoreError> {
    self.db.flush()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::test::utils::{keyring, participants_of},
  };

  fn signed_event(
    keypair: &crate::primitives::Keypair,
    self_parent: &str,
    index: i64,
    payload: &[u8],
  ) -> Event {
    let mut event = Event::new(
      vec![payload.to_vec()],
      vec![],
      [self_parent.to_owned(), String::new()],
      keypair.public(),
      index,
    );
    event.sign(keypair);
    event
  }

  #[test]
  fn events_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let keys = keyring(1);
    let creator = keys[0].public().to_string();

    let e0 = signed_event(&keys[0], "", 0, b"zero");
    let h0 = e0.hex();
    let e1 = signed_event(&keys[0], &h0, 1, b"one");
    let h1 = e1.hex();

    {
      let store =
        SledStore::new(dir.path(), participants_of(&keys), 16).unwrap();
      store.set_event(e0).unwrap();
      store.set_event(e1).unwrap();
      store.set_block(Block::new(0, 1, vec![b"tx".to_vec()])).unwrap();
      store.close().unwrap();
    }

    let store =
      SledStore::new(dir.path(), participants_of(&keys), 16).unwrap();
    let replayed = store.topological_events().unwrap();
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].hex(), h0);
    assert_eq!(replayed[1].hex(), h1);
    assert_eq!(store.get_block(0).unwrap().transactions().len(), 1);

    // session index is empty until a bootstrap replays the events
    let (last, is_root) = store.last_event_from(&creator).unwrap();
    assert!(is_root);
    assert_eq!(last, "");
  }

  #[test]
  fn round_queued_flag_resets_on_disk_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let keys = keyring(1);
    let store = SledStore::new(dir.path(), participants_of(&keys), 1).unwrap();

    let mut round = RoundInfo::default();
    round.add_event("0xAA", true);
    round.queued = true;
    store.set_round(0, round).unwrap();

    // evict the cached copy (capacity 1), forcing a disk read
    store.set_round(1, RoundInfo::default()).unwrap();
    assert!(!store.get_round(0).unwrap().queued);
    assert_eq!(store.last_round(), 1);
  }
}
