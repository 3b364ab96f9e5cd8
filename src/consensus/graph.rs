use {
  super::{
    block::{Block, BlockSignature},
    event::{Event, EventCoordinates, EventHash, WireEvent},
    peers::Participants,
    root::Root,
    round::RoundInfo,
    sorter::sort_consensus_events,
    ConsensusError,
  },
  crate::{
    primitives::{decode_hex, Pubkey},
    storage::Store,
  },
  chrono::{DateTime, Utc},
  indexmap::IndexMap,
  lru::LruCache,
  std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    num::NonZeroUsize,
    str::FromStr,
    sync::Arc,
  },
  tokio::sync::mpsc,
  tracing::warn,
};

/// Round information derived from an event's parents: the greater of
/// the parent rounds, and whether it was taken from the creator's
/// root rather than a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentRound {
  pub round: i64,
  pub is_root: bool,
}

impl Default for ParentRound {
  fn default() -> Self {
    Self {
      round: -1,
      is_root: false,
    }
  }
}

/// A self-contained slice of history: roots plus every event above
/// them, enough to rehydrate a node without its full event log.
#[derive(Debug, Clone)]
pub struct Frame {
  pub roots: HashMap<String, Root>,
  pub events: Vec<Event>,
}

type PairCache<V> = RefCell<LruCache<(EventHash, EventHash), V>>;

/// The event DAG and the virtual-voting consensus that runs on top
/// of it.
///
/// Ancestry questions never walk the graph: every event carries the
/// index of the latest ancestor and earliest descendant it knows of
/// per participant, so `ancestor_of` and `strongly_sees` are integer
/// comparisons over those coordinates. The query layer memoizes in
/// bounded LRU caches owned by this value.
pub struct EventGraph {
  participants: Participants,
  store: Arc<dyn Store>,

  /// Events that do not have a round received yet, in insertion
  /// order.
  undetermined_events: Vec<EventHash>,
  /// Rounds with witnesses whose fame is still open.
  undecided_rounds: Vec<i64>,

  last_consensus_round: Option<i64>,
  last_block_index: i64,
  last_committed_round_events: usize,
  consensus_transactions: usize,
  pending_loaded_events: usize,
  topological_index: i64,
  quorum: usize,

  commit_tx: Option<mpsc::Sender<Block>>,

  ancestor_cache: PairCache<bool>,
  self_ancestor_cache: PairCache<bool>,
  oldest_self_ancestor_cache: PairCache<EventHash>,
  strongly_sees_cache: PairCache<bool>,
  parent_round_cache: RefCell<LruCache<EventHash, ParentRound>>,
  round_cache: RefCell<LruCache<EventHash, i64>>,
}

fn cache_capacity(store: &dyn Store) -> NonZeroUsize {
  NonZeroUsize::new(store.cache_size().max(1)).expect("capacity is nonzero")
}

impl EventGraph {
  pub fn new(
    participants: Participants,
    store: Arc<dyn Store>,
    commit_tx: Option<mpsc::Sender<Block>>,
  ) -> Self {
    let capacity = cache_capacity(store.as_ref());
    let quorum = 2 * participants.len() / 3 + 1;
    Self {
      participants,
      store,
      undetermined_events: vec![],
      undecided_rounds: vec![0],
      last_consensus_round: None,
      last_block_index: -1,
      last_committed_round_events: 0,
      consensus_transactions: 0,
      pending_loaded_events: 0,
      topological_index: 0,
      quorum,
      commit_tx,
      ancestor_cache: RefCell::new(LruCache::new(capacity)),
      self_ancestor_cache: RefCell::new(LruCache::new(capacity)),
      oldest_self_ancestor_cache: RefCell::new(LruCache::new(capacity)),
      strongly_sees_cache: RefCell::new(LruCache::new(capacity)),
      parent_round_cache: RefCell::new(LruCache::new(capacity)),
      round_cache: RefCell::new(LruCache::new(capacity)),
    }
  }

  /// `2n/3 + 1`, the witness majority every consensus decision needs.
  pub fn quorum(&self) -> usize {
    self.quorum
  }

  pub fn participants(&self) -> &Participants {
    &self.participants
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  pub fn undetermined_events(&self) -> &[EventHash] {
    &self.undetermined_events
  }

  pub fn last_consensus_round(&self) -> Option<i64> {
    self.last_consensus_round
  }

  pub fn last_block_index(&self) -> i64 {
    self.last_block_index
  }

  pub fn last_committed_round_events(&self) -> usize {
    self.last_committed_round_events
  }

  pub fn consensus_transactions(&self) -> usize {
    self.consensus_transactions
  }

  pub fn pending_loaded_events(&self) -> usize {
    self.pending_loaded_events
  }

  pub fn known_events(&self) -> BTreeMap<usize, i64> {
    self.store.known_events()
  }

  pub fn consensus_events(&self) -> Vec<EventHash> {
    self.store.consensus_events()
  }

  // ---- ancestry queries ------------------------------------------------

  /// True iff `y` is reachable from `x` through parent links,
  /// including `x == y`.
  pub fn ancestor_of(&self, x: &str, y: &str) -> bool {
    let key = (x.to_owned(), y.to_owned());
    if let Some(cached) = self.ancestor_cache.borrow_mut().get(&key) {
      return *cached;
    }
    let result = self.ancestor(x, y);
    self.ancestor_cache.borrow_mut().put(key, result);
    result
  }

  fn ancestor(&self, x: &str, y: &str) -> bool {
    if x == y {
      return true;
    }
    let (ex, ey) = match (self.store.get_event(x), self.store.get_event(y)) {
      (Ok(ex), Ok(ey)) => (ex, ey),
      _ => return false,
    };
    match self.participants.id_of(&ey.creator_hex()) {
      Some(creator) => ex.last_ancestors[creator].index >= ey.index(),
      None => false,
    }
  }

  /// True iff `x` and `y` share a creator and `x` is at or above `y`
  /// in that creator's chain.
  pub fn self_ancestor(&self, x: &str, y: &str) -> bool {
    let key = (x.to_owned(), y.to_owned());
    if let Some(cached) = self.self_ancestor_cache.borrow_mut().get(&key) {
      return *cached;
    }
    let result = self.self_ancestor_uncached(x, y);
    self.self_ancestor_cache.borrow_mut().put(key, result);
    result
  }

  fn self_ancestor_uncached(&self, x: &str, y: &str) -> bool {
    if x == y {
      return true;
    }
    let (ex, ey) = match (self.store.get_event(x), self.store.get_event(y)) {
      (Ok(ex), Ok(ey)) => (ex, ey),
      _ => return false,
    };
    ex.creator_hex() == ey.creator_hex() && ex.index() >= ey.index()
  }

  /// Forks are rejected at insertion, so seeing degenerates to plain
  /// ancestry.
  pub fn sees(&self, x: &str, y: &str) -> bool {
    self.ancestor_of(x, y)
  }

  /// The earliest event in `x`'s self-parent chain that sees `y`, or
  /// empty if even `x` itself does not.
  pub fn oldest_self_ancestor_to_see(&self, x: &str, y: &str) -> EventHash {
    let key = (x.to_owned(), y.to_owned());
    if let Some(cached) = self.oldest_self_ancestor_cache.borrow_mut().get(&key)
    {
      return cached.clone();
    }
    let result = self.oldest_self_ancestor_uncached(x, y);
    self
      .oldest_self_ancestor_cache
      .borrow_mut()
      .put(key, result.clone());
    result
  }

  fn oldest_self_ancestor_uncached(&self, x: &str, y: &str) -> EventHash {
    let (ex, ey) = match (self.store.get_event(x), self.store.get_event(y)) {
      (Ok(ex), Ok(ey)) => (ex, ey),
      _ => return String::new(),
    };
    let creator = match self.participants.id_of(&ex.creator_hex()) {
      Some(creator) => creator,
      None => return String::new(),
    };
    let first = &ey.first_descendants[creator];
    if first.index <= ex.index() {
      first.hash.clone()
    } else {
      String::new()
    }
  }

  /// True iff `x` sees `y` through at least a quorum of distinct
  /// participants' events.
  pub fn strongly_sees(&self, x: &str, y: &str) -> bool {
    let key = (x.to_owned(), y.to_owned());
    if let Some(cached) = self.strongly_sees_cache.borrow_mut().get(&key) {
      return *cached;
    }
    let result = self.strongly_sees_uncached(x, y);
    self.strongly_sees_cache.borrow_mut().put(key, result);
    result
  }

  fn strongly_sees_uncached(&self, x: &str, y: &str) -> bool {
    let (ex, ey) = match (self.store.get_event(x), self.store.get_event(y)) {
      (Ok(ex), Ok(ey)) => (ex, ey),
      _ => return false,
    };
    let paths = ex
      .last_ancestors
      .iter()
      .zip(ey.first_descendants.iter())
      .filter(|(last, first)| last.index >= first.index)
      .count();
    paths >= self.quorum
  }

  // ---- rounds ----------------------------------------------------------

  pub fn parent_round(&self, x: &str) -> ParentRound {
    if let Some(cached) = self.parent_round_cache.borrow_mut().get(x) {
      return *cached;
    }
    let result = self.parent_round_uncached(x);
    self
      .parent_round_cache
      .borrow_mut()
      .put(x.to_owned(), result);
    result
  }

  fn parent_round_uncached(&self, x: &str) -> ParentRound {
    let ex = match self.store.get_event(x) {
      Ok(ex) => ex,
      Err(_) => return ParentRound::default(),
    };
    let root = match self.store.get_root(&ex.creator_hex()) {
      Ok(root) => root,
      Err(_) => return ParentRound::default(),
    };

    // the first event above the root takes the root's round
    let (sp_round, sp_root) = if ex.self_parent() == root.x {
      (root.round, true)
    } else {
      (self.round(ex.self_parent()), false)
    };

    let mut op_round = -1;
    let mut op_root = false;
    if self.store.get_event(ex.other_parent()).is_ok() {
      op_round = self.round(ex.other_parent());
    } else if ex.other_parent() == root.y {
      op_round = root.round;
      op_root = true;
    } else if root.others.get(&ex.hex()).map(String::as_str)
      == Some(ex.other_parent())
    {
      // the other-parent's true round may be lower than the root's,
      // but only the max of both parents matters here
      op_round = root.round;
    }

    if sp_round < op_round {
      ParentRound {
        round: op_round,
        is_root: op_root,
      }
    } else {
      ParentRound {
        round: sp_round,
        is_root: sp_root,
      }
    }
  }

  /// True iff `x` is the first event of its creator in its round.
  pub fn witness(&self, x: &str) -> bool {
    let ex = match self.store.get_event(x) {
      Ok(ex) => ex,
      Err(_) => return false,
    };
    let root = match self.store.get_root(&ex.creator_hex()) {
      Ok(root) => root,
      Err(_) => return false,
    };
    if ex.self_parent() == root.x && ex.other_parent() == root.y {
      return true;
    }
    self.round(x) > self.round(ex.self_parent())
  }

  /// True iff `x` opens a new round: it sits directly on a root, or
  /// it strongly sees a quorum of the parent round's witnesses.
  pub fn round_inc(&self, x: &str) -> bool {
    let parent_round = self.parent_round(x);
    if parent_round.is_root {
      return true;
    }
    let seen = self
      .store
      .round_witnesses(parent_round.round)
      .iter()
      .filter(|w| self.strongly_sees(x, w))
      .count();
    seen >= self.quorum
  }

  pub fn round(&self, x: &str) -> i64 {
    if let Some(cached) = self.round_cache.borrow_mut().get(x) {
      return *cached;
    }
    let mut round = self.parent_round(x).round;
    if self.round_inc(x) {
      round += 1;
    }
    self.round_cache.borrow_mut().put(x.to_owned(), round);
    round
  }

  pub fn round_received(&self, x: &str) -> Option<i64> {
    self
      .store
      .get_event(x)
      .ok()
      .and_then(|ex| ex.round_received)
  }

  // ---- insertion -------------------------------------------------------

  /// Validates and stores an event, wiring it into the coordinate
  /// indexes. `set_wire_info` resolves the compact parent references
  /// for events created locally; events arriving from the wire carry
  /// theirs already.
  pub fn insert(
    &mut self,
    mut event: Event,
    set_wire_info: bool,
  ) -> Result<(), ConsensusError> {
    if !event.verify()? {
      return Err(ConsensusError::InvalidSignature);
    }
    self.check_self_parent(&event)?;
    self.check_other_parent(&event)?;

    event.topological_index = self.topological_index;
    self.topological_index += 1;

    if set_wire_info {
      self.set_wire_info(&mut event)?;
    }
    self.init_event_coordinates(&mut event)?;

    let hash = event.hex();
    let loaded = event.is_loaded();
    let creator_id = self
      .participants
      .id_of(&event.creator_hex())
      .ok_or_else(|| ConsensusError::UnknownParticipant(event.creator_hex()))?;
    let index = event.index();
    let last_ancestors = event.last_ancestors.clone();
    let block_signatures = event.block_signatures().to_vec();

    self.store.set_event(event)?;
    self.update_ancestor_first_descendant(
      creator_id,
      index,
      &hash,
      &last_ancestors,
    )?;

    self.undetermined_events.push(hash);
    if loaded {
      self.pending_loaded_events += 1;
    }
    self.record_block_signatures(&block_signatures);
    Ok(())
  }

  /// The self-parent must be the creator's last known event. This is
  /// what makes forks unrepresentable: a second event at the same
  /// `(creator, index)` necessarily names a stale self-parent.
  fn check_self_parent(&self, event: &Event) -> Result<(), ConsensusError> {
    let (last, _) = self.store.last_event_from(&event.creator_hex())?;
    if event.self_parent() != last {
      return Err(ConsensusError::SelfParentMismatch);
    }
    Ok(())
  }

  /// The other-parent must be stored, or referenced by the creator's
  /// root when history below the root was truncated.
  fn check_other_parent(&self, event: &Event) -> Result<(), ConsensusError> {
    let other_parent = event.other_parent();
    if other_parent.is_empty() {
      return Ok(());
    }
    if self.store.get_event(other_parent).is_ok() {
      return Ok(());
    }
    let root = self.store.get_root(&event.creator_hex())?;
    if root.x == event.self_parent() && root.y == other_parent {
      return Ok(());
    }
    if root.others.get(&event.hex()).map(String::as_str) == Some(other_parent)
    {
      return Ok(());
    }
    Err(ConsensusError::UnknownOtherParent)
  }

  fn init_event_coordinates(
    &self,
    event: &mut Event,
  ) -> Result<(), ConsensusError> {
    let members = self.participants.len();

    event.first_descendants = (0..members)
      .map(|_| EventCoordinates::new(i64::MAX, String::new()))
      .collect();

    let self_parent = self.store.get_event(event.self_parent());
    let other_parent = self.store.get_event(event.other_parent());
    event.last_ancestors = match (self_parent, other_parent) {
      (Err(_), Err(_)) => (0..members)
        .map(|_| EventCoordinates::new(-1, String::new()))
        .collect(),
      (Ok(sp), Err(_)) => sp.last_ancestors,
      (Err(_), Ok(op)) => op.last_ancestors,
      (Ok(sp), Ok(op)) => {
        let mut merged = sp.last_ancestors;
        for (ours, theirs) in merged.iter_mut().zip(op.last_ancestors) {
          if ours.index < theirs.index {
            *ours = theirs;
          }
        }
        merged
      }
    };

    let creator_id = self
      .participants
      .id_of(&event.creator_hex())
      .ok_or_else(|| ConsensusError::UnknownParticipant(event.creator_hex()))?;
    let own = EventCoordinates::new(event.index(), event.hex());
    event.first_descendants[creator_id] = own.clone();
    event.last_ancestors[creator_id] = own;
    Ok(())
  }

  /// Walks each last-ancestor's self-parent chain and stamps this
  /// event as the first descendant for its creator wherever none is
  /// recorded yet.
  fn update_ancestor_first_descendant(
    &self,
    creator_id: usize,
    index: i64,
    hash: &str,
    last_ancestors: &[EventCoordinates],
  ) -> Result<(), ConsensusError> {
    for coordinate in last_ancestors {
      let mut cursor = coordinate.hash.clone();
      while !cursor.is_empty() {
        let mut ancestor = match self.store.get_event(&cursor) {
          Ok(ancestor) => ancestor,
          Err(_) => break,
        };
        if ancestor.first_descendants[creator_id].index != i64::MAX {
          break;
        }
        ancestor.first_descendants[creator_id] =
          EventCoordinates::new(index, hash.to_owned());
        cursor = ancestor.self_parent().to_owned();
        self.store.set_event(ancestor)?;
      }
    }
    Ok(())
  }

  fn set_wire_info(&self, event: &mut Event) -> Result<(), ConsensusError> {
    let creator = event.creator_hex();
    let creator_id = self
      .participants
      .id_of(&creator)
      .ok_or_else(|| ConsensusError::UnknownParticipant(creator.clone()))?;

    let (last, is_root) = self.store.last_event_from(&creator)?;
    let self_parent_index = if is_root && last == event.self_parent() {
      self.store.get_root(&creator)?.index
    } else {
      self.store.get_event(event.self_parent())?.index()
    };

    let mut other_parent_creator_id = -1;
    let mut other_parent_index = -1;
    if !event.other_parent().is_empty() {
      let other_parent = self.store.get_event(event.other_parent())?;
      other_parent_creator_id = self
        .participants
        .id_of(&other_parent.creator_hex())
        .ok_or_else(|| {
          ConsensusError::UnknownParticipant(other_parent.creator_hex())
        })? as i64;
      other_parent_index = other_parent.index();
    }

    event.set_wire_info(
      self_parent_index,
      other_parent_creator_id,
      other_parent_index,
      creator_id as i64,
    );
    Ok(())
  }

  /// Rebuilds a full event from its wire form by resolving the
  /// compact parent references against the local store.
  pub fn read_wire_info(
    &self,
    wire: WireEvent,
  ) -> Result<Event, ConsensusError> {
    let creator_id = usize::try_from(wire.body.creator_id)
      .map_err(|_| ConsensusError::UnknownParticipant(format!(
        "id {}",
        wire.body.creator_id
      )))?;
    let creator_key = self
      .participants
      .key_of(creator_id)
      .ok_or_else(|| {
        ConsensusError::UnknownParticipant(format!("id {creator_id}"))
      })?
      .to_owned();
    let creator = Pubkey::from_str(&creator_key)?;

    let mut self_parent = String::new();
    if wire.body.self_parent_index >= 0 {
      self_parent = self
        .store
        .participant_event(&creator_key, wire.body.self_parent_index)?;
    }

    let mut other_parent = String::new();
    if wire.body.other_parent_index >= 0 {
      let other_creator_id = usize::try_from(wire.body.other_parent_creator_id)
        .map_err(|_| {
          ConsensusError::UnknownParticipant(format!(
            "id {}",
            wire.body.other_parent_creator_id
          ))
        })?;
      let other_creator = self
        .participants
        .key_of(other_creator_id)
        .ok_or_else(|| {
          ConsensusError::UnknownParticipant(format!("id {other_creator_id}"))
        })?;
      other_parent = self
        .store
        .participant_event(other_creator, wire.body.other_parent_index)?;
    }

    let block_signatures = wire.block_signatures(&creator);
    let mut event = Event::new(
      wire.body.transactions.clone(),
      block_signatures,
      [self_parent, other_parent],
      creator,
      wire.body.index,
    );
    event.body.timestamp = wire.body.timestamp;
    event.signature = wire.signature;
    event.set_wire_info(
      wire.body.self_parent_index,
      wire.body.other_parent_creator_id,
      wire.body.other_parent_index,
      wire.body.creator_id,
    );
    Ok(event)
  }

  /// Block signatures ride inside event bodies; peel them off and
  /// attach the valid ones to their blocks. Invalid or premature
  /// signatures are dropped with a warning, never an error.
  fn record_block_signatures(&self, signatures: &[BlockSignature]) {
    for signature in signatures {
      let validator = signature.validator_hex();
      if !self.participants.contains(&validator) {
        warn!(
          index = signature.index,
          %validator,
          "block signature from unknown validator"
        );
        continue;
      }
      let mut block = match self.store.get_block(signature.index) {
        Ok(block) => block,
        Err(e) => {
          warn!(index = signature.index, error = %e, "no block for signature");
          continue;
        }
      };
      match block.verify(signature) {
        Ok(true) => {}
        Ok(false) => {
          warn!(index = signature.index, %validator, "invalid block signature");
          continue;
        }
        Err(e) => {
          warn!(index = signature.index, error = %e, "block signature check");
          continue;
        }
      }
      block.set_signature(signature.clone());
      if let Err(e) = self.store.set_block(block) {
        warn!(index = signature.index, error = %e, "saving signed block");
      }
    }
  }

  // ---- consensus phases ------------------------------------------------

  /// Assigns a round to every undetermined event and registers it in
  /// that round's info, queueing rounds that were not queued yet.
  pub fn divide_rounds(&mut self) -> Result<(), ConsensusError> {
    for hash in self.undetermined_events.clone() {
      let round_number = self.round(&hash);
      let witness = self.witness(&hash);

      let mut round_info = match self.store.get_round(round_number) {
        Ok(round_info) => round_info,
        Err(e) if e.is_not_found() => RoundInfo::default(),
        Err(e) => return Err(e.into()),
      };
      // a round fresh off the disk is never queued; queue it so the
      // voting phases pick it up
      if !round_info.queued {
        self.undecided_rounds.push(round_number);
        round_info.queued = true;
      }
      round_info.add_event(&hash, witness);
      self.store.set_round(round_number, round_info)?;
    }
    Ok(())
  }

  /// Virtual voting: witnesses of later rounds vote on the fame of
  /// earlier witnesses, with a coin round every `n` rounds breaking
  /// potential vote deadlocks pseudo-randomly.
  pub fn decide_fame(&mut self) -> Result<(), ConsensusError> {
    let members = self.participants.len() as i64;
    // votes[y][x] = y's vote on x's fame
    let mut votes: HashMap<EventHash, HashMap<EventHash, bool>> =
      HashMap::new();
    let mut decided_rounds = vec![];

    for i in self.undecided_rounds.clone() {
      let mut round_info = match self.store.get_round(i) {
        Ok(round_info) => round_info,
        // queued before any of its events arrived, leave it queued
        Err(e) if e.is_not_found() => continue,
        Err(e) => return Err(e.into()),
      };
      for x in round_info.witnesses() {
        if round_info.is_decided(&x) {
          continue;
        }
        'voting: for j in (i + 1)..=self.store.last_round() {
          for y in self.store.round_witnesses(j) {
            let diff = j - i;
            if diff == 1 {
              set_vote(&mut votes, &y, &x, self.sees(&y, &x));
              continue;
            }

            // tally the votes of the previous round's witnesses that
            // y strongly sees
            let electorate: Vec<EventHash> = self
              .store
              .round_witnesses(j - 1)
              .into_iter()
              .filter(|w| self.strongly_sees(&y, w))
              .collect();
            let yays = electorate
              .iter()
              .filter(|w| {
                votes.get(*w).and_then(|v| v.get(&x)).copied().unwrap_or(false)
              })
              .count();
            let nays = electorate.len() - yays;
            let vote = yays >= nays;
            let tally = yays.max(nays);

            if diff % members != 0 {
              // normal round: a quorum tally decides fame outright
              if tally >= self.quorum {
                round_info.set_fame(&x, vote);
                set_vote(&mut votes, &y, &x, vote);
                break 'voting;
              }
              set_vote(&mut votes, &y, &x, vote);
            } else {
              // coin round: below quorum the vote flips on a bit of
              // y's hash, which no coalition controls
              if tally >= self.quorum {
                set_vote(&mut votes, &y, &x, vote);
              } else {
                set_vote(&mut votes, &y, &x, middle_bit(&y));
              }
            }
          }
        }
      }

      if round_info.witnesses_decided() {
        decided_rounds.push(i);
        if self.last_consensus_round.map_or(true, |last| i > last) {
          self.set_last_consensus_round(i);
        }
      }
      self.store.set_round(i, round_info)?;
    }

    self.undecided_rounds.retain(|r| !decided_rounds.contains(r));
    Ok(())
  }

  fn set_last_consensus_round(&mut self, round: i64) {
    self.last_consensus_round = Some(round);
    self.last_committed_round_events = self.store.round_events(round - 1);
  }

  /// Finds the round that receives each undetermined event: the
  /// first fully decided round whose famous witnesses (strictly more
  /// than half) see it. The consensus timestamp is the median of the
  /// times at which those witnesses' lineages first saw the event.
  fn decide_round_received(&mut self) -> Result<(), ConsensusError> {
    for x in self.undetermined_events.clone() {
      let round = self.round(&x);
      for i in (round + 1)..=self.store.last_round() {
        let round_info = match self.store.get_round(i) {
          Ok(round_info) => round_info,
          Err(e) if e.is_not_found() => RoundInfo::default(),
          Err(e) => return Err(e.into()),
        };

        // rounds at or below an undecided one cannot order anything
        let no_undecided_before = self
          .undecided_rounds
          .first()
          .map_or(true, |&undecided| undecided > i);
        if !(round_info.witnesses_decided() && no_undecided_before) {
          continue;
        }

        let famous = round_info.famous_witnesses();
        let seers: Vec<EventHash> = famous
          .iter()
          .filter(|w| self.sees(w, &x))
          .cloned()
          .collect();

        if seers.len() > famous.len() / 2 {
          let mut ex = self.store.get_event(&x)?;
          ex.set_round_received(i);

          let lineage_sightings: Vec<EventHash> = seers
            .iter()
            .map(|w| self.oldest_self_ancestor_to_see(w, &x))
            .collect();
          ex.consensus_timestamp =
            Some(self.median_timestamp(&lineage_sightings)?);

          self.store.set_event(ex)?;
          break;
        }
      }
    }
    Ok(())
  }

  /// Completes the pipeline: decide rounds received, sort the newly
  /// decided events into the consensus order, append them to the
  /// consensus tape and pack their transactions into blocks, one per
  /// non-empty round received.
  pub async fn find_order(&mut self) -> Result<(), ConsensusError> {
    self.decide_round_received()?;

    let mut newly_decided = vec![];
    let mut still_undetermined = vec![];
    for x in &self.undetermined_events {
      let ex = self.store.get_event(x)?;
      if ex.round_received.is_some() {
        newly_decided.push(ex);
      } else {
        still_undetermined.push(x.clone());
      }
    }
    self.undetermined_events = still_undetermined;

    let mut rounds = HashMap::new();
    for event in &newly_decided {
      if let Some(round) = event.round_received {
        if let std::collections::hash_map::Entry::Vacant(entry) =
          rounds.entry(round)
        {
          let info = match self.store.get_round(round) {
            Ok(info) => info,
            Err(e) if e.is_not_found() => RoundInfo::default(),
            Err(e) => return Err(e.into()),
          };
          entry.insert(info);
        }
      }
    }
    sort_consensus_events(&mut newly_decided, &rounds);

    // group transactions by round received, preserving both the
    // sorted order within a group and the order groups first appear
    let mut block_map: IndexMap<i64, Vec<Vec<u8>>> = IndexMap::new();
    for event in &newly_decided {
      self.store.add_consensus_event(event.hex())?;
      self.consensus_transactions += event.transactions().len();
      if event.is_loaded() {
        self.pending_loaded_events = self.pending_loaded_events.saturating_sub(1);
      }
      if let Some(round) = event.round_received {
        block_map
          .entry(round)
          .or_insert_with(Vec::new)
          .extend(event.transactions().iter().cloned());
      }
    }

    for (round_received, transactions) in block_map {
      if transactions.is_empty() {
        continue;
      }
      let block = Block::new(
        self.last_block_index + 1,
        round_received,
        transactions,
      );
      self.store.set_block(block.clone())?;
      self.last_block_index += 1;
      if let Some(commit_tx) = &self.commit_tx {
        if commit_tx.send(block).await.is_err() {
          warn!("commit channel closed, dropping block");
        }
      }
    }
    Ok(())
  }

  fn median_timestamp(
    &self,
    hashes: &[EventHash],
  ) -> Result<DateTime<Utc>, ConsensusError> {
    let mut timestamps = vec![];
    for hash in hashes {
      timestamps.push(self.store.get_event(hash)?.body.timestamp);
    }
    timestamps.sort();
    timestamps
      .get(timestamps.len() / 2)
      .copied()
      .ok_or(ConsensusError::EmptyMedian)
  }

  // ---- lifecycle -------------------------------------------------------

  /// Replays every stored event in topological order through a fresh
  /// graph state and re-runs the consensus phases, leaving the graph
  /// coherent with the tip of the stored history.
  pub async fn bootstrap(&mut self) -> Result<(), ConsensusError> {
    for event in self.store.topological_events()? {
      // strip local verdicts: insertion re-derives coordinates and
      // the consensus phases re-derive rounds received
      let mut fresh =
        Event::new(vec![], vec![], ["".into(), "".into()], event.body.creator.clone(), 0);
      fresh.body = event.body;
      fresh.signature = event.signature;
      fresh.wire = event.wire;
      self.insert(fresh, true)?;
    }
    self.divide_rounds()?;
    self.decide_fame()?;
    self.find_order().await
  }

  /// Drops all volatile consensus state and re-seats the graph on the
  /// given roots. Produced blocks and the participant set survive.
  pub fn reset(
    &mut self,
    roots: HashMap<String, Root>,
  ) -> Result<(), ConsensusError> {
    self.store.reset(roots)?;

    self.undetermined_events.clear();
    self.undecided_rounds.clear();
    self.pending_loaded_events = 0;
    self.topological_index = 0;

    let capacity = cache_capacity(self.store.as_ref());
    self.ancestor_cache = RefCell::new(LruCache::new(capacity));
    self.self_ancestor_cache = RefCell::new(LruCache::new(capacity));
    self.oldest_self_ancestor_cache = RefCell::new(LruCache::new(capacity));
    self.strongly_sees_cache = RefCell::new(LruCache::new(capacity));
    self.parent_round_cache = RefCell::new(LruCache::new(capacity));
    self.round_cache = RefCell::new(LruCache::new(capacity));
    Ok(())
  }

  /// Assembles the slice of history a lagging node needs to rebuild
  /// itself from the last consensus round: a root per participant
  /// plus every event at or above the round's witnesses.
  pub fn frame(&self) -> Result<Frame, ConsensusError> {
    let last_consensus_round = self.last_consensus_round.unwrap_or(0);
    let round_info = self.store.get_round(last_consensus_round)?;

    let mut events = vec![];
    let mut roots: HashMap<String, Root> = HashMap::new();

    for witness_hash in round_info.witnesses() {
      let witness = self.store.get_event(&witness_hash)?;
      let creator = witness.creator_hex();
      roots.insert(creator.clone(), Root {
        x: witness.self_parent().to_owned(),
        y: witness.other_parent().to_owned(),
        index: witness.index() - 1,
        round: self.round(witness.self_parent()),
        others: BTreeMap::new(),
      });
      let above = self.store.participant_events(&creator, witness.index())?;
      events.push(witness);
      for hash in above {
        events.push(self.store.get_event(&hash)?);
      }
    }

    // participants without a witness in the round fall back to their
    // last known event, or their root if they have none at all
    for participant in self.participants.keys() {
      if roots.contains_key(participant) {
        continue;
      }
      let (last, is_root) = self.store.last_event_from(participant)?;
      let root = if is_root {
        self.store.get_root(participant)?
      } else {
        let event = self.store.get_event(&last)?;
        let root = Root {
          x: event.self_parent().to_owned(),
          y: event.other_parent().to_owned(),
          index: event.index() - 1,
          round: self.round(event.self_parent()),
          others: BTreeMap::new(),
        };
        events.push(event);
        root
      };
      roots.insert(participant.to_owned(), root);
    }

    events.sort_by_key(|e| e.topological_index);

    // events whose other-parent falls outside the frame would fail
    // the other-parent check on replay; reference them from the
    // creator's root instead
    let mut treated: HashMap<EventHash, bool> = HashMap::new();
    let mut patches: Vec<(String, EventHash, EventHash)> = vec![];
    for event in &events {
      treated.insert(event.hex(), true);
      let other_parent = event.other_parent();
      if other_parent.is_empty() {
        continue;
      }
      if treated.get(other_parent).copied().unwrap_or(false) {
        continue;
      }
      let creator = event.creator_hex();
      if let Some(root) = roots.get(&creator) {
        if event.self_parent() != root.x {
          patches.push((creator, event.hex(), other_parent.to_owned()));
        }
      }
    }
    for (creator, event_hash, other_parent) in patches {
      if let Some(root) = roots.get_mut(&creator) {
        root.others.insert(event_hash, other_parent);
      }
    }

    Ok(Frame { roots, events })
  }
}

/// The deadlock-breaking coin: a bit from the middle of the voter's
/// own hash.
fn middle_bit(hash_hex: &str) -> bool {
  let bytes = decode_hex(hash_hex).unwrap_or_default();
  !(!bytes.is_empty() && bytes[bytes.len() / 2] == 0)
}

fn set_vote(
  votes: &mut HashMap<EventHash, HashMap<EventHash, bool>>,
  y: &str,
  x: &str,
  vote: bool,
) {
  votes
    .entry(y.to_owned())
    .or_default()
    .insert(x.to_owned(), vote);
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      storage::SledStore,
      test::utils::{
        keyring,
        participants_of,
        spiral,
        stage_one,
        stage_two,
        PlayedGraph,
      },
    },
  };

  #[test]
  fn insertion_maintains_coordinates() {
    let mut played = PlayedGraph::new(2, None);
    let e0 = played.play(0, None, "e0", vec![]);
    let e1 = played.play(1, None, "e1", vec![]);
    let e01 = played.play(0, Some("e1"), "e01", vec![]);

    let (p0, p1) = (played.id(0), played.id(1));
    let stored = played.event("e01");
    assert_eq!(stored.last_ancestors[p0], EventCoordinates::new(1, e01.clone()));
    assert_eq!(stored.last_ancestors[p1], EventCoordinates::new(0, e1.clone()));
    assert_eq!(
      stored.first_descendants[p0],
      EventCoordinates::new(1, e01.clone())
    );

    // the merge stamped e01 as the first p0 event above e1
    let stored_e1 = played.event("e1");
    assert_eq!(
      stored_e1.first_descendants[p0],
      EventCoordinates::new(1, e01.clone())
    );
    assert_eq!(
      stored_e1.first_descendants[p1],
      EventCoordinates::new(0, e1.clone())
    );

    let graph = &played.graph;
    assert!(graph.ancestor_of(&e01, &e0));
    assert!(graph.ancestor_of(&e01, &e1));
    assert!(graph.ancestor_of(&e01, &e01));
    assert!(!graph.ancestor_of(&e0, &e1));
    assert!(graph.self_ancestor(&e01, &e0));
    assert!(!graph.self_ancestor(&e01, &e1));
    assert!(graph.sees(&e01, &e1));
    assert_eq!(graph.oldest_self_ancestor_to_see(&e01, &e1), e01);
    assert_eq!(graph.oldest_self_ancestor_to_see(&e0, &e1), "");

    // cached answers agree with recomputation
    assert!(graph.ancestor_of(&e01, &e1));
    assert!(graph.strongly_sees(&e01, &e1) == graph.strongly_sees(&e01, &e1));
  }

  #[test]
  fn last_ancestors_resolve_to_stored_events() {
    let mut played = PlayedGraph::new(4, None);
    spiral(&mut played);

    for event in played.graph.store().topological_events().unwrap() {
      for (id, coordinate) in event.last_ancestors.iter().enumerate() {
        if coordinate.index < 0 {
          continue;
        }
        let ancestor = played.graph.store().get_event(&coordinate.hash).unwrap();
        assert_eq!(ancestor.index(), coordinate.index);
        assert_eq!(
          played.participants.id_of(&ancestor.creator_hex()),
          Some(id)
        );
      }
    }
  }

  #[test]
  fn rounds_and_witnesses_follow_the_spiral() {
    let mut played = PlayedGraph::new(4, None);
    spiral(&mut played);
    // rounds are assigned event by event in insertion order, each
    // one seeing the witness sets its predecessors registered
    played.graph.divide_rounds().unwrap();
    let graph = &played.graph;

    for name in ["e0", "e1", "e2", "e3"] {
      let hash = played.hash(name);
      assert_eq!(graph.round(&hash), 0, "{name}");
      assert!(graph.witness(&hash), "{name}");
      assert!(graph.parent_round(&hash).is_root, "{name}");
    }
    for name in ["a1", "a2", "a3"] {
      let hash = played.hash(name);
      assert_eq!(graph.round(&hash), 0, "{name}");
      assert!(!graph.witness(&hash), "{name}");
    }
    for name in ["b0", "b1", "b2", "b3"] {
      let hash = played.hash(name);
      assert_eq!(graph.round(&hash), 1, "{name}");
      assert!(graph.witness(&hash), "{name}");
    }
    for name in ["c0", "c1", "c2", "c3"] {
      let hash = played.hash(name);
      assert_eq!(graph.round(&hash), 2, "{name}");
      assert!(graph.witness(&hash), "{name}");
    }
    let d0 = played.hash("d0");
    assert_eq!(graph.round(&d0), 3);
    assert!(graph.witness(&d0));

    // round(x) == parent_round(x).round + round_inc(x)
    for name in ["a2", "b0", "b1", "c0", "d0"] {
      let hash = played.hash(name);
      let expected = graph.parent_round(&hash).round
        + if graph.round_inc(&hash) { 1 } else { 0 };
      assert_eq!(graph.round(&hash), expected, "{name}");
    }
  }

  #[test]
  fn strongly_sees_matches_the_coordinate_definition() {
    let mut played = PlayedGraph::new(4, None);
    spiral(&mut played);
    let graph = &played.graph;

    assert!(graph.strongly_sees(&played.hash("b0"), &played.hash("e0")));
    assert!(graph.strongly_sees(&played.hash("b0"), &played.hash("e2")));
    assert!(!graph.strongly_sees(&played.hash("b0"), &played.hash("e3")));
    assert!(!graph.strongly_sees(&played.hash("a1"), &played.hash("e0")));

    for x in ["a3", "b0", "b2", "c0", "d0"] {
      for y in ["e0", "e1", "e2", "e3", "b0", "b3"] {
        let (ex, ey) = (played.event(x), played.event(y));
        let paths = ex
          .last_ancestors
          .iter()
          .zip(ey.first_descendants.iter())
          .filter(|(last, first)| last.index >= first.index)
          .count();
        assert_eq!(
          graph.strongly_sees(&played.hash(x), &played.hash(y)),
          paths >= graph.quorum(),
          "{x} -> {y}"
        );
      }
    }
  }

  #[tokio::test]
  async fn fame_is_decided_by_the_round_after_next() {
    let (commit_tx, mut commit_rx) = mpsc::channel(16);
    let mut played = PlayedGraph::new(4, Some(commit_tx));
    stage_one(&mut played);

    played.graph.divide_rounds().unwrap();
    played.graph.decide_fame().unwrap();
    played.graph.find_order().await.unwrap();

    // every round-1 witness saw every round-0 witness, and c0's
    // tally over them reaches quorum: round 0 is fully famous
    let round0 = played.graph.store().get_round(0).unwrap();
    for name in ["e0", "e1", "e2", "e3"] {
      assert!(round0.is_decided(&played.hash(name)), "{name}");
    }
    assert_eq!(round0.famous_witnesses().len(), 4);
    assert!(round0.witnesses_decided());
    assert_eq!(played.graph.last_consensus_round(), Some(0));

    // round 1 cannot order anything yet: no rounds received, no
    // blocks
    assert!(!played.graph.store().get_round(1).unwrap().witnesses_decided());
    assert_eq!(played.graph.store().consensus_events_count(), 0);
    assert_eq!(played.graph.last_block_index(), -1);
    assert!(commit_rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn orders_events_and_produces_blocks() {
    let (commit_tx, mut commit_rx) = mpsc::channel(16);
    let mut played = PlayedGraph::new(4, Some(commit_tx));
    stage_one(&mut played);

    played.graph.divide_rounds().unwrap();
    played.graph.decide_fame().unwrap();
    played.graph.find_order().await.unwrap();

    stage_two(&mut played);
    played.graph.divide_rounds().unwrap();
    played.graph.decide_fame().unwrap();
    played.graph.find_order().await.unwrap();

    // d0's tally decided round 1, which receives all round-0 events
    assert_eq!(played.graph.last_consensus_round(), Some(1));

    let decided = ["e0", "e1", "e2", "e3", "a1", "a2", "a3"];
    for name in decided {
      let event = played.event(name);
      assert_eq!(event.round_received, Some(1), "{name}");
      assert!(event.consensus_timestamp.is_some(), "{name}");
    }

    let tape = played.graph.consensus_events();
    assert_eq!(tape.len(), decided.len());
    for name in decided {
      assert_eq!(
        tape.iter().filter(|h| **h == played.hash(name)).count(),
        1,
        "{name} appears exactly once"
      );
    }
    assert_eq!(
      played.graph.undetermined_events().len(),
      16 - decided.len()
    );

    // one block for round received 1, holding the two transactions
    // in tape order
    assert_eq!(played.graph.last_block_index(), 0);
    let block = played.graph.store().get_block(0).unwrap();
    assert_eq!(block.index(), 0);
    assert_eq!(block.round_received(), 1);

    let expected: Vec<Vec<u8>> = tape
      .iter()
      .flat_map(|hash| {
        played
          .graph
          .store()
          .get_event(hash)
          .unwrap()
          .transactions()
          .to_vec()
      })
      .collect();
    assert_eq!(block.transactions(), expected);
    assert_eq!(expected.len(), 2);
    assert_eq!(played.graph.consensus_transactions(), 2);

    let committed = commit_rx.try_recv().unwrap();
    assert_eq!(committed, block);
    assert!(commit_rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn consensus_is_deterministic_across_insertion_orders() {
    let (commit_tx, mut commit_rx) = mpsc::channel(16);
    let mut played = PlayedGraph::new(4, Some(commit_tx));
    spiral(&mut played);
    played.graph.divide_rounds().unwrap();
    played.graph.decide_fame().unwrap();
    played.graph.find_order().await.unwrap();
    let reference_tape = played.graph.consensus_events();
    let reference_block = commit_rx.try_recv().unwrap();

    // the four initial events are mutually independent: replaying
    // them in reverse is a different, equally valid topological
    // order
    let mut events = played.replayable_events();
    events[0..4].reverse();

    let (commit_tx, mut commit_rx) = mpsc::channel(16);
    let participants = participants_of(&played.keys);
    let store =
      Arc::new(crate::storage::InmemStore::new(participants.clone(), 1000));
    let mut replica = EventGraph::new(participants, store, Some(commit_tx));
    for event in events {
      replica.insert(event, true).unwrap();
    }
    replica.divide_rounds().unwrap();
    replica.decide_fame().unwrap();
    replica.find_order().await.unwrap();

    assert_eq!(replica.consensus_events(), reference_tape);
    assert_eq!(commit_rx.try_recv().unwrap(), reference_block);
  }

  #[tokio::test]
  async fn bootstrap_rebuilds_consensus_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let keys = keyring(4);
    let participants = participants_of(&keys);

    let (reference_tape, reference_block) = {
      let store = Arc::new(
        SledStore::new(dir.path(), participants.clone(), 1000).unwrap(),
      );
      let mut played = PlayedGraph::new_on(keys.clone(), store, None);
      spiral(&mut played);
      played.graph.divide_rounds().unwrap();
      played.graph.decide_fame().unwrap();
      played.graph.find_order().await.unwrap();
      let tape = played.graph.consensus_events();
      let block = played.graph.store().get_block(0).unwrap();
      played.graph.store().close().unwrap();
      (tape, block)
    };

    let store = Arc::new(
      SledStore::new(dir.path(), participants.clone(), 1000).unwrap(),
    );
    let mut graph = EventGraph::new(participants, store, None);
    graph.bootstrap().await.unwrap();

    assert_eq!(graph.consensus_events(), reference_tape);
    assert_eq!(graph.store().get_block(0).unwrap(), reference_block);
    assert_eq!(graph.last_block_index(), 0);
    assert_eq!(graph.last_consensus_round(), Some(1));
  }

  #[tokio::test]
  async fn frame_covers_every_participant() {
    let mut played = PlayedGraph::new(4, None);
    spiral(&mut played);
    played.graph.divide_rounds().unwrap();
    played.graph.decide_fame().unwrap();
    played.graph.find_order().await.unwrap();

    let frame = played.graph.frame().unwrap();
    assert_eq!(frame.roots.len(), 4);
    for window in frame.events.windows(2) {
      assert!(window[0].topological_index < window[1].topological_index);
    }
    // round 1 is the last consensus round; each of its witnesses
    // roots its creator one index below itself
    for name in ["b0", "b1", "b2", "b3"] {
      let witness = played.event(name);
      let root = &frame.roots[&witness.creator_hex()];
      assert_eq!(root.index, witness.index() - 1);
    }
  }

  #[test]
  fn reset_clears_graph_state() {
    let mut played = PlayedGraph::new(2, None);
    played.play(0, None, "e0", vec![]);
    played.play(1, None, "e1", vec![]);
    played.play(0, Some("e1"), "e01", vec![]);
    assert_eq!(played.graph.undetermined_events().len(), 3);

    let roots = played
      .participants
      .keys()
      .map(|key| (key.to_owned(), Root::base()))
      .collect();
    played.graph.reset(roots).unwrap();

    assert!(played.graph.undetermined_events().is_empty());
    assert_eq!(played.graph.pending_loaded_events(), 0);
    for (_, last) in played.graph.known_events() {
      assert_eq!(last, -1);
    }
  }

  #[test]
  fn middle_bit_reads_the_hash_center() {
    assert!(!middle_bit("0x00"));
    assert!(middle_bit("0x01"));
    assert!(!middle_bit("0xAA00AA"));
    assert!(middle_bit("0xAAFFAA"));
  }
}
