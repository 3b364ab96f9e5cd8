use {
  crate::{
    consensus::{
      zero_timestamp,
      Block,
      BlockSignature,
      ConsensusError,
      Event,
      EventGraph,
      EventHash,
      Participants,
      WireEvent,
    },
    primitives::{Keypair, Pubkey},
    storage::Store,
  },
  itertools::Itertools,
  std::{collections::BTreeMap, sync::Arc, time::Instant},
  tokio::sync::mpsc,
  tracing::debug,
};

/// Per-node consensus state: the signing identity, the event graph,
/// the pending transaction and block-signature pools, and the
/// pointer to this creator's latest event.
pub struct Core {
  id: usize,
  keypair: Keypair,
  pub_key: Pubkey,
  hex_id: String,
  graph: EventGraph,

  head: EventHash,
  seq: i64,

  transaction_pool: Vec<Vec<u8>>,
  block_signature_pool: Vec<BlockSignature>,
}

impl Core {
  pub fn new(
    id: usize,
    keypair: Keypair,
    participants: Participants,
    store: Arc<dyn Store>,
    commit_tx: Option<mpsc::Sender<Block>>,
  ) -> Self {
    let pub_key = keypair.public();
    let hex_id = pub_key.to_string();
    Self {
      id,
      keypair,
      pub_key,
      hex_id,
      graph: EventGraph::new(participants, store, commit_tx),
      head: String::new(),
      seq: -1,
      transaction_pool: vec![],
      block_signature_pool: vec![],
    }
  }

  pub fn id(&self) -> usize {
    self.id
  }

  pub fn public_key(&self) -> &Pubkey {
    &self.pub_key
  }

  pub fn hex_id(&self) -> &str {
    &self.hex_id
  }

  pub fn head(&self) -> &str {
    &self.head
  }

  pub fn seq(&self) -> i64 {
    self.seq
  }

  pub fn graph(&self) -> &EventGraph {
    &self.graph
  }

  pub fn store(&self) -> Arc<dyn Store> {
    Arc::clone(self.graph.store())
  }

  /// Creates and inserts this node's initial event. The timestamp is
  /// pinned so that a restarted node reproduces the identical event.
  pub fn init(&mut self) -> Result<(), ConsensusError> {
    let mut initial = Event::new(
      vec![],
      vec![],
      [String::new(), String::new()],
      self.pub_key.clone(),
      self.seq + 1,
    );
    initial.body.timestamp = zero_timestamp();
    self.sign_and_insert_self_event(initial)?;
    debug!(index = self.seq, hash = %self.head, "initial event");
    Ok(())
  }

  /// Rebuilds the graph from the local store and recovers this
  /// creator's head and sequence number.
  pub async fn bootstrap(&mut self) -> Result<(), ConsensusError> {
    self.graph.bootstrap().await?;

    let (last, is_root) = self.store().last_event_from(&self.hex_id)?;
    if is_root {
      let root = self.store().get_root(&self.hex_id)?;
      self.head = root.x;
      self.seq = root.index;
    } else {
      let last_event = self.store().get_event(&last)?;
      self.seq = last_event.index();
      self.head = last;
    }
    Ok(())
  }

  pub fn sign_and_insert_self_event(
    &mut self,
    mut event: Event,
  ) -> Result<(), ConsensusError> {
    event.sign(&self.keypair);
    self.insert_event(event, true)
  }

  pub fn insert_event(
    &mut self,
    event: Event,
    set_wire_info: bool,
  ) -> Result<(), ConsensusError> {
    let own = event.creator_hex() == self.hex_id;
    let hash = event.hex();
    let index = event.index();
    self.graph.insert(event, set_wire_info)?;
    if own {
      self.head = hash;
      self.seq = index;
    }
    Ok(())
  }

  pub fn known_events(&self) -> BTreeMap<usize, i64> {
    self.graph.known_events()
  }

  /// Signs a committed block, records the signature in the store and
  /// returns it for the block-signature pool.
  pub fn sign_block(
    &mut self,
    block: &mut Block,
  ) -> Result<BlockSignature, ConsensusError> {
    let signature = block.sign(&self.keypair);
    block.set_signature(signature.clone());
    self.store().set_block(block.clone())?;
    Ok(signature)
  }

  /// True iff the total number of events the peer behind `known`
  /// is missing exceeds `sync_limit`.
  pub fn over_sync_limit(
    &self,
    known: &BTreeMap<usize, i64>,
    sync_limit: i64,
  ) -> bool {
    let mut total_unknown = 0;
    for (id, my_last) in self.known_events() {
      let their_last = known.get(&id).copied().unwrap_or(-1);
      if my_last > their_last {
        total_unknown += my_last - their_last;
      }
    }
    total_unknown > sync_limit
  }

  /// Events this node knows about that the peer behind `known` does
  /// not, in topological order.
  pub fn event_diff(
    &self,
    known: &BTreeMap<usize, i64>,
  ) -> Result<Vec<Event>, ConsensusError> {
    let mut unknown = vec![];
    for (&id, &their_last) in known {
      let participant = match self.graph.participants().key_of(id) {
        Some(participant) => participant.to_owned(),
        None => continue,
      };
      for hash in self.store().participant_events(&participant, their_last)? {
        unknown.push(self.store().get_event(&hash)?);
      }
    }
    Ok(
      unknown
        .into_iter()
        .sorted_by_key(|e| e.topological_index)
        .collect(),
    )
  }

  /// Ingests the peer's unknown events and, if anything new arrived
  /// or the pools hold pending payloads, seals them into a new head
  /// gossiping both what we created and what we just learned.
  pub fn sync(
    &mut self,
    unknown_events: Vec<WireEvent>,
  ) -> Result<(), ConsensusError> {
    debug!(
      unknown_events = unknown_events.len(),
      transaction_pool = self.transaction_pool.len(),
      block_signature_pool = self.block_signature_pool.len(),
      "sync"
    );

    let mut other_head = String::new();
    let count = unknown_events.len();
    for (k, wire_event) in unknown_events.into_iter().enumerate() {
      let event = self.graph.read_wire_info(wire_event)?;
      let hash = event.hex();
      self.insert_event(event, false)?;
      // the peer's head rides last in a topologically ordered diff
      if k == count - 1 {
        other_head = hash;
      }
    }

    if count > 0
      || !self.transaction_pool.is_empty()
      || !self.block_signature_pool.is_empty()
    {
      self.create_new_head(other_head)?;
    }
    Ok(())
  }

  /// Seals pending pool payloads into a new self-event without an
  /// other-parent. No-op when there is nothing to seal.
  pub fn add_self_event(&mut self) -> Result<(), ConsensusError> {
    if self.transaction_pool.is_empty() && self.block_signature_pool.is_empty()
    {
      debug!("empty transaction and block signature pools");
      return Ok(());
    }
    self.create_new_head(String::new())
  }

  fn create_new_head(
    &mut self,
    other_head: EventHash,
  ) -> Result<(), ConsensusError> {
    let transactions = std::mem::take(&mut self.transaction_pool);
    let block_signatures = std::mem::take(&mut self.block_signature_pool);
    let new_head = Event::new(
      transactions,
      block_signatures,
      [self.head.clone(), other_head],
      self.pub_key.clone(),
      self.seq + 1,
    );
    self.sign_and_insert_self_event(new_head).map_err(|e| {
      debug!(error = %e, "inserting new head");
      e
    })
  }

  pub fn from_wire(
    &self,
    wire_events: Vec<WireEvent>,
  ) -> Result<Vec<Event>, ConsensusError> {
    wire_events
      .into_iter()
      .map(|w| self.graph.read_wire_info(w))
      .collect()
  }

  pub fn to_wire(&self, events: &[Event]) -> Vec<WireEvent> {
    events.iter().map(Event::to_wire).collect()
  }

  /// The three consensus phases, in order. Any failure aborts the
  /// remaining phases and leaves this invocation's work incomplete
  /// but the stored state consistent.
  pub async fn run_consensus(&mut self) -> Result<(), ConsensusError> {
    let start = Instant::now();
    self.graph.divide_rounds()?;
    debug!(elapsed = ?start.elapsed(), "divide_rounds");

    let start = Instant::now();
    self.graph.decide_fame()?;
    debug!(elapsed = ?start.elapsed(), "decide_fame");

    let start = Instant::now();
    self.graph.find_order().await?;
    debug!(elapsed = ?start.elapsed(), "find_order");
    Ok(())
  }

  pub fn add_transactions(&mut self, transactions: Vec<Vec<u8>>) {
    self.transaction_pool.extend(transactions);
  }

  pub fn add_block_signature(&mut self, signature: BlockSignature) {
    self.block_signature_pool.push(signature);
  }

  pub fn transaction_pool_len(&self) -> usize {
    self.transaction_pool.len()
  }

  /// True while there is anything this node still needs to spread or
  /// settle: undelivered payloads in flight or pools waiting to ride
  /// the next self-event.
  pub fn needs_gossip(&self) -> bool {
    self.graph.pending_loaded_events() > 0
      || !self.transaction_pool.is_empty()
      || !self.block_signature_pool.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      storage::InmemStore,
      test::utils::{keyring, participants_of},
    },
  };

  fn core_for(
    keys: &[Keypair],
    me: usize,
    commit_tx: Option<mpsc::Sender<Block>>,
  ) -> Core {
    let participants = participants_of(keys);
    let id = participants.id_of(&keys[me].public().to_string()).unwrap();
    let store = Arc::new(InmemStore::new(participants.clone(), 100));
    Core::new(id, keys[me].clone(), participants, store, commit_tx)
  }

  #[test]
  fn init_creates_the_initial_event() {
    let keys = keyring(2);
    let mut core = core_for(&keys, 0, None);
    core.init().unwrap();

    let store = core.store();
    let (head, is_root) = store.last_event_from(core.hex_id()).unwrap();
    assert!(!is_root);
    assert_eq!(head, core.head());

    let event = store.get_event(&head).unwrap();
    assert_eq!(event.index(), 0);
    assert_eq!(event.self_parent(), "");
    assert_eq!(event.other_parent(), "");
    assert_eq!(event.creator(), core.public_key());
    assert_eq!(event.body.timestamp, zero_timestamp());
    assert!(event.verify().unwrap());
    assert!(core.graph().witness(&head));
    assert_eq!(core.seq(), 0);
  }

  #[test]
  fn init_is_reproducible_across_restarts() {
    let keys = keyring(2);
    let mut first = core_for(&keys, 0, None);
    let mut second = core_for(&keys, 0, None);
    first.init().unwrap();
    second.init().unwrap();
    assert_eq!(first.head(), second.head());
  }

  #[test]
  fn two_node_gossip_single_round() {
    let keys = keyring(2);
    let mut a = core_for(&keys, 0, None);
    let mut b = core_for(&keys, 1, None);
    a.init().unwrap();
    b.init().unwrap();

    a.add_transactions(vec![b"T1".to_vec()]);

    // a pulls from b: b replies with everything a does not know,
    // which is exactly b's initial event
    let a_known = a.known_events();
    let diff = b.event_diff(&a_known).unwrap();
    assert_eq!(diff.len(), 1);
    assert_eq!(diff[0].index(), 0);

    let b_head = b.head().to_owned();
    let wire = b.to_wire(&diff);
    a.sync(wire).unwrap();

    // a created a new head on top of both initial events, carrying
    // the pooled transaction
    assert_eq!(a.seq(), 1);
    let head = a.store().get_event(a.head()).unwrap();
    assert_eq!(head.index(), 1);
    assert_eq!(head.other_parent(), b_head);
    assert_eq!(head.transactions(), &[b"T1".to_vec()]);
    assert!(!a.needs_gossip());

    // a pushes its diff back to b
    let b_known = b.known_events();
    assert!(!a.over_sync_limit(&b_known, 100));
    let push = a.event_diff(&b_known).unwrap();
    assert_eq!(push.len(), 2); // a's initial event and its new head
    let wire = a.to_wire(&push);
    b.sync(wire).unwrap();

    let a_id = a.id();
    assert_eq!(b.known_events()[&a_id], 1);
  }

  #[test]
  fn over_sync_limit_counts_total_lag() {
    let keys = keyring(2);
    let mut a = core_for(&keys, 0, None);
    a.init().unwrap();
    for i in 0..9 {
      a.add_transactions(vec![format!("t{i}").into_bytes()]);
      a.add_self_event().unwrap();
    }
    assert_eq!(a.seq(), 9);

    // a peer that knows nothing is 10 events behind
    let empty: BTreeMap<usize, i64> = [(0, -1), (1, -1)].into();
    assert!(a.over_sync_limit(&empty, 5));
    assert!(!a.over_sync_limit(&empty, 10));
    assert!(!a.over_sync_limit(&a.known_events(), 5));
  }

  #[test]
  fn add_self_event_without_payload_is_a_noop() {
    let keys = keyring(1);
    let mut core = core_for(&keys, 0, None);
    core.init().unwrap();
    core.add_self_event().unwrap();
    assert_eq!(core.seq(), 0);
  }

  #[test]
  fn wire_roundtrip_preserves_the_event_hash() {
    let keys = keyring(2);
    let mut a = core_for(&keys, 0, None);
    let mut b = core_for(&keys, 1, None);
    a.init().unwrap();
    b.init().unwrap();

    let diff = b.event_diff(&a.known_events()).unwrap();
    let wire = b.to_wire(&diff);
    a.sync(wire).unwrap();

    a.add_transactions(vec![b"payload".to_vec()]);
    a.add_self_event().unwrap();

    let head = a.store().get_event(a.head()).unwrap();
    let rebuilt = a.from_wire(vec![head.to_wire()]).unwrap();
    assert_eq!(rebuilt[0].hex(), head.hex());
    assert_eq!(rebuilt[0].body, head.body);
  }

  #[test]
  fn rejects_forks_from_the_same_creator() {
    let keys = keyring(2);
    let mut a = core_for(&keys, 0, None);
    a.init().unwrap();
    let genesis_head = a.head().to_owned();

    a.add_transactions(vec![b"first".to_vec()]);
    a.add_self_event().unwrap();
    let honest_head = a.head().to_owned();

    // a competing event with the same (creator, index) necessarily
    // names the stale head as its self-parent
    let mut fork = Event::new(
      vec![b"equivocation".to_vec()],
      vec![],
      [genesis_head, String::new()],
      keys[0].public(),
      1,
    );
    fork.sign(&keys[0]);

    let before = a.store().known_events();
    assert!(matches!(
      a.insert_event(fork, true),
      Err(ConsensusError::SelfParentMismatch)
    ));
    assert_eq!(a.store().known_events(), before);
    assert_eq!(a.head(), honest_head);
  }
}
