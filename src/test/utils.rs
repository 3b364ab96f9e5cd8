//! Deterministic fixtures for the consensus tests: reproducible
//! keyrings and a scripted DAG builder that inserts events into a
//! graph the way gossip would.

use {
  crate::{
    consensus::{
      zero_timestamp,
      Block,
      Event,
      EventGraph,
      EventHash,
      Participants,
    },
    primitives::Keypair,
    storage::InmemStore,
  },
  chrono::Duration,
  std::{collections::HashMap, sync::Arc},
  tokio::sync::mpsc,
};

/// Keypairs derived from fixed seeds, identical on every run.
pub fn keyring(n: usize) -> Vec<Keypair> {
  (1..=n)
    .map(|i| {
      Keypair::try_from([i as u8; 32].as_slice())
        .expect("fixed seed is a valid secret")
    })
    .collect()
}

pub fn participants_of(keys: &[Keypair]) -> Participants {
  Participants::from_keys(keys.iter().map(|k| k.public().to_string()))
}

/// A single-store DAG under construction. Every `play` appends one
/// event for a creator, wiring its self-parent automatically and its
/// other-parent by the name of an earlier event, so a test can script
/// an exact gossip history.
pub struct PlayedGraph {
  pub keys: Vec<Keypair>,
  pub participants: Participants,
  pub graph: EventGraph,
  heads: Vec<EventHash>,
  seqs: Vec<i64>,
  names: HashMap<&'static str, EventHash>,
}

impl PlayedGraph {
  pub fn new(n: usize, commit_tx: Option<mpsc::Sender<Block>>) -> Self {
    let keys = keyring(n);
    let participants = participants_of(&keys);
    let store = Arc::new(InmemStore::new(participants.clone(), 1000));
    Self::new_on(keys, store, commit_tx)
  }

  /// Builds the played graph on a caller-provided store, which must
  /// cover the same participant set.
  pub fn new_on(
    keys: Vec<Keypair>,
    store: Arc<dyn crate::storage::Store>,
    commit_tx: Option<mpsc::Sender<Block>>,
  ) -> Self {
    let participants = participants_of(&keys);
    let n = keys.len();
    Self {
      graph: EventGraph::new(participants.clone(), store, commit_tx),
      participants,
      heads: vec![EventHash::new(); n],
      seqs: vec![-1; n],
      names: HashMap::new(),
      keys,
    }
  }

  /// The participant id the graph assigned to the `creator`-th key.
  pub fn id(&self, creator: usize) -> usize {
    self
      .participants
      .id_of(&self.keys[creator].public().to_string())
      .expect("creator is a participant")
  }

  pub fn hash(&self, name: &str) -> EventHash {
    self.names[name].clone()
  }

  pub fn event(&self, name: &str) -> Event {
    self
      .graph
      .store()
      .get_event(&self.hash(name))
      .expect("played event is stored")
  }

  /// Appends an event for `creator` on top of its current head,
  /// optionally merging in another played event as other-parent, and
  /// registers it under `name`.
  pub fn play(
    &mut self,
    creator: usize,
    other_parent: Option<&str>,
    name: &'static str,
    transactions: Vec<Vec<u8>>,
  ) -> EventHash {
    let other_hash = other_parent
      .map(|other| self.names[other].clone())
      .unwrap_or_default();
    let index = self.seqs[creator] + 1;

    let mut event = Event::new(
      transactions,
      vec![],
      [self.heads[creator].clone(), other_hash],
      self.keys[creator].public(),
      index,
    );
    // timestamps are a pure function of the event's position, so the
    // same script always produces byte-identical events no matter
    // the order its steps run in
    event.body.timestamp = zero_timestamp()
      + Duration::seconds(index * self.keys.len() as i64 + creator as i64);
    event.sign(&self.keys[creator]);

    let hash = event.hex();
    self.graph.insert(event, true).expect("scripted event inserts");
    self.heads[creator] = hash.clone();
    self.seqs[creator] = index;
    self.names.insert(name, hash.clone());
    hash
  }

  /// Pristine copies of all stored events in insertion order, as a
  /// replay script for another graph.
  pub fn replayable_events(&self) -> Vec<Event> {
    self
      .graph
      .store()
      .topological_events()
      .expect("events are stored")
      .into_iter()
      .map(|stored| {
        let mut event = Event::new(
          vec![],
          vec![],
          [EventHash::new(), EventHash::new()],
          stored.body.creator.clone(),
          0,
        );
        event.body = stored.body;
        event.signature = stored.signature;
        event
      })
      .collect()
  }
}

/// The 17-event, four-participant history used by the consensus
/// tests. Gossip spirals around the ring so that every layer of
/// events reaches one round higher:
///
/// - `e0..e3`: the initial events, witnesses of round 0;
/// - `a1..a3`: a chain spreading everyone's initial events around,
///   still round 0;
/// - `b0..b3`: round 1 witnesses (`b0` strongly sees a quorum of the
///   round 0 witnesses);
/// - `c0..c3`: round 2 witnesses; their votes decide round 0's fame;
/// - `d0`: the round 3 witness whose tally decides round 1.
///
/// `stage_one` plays everything up to `c0`, enough to decide round 0
/// only; `stage_two` plays the rest.
pub fn spiral(played: &mut PlayedGraph) {
  stage_one(played);
  stage_two(played);
}

pub fn stage_one(played: &mut PlayedGraph) {
  played.play(0, None, "e0", vec![]);
  played.play(1, None, "e1", vec![]);
  played.play(2, None, "e2", vec![b"t-e2".to_vec()]);
  played.play(3, None, "e3", vec![]);

  played.play(1, Some("e0"), "a1", vec![b"t-a1".to_vec()]);
  played.play(2, Some("a1"), "a2", vec![]);
  played.play(3, Some("a2"), "a3", vec![]);

  played.play(0, Some("a3"), "b0", vec![]);
  played.play(1, Some("b0"), "b1", vec![]);
  played.play(2, Some("b1"), "b2", vec![]);
  played.play(3, Some("b2"), "b3", vec![]);

  played.play(0, Some("b3"), "c0", vec![]);
}

pub fn stage_two(played: &mut PlayedGraph) {
  played.play(1, Some("c0"), "c1", vec![]);
  played.play(2, Some("c1"), "c2", vec![]);
  played.play(3, Some("c2"), "c3", vec![]);

  played.play(0, Some("c3"), "d0", vec![]);
}
