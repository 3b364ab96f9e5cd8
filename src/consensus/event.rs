use {
  super::{
    block::{BlockSignature, WireBlockSignature},
    ConsensusError,
  },
  crate::primitives::{
    decode_signature,
    encode_signature,
    sha256,
    Keypair,
    Pubkey,
    ToHexString,
  },
  chrono::{DateTime, Utc},
  serde::{Deserialize, Serialize},
};

/// Events are identified by the `0x` + upper-case hex form of the
/// SHA-256 digest of their canonical body encoding.
pub type EventHash = String;

/// The fixed timestamp of every participant's initial event, so that
/// independent restarts reproduce the exact same event hash.
pub fn zero_timestamp() -> DateTime<Utc> {
  DateTime::<Utc>::UNIX_EPOCH
}

/// Position of one participant's event within the DAG coordinate
/// system: its per-creator sequence number and its hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCoordinates {
  pub index: i64,
  pub hash: EventHash,
}

impl EventCoordinates {
  pub fn new(index: i64, hash: EventHash) -> Self {
    Self { index, hash }
  }
}

/// The signed portion of an event. Canonical encoding is JSON with
/// the declared field order; the signature and the event hash are
/// both computed over the SHA-256 of these bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
  pub transactions: Vec<Vec<u8>>,
  pub parents: [EventHash; 2],
  pub creator: Pubkey,
  pub timestamp: DateTime<Utc>,
  pub index: i64,
  pub block_signatures: Vec<BlockSignature>,
}

impl EventBody {
  pub fn canonical_bytes(&self) -> Vec<u8> {
    serde_json::to_vec(self).expect("event body serializes to json")
  }

  pub fn hash(&self) -> Vec<u8> {
    sha256(&self.canonical_bytes())
  }
}

/// Compact parent references carried next to the body. It is cheaper
/// to send small integers than 32-byte hashes over the wire, and they
/// are resolvable against any store that holds the parents. Excluded
/// from the canonical body, so they never influence the event hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireInfo {
  pub self_parent_index: i64,
  pub other_parent_creator_id: i64,
  pub other_parent_index: i64,
  pub creator_id: i64,
}

impl Default for WireInfo {
  fn default() -> Self {
    Self {
      self_parent_index: -1,
      other_parent_creator_id: -1,
      other_parent_index: -1,
      creator_id: -1,
    }
  }
}

/// A single gossiped event. Immutable after signing except for the
/// coordinate indexes and the consensus verdict fields, which are
/// only ever set monotonically by the local graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
  pub body: EventBody,
  /// `hex(r)|hex(s)` ECDSA signature by `body.creator`.
  pub signature: String,

  #[serde(default)]
  pub wire: WireInfo,

  /// Local insertion order, assigned by the inserting node.
  #[serde(default)]
  pub topological_index: i64,

  #[serde(default)]
  pub round_received: Option<i64>,
  #[serde(default)]
  pub consensus_timestamp: Option<DateTime<Utc>>,

  /// For each participant id: the highest event of that participant
  /// that is an ancestor of this one.
  #[serde(default)]
  pub last_ancestors: Vec<EventCoordinates>,
  /// For each participant id: the lowest event of that participant
  /// that has this one as an ancestor. Filled in as later events
  /// arrive.
  #[serde(default)]
  pub first_descendants: Vec<EventCoordinates>,
}

impl Event {
  pub fn new(
    transactions: Vec<Vec<u8>>,
    block_signatures: Vec<BlockSignature>,
    parents: [EventHash; 2],
    creator: Pubkey,
    index: i64,
  ) -> Self {
    Self {
      body: EventBody {
        transactions,
        block_signatures,
        parents,
        creator,
        timestamp: Utc::now(),
        index,
      },
      signature: String::new(),
      wire: WireInfo::default(),
      topological_index: 0,
      round_received: None,
      consensus_timestamp: None,
      last_ancestors: vec![],
      first_descendants: vec![],
    }
  }

  pub fn creator(&self) -> &Pubkey {
    &self.body.creator
  }

  /// Hex id of the creator, the form used as a store key.
  pub fn creator_hex(&self) -> String {
    self.body.creator.to_string()
  }

  pub fn self_parent(&self) -> &str {
    &self.body.parents[0]
  }

  pub fn other_parent(&self) -> &str {
    &self.body.parents[1]
  }

  pub fn index(&self) -> i64 {
    self.body.index
  }

  pub fn transactions(&self) -> &[Vec<u8>] {
    &self.body.transactions
  }

  pub fn block_signatures(&self) -> &[BlockSignature] {
    &self.body.block_signatures
  }

  /// True if the event carries a payload or is the initial event of
  /// its creator. Loaded events are the ones the gossip loop must
  /// keep working to commit.
  pub fn is_loaded(&self) -> bool {
    self.body.index == 0
      || !self.body.transactions.is_empty()
      || !self.body.block_signatures.is_empty()
  }

  pub fn hash(&self) -> Vec<u8> {
    self.body.hash()
  }

  pub fn hex(&self) -> EventHash {
    self.body.hash().to_hex()
  }

  pub fn sign(&mut self, keypair: &Keypair) {
    self.signature = encode_signature(&keypair.sign(&self.body.hash()));
  }

  pub fn verify(&self) -> Result<bool, ConsensusError> {
    let signature = decode_signature(&self.signature)?;
    Ok(self.body.creator.verify(&self.body.hash(), &signature)?)
  }

  pub fn set_wire_info(
    &mut self,
    self_parent_index: i64,
    other_parent_creator_id: i64,
    other_parent_index: i64,
    creator_id: i64,
  ) {
    self.wire = WireInfo {
      self_parent_index,
      other_parent_creator_id,
      other_parent_index,
      creator_id,
    };
  }

  pub fn set_round_received(&mut self, round: i64) {
    self.round_received = Some(round);
  }

  pub fn to_wire(&self) -> WireEvent {
    WireEvent {
      body: WireBody {
        transactions: self.body.transactions.clone(),
        block_signatures: self
          .body
          .block_signatures
          .iter()
          .map(BlockSignature::to_wire)
          .collect(),
        self_parent_index: self.wire.self_parent_index,
        other_parent_creator_id: self.wire.other_parent_creator_id,
        other_parent_index: self.wire.other_parent_index,
        creator_id: self.wire.creator_id,
        timestamp: self.body.timestamp,
        index: self.body.index,
      },
      signature: self.signature.clone(),
    }
  }
}

/// Wire form of an event body: parent hashes replaced with
/// `(creator id, index)` pairs that the receiver resolves against
/// its own store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireBody {
  pub transactions: Vec<Vec<u8>>,
  pub block_signatures: Vec<WireBlockSignature>,
  pub self_parent_index: i64,
  pub other_parent_creator_id: i64,
  pub other_parent_index: i64,
  pub creator_id: i64,
  pub timestamp: DateTime<Utc>,
  pub index: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
  pub body: WireBody,
  pub signature: String,
}

impl WireEvent {
  /// Rehydrates the block signatures with the creator's public key,
  /// which the wire form elides since it equals the event creator.
  pub fn block_signatures(&self, validator: &Pubkey) -> Vec<BlockSignature> {
    self
      .body
      .block_signatures
      .iter()
      .map(|ws| BlockSignature {
        validator: validator.clone(),
        index: ws.index,
        signature: ws.signature.clone(),
      })
      .collect()
  }
}
