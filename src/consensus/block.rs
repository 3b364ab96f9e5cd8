use {
  super::ConsensusError,
  crate::primitives::{
    decode_signature,
    encode_signature,
    sha256,
    Keypair,
    Pubkey,
  },
  serde::{Deserialize, Serialize},
  std::collections::BTreeMap,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockBody {
  pub index: i64,
  pub round_received: i64,
  pub transactions: Vec<Vec<u8>>,
  /// Filled by the application when the block is committed.
  pub state_hash: Vec<u8>,
}

/// A numbered container of ordered transactions from one round
/// received. Created exactly once, then mutated only by appending
/// validator signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
  pub body: BlockBody,
  /// validator hex id -> signature over `(index, state_hash)`
  pub signatures: BTreeMap<String, String>,
}

/// What validators actually sign: the block position plus the
/// application state it led to. Transactions are pinned transitively
/// because every honest node derives the same body for an index.
#[derive(Serialize)]
struct SigningPayload<'a> {
  index: i64,
  state_hash: &'a [u8],
}

impl Block {
  pub fn new(index: i64, round_received: i64, transactions: Vec<Vec<u8>>) -> Self {
    Self {
      body: BlockBody {
        index,
        round_received,
        transactions,
        state_hash: vec![],
      },
      signatures: BTreeMap::new(),
    }
  }

  pub fn index(&self) -> i64 {
    self.body.index
  }

  pub fn round_received(&self) -> i64 {
    self.body.round_received
  }

  pub fn transactions(&self) -> &[Vec<u8>] {
    &self.body.transactions
  }

  pub fn state_hash(&self) -> &[u8] {
    &self.body.state_hash
  }

  fn signing_digest(&self) -> Vec<u8> {
    let payload = SigningPayload {
      index: self.body.index,
      state_hash: &self.body.state_hash,
    };
    sha256(&serde_json::to_vec(&payload).expect("payload serializes to json"))
  }

  pub fn sign(&self, keypair: &Keypair) -> BlockSignature {
    BlockSignature {
      validator: keypair.public(),
      index: self.body.index,
      signature: encode_signature(&keypair.sign(&self.signing_digest())),
    }
  }

  pub fn verify(
    &self,
    signature: &BlockSignature,
  ) -> Result<bool, ConsensusError> {
    if signature.index != self.body.index {
      return Ok(false);
    }
    let decoded = decode_signature(&signature.signature)?;
    Ok(signature.validator.verify(&self.signing_digest(), &decoded)?)
  }

  pub fn set_signature(&mut self, signature: BlockSignature) {
    self
      .signatures
      .insert(signature.validator.to_string(), signature.signature);
  }
}

/// A validator's vote of confidence in a committed block, gossiped
/// inside that validator's next events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSignature {
  pub validator: Pubkey,
  pub index: i64,
  pub signature: String,
}

impl BlockSignature {
  pub fn validator_hex(&self) -> String {
    self.validator.to_string()
  }

  pub fn to_wire(&self) -> WireBlockSignature {
    WireBlockSignature {
      index: self.index,
      signature: self.signature.clone(),
    }
  }
}

/// Wire form drops the validator key; the receiver reattaches the
/// event creator's key when rehydrating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireBlockSignature {
  pub index: i64,
  pub signature: String,
}

#[cfg(test)]
mod tests {
  use {super::*, crate::test::utils::keyring};

  #[test]
  fn sign_and_verify() {
    let keys = keyring(2);
    let mut block = Block::new(0, 1, vec![b"t1".to_vec()]);
    block.body.state_hash = vec![1, 2, 3];

    let signature = block.sign(&keys[0]);
    assert!(block.verify(&signature).unwrap());

    block.set_signature(signature.clone());
    assert_eq!(
      block.signatures.get(&signature.validator_hex()),
      Some(&signature.signature)
    );

    // a signature from another key does not verify
    let other = Block::new(0, 1, vec![]).sign(&keys[1]);
    let forged = BlockSignature {
      validator: keys[1].public(),
      index: 0,
      signature: other.signature,
    };
    assert!(!block.verify(&forged).unwrap());
  }

  #[test]
  fn verify_rejects_wrong_index() {
    let keys = keyring(1);
    let block = Block::new(4, 2, vec![]);
    let mut signature = block.sign(&keys[0]);
    signature.index = 5;
    assert!(!block.verify(&signature).unwrap());
  }
}
