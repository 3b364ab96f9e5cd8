use {
  crate::primitives::Pubkey,
  indexmap::IndexMap,
  rand::Rng,
  serde::{Deserialize, Serialize},
  std::path::Path,
};

/// One entry of the fixed participant set: where to reach the node
/// and the key its events are signed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
  pub address: String,
  pub public_key: Pubkey,
}

impl Peer {
  pub fn hex_id(&self) -> String {
    self.public_key.to_string()
  }
}

/// The roster file shared by all nodes of a deployment. Membership
/// is fixed for the lifetime of the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roster {
  pub participants: Vec<Peer>,
}

impl Roster {
  /// Reads the roster from its JSON form. Participants are sorted by
  /// public key so that every node derives the same id assignment no
  /// matter how the file was written.
  pub fn load(path: &Path) -> Result<Self, std::io::Error> {
    let json = std::fs::read_to_string(path)?;
    let mut roster: Roster =
      serde_json::from_str(&json).map_err(std::io::Error::from)?;
    roster.sort();
    Ok(roster)
  }

  pub fn sort(&mut self) {
    self
      .participants
      .sort_by(|a, b| a.public_key.cmp(&b.public_key));
  }

  pub fn participants(&self) -> Participants {
    Participants::from_keys(self.participants.iter().map(Peer::hex_id))
  }
}

/// Bidirectional `hex public key <-> dense id` map over the fixed
/// participant set. Internal consensus code indexes by the small
/// integer id; hex keys only appear at the store and wire boundary.
#[derive(Debug, Clone, Default)]
pub struct Participants {
  by_key: IndexMap<String, usize>,
}

impl Participants {
  /// Ids are assigned in sorted key order, so any two nodes fed the
  /// same key set agree on every id.
  pub fn from_keys(keys: impl IntoIterator<Item = String>) -> Self {
    let mut keys: Vec<_> = keys.into_iter().collect();
    keys.sort();
    keys.dedup();
    Self {
      by_key: keys.into_iter().zip(0..).collect(),
    }
  }

  pub fn len(&self) -> usize {
    self.by_key.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_key.is_empty()
  }

  pub fn id_of(&self, key: &str) -> Option<usize> {
    self.by_key.get(key).copied()
  }

  pub fn key_of(&self, id: usize) -> Option<&str> {
    self.by_key.get_index(id).map(|(key, _)| key.as_str())
  }

  pub fn contains(&self, key: &str) -> bool {
    self.by_key.contains_key(key)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
    self.by_key.iter().map(|(key, id)| (key.as_str(), *id))
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.by_key.keys().map(String::as_str)
  }
}

/// Policy deciding which peer the next gossip exchange targets.
pub trait PeerSelector: Send {
  fn peers(&self) -> &[Peer];
  fn update_last(&mut self, address: &str);
  fn next(&mut self) -> Option<Peer>;
}

/// Default policy: uniform random over all other peers, avoiding the
/// previous partner whenever there is more than one alternative.
pub struct RandomPeerSelector {
  peers: Vec<Peer>,
  last: String,
}

impl RandomPeerSelector {
  pub fn new(participants: &[Peer], local_addr: &str) -> Self {
    Self {
      peers: participants
        .iter()
        .filter(|p| p.address != local_addr)
        .cloned()
        .collect(),
      last: String::new(),
    }
  }
}

impl PeerSelector for RandomPeerSelector {
  fn peers(&self) -> &[Peer] {
    &self.peers
  }

  fn update_last(&mut self, address: &str) {
    self.last = address.to_owned();
  }

  fn next(&mut self) -> Option<Peer> {
    let mut selectable: Vec<&Peer> = self.peers.iter().collect();
    if selectable.len() > 1 {
      selectable.retain(|p| p.address != self.last);
    }
    if selectable.is_empty() {
      return None;
    }
    let i = rand::thread_rng().gen_range(0..selectable.len());
    Some(selectable[i].clone())
  }
}

#[cfg(test)]
mod tests {
  use {super::*, crate::test::utils::keyring};

  fn peers(n: usize) -> Vec<Peer> {
    keyring(n)
      .iter()
      .enumerate()
      .map(|(i, keypair)| Peer {
        address: format!("127.0.0.1:{}", 9000 + i),
        public_key: keypair.public(),
      })
      .collect()
  }

  #[test]
  fn ids_are_independent_of_input_order() {
    let keys: Vec<String> =
      keyring(4).iter().map(|k| k.public().to_string()).collect();

    let forward = Participants::from_keys(keys.iter().cloned());
    let mut shuffled = keys.clone();
    shuffled.reverse();
    let backward = Participants::from_keys(shuffled);

    for key in &keys {
      assert_eq!(forward.id_of(key), backward.id_of(key));
    }
    assert_eq!(forward.len(), 4);
    for id in 0..4 {
      assert_eq!(forward.id_of(forward.key_of(id).unwrap()), Some(id));
    }
  }

  #[test]
  fn random_selector_excludes_self_and_last() {
    let peers = peers(3);
    let mut selector = RandomPeerSelector::new(&peers, &peers[0].address);
    assert_eq!(selector.peers().len(), 2);

    selector.update_last(&peers[1].address);
    for _ in 0..32 {
      let next = selector.next().unwrap();
      assert_eq!(next.address, peers[2].address);
    }
  }

  #[test]
  fn selector_with_single_peer_ignores_last() {
    let peers = peers(2);
    let mut selector = RandomPeerSelector::new(&peers, &peers[0].address);
    selector.update_last(&peers[1].address);
    assert_eq!(selector.next().unwrap().address, peers[1].address);
  }

  #[test]
  fn roster_sorting_is_deterministic() {
    let mut roster = Roster {
      participants: peers(4),
    };
    roster.participants.reverse();
    roster.sort();
    let participants = roster.participants();
    for (i, peer) in roster.participants.iter().enumerate() {
      assert_eq!(participants.id_of(&peer.hex_id()), Some(i));
    }
  }
}
