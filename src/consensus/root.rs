use {
  super::event::EventHash,
  serde::{Deserialize, Serialize},
  std::collections::BTreeMap,
};

/// Bootstrap record standing in for a participant's truncated
/// history. `x` is the self-parent of the first event sitting above
/// the root, `y` its other-parent if any. `others` patches events
/// whose other-parent lies outside the retained history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
  pub x: EventHash,
  pub y: EventHash,
  pub index: i64,
  pub round: i64,
  pub others: BTreeMap<EventHash, EventHash>,
}

impl Root {
  /// The root every participant starts from before any history
  /// exists: empty parents, one below index zero.
  pub fn base() -> Self {
    Self {
      x: String::new(),
      y: String::new(),
      index: -1,
      round: -1,
      others: BTreeMap::new(),
    }
  }
}

impl Default for Root {
  fn default() -> Self {
    Self::base()
  }
}
