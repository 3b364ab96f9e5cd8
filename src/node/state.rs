use std::{
  fmt::{Display, Formatter},
  sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
  /// Normal operation: gossiping and running consensus.
  Booting,
  /// Too far behind to be served by gossip, fast-forwarding.
  CatchingUp,
  Shutdown,
}

impl Display for NodeState {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      NodeState::Booting => write!(f, "Booting"),
      NodeState::CatchingUp => write!(f, "CatchingUp"),
      NodeState::Shutdown => write!(f, "Shutdown"),
    }
  }
}

/// Lock-free view of the node's lifecycle, shared between the main
/// loop, the background worker and ephemeral gossip tasks.
#[derive(Debug)]
pub struct StateMachine {
  state: AtomicU8,
  /// Cleared after the first successful gossip exchange; forces the
  /// first heartbeat to gossip even with empty pools.
  starting: AtomicBool,
}

impl StateMachine {
  pub fn new() -> Self {
    Self {
      state: AtomicU8::new(NodeState::Booting as u8),
      starting: AtomicBool::new(true),
    }
  }

  pub fn get(&self) -> NodeState {
    match self.state.load(Ordering::SeqCst) {
      0 => NodeState::Booting,
      1 => NodeState::CatchingUp,
      _ => NodeState::Shutdown,
    }
  }

  pub fn set(&self, state: NodeState) {
    self.state.store(state as u8, Ordering::SeqCst);
  }

  pub fn is_starting(&self) -> bool {
    self.starting.load(Ordering::SeqCst)
  }

  pub fn set_starting(&self, starting: bool) {
    self.starting.store(starting, Ordering::SeqCst);
  }
}

impl Default for StateMachine {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn state_transitions() {
    let machine = StateMachine::new();
    assert_eq!(machine.get(), NodeState::Booting);
    assert!(machine.is_starting());

    machine.set(NodeState::CatchingUp);
    assert_eq!(machine.get(), NodeState::CatchingUp);

    machine.set(NodeState::Shutdown);
    assert_eq!(machine.get(), NodeState::Shutdown);
    assert_eq!(machine.get().to_string(), "Shutdown");

    machine.set_starting(false);
    assert!(!machine.is_starting());
  }
}
