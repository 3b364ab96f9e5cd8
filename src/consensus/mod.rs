//! Baird, L. "The Swirlds hashgraph consensus algorithm: fair, fast,
//! byzantine fault tolerance." Implementation of gossip-about-gossip
//! virtual voting over a signed event DAG.

mod block;
mod event;
mod graph;
mod peers;
mod root;
mod round;
mod sorter;

use {crate::primitives::KeypairError, crate::storage::StoreError, thiserror::Error};

pub use {
  block::{Block, BlockBody, BlockSignature, WireBlockSignature},
  event::{
    zero_timestamp,
    Event,
    EventBody,
    EventCoordinates,
    EventHash,
    WireBody,
    WireEvent,
  },
  graph::{EventGraph, Frame, ParentRound},
  peers::{Participants, Peer, PeerSelector, RandomPeerSelector, Roster},
  root::Root,
  round::{RoundEvent, RoundInfo},
  sorter::sort_consensus_events,
};

#[derive(Debug, Error)]
pub enum ConsensusError {
  #[error("invalid event signature")]
  InvalidSignature,

  #[error("self-parent is not the creator's last known event")]
  SelfParentMismatch,

  #[error("other-parent is not known")]
  UnknownOtherParent,

  #[error("unknown participant {0}")]
  UnknownParticipant(String),

  #[error("no famous witness timestamps to take a median of")]
  EmptyMedian,

  #[error(transparent)]
  Keys(#[from] KeypairError),

  #[error(transparent)]
  Store(#[from] StoreError),
}
