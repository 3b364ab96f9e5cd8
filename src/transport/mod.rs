mod mem;
mod tcp;

use {
  crate::consensus::WireEvent,
  async_trait::async_trait,
  serde::{Deserialize, Serialize},
  std::collections::BTreeMap,
  thiserror::Error,
  tokio::sync::oneshot,
};

pub use {
  mem::{MemNetwork, MemTransport},
  tcp::TcpTransport,
};

/// Wire tags, one byte ahead of each JSON frame.
pub const SYNC_TAG: u8 = 0x01;
pub const EAGER_SYNC_TAG: u8 = 0x02;

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("request timed out")]
  Timeout,

  #[error("codec error: {0}")]
  Codec(#[from] serde_json::Error),

  #[error("remote error: {0}")]
  Remote(String),

  #[error("unknown rpc tag {0:#04x}")]
  UnknownTag(u8),

  #[error("transport closed")]
  Closed,
}

/// Pull: tell the peer what we know, receive what we are missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
  pub from_id: usize,
  pub known: BTreeMap<usize, i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
  pub from_id: usize,
  pub events: Vec<WireEvent>,
  pub known: BTreeMap<usize, i64>,
  /// Set when the requester lags too far behind to be served by
  /// regular gossip and should catch up out of band instead.
  pub sync_limit: bool,
}

/// Push: hand the peer the events it told us it was missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EagerSyncRequest {
  pub from_id: usize,
  pub events: Vec<WireEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EagerSyncResponse {
  pub from_id: usize,
  pub success: bool,
}

#[derive(Debug)]
pub enum RpcRequest {
  Sync(SyncRequest),
  EagerSync(EagerSyncRequest),
}

#[derive(Debug)]
pub enum RpcResponse {
  Sync(SyncResponse),
  EagerSync(EagerSyncResponse),
}

/// Responses travel wrapped so that a handler failure reaches the
/// caller as data: a non-empty error string, body still decodable.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
  pub error: String,
  pub body: T,
}

/// An inbound request handed to the node's background worker, with
/// the channel its reply goes out on.
#[derive(Debug)]
pub struct InboundRpc {
  pub request: RpcRequest,
  pub respond: oneshot::Sender<Result<RpcResponse, String>>,
}

impl InboundRpc {
  /// Replies, ignoring a requester that already hung up.
  pub fn reply(self, reply: Result<RpcResponse, String>) {
    let _ = self.respond.send(reply);
  }
}

/// Framed request/response channel between participants. The core
/// only needs per-peer addressing with timeouts; everything else is
/// the implementation's business.
#[async_trait]
pub trait Transport: Send + Sync {
  fn local_addr(&self) -> String;

  async fn sync(
    &self,
    target: &str,
    request: SyncRequest,
  ) -> Result<SyncResponse, TransportError>;

  async fn eager_sync(
    &self,
    target: &str,
    request: EagerSyncRequest,
  ) -> Result<EagerSyncResponse, TransportError>;

  async fn close(&self) -> Result<(), TransportError>;
}
