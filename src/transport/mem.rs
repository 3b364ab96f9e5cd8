use {
  super::{
    EagerSyncRequest,
    EagerSyncResponse,
    InboundRpc,
    RpcRequest,
    RpcResponse,
    SyncRequest,
    SyncResponse,
    TransportError,
  },
  async_trait::async_trait,
  std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
  },
  tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
  },
};

/// A hub of in-process endpoints keyed by address. Used by the test
/// suite and local simulations; semantics match the TCP transport,
/// minus the sockets.
#[derive(Clone, Default)]
pub struct MemNetwork {
  endpoints: Arc<Mutex<HashMap<String, mpsc::Sender<InboundRpc>>>>,
}

impl MemNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers an endpoint and returns its transport plus the
  /// channel inbound requests arrive on.
  pub fn transport(
    &self,
    addr: &str,
  ) -> (MemTransport, mpsc::Receiver<InboundRpc>) {
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    self
      .endpoints
      .lock()
      .expect("network lock poisoned")
      .insert(addr.to_owned(), inbound_tx);
    (
      MemTransport {
        addr: addr.to_owned(),
        timeout: Duration::from_secs(1),
        network: self.clone(),
      },
      inbound_rx,
    )
  }

  fn endpoint(&self, addr: &str) -> Option<mpsc::Sender<InboundRpc>> {
    self
      .endpoints
      .lock()
      .expect("network lock poisoned")
      .get(addr)
      .cloned()
  }

  fn remove(&self, addr: &str) {
    self
      .endpoints
      .lock()
      .expect("network lock poisoned")
      .remove(addr);
  }
}

pub struct MemTransport {
  addr: String,
  timeout: Duration,
  network: MemNetwork,
}

impl MemTransport {
  async fn request(
    &self,
    target: &str,
    request: RpcRequest,
  ) -> Result<RpcResponse, TransportError> {
    let endpoint = self
      .network
      .endpoint(target)
      .ok_or(TransportError::Closed)?;
    let (respond, reply_rx) = oneshot::channel();
    endpoint
      .send(InboundRpc { request, respond })
      .await
      .map_err(|_| TransportError::Closed)?;
    let reply = timeout(self.timeout, reply_rx)
      .await
      .map_err(|_| TransportError::Timeout)?
      .map_err(|_| TransportError::Closed)?;
    reply.map_err(TransportError::Remote)
  }
}

#[async_trait]
impl super::Transport for MemTransport {
  fn local_addr(&self) -> String {
    self.addr.clone()
  }

  async fn sync(
    &self,
    target: &str,
    request: SyncRequest,
  ) -> Result<SyncResponse, TransportError> {
    match self.request(target, RpcRequest::Sync(request)).await? {
      RpcResponse::Sync(response) => Ok(response),
      RpcResponse::EagerSync(_) => {
        Err(TransportError::Remote("mismatched response".to_owned()))
      }
    }
  }

  async fn eager_sync(
    &self,
    target: &str,
    request: EagerSyncRequest,
  ) -> Result<EagerSyncResponse, TransportError> {
    match self.request(target, RpcRequest::EagerSync(request)).await? {
      RpcResponse::EagerSync(response) => Ok(response),
      RpcResponse::Sync(_) => {
        Err(TransportError::Remote("mismatched response".to_owned()))
      }
    }
  }

  async fn close(&self) -> Result<(), TransportError> {
    self.network.remove(&self.addr);
    Ok(())
  }
}
