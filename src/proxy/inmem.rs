use {
  super::{AppProxy, ProxyError},
  crate::{consensus::Block, primitives::sha256},
  async_trait::async_trait,
  std::sync::{Arc, Mutex},
  tokio::sync::mpsc,
};

/// In-process application: keeps the committed blocks and folds each
/// one into a running hash chain that stands in for application
/// state.
pub struct InmemAppProxy {
  submit_tx: mpsc::Sender<Vec<u8>>,
  inner: Mutex<Inner>,
}

struct Inner {
  state_hash: Vec<u8>,
  committed: Vec<Block>,
}

impl InmemAppProxy {
  /// Returns the proxy plus the receiving end of its submission
  /// channel, which the node's background worker drains.
  pub fn new() -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
    let (submit_tx, submit_rx) = mpsc::channel(64);
    (
      Arc::new(Self {
        submit_tx,
        inner: Mutex::new(Inner {
          state_hash: vec![],
          committed: vec![],
        }),
      }),
      submit_rx,
    )
  }

  /// A handle applications use to submit raw transaction bytes.
  pub fn submit_sender(&self) -> mpsc::Sender<Vec<u8>> {
    self.submit_tx.clone()
  }

  pub async fn submit(&self, transaction: Vec<u8>) -> Result<(), ProxyError> {
    self
      .submit_tx
      .send(transaction)
      .await
      .map_err(|e| ProxyError::Commit(e.to_string()))
  }

  pub fn committed_blocks(&self) -> Vec<Block> {
    self.inner.lock().expect("proxy lock poisoned").committed.clone()
  }

  pub fn state_hash(&self) -> Vec<u8> {
    self.inner.lock().expect("proxy lock poisoned").state_hash.clone()
  }
}

#[async_trait]
impl AppProxy for InmemAppProxy {
  async fn commit_block(&self, block: Block) -> Result<Vec<u8>, ProxyError> {
    let mut inner = self.inner.lock().expect("proxy lock poisoned");
    let mut material = inner.state_hash.clone();
    for transaction in block.transactions() {
      material.extend_from_slice(transaction);
    }
    inner.state_hash = sha256(&material);
    inner.committed.push(block);
    Ok(inner.state_hash.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn commits_fold_into_a_hash_chain() {
    let (proxy, mut submit_rx) = InmemAppProxy::new();

    proxy.submit(b"tx".to_vec()).await.unwrap();
    assert_eq!(submit_rx.recv().await.unwrap(), b"tx".to_vec());

    let first = proxy
      .commit_block(Block::new(0, 1, vec![b"a".to_vec()]))
      .await
      .unwrap();
    let second = proxy
      .commit_block(Block::new(1, 2, vec![b"b".to_vec()]))
      .await
      .unwrap();

    assert_eq!(first.len(), 32);
    assert_ne!(first, second);
    assert_eq!(proxy.state_hash(), second);
    assert_eq!(proxy.committed_blocks().len(), 2);

    // identical history reproduces identical state hashes
    let (replica, _rx) = InmemAppProxy::new();
    let replayed = replica
      .commit_block(Block::new(0, 1, vec![b"a".to_vec()]))
      .await
      .unwrap();
    assert_eq!(replayed, first);
  }
}
