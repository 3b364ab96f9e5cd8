mod inmem;

use {async_trait::async_trait, crate::consensus::Block, thiserror::Error};

pub use inmem::InmemAppProxy;

#[derive(Debug, Error)]
pub enum ProxyError {
  #[error("application commit failed: {0}")]
  Commit(String),
}

/// The application sitting on top of the ordering engine. It feeds
/// raw transaction bytes in through the submission channel handed
/// out at construction, and receives committed blocks here, replying
/// with the resulting state hash.
#[async_trait]
pub trait AppProxy: Send + Sync {
  async fn commit_block(&self, block: Block) -> Result<Vec<u8>, ProxyError>;
}
