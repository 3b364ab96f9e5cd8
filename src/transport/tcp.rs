use {
  super::{
    EagerSyncRequest,
    EagerSyncResponse,
    Envelope,
    InboundRpc,
    RpcRequest,
    RpcResponse,
    SyncRequest,
    SyncResponse,
    TransportError,
    EAGER_SYNC_TAG,
    SYNC_TAG,
  },
  async_trait::async_trait,
  serde::{de::DeserializeOwned, Serialize},
  std::time::Duration,
  tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
  },
  tracing::{debug, warn},
};

/// Frames larger than this are treated as a protocol violation.
const MAX_FRAME: u32 = 1 << 26;

/// Gossip RPC over plain TCP. Frames are a one-byte verb tag, a
/// 32-bit big-endian length and a JSON body. Outbound requests open
/// a fresh connection and are bounded by the configured timeout end
/// to end; inbound connections are served until the peer hangs up.
pub struct TcpTransport {
  local: String,
  timeout: Duration,
  acceptor: JoinHandle<()>,
}

impl TcpTransport {
  pub async fn bind(
    addr: &str,
    request_timeout: Duration,
  ) -> Result<(Self, mpsc::Receiver<InboundRpc>), TransportError> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?.to_string();
    let (inbound_tx, inbound_rx) = mpsc::channel(64);

    let acceptor = tokio::spawn(async move {
      loop {
        match listener.accept().await {
          Ok((stream, peer)) => {
            debug!(%peer, "inbound gossip connection");
            let inbound_tx = inbound_tx.clone();
            tokio::spawn(async move {
              if let Err(e) = serve_connection(stream, inbound_tx).await {
                debug!(%peer, error = %e, "gossip connection ended");
              }
            });
          }
          Err(e) => {
            warn!(error = %e, "accept failed");
            break;
          }
        }
      }
    });

    Ok((
      Self {
        local,
        timeout: request_timeout,
        acceptor,
      },
      inbound_rx,
    ))
  }

  async fn request<Req, Resp>(
    &self,
    target: &str,
    tag: u8,
    request: &Req,
  ) -> Result<Resp, TransportError>
  where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
  {
    let exchange = async {
      let mut stream = TcpStream::connect(target).await?;
      write_frame(&mut stream, tag, &serde_json::to_vec(request)?).await?;
      let (reply_tag, body) = read_frame(&mut stream).await?;
      if reply_tag != tag {
        return Err(TransportError::UnknownTag(reply_tag));
      }
      let envelope: Envelope<Resp> = serde_json::from_slice(&body)?;
      if !envelope.error.is_empty() {
        return Err(TransportError::Remote(envelope.error));
      }
      Ok(envelope.body)
    };
    timeout(self.timeout, exchange)
      .await
      .map_err(|_| TransportError::Timeout)?
  }
}

#[async_trait]
impl super::Transport for TcpTransport {
  fn local_addr(&self) -> String {
    self.local.clone()
  }

  async fn sync(
    &self,
    target: &str,
    request: SyncRequest,
  ) -> Result<SyncResponse, TransportError> {
    self.request(target, SYNC_TAG, &request).await
  }

  async fn eager_sync(
    &self,
    target: &str,
    request: EagerSyncRequest,
  ) -> Result<EagerSyncResponse, TransportError> {
    self.request(target, EAGER_SYNC_TAG, &request).await
  }

  async fn close(&self) -> Result<(), TransportError> {
    self.acceptor.abort();
    Ok(())
  }
}

/// Serves framed requests on one inbound connection until EOF.
async fn serve_connection(
  mut stream: TcpStream,
  inbound_tx: mpsc::Sender<InboundRpc>,
) -> Result<(), TransportError> {
  loop {
    let (tag, body) = match read_frame(&mut stream).await {
      Ok(frame) => frame,
      // clean shutdown between frames
      Err(TransportError::Io(e))
        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
      {
        return Ok(());
      }
      Err(e) => return Err(e),
    };

    let request = match tag {
      SYNC_TAG => RpcRequest::Sync(serde_json::from_slice(&body)?),
      EAGER_SYNC_TAG => RpcRequest::EagerSync(serde_json::from_slice(&body)?),
      other => return Err(TransportError::UnknownTag(other)),
    };

    let (respond, reply_rx) = tokio::sync::oneshot::channel();
    if inbound_tx
      .send(InboundRpc { request, respond })
      .await
      .is_err()
    {
      return Err(TransportError::Closed);
    }

    // a dropped reply channel means the node is shutting down
    let reply = reply_rx.await.map_err(|_| TransportError::Closed)?;
    let frame = encode_reply(tag, reply)?;
    write_frame(&mut stream, tag, &frame).await?;
  }
}

fn encode_reply(
  tag: u8,
  reply: Result<RpcResponse, String>,
) -> Result<Vec<u8>, TransportError> {
  let bytes = match (tag, reply) {
    (SYNC_TAG, Ok(RpcResponse::Sync(body))) => {
      serde_json::to_vec(&Envelope {
        error: String::new(),
        body,
      })?
    }
    (EAGER_SYNC_TAG, Ok(RpcResponse::EagerSync(body))) => {
      serde_json::to_vec(&Envelope {
        error: String::new(),
        body,
      })?
    }
    (SYNC_TAG, Err(error)) => serde_json::to_vec(&Envelope {
      error,
      body: SyncResponse::default(),
    })?,
    (EAGER_SYNC_TAG, Err(error)) => serde_json::to_vec(&Envelope {
      error,
      body: EagerSyncResponse::default(),
    })?,
    (other, _) => return Err(TransportError::UnknownTag(other)),
  };
  Ok(bytes)
}

async fn write_frame(
  stream: &mut TcpStream,
  tag: u8,
  body: &[u8],
) -> Result<(), TransportError> {
  stream.write_u8(tag).await?;
  stream.write_u32(body.len() as u32).await?;
  stream.write_all(body).await?;
  stream.flush().await?;
  Ok(())
}

async fn read_frame(
  stream: &mut TcpStream,
) -> Result<(u8, Vec<u8>), TransportError> {
  let tag = stream.read_u8().await?;
  let len = stream.read_u32().await?;
  if len > MAX_FRAME {
    return Err(TransportError::Io(std::io::Error::new(
      std::io::ErrorKind::InvalidData,
      format!("frame of {len} bytes exceeds limit"),
    )));
  }
  let mut body = vec![0u8; len as usize];
  stream.read_exact(&mut body).await?;
  Ok((tag, body))
}
