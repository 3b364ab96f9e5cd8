mod config;
mod state;
mod timer;

use {
  crate::{
    consensus::{Block, ConsensusError, Peer, PeerSelector, RandomPeerSelector},
    core::Core,
    primitives::{Keypair, ToHexString},
    proxy::AppProxy,
    storage::Store,
    transport::{
      EagerSyncRequest,
      EagerSyncResponse,
      InboundRpc,
      RpcRequest,
      RpcResponse,
      SyncRequest,
      SyncResponse,
      Transport,
      TransportError,
    },
  },
  serde::Serialize,
  std::{
    collections::BTreeMap,
    sync::{
      atomic::{AtomicU64, Ordering},
      Arc,
      Mutex as StdMutex,
    },
    time::Instant,
  },
  thiserror::Error,
  tokio::sync::{broadcast, mpsc, Mutex},
  tracing::{debug, error, info, warn},
};

pub use {
  config::Config,
  state::{NodeState, StateMachine},
  timer::{ControlTimer, TimerControls},
};

#[derive(Debug, Error)]
pub enum NodeError {
  #[error(transparent)]
  Consensus(#[from] ConsensusError),

  #[error(transparent)]
  Transport(#[from] TransportError),
}

/// Point-in-time operational counters, served on `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
  pub id: usize,
  pub state: String,
  pub last_consensus_round: Option<i64>,
  pub last_block_index: i64,
  pub consensus_events: usize,
  pub consensus_transactions: usize,
  pub undetermined_events: usize,
  pub transaction_pool: usize,
  pub num_peers: usize,
  pub sync_rate: f64,
  pub events_per_second: f64,
  pub rounds_per_second: f64,
  pub round_events: usize,
}

struct Counters {
  start: Instant,
  sync_requests: AtomicU64,
  sync_errors: AtomicU64,
}

/// Everything the node's concurrent routines share: the main loop,
/// the background worker and ephemeral gossip tasks all hold clones.
#[derive(Clone)]
pub(crate) struct Shared {
  id: usize,
  conf: Config,
  core: Arc<Mutex<Core>>,
  state: Arc<StateMachine>,
  selector: Arc<StdMutex<Box<dyn PeerSelector>>>,
  trans: Arc<dyn Transport>,
  proxy: Arc<dyn AppProxy>,
  timer: TimerControls,
  counters: Arc<Counters>,
}

impl Shared {
  /// Decides whether this heartbeat should gossip at all, draining
  /// the pools into a fresh self-event if so.
  async fn pre_gossip(&self) -> bool {
    let mut core = self.core.lock().await;
    if !core.needs_gossip() && !self.state.is_starting() {
      debug!("nothing to gossip");
      return false;
    }
    if let Err(e) = core.add_self_event() {
      error!(error = %e, "adding self event");
      return false;
    }
    true
  }

  /// One gossip exchange: pull what we miss, push what they miss.
  pub(crate) async fn gossip(&self, peer_addr: &str) -> Result<(), NodeError> {
    let (sync_limit, peer_known) = self.pull(peer_addr).await?;

    if sync_limit {
      info!(peer = peer_addr, "peer flagged sync limit, catching up");
      self.state.set(NodeState::CatchingUp);
      return Ok(());
    }

    self.push(peer_addr, &peer_known).await?;

    self
      .selector
      .lock()
      .expect("selector lock poisoned")
      .update_last(peer_addr);
    self.log_stats().await;
    self.state.set_starting(false);
    Ok(())
  }

  async fn pull(
    &self,
    peer_addr: &str,
  ) -> Result<(bool, BTreeMap<usize, i64>), NodeError> {
    let known = self.core.lock().await.known_events();
    let start = Instant::now();
    let response = self
      .trans
      .sync(peer_addr, SyncRequest {
        from_id: self.id,
        known,
      })
      .await?;
    debug!(
      elapsed = ?start.elapsed(),
      from_id = response.from_id,
      events = response.events.len(),
      sync_limit = response.sync_limit,
      "sync response"
    );

    if response.sync_limit {
      return Ok((true, BTreeMap::new()));
    }

    {
      let mut core = self.core.lock().await;
      core.sync(response.events)?;
      core.run_consensus().await?;
    }
    Ok((false, response.known))
  }

  async fn push(
    &self,
    peer_addr: &str,
    peer_known: &BTreeMap<usize, i64>,
  ) -> Result<(), NodeError> {
    let events = {
      let core = self.core.lock().await;
      if core.over_sync_limit(peer_known, self.conf.sync_limit) {
        info!(peer = peer_addr, "peer too far behind, skipping push");
        return Ok(());
      }
      let diff = core.event_diff(peer_known)?;
      core.to_wire(&diff)
    };

    let response = self
      .trans
      .eager_sync(peer_addr, EagerSyncRequest {
        from_id: self.id,
        events,
      })
      .await?;
    debug!(
      from_id = response.from_id,
      success = response.success,
      "eager sync response"
    );
    Ok(())
  }

  async fn process_rpc(&self, rpc: InboundRpc) {
    let state = self.state.get();
    if state != NodeState::Booting {
      info!(%state, "discarding rpc request");
      rpc.reply(Err(format!("not ready: {state}")));
      return;
    }

    let InboundRpc { request, respond } = rpc;
    match request {
      RpcRequest::Sync(request) => {
        let reply = self.handle_sync_request(request).await;
        let _ = respond.send(reply.map(RpcResponse::Sync));
      }
      RpcRequest::EagerSync(request) => {
        let reply = self.handle_eager_sync_request(request).await;
        let _ = respond.send(reply.map(RpcResponse::EagerSync));
      }
    }
  }

  async fn handle_sync_request(
    &self,
    request: SyncRequest,
  ) -> Result<SyncResponse, String> {
    debug!(from_id = request.from_id, "process sync request");
    let core = self.core.lock().await;

    let mut response = SyncResponse {
      from_id: self.id,
      ..SyncResponse::default()
    };

    if core.over_sync_limit(&request.known, self.conf.sync_limit) {
      info!(from_id = request.from_id, "requester over sync limit");
      response.sync_limit = true;
    } else {
      let diff = core.event_diff(&request.known).map_err(|e| {
        error!(error = %e, "calculating event diff");
        e.to_string()
      })?;
      response.events = core.to_wire(&diff);
    }

    response.known = core.known_events();
    debug!(
      events = response.events.len(),
      sync_limit = response.sync_limit,
      "responding to sync request"
    );
    Ok(response)
  }

  async fn handle_eager_sync_request(
    &self,
    request: EagerSyncRequest,
  ) -> Result<EagerSyncResponse, String> {
    debug!(
      from_id = request.from_id,
      events = request.events.len(),
      "process eager sync request"
    );
    self.sync_events(request.events).await.map_err(|e| {
      error!(error = %e, "eager sync");
      e.to_string()
    })?;
    Ok(EagerSyncResponse {
      from_id: self.id,
      success: true,
    })
  }

  /// Ingest a batch of wire events and run the consensus phases.
  /// Everything under one core lock, so consensus runs never
  /// interleave.
  async fn sync_events(
    &self,
    events: Vec<crate::consensus::WireEvent>,
  ) -> Result<(), ConsensusError> {
    let mut core = self.core.lock().await;
    core.sync(events)?;
    core.run_consensus().await
  }

  /// Hands a freshly produced block to the application, stores the
  /// resulting state hash and enqueues our signature for the next
  /// self-event. A failing application leaves the block stored
  /// without a state hash.
  async fn commit(&self, mut block: Block) {
    match self.proxy.commit_block(block.clone()).await {
      Ok(state_hash) => {
        info!(
          block = block.index(),
          state_hash = %state_hash.to_hex(),
          "commit block response"
        );
        block.body.state_hash = state_hash;
      }
      Err(e) => {
        error!(block = block.index(), error = %e, "application commit failed");
      }
    }

    let mut core = self.core.lock().await;
    match core.sign_block(&mut block) {
      Ok(signature) => core.add_block_signature(signature),
      Err(e) => error!(block = block.index(), error = %e, "signing block"),
    }
  }

  async fn stats(&self) -> Stats {
    let core = self.core.lock().await;
    let elapsed = self.counters.start.elapsed().as_secs_f64().max(f64::EPSILON);

    let consensus_events = core.store().consensus_events_count();
    let last_consensus_round = core.graph().last_consensus_round();

    let requests = self.counters.sync_requests.load(Ordering::SeqCst);
    let errors = self.counters.sync_errors.load(Ordering::SeqCst);
    let sync_rate = if requests > 0 {
      1.0 - errors as f64 / requests as f64
    } else {
      1.0
    };

    Stats {
      id: self.id,
      state: self.state.get().to_string(),
      last_consensus_round,
      last_block_index: core.graph().last_block_index(),
      consensus_events,
      consensus_transactions: core.graph().consensus_transactions(),
      undetermined_events: core.graph().undetermined_events().len(),
      transaction_pool: core.transaction_pool_len(),
      num_peers: self
        .selector
        .lock()
        .expect("selector lock poisoned")
        .peers()
        .len(),
      sync_rate,
      events_per_second: consensus_events as f64 / elapsed,
      rounds_per_second: last_consensus_round.unwrap_or(0) as f64 / elapsed,
      round_events: core.graph().last_committed_round_events(),
    }
  }

  async fn log_stats(&self) {
    let stats = self.stats().await;
    debug!(
      last_consensus_round = ?stats.last_consensus_round,
      last_block_index = stats.last_block_index,
      consensus_events = stats.consensus_events,
      undetermined_events = stats.undetermined_events,
      sync_rate = stats.sync_rate,
      "node stats"
    );
  }
}

/// The outer gossip state machine. Owns the channels; everything
/// else lives in [`Shared`] and is cloned into spawned routines.
pub struct Node {
  shared: Shared,
  timer: Option<ControlTimer>,
  ticks: Option<mpsc::Receiver<()>>,
  net_rx: Option<mpsc::Receiver<InboundRpc>>,
  submit_rx: Option<mpsc::Receiver<Vec<u8>>>,
  commit_rx: Option<mpsc::Receiver<Block>>,
  shutdown_tx: broadcast::Sender<()>,
}

/// Capacity of the commit pipeline; consensus stalls when the
/// application lags this many blocks behind.
const COMMIT_CHANNEL_CAPACITY: usize = 400;

impl Node {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    conf: Config,
    id: usize,
    keypair: Keypair,
    peers: Vec<Peer>,
    store: Arc<dyn Store>,
    trans: Arc<dyn Transport>,
    net_rx: mpsc::Receiver<InboundRpc>,
    proxy: Arc<dyn AppProxy>,
    submit_rx: mpsc::Receiver<Vec<u8>>,
  ) -> Self {
    let local_addr = trans.local_addr();
    let (commit_tx, commit_rx) = mpsc::channel(COMMIT_CHANNEL_CAPACITY);
    let participants = store.participants();
    let core = Core::new(id, keypair, participants, store, Some(commit_tx));
    let selector = RandomPeerSelector::new(&peers, &local_addr);
    let (timer, ticks, timer_controls) = ControlTimer::new(conf.heartbeat);
    let (shutdown_tx, _) = broadcast::channel(1);

    Self {
      shared: Shared {
        id,
        conf,
        core: Arc::new(Mutex::new(core)),
        state: Arc::new(StateMachine::new()),
        selector: Arc::new(StdMutex::new(Box::new(selector))),
        trans,
        proxy,
        timer: timer_controls,
        counters: Arc::new(Counters {
          start: Instant::now(),
          sync_requests: AtomicU64::new(0),
          sync_errors: AtomicU64::new(0),
        }),
      },
      timer: Some(timer),
      ticks: Some(ticks),
      net_rx: Some(net_rx),
      submit_rx: Some(submit_rx),
      commit_rx: Some(commit_rx),
      shutdown_tx,
    }
  }

  /// Creates the initial event, or rebuilds from the local store.
  pub async fn init(&self, bootstrap: bool) -> Result<(), ConsensusError> {
    let peers: Vec<String> = self
      .shared
      .selector
      .lock()
      .expect("selector lock poisoned")
      .peers()
      .iter()
      .map(|p| p.address.clone())
      .collect();
    info!(id = self.shared.id, ?peers, bootstrap, "init node");

    let mut core = self.shared.core.lock().await;
    if bootstrap {
      core.bootstrap().await
    } else {
      core.init()
    }
  }

  pub fn handle(&self) -> NodeHandle {
    NodeHandle {
      shared: self.shared.clone(),
      shutdown_tx: self.shutdown_tx.clone(),
    }
  }

  #[cfg(test)]
  pub(crate) fn shared(&self) -> &Shared {
    &self.shared
  }

  /// Runs the node until shutdown. Spawns the heartbeat timer and
  /// the background worker, then drives the state machine.
  pub async fn run(mut self, gossip: bool) {
    let timer = self.timer.take().expect("run is called once");
    tokio::spawn(timer.run());

    let worker = tokio::spawn(background_work(
      self.shared.clone(),
      self.net_rx.take().expect("run is called once"),
      self.submit_rx.take().expect("run is called once"),
      self.commit_rx.take().expect("run is called once"),
      self.shutdown_tx.subscribe(),
    ));

    let mut ticks = self.ticks.take().expect("run is called once");
    let mut shutdown_rx = self.shutdown_tx.subscribe();

    loop {
      let state = self.shared.state.get();
      info!(%state, "run loop");
      match state {
        NodeState::Booting => {
          self.gossip_loop(&mut ticks, &mut shutdown_rx, gossip).await;
        }
        NodeState::CatchingUp => self.fast_forward().await,
        NodeState::Shutdown => break,
      }
    }

    let _ = worker.await;
  }

  /// Serves heartbeats while Booting; returns when the state
  /// changes.
  async fn gossip_loop(
    &self,
    ticks: &mut mpsc::Receiver<()>,
    shutdown_rx: &mut broadcast::Receiver<()>,
    gossip: bool,
  ) {
    loop {
      let old_state = self.shared.state.get();
      tokio::select! {
        Some(_) = ticks.recv() => {
          if gossip && self.shared.pre_gossip().await {
            let next = self
              .shared
              .selector
              .lock()
              .expect("selector lock poisoned")
              .next();
            if let Some(peer) = next {
              debug!(peer = %peer.address, "time to gossip");
              let shared = self.shared.clone();
              tokio::spawn(async move {
                shared.counters.sync_requests.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = shared.gossip(&peer.address).await {
                  shared.counters.sync_errors.fetch_add(1, Ordering::SeqCst);
                  warn!(peer = %peer.address, error = %e, "gossip failed");
                }
              });
            }
          }

          // pause the heartbeat while there is nothing to spread
          if !self.shared.core.lock().await.needs_gossip() {
            debug!("pausing heartbeat, nothing to gossip");
            self.shared.timer.stop();
          } else if !self.shared.timer.is_set() {
            self.shared.timer.reset();
          }
        }
        _ = shutdown_rx.recv() => return,
      }

      if self.shared.state.get() != old_state {
        return;
      }
    }
  }

  /// Catch-up is a stub: a full implementation would fetch a frame
  /// from a peer ahead of us and reset onto it. Until then, fall
  /// back to regular gossip.
  async fn fast_forward(&self) {
    info!("catching up");
    info!("fast-sync not implemented, returning to gossip");
    self.shared.state.set(NodeState::Booting);
  }
}

/// Accepts inbound RPCs, submitted transactions and committed
/// blocks, whatever state the node is in.
async fn background_work(
  shared: Shared,
  mut net_rx: mpsc::Receiver<InboundRpc>,
  mut submit_rx: mpsc::Receiver<Vec<u8>>,
  mut commit_rx: mpsc::Receiver<Block>,
  mut shutdown_rx: broadcast::Receiver<()>,
) {
  loop {
    tokio::select! {
      Some(rpc) = net_rx.recv() => {
        shared.process_rpc(rpc).await;
        let needs_gossip = shared.core.lock().await.needs_gossip();
        if needs_gossip && !shared.timer.is_set() {
          shared.timer.reset();
        }
      }
      Some(transaction) = submit_rx.recv() => {
        debug!(bytes = transaction.len(), "adding transaction");
        shared.core.lock().await.add_transactions(vec![transaction]);
        if !shared.timer.is_set() {
          shared.timer.reset();
        }
      }
      Some(block) = commit_rx.recv() => {
        info!(
          index = block.index(),
          round_received = block.round_received(),
          transactions = block.transactions().len(),
          "committing block"
        );
        shared.commit(block).await;
      }
      _ = shutdown_rx.recv() => return,
    }
  }
}

/// Cloneable handle for the query surface and shutdown.
#[derive(Clone)]
pub struct NodeHandle {
  shared: Shared,
  shutdown_tx: broadcast::Sender<()>,
}

impl NodeHandle {
  pub fn state(&self) -> NodeState {
    self.shared.state.get()
  }

  pub async fn stats(&self) -> Stats {
    self.shared.stats().await
  }

  pub async fn block(&self, index: i64) -> Option<Block> {
    self
      .shared
      .core
      .lock()
      .await
      .store()
      .get_block(index)
      .ok()
  }

  pub async fn known_events(&self) -> BTreeMap<usize, i64> {
    self.shared.core.lock().await.known_events()
  }

  /// Stops every routine and closes the transport and the store.
  /// Safe to call more than once.
  pub async fn shutdown(&self) {
    if self.shared.state.get() == NodeState::Shutdown {
      return;
    }
    info!("shutdown");

    // leave any non-shutdown state immediately, then wake sleepers
    self.shared.state.set(NodeState::Shutdown);
    let _ = self.shutdown_tx.send(());
    self.shared.timer.shutdown();

    if let Err(e) = self.shared.trans.close().await {
      warn!(error = %e, "closing transport");
    }
    if let Err(e) = self.shared.core.lock().await.store().close() {
      warn!(error = %e, "closing store");
    }
  }
}
