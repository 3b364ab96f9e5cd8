mod cli;
mod consensus;
mod core;
mod node;
mod primitives;
mod proxy;
mod rpc;
mod storage;
mod transport;

#[cfg(test)]
mod test;

use {
  clap::Parser,
  cli::CliOpts,
  node::Node,
  proxy::InmemAppProxy,
  rpc::ApiService,
  std::sync::Arc,
  storage::{InmemStore, SledStore, Store},
  tracing::{info, Level},
  tracing_subscriber::{
    filter::filter_fn,
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
    Layer,
  },
  transport::TcpTransport,
};

#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn print_essentials(opts: &CliOpts) -> anyhow::Result<()> {
  info!("Starting Weave node");
  info!("Version: {}", env!("CARGO_PKG_VERSION"));
  info!("Identity: {}", opts.keypair);
  info!("Gossip listen address: {}", opts.listen);
  info!("Data directory: {}", opts.data_dir()?.display());

  let roster = opts.roster()?;
  info!("Participants: {}", roster.participants.len());
  for peer in &roster.participants {
    info!("  {} @ {}", peer.public_key, peer.address);
  }
  Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
  let opts = CliOpts::parse();

  let loglevel = match opts.verbose {
    1 => Level::DEBUG,
    2 => Level::TRACE,
    _ => Level::INFO,
  };
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .with_filter(filter_fn(move |metadata| metadata.level() <= &loglevel)),
    )
    .init();

  print_essentials(&opts)?;

  let roster = opts.roster()?;
  let participants = roster.participants();
  let me = opts.keypair.public().to_string();
  let id = participants
    .id_of(&me)
    .ok_or_else(|| anyhow::anyhow!("{} is not in the roster", me))?;

  let conf = opts.config();
  let store: Arc<dyn Store> = match opts.store.as_str() {
    "disk" => Arc::new(SledStore::new(
      &opts.data_dir()?,
      participants.clone(),
      conf.cache_size,
    )?),
    _ => Arc::new(InmemStore::new(participants.clone(), conf.cache_size)),
  };

  // the gossip endpoint other participants pull from and push to
  let (trans, net_rx) =
    TcpTransport::bind(&opts.listen.to_string(), conf.tcp_timeout).await?;

  // the application consuming committed blocks; transactions enter
  // through its submission channel
  let (app, submit_rx) = InmemAppProxy::new();
  let submit_tx = app.submit_sender();

  let node = Node::new(
    conf,
    id,
    opts.keypair.clone(),
    roster.participants.clone(),
    store,
    Arc::new(trans),
    net_rx,
    app,
    submit_rx,
  );
  node.init(opts.bootstrap).await?;
  let handle = node.handle();

  // external query surface, optional
  if !opts.rpc.is_empty() {
    ApiService::new(opts.rpc.clone(), handle.clone(), submit_tx);
  }

  let gossip = !opts.no_gossip;
  let mut runner = tokio::spawn(node.run(gossip));

  tokio::select! {
    _ = &mut runner => {}
    _ = tokio::signal::ctrl_c() => {
      info!("interrupt received, shutting down");
      handle.shutdown().await;
      let _ = runner.await;
    }
  }

  Ok(())
}
