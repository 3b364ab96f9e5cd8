use {
  crate::{consensus::Roster, node, primitives::Keypair},
  clap::Parser,
  std::{net::SocketAddr, path::PathBuf, time::Duration},
};

#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct CliOpts {
  #[clap(short, long, help = "secret key of this participant (hex)")]
  pub keypair: Keypair,

  #[clap(
    long,
    parse(from_os_str),
    help = "path to the participant roster file"
  )]
  pub roster: PathBuf,

  #[clap(
    long,
    help = "listen address for gossip rpc",
    default_value = "127.0.0.1:45555"
  )]
  pub listen: SocketAddr,

  #[clap(long, help = "listen addresses for the http api")]
  pub rpc: Vec<SocketAddr>,

  #[clap(
    long,
    help = "data directory for the durable store",
    default_value = "~/.weave"
  )]
  pub data_dir: String,

  #[clap(
    long,
    help = "storage engine",
    default_value = "memory",
    possible_values = ["memory", "disk"]
  )]
  pub store: String,

  #[clap(
    long,
    help = "heartbeat interval in milliseconds",
    default_value = "1000"
  )]
  pub heartbeat: u64,

  #[clap(
    long,
    help = "timeout for one gossip rpc in milliseconds",
    default_value = "1000"
  )]
  pub timeout: u64,

  #[clap(long, help = "graph and store cache sizes", default_value = "500")]
  pub cache_size: usize,

  #[clap(
    long,
    help = "max events a peer may lag before catch-up",
    default_value = "100"
  )]
  pub sync_limit: i64,

  #[clap(long, help = "rebuild consensus state from the local store")]
  pub bootstrap: bool,

  #[clap(long, help = "serve peers but never gossip first")]
  pub no_gossip: bool,

  #[clap(
    short,
    long,
    parse(from_occurrences),
    help = "Use verbose output (-vv very verbose output)"
  )]
  pub verbose: u64,
}

impl CliOpts {
  /// Loads the shared participant roster. The roster is sorted by
  /// public key so every node assigns identical participant ids.
  pub fn roster(&self) -> Result<Roster, std::io::Error> {
    Roster::load(&self.roster)
  }

  pub fn config(&self) -> node::Config {
    node::Config {
      heartbeat: Duration::from_millis(self.heartbeat),
      tcp_timeout: Duration::from_millis(self.timeout),
      cache_size: self.cache_size,
      sync_limit: self.sync_limit,
    }
  }

  /// The durable store directory with `~` and environment variables
  /// expanded.
  pub fn data_dir(&self) -> Result<PathBuf, std::io::Error> {
    let expanded = shellexpand::full(&self.data_dir).map_err(|e| {
      std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;
    Ok(PathBuf::from(expanded.into_owned()))
  }
}
