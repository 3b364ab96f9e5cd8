use {
  serde::{Deserialize, Serialize},
  std::time::Duration,
};

/// Tunables of the gossip state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base interval between gossip rounds; actual ticks add random
  /// jitter of up to one extra interval to desynchronize the fleet.
  #[serde(with = "humantime_serde")]
  pub heartbeat: Duration,

  /// End-to-end budget for one outbound gossip RPC.
  #[serde(with = "humantime_serde")]
  pub tcp_timeout: Duration,

  /// Capacity of each of the graph's query caches and the store's
  /// session caches.
  pub cache_size: usize,

  /// A peer lagging more than this many events behind is redirected
  /// to catch-up instead of being served over regular gossip.
  pub sync_limit: i64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      heartbeat: Duration::from_millis(1000),
      tcp_timeout: Duration::from_millis(1000),
      cache_size: 500,
      sync_limit: 100,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn humane_durations_roundtrip() {
    let config = Config {
      heartbeat: Duration::from_millis(50),
      ..Config::default()
    };
    let json = serde_json::to_string(&config).unwrap();
    assert!(json.contains("50ms"));
    let parsed: Config = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.heartbeat, config.heartbeat);
  }

  #[test]
  fn missing_fields_take_defaults() {
    let parsed: Config = serde_json::from_str(r#"{"sync_limit": 5}"#).unwrap();
    assert_eq!(parsed.sync_limit, 5);
    assert_eq!(parsed.cache_size, Config::default().cache_size);
  }
}
