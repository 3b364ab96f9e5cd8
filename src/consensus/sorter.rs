use {
  super::{event::Event, round::RoundInfo, zero_timestamp},
  crate::primitives::decode_hex,
  primitive_types::U256,
  std::collections::HashMap,
};

/// Sorts freshly decided events into their consensus order:
///
/// 1. ascending round received,
/// 2. ties broken by consensus timestamp,
/// 3. remaining ties broken by XOR-ing each event's signature `r`
///    scalar with the deciding round's pseudo-random number and
///    comparing the results as unsigned big integers.
///
/// The whitening step strips any influence a creator could exert by
/// grinding signatures, since the round randomness is only fixed
/// once the witness set is.
pub fn sort_consensus_events(
  events: &mut [Event],
  rounds: &HashMap<i64, RoundInfo>,
) {
  let randomness: HashMap<i64, U256> = rounds
    .iter()
    .map(|(round, info)| (*round, info.pseudo_random_number()))
    .collect();

  events.sort_by(|a, b| {
    let arr = a.round_received.unwrap_or(-1);
    let brr = b.round_received.unwrap_or(-1);
    if arr != brr {
      return arr.cmp(&brr);
    }

    let at = a.consensus_timestamp.unwrap_or_else(zero_timestamp);
    let bt = b.consensus_timestamp.unwrap_or_else(zero_timestamp);
    if at != bt {
      return at.cmp(&bt);
    }

    let whitener = randomness.get(&arr).copied().unwrap_or_default();
    (signature_r(&a.signature) ^ whitener)
      .cmp(&(signature_r(&b.signature) ^ whitener))
  });
}

/// The `r` scalar of an `hex(r)|hex(s)` signature as an unsigned
/// 256-bit integer. Unsigned or malformed input sorts as zero.
fn signature_r(signature: &str) -> U256 {
  signature
    .split('|')
    .next()
    .and_then(|r| decode_hex(r).ok())
    .filter(|bytes| bytes.len() <= 32)
    .map(|bytes| U256::from_big_endian(&bytes))
    .unwrap_or_default()
}
