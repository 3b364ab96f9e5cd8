use sha2::{Digest, Sha256};

/// All identifiers that cross a node boundary (event hashes, public
/// keys) are rendered as `0x` followed by upper-case hex.
pub trait ToHexString {
  fn to_hex(&self) -> String;
}

impl ToHexString for [u8] {
  fn to_hex(&self) -> String {
    format!("0x{}", hex::encode_upper(self))
  }
}

impl ToHexString for Vec<u8> {
  fn to_hex(&self) -> String {
    self.as_slice().to_hex()
  }
}

/// Decodes a hex string, tolerating the `0x` prefix and either case.
pub fn decode_hex(value: &str) -> Result<Vec<u8>, hex::FromHexError> {
  hex::decode(value.strip_prefix("0x").unwrap_or(value))
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
  Sha256::digest(data).to_vec()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hex_roundtrip() {
    let bytes = vec![0xde, 0xad, 0xbe, 0xef];
    let hex = bytes.to_hex();
    assert_eq!(hex, "0xDEADBEEF");
    assert_eq!(decode_hex(&hex).unwrap(), bytes);
    assert_eq!(decode_hex("deadbeef").unwrap(), bytes);
  }

  #[test]
  fn sha256_known_vector() {
    assert_eq!(
      sha256(b"").to_hex(),
      "0xE3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855"
    );
  }
}
