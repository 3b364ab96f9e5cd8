use {
  crate::primitives::hexstr::{decode_hex, ToHexString},
  k256::{
    ecdsa::{
      signature::{Signer, Verifier},
      Signature,
      SigningKey,
      VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
  },
  serde::{
    de::{self, Visitor},
    Deserialize,
    Deserializer,
    Serialize,
  },
  std::{
    fmt::{Debug, Display, Formatter},
    str::FromStr,
  },
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum KeypairError {
  #[error("failed parsing hex string: {0}")]
  HexParse(#[from] hex::FromHexError),

  #[error("{0}")]
  Ecdsa(#[from] k256::ecdsa::Error),

  #[error("malformed signature encoding")]
  MalformedSignature,
}

/// Identity of a participant on the secp256k1 curve.
///
/// Stored in its uncompressed SEC1 form (65 bytes) and rendered
/// as `0x` + upper-case hex everywhere it leaves the process. The
/// hex rendering is also what participant ids are derived from.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey(Vec<u8>);

impl Pubkey {
  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  /// Verifies an ECDSA signature over the SHA-256 digest of `message`.
  pub fn verify(
    &self,
    message: &[u8],
    signature: &Signature,
  ) -> Result<bool, KeypairError> {
    let key = VerifyingKey::from_sec1_bytes(&self.0)?;
    Ok(key.verify(message, signature).is_ok())
  }
}

impl Display for Pubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0.to_hex())
  }
}

impl Debug for Pubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Pubkey({})", self.0.to_hex())
  }
}

impl FromStr for Pubkey {
  type Err = KeypairError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let bytes = decode_hex(s)?;
    // reject anything that is not a valid curve point
    VerifyingKey::from_sec1_bytes(&bytes)?;
    Ok(Self(bytes))
  }
}

impl From<&VerifyingKey> for Pubkey {
  fn from(key: &VerifyingKey) -> Self {
    Self(key.to_encoded_point(false).as_bytes().to_vec())
  }
}

impl Serialize for Pubkey {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_str(&self.0.to_hex())
  }
}

impl<'de> Deserialize<'de> for Pubkey {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    struct HexVisitor;

    impl Visitor<'_> for HexVisitor {
      type Value = Pubkey;

      fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("hex encoded uncompressed secp256k1 point")
      }

      fn visit_str<E>(self, value: &str) -> Result<Pubkey, E>
      where
        E: de::Error,
      {
        value.parse().map_err(|e| de::Error::custom(format!("{e:?}")))
      }
    }

    deserializer.deserialize_str(HexVisitor)
  }
}

/// A participant's signing identity.
///
/// Signing is deterministic (RFC 6979) over the SHA-256 digest of the
/// message, so re-signing the same bytes always produces the same
/// signature.
pub struct Keypair(SigningKey);

impl Keypair {
  pub fn public(&self) -> Pubkey {
    (self.0.verifying_key()).into()
  }

  pub fn sign(&self, message: &[u8]) -> Signature {
    self.0.sign(message)
  }
}

impl Clone for Keypair {
  fn clone(&self) -> Self {
    Self(self.0.clone())
  }
}

impl Debug for Keypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Keypair").field(&self.public()).finish()
  }
}

impl Display for Keypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Keypair({})", self.public())
  }
}

impl TryFrom<&[u8]> for Keypair {
  type Error = KeypairError;

  fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
    Ok(Self(SigningKey::from_slice(value)?))
  }
}

impl FromStr for Keypair {
  type Err = KeypairError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    let secret = decode_hex(value)?;
    Keypair::try_from(secret.as_slice())
  }
}

/// Signatures travel as `hex(r)|hex(s)`. Splitting the halves keeps
/// the `r` scalar directly addressable for the consensus tie-break.
pub fn encode_signature(signature: &Signature) -> String {
  let (r, s) = signature.split_bytes();
  format!("{}|{}", hex::encode(r), hex::encode(s))
}

pub fn decode_signature(encoded: &str) -> Result<Signature, KeypairError> {
  let (r, s) = encoded
    .split_once('|')
    .ok_or(KeypairError::MalformedSignature)?;
  let r: [u8; 32] = decode_hex(r)?
    .try_into()
    .map_err(|_| KeypairError::MalformedSignature)?;
  let s: [u8; 32] = decode_hex(s)?
    .try_into()
    .map_err(|_| KeypairError::MalformedSignature)?;
  Ok(Signature::from_scalars(r, s)?)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn keypair() -> Keypair {
    Keypair::try_from([7u8; 32].as_slice()).unwrap()
  }

  #[test]
  fn sign_verify_roundtrip() {
    let keypair = keypair();
    let signature = keypair.sign(b"some message");
    assert!(keypair.public().verify(b"some message", &signature).unwrap());
    assert!(!keypair.public().verify(b"another message", &signature).unwrap());
  }

  #[test]
  fn signature_codec_roundtrip() {
    let keypair = keypair();
    let signature = keypair.sign(b"payload");
    let encoded = encode_signature(&signature);
    assert!(encoded.contains('|'));
    assert_eq!(decode_signature(&encoded).unwrap(), signature);
  }

  #[test]
  fn pubkey_hex_roundtrip() {
    let public = keypair().public();
    let hex = public.to_string();
    assert!(hex.starts_with("0x"));
    let parsed: Pubkey = hex.parse().unwrap();
    assert_eq!(parsed, public);
  }

  #[test]
  fn deterministic_signatures() {
    let (a, b) = (keypair().sign(b"x"), keypair().sign(b"x"));
    assert_eq!(a, b);
  }
}
