mod hexstr;
mod keys;

pub use {
  hexstr::{decode_hex, sha256, ToHexString},
  keys::{decode_signature, encode_signature, Keypair, KeypairError, Pubkey},
};
