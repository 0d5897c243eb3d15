//! One-way digests used to compare secrets without persisting them.
//!
//! Both schemes are unsalted single-round hashes. That is weak against
//! offline guessing of short PINs, but changing it would orphan every hash
//! already persisted, so it is kept as-is.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DigestScheme {
    /// SHA-1 over the secret, compatible with hashes written by earlier
    /// releases.
    #[default]
    #[serde(rename = "sha1-legacy")]
    Sha1Legacy,

    #[serde(rename = "sha256")]
    Sha256,
}

impl DigestScheme {
    /// Hash `secret` into a lowercase hex string.
    pub fn digest(&self, secret: &str) -> String {
        match self {
            DigestScheme::Sha1Legacy => hex::encode(Sha1::digest(secret.as_bytes())),
            DigestScheme::Sha256 => hex::encode(Sha256::digest(secret.as_bytes())),
        }
    }

    /// Length of the hex string produced by [`digest`](Self::digest).
    pub fn hex_len(&self) -> usize {
        match self {
            DigestScheme::Sha1Legacy => 40,
            DigestScheme::Sha256 => 64,
        }
    }
}
