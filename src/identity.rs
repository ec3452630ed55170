//! Content identities for unpacked layer chains.
//!
//! A chain ID names the filesystem produced by applying layers `0..=n` in
//! order. It is derived only from the uncompressed layer digests (diff IDs):
//!
//! ```text
//! chain(0) = diff(0)
//! chain(n) = sha256(chain(n-1) + " " + diff(n))
//! ```
//!
//! Snapshots are keyed by chain ID so identical layer stacks are unpacked
//! once regardless of which image they came from.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};

/// Identifier of an unpacked layer chain (`sha256:<hex>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(String);

impl ChainId {
    /// Computes the chain ID of the full diff ID sequence.
    pub fn from_diff_ids<S: AsRef<str>>(diff_ids: &[S]) -> Result<Self> {
        let mut chain = chain_ids(diff_ids)?;
        chain
            .pop()
            .ok_or_else(|| Error::Internal("cannot compute chain ID of an empty layer list".to_string()))
    }

    /// Wraps an already computed chain ID after validating its form.
    pub fn parse(value: &str) -> Result<Self> {
        validate_digest(value)?;
        Ok(Self(value.to_string()))
    }

    /// Returns the full `algo:hex` form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the hex part, safe for use as a file name.
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, hex)| hex).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the chain ID of every prefix of `diff_ids`.
///
/// Entry `i` names the filesystem after applying layers `0..=i`.
pub fn chain_ids<S: AsRef<str>>(diff_ids: &[S]) -> Result<Vec<ChainId>> {
    let mut chain: Vec<ChainId> = Vec::with_capacity(diff_ids.len());

    for diff_id in diff_ids {
        let diff_id = diff_id.as_ref();
        validate_digest(diff_id)?;

        let next = match chain.last() {
            None => diff_id.to_string(),
            Some(parent) => {
                let mut hasher = Sha256::new();
                hasher.update(parent.as_str().as_bytes());
                hasher.update(b" ");
                hasher.update(diff_id.as_bytes());
                format!("sha256:{}", hex::encode(hasher.finalize()))
            }
        };
        chain.push(ChainId(next));
    }

    Ok(chain)
}

/// Validates an `algo:hex` digest string.
fn validate_digest(digest: &str) -> Result<()> {
    let invalid = |reason: &str| Error::Internal(format!("invalid digest '{}': {}", digest, reason));

    let (algo, hex) = digest.split_once(':').ok_or_else(|| invalid("missing algorithm"))?;
    if !matches!(algo, "sha256" | "sha384" | "sha512") {
        return Err(invalid("unsupported algorithm"));
    }
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid("hash must be hexadecimal"));
    }
    Ok(())
}
