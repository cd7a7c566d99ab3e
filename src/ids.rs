//! Deterministic content-derived identifiers.
//!
//! Task ids are a function of their defining fields, so re-creating the same
//! task yields the same id (and collides loudly instead of silently forking).
//! The id is the first five bytes of a SHA-256 over the parts joined with
//! `|`, hex-encoded: ten lowercase hex characters.

use sha2::{Digest, Sha256};

/// Number of leading hash bytes kept in an id (two hex chars each).
const ID_BYTES: usize = 5;

/// Derive a stable id from the given parts.
///
/// ```
/// use crucible::ids::derive_id;
///
/// let a = derive_id(&["Write parser", "implement", "developer"]);
/// let b = derive_id(&["Write parser", "implement", "developer"]);
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 10);
/// ```
pub fn derive_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    let digest = hasher.finalize();
    digest[..ID_BYTES]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// True if `id` has the shape produced by [`derive_id`].
pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_BYTES * 2 && id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase())
}
