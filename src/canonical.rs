//! Canonical hashing of scopes.
//!
//! Used to derive stable keys from scopes, such as database advisory lock keys.
//!
//! ## Determinism Guarantees
//!
//! - Fixed byte layout: tree id then user id, little-endian
//! - Fixed seed: keys are stable across processes and releases

use xxhash_rust::xxh64::xxh64;

use crate::types::Scope;

/// Seed of the scope hash. Changing it remaps every advisory lock.
const SCOPE_HASH_SEED: u64 = 0x736f_7361;

/// Canonical bytes of a scope.
pub fn to_canonical_bytes(scope: &Scope) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&scope.tree_id.0.to_le_bytes());
    bytes[4..].copy_from_slice(&scope.user_id.0.to_le_bytes());
    bytes
}

/// Compute canonical hash of a scope.
pub fn canonical_hash(scope: &Scope) -> u64 {
    xxh64(&to_canonical_bytes(scope), SCOPE_HASH_SEED)
}

/// Signed 64-bit key identifying a scope, suitable for database advisory locks.
pub fn scope_lock_key(scope: &Scope) -> i64 {
    i64::from_le_bytes(canonical_hash(scope).to_le_bytes())
}
