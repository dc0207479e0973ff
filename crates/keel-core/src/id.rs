use sha1::{Digest, Sha1};

/// Hash a raw step id into its canonical 40-character lowercase hex form.
///
/// This is the key used for memoization lookups and for the `id` field of
/// every outgoing op. Collision handling happens at the raw-id layer before
/// hashing; this function is pure.
pub fn hash_step_id(raw_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(raw_id.as_bytes());
    hex::encode(hasher.finalize())
}
