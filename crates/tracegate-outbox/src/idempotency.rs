//! Idempotency key construction: `<event_type>:<aggregate_id>:<suffix>`,
//! where `suffix` is either caller-supplied or the first 24 hex characters
//! of a SHA-256 digest over the canonicalized payload. Grounded in the
//! original `services/outbox.py`.

use sha2::{Digest, Sha256};

/// `serde_json::Map` is backed by a `BTreeMap` (the `preserve_order` feature
/// is not enabled anywhere in this workspace), so `to_string` already
/// serializes object keys in sorted order with no inserted whitespace.
pub fn hash24(payload: &serde_json::Value) -> String {
	let canonical = serde_json::to_string(payload).expect("JSON values always serialize");
	let digest = Sha256::digest(canonical.as_bytes());
	hex::encode(digest)[..24].to_string()
}

pub fn build_key(event_type: &str, aggregate_id: &str, suffix: Option<&str>, payload: &serde_json::Value) -> String {
	let suffix = suffix.map(str::to_string).unwrap_or_else(|| hash24(payload));
	format!("{event_type}:{aggregate_id}:{suffix}")
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn hash_is_stable_regardless_of_key_insertion_order() {
		let a = json!({"b": 1, "a": 2});
		let b = json!({"a": 2, "b": 1});
		assert_eq!(hash24(&a), hash24(&b));
		assert_eq!(hash24(&a).len(), 24);
	}

	#[test]
	fn explicit_suffix_wins_over_hash() {
		let key = build_key("UPSERT_USER", "conn-1", Some("rev-1:VPS_T"), &json!({}));
		assert_eq!(key, "UPSERT_USER:conn-1:rev-1:VPS_T");
	}
}
